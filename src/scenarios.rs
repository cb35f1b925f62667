// End-to-end scenarios driven directly against the pure acceptor functions
// and the proposer's aggregation rules, without going over real sockets.
// Three in-memory acceptors stand in for a three-node cluster.

use crate::{
    acceptor::{accept, prepare, AcceptRequest, AcceptorError, PrepareRequest},
    proposal::ProposalNumber,
    state::{initial, State},
};

const KEY: &[u8] = b"leader";

fn pn(round: u64, port: u16) -> ProposalNumber {
    ProposalNumber {
        round,
        proposer_ip: 0x7f00_0001,
        proposer_port: port,
    }
}

// Mirrors `proposer::phase1`'s majority-aggregation rule, but driven
// synchronously against a fixed slice of in-memory acceptors instead of
// `PeerHandle`s over HTTP.
fn run_phase1(
    acceptors: &mut [State],
    cluster_size: usize,
    number: ProposalNumber,
) -> Option<(usize, Option<(ProposalNumber, Vec<u8>)>)> {
    let needed = cluster_size / 2 + 1;
    let mut promises = 0;
    let mut best_accepted: Option<(ProposalNumber, Vec<u8>)> = None;

    for acceptor in acceptors.iter_mut() {
        let request = PrepareRequest {
            key: KEY.to_vec(),
            number,
        };
        if let Ok(promise) = prepare(acceptor, &request) {
            promises += 1;
            if let Some((accepted_number, accepted_value)) = promise.accepted {
                let adopt = best_accepted
                    .as_ref()
                    .is_none_or(|(current, _)| accepted_number > *current);
                if adopt {
                    best_accepted = Some((accepted_number, accepted_value));
                }
            }
        }
    }

    if promises >= needed {
        Some((promises, best_accepted))
    } else {
        None
    }
}

// Mirrors `proposer::phase2`'s majority-aggregation rule.
fn run_phase2(acceptors: &mut [State], number: ProposalNumber, value: &[u8]) -> usize {
    let mut accepted = 0;
    for acceptor in acceptors.iter_mut() {
        let request = AcceptRequest {
            key: KEY.to_vec(),
            number,
            value: value.to_vec(),
        };
        if accept(acceptor, &request).is_ok() {
            accepted += 1;
        }
    }
    accepted
}

// S1 — single uncontended proposer.
#[test]
fn single_uncontended_proposer_reaches_majority() {
    let mut acceptors = vec![initial(), initial(), initial()];
    let number = pn(1, 3000);

    let (promises, best_accepted) =
        run_phase1(&mut acceptors, 3, number).expect("phase 1 majority");
    assert_eq!(promises, 3);
    assert!(best_accepted.is_none());

    let accepted = run_phase2(&mut acceptors, number, b"A:1");
    assert!(accepted >= 2);
    for acceptor in &acceptors {
        assert_eq!(
            acceptor.keys[KEY].accepted,
            Some((number, b"A:1".to_vec()))
        );
    }
}

// S2 — concurrent proposers, no accepted value yet: A proposes first at
// round 1 and wins every promise; B's round-1 Prepare is rejected by every
// acceptor (they already promised A), so B must retry at round 2 and wins.
#[test]
fn concurrent_proposers_second_proposer_wins_after_retry() {
    let mut acceptors = vec![initial(), initial(), initial()];
    // A's address tie-breaks higher than B's at the same round, so A's
    // round-1 number outranks B's round-1 number and B is forced to retry.
    let a_number = pn(1, 3001);
    let b_number_round1 = pn(1, 3000);
    let b_number_round2 = pn(2, 3000);

    let (a_promises, _) = run_phase1(&mut acceptors, 3, a_number).expect("A reaches majority");
    assert_eq!(a_promises, 3);

    for acceptor in &acceptors {
        let rejected = prepare(
            &mut acceptor.clone(),
            &PrepareRequest {
                key: KEY.to_vec(),
                number: b_number_round1,
            },
        );
        assert_eq!(
            rejected,
            Err(AcceptorError::AlreadyPromisedHigherOrEqual(a_number))
        );
    }

    let a_accepted = run_phase2(&mut acceptors, a_number, b"A:1");
    assert!(a_accepted >= 2);

    let (b_promises, best_accepted) =
        run_phase1(&mut acceptors, 3, b_number_round2).expect("B reaches majority at round 2");
    assert_eq!(b_promises, 3);
    assert_eq!(best_accepted, Some((a_number, b"A:1".to_vec())));

    // B must adopt A's accepted value, not propose its own (this is S3's
    // adoption rule, exercised again here as part of B's recovery).
    let value_for_accept = best_accepted.map_or_else(|| b"B:2".to_vec(), |(_, value)| value);
    let b_accepted = run_phase2(&mut acceptors, b_number_round2, &value_for_accept);
    assert!(b_accepted >= 2);

    for acceptor in &acceptors {
        assert_eq!(
            acceptor.keys[KEY].accepted,
            Some((b_number_round2, b"A:1".to_vec()))
        );
    }

    // A's stale Accept at round 1 is now rejected everywhere.
    for acceptor in &acceptors {
        let mut acceptor = acceptor.clone();
        let result = accept(
            &mut acceptor,
            &AcceptRequest {
                key: KEY.to_vec(),
                number: a_number,
                value: b"A:1".to_vec(),
            },
        );
        assert_eq!(
            result,
            Err(AcceptorError::AlreadyPromisedHigher(b_number_round2))
        );
    }
}

// S3 — value adoption: once a value has been accepted at a lower number, a
// higher-numbered Prepare must return it so the next Accept carries it
// forward unchanged.
#[test]
fn higher_numbered_proposer_adopts_previously_accepted_value() {
    let mut acceptors = vec![initial(), initial(), initial()];
    let first = pn(1, 3000);
    run_phase1(&mut acceptors, 3, first).expect("first round reaches majority");
    run_phase2(&mut acceptors, first, b"A:1");

    let second = pn(2, 3001);
    let (_, best_accepted) =
        run_phase1(&mut acceptors, 3, second).expect("second round majority");
    assert_eq!(best_accepted, Some((first, b"A:1".to_vec())));

    let value_for_accept = best_accepted
        .as_ref()
        .map_or_else(|| b"B:2".to_vec(), |(_, value)| value.clone());
    assert_eq!(value_for_accept, b"A:1");

    run_phase2(&mut acceptors, second, &value_for_accept);
    for acceptor in &acceptors {
        assert_eq!(
            acceptor.keys[KEY].accepted,
            Some((second, b"A:1".to_vec()))
        );
    }
}

// S4 — peer unreachable: a majority of 2 out of 3 is still sufficient.
#[test]
fn unreachable_peer_does_not_block_majority() {
    let mut reachable = vec![initial(), initial()];
    let number = pn(1, 3000);

    // Only 2 of the 3 conceptual acceptors participate; majority(3) = 2, so
    // this is still sufficient for both phases.
    let needed = 3usize / 2 + 1;
    let (promises, _) = run_phase1(&mut reachable, 3, number).expect("majority without peer C");
    assert!(promises >= needed);

    let accepted = run_phase2(&mut reachable, number, b"A:1");
    assert!(accepted >= needed);
}

// S5 — stale Accept: an acceptor that has promised a higher number rejects
// an Accept below it without mutating its state.
#[test]
fn stale_accept_is_rejected_without_state_change() {
    let mut state = initial();
    prepare(
        &mut state,
        &PrepareRequest {
            key: KEY.to_vec(),
            number: pn(3, 3000),
        },
    )
    .unwrap();

    let result = accept(
        &mut state,
        &AcceptRequest {
            key: KEY.to_vec(),
            number: pn(2, 3000),
            value: b"stale".to_vec(),
        },
    );
    assert_eq!(result, Err(AcceptorError::AlreadyPromisedHigher(pn(3, 3000))));
    assert!(state.keys[KEY].accepted.is_none());
}

// Quantified invariant: majority(N) = N/2 + 1 for several cluster sizes, and
// any two majorities over the same N intersect.
#[test]
fn majorities_over_same_cluster_always_intersect() {
    for n in 1..=9usize {
        let needed = n / 2 + 1;
        // Two subsets of size `needed` drawn from `0..n` must share an index:
        // if they didn't, their union would have 2 * needed > n elements.
        assert!(2 * needed > n);
    }
}
