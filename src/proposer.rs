use crate::{
    acceptor::{AcceptRequest, ChooseRequest, PrepareRequest},
    proposal::ProposalNumber,
    rpc::{HttpClient, PeerHandle, SendError},
    state::State,
};
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use std::{collections::HashMap, net::SocketAddr, path::Path, sync::Arc, time::Duration};
use tokio::{sync::RwLock, time::sleep};
use tokio_util::sync::CancellationToken;

// Duration constants for the jittered delay between failed Phase 2 attempts.
const RESTART_DELAY_MIN: Duration = Duration::from_millis(0);
const RESTART_DELAY_MAX: Duration = Duration::from_millis(100);

#[derive(Debug, Eq, PartialEq)]
pub enum ProposeError {
    Cancelled,
    NoPeers,
    RoundFailed,
}

impl std::fmt::Display for ProposeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProposeError::Cancelled => write!(f, "the propose call was cancelled"),
            ProposeError::NoPeers => write!(f, "no peers were configured to propose to"),
            ProposeError::RoundFailed => write!(f, "a proposal round failed to reach majority"),
        }
    }
}

// The only error a peer call can report to the aggregation loop once it is
// no longer retrying dials: a real rejection from the acceptor, or this
// proposer's own cancellation.
enum PeerOutcome<T> {
    Value(T),
    Rejected,
    Cancelled,
}

async fn call_peer<T, F>(peer: &PeerHandle, cancel: &CancellationToken, f: F) -> PeerOutcome<T>
where
    F: std::future::Future<Output = Result<Result<T, crate::acceptor::AcceptorError>, SendError>>,
{
    match f.await {
        Ok(Ok(value)) => PeerOutcome::Value(value),
        Ok(Err(error)) => {
            debug!("{} rejected the request: {:?}", peer.name(), error);
            PeerOutcome::Rejected
        }
        Err(SendError::Cancelled) => PeerOutcome::Cancelled,
        Err(SendError::Call(error)) => {
            debug!("{} returned a transport error: {:?}", peer.name(), error);
            PeerOutcome::Rejected
        }
    }
}

fn majority(count: usize) -> usize {
    count / 2 + 1
}

// Generate this node's next proposal number and persist the advanced round
// counter so a restart never reuses a number.
async fn next_proposal_number(
    state: &Arc<RwLock<State>>,
    data_file_path: &Path,
    self_address: SocketAddr,
    floor_round: u64,
) -> ProposalNumber {
    // Mutate under the lock only, then drop the guard before the fsync below
    // so this doesn't block the acceptor's own Prepare/Accept dispatch, which
    // shares this same `Arc<RwLock<State>>`.
    let (number, persisted) = {
        let mut guard = state.write().await;
        if guard.next_round <= floor_round {
            guard.next_round = floor_round + 1;
        }
        let number = ProposalNumber::for_node(guard.next_round, self_address);
        guard.next_round += 1;
        (number, guard.clone())
    };

    if let Err(error) = crate::state::write(&persisted, data_file_path).await {
        error!("Failed to persist state: {}", error);
    }

    number
}

// Phase 1: fan out Prepare to every peer (per spec.md 9, not just a
// majority-sized prefix) and aggregate Promises until a majority agrees on
// the same proposal number, adopting any higher number or previously
// accepted value discovered along the way.
async fn phase1(
    peers: &[PeerHandle],
    key: &[u8],
    mut number: ProposalNumber,
    cancel: &CancellationToken,
) -> Result<(ProposalNumber, Option<(ProposalNumber, Vec<u8>)>), ProposeError> {
    let needed = majority(peers.len());

    let mut promises: HashMap<SocketAddr, ProposalNumber> = HashMap::new();
    let mut best_accepted: Option<(ProposalNumber, Vec<u8>)> = None;

    let mut pending: FuturesUnordered<_> = peers
        .iter()
        .map(|peer| {
            let request = PrepareRequest {
                key: key.to_vec(),
                number,
            };
            async move {
                let outcome = call_peer(peer, cancel, peer.send_prepare(&request, cancel)).await;
                (peer.address(), outcome)
            }
        })
        .collect();

    while let Some((address, outcome)) = pending.next().await {
        match outcome {
            PeerOutcome::Cancelled => return Err(ProposeError::Cancelled),
            PeerOutcome::Rejected => continue,
            PeerOutcome::Value(promise) => {
                if let Some(prev) = promises.get(&address) {
                    if *prev >= promise.number {
                        continue;
                    }
                }
                promises.insert(address, promise.number);

                if promise.number > number {
                    number = promise.number;
                }

                if let Some((accepted_number, accepted_value)) = promise.accepted {
                    let adopt = best_accepted
                        .as_ref()
                        .is_none_or(|(current, _)| accepted_number > *current);
                    if adopt {
                        best_accepted = Some((accepted_number, accepted_value));
                    }
                }

                let matches = promises.values().filter(|n| **n == number).count();
                if matches >= needed {
                    return Ok((number, best_accepted));
                }
            }
        }
    }

    // The stream is exhausted (every peer gave a definitive answer, none
    // still dialing) and no majority was reached with this number.
    Err(ProposeError::RoundFailed)
}

// Phase 2: send Accept to every peer and wait for a majority to agree on the
// same proposal number.
async fn phase2(
    peers: &[PeerHandle],
    key: &[u8],
    number: ProposalNumber,
    value: &[u8],
    cancel: &CancellationToken,
) -> Result<bool, ProposeError> {
    let needed = majority(peers.len());

    let mut pending: FuturesUnordered<_> = peers
        .iter()
        .map(|peer| {
            let request = AcceptRequest {
                key: key.to_vec(),
                number,
                value: value.to_vec(),
            };
            async move { call_peer(peer, cancel, peer.send_accept(&request, cancel)).await }
        })
        .collect();

    // Drain every peer's Accept to completion (spec.md 4.2 step 3: "Return
    // success once the fan-out has completed"), rather than returning as soon
    // as a majority is seen, which would drop slower-but-reachable peers'
    // in-flight Accepts.
    let mut matches = 0;
    while let Some(outcome) = pending.next().await {
        match outcome {
            PeerOutcome::Cancelled => return Err(ProposeError::Cancelled),
            PeerOutcome::Rejected => {}
            PeerOutcome::Value(accepted) => {
                if accepted.number == number {
                    matches += 1;
                }
            }
        }
    }

    Ok(matches >= needed)
}

// Notify every peer that consensus was reached, so each agent's learner role
// can record the decision. This is the per-key majority-accept step; broader
// learner dissemination is out of scope.
async fn notify_chosen(peers: &[PeerHandle], key: &[u8], value: &[u8], cancel: &CancellationToken) {
    let requests: FuturesUnordered<_> = peers
        .iter()
        .map(|peer| {
            let request = ChooseRequest {
                key: key.to_vec(),
                value: value.to_vec(),
            };
            async move {
                let _ = peer.send_choose(&request, cancel).await;
            }
        })
        .collect();
    requests.collect::<Vec<()>>().await;
}

// Run Paxos to completion for one (key, value) pair, retrying with a new
// proposal number whenever a round fails to reach majority, until a value is
// chosen or the caller cancels.
pub async fn propose(
    state: Arc<RwLock<State>>,
    data_file_path: &Path,
    client: HttpClient,
    nodes: &[SocketAddr],
    node_index: usize,
    key: &[u8],
    value: &[u8],
    cancel: CancellationToken,
) -> Result<(), ProposeError> {
    if nodes.is_empty() {
        return Err(ProposeError::NoPeers);
    }

    let self_address = nodes[node_index];
    let peers: Vec<PeerHandle> = nodes
        .iter()
        .map(|&address| PeerHandle::new(address, client.clone()))
        .collect();

    let mut floor_round = 0;
    let mut own_value = value.to_vec();

    loop {
        if cancel.is_cancelled() {
            return Err(ProposeError::Cancelled);
        }

        let number = next_proposal_number(&state, data_file_path, self_address, floor_round).await;

        info!(
            "Preparing key `{}` with proposal number {:?}",
            String::from_utf8_lossy(key),
            number
        );

        let (winning_number, best_accepted) = match phase1(&peers, key, number, &cancel).await {
            Ok(result) => result,
            Err(ProposeError::Cancelled) => return Err(ProposeError::Cancelled),
            Err(ProposeError::RoundFailed | ProposeError::NoPeers) => {
                floor_round = number.round;
                continue;
            }
        };

        let value_for_accept = best_accepted
            .as_ref()
            .map_or_else(|| own_value.clone(), |(_, value)| value.clone());

        info!(
            "Requesting acceptance of key `{}` with proposal number {:?}",
            String::from_utf8_lossy(key),
            winning_number
        );

        match phase2(&peers, key, winning_number, &value_for_accept, &cancel).await {
            Ok(true) => {
                info!("Consensus achieved. Notifying peers.");
                notify_chosen(&peers, key, &value_for_accept, &cancel).await;
                return Ok(());
            }
            Ok(false) => {
                info!("Failed to reach consensus. Starting over.");
                floor_round = winning_number.round;
                own_value = value.to_vec();
                let jitter = rand::rng().random_range(RESTART_DELAY_MIN..=RESTART_DELAY_MAX);
                tokio::select! {
                    () = cancel.cancelled() => return Err(ProposeError::Cancelled),
                    () = sleep(jitter) => {}
                }
            }
            Err(ProposeError::Cancelled) => return Err(ProposeError::Cancelled),
            Err(ProposeError::NoPeers | ProposeError::RoundFailed) => {
                unreachable!("phase2 only ever reports Cancelled")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{majority, next_proposal_number};
    use crate::state::initial;
    use std::{
        net::{Ipv4Addr, SocketAddr, SocketAddrV4},
        sync::Arc,
    };
    use tokio::sync::RwLock;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port))
    }

    #[test]
    fn majority_of_odd_cluster() {
        assert_eq!(majority(3), 2);
        assert_eq!(majority(5), 3);
    }

    #[test]
    fn majority_of_even_cluster() {
        assert_eq!(majority(4), 3);
    }

    #[test]
    fn majority_of_single_node() {
        assert_eq!(majority(1), 1);
    }

    #[tokio::test]
    async fn proposal_numbers_strictly_increase() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        let state = Arc::new(RwLock::new(initial()));

        let first = next_proposal_number(&state, &path, addr(3000), 0).await;
        let second = next_proposal_number(&state, &path, addr(3000), 0).await;
        assert!(second > first);
    }

    #[tokio::test]
    async fn proposal_numbers_respect_floor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        let state = Arc::new(RwLock::new(initial()));

        let number = next_proposal_number(&state, &path, addr(3000), 41).await;
        assert!(number.round > 41);
    }
}
