use crate::{
    proposal::ProposalNumber,
    state::{KeyState, State},
};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    body::Incoming, server::conn::http1, service::service_fn, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, io, net::SocketAddr, path::Path, sync::Arc};
use tokio::{net::TcpListener, sync::RwLock};

// Endpoints
pub const PREPARE_ENDPOINT: &str = "/prepare";
pub const ACCEPT_ENDPOINT: &str = "/accept";
pub const CHOOSE_ENDPOINT: &str = "/choose";

// The rejections an acceptor can report. None of them mutate state; they are
// diagnostic signals for the caller, not faults in the acceptor itself.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum AcceptorError {
    AlreadyPromisedHigherOrEqual(ProposalNumber),
    AlreadyPromisedHigher(ProposalNumber),
    UnexpectedProposal,
}

// BEGIN PREPARE

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PrepareRequest {
    pub key: Vec<u8>,
    pub number: ProposalNumber,
}

// Carries the acceptor's last accepted proposal for this key, if any, so the
// proposer can adopt the highest-numbered previously accepted value in Phase
// 2. [tag:promise_carries_accepted]
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Promise {
    pub number: ProposalNumber,
    pub accepted: Option<(ProposalNumber, Vec<u8>)>,
}

pub type PrepareResponse = Result<Promise, AcceptorError>;

// If an acceptor receives a Prepare with a number greater than any it has
// already promised for this key, it promises not to accept lower-numbered
// proposals and returns the highest-numbered proposal it has accepted, if
// any. [ref:promise_carries_accepted]
pub fn prepare(state: &mut State, request: &PrepareRequest) -> PrepareResponse {
    let entry = state.keys.entry(request.key.clone()).or_default();

    if let Some(promised) = entry.promised {
        if promised >= request.number {
            return Err(AcceptorError::AlreadyPromisedHigherOrEqual(promised));
        }
    }

    entry.promised = Some(request.number);

    Ok(Promise {
        number: request.number,
        accepted: entry.accepted.clone(),
    })
}

// END PREPARE

// BEGIN ACCEPT

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AcceptRequest {
    pub key: Vec<u8>,
    pub number: ProposalNumber,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Accepted {
    pub number: ProposalNumber,
}

pub type AcceptResponse = Result<Accepted, AcceptorError>;

// An acceptor accepts a proposal unless it has already promised a strictly
// higher number, and rejects (without mutating state) an Accept for a number
// it never promised in the first place.
pub fn accept(state: &mut State, request: &AcceptRequest) -> AcceptResponse {
    let entry = state.keys.entry(request.key.clone()).or_default();

    if let Some(promised) = entry.promised {
        match request.number.cmp(&promised) {
            std::cmp::Ordering::Less => {
                return Err(AcceptorError::AlreadyPromisedHigher(promised));
            }
            std::cmp::Ordering::Greater => {
                return Err(AcceptorError::UnexpectedProposal);
            }
            std::cmp::Ordering::Equal => {}
        }
    }

    entry.promised = Some(request.number);
    entry.accepted = Some((request.number, request.value.clone()));

    Ok(Accepted {
        number: request.number,
    })
}

// END ACCEPT

// BEGIN CHOOSE

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChooseRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChooseResponse;

// The learner side of the core: once a majority has accepted a value, every
// node is told so it can log the decision locally. Broader dissemination
// (catch-up, gossip) is out of scope.
pub fn choose(request: &ChooseRequest, key_state: &KeyState) -> ChooseResponse {
    if let Some((_, value)) = &key_state.accepted {
        if value == &request.value {
            info!(
                "Consensus achieved for key `{}`: {}",
                String::from_utf8_lossy(&request.key),
                String::from_utf8_lossy(&request.value),
            );
        }
    }
    ChooseResponse
}

// END CHOOSE

async fn body_to_bytes(req: Request<Incoming>) -> Result<Bytes, hyper::Error> {
    Ok(req.collect().await?.to_bytes())
}

fn respond(status: StatusCode, payload: Vec<u8>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(payload)))
        .unwrap() // Safe since we constructed a well-formed response.
}

async fn dispatch(
    req: Request<Incoming>,
    state: Arc<RwLock<State>>,
    data_file_path: Arc<Path>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_owned();

    let body = match body_to_bytes(req).await {
        Ok(body) => body,
        Err(error) => {
            warn!("Failed to read request body: {}", error);
            return Ok(respond(StatusCode::BAD_REQUEST, Vec::new()));
        }
    };

    let response_payload = match path.as_str() {
        PREPARE_ENDPOINT => match bincode::deserialize::<PrepareRequest>(&body) {
            Ok(request) => {
                // Mutate under the lock only; the lock never guards I/O
                // (spec.md 5: "Acceptor operations never suspend").
                let (response, persisted) = {
                    let mut guard = state.write().await;
                    let response = prepare(&mut guard, &request);
                    (response, guard.clone())
                };
                if let Err(error) = crate::state::write(&persisted, &data_file_path).await {
                    error!("Failed to persist state: {}", error);
                }
                bincode::serialize(&response).unwrap()
            }
            Err(error) => {
                warn!("Malformed prepare request: {}", error);
                return Ok(respond(StatusCode::BAD_REQUEST, Vec::new()));
            }
        },
        ACCEPT_ENDPOINT => match bincode::deserialize::<AcceptRequest>(&body) {
            Ok(request) => {
                let (response, persisted) = {
                    let mut guard = state.write().await;
                    let response = accept(&mut guard, &request);
                    (response, guard.clone())
                };
                if let Err(error) = crate::state::write(&persisted, &data_file_path).await {
                    error!("Failed to persist state: {}", error);
                }
                bincode::serialize(&response).unwrap()
            }
            Err(error) => {
                warn!("Malformed accept request: {}", error);
                return Ok(respond(StatusCode::BAD_REQUEST, Vec::new()));
            }
        },
        CHOOSE_ENDPOINT => match bincode::deserialize::<ChooseRequest>(&body) {
            Ok(request) => {
                let guard = state.read().await;
                let key_state = guard.keys.get(&request.key).cloned().unwrap_or_default();
                let response = choose(&request, &key_state);
                bincode::serialize(&response).unwrap()
            }
            Err(error) => {
                warn!("Malformed choose request: {}", error);
                return Ok(respond(StatusCode::BAD_REQUEST, Vec::new()));
            }
        },
        _ => {
            return Ok(respond(StatusCode::NOT_FOUND, Vec::new()));
        }
    };

    Ok(respond(StatusCode::OK, response_payload))
}

// Bind the acceptor's transport server and serve Prepare/Accept/Choose
// requests until the process is killed. Each connection is handled on its
// own task; the acceptor's per-key state sits behind a single `RwLock`, so
// the effects of concurrent requests are serialized there rather than by the
// transport layer.
pub async fn acceptor(
    state: Arc<RwLock<State>>,
    data_file_path: &Path,
    address: SocketAddr,
) -> io::Result<()> {
    let listener = TcpListener::bind(address).await?;
    let data_file_path: Arc<Path> = Arc::from(data_file_path);

    info!("Acceptor listening on {}", address);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();
        let data_file_path = data_file_path.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                dispatch(req, state.clone(), data_file_path.clone())
            });

            if let Err(error) = http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                warn!("Connection error: {}", error);
            }
        });
    }
}
