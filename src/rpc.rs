use crate::acceptor::{
    AcceptRequest, AcceptResponse, ChooseRequest, ChooseResponse, PrepareRequest, PrepareResponse,
    ACCEPT_ENDPOINT, CHOOSE_ENDPOINT, PREPARE_ENDPOINT,
};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::{net::SocketAddr, time::Duration};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub type HttpClient = Client<HttpConnector, Full<Bytes>>;

// A per-call stateful producer of the Fibonacci sequence: 1, 1, 2, 3, 5, 8,
// ... Recreated per `SendPrepare`/`SendAccept` invocation and reset to the
// start of the sequence on the first successful connection.
pub struct Fibonacci {
    previous: u64,
    current: u64,
}

impl Fibonacci {
    pub fn new() -> Self {
        Fibonacci {
            previous: 0,
            current: 1,
        }
    }

    pub fn next(&mut self) -> u64 {
        let value = self.current;
        let sum = self.previous + self.current;
        self.previous = self.current;
        self.current = sum;
        value
    }
}

impl Default for Fibonacci {
    fn default() -> Self {
        Self::new()
    }
}

// Errors that can arise from a peer handle call. Dial failures are retried
// internally with Fibonacci backoff and never surface as a `SendError`;
// these are the two kinds that do.
#[derive(Debug)]
pub enum SendError {
    Cancelled,
    Call(TransportError),
}

// Distinguishes a failure to establish the connection (retried with
// Fibonacci backoff) from a failure after the connection succeeded (surfaced
// to the caller immediately).
#[derive(Debug)]
pub enum TransportError {
    Connect(hyper_util::client::legacy::Error),
    Body(hyper::Error),
}

impl TransportError {
    fn is_connect(&self) -> bool {
        matches!(self, TransportError::Connect(error) if error.is_connect())
    }
}

// A handle to one peer acceptor, encapsulating the dial/retry backoff
// described in spec.md 4.3. [tag:peer_handle]
pub struct PeerHandle {
    address: SocketAddr,
    client: HttpClient,
}

impl PeerHandle {
    pub fn new(address: SocketAddr, client: HttpClient) -> Self {
        PeerHandle { address, client }
    }

    pub fn name(&self) -> String {
        self.address.to_string()
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub async fn send_prepare(
        &self,
        request: &PrepareRequest,
        cancel: &CancellationToken,
    ) -> Result<PrepareResponse, SendError> {
        self.call(PREPARE_ENDPOINT, request, cancel).await
    }

    pub async fn send_accept(
        &self,
        request: &AcceptRequest,
        cancel: &CancellationToken,
    ) -> Result<AcceptResponse, SendError> {
        self.call(ACCEPT_ENDPOINT, request, cancel).await
    }

    pub async fn send_choose(
        &self,
        request: &ChooseRequest,
        cancel: &CancellationToken,
    ) -> Result<ChooseResponse, SendError> {
        self.call(CHOOSE_ENDPOINT, request, cancel).await
    }

    // Dial (through the pooled client) and retry with Fibonacci backoff until
    // a connection succeeds, indefinitely. Once a single request/response
    // round completes, any response-level error is returned to the caller
    // without further retries, and the backoff generator is discarded.
    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        endpoint: &str,
        payload: &Req,
        cancel: &CancellationToken,
    ) -> Result<Resp, SendError> {
        let mut backoff = Fibonacci::new();

        loop {
            if cancel.is_cancelled() {
                return Err(SendError::Cancelled);
            }

            let attempt = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(SendError::Cancelled),
                result = try_send(&self.client, self.address, endpoint, payload) => result,
            };

            match attempt {
                Ok(bytes) => {
                    return Ok(bincode::deserialize(&bytes).unwrap()); // Safe under non-Byzantine conditions.
                }
                Err(error) if error.is_connect() => {
                    let wait = Duration::from_millis(backoff.next());
                    debug!("Failed to dial {}. Retrying in {:?}.", self.address, wait);
                    tokio::select! {
                        () = cancel.cancelled() => return Err(SendError::Cancelled),
                        () = sleep(wait) => {}
                    }
                }
                Err(error) => {
                    return Err(SendError::Call(error));
                }
            }
        }
    }
}

async fn try_send(
    client: &HttpClient,
    node: SocketAddr,
    endpoint: &str,
    payload: &impl Serialize,
) -> Result<Bytes, TransportError> {
    let uri: hyper::Uri = format!("http://{node}{endpoint}").parse().unwrap(); // Safe: node/endpoint are well-formed.

    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        // The `unwrap` is safe because serialization should never fail.
        .body(Full::new(Bytes::from(bincode::serialize(payload).unwrap())))
        .unwrap(); // Safe since we constructed a well-formed request.

    let response = client
        .request(request)
        .await
        .map_err(TransportError::Connect)?;

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(TransportError::Body)?
        .to_bytes();

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::Fibonacci;

    #[test]
    fn fibonacci_matches_classic_sequence() {
        let mut fib = Fibonacci::new();
        let sequence: Vec<u64> = (0..8).map(|_| fib.next()).collect();
        assert_eq!(sequence, vec![1, 1, 2, 3, 5, 8, 13, 21]);
    }

    #[test]
    fn fresh_generator_restarts_from_one() {
        let mut fib = Fibonacci::new();
        fib.next();
        fib.next();
        fib.next();

        let restarted = Fibonacci::new();
        assert_eq!(restarted.current, 1);
        assert_eq!(restarted.previous, 0);
    }
}
