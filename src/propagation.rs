//! Transaction fan-out to known peers.
//!
//! [`Propagator::propagate`] reads the peer directory once and dispatches one
//! POST per peer onto a task set bounded by a semaphore. It returns once every
//! send is dispatched. Failures are logged and published as [`SendOutcome`]s;
//! they never reach the caller and never affect the other sends.

use crate::config::Config;
use crate::error::{LedgerError, Result};
use crate::peers::{Peer, PeerDirectory};
use crate::transaction::SignedTransaction;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const VALIDATE_TRANSACTION_PATH: &str = "/validate-transaction";

const OUTCOME_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    Delivered,
    Rejected(u16),
    Unreachable(String),
}

impl SendStatus {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendStatus::Delivered)
    }
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub peer: Peer,
    pub url: String,
    pub status: SendStatus,
}

/// Single POST with a fixed timeout. The response body is discarded; non-2xx
/// and network errors are logged and reported, never raised.
pub async fn send_request<T: Serialize + ?Sized>(
    client: &Client,
    url: &str,
    payload: &T,
    timeout: Duration,
) -> SendStatus {
    match client.post(url).timeout(timeout).json(payload).send().await {
        Ok(response) if response.status().is_success() => {
            debug!(url, "peer accepted request");
            SendStatus::Delivered
        }
        Ok(response) => {
            let status = response.status();
            warn!(url, status = %status.as_u16(), "peer rejected request");
            SendStatus::Rejected(status.as_u16())
        }
        Err(e) => {
            let err = LedgerError::PeerUnreachable {
                url: url.to_string(),
                reason: e.to_string(),
            };
            warn!(error = %err, "peer send failed");
            SendStatus::Unreachable(e.to_string())
        }
    }
}

pub struct Propagator {
    client: Client,
    directory: Arc<dyn PeerDirectory>,
    peer_port: u16,
    timeout: Duration,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<SendOutcome>>,
    outcomes: broadcast::Sender<SendOutcome>,
}

impl Propagator {
    pub fn new(
        directory: Arc<dyn PeerDirectory>,
        peer_port: u16,
        timeout: Duration,
        max_concurrent_sends: usize,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Config(format!("failed to build HTTP client: {}", e)))?;
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);

        Ok(Self {
            client,
            directory,
            peer_port,
            timeout,
            permits: Arc::new(Semaphore::new(max_concurrent_sends.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            outcomes,
        })
    }

    pub fn from_config(config: &Config, directory: Arc<dyn PeerDirectory>) -> Result<Self> {
        Self::new(
            directory,
            config.network.peer_port,
            config.request_timeout(),
            config.network.max_concurrent_sends,
        )
    }

    /// Receives the outcome of every send dispatched after subscribing.
    pub fn subscribe(&self) -> broadcast::Receiver<SendOutcome> {
        self.outcomes.subscribe()
    }

    /// Sends that have not been reaped yet.
    pub fn in_flight(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Dispatches `signed` to every known peer and returns the number of
    /// sends dispatched, without waiting for any of them.
    pub async fn propagate(&self, signed: &SignedTransaction) -> Result<usize> {
        let peers = self.directory.get_peers()?;
        let body = Arc::new(serde_json::to_value(signed)?);

        let mut tasks = self.tasks.lock();
        while let Some(reaped) = tasks.try_join_next() {
            if let Err(e) = reaped {
                warn!(error = %e, "peer send task panicked");
            }
        }

        for peer in &peers {
            let url = format!("{}{}", peer.base_url(self.peer_port), VALIDATE_TRANSACTION_PATH);
            info!(
                peer = %peer,
                transaction_code = %signed.transaction.transaction_code,
                "broadcasting transaction to peer"
            );

            let client = self.client.clone();
            let permits = self.permits.clone();
            let outcomes = self.outcomes.clone();
            let body = body.clone();
            let peer = peer.clone();
            let timeout = self.timeout;
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let status = send_request(&client, &url, body.as_ref(), timeout).await;
                let outcome = SendOutcome { peer, url, status };
                // no subscribers is fine
                let _ = outcomes.send(outcome.clone());
                outcome
            });
        }

        Ok(peers.len())
    }

    /// Waits for every dispatched send to finish and returns their outcomes.
    ///
    /// Cancelling the returned future stops the wait, not the sends.
    pub async fn drain(&self) -> Vec<SendOutcome> {
        let mut tasks = DetachOnDrop(std::mem::take(&mut *self.tasks.lock()));
        let mut finished = Vec::new();
        while let Some(joined) = tasks.0.join_next().await {
            match joined {
                Ok(outcome) => finished.push(outcome),
                Err(e) => warn!(error = %e, "peer send task panicked"),
            }
        }
        finished
    }
}

/// Sends taken out of the propagator for draining. Whatever is still
/// running when this is dropped keeps running.
struct DetachOnDrop(JoinSet<SendOutcome>);

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        self.0.detach_all();
    }
}

impl Drop for Propagator {
    fn drop(&mut self) {
        // dispatched sends run to completion
        self.tasks.get_mut().detach_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::PeerBook;

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_send_request_unreachable_is_absorbed() {
        let client = Client::new();
        let url = format!("http://127.0.0.1:{}{}", closed_port(), VALIDATE_TRANSACTION_PATH);
        let status = send_request(&client, &url, &serde_json::json!({}), Duration::from_secs(1)).await;
        assert!(matches!(status, SendStatus::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_propagate_with_no_peers() {
        let book = Arc::new(PeerBook::new());
        let propagator = Propagator::new(book, 8090, Duration::from_secs(1), 4).unwrap();
        let signed: SignedTransaction = serde_json::from_value(serde_json::json!({
            "transaction": {
                "transaction_code": "tx",
                "block_index": 1,
                "timestamp": "t",
                "type": 6,
                "specific_data": {"address1": "a", "address2": "b", "new_score": 1.0}
            }
        }))
        .unwrap();

        assert_eq!(propagator.propagate(&signed).await.unwrap(), 0);
        assert!(propagator.drain().await.is_empty());
    }
}
