//! Contract of the synchronized store used as a signaling relay
//!
//! No transactional guarantee is assumed across operations: an answer may
//! become visible before all candidates, a record may vanish at any time.

use super::messages::{CallRecord, Candidate, SignalPayload};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Signaling store unreachable: {0}")]
    Unreachable(String),

    #[error("Not connected to signaling store")]
    NotConnected,

    #[error("Signaling store did not acknowledge within {0:?}")]
    Timeout(Duration),

    #[error("Signaling store rejected request: {0}")]
    Rejected(String),

    #[error("Malformed store payload: {0}")]
    Codec(String),
}

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

type CancelFn = Box<dyn FnOnce() + Send + Sync>;

/// Stream of store notifications. Dropping it cancels the watch.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    on_drop: Option<CancelFn>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx, on_drop: None }
    }

    pub fn with_cancel(
        rx: mpsc::UnboundedReceiver<T>,
        on_drop: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            rx,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Next notification; `None` once the store stopped delivering
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(cancel) = self.on_drop.take() {
            cancel();
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("cancellable", &self.on_drop.is_some())
            .finish()
    }
}

// ============================================================================
// STORE CONTRACT
// ============================================================================

#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Overwrites the record for the pair and discards every candidate list
    /// under it
    async fn publish_call(&self, pair_id: &str, record: &CallRecord)
        -> Result<(), TransportError>;

    /// Merges an offer or answer into the existing record
    async fn attach_signal(
        &self,
        pair_id: &str,
        payload: &SignalPayload,
    ) -> Result<(), TransportError>;

    /// Current record first (`None` if absent), then every change;
    /// `None` on deletion
    async fn watch_call(
        &self,
        pair_id: &str,
    ) -> Result<Subscription<Option<CallRecord>>, TransportError>;

    async fn append_candidate(
        &self,
        pair_id: &str,
        owner_id: &str,
        candidate: &Candidate,
    ) -> Result<(), TransportError>;

    /// Each candidate appended by `owner_id`, exactly once, in append order
    async fn watch_candidates(
        &self,
        pair_id: &str,
        owner_id: &str,
    ) -> Result<Subscription<Candidate>, TransportError>;

    /// Removes the record together with all candidate lists under it
    async fn delete_call(&self, pair_id: &str) -> Result<(), TransportError>;
}

/// Retries a store write that failed with a transport error
pub async fn with_retry<T, F, Fut>(
    attempts: u32,
    backoff: Duration,
    what: &str,
    mut op: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                tracing::warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                tokio::time::sleep(backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!("{} failed after {} attempt(s): {}", what, attempts, e);
                return Err(e);
            }
        }
    }
}
