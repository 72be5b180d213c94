//! WebSocket client for the key/value relay server
//!
//! Speaks JSON frames to a relay that keeps the call tree:
//! - one read task dispatching acks and subscription events
//! - one write task draining the outgoing queue
//! - every write waits for its ack (bounded by `ack_timeout`)

use super::messages::*;
use super::store::{SignalingStore, Subscription, TransportError};
use crate::config::CallConfig;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// CONNECTION EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStatus {
    Connected,
    Disconnected,
}

// ============================================================================
// CLIENT STATE
// ============================================================================

type AckSender = oneshot::Sender<Result<(), TransportError>>;

enum SubscriptionSink {
    Call(mpsc::UnboundedSender<Option<CallRecord>>),
    Candidates(mpsc::UnboundedSender<Candidate>),
}

#[derive(Default)]
struct Shared {
    is_connected: RwLock<bool>,
    pending: Mutex<HashMap<u64, AckSender>>,
    subscriptions: Mutex<HashMap<u64, SubscriptionSink>>,
}

impl Shared {
    fn fail_pending(&self, error: TransportError) {
        for (_, ack) in self.pending.lock().drain() {
            let _ = ack.send(Err(error.clone()));
        }
    }
}

// ============================================================================
// RELAY STORE
// ============================================================================

/// `SignalingStore` backed by a relay server over WebSocket
pub struct RelayStore {
    server_url: String,
    shared: Arc<Shared>,
    tx: mpsc::Sender<String>,
    next_id: AtomicU64,
    ack_timeout: Duration,
    event_tx: broadcast::Sender<RelayStatus>,
}

impl RelayStore {
    /// Connects to `config.signaling_url` and starts the read/write tasks
    pub async fn connect(config: &CallConfig) -> Result<Self, TransportError> {
        let ws_url = websocket_url(&config.signaling_url)?;
        tracing::info!("Connecting to relay store: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        let (event_tx, _) = broadcast::channel(16);
        let shared = Arc::new(Shared::default());
        *shared.is_connected.write() = true;
        let _ = event_tx.send(RelayStatus::Connected);

        // Read task
        let read_shared = Arc::clone(&shared);
        let read_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RelayEvent>(&text) {
                        Ok(event) => Self::handle_relay_event(event, &read_shared),
                        Err(e) => tracing::warn!("Unparseable relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("Relay closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Relay WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            *read_shared.is_connected.write() = false;
            read_shared.fail_pending(TransportError::Unreachable(
                "relay connection closed".to_string(),
            ));
            // Dropping the sinks ends every open subscription
            read_shared.subscriptions.lock().clear();
            let _ = read_events.send(RelayStatus::Disconnected);
        });

        // Write task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send relay frame: {}", e);
                    break;
                }
            }
        });

        Ok(Self {
            server_url: ws_url.to_string(),
            shared,
            tx,
            next_id: AtomicU64::new(1),
            ack_timeout: config.ack_timeout,
            event_tx,
        })
    }

    /// Store without a socket; frames land in the returned receiver
    #[cfg(test)]
    fn detached(connected: bool) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        let (event_tx, _) = broadcast::channel(16);
        let shared = Arc::new(Shared::default());
        *shared.is_connected.write() = connected;
        let store = Self {
            server_url: "ws://127.0.0.1/ws".to_string(),
            shared,
            tx,
            next_id: AtomicU64::new(1),
            ack_timeout: Duration::from_millis(50),
            event_tx,
        };
        (store, rx)
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<RelayStatus> {
        self.event_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.is_connected.read()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn encode(request: &RelayRequest) -> Result<String, TransportError> {
        serde_json::to_string(request).map_err(|e| TransportError::Codec(e.to_string()))
    }

    /// Sends a write and waits for the relay to acknowledge it
    async fn request(&self, build: impl FnOnce(u64) -> RelayRequest) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let id = self.next_id();
        let frame = Self::encode(&build(id))?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, ack_tx);

        if let Err(e) = self.tx.send(frame).await {
            self.shared.pending.lock().remove(&id);
            return Err(TransportError::Unreachable(e.to_string()));
        }

        match tokio::time::timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Unreachable(
                "relay dropped the request".to_string(),
            )),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(TransportError::Timeout(self.ack_timeout))
            }
        }
    }

    /// Registers a sink and sends the subscribe frame. The returned cancel
    /// closure unregisters it and tells the relay.
    async fn open_watch(
        &self,
        path: String,
        mode: WatchMode,
        sink: SubscriptionSink,
    ) -> Result<impl FnOnce() + Send + Sync + 'static, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let id = self.next_id();
        self.shared.subscriptions.lock().insert(id, sink);
        // The read task may have cleared the sinks between the check and
        // the insert; nothing would ever close this one then
        if !self.is_connected() {
            self.shared.subscriptions.lock().remove(&id);
            return Err(TransportError::NotConnected);
        }

        let frame = Self::encode(&RelayRequest::Subscribe { id, path, mode })?;
        if let Err(e) = self.tx.send(frame).await {
            self.shared.subscriptions.lock().remove(&id);
            return Err(TransportError::Unreachable(e.to_string()));
        }

        let shared = Arc::clone(&self.shared);
        let tx = self.tx.clone();
        Ok(move || {
            shared.subscriptions.lock().remove(&id);
            if let Ok(frame) = Self::encode(&RelayRequest::Unsubscribe { id }) {
                let _ = tx.try_send(frame);
            }
        })
    }

    fn handle_relay_event(event: RelayEvent, shared: &Arc<Shared>) {
        match event {
            RelayEvent::Ack { id } => {
                if let Some(ack) = shared.pending.lock().remove(&id) {
                    let _ = ack.send(Ok(()));
                }
            }

            RelayEvent::Error { id, message } => {
                tracing::warn!("Relay rejected request {}: {}", id, message);
                if let Some(ack) = shared.pending.lock().remove(&id) {
                    let _ = ack.send(Err(TransportError::Rejected(message)));
                }
            }

            RelayEvent::Value { id, value } => {
                let subscriptions = shared.subscriptions.lock();
                if let Some(SubscriptionSink::Call(tx)) = subscriptions.get(&id) {
                    let _ = tx.send(decode_record(value));
                }
            }

            RelayEvent::Child { id, value } => {
                let subscriptions = shared.subscriptions.lock();
                if let Some(SubscriptionSink::Candidates(tx)) = subscriptions.get(&id) {
                    match serde_json::from_value::<Candidate>(value) {
                        Ok(candidate) => {
                            let _ = tx.send(candidate);
                        }
                        Err(e) => tracing::warn!("Dropping malformed candidate: {}", e),
                    }
                }
            }
        }
    }
}

/// A node that exists but is not a complete record (e.g. only late
/// candidates survived a delete) counts as "no call"
fn decode_record(value: serde_json::Value) -> Option<CallRecord> {
    if value.is_null() {
        return None;
    }
    match serde_json::from_value::<CallRecord>(value) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!("Ignoring partial call record: {}", e);
            None
        }
    }
}

/// `http(s)://host` becomes `ws(s)://host/ws`; explicit ws URLs and paths
/// are kept
fn websocket_url(server_url: &str) -> Result<Url, TransportError> {
    let mut url =
        Url::parse(server_url).map_err(|e| TransportError::Unreachable(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::Unreachable(format!(
                "unsupported relay scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::Unreachable(format!("cannot use scheme {scheme}")))?;

    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    Ok(url)
}

#[async_trait]
impl SignalingStore for RelayStore {
    async fn publish_call(
        &self,
        pair_id: &str,
        record: &CallRecord,
    ) -> Result<(), TransportError> {
        let value =
            serde_json::to_value(record).map_err(|e| TransportError::Codec(e.to_string()))?;
        self.request(|id| RelayRequest::Put {
            id,
            path: call_path(pair_id),
            value,
        })
        .await?;
        self.request(|id| RelayRequest::Remove {
            id,
            path: candidates_root(pair_id),
        })
        .await
    }

    async fn attach_signal(
        &self,
        pair_id: &str,
        payload: &SignalPayload,
    ) -> Result<(), TransportError> {
        let field = match payload.kind() {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        let payload =
            serde_json::to_value(payload).map_err(|e| TransportError::Codec(e.to_string()))?;
        let mut value = serde_json::Map::new();
        value.insert(field.to_string(), payload);

        self.request(|id| RelayRequest::Merge {
            id,
            path: call_path(pair_id),
            value: serde_json::Value::Object(value),
        })
        .await
    }

    async fn watch_call(
        &self,
        pair_id: &str,
    ) -> Result<Subscription<Option<CallRecord>>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = self
            .open_watch(call_path(pair_id), WatchMode::Value, SubscriptionSink::Call(tx))
            .await?;
        Ok(Subscription::with_cancel(rx, cancel))
    }

    async fn append_candidate(
        &self,
        pair_id: &str,
        owner_id: &str,
        candidate: &Candidate,
    ) -> Result<(), TransportError> {
        let value =
            serde_json::to_value(candidate).map_err(|e| TransportError::Codec(e.to_string()))?;
        self.request(|id| RelayRequest::Push {
            id,
            path: candidates_path(pair_id, owner_id),
            value,
        })
        .await
    }

    async fn watch_candidates(
        &self,
        pair_id: &str,
        owner_id: &str,
    ) -> Result<Subscription<Candidate>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = self
            .open_watch(
                candidates_path(pair_id, owner_id),
                WatchMode::ChildAdded,
                SubscriptionSink::Candidates(tx),
            )
            .await?;
        Ok(Subscription::with_cancel(rx, cancel))
    }

    async fn delete_call(&self, pair_id: &str) -> Result<(), TransportError> {
        self.request(|id| RelayRequest::Remove {
            id,
            path: call_path(pair_id),
        })
        .await
    }
}

impl std::fmt::Debug for RelayStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStore")
            .field("server_url", &self.server_url)
            .field("is_connected", &self.is_connected())
            .finish()
    }
}
