//! duocall - P2P audio/video calls with store-relayed signaling
//!
//! Two users exchange media over a direct WebRTC connection:
//! - a synchronized key/value store relays offers, answers and candidates
//! - one call session per attempt drives negotiation and teardown
//! - the orchestrator keeps at most one call active and reports outcomes

pub mod call_engine;
pub mod config;
pub mod signaling;

use call_engine::{
    CallEngineError, CallLog, CallOrchestrator, FacingMode, HostDevices, RtcPeerFactory,
    SessionContext, TracingCallLog,
};
use config::CallConfig;
use signaling::{RelayStore, SignalingStore};
use std::sync::Arc;

/// Installs the fmt subscriber. `RUST_LOG` overrides the default filter.
/// Returns false if a subscriber was already set.
pub fn init_tracing() -> bool {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("duocall=debug,webrtc=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Engine wired to the host machine: relay store, cpal microphone and
/// webrtc-rs connections
pub struct CallApp {
    store: Arc<RelayStore>,
    orchestrator: CallOrchestrator,
}

impl CallApp {
    /// Connects to the relay store and starts the orchestrator for
    /// `local_id`
    pub async fn connect(
        local_id: impl Into<String>,
        config: CallConfig,
        cameras: Vec<FacingMode>,
    ) -> Result<Self, CallEngineError> {
        Self::connect_with_log(local_id, config, cameras, Arc::new(TracingCallLog)).await
    }

    pub async fn connect_with_log(
        local_id: impl Into<String>,
        config: CallConfig,
        cameras: Vec<FacingMode>,
        call_log: Arc<dyn CallLog>,
    ) -> Result<Self, CallEngineError> {
        let local_id = local_id.into();
        tracing::info!("Starting call engine for {}", local_id);

        let store = Arc::new(RelayStore::connect(&config).await?);
        let ctx = SessionContext::new(
            Arc::clone(&store) as Arc<dyn SignalingStore>,
            Arc::new(HostDevices::with_cameras(cameras)),
            Arc::new(RtcPeerFactory::new()),
            config,
        );

        Ok(Self {
            store,
            orchestrator: CallOrchestrator::new(local_id, ctx, call_log),
        })
    }

    pub fn orchestrator(&self) -> &CallOrchestrator {
        &self.orchestrator
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    pub fn subscribe_relay(&self) -> tokio::sync::broadcast::Receiver<signaling::RelayStatus> {
        self.store.subscribe_status()
    }
}

impl std::fmt::Debug for CallApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallApp")
            .field("store", &self.store)
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}
