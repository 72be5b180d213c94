//! Peer connection seam
//!
//! The session drives a `PeerConnection` and reacts to the `PeerEvent`s it
//! reports. `rtc::RtcPeerFactory` backs it with webrtc-rs.

use super::devices::{LocalTrack, TrackKind};
use crate::config::CallConfig;
use crate::signaling::{Candidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("Peer connection closed")]
    Closed,

    #[error("WebRTC error: {0}")]
    WebRTC(String),
}

// ============================================================================
// EVENTS
// ============================================================================

/// Connectivity as seen by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Checking,
    Connected,
    /// Transient loss, a path restart may recover it
    Lost,
    /// The connection gave up
    Failed,
    Closed,
}

/// Inbound media track
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
    /// Underlying RTP track for playback/rendering
    pub source: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_id: stream_id.into(),
            source: None,
        }
    }
}

impl PartialEq for RemoteTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind && self.stream_id == other.stream_id
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(Candidate),
    Connectivity(Connectivity),
    Track(RemoteTrack),
}

// ============================================================================
// PEER CONNECTION
// ============================================================================

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Offer able to receive audio and video whatever is being sent
    async fn create_offer(&self, ice_restart: bool)
        -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError>;

    /// Swaps the source of the sender carrying `current`, no renegotiation
    async fn replace_track(
        &self,
        current: &LocalTrack,
        replacement: &LocalTrack,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<(), NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

/// A fresh connection and the channel its events arrive on
pub struct PeerLink {
    pub connection: Arc<dyn PeerConnection>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, config: &CallConfig) -> Result<PeerLink, NegotiationError>;
}
