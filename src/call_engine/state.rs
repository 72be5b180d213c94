//! Session lifecycle states and presentation status text

use serde::Serialize;

// ============================================================================
// SESSION STATE
// ============================================================================

/// Lifecycle of one call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    /// Acquiring local media, nothing published yet
    Initializing,
    /// Caller: record published, waiting for an answer
    Offering,
    /// Callee: waiting for the caller's offer
    AwaitingOffer,
    /// Descriptions exchanged, waiting for connectivity
    Negotiating,
    Connected,
    /// Connectivity lost mid-call, path restart in progress
    Reconnecting,
    Ended,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        if self == Ended {
            return false;
        }
        if next == Ended {
            return true;
        }

        matches!(
            (self, next),
            (Idle, Initializing)
                | (Initializing, Offering)
                | (Initializing, AwaitingOffer)
                // Lost the publish race, continue as callee
                | (Offering, AwaitingOffer)
                | (Offering, Negotiating)
                | (AwaitingOffer, Negotiating)
                | (Offering, Connected)
                | (AwaitingOffer, Connected)
                | (Negotiating, Connected)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
        )
    }

    /// Connected at least once and not ended
    pub fn is_in_call(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Reconnecting)
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Ended
    }
}

/// Which side of the call this session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallRole {
    Caller,
    Callee,
}

// ============================================================================
// STATUS TEXT
// ============================================================================

pub mod status {
    pub const INITIALIZING: &str = "Initializing...";
    pub const ACCESSING_MICROPHONE: &str = "Accessing microphone...";
    pub const ACCESSING_CAMERA: &str = "Accessing camera...";
    pub const CALLING: &str = "Calling...";
    pub const CONNECTING: &str = "Connecting...";
    pub const CONNECTED: &str = "Connected";
    pub const CONNECTION_LOST: &str = "Connection lost";
    pub const RECONNECTING: &str = "Weak network, reconnecting...";
    pub const DEVICE_ERROR: &str = "Device or permission error";
    pub const ENDED: &str = "Call ended";
}
