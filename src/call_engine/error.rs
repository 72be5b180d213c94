use super::devices::DeviceError;
use super::peer::NegotiationError;
use crate::signaling::TransportError;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallEngineError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Signaling error: {0}")]
    Transport(#[from] TransportError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("No active call")]
    NoActiveCall,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No incoming call from {0}")]
    NoIncomingCall(String),

    #[error("Call session already ended")]
    SessionEnded,
}

impl CallEngineError {
    /// Errors that must end an attempt that has not connected yet
    pub fn is_fatal_before_connect(&self) -> bool {
        !matches!(self, CallEngineError::Negotiation(_))
    }
}
