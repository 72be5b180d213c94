//! Call Engine Module - session state machine, media and orchestration
//!
//! This module manages:
//! - one call session per attempt (offer/answer, candidates, reconnects)
//! - local capture devices and inbound tracks
//! - WebRTC peer connections
//! - the single active call across all contacts, and its outcome

mod audio;
mod candidates;
mod devices;
mod error;
mod media;
mod orchestrator;
mod outcome;
mod peer;
mod rtc;
mod session;
mod state;

pub use audio::{AudioError, MicrophoneCapture, CHANNELS, FRAME_SIZE, SAMPLE_RATE};
pub use candidates::CandidateQueue;
pub use devices::{
    CaptureRequest, DeviceError, FacingMode, HostDevices, LocalTrack, MediaDevices, TrackKind,
};
pub use error::CallEngineError;
pub use media::{LocalMediaState, MediaPipeline, MediaSnapshot, RemoteStream};
pub use orchestrator::{classify, CallOrchestrator, IncomingCall, OrchestratorEvent};
pub use outcome::{format_duration, CallLog, CallOutcome, OutcomeReport, TracingCallLog};
pub use peer::{
    Connectivity, NegotiationError, PeerConnection, PeerEvent, PeerFactory, PeerLink, RemoteTrack,
};
pub use rtc::{RtcPeer, RtcPeerFactory};
pub use session::{
    CallParams, CallSession, CallSessionHandle, CallSummary, CallView, EndReason, SessionCommand,
    SessionContext, SessionEvent,
};
pub use state::{status, CallRole, SessionState};
