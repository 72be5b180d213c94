//! Message types for the synchronized signaling store
//!
//! A call attempt lives under `calls/{pairId}`; candidates are appended to
//! `calls/{pairId}/candidates/{ownerId}`. Field names follow the camelCase
//! layout the store already holds so browser clients can share it.

use chrono::Utc;
use serde::{Deserialize, Serialize};

// ============================================================================
// PAIR IDENTIFIER
// ============================================================================

const PAIR_SEPARATOR: char = '_';

/// Order-independent key for the two participants of a call
pub fn pair_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}{PAIR_SEPARATOR}{b}")
    } else {
        format!("{b}{PAIR_SEPARATOR}{a}")
    }
}

/// The other participant of `pair_id`, if `me` is one of the two
pub fn remote_of(pair_id: &str, me: &str) -> Option<String> {
    if let Some(rest) = pair_id.strip_prefix(me) {
        if let Some(other) = rest.strip_prefix(PAIR_SEPARATOR) {
            return Some(other.to_string());
        }
    }
    pair_id
        .strip_suffix(me)
        .and_then(|rest| rest.strip_suffix(PAIR_SEPARATOR))
        .map(str::to_string)
}

pub fn call_path(pair_id: &str) -> String {
    format!("calls/{pair_id}")
}

pub fn candidates_root(pair_id: &str) -> String {
    format!("calls/{pair_id}/candidates")
}

pub fn candidates_path(pair_id: &str, owner_id: &str) -> String {
    format!("calls/{pair_id}/candidates/{owner_id}")
}

// ============================================================================
// CALL RECORD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn wants_video(self) -> bool {
        matches!(self, MediaKind::Video)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Calling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An offer or answer as produced by the peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Description attached to the record under `offer` or `answer`.
/// `from` lets each side skip its own writes when the record echoes back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalPayload {
    #[serde(flatten)]
    pub description: SessionDescription,
    pub from: String,
}

impl SignalPayload {
    pub fn new(description: SessionDescription, from: impl Into<String>) -> Self {
        Self {
            description,
            from: from.into(),
        }
    }

    pub fn kind(&self) -> SdpKind {
        self.description.kind
    }

    pub fn sdp(&self) -> &str {
        &self.description.sdp
    }
}

/// One in-progress call attempt. Absence of the record means "no call".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub caller_id: String,
    #[serde(rename = "type")]
    pub media_kind: MediaKind,
    pub status: CallStatus,
    /// Milliseconds since the epoch
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SignalPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SignalPayload>,
}

impl CallRecord {
    pub fn new(caller_id: impl Into<String>, media_kind: MediaKind) -> Self {
        Self {
            caller_id: caller_id.into(),
            media_kind,
            status: CallStatus::Calling,
            created_at: Utc::now().timestamp_millis(),
            offer: None,
            answer: None,
        }
    }

    pub fn signal(&self, kind: SdpKind) -> Option<&SignalPayload> {
        match kind {
            SdpKind::Offer => self.offer.as_ref(),
            SdpKind::Answer => self.answer.as_ref(),
        }
    }

    /// Stores the payload in the field named after its kind, replacing
    /// whatever was there
    pub fn attach(&mut self, payload: SignalPayload) {
        match payload.kind() {
            SdpKind::Offer => self.offer = Some(payload),
            SdpKind::Answer => self.answer = Some(payload),
        }
    }

    /// True when this record rings at `me`
    pub fn is_incoming_for(&self, me: &str) -> bool {
        self.status == CallStatus::Calling && self.caller_id != me
    }
}

// ============================================================================
// CANDIDATES
// ============================================================================

/// Network-path candidate in the browser's `RTCIceCandidateInit` layout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl Candidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }
}

// ============================================================================
// RELAY FRAMES (client ↔ relay server)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// Full node value on every change, `null` when absent
    Value,
    /// Each child appended to a list, existing ones first
    ChildAdded,
}

/// Client → relay
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RelayRequest {
    Put {
        id: u64,
        path: String,
        value: serde_json::Value,
    },
    Merge {
        id: u64,
        path: String,
        value: serde_json::Value,
    },
    Push {
        id: u64,
        path: String,
        value: serde_json::Value,
    },
    Remove {
        id: u64,
        path: String,
    },
    Subscribe {
        id: u64,
        path: String,
        mode: WatchMode,
    },
    Unsubscribe {
        id: u64,
    },
}

/// Relay → client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    Ack {
        id: u64,
    },
    Error {
        id: u64,
        message: String,
    },
    Value {
        id: u64,
        #[serde(default)]
        value: serde_json::Value,
    },
    Child {
        id: u64,
        value: serde_json::Value,
    },
}
