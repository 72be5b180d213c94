//! Local capture devices and the tracks they feed
//!
//! A `LocalTrack` is the handle the rest of the engine passes around: the
//! RTP track attached to the connection plus its enabled flag. The device
//! behind it stays claimed until `MediaDevices::release` is called.

use super::audio::{AudioError, MicrophoneCapture, CHANNELS, SAMPLE_RATE};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const STREAM_ID: &str = "duocall-local";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Permission denied for {0}")]
    PermissionDenied(String),

    #[error("No {0} found")]
    NotFound(String),

    #[error("{0} is busy")]
    Busy(String),

    #[error("Media backend error: {0}")]
    Backend(String),
}

impl From<AudioError> for DeviceError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::NoInputDevice => DeviceError::NotFound("microphone".to_string()),
            AudioError::StreamBuildError(e) | AudioError::StreamPlayError(e) => {
                DeviceError::Busy(format!("microphone ({e})"))
            }
            AudioError::UnsupportedConfig(e) => DeviceError::Backend(e),
        }
    }
}

// ============================================================================
// TRACKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera
    #[default]
    User,
    /// Back camera
    Environment,
}

impl FacingMode {
    pub fn flipped(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

/// What to open: microphone and/or one camera
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub audio: bool,
    pub video: Option<FacingMode>,
}

impl CaptureRequest {
    /// Microphone always, front camera for video calls
    pub fn call(want_video: bool) -> Self {
        Self {
            audio: true,
            video: want_video.then_some(FacingMode::User),
        }
    }

    pub fn camera(facing: FacingMode) -> Self {
        Self {
            audio: false,
            video: Some(facing),
        }
    }
}

/// Outgoing track backed by a claimed capture device
#[derive(Clone)]
pub struct LocalTrack {
    id: Uuid,
    kind: TrackKind,
    facing: Option<FacingMode>,
    enabled: Arc<AtomicBool>,
    rtp: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, facing: Option<FacingMode>) -> Self {
        let id = Uuid::new_v4();
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: CHANNELS,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };

        Self {
            id,
            kind,
            facing,
            enabled: Arc::new(AtomicBool::new(true)),
            rtp: Arc::new(TrackLocalStaticSample::new(
                codec,
                id.to_string(),
                STREAM_ID.to_string(),
            )),
        }
    }

    pub fn audio() -> Self {
        Self::new(TrackKind::Audio, None)
    }

    pub fn camera(facing: FacingMode) -> Self {
        Self::new(TrackKind::Video, Some(facing))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn facing(&self) -> Option<FacingMode> {
        self.facing
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Mute / camera-off. The track stays attached to the connection.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Shared flag for capture callbacks
    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enabled)
    }

    pub fn rtp(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtp)
    }

    /// Sends one encoded sample; dropped while the track is disabled
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), DeviceError> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.rtp
            .write_sample(sample)
            .await
            .map_err(|e| DeviceError::Backend(e.to_string()))
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LocalTrack {}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("facing", &self.facing)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

// ============================================================================
// DEVICE API
// ============================================================================

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Claims the requested devices. All or nothing: on error no device
    /// stays claimed.
    async fn acquire(&self, request: CaptureRequest) -> Result<Vec<LocalTrack>, DeviceError>;

    /// Stops capture and frees the device behind `track`
    fn release(&self, track: &LocalTrack);
}

/// Devices of the host machine: the default cpal microphone plus cameras
/// registered by the embedding application
pub struct HostDevices {
    cameras: Vec<FacingMode>,
    microphones: Mutex<HashMap<Uuid, MicrophoneCapture>>,
}

impl HostDevices {
    /// Microphone only
    pub fn new() -> Self {
        Self::with_cameras(Vec::new())
    }

    pub fn with_cameras(cameras: Vec<FacingMode>) -> Self {
        Self {
            cameras,
            microphones: Mutex::new(HashMap::new()),
        }
    }

    /// Next 20ms of microphone PCM for `track`
    pub fn read_microphone_frame(&self, track: &LocalTrack) -> Option<Vec<f32>> {
        self.microphones
            .lock()
            .get(&track.id())
            .and_then(|capture| capture.read_frame())
    }

    pub fn microphone_level(&self, track: &LocalTrack) -> Option<f32> {
        self.microphones.lock().get(&track.id()).map(|c| c.level())
    }
}

impl Default for HostDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for HostDevices {
    async fn acquire(&self, request: CaptureRequest) -> Result<Vec<LocalTrack>, DeviceError> {
        let mut tracks = Vec::new();

        if request.audio {
            let track = LocalTrack::audio();
            // TODO: Opus-encode captured frames and write them to the track
            let capture = MicrophoneCapture::open(track.enabled_flag())?;
            self.microphones.lock().insert(track.id(), capture);
            tracks.push(track);
        }

        if let Some(facing) = request.video {
            if !self.cameras.contains(&facing) {
                for track in &tracks {
                    self.release(track);
                }
                return Err(DeviceError::NotFound(format!("{facing:?} camera")));
            }
            tracks.push(LocalTrack::camera(facing));
        }

        tracing::info!("Acquired {} local track(s)", tracks.len());
        Ok(tracks)
    }

    fn release(&self, track: &LocalTrack) {
        track.set_enabled(false);
        if self.microphones.lock().remove(&track.id()).is_some() {
            tracing::info!("Microphone released");
        }
    }
}

impl std::fmt::Debug for HostDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDevices")
            .field("cameras", &self.cameras)
            .field("open_microphones", &self.microphones.lock().len())
            .finish()
    }
}
