//! Media pipeline: local capture, control flags and the inbound stream
//!
//! Owns every claimed device for the lifetime of one call. Mute and
//! camera-off flip track flags, camera switch swaps the sender's source,
//! inbound tracks are folded into a fresh `RemoteStream` on each arrival.

use super::devices::{CaptureRequest, DeviceError, FacingMode, LocalTrack, MediaDevices, TrackKind};
use super::error::CallEngineError;
use super::peer::{PeerConnection, RemoteTrack};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalMediaState {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
    pub muted: bool,
    pub camera_off: bool,
    pub facing: FacingMode,
}

/// Inbound tracks presented as one stream. Replaced, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStream {
    pub id: Uuid,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    fn new(tracks: Vec<RemoteTrack>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tracks,
        }
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }

    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Audio)
    }
}

/// Everything the presentation layer binds to
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSnapshot {
    pub local: LocalMediaState,
    pub remote: Option<RemoteStream>,
    pub is_video: bool,
    pub speaker_on: bool,
    /// Bumped on every change; re-bind rendering surfaces when it moves
    pub tick: u64,
}

struct MediaState {
    local: LocalMediaState,
    /// Claimed but not adopted yet (camera switch in flight)
    pending: Vec<LocalTrack>,
    remote: Option<RemoteStream>,
    is_video: bool,
    speaker_on: bool,
    tick: u64,
    released: bool,
}

// ============================================================================
// MEDIA PIPELINE
// ============================================================================

pub struct MediaPipeline {
    devices: Arc<dyn MediaDevices>,
    state: Mutex<MediaState>,
}

impl MediaPipeline {
    pub fn new(devices: Arc<dyn MediaDevices>, is_video: bool) -> Self {
        Self {
            devices,
            state: Mutex::new(MediaState {
                local: LocalMediaState::default(),
                pending: Vec::new(),
                remote: None,
                is_video,
                speaker_on: false,
                tick: 0,
                released: false,
            }),
        }
    }

    /// Microphone always, camera only for video calls
    pub async fn acquire_local(&self, want_video: bool) -> Result<Vec<LocalTrack>, DeviceError> {
        let tracks = self.devices.acquire(CaptureRequest::call(want_video)).await?;
        Ok(self.adopt(tracks))
    }

    /// Stores freshly claimed tracks; if the call already ended they are
    /// released on the spot and nothing is returned
    fn adopt(&self, tracks: Vec<LocalTrack>) -> Vec<LocalTrack> {
        let mut state = self.state.lock();
        if state.released {
            drop(state);
            for track in &tracks {
                self.devices.release(track);
            }
            return Vec::new();
        }

        for track in &tracks {
            match track.kind() {
                TrackKind::Audio => state.local.audio = Some(track.clone()),
                TrackKind::Video => {
                    state.local.facing = track.facing().unwrap_or_default();
                    state.local.video = Some(track.clone());
                }
            }
        }
        state.tick += 1;
        tracks
    }

    pub fn local_tracks(&self) -> Vec<LocalTrack> {
        let state = self.state.lock();
        state
            .local
            .audio
            .iter()
            .chain(state.local.video.iter())
            .cloned()
            .collect()
    }

    pub fn has_video_track(&self) -> bool {
        self.state.lock().local.video.is_some()
    }

    /// Returns the new muted flag
    pub fn toggle_mute(&self) -> bool {
        let mut state = self.state.lock();
        state.local.muted = !state.local.muted;
        if let Some(audio) = &state.local.audio {
            audio.set_enabled(!state.local.muted);
        }
        state.tick += 1;
        state.local.muted
    }

    /// Flips camera-off on the existing video track. `None` when there is no
    /// video track yet (the caller must add one).
    pub fn toggle_camera(&self) -> Option<bool> {
        let mut state = self.state.lock();
        let video = state.local.video.clone()?;
        state.local.camera_off = !state.local.camera_off;
        video.set_enabled(!state.local.camera_off);
        if !state.local.camera_off {
            state.is_video = true;
        }
        state.tick += 1;
        Some(state.local.camera_off)
    }

    /// Captures a camera for a call that has none yet. The track still has
    /// to be attached and negotiated.
    pub async fn add_camera(&self) -> Result<LocalTrack, DeviceError> {
        let facing = self.state.lock().local.facing;
        let track = self.claim_camera(facing).await?;

        let mut state = self.state.lock();
        if state.released || state.local.video.is_some() {
            drop(state);
            self.devices.release(&track);
            return Err(DeviceError::Busy("camera".to_string()));
        }
        state.local.video = Some(track.clone());
        state.local.camera_off = false;
        state.is_video = true;
        state.tick += 1;
        Ok(track)
    }

    /// Drops a video track that could not be attached
    pub fn discard_video(&self, track: &LocalTrack) {
        let mut state = self.state.lock();
        if state.local.video.as_ref() != Some(track) {
            return;
        }
        state.local.video = None;
        state.tick += 1;
        drop(state);
        self.devices.release(track);
    }

    /// Front/back swap on the live sender. The old camera is released only
    /// once the replacement is attached. `Ok(None)` while the camera is off.
    pub async fn switch_camera(
        &self,
        peer: &dyn PeerConnection,
    ) -> Result<Option<FacingMode>, CallEngineError> {
        let (current, next) = {
            let state = self.state.lock();
            match &state.local.video {
                Some(video) if !state.local.camera_off => {
                    (video.clone(), state.local.facing.flipped())
                }
                _ => return Ok(None),
            }
        };

        let replacement = self.claim_camera(next).await?;
        {
            let mut state = self.state.lock();
            if state.released {
                drop(state);
                self.devices.release(&replacement);
                return Ok(None);
            }
            state.pending.push(replacement.clone());
        }

        let result = peer.replace_track(&current, &replacement).await;

        let mut state = self.state.lock();
        let still_pending = take_pending(&mut state.pending, &replacement);
        if state.released {
            // release_all already freed both cameras
            return result.map(|_| None).map_err(CallEngineError::from);
        }

        match result {
            Ok(()) => {
                state.local.video = Some(replacement);
                state.local.facing = next;
                state.tick += 1;
                drop(state);
                self.devices.release(&current);
                tracing::info!("Switched camera to {:?}", next);
                Ok(Some(next))
            }
            Err(e) => {
                drop(state);
                if still_pending {
                    self.devices.release(&replacement);
                }
                Err(e.into())
            }
        }
    }

    /// Returns the new speaker flag
    pub fn toggle_speaker(&self) -> bool {
        let mut state = self.state.lock();
        state.speaker_on = !state.speaker_on;
        state.tick += 1;
        state.speaker_on
    }

    /// Rebuilds the presented stream: newest track first, then every
    /// earlier one not superseded by the same id
    pub fn on_remote_track(&self, track: RemoteTrack) {
        let mut state = self.state.lock();
        if state.released {
            return;
        }

        let is_video = track.kind == TrackKind::Video;
        let mut tracks = vec![track];
        if let Some(previous) = state.remote.take() {
            for old in previous.tracks {
                if !tracks.iter().any(|t| t.id == old.id) {
                    tracks.push(old);
                }
            }
        }
        state.remote = Some(RemoteStream::new(tracks));

        if is_video {
            state.is_video = true;
            state.local.camera_off = false;
        }
        state.tick += 1;
    }

    /// Frees every claimed device. Only the first call does anything.
    pub fn release_all(&self) -> usize {
        let tracks: Vec<LocalTrack> = {
            let mut state = self.state.lock();
            if state.released {
                return 0;
            }
            state.released = true;
            state.tick += 1;
            let mut tracks: Vec<LocalTrack> = state.pending.drain(..).collect();
            tracks.extend(state.local.audio.take());
            tracks.extend(state.local.video.take());
            tracks
        };

        for track in &tracks {
            self.devices.release(track);
        }
        tracing::info!("Released {} local track(s)", tracks.len());
        tracks.len()
    }

    pub fn is_video(&self) -> bool {
        self.state.lock().is_video
    }

    pub fn snapshot(&self) -> MediaSnapshot {
        let state = self.state.lock();
        MediaSnapshot {
            local: state.local.clone(),
            remote: state.remote.clone(),
            is_video: state.is_video,
            speaker_on: state.speaker_on,
            tick: state.tick,
        }
    }

    async fn claim_camera(&self, facing: FacingMode) -> Result<LocalTrack, DeviceError> {
        let mut tracks = self.devices.acquire(CaptureRequest::camera(facing)).await?;
        match tracks.iter().position(|t| t.kind() == TrackKind::Video) {
            Some(index) => {
                let video = tracks.swap_remove(index);
                for extra in &tracks {
                    self.devices.release(extra);
                }
                Ok(video)
            }
            None => {
                for extra in &tracks {
                    self.devices.release(extra);
                }
                Err(DeviceError::NotFound("camera".to_string()))
            }
        }
    }
}

fn take_pending(pending: &mut Vec<LocalTrack>, track: &LocalTrack) -> bool {
    let before = pending.len();
    pending.retain(|t| t != track);
    pending.len() != before
}

impl std::fmt::Debug for MediaPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaPipeline")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
