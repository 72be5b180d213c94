//! Loopback fakes for end-to-end call tests
//!
//! `FakePeer` writes its tracks into a plain-text SDP so the other side can
//! raise track events from it, emits two local candidates on its first
//! local description and reports `Connected` once it has a local and a
//! remote description plus at least one applied remote candidate.

#![allow(dead_code)]

use async_trait::async_trait;
use duocall::call_engine::{
    CallLog, CallOrchestrator, CaptureRequest, Connectivity, DeviceError, LocalTrack,
    MediaDevices, NegotiationError, OutcomeReport, PeerConnection, PeerEvent, PeerFactory,
    PeerLink, RemoteTrack, SessionContext, TrackKind,
};
use duocall::config::CallConfig;
use duocall::signaling::{Candidate, MemoryStore, SessionDescription, SignalingStore};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// PEER
// ============================================================================

#[derive(Default)]
struct FakePeerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<(TrackKind, Uuid)>,
    version: u32,
    offers: usize,
    answers: usize,
    replaced: usize,
    applied: Vec<String>,
    remote_tracks_seen: HashSet<String>,
    candidates_emitted: bool,
    connected: bool,
    restarting: bool,
    closed: bool,
}

pub struct FakePeer {
    pub id: u64,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<FakePeerState>,
    fail_replace: AtomicBool,
    /// Signaling completes but ICE never does
    connectivity_blocked: bool,
    close_delay_ms: AtomicU64,
}

fn kind_name(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

impl FakePeer {
    fn sdp(&self, state: &FakePeerState, ice_restart: bool) -> String {
        let mut sdp = format!("v=0\r\no=fake-{} {}\r\n", self.id, state.version);
        if ice_restart {
            sdp.push_str("a=ice-restart\r\n");
        }
        for (kind, id) in &state.tracks {
            sdp.push_str(&format!("a=track:{}:{}\r\n", kind_name(*kind), id));
        }
        sdp
    }

    fn check_connected(&self, state: &mut FakePeerState) {
        if !state.connected
            && !self.connectivity_blocked
            && !state.restarting
            && !state.closed
            && state.local.is_some()
            && state.remote.is_some()
            && !state.applied.is_empty()
        {
            state.connected = true;
            let _ = self
                .events
                .send(PeerEvent::Connectivity(Connectivity::Connected));
        }
    }

    /// Transient loss; connectivity returns after the next remote
    /// description
    pub fn drop_connectivity(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.restarting = true;
        let _ = self.events.send(PeerEvent::Connectivity(Connectivity::Lost));
    }

    pub fn fail(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.restarting = true;
        let _ = self
            .events
            .send(PeerEvent::Connectivity(Connectivity::Failed));
    }

    pub fn set_fail_replace(&self, fail: bool) {
        self.fail_replace.store(fail, Ordering::SeqCst);
    }

    /// Makes `close` take this long, holding up teardown
    pub fn set_close_delay(&self, delay: Duration) {
        self.close_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn offers(&self) -> usize {
        self.state.lock().offers
    }

    pub fn answers(&self) -> usize {
        self.state.lock().answers
    }

    pub fn replaced(&self) -> usize {
        self.state.lock().replaced
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }

    pub fn local_sdp(&self) -> Option<String> {
        self.state.lock().local.as_ref().map(|d| d.sdp.clone())
    }

    pub fn sent_kinds(&self) -> Vec<TrackKind> {
        self.state.lock().tracks.iter().map(|(kind, _)| *kind).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(
        &self,
        ice_restart: bool,
    ) -> Result<SessionDescription, NegotiationError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(NegotiationError::Closed);
        }
        state.offers += 1;
        state.version += 1;
        Ok(SessionDescription::offer(self.sdp(&state, ice_restart)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(NegotiationError::InvalidDescription(
                "answer without remote offer".to_string(),
            ));
        }
        state.answers += 1;
        state.version += 1;
        Ok(SessionDescription::answer(self.sdp(&state, false)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(NegotiationError::Closed);
        }
        state.local = Some(description);
        if !state.candidates_emitted {
            state.candidates_emitted = true;
            for n in 1..=2 {
                let _ = self.events.send(PeerEvent::LocalCandidate(Candidate::new(format!(
                    "cand-{}-{}",
                    self.id, n
                ))));
            }
        }
        self.check_connected(&mut state);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(NegotiationError::Closed);
        }
        if !description.sdp.starts_with("v=0") {
            return Err(NegotiationError::InvalidDescription(description.sdp));
        }

        for line in description.sdp.lines() {
            let Some((kind, id)) = line
                .strip_prefix("a=track:")
                .and_then(|rest| rest.split_once(':'))
            else {
                continue;
            };
            if state.remote_tracks_seen.insert(id.to_string()) {
                let kind = if kind == "video" {
                    TrackKind::Video
                } else {
                    TrackKind::Audio
                };
                let _ = self
                    .events
                    .send(PeerEvent::Track(RemoteTrack::new(id, kind, "remote")));
            }
        }

        state.remote = Some(description);
        state.restarting = false;
        self.check_connected(&mut state);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        self.state.lock().tracks.push((track.kind(), track.id()));
        Ok(())
    }

    async fn replace_track(
        &self,
        current: &LocalTrack,
        replacement: &LocalTrack,
    ) -> Result<(), NegotiationError> {
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(NegotiationError::WebRTC("replace refused".to_string()));
        }
        let mut state = self.state.lock();
        let slot = state
            .tracks
            .iter_mut()
            .find(|(_, id)| *id == current.id())
            .ok_or_else(|| NegotiationError::WebRTC("unknown sender".to_string()))?;
        *slot = (replacement.kind(), replacement.id());
        state.replaced += 1;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(NegotiationError::Closed);
        }
        if state.remote.is_none() {
            return Err(NegotiationError::InvalidCandidate(
                "no remote description".to_string(),
            ));
        }
        if candidate.candidate.starts_with("malformed") {
            return Err(NegotiationError::InvalidCandidate(candidate.candidate));
        }
        state.applied.push(candidate.candidate);
        self.check_connected(&mut state);
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.state.lock().closed = true;
        let delay = self.close_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    next_id: AtomicU64,
    peers: Mutex<Vec<Arc<FakePeer>>>,
    connectivity_blocked: AtomicBool,
}

impl FakePeerFactory {
    /// Connections created from now on never report `Connected`
    pub fn block_connectivity(&self) {
        self.connectivity_blocked.store(true, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn latest(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(&self, _config: &CallConfig) -> Result<PeerLink, NegotiationError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let peer = Arc::new(FakePeer {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            events: events_tx,
            state: Mutex::new(FakePeerState::default()),
            fail_replace: AtomicBool::new(false),
            connectivity_blocked: self.connectivity_blocked.load(Ordering::SeqCst),
            close_delay_ms: AtomicU64::new(0),
        });
        self.peers.lock().push(Arc::clone(&peer));
        Ok(PeerLink {
            connection: peer,
            events,
        })
    }
}

// ============================================================================
// DEVICES
// ============================================================================

#[derive(Default)]
pub struct FakeDevices {
    acquired: AtomicUsize,
    released: AtomicUsize,
    live: Mutex<HashSet<Uuid>>,
    failure: Mutex<Option<DeviceError>>,
    acquire_delay: Mutex<Duration>,
}

impl FakeDevices {
    /// Keeps every capture request pending this long, like a permission
    /// prompt
    pub fn set_acquire_delay(&self, delay: Duration) {
        *self.acquire_delay.lock() = delay;
    }

    pub fn fail_with(&self, error: DeviceError) {
        *self.failure.lock() = Some(error);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Devices claimed and not released yet
    pub fn outstanding(&self) -> usize {
        self.live.lock().len()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, request: CaptureRequest) -> Result<Vec<LocalTrack>, DeviceError> {
        let delay = *self.acquire_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        let mut tracks = Vec::new();
        if request.audio {
            tracks.push(LocalTrack::audio());
        }
        if let Some(facing) = request.video {
            tracks.push(LocalTrack::camera(facing));
        }
        let mut live = self.live.lock();
        for track in &tracks {
            live.insert(track.id());
        }
        self.acquired.fetch_add(tracks.len(), Ordering::SeqCst);
        Ok(tracks)
    }

    fn release(&self, track: &LocalTrack) {
        if self.live.lock().remove(&track.id()) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// CALL LOG
// ============================================================================

#[derive(Default)]
pub struct RecordingLog {
    reports: Mutex<Vec<OutcomeReport>>,
}

impl RecordingLog {
    pub fn reports(&self) -> Vec<OutcomeReport> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl CallLog for RecordingLog {
    async fn on_call_outcome(&self, report: OutcomeReport) {
        self.reports.lock().push(report);
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub struct Party {
    pub id: String,
    pub orchestrator: CallOrchestrator,
    pub peers: Arc<FakePeerFactory>,
    pub devices: Arc<FakeDevices>,
    pub log: Arc<RecordingLog>,
}

impl Party {
    pub fn new(store: &Arc<MemoryStore>, id: &str) -> Self {
        let peers = Arc::new(FakePeerFactory::default());
        let devices = Arc::new(FakeDevices::default());
        let log = Arc::new(RecordingLog::default());
        let config = CallConfig {
            publish_backoff: Duration::from_millis(5),
            ..Default::default()
        };
        let ctx = SessionContext::new(
            Arc::clone(store) as Arc<dyn SignalingStore>,
            devices.clone(),
            peers.clone(),
            config,
        );
        Self {
            id: id.to_string(),
            orchestrator: CallOrchestrator::new(id, ctx, log.clone()),
            peers,
            devices,
            log,
        }
    }

    pub fn peer(&self) -> Arc<FakePeer> {
        self.peers.latest().expect("no peer connection created")
    }
}

/// Polls `condition` until it holds, failing the test after ~3s
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}
