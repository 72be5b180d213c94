//! Call session: one call attempt from intent to teardown
//!
//! Each session is a tokio task fed by a single in-order input queue:
//! store notifications, remote candidates, peer events and user commands
//! all pass through it, so no two of them ever interleave. The handle
//! only reads shared state and can tear the session down from outside.

use super::candidates::CandidateQueue;
use super::devices::MediaDevices;
use super::error::CallEngineError;
use super::media::{MediaPipeline, MediaSnapshot};
use super::peer::{Connectivity, PeerConnection, PeerEvent, PeerFactory};
use super::state::{status, CallRole, SessionState};
use crate::config::CallConfig;
use crate::signaling::{
    pair_id, with_retry, CallRecord, Candidate, MediaKind, SignalPayload, SignalingStore,
    TransportError,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// Why a session ended
#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    LocalHangup,
    /// The record was deleted by the other side
    RemoteHangup,
    /// Connectivity failed for good
    Dropped,
    /// A newer session of the same engine took over
    Superseded,
    Failed(CallEngineError),
}

/// Final report of a session, produced exactly once
#[derive(Debug, Clone, PartialEq)]
pub struct CallSummary {
    pub pair_id: String,
    pub remote_id: String,
    pub role: CallRole,
    /// Whether this side placed the call, even if it later fell back to
    /// answering
    pub dialed: bool,
    pub is_video: bool,
    /// Whether `Connected` was ever reached
    pub connected: bool,
    pub duration: Duration,
    pub reason: EndReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Status(String),
    RoleChanged(CallRole),
    MediaChanged { tick: u64 },
    Ended(CallSummary),
}

/// Presentation view of a session
#[derive(Debug, Clone, PartialEq)]
pub struct CallView {
    pub pair_id: String,
    pub remote_id: String,
    pub state: SessionState,
    pub role: CallRole,
    pub status: String,
    pub media: MediaSnapshot,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    ToggleCamera,
    SwitchCamera,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallParams {
    pub local_id: String,
    pub remote_id: String,
    pub role: CallRole,
    pub media_kind: MediaKind,
}

/// Collaborators shared by every session of one engine
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<dyn SignalingStore>,
    pub devices: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerFactory>,
    pub config: CallConfig,
    active_generation: Arc<AtomicU64>,
}

impl SessionContext {
    pub fn new(
        store: Arc<dyn SignalingStore>,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerFactory>,
        config: CallConfig,
    ) -> Self {
        Self {
            store,
            devices,
            peers,
            config,
            active_generation: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("config", &self.config)
            .field("generation", &self.active_generation.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// SHARED CORE
// ============================================================================

struct Lifecycle {
    state: SessionState,
    role: CallRole,
    status: String,
    ended: bool,
    connected_at: Option<Instant>,
}

struct SessionCore {
    generation: u64,
    pair_id: String,
    local_id: String,
    remote_id: String,
    dialed: bool,
    ctx: SessionContext,
    media: MediaPipeline,
    lifecycle: Mutex<Lifecycle>,
    peer: Mutex<Option<Arc<dyn PeerConnection>>>,
    cancel: watch::Sender<bool>,
    events: broadcast::Sender<SessionEvent>,
    finished: watch::Sender<Option<CallSummary>>,
}

impl SessionCore {
    /// False once ended or superseded by a newer session
    fn is_live(&self) -> bool {
        !self.lifecycle.lock().ended
            && self.ctx.active_generation.load(Ordering::SeqCst) == self.generation
    }

    fn state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    fn role(&self) -> CallRole {
        self.lifecycle.lock().role
    }

    fn is_established(&self) -> bool {
        self.lifecycle.lock().connected_at.is_some()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn transition(&self, next: SessionState) -> bool {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.ended || !lifecycle.state.can_transition_to(next) {
                tracing::debug!("Ignoring transition {:?} -> {:?}", lifecycle.state, next);
                return false;
            }
            lifecycle.state = next;
        }
        tracing::info!("Call {} -> {:?}", self.pair_id, next);
        self.emit(SessionEvent::StateChanged(next));
        true
    }

    fn set_status(&self, text: &str) {
        self.lifecycle.lock().status = text.to_string();
        self.emit(SessionEvent::Status(text.to_string()));
    }

    fn media_changed(&self) {
        let tick = self.media.snapshot().tick;
        self.emit(SessionEvent::MediaChanged { tick });
    }

    fn current_peer(&self) -> Option<Arc<dyn PeerConnection>> {
        self.peer.lock().clone()
    }

    /// Stores the new connection unless the session ended meanwhile.
    /// Returns the connection it replaced.
    fn install_peer(
        &self,
        peer: Arc<dyn PeerConnection>,
    ) -> Result<Option<Arc<dyn PeerConnection>>, Arc<dyn PeerConnection>> {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.ended {
            return Err(peer);
        }
        Ok(self.peer.lock().replace(peer))
    }

    /// Ends the session. Only the first call does the work; later calls
    /// return `None`.
    async fn teardown(&self, reason: EndReason) -> Option<CallSummary> {
        // (a) duration read + (b) mark ended before anything can await
        let (duration, connected, role) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.ended {
                return None;
            }
            lifecycle.ended = true;
            lifecycle.state = SessionState::Ended;
            lifecycle.status = match &reason {
                EndReason::Failed(CallEngineError::Device(_)) => status::DEVICE_ERROR,
                EndReason::Dropped => status::CONNECTION_LOST,
                _ => status::ENDED,
            }
            .to_string();
            let duration = lifecycle
                .connected_at
                .map(|at| at.elapsed())
                .unwrap_or_default();
            (duration, lifecycle.connected_at.is_some(), lifecycle.role)
        };
        self.cancel.send_replace(true);
        tracing::info!("Ending call {} ({:?})", self.pair_id, reason);
        self.emit(SessionEvent::StateChanged(SessionState::Ended));
        self.emit(SessionEvent::Status(self.lifecycle.lock().status.clone()));

        // (c) devices
        self.media.release_all();
        self.media_changed();

        // (d) connection
        let peer = self.peer.lock().take();
        if let Some(peer) = peer {
            if let Err(e) = peer.close().await {
                tracing::warn!("Closing peer connection failed: {}", e);
            }
        }

        // (e) record, unless it is gone or no longer ours
        if !matches!(reason, EndReason::RemoteHangup | EndReason::Superseded) {
            if let Err(e) = self.delete_record().await {
                tracing::warn!("Could not delete call record {}: {}", self.pair_id, e);
            }
        }

        let summary = CallSummary {
            pair_id: self.pair_id.clone(),
            remote_id: self.remote_id.clone(),
            role,
            dialed: self.dialed,
            is_video: self.media.is_video(),
            connected,
            duration,
            reason,
        };
        self.finished.send_replace(Some(summary.clone()));
        self.emit(SessionEvent::Ended(summary.clone()));
        Some(summary)
    }

    async fn delete_record(&self) -> Result<(), TransportError> {
        let config = &self.ctx.config;
        let store = Arc::clone(&self.ctx.store);
        let pair = self.pair_id.clone();
        with_retry(
            config.publish_attempts,
            config.publish_backoff,
            "Delete call record",
            || {
                let store = Arc::clone(&store);
                let pair = pair.clone();
                async move { store.delete_call(&pair).await }
            },
        )
        .await
    }

    fn view(&self) -> CallView {
        let (state, role, status, connected_at) = {
            let lifecycle = self.lifecycle.lock();
            (
                lifecycle.state,
                lifecycle.role,
                lifecycle.status.clone(),
                lifecycle.connected_at,
            )
        };
        let duration = match self.finished.borrow().as_ref() {
            Some(summary) => summary.duration,
            None => connected_at.map(|at| at.elapsed()).unwrap_or_default(),
        };
        CallView {
            pair_id: self.pair_id.clone(),
            remote_id: self.remote_id.clone(),
            state,
            role,
            status,
            media: self.media.snapshot(),
            duration,
        }
    }
}

// ============================================================================
// SESSION HANDLE
// ============================================================================

enum SessionInput {
    Record(Option<CallRecord>),
    RemoteCandidate(Candidate),
    Peer { epoch: u64, event: PeerEvent },
    Command {
        command: SessionCommand,
        reply: oneshot::Sender<Result<(), CallEngineError>>,
    },
    StoreClosed,
}

/// Handle to a running session
#[derive(Clone)]
pub struct CallSessionHandle {
    core: Arc<SessionCore>,
    inputs: mpsc::UnboundedSender<SessionInput>,
}

pub struct CallSession;

impl CallSession {
    /// Starts the session task. Any older session of the same context
    /// becomes stale from here on.
    pub fn spawn(params: CallParams, ctx: SessionContext) -> CallSessionHandle {
        let generation = ctx.active_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (cancel, _) = watch::channel(false);
        let (events, _) = broadcast::channel(100);
        let (finished, _) = watch::channel(None);
        let (input_tx, inputs) = mpsc::unbounded_channel();

        let core = Arc::new(SessionCore {
            generation,
            pair_id: pair_id(&params.local_id, &params.remote_id),
            local_id: params.local_id,
            remote_id: params.remote_id,
            dialed: params.role == CallRole::Caller,
            media: MediaPipeline::new(Arc::clone(&ctx.devices), params.media_kind.wants_video()),
            ctx,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Idle,
                role: params.role,
                status: status::INITIALIZING.to_string(),
                ended: false,
                connected_at: None,
            }),
            peer: Mutex::new(None),
            cancel,
            events,
            finished,
        });

        let actor = SessionActor {
            core: Arc::clone(&core),
            inputs,
            input_tx: input_tx.clone(),
            media_kind: params.media_kind,
            epoch: 0,
            queue: CandidateQueue::new(),
            initial_offer_sent: false,
            awaiting_answer: false,
            handshake_done: false,
            local_offer: None,
            last_remote_offer: None,
            last_remote_answer: None,
            ice_failures: 0,
            tasks: Vec::new(),
            peer_task: None,
        };
        tokio::spawn(actor.run());

        CallSessionHandle {
            core,
            inputs: input_tx,
        }
    }
}

impl CallSessionHandle {
    pub fn pair_id(&self) -> &str {
        &self.core.pair_id
    }

    pub fn remote_id(&self) -> &str {
        &self.core.remote_id
    }

    pub fn role(&self) -> CallRole {
        self.core.role()
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn is_ended(&self) -> bool {
        self.core.lifecycle.lock().ended
    }

    pub fn snapshot(&self) -> CallView {
        self.core.view()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.core.events.subscribe()
    }

    /// Summary once the session has ended
    pub fn summary(&self) -> Option<CallSummary> {
        self.core.finished.borrow().clone()
    }

    /// Waits for the session to end
    pub async fn finished(&self) -> Option<CallSummary> {
        let mut rx = self.core.finished.subscribe();
        let summary = rx.wait_for(|summary| summary.is_some()).await.ok()?.clone();
        summary
    }

    /// Ends the call from this side. Safe to call any number of times, in
    /// any state; every call returns the same summary.
    pub async fn hangup(&self) -> Option<CallSummary> {
        match self.core.teardown(EndReason::LocalHangup).await {
            Some(summary) => Some(summary),
            None => self.finished().await,
        }
    }

    /// Returns the new muted flag
    pub fn toggle_mute(&self) -> Result<bool, CallEngineError> {
        self.ensure_live()?;
        let muted = self.core.media.toggle_mute();
        self.core.media_changed();
        Ok(muted)
    }

    /// Returns the new speaker flag
    pub fn toggle_speaker(&self) -> Result<bool, CallEngineError> {
        self.ensure_live()?;
        let speaker_on = self.core.media.toggle_speaker();
        self.core.media_changed();
        Ok(speaker_on)
    }

    /// Camera on/off; adds a camera and renegotiates if the call has none
    pub async fn toggle_camera(&self) -> Result<(), CallEngineError> {
        self.command(SessionCommand::ToggleCamera).await
    }

    /// Front/back swap, no-op while the camera is off
    pub async fn switch_camera(&self) -> Result<(), CallEngineError> {
        self.command(SessionCommand::SwitchCamera).await
    }

    async fn command(&self, command: SessionCommand) -> Result<(), CallEngineError> {
        self.ensure_live()?;
        let (reply, rx) = oneshot::channel();
        self.inputs
            .send(SessionInput::Command { command, reply })
            .map_err(|_| CallEngineError::SessionEnded)?;
        rx.await.map_err(|_| CallEngineError::SessionEnded)?
    }

    fn ensure_live(&self) -> Result<(), CallEngineError> {
        if self.is_ended() {
            Err(CallEngineError::SessionEnded)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for CallSessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionHandle")
            .field("pair_id", &self.core.pair_id)
            .field("state", &self.state())
            .field("role", &self.role())
            .finish()
    }
}

// ============================================================================
// SESSION ACTOR
// ============================================================================

struct SessionActor {
    core: Arc<SessionCore>,
    inputs: mpsc::UnboundedReceiver<SessionInput>,
    input_tx: mpsc::UnboundedSender<SessionInput>,
    media_kind: MediaKind,
    /// Bumped with every new connection; events of older ones are ignored
    epoch: u64,
    queue: CandidateQueue,
    initial_offer_sent: bool,
    awaiting_answer: bool,
    handshake_done: bool,
    /// Our latest offer, republished if a racing caller overwrote it
    local_offer: Option<SignalPayload>,
    last_remote_offer: Option<String>,
    last_remote_answer: Option<String>,
    ice_failures: u32,
    tasks: Vec<JoinHandle<()>>,
    peer_task: Option<JoinHandle<()>>,
}

async fn cancelled(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|cancelled| *cancelled).await;
}

impl SessionActor {
    async fn run(mut self) {
        let cancel = self.core.cancel.subscribe();
        let result = tokio::select! {
            _ = cancelled(cancel) => Ok(None),
            result = self.drive() => result,
        };

        let reason = match result {
            Ok(Some(reason)) => Some(reason),
            Ok(None) if !self.core.lifecycle.lock().ended => Some(EndReason::Superseded),
            Ok(None) => None,
            Err(e) => {
                tracing::error!("Call {} failed: {}", self.core.pair_id, e);
                Some(EndReason::Failed(e))
            }
        };
        if let Some(reason) = reason {
            self.core.teardown(reason).await;
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(task) = self.peer_task.take() {
            task.abort();
        }
    }

    async fn drive(&mut self) -> Result<Option<EndReason>, CallEngineError> {
        self.start().await?;

        while let Some(input) = self.inputs.recv().await {
            if !self.core.is_live() {
                return Ok(None);
            }

            let result = match input {
                SessionInput::Record(record) => self.on_record(record).await,
                SessionInput::RemoteCandidate(candidate) => {
                    self.on_remote_candidate(candidate).await;
                    Ok(None)
                }
                SessionInput::Peer { epoch, event } => self.on_peer_event(epoch, event).await,
                SessionInput::Command { command, reply } => {
                    let _ = reply.send(self.on_command(command).await);
                    Ok(None)
                }
                SessionInput::StoreClosed => {
                    if self.core.is_established() {
                        tracing::warn!("Signaling subscription closed mid-call");
                        Ok(None)
                    } else {
                        Err(TransportError::NotConnected.into())
                    }
                }
            };

            match result {
                Ok(None) => {}
                Ok(Some(reason)) => return Ok(Some(reason)),
                Err(_) if !self.core.is_live() => return Ok(None),
                Err(e) if !e.is_fatal_before_connect() || self.core.is_established() => {
                    tracing::warn!("Call {}: {}", self.core.pair_id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    // ========================================================================
    // SETUP
    // ========================================================================

    async fn start(&mut self) -> Result<(), CallEngineError> {
        self.core.transition(SessionState::Initializing);
        self.core.set_status(status::INITIALIZING);

        let want_video = self.media_kind.wants_video();
        self.core.set_status(if want_video {
            status::ACCESSING_CAMERA
        } else {
            status::ACCESSING_MICROPHONE
        });
        if let Err(e) = self.core.media.acquire_local(want_video).await {
            tracing::error!("Local media unavailable: {}", e);
            self.core.set_status(status::DEVICE_ERROR);
            return Err(e.into());
        }
        if !self.core.is_live() {
            return Ok(());
        }
        self.core.media_changed();

        match self.core.role() {
            CallRole::Caller => {
                let record = CallRecord::new(self.core.local_id.clone(), self.media_kind);
                self.publish_call(&record).await?;
                if !self.core.is_live() {
                    // hung up while the publish was in flight
                    let _ = self.core.delete_record().await;
                    return Ok(());
                }
                self.core.transition(SessionState::Offering);
                self.core.set_status(status::CALLING);
            }
            CallRole::Callee => {
                self.core.transition(SessionState::AwaitingOffer);
                self.core.set_status(status::CONNECTING);
            }
        }

        self.open_peer().await?;
        self.subscribe_store().await
    }

    async fn subscribe_store(&mut self) -> Result<(), CallEngineError> {
        let store = &self.core.ctx.store;

        let mut candidates = store
            .watch_candidates(&self.core.pair_id, &self.core.remote_id)
            .await?;
        let tx = self.input_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(candidate) = candidates.recv().await {
                if tx.send(SessionInput::RemoteCandidate(candidate)).is_err() {
                    break;
                }
            }
        }));

        let mut records = store.watch_call(&self.core.pair_id).await?;
        let tx = self.input_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(record) = records.recv().await {
                if tx.send(SessionInput::Record(record)).is_err() {
                    return;
                }
            }
            let _ = tx.send(SessionInput::StoreClosed);
        }));
        Ok(())
    }

    async fn open_peer(&mut self) -> Result<(), CallEngineError> {
        let link = self.core.ctx.peers.create(&self.core.ctx.config).await?;
        let connection = Arc::clone(&link.connection);

        let previous = match self.core.install_peer(Arc::clone(&connection)) {
            Ok(previous) => previous,
            Err(orphan) => {
                let _ = orphan.close().await;
                return Ok(());
            }
        };
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                tracing::warn!("Closing superseded connection failed: {}", e);
            }
        }

        self.epoch += 1;
        let epoch = self.epoch;
        let tx = self.input_tx.clone();
        let mut events = link.events;
        if let Some(task) = self.peer_task.take() {
            task.abort();
        }
        self.peer_task = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(SessionInput::Peer { epoch, event }).is_err() {
                    break;
                }
            }
        }));

        for track in self.core.media.local_tracks() {
            connection.add_track(&track).await?;
        }
        Ok(())
    }

    fn peer(&self) -> Result<Arc<dyn PeerConnection>, CallEngineError> {
        self.core.current_peer().ok_or(CallEngineError::SessionEnded)
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    async fn on_record(
        &mut self,
        record: Option<CallRecord>,
    ) -> Result<Option<EndReason>, CallEngineError> {
        let Some(record) = record else {
            tracing::info!("Call record {} removed by remote", self.core.pair_id);
            return Ok(Some(EndReason::RemoteHangup));
        };
        let me = self.core.local_id.clone();
        let role = self.core.role();

        if role == CallRole::Caller && record.caller_id != me {
            if self.core.state() == SessionState::Offering && !self.handshake_done {
                self.fall_back_to_callee().await?;
            } else {
                tracing::warn!("Call {} superseded by a new attempt", self.core.pair_id);
                return Ok(Some(EndReason::RemoteHangup));
            }
        }

        if self.core.role() == CallRole::Caller && !self.initial_offer_sent {
            self.initial_offer_sent = true;
            self.send_offer(false).await?;
        } else if self.core.role() == CallRole::Caller
            && self.awaiting_answer
            && !self.handshake_done
        {
            if let Some(ours) = self.local_offer.clone() {
                if record.offer.as_ref().map(SignalPayload::sdp) != Some(ours.sdp()) {
                    tracing::info!(
                        "Offer on {} was overwritten, publishing again",
                        self.core.pair_id
                    );
                    self.publish_signal(ours).await?;
                }
            }
        }

        if let Some(offer) = record.offer {
            let fresh = self.last_remote_offer.as_deref() != Some(offer.sdp());
            let acceptable = self.core.role() == CallRole::Callee || self.handshake_done;
            if offer.from != me && fresh && acceptable {
                self.apply_remote_offer(offer).await?;
            }
        }

        if let Some(answer) = record.answer {
            let fresh = self.last_remote_answer.as_deref() != Some(answer.sdp());
            if answer.from != me && self.awaiting_answer && fresh {
                self.apply_remote_answer(answer).await?;
            }
        }

        Ok(None)
    }

    async fn fall_back_to_callee(&mut self) -> Result<(), CallEngineError> {
        tracing::info!(
            "Lost the publish race on {}, answering instead",
            self.core.pair_id
        );
        self.core.lifecycle.lock().role = CallRole::Callee;
        self.core.emit(SessionEvent::RoleChanged(CallRole::Callee));
        self.core.transition(SessionState::AwaitingOffer);
        self.core.set_status(status::CONNECTING);

        self.initial_offer_sent = false;
        self.awaiting_answer = false;
        self.local_offer = None;
        self.last_remote_offer = None;
        self.last_remote_answer = None;
        self.queue.reset();
        self.open_peer().await
    }

    async fn send_offer(&mut self, ice_restart: bool) -> Result<(), CallEngineError> {
        let peer = self.peer()?;
        let offer = peer.create_offer(ice_restart).await?;
        peer.set_local_description(offer.clone()).await?;
        if !self.core.is_live() {
            return Ok(());
        }
        self.awaiting_answer = true;
        tracing::info!(
            "Sending {}offer on {}",
            if ice_restart { "ICE restart " } else { "" },
            self.core.pair_id
        );
        let payload = SignalPayload::new(offer, self.core.local_id.clone());
        self.local_offer = Some(payload.clone());
        self.publish_signal(payload).await
    }

    async fn apply_remote_offer(&mut self, offer: SignalPayload) -> Result<(), CallEngineError> {
        let peer = self.peer()?;
        self.last_remote_offer = Some(offer.sdp().to_string());

        peer.set_remote_description(offer.description).await?;
        if !self.core.is_live() {
            return Ok(());
        }
        self.flush_candidates(&peer).await;

        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        if !self.core.is_live() {
            return Ok(());
        }
        self.handshake_done = true;
        self.publish_signal(SignalPayload::new(answer, self.core.local_id.clone()))
            .await?;

        if self.core.state() == SessionState::AwaitingOffer {
            self.core.transition(SessionState::Negotiating);
        }
        Ok(())
    }

    async fn apply_remote_answer(&mut self, answer: SignalPayload) -> Result<(), CallEngineError> {
        let peer = self.peer()?;
        self.last_remote_answer = Some(answer.sdp().to_string());

        peer.set_remote_description(answer.description).await?;
        if !self.core.is_live() {
            return Ok(());
        }
        self.awaiting_answer = false;
        self.handshake_done = true;
        self.flush_candidates(&peer).await;

        if self.core.state() == SessionState::Offering {
            self.core.transition(SessionState::Negotiating);
        }
        Ok(())
    }

    async fn publish_call(&self, record: &CallRecord) -> Result<(), CallEngineError> {
        let config = &self.core.ctx.config;
        let store = Arc::clone(&self.core.ctx.store);
        let pair = self.core.pair_id.clone();
        with_retry(config.publish_attempts, config.publish_backoff, "Publish call", || {
            let store = Arc::clone(&store);
            let pair = pair.clone();
            let record = record.clone();
            async move { store.publish_call(&pair, &record).await }
        })
        .await?;
        Ok(())
    }

    async fn publish_signal(&self, payload: SignalPayload) -> Result<(), CallEngineError> {
        let config = &self.core.ctx.config;
        let store = Arc::clone(&self.core.ctx.store);
        let pair = self.core.pair_id.clone();
        with_retry(
            config.publish_attempts,
            config.publish_backoff,
            "Publish description",
            || {
                let store = Arc::clone(&store);
                let pair = pair.clone();
                let payload = payload.clone();
                async move { store.attach_signal(&pair, &payload).await }
            },
        )
        .await?;
        Ok(())
    }

    // ========================================================================
    // CANDIDATES
    // ========================================================================

    async fn on_remote_candidate(&mut self, candidate: Candidate) {
        if let Some(candidate) = self.queue.accept(candidate) {
            if let Some(peer) = self.core.current_peer() {
                Self::apply_candidate(peer.as_ref(), candidate).await;
            }
        } else {
            tracing::debug!("Buffered remote candidate ({} pending)", self.queue.len());
        }
    }

    async fn flush_candidates(&mut self, peer: &Arc<dyn PeerConnection>) {
        let pending = self.queue.mark_ready();
        if !pending.is_empty() {
            tracing::debug!("Flushing {} buffered candidate(s)", pending.len());
        }
        for candidate in pending {
            Self::apply_candidate(peer.as_ref(), candidate).await;
        }
    }

    async fn apply_candidate(peer: &dyn PeerConnection, candidate: Candidate) {
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            tracing::warn!("Dropping remote candidate: {}", e);
        }
    }

    // ========================================================================
    // PEER EVENTS
    // ========================================================================

    async fn on_peer_event(
        &mut self,
        epoch: u64,
        event: PeerEvent,
    ) -> Result<Option<EndReason>, CallEngineError> {
        if epoch != self.epoch {
            tracing::debug!("Ignoring event of superseded connection: {:?}", event);
            return Ok(None);
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let result = self
                    .core
                    .ctx
                    .store
                    .append_candidate(&self.core.pair_id, &self.core.local_id, &candidate)
                    .await;
                if let Err(e) = result {
                    tracing::warn!("Could not publish local candidate: {}", e);
                }
                Ok(None)
            }
            PeerEvent::Track(track) => {
                self.core.media.on_remote_track(track);
                self.core.media_changed();
                Ok(None)
            }
            PeerEvent::Connectivity(connectivity) => self.on_connectivity(connectivity).await,
        }
    }

    async fn on_connectivity(
        &mut self,
        connectivity: Connectivity,
    ) -> Result<Option<EndReason>, CallEngineError> {
        match connectivity {
            Connectivity::Checking | Connectivity::Closed => {}

            Connectivity::Connected => {
                let first = {
                    let mut lifecycle = self.core.lifecycle.lock();
                    let first = lifecycle.connected_at.is_none();
                    if first {
                        lifecycle.connected_at = Some(Instant::now());
                    }
                    first
                };
                self.ice_failures = 0;
                if self.core.transition(SessionState::Connected) {
                    self.core.set_status(status::CONNECTED);
                }
                if first {
                    tracing::info!("Call {} connected", self.core.pair_id);
                }
            }

            Connectivity::Lost => {
                if self.core.state() == SessionState::Connected {
                    self.core.transition(SessionState::Reconnecting);
                    self.core.set_status(status::RECONNECTING);
                    self.restart_ice().await?;
                } else {
                    self.core.set_status(status::CONNECTION_LOST);
                }
            }

            Connectivity::Failed => {
                self.ice_failures += 1;
                if self.ice_failures > self.core.ctx.config.max_ice_restarts {
                    tracing::error!(
                        "Call {} dropped after {} failed restart(s)",
                        self.core.pair_id,
                        self.ice_failures - 1
                    );
                    return Ok(Some(EndReason::Dropped));
                }
                if self.core.state() == SessionState::Connected {
                    self.core.transition(SessionState::Reconnecting);
                }
                self.core.set_status(status::RECONNECTING);
                self.restart_ice().await?;
            }
        }
        Ok(None)
    }

    /// The caller drives path restarts; the callee answers them
    async fn restart_ice(&mut self) -> Result<(), CallEngineError> {
        if self.core.role() != CallRole::Caller {
            return Ok(());
        }
        self.send_offer(true).await
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    async fn on_command(&mut self, command: SessionCommand) -> Result<(), CallEngineError> {
        match command {
            SessionCommand::ToggleCamera => {
                if self.core.media.toggle_camera().is_some() {
                    self.core.media_changed();
                    return Ok(());
                }
                self.add_video().await
            }
            SessionCommand::SwitchCamera => {
                let peer = self.peer()?;
                if self.core.media.switch_camera(peer.as_ref()).await?.is_some() {
                    self.core.media_changed();
                }
                Ok(())
            }
        }
    }

    /// Audio-only call going video: new camera track plus a second
    /// offer/answer round
    async fn add_video(&mut self) -> Result<(), CallEngineError> {
        let track = match self.core.media.add_camera().await {
            Ok(track) => track,
            Err(e) => {
                tracing::warn!("Cannot add video: {}", e);
                self.core.set_status(status::DEVICE_ERROR);
                return Err(e.into());
            }
        };

        let peer = self.peer()?;
        if let Err(e) = peer.add_track(&track).await {
            self.core.media.discard_video(&track);
            return Err(e.into());
        }
        self.core.media_changed();
        self.send_offer(false).await
    }
}
