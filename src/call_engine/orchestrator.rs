//! Call orchestrator: at most one call across the whole contact list
//!
//! Every contact's pair record is watched through one fan-in channel, so
//! incoming calls from any contact arrive as a single ordered stream.
//! The orchestrator owns the only active session handle and turns each
//! ended session into one `CallOutcome` for the call log.

use super::error::CallEngineError;
use super::outcome::{CallLog, CallOutcome, OutcomeReport};
use super::session::{
    CallParams, CallSession, CallSessionHandle, CallSummary, EndReason, SessionContext,
};
use super::state::CallRole;
use crate::signaling::{pair_id, with_retry, CallRecord, MediaKind};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ============================================================================
// EVENTS
// ============================================================================

/// A record ringing at the local user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub pair_id: String,
    pub caller_id: String,
    pub media_kind: MediaKind,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    IncomingCall(IncomingCall),
    /// The caller gave up before the call was accepted or rejected
    IncomingWithdrawn { pair_id: String, caller_id: String },
    CallStarted {
        pair_id: String,
        remote_id: String,
        role: CallRole,
    },
    CallEnded {
        summary: CallSummary,
        outcome: CallOutcome,
    },
}

/// Outcome of an ended session, from its own side
pub fn classify(summary: &CallSummary) -> CallOutcome {
    if summary.connected {
        return CallOutcome::Completed {
            duration_ms: summary.duration.as_millis() as u64,
        };
    }
    match (summary.role, &summary.reason) {
        // Callee removed the record without ever connecting
        (CallRole::Caller, EndReason::RemoteHangup) => CallOutcome::Rejected,
        // Accepted, then hung up before media flowed. A dialer that lost
        // the simultaneous-call race never accepted anything.
        (CallRole::Callee, EndReason::LocalHangup) if !summary.dialed => CallOutcome::Rejected,
        _ => CallOutcome::Missed,
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

type ContactUpdate = (String, Option<CallRecord>);

#[derive(Default)]
struct OrchestratorState {
    active: Option<CallSessionHandle>,
    incoming: HashMap<String, IncomingCall>,
    /// Pairs whose record delete is in flight from `reject`
    rejecting: HashSet<String>,
    /// Watch task per pair id
    watches: HashMap<String, JoinHandle<()>>,
    /// (callerId, createdAt) already surfaced per pair
    surfaced: HashMap<String, (String, i64)>,
}

struct Inner {
    local_id: String,
    ctx: SessionContext,
    call_log: Arc<dyn CallLog>,
    state: Mutex<OrchestratorState>,
    events: broadcast::Sender<OrchestratorEvent>,
    fan_in: mpsc::UnboundedSender<ContactUpdate>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, task) in self.state.get_mut().watches.drain() {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct CallOrchestrator {
    inner: Arc<Inner>,
}

impl CallOrchestrator {
    pub fn new(
        local_id: impl Into<String>,
        ctx: SessionContext,
        call_log: Arc<dyn CallLog>,
    ) -> Self {
        let (fan_in, mut updates) = mpsc::unbounded_channel::<ContactUpdate>();
        let (events, _) = broadcast::channel(100);
        let inner = Arc::new(Inner {
            local_id: local_id.into(),
            ctx,
            call_log,
            state: Mutex::new(OrchestratorState::default()),
            events,
            fan_in,
        });

        // Dispatcher: one consumer for every contact's record
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some((pair_id, record)) = updates.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                CallOrchestrator { inner }.on_contact_record(pair_id, record).await;
            }
        });

        Self { inner }
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    /// The live session, if any
    pub fn active(&self) -> Option<CallSessionHandle> {
        self.inner
            .state
            .lock()
            .active
            .clone()
            .filter(|handle| !handle.is_ended())
    }

    pub fn incoming_calls(&self) -> Vec<IncomingCall> {
        self.inner.state.lock().incoming.values().cloned().collect()
    }

    // ========================================================================
    // INCOMING CALL FAN-IN
    // ========================================================================

    pub async fn watch_contacts<I, S>(&self, contacts: I) -> Result<(), CallEngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for contact in contacts {
            self.watch_contact(contact.as_ref()).await?;
        }
        Ok(())
    }

    pub async fn watch_contact(&self, contact_id: &str) -> Result<(), CallEngineError> {
        let pair = pair_id(&self.inner.local_id, contact_id);
        // A finished task means the store closed the subscription
        let watching = self
            .inner
            .state
            .lock()
            .watches
            .get(&pair)
            .is_some_and(|task| !task.is_finished());
        if watching {
            return Ok(());
        }

        let mut subscription = self.inner.ctx.store.watch_call(&pair).await?;
        let tx = self.inner.fan_in.clone();
        let task_pair = pair.clone();
        let task = tokio::spawn(async move {
            while let Some(record) = subscription.recv().await {
                if tx.send((task_pair.clone(), record)).is_err() {
                    break;
                }
            }
        });

        let replaced = self.inner.state.lock().watches.insert(pair, task);
        if let Some(replaced) = replaced {
            replaced.abort();
        }
        tracing::debug!("Watching calls from {}", contact_id);
        Ok(())
    }

    pub fn unwatch_contact(&self, contact_id: &str) {
        let pair = pair_id(&self.inner.local_id, contact_id);
        let mut state = self.inner.state.lock();
        if let Some(task) = state.watches.remove(&pair) {
            task.abort();
        }
        state.incoming.remove(&pair);
        state.rejecting.remove(&pair);
        state.surfaced.remove(&pair);
    }

    async fn on_contact_record(&self, pair_id: String, record: Option<CallRecord>) {
        let local_id = &self.inner.local_id;
        match record {
            Some(record) if record.is_incoming_for(local_id) => {
                let incoming = {
                    let mut state = self.inner.state.lock();
                    let in_call_on_pair = state
                        .active
                        .as_ref()
                        .is_some_and(|h| h.pair_id() == pair_id && !h.is_ended());
                    let key = (record.caller_id.clone(), record.created_at);
                    if in_call_on_pair || state.surfaced.get(&pair_id) == Some(&key) {
                        return;
                    }
                    state.surfaced.insert(pair_id.clone(), key);

                    let incoming = IncomingCall {
                        pair_id: pair_id.clone(),
                        caller_id: record.caller_id,
                        media_kind: record.media_kind,
                        created_at: record.created_at,
                    };
                    state.incoming.insert(pair_id, incoming.clone());
                    incoming
                };
                tracing::info!(
                    "Incoming {:?} call from {}",
                    incoming.media_kind,
                    incoming.caller_id
                );
                self.emit(OrchestratorEvent::IncomingCall(incoming));
            }

            // Our own outgoing record
            Some(_) => {
                self.inner.state.lock().incoming.remove(&pair_id);
            }

            None => {
                let withdrawn = {
                    let mut state = self.inner.state.lock();
                    state.surfaced.remove(&pair_id);
                    let incoming = state.incoming.remove(&pair_id);
                    // Our own reject removed it; `reject` logs the outcome
                    incoming.filter(|_| !state.rejecting.contains(&pair_id))
                };
                if let Some(incoming) = withdrawn {
                    tracing::info!("Missed call from {}", incoming.caller_id);
                    self.emit(OrchestratorEvent::IncomingWithdrawn {
                        pair_id: incoming.pair_id.clone(),
                        caller_id: incoming.caller_id.clone(),
                    });
                    self.report(
                        &incoming.pair_id,
                        &incoming.caller_id,
                        CallOutcome::Missed,
                        incoming.media_kind.wants_video(),
                    )
                    .await;
                }
            }
        }
    }

    // ========================================================================
    // CALL CONTROL
    // ========================================================================

    /// Dials `remote_id`. A pending incoming call from the same contact is
    /// dropped; the session sorts out who ends up calling.
    pub fn start_call(
        &self,
        remote_id: &str,
        media_kind: MediaKind,
    ) -> Result<CallSessionHandle, CallEngineError> {
        let handle = {
            let mut state = self.inner.state.lock();
            if Self::busy(&state) {
                return Err(CallEngineError::AlreadyInCall);
            }
            state.incoming.remove(&pair_id(&self.inner.local_id, remote_id));

            let handle = self.spawn_session(remote_id, CallRole::Caller, media_kind);
            state.active = Some(handle.clone());
            handle
        };
        self.on_session_started(&handle);
        Ok(handle)
    }

    pub fn accept(&self, remote_id: &str) -> Result<CallSessionHandle, CallEngineError> {
        let pair = pair_id(&self.inner.local_id, remote_id);
        let handle = {
            let mut state = self.inner.state.lock();
            if Self::busy(&state) {
                return Err(CallEngineError::AlreadyInCall);
            }
            if state.rejecting.contains(&pair) {
                return Err(CallEngineError::NoIncomingCall(remote_id.to_string()));
            }
            let incoming = state
                .incoming
                .remove(&pair)
                .ok_or_else(|| CallEngineError::NoIncomingCall(remote_id.to_string()))?;

            let handle = self.spawn_session(remote_id, CallRole::Callee, incoming.media_kind);
            state.active = Some(handle.clone());
            handle
        };
        self.on_session_started(&handle);
        Ok(handle)
    }

    /// Declines a ringing call: the record is deleted without a session
    /// ever being created. If the delete fails the call keeps ringing and
    /// can still be accepted or rejected again.
    pub async fn reject(&self, remote_id: &str) -> Result<(), CallEngineError> {
        let pair = pair_id(&self.inner.local_id, remote_id);
        let incoming = {
            let mut state = self.inner.state.lock();
            let incoming = state
                .incoming
                .get(&pair)
                .cloned()
                .ok_or_else(|| CallEngineError::NoIncomingCall(remote_id.to_string()))?;
            if !state.rejecting.insert(pair.clone()) {
                return Err(CallEngineError::NoIncomingCall(remote_id.to_string()));
            }
            incoming
        };

        let config = &self.inner.ctx.config;
        let store = Arc::clone(&self.inner.ctx.store);
        let deleted =
            with_retry(config.publish_attempts, config.publish_backoff, "Reject call", || {
                let store = Arc::clone(&store);
                let pair = pair.clone();
                async move { store.delete_call(&pair).await }
            })
            .await;

        {
            let mut state = self.inner.state.lock();
            state.rejecting.remove(&pair);
            if deleted.is_ok() {
                state.incoming.remove(&pair);
            }
        }
        deleted?;

        tracing::info!("Rejected call from {}", incoming.caller_id);
        self.report(
            &pair,
            &incoming.caller_id,
            CallOutcome::Rejected,
            incoming.media_kind.wants_video(),
        )
        .await;
        Ok(())
    }

    /// Hangs up the active call
    pub async fn hangup(&self) -> Result<CallSummary, CallEngineError> {
        let handle = self.active().ok_or(CallEngineError::NoActiveCall)?;
        handle.hangup().await.ok_or(CallEngineError::SessionEnded)
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// A session counts until its summary exists: teardown may still be
    /// deleting the pair record a new call would publish.
    fn busy(state: &OrchestratorState) -> bool {
        state.active.as_ref().is_some_and(|h| h.summary().is_none())
    }

    fn spawn_session(
        &self,
        remote_id: &str,
        role: CallRole,
        media_kind: MediaKind,
    ) -> CallSessionHandle {
        CallSession::spawn(
            CallParams {
                local_id: self.inner.local_id.clone(),
                remote_id: remote_id.to_string(),
                role,
                media_kind,
            },
            self.inner.ctx.clone(),
        )
    }

    fn on_session_started(&self, handle: &CallSessionHandle) {
        self.emit(OrchestratorEvent::CallStarted {
            pair_id: handle.pair_id().to_string(),
            remote_id: handle.remote_id().to_string(),
            role: handle.role(),
        });

        let orchestrator = self.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            let Some(summary) = handle.finished().await else {
                return;
            };
            {
                let mut state = orchestrator.inner.state.lock();
                if state
                    .active
                    .as_ref()
                    .is_some_and(|h| h.pair_id() == summary.pair_id && h.is_ended())
                {
                    state.active = None;
                }
            }

            let outcome = classify(&summary);
            orchestrator
                .report(&summary.pair_id, &summary.remote_id, outcome, summary.is_video)
                .await;
            orchestrator.emit(OrchestratorEvent::CallEnded { summary, outcome });
        });
    }

    async fn report(&self, pair_id: &str, remote_id: &str, outcome: CallOutcome, is_video: bool) {
        self.inner
            .call_log
            .on_call_outcome(OutcomeReport {
                pair_id: pair_id.to_string(),
                remote_id: remote_id.to_string(),
                outcome,
                is_video,
            })
            .await;
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.inner.events.send(event);
    }
}

impl std::fmt::Debug for CallOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CallOrchestrator")
            .field("local_id", &self.inner.local_id)
            .field("active", &state.active)
            .field("incoming", &state.incoming.len())
            .field("watching", &state.watches.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn summary(role: CallRole, connected: bool, reason: EndReason) -> CallSummary {
        CallSummary {
            pair_id: "A_B".to_string(),
            remote_id: "B".to_string(),
            role,
            dialed: role == CallRole::Caller,
            is_video: false,
            connected,
            duration: Duration::from_millis(if connected { 65_000 } else { 0 }),
            reason,
        }
    }

    #[test]
    fn test_classify_connected_is_completed() {
        for role in [CallRole::Caller, CallRole::Callee] {
            assert_eq!(
                classify(&summary(role, true, EndReason::RemoteHangup)),
                CallOutcome::Completed { duration_ms: 65_000 }
            );
        }
    }

    #[test]
    fn test_classify_unconnected() {
        assert_eq!(
            classify(&summary(CallRole::Caller, false, EndReason::LocalHangup)),
            CallOutcome::Missed
        );
        assert_eq!(
            classify(&summary(CallRole::Caller, false, EndReason::RemoteHangup)),
            CallOutcome::Rejected
        );
        assert_eq!(
            classify(&summary(CallRole::Callee, false, EndReason::RemoteHangup)),
            CallOutcome::Missed
        );
        assert_eq!(
            classify(&summary(CallRole::Callee, false, EndReason::LocalHangup)),
            CallOutcome::Rejected
        );
        assert_eq!(
            classify(&summary(CallRole::Caller, false, EndReason::Dropped)),
            CallOutcome::Missed
        );
    }

    #[test]
    fn test_classify_dialer_that_fell_back_to_answering() {
        let mut lost_race = summary(CallRole::Callee, false, EndReason::LocalHangup);
        lost_race.dialed = true;
        assert_eq!(classify(&lost_race), CallOutcome::Missed);

        lost_race.reason = EndReason::RemoteHangup;
        assert_eq!(classify(&lost_race), CallOutcome::Missed);

        lost_race.connected = true;
        lost_race.duration = Duration::from_secs(3);
        assert_eq!(
            classify(&lost_race),
            CallOutcome::Completed { duration_ms: 3_000 }
        );
    }
}
