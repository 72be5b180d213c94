//! In-process synchronized store
//!
//! Implements the signaling contract with plain maps guarded by a mutex.
//! Two engines in the same process (or a test) can call each other through
//! one shared instance.

use super::messages::{CallRecord, Candidate, SignalPayload};
use super::store::{SignalingStore, Subscription, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

type CandidateKey = (String, String);

#[derive(Default)]
struct Inner {
    records: HashMap<String, CallRecord>,
    candidates: HashMap<CandidateKey, Vec<Candidate>>,
    call_watchers: HashMap<String, Vec<mpsc::UnboundedSender<Option<CallRecord>>>>,
    candidate_watchers: HashMap<CandidateKey, Vec<mpsc::UnboundedSender<Candidate>>>,
    deletes: HashMap<String, usize>,
    signal_writes: HashMap<String, usize>,
}

impl Inner {
    fn notify_call(&mut self, pair_id: &str) {
        let value = self.records.get(pair_id).cloned();
        if let Some(watchers) = self.call_watchers.get_mut(pair_id) {
            watchers.retain(|tx| tx.send(value.clone()).is_ok());
        }
    }

    fn drop_candidates(&mut self, pair_id: &str) {
        self.candidates.retain(|(pair, _), _| pair != pair_id);
    }
}

/// Shared in-memory signaling store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing the connection to the store: every operation fails
    /// with `TransportError::Unreachable` until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Ends every open watch, as a dropped relay connection does. Stored
    /// data stays.
    pub fn close_subscriptions(&self) {
        let mut inner = self.inner.lock();
        inner.call_watchers.clear();
        inner.candidate_watchers.clear();
    }

    pub fn record(&self, pair_id: &str) -> Option<CallRecord> {
        self.inner.lock().records.get(pair_id).cloned()
    }

    pub fn candidates(&self, pair_id: &str, owner_id: &str) -> Vec<Candidate> {
        self.inner
            .lock()
            .candidates
            .get(&(pair_id.to_string(), owner_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of times a record for the pair was deleted
    pub fn delete_count(&self, pair_id: &str) -> usize {
        self.inner.lock().deletes.get(pair_id).copied().unwrap_or(0)
    }

    /// Number of offers and answers written for the pair
    pub fn signal_writes(&self, pair_id: &str) -> usize {
        self.inner.lock().signal_writes.get(pair_id).copied().unwrap_or(0)
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(TransportError::Unreachable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn publish_call(
        &self,
        pair_id: &str,
        record: &CallRecord,
    ) -> Result<(), TransportError> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.records.insert(pair_id.to_string(), record.clone());
        inner.drop_candidates(pair_id);
        inner.notify_call(pair_id);
        tracing::debug!("Published call record {} (caller {})", pair_id, record.caller_id);
        Ok(())
    }

    async fn attach_signal(
        &self,
        pair_id: &str,
        payload: &SignalPayload,
    ) -> Result<(), TransportError> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        match inner.records.get_mut(pair_id) {
            Some(record) => record.attach(payload.clone()),
            None => {
                tracing::debug!("Dropping {:?} for ended call {}", payload.kind(), pair_id);
                return Ok(());
            }
        }
        *inner.signal_writes.entry(pair_id.to_string()).or_default() += 1;
        inner.notify_call(pair_id);
        Ok(())
    }

    async fn watch_call(
        &self,
        pair_id: &str,
    ) -> Result<Subscription<Option<CallRecord>>, TransportError> {
        self.check_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let _ = tx.send(inner.records.get(pair_id).cloned());
        inner
            .call_watchers
            .entry(pair_id.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }

    async fn append_candidate(
        &self,
        pair_id: &str,
        owner_id: &str,
        candidate: &Candidate,
    ) -> Result<(), TransportError> {
        self.check_online()?;
        let key = (pair_id.to_string(), owner_id.to_string());
        let mut inner = self.inner.lock();
        inner
            .candidates
            .entry(key.clone())
            .or_default()
            .push(candidate.clone());
        if let Some(watchers) = inner.candidate_watchers.get_mut(&key) {
            watchers.retain(|tx| tx.send(candidate.clone()).is_ok());
        }
        Ok(())
    }

    async fn watch_candidates(
        &self,
        pair_id: &str,
        owner_id: &str,
    ) -> Result<Subscription<Candidate>, TransportError> {
        self.check_online()?;
        let key = (pair_id.to_string(), owner_id.to_string());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.candidates.get(&key) {
            for candidate in existing {
                let _ = tx.send(candidate.clone());
            }
        }
        inner.candidate_watchers.entry(key).or_default().push(tx);
        Ok(Subscription::new(rx))
    }

    async fn delete_call(&self, pair_id: &str) -> Result<(), TransportError> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.records.remove(pair_id);
        inner.drop_candidates(pair_id);
        *inner.deletes.entry(pair_id.to_string()).or_default() += 1;
        inner.notify_call(pair_id);
        tracing::debug!("Deleted call record {}", pair_id);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryStore")
            .field("records", &inner.records.len())
            .field("offline", &self.offline.load(Ordering::SeqCst))
            .finish()
    }
}
