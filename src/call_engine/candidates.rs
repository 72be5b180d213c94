//! Buffer for remote candidates that arrive before a remote description

use crate::signaling::Candidate;
use std::collections::VecDeque;

/// Holds candidates in arrival order until the remote description is set,
/// then lets every later candidate straight through.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<Candidate>,
    ready: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the candidate back if it can be applied right away
    pub fn accept(&mut self, candidate: Candidate) -> Option<Candidate> {
        if self.ready {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Switches to pass-through and hands out everything buffered, oldest
    /// first. Later calls return nothing.
    pub fn mark_ready(&mut self) -> Vec<Candidate> {
        self.ready = true;
        self.pending.drain(..).collect()
    }

    /// Back to buffering for a fresh local connection. Anything still
    /// buffered stays: it describes the remote side, which did not change.
    pub fn reset(&mut self) {
        self.ready = false;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
