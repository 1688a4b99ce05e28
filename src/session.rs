//! Event-id counter and experiment/session identifiers.
//!
//! The hub is the only writer. Ids start at 1 and are handed out by the
//! dispatcher in dispatch order, so they are strictly increasing with no gaps
//! or repeats for as long as the hub runs.
//!
//! A [`SessionState`] is owned by the hub; [`init`] / [`shutdown`] publish it
//! as the process-wide instance for code that has no hub handle.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug)]
pub struct SessionState {
    next_event_id: AtomicU64,
    experiment_id: AtomicU32,
    session_id: AtomicU32,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            next_event_id: AtomicU64::new(1),
            experiment_id: AtomicU32::new(0),
            session_id: AtomicU32::new(0),
        }
    }

    /// Reserve the next event id.
    pub fn next_event_id(&self) -> u64 {
        self.next_event_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Id the next call to [`next_event_id`](Self::next_event_id) will return.
    pub fn peek_event_id(&self) -> u64 {
        self.next_event_id.load(Ordering::Relaxed)
    }

    pub fn experiment_id(&self) -> u32 {
        self.experiment_id.load(Ordering::Acquire)
    }

    pub fn session_id(&self) -> u32 {
        self.session_id.load(Ordering::Acquire)
    }

    pub fn set_experiment_id(&self, id: u32) {
        self.experiment_id.store(id, Ordering::Release);
    }

    pub fn set_session_id(&self, id: u32) {
        self.session_id.store(id, Ordering::Release);
    }

    pub fn has_session(&self) -> bool {
        self.session_id() != 0
    }
}

static SESSION: Lazy<RwLock<Option<Arc<SessionState>>>> = Lazy::new(|| RwLock::new(None));

/// Publish `state` as the process-wide session state.
pub fn init(state: Arc<SessionState>) {
    let mut slot = SESSION.write().unwrap_or_else(|e| e.into_inner());
    *slot = Some(state);
}

pub fn global() -> Option<Arc<SessionState>> {
    SESSION.read().unwrap_or_else(|e| e.into_inner()).clone()
}

pub fn shutdown() {
    let mut slot = SESSION.write().unwrap_or_else(|e| e.into_inner());
    *slot = None;
}
