//! Session state publisher.
//!
//! Write-only snapshot sink for out-of-process readers (dashboards,
//! humans with `jq`). Every mutation atomically replaces the blob; the
//! scheduler never reads it back.

use std::sync::Mutex;

use serde::Serialize;

use crate::clock::unix_now;
use crate::ledger::basename;
use crate::persist::JsonStore;

/// The published blob. Field names are the out-of-process contract.
#[derive(Debug, Clone, Default, Serialize)]
struct SessionSnapshot {
    active: bool,
    uploader: String,
    current_credential: String,
    credential_index: usize,
    credential_total: usize,
    stage: u32,
    strategy: String,
    started_at: u64,
    ended_at: Option<u64>,
    duration_seconds: Option<u64>,
    credentials_used: Vec<String>,
}

/// Publisher for `session_state.json`.
pub struct SessionPublisher {
    store: JsonStore,
    state: Mutex<SessionSnapshot>,
}

impl SessionPublisher {
    /// Create a publisher writing to the given store.
    pub fn new(store: JsonStore) -> Self {
        Self {
            store,
            state: Mutex::new(SessionSnapshot::default()),
        }
    }

    /// Mark a session as started for an uploader.
    pub fn start_session(&self, uploader: &str, credential_total: usize) {
        let mut state = self.state.lock().expect("publisher lock poisoned");
        *state = SessionSnapshot {
            active: true,
            uploader: uploader.to_string(),
            credential_total,
            stage: 1,
            started_at: unix_now(),
            ..SessionSnapshot::default()
        };
        self.store.save(&*state);
    }

    /// Record the credential now driving the session.
    pub fn update_credential(&self, index: usize, credential: &str, total: usize) {
        let mut state = self.state.lock().expect("publisher lock poisoned");
        if !state.active {
            return;
        }
        let name = basename(credential).to_string();
        state.credential_index = index;
        state.credential_total = total;
        state.current_credential = name.clone();
        if !state.credentials_used.contains(&name) {
            state.credentials_used.push(name);
        }
        self.store.save(&*state);
    }

    /// Record the stage number and its strategy tag.
    pub fn update_stage(&self, stage: u32, strategy: &str) {
        let mut state = self.state.lock().expect("publisher lock poisoned");
        if !state.active {
            return;
        }
        state.stage = stage;
        state.strategy = strategy.to_string();
        self.store.save(&*state);
    }

    /// Mark the session as ended.
    pub fn end_session(&self) {
        let mut state = self.state.lock().expect("publisher lock poisoned");
        if !state.active {
            return;
        }
        state.active = false;
        let now = unix_now();
        state.ended_at = Some(now);
        state.duration_seconds = Some(now.saturating_sub(state.started_at));
        self.store.save(&*state);
    }
}

// =============================================================================
// Tests
// =============================================================================
