//! Ban set: durable suspension deadlines for credentials.
//!
//! A credential is banned iff a deadline is recorded and still in the
//! future. `refresh` runs before every credential selection so bans that
//! lapsed since the last pass are visible, and `clear_for` takes the quota
//! ledger's sweep output so an expired quota window always clears the
//! paired ban before selection observes state.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::{debug, info};

use crate::clock::unix_now;
use crate::ledger::basename;
use crate::persist::JsonStore;

type BanMap = BTreeMap<String, BTreeMap<String, u64>>;

struct BanInner {
    bans: BanMap,
    store: JsonStore,
}

/// Durable set of suspended credentials, keyed `(uploader, credential)`.
pub struct BanSet {
    inner: Mutex<BanInner>,
}

impl BanSet {
    /// Open the ban set, loading any previous snapshot from `store`.
    pub fn open(store: JsonStore) -> Self {
        let bans: BanMap = store.load_or_default();
        Self {
            inner: Mutex::new(BanInner { bans, store }),
        }
    }

    /// Suspend a credential until the given unix time.
    pub fn ban(&self, uploader: &str, credential: &str, unban_at: u64) {
        let mut inner = self.inner.lock().expect("ban lock poisoned");
        info!(
            uploader,
            credential = %basename(credential),
            unban_at,
            "Credential banned"
        );
        inner
            .bans
            .entry(uploader.to_string())
            .or_default()
            .insert(credential.to_string(), unban_at);
        inner.store.save(&inner.bans);
    }

    /// Lift a credential's suspension, if any.
    pub fn unban(&self, uploader: &str, credential: &str) {
        let mut inner = self.inner.lock().expect("ban lock poisoned");
        let removed = inner
            .bans
            .get_mut(uploader)
            .and_then(|m| m.remove(credential))
            .is_some();
        if removed {
            debug!(uploader, credential = %basename(credential), "Credential unbanned");
            inner.store.save(&inner.bans);
        }
    }

    /// Whether the credential is currently suspended.
    pub fn is_banned(&self, uploader: &str, credential: &str) -> bool {
        self.is_banned_at(uploader, credential, unix_now())
    }

    /// Drop every lapsed ban, returning the keys that just became
    /// available. Called before credential selection.
    pub fn refresh(&self) -> Vec<(String, String)> {
        self.refresh_at(unix_now())
    }

    /// Clear bans paired with quota records the ledger just expired.
    pub fn clear_for(&self, expired: &[(String, String)]) {
        if expired.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().expect("ban lock poisoned");
        let mut changed = false;
        for (uploader, credential) in expired {
            if let Some(map) = inner.bans.get_mut(uploader)
                && map.remove(credential).is_some()
            {
                info!(
                    uploader = %uploader,
                    credential = %basename(credential),
                    "Ban cleared with expired quota window"
                );
                changed = true;
            }
        }
        if changed {
            inner.bans.retain(|_, map| !map.is_empty());
            inner.store.save(&inner.bans);
        }
    }

    /// Drop records for credentials no longer present in the pool.
    pub fn retain_credentials(&self, uploader: &str, keep: &[String]) {
        let mut inner = self.inner.lock().expect("ban lock poisoned");
        let mut changed = false;
        if let Some(map) = inner.bans.get_mut(uploader) {
            let before = map.len();
            map.retain(|credential, _| keep.iter().any(|k| k == credential));
            changed = map.len() != before;
        }
        if changed {
            inner.store.save(&inner.bans);
        }
    }

    /// Earliest unban time among the uploader's suspended credentials.
    pub fn earliest_unban(&self, uploader: &str) -> Option<u64> {
        let inner = self.inner.lock().expect("ban lock poisoned");
        inner
            .bans
            .get(uploader)
            .and_then(|m| m.values().min().copied())
    }

    pub(crate) fn is_banned_at(&self, uploader: &str, credential: &str, now: u64) -> bool {
        let inner = self.inner.lock().expect("ban lock poisoned");
        inner
            .bans
            .get(uploader)
            .and_then(|m| m.get(credential))
            .is_some_and(|unban_at| now < *unban_at)
    }

    pub(crate) fn refresh_at(&self, now: u64) -> Vec<(String, String)> {
        let mut inner = self.inner.lock().expect("ban lock poisoned");
        let mut lifted = Vec::new();

        for (uploader, map) in inner.bans.iter_mut() {
            map.retain(|credential, unban_at| {
                if now >= *unban_at {
                    info!(
                        uploader = %uploader,
                        credential = %basename(credential),
                        "Ban expired"
                    );
                    lifted.push((uploader.clone(), credential.clone()));
                    false
                } else {
                    true
                }
            });
        }
        inner.bans.retain(|_, map| !map.is_empty());

        if !lifted.is_empty() {
            inner.store.save(&inner.bans);
        }
        lifted
    }
}

// =============================================================================
// Tests
// =============================================================================
