//! Quota ledger: durable per-credential rolling 24 h byte counters.
//!
//! The ledger is the sole writer of `sa_quota_cache.json`. Every `add`
//! persists inside the same critical section as the in-memory update, so a
//! crash between two file-complete events never loses accounted bytes.
//! Expiry is lazy: a record whose window has passed is logically zero and
//! is dropped the next time it is observed.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::unix_now;
use crate::constants::{QUOTA_WINDOW, SAFETY_MARGIN_FRACTION};
use crate::persist::JsonStore;

/// One credential's usage within its current window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// Bytes accounted in the current window. Never exceeds the cap.
    pub bytes: u64,
    /// Unix time the window opened.
    pub window_start: u64,
    /// Unix time the window expires.
    pub reset_time: u64,
    /// Unix time of the first accounted upload.
    pub first_upload: u64,
}

type QuotaMap = BTreeMap<String, BTreeMap<String, QuotaRecord>>;

struct LedgerInner {
    usage: QuotaMap,
    store: JsonStore,
}

/// Durable quota accounting, safe to share between the stream reader and
/// the session loop.
pub struct QuotaLedger {
    cap: u64,
    inner: Mutex<LedgerInner>,
}

impl QuotaLedger {
    /// Open the ledger, loading any previous snapshot from `store`.
    pub fn open(store: JsonStore, cap: u64) -> Self {
        let usage: QuotaMap = store.load_or_default();
        let ledger = Self {
            cap,
            inner: Mutex::new(LedgerInner { usage, store }),
        };
        // Drop windows that expired while the orchestrator was down.
        let expired = ledger.sweep();
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired quota windows on startup");
        }
        ledger
    }

    /// The configured per-credential cap in bytes.
    pub fn cap(&self) -> u64 {
        self.cap
    }

    /// Bytes held back from every stage cap.
    pub fn safety_margin(&self) -> u64 {
        (self.cap as f64 * SAFETY_MARGIN_FRACTION) as u64
    }

    /// Account `bytes` against `(uploader, credential)`, persisting in the
    /// same critical section.
    pub fn add(&self, uploader: &str, credential: &str, bytes: u64) {
        self.add_at(uploader, credential, bytes, unix_now());
    }

    /// Remaining quota for `(uploader, credential)` after lazy expiry.
    pub fn remaining(&self, uploader: &str, credential: &str) -> u64 {
        self.remaining_at(uploader, credential, unix_now())
    }

    /// Whether the credential still has usable quota beyond the safety
    /// margin.
    pub fn eligible(&self, uploader: &str, credential: &str) -> bool {
        self.remaining(uploader, credential) > self.safety_margin()
    }

    /// Drop every expired record, returning the affected keys so the ban
    /// set can clear its side in the same logical step. Idempotent.
    pub fn sweep(&self) -> Vec<(String, String)> {
        self.sweep_at(unix_now())
    }

    /// Expiry time of the credential's current window, if one is open.
    pub fn reset_time(&self, uploader: &str, credential: &str) -> Option<u64> {
        let inner = self.inner.lock().expect("ledger lock poisoned");
        inner
            .usage
            .get(uploader)
            .and_then(|m| m.get(credential))
            .map(|r| r.reset_time)
    }

    /// Drop records for credentials no longer present in the pool.
    pub fn retain_credentials(&self, uploader: &str, keep: &[String]) {
        let mut inner = self.inner.lock().expect("ledger lock poisoned");
        let mut changed = false;
        if let Some(map) = inner.usage.get_mut(uploader) {
            let before = map.len();
            map.retain(|credential, _| keep.iter().any(|k| k == credential));
            changed = map.len() != before;
        }
        if changed {
            inner.store.save(&inner.usage);
        }
    }

    pub(crate) fn add_at(&self, uploader: &str, credential: &str, bytes: u64, now: u64) {
        let mut inner = self.inner.lock().expect("ledger lock poisoned");
        let record = inner
            .usage
            .entry(uploader.to_string())
            .or_default()
            .entry(credential.to_string())
            .or_insert_with(|| QuotaRecord {
                bytes: 0,
                window_start: now,
                reset_time: now + QUOTA_WINDOW.as_secs(),
                first_upload: now,
            });

        if now >= record.reset_time {
            // The old window lapsed unobserved; this upload opens a new one.
            *record = QuotaRecord {
                bytes: 0,
                window_start: now,
                reset_time: now + QUOTA_WINDOW.as_secs(),
                first_upload: now,
            };
        }

        record.bytes = record.bytes.saturating_add(bytes).min(self.cap);
        debug!(
            uploader,
            credential = %basename(credential),
            used = record.bytes,
            cap = self.cap,
            "Quota updated"
        );
        inner.store.save(&inner.usage);
    }

    pub(crate) fn remaining_at(&self, uploader: &str, credential: &str, now: u64) -> u64 {
        let mut inner = self.inner.lock().expect("ledger lock poisoned");
        let used = match inner.usage.get_mut(uploader) {
            Some(map) => match map.get(credential) {
                Some(record) if now >= record.reset_time => {
                    map.remove(credential);
                    0
                }
                Some(record) => record.bytes,
                None => 0,
            },
            None => 0,
        };
        self.cap.saturating_sub(used)
    }

    pub(crate) fn sweep_at(&self, now: u64) -> Vec<(String, String)> {
        let mut inner = self.inner.lock().expect("ledger lock poisoned");
        let mut expired = Vec::new();

        for (uploader, map) in inner.usage.iter_mut() {
            map.retain(|credential, record| {
                if now >= record.reset_time {
                    info!(
                        uploader = %uploader,
                        credential = %basename(credential),
                        "Quota window expired"
                    );
                    expired.push((uploader.clone(), credential.clone()));
                    false
                } else {
                    true
                }
            });
        }
        inner.usage.retain(|_, map| !map.is_empty());

        if !expired.is_empty() {
            inner.store.save(&inner.usage);
        }
        expired
    }
}

/// Final path component of a credential id, for log lines.
pub(crate) fn basename(credential: &str) -> &str {
    credential.rsplit('/').next().unwrap_or(credential)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::GIB;
    use proptest::prelude::*;

    const CAP: u64 = 750 * GIB;
    const DAY: u64 = 24 * 60 * 60;

    fn ledger(dir: &tempfile::TempDir) -> QuotaLedger {
        QuotaLedger::open(JsonStore::new(dir.path().join("sa_quota_cache.json")), CAP)
    }

    #[test]
    fn fresh_credential_has_full_quota() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);
        assert_eq!(ledger.remaining("gdrive", "sa-1.json"), CAP);
        assert!(ledger.eligible("gdrive", "sa-1.json"));
    }

    #[test]
    fn add_reduces_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);

        ledger.add_at("gdrive", "sa-1.json", 200 * GIB, 1000);
        assert_eq!(ledger.remaining_at("gdrive", "sa-1.json", 1001), 550 * GIB);
    }

    #[test]
    fn eligibility_honors_safety_margin() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);

        let margin = ledger.safety_margin();
        ledger.add_at("gdrive", "sa-1.json", CAP - margin, 1000);
        assert!(!ledger.eligible("gdrive", "sa-1.json"));
    }

    #[test]
    fn expired_window_reads_as_full() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);

        ledger.add_at("gdrive", "sa-1.json", 700 * GIB, 1000);
        assert_eq!(
            ledger.remaining_at("gdrive", "sa-1.json", 1000 + DAY),
            CAP
        );
    }

    #[test]
    fn add_after_expiry_opens_new_window() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);

        ledger.add_at("gdrive", "sa-1.json", 700 * GIB, 1000);
        ledger.add_at("gdrive", "sa-1.json", 5 * GIB, 1000 + DAY + 1);
        assert_eq!(
            ledger.remaining_at("gdrive", "sa-1.json", 1000 + DAY + 2),
            CAP - 5 * GIB
        );
        assert_eq!(
            ledger.reset_time("gdrive", "sa-1.json"),
            Some(1000 + DAY + 1 + DAY)
        );
    }

    #[test]
    fn sweep_returns_expired_keys_once() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);

        ledger.add_at("gdrive", "sa-1.json", GIB, 1000);
        ledger.add_at("gdrive", "sa-2.json", GIB, 2000);

        let expired = ledger.sweep_at(1000 + DAY);
        assert_eq!(
            expired,
            vec![("gdrive".to_string(), "sa-1.json".to_string())]
        );

        // Idempotent: a second sweep finds nothing new.
        assert!(ledger.sweep_at(1000 + DAY).is_empty());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = ledger(&dir);
            ledger.add("gdrive", "sa-1.json", 42 * GIB);
        }
        let reopened = ledger(&dir);
        assert_eq!(reopened.remaining("gdrive", "sa-1.json"), CAP - 42 * GIB);
    }

    #[test]
    fn retain_credentials_drops_stale_records() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);

        ledger.add_at("gdrive", "sa-1.json", GIB, 1000);
        ledger.add_at("gdrive", "sa-gone.json", GIB, 1000);

        ledger.retain_credentials("gdrive", &["sa-1.json".to_string()]);
        assert_eq!(ledger.remaining_at("gdrive", "sa-gone.json", 1001), CAP);
        assert_eq!(ledger.remaining_at("gdrive", "sa-1.json", 1001), CAP - GIB);
    }

    #[test]
    fn basename_strips_directories() {
        assert_eq!(basename("/opt/sa/sa-1.json"), "sa-1.json");
        assert_eq!(basename("sa-1.json"), "sa-1.json");
    }

    // Reference-model property: under any interleaving of adds, sweeps,
    // and time advances, accounted bytes never exceed the cap and always
    // match a naive model.
    #[derive(Debug, Clone)]
    enum Op {
        Add { cred: u8, bytes: u64, dt: u64 },
        Sweep { dt: u64 },
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..3, 0u64..(400 * GIB), 0u64..(2 * DAY))
                .prop_map(|(cred, bytes, dt)| Op::Add { cred, bytes, dt }),
            (0u64..(2 * DAY)).prop_map(|dt| Op::Sweep { dt }),
        ]
    }

    proptest! {
        #[test]
        fn quota_never_exceeds_cap(ops in prop::collection::vec(arb_op(), 1..40)) {
            let dir = tempfile::tempdir().unwrap();
            let ledger = ledger(&dir);

            // Model: credential -> (bytes, reset_time).
            let mut model: std::collections::HashMap<u8, (u64, u64)> =
                std::collections::HashMap::new();
            let mut now = 1_000_000u64;

            for op in ops {
                match op {
                    Op::Add { cred, bytes, dt } => {
                        now += dt;
                        let name = format!("sa-{cred}.json");
                        ledger.add_at("gdrive", &name, bytes, now);

                        let entry = model.entry(cred).or_insert((0, now + DAY));
                        if now >= entry.1 {
                            *entry = (0, now + DAY);
                        }
                        entry.0 = entry.0.saturating_add(bytes).min(CAP);
                    }
                    Op::Sweep { dt } => {
                        now += dt;
                        ledger.sweep_at(now);
                        model.retain(|_, (_, reset)| now < *reset);
                    }
                }

                for (cred, (bytes, reset)) in &model {
                    let name = format!("sa-{cred}.json");
                    let expected = if now >= *reset { 0 } else { *bytes };
                    let remaining = ledger.remaining_at("gdrive", &name, now);
                    prop_assert!(CAP - remaining <= CAP);
                    prop_assert_eq!(CAP - remaining, expected);
                }
            }
        }
    }
}
