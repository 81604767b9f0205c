//! File-size distribution tracking.
//!
//! Keeps a reservoir sample of observed sizes plus exact per-bucket
//! counters, cheap enough to feed from the live event stream. Two
//! independent trackers exist per uploader: the *queue* tracker (fed from
//! the control-plane's checking/transferring arrays before transfers
//! begin) drives strategy selection; the *history* tracker (fed from
//! completed transfers) is analytic only.

use std::collections::BTreeMap;
use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clock::unix_now;
use crate::constants::{BUCKET_BOUNDS, BUCKET_LABELS, CONFIDENCE_THRESHOLDS, RESERVOIR_SIZE};
use crate::persist::JsonStore;

/// How trustworthy a snapshot is, keyed by sample count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl Confidence {
    fn from_count(count: u64) -> Self {
        let (medium, high, very_high) = CONFIDENCE_THRESHOLDS;
        if count > very_high {
            Confidence::VeryHigh
        } else if count > high {
            Confidence::High
        } else if count > medium {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

/// Which stream a snapshot was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleSource {
    CheckerQueue,
    CompletedTransfers,
}

/// Percentile estimates from the reservoir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: u64,
    pub p75: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
}

/// Exact counts for one size bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketStat {
    pub label: String,
    pub count: u64,
    pub total_bytes: u64,
}

/// Point-in-time summary of an observed size distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionSnapshot {
    pub count: u64,
    pub total_bytes: u64,
    pub max_size: u64,
    pub percentiles: Percentiles,
    pub size_buckets: Vec<BucketStat>,
    /// Share of 50 GiB+ files by count, 0.0..=1.0.
    pub large_file_fraction: f64,
    pub confidence: Confidence,
    pub source: SampleSource,
    pub captured_at: u64,
}

impl DistributionSnapshot {
    /// Whether the snapshot is reliable enough to drive strategy
    /// selection.
    pub fn is_actionable(&self) -> bool {
        self.confidence >= Confidence::Medium
    }
}

/// Reservoir-sampled size tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionTracker {
    reservoir: Vec<u64>,
    reservoir_size: usize,
    count: u64,
    total_bytes: u64,
    max_size: u64,
    bucket_counts: [u64; 5],
    bucket_totals: [u64; 5],
}

impl Default for DistributionTracker {
    fn default() -> Self {
        Self::new(RESERVOIR_SIZE)
    }
}

impl DistributionTracker {
    /// Create a tracker with the given reservoir capacity.
    pub fn new(reservoir_size: usize) -> Self {
        Self {
            reservoir: Vec::new(),
            reservoir_size: reservoir_size.max(1),
            count: 0,
            total_bytes: 0,
            max_size: 0,
            bucket_counts: [0; 5],
            bucket_totals: [0; 5],
        }
    }

    /// Record one observed size. O(1) expected.
    pub fn observe(&mut self, size: u64) {
        self.count += 1;
        self.total_bytes = self.total_bytes.saturating_add(size);
        self.max_size = self.max_size.max(size);

        let bucket = bucket_index(size);
        self.bucket_counts[bucket] += 1;
        self.bucket_totals[bucket] = self.bucket_totals[bucket].saturating_add(size);

        if self.reservoir.len() < self.reservoir_size {
            self.reservoir.push(size);
        } else {
            let j = rand::thread_rng().gen_range(0..self.count);
            if (j as usize) < self.reservoir_size {
                self.reservoir[j as usize] = size;
            }
        }
    }

    /// Number of observed samples.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Summarize the current state, or `None` if nothing was observed.
    pub fn snapshot(&self, source: SampleSource) -> Option<DistributionSnapshot> {
        if self.count == 0 {
            return None;
        }

        let mut sorted = self.reservoir.clone();
        sorted.sort_unstable();
        let percentile = |p: u64| -> u64 {
            let idx = (sorted.len() as u64 * p / 100) as usize;
            sorted[idx.min(sorted.len() - 1)]
        };

        let size_buckets = BUCKET_LABELS
            .iter()
            .enumerate()
            .map(|(i, label)| BucketStat {
                label: (*label).to_string(),
                count: self.bucket_counts[i],
                total_bytes: self.bucket_totals[i],
            })
            .collect();

        Some(DistributionSnapshot {
            count: self.count,
            total_bytes: self.total_bytes,
            max_size: self.max_size,
            percentiles: Percentiles {
                p50: percentile(50),
                p75: percentile(75),
                p90: percentile(90),
                p95: percentile(95),
                p99: percentile(99),
            },
            size_buckets,
            large_file_fraction: self.bucket_counts[4] as f64 / self.count as f64,
            confidence: Confidence::from_count(self.count),
            source,
            captured_at: unix_now(),
        })
    }
}

/// Index into [`BUCKET_BOUNDS`] for a size.
fn bucket_index(size: u64) -> usize {
    BUCKET_BOUNDS
        .iter()
        .rposition(|bound| size >= *bound)
        .unwrap_or(0)
}

/// Both trackers for one uploader.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UploaderDistributions {
    queue: DistributionTracker,
    history: DistributionTracker,
}

struct StoreInner {
    map: BTreeMap<String, UploaderDistributions>,
    store: JsonStore,
}

/// Owner of all distribution trackers and their persistence file.
///
/// Shared between the queue capturer, the engine driver (history side) and
/// the session loop; the store is the single writer of
/// `learned_sizes_cache.json`.
pub struct DistributionStore {
    inner: Mutex<StoreInner>,
}

impl DistributionStore {
    /// Open the store, loading any previous snapshot from `store`.
    pub fn open(store: JsonStore) -> Self {
        let map: BTreeMap<String, UploaderDistributions> = store.load_or_default();
        Self {
            inner: Mutex::new(StoreInner { map, store }),
        }
    }

    /// Feed one size into the uploader's queue tracker.
    pub fn observe_queue(&self, uploader: &str, size: u64) {
        let mut inner = self.inner.lock().expect("distribution lock poisoned");
        inner
            .map
            .entry(uploader.to_string())
            .or_default()
            .queue
            .observe(size);
    }

    /// Feed one size into the uploader's history tracker.
    pub fn observe_history(&self, uploader: &str, size: u64) {
        let mut inner = self.inner.lock().expect("distribution lock poisoned");
        inner
            .map
            .entry(uploader.to_string())
            .or_default()
            .history
            .observe(size);
    }

    /// Snapshot of the queue distribution, the one strategy selection
    /// reads.
    pub fn queue_snapshot(&self, uploader: &str) -> Option<DistributionSnapshot> {
        let inner = self.inner.lock().expect("distribution lock poisoned");
        inner
            .map
            .get(uploader)
            .and_then(|d| d.queue.snapshot(SampleSource::CheckerQueue))
    }

    /// Snapshot of the transfer history. Analytic only; never read by the
    /// scheduler.
    pub fn history_snapshot(&self, uploader: &str) -> Option<DistributionSnapshot> {
        let inner = self.inner.lock().expect("distribution lock poisoned");
        inner
            .map
            .get(uploader)
            .and_then(|d| d.history.snapshot(SampleSource::CompletedTransfers))
    }

    /// Number of samples in the uploader's queue tracker.
    pub fn queue_count(&self, uploader: &str) -> u64 {
        let inner = self.inner.lock().expect("distribution lock poisoned");
        inner.map.get(uploader).map_or(0, |d| d.queue.count())
    }

    /// Persist both trackers for all uploaders.
    pub fn persist(&self) {
        let inner = self.inner.lock().expect("distribution lock poisoned");
        inner.store.save(&inner.map);
    }
}

// =============================================================================
// Tests
// =============================================================================
