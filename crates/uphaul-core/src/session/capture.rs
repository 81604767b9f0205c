//! Queue-distribution capturer.
//!
//! Background task that polls the control plane while the first stage
//! runs and feeds sizes it has not seen before into the uploader's queue
//! tracker: `transferring` entries carry sizes, `checking` entries are
//! names resolved against the local tree. The capturer winds down on its
//! own once the checking queue has stayed empty for a full polling
//! interval, and is bounded by the listing timeout either way. A dead
//! control plane just means no capture; it is never an error.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::constants::RC_POLL_INTERVAL;
use crate::distribution::DistributionStore;
use crate::rc::RcClient;

/// Consecutive unanswered polls before an unpopulated capture gives up.
const MAX_MISSES_BEFORE_GIVE_UP: u32 = 5;

/// Handle to a running capture task.
pub struct QueueCapture {
    stop: watch::Sender<bool>,
    handle: JoinHandle<u64>,
}

impl QueueCapture {
    /// Start capturing for one uploader.
    pub fn spawn(
        rc: RcClient,
        distributions: Arc<DistributionStore>,
        uploader: String,
        local_root: PathBuf,
        timeout: Duration,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(capture_loop(
            rc,
            distributions,
            uploader,
            local_root,
            timeout,
            stop_rx,
        ));
        Self { stop, handle }
    }

    /// Stop the task and wait for it, returning the number of sizes
    /// captured.
    pub async fn finish(self) -> u64 {
        let _ = self.stop.send(true);
        self.handle.await.unwrap_or(0)
    }
}

async fn capture_loop(
    rc: RcClient,
    distributions: Arc<DistributionStore>,
    uploader: String,
    local_root: PathBuf,
    timeout: Duration,
    mut stop: watch::Receiver<bool>,
) -> u64 {
    let started = Instant::now();
    let mut seen: HashSet<String> = HashSet::new();
    let mut captured = 0u64;
    let mut populated = false;
    let mut empty_streak = 0u32;
    let mut misses = 0u32;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(RC_POLL_INTERVAL) => {}
            _ = stop.changed() => break,
        }
        if started.elapsed() >= timeout {
            // Capture timeout is not an error; the session proceeds with
            // whatever was observed.
            info!(uploader = %uploader, captured, "Queue capture timed out");
            break;
        }

        let Some(stats) = rc.core_stats().await else {
            misses += 1;
            if !populated && misses >= MAX_MISSES_BEFORE_GIVE_UP {
                debug!(uploader = %uploader, "Control plane unreachable, queue capture disabled");
                break;
            }
            continue;
        };
        misses = 0;

        for entry in &stats.transferring {
            if !entry.name.is_empty() && seen.insert(entry.name.clone()) {
                distributions.observe_queue(&uploader, entry.size);
                captured += 1;
            }
        }
        for name in &stats.checking {
            if !seen.insert(name.clone()) {
                continue;
            }
            // Checking entries are names only; sizes come from the tree.
            if let Ok(meta) = tokio::fs::metadata(local_root.join(name)).await {
                distributions.observe_queue(&uploader, meta.len());
                captured += 1;
            }
        }

        if stats.checking.is_empty() {
            if populated && empty_streak >= 1 {
                info!(uploader = %uploader, captured, "Checking queue drained, capture complete");
                break;
            }
            empty_streak += 1;
        } else {
            populated = true;
            empty_streak = 0;
        }
    }

    distributions.persist();
    captured
}

// =============================================================================
// Tests
// =============================================================================
