//! Cumulative session metrics.
//!
//! Accumulated across stages and credentials within one uploader session,
//! for the outcome events and log lines a human actually reads.

use std::time::{Duration, Instant};

use crate::engine::StageOutcome;
use crate::ledger::basename;

/// Running totals for one uploader session.
#[derive(Debug)]
pub struct SessionMetrics {
    transfer_count: u64,
    total_bytes: u64,
    stages_run: u32,
    credentials_used: Vec<String>,
    started: Instant,
}

impl SessionMetrics {
    /// Start counting.
    pub fn new() -> Self {
        Self {
            transfer_count: 0,
            total_bytes: 0,
            stages_run: 0,
            credentials_used: Vec::new(),
            started: Instant::now(),
        }
    }

    /// Fold one stage outcome into the totals.
    pub fn record_stage(&mut self, outcome: &StageOutcome) {
        self.transfer_count += outcome.transfer_count;
        self.total_bytes += outcome.total_bytes;
        self.stages_run += 1;
    }

    /// Note that a credential drove at least one stage.
    pub fn record_credential(&mut self, credential: &str) {
        let name = basename(credential).to_string();
        if !self.credentials_used.contains(&name) {
            self.credentials_used.push(name);
        }
    }

    pub fn transfer_count(&self) -> u64 {
        self.transfer_count
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn stages_run(&self) -> u32 {
        self.stages_run
    }

    pub fn credentials_used(&self) -> &[String] {
        &self.credentials_used
    }

    /// Wall-clock time since the session started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Average speed over the session wall clock, bytes per second.
    pub fn avg_speed(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.total_bytes as f64 / secs
        } else {
            0.0
        }
    }

    /// One-line human summary for logs and outcome events.
    pub fn summary(&self) -> String {
        format!(
            "{} files ({}) across {} stage(s) via {} credential(s) in {} at {}/s",
            self.transfer_count,
            format_bytes(self.total_bytes),
            self.stages_run,
            self.credentials_used.len(),
            format_duration(self.elapsed()),
            format_bytes(self.avg_speed() as u64),
        )
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable byte count with binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Human-readable duration, largest two units.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h{minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m{seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

// =============================================================================
// Tests
// =============================================================================
