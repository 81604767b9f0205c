//! Quota, timing, and distribution constants for uphaul.

use std::time::Duration;

// =============================================================================
// Quota Constants
// =============================================================================

/// Nominal per-credential daily upload quota (750 GiB).
pub const DEFAULT_QUOTA_CAP: u64 = 750 * GIB;

/// Fraction of the quota cap held back to avoid provider-side rejection.
pub const SAFETY_MARGIN_FRACTION: f64 = 0.05;

/// Length of a credential's quota window.
pub const QUOTA_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Below this remaining quota a credential is not worth another stage.
pub const MIN_VIABLE_QUOTA: u64 = 10 * GIB;

/// Default ban duration for daily/user-rate limit classes, in hours.
pub const DEFAULT_RATE_LIMIT_DELAY_HOURS: u64 = 24;

/// Upper bound on stages driven against a single credential.
pub const DEFAULT_MAX_STAGES: u32 = 16;

// =============================================================================
// Timing Constants
// =============================================================================

/// Delay between a max-transfer signal and the early-termination probe.
pub const EARLY_TERMINATION_DELAY: Duration = Duration::from_secs(5);

/// Grace period between SIGTERM and SIGKILL for the child engine.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Control-plane polling cadence during a stage.
pub const RC_POLL_INTERVAL: Duration = Duration::from_millis(2500);

/// Per-request timeout for control-plane calls.
pub const RC_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on file-list generation and queue capture.
pub const DEFAULT_GENERATE_LIST_TIMEOUT: Duration = Duration::from_secs(600);

/// Stats emission interval requested from the engine.
pub const ENGINE_STATS_INTERVAL_SECS: u64 = 60;

// =============================================================================
// Distribution Constants
// =============================================================================

/// Reservoir sample size for percentile estimation.
pub const RESERVOIR_SIZE: usize = 10_000;

/// Sample-count thresholds for confidence tiers (medium / high / very high).
pub const CONFIDENCE_THRESHOLDS: (u64, u64, u64) = (10, 100, 1000);

/// Lower bounds of the size buckets, in bytes. The last bucket is open-ended.
pub const BUCKET_BOUNDS: [u64; 5] = [0, 100 * MIB, GIB, 10 * GIB, 50 * GIB];

/// Display labels for the size buckets, index-aligned with [`BUCKET_BOUNDS`].
pub const BUCKET_LABELS: [&str; 5] = ["0-100MB", "100MB-1GB", "1GB-10GB", "10GB-50GB", "50GB+"];

// =============================================================================
// Chunking Constants
// =============================================================================

/// Default number of files per chunk artifact.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Prefix for chunk artifact directories, used by the startup orphan sweep.
pub const CHUNK_DIR_PREFIX: &str = "uphaul-chunks-";

// =============================================================================
// Byte Units
// =============================================================================

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// One gibibyte.
pub const GIB: u64 = 1024 * 1024 * 1024;
