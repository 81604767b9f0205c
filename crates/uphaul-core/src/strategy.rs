//! Stage parameter selection.
//!
//! A pure function from (remaining quota, queue distribution, stage
//! number) to the concrete parameter bundle for the next engine
//! invocation. The cross table below is the whole policy; everything else
//! in the scheduler just carries the bundle around.

use crate::constants::{GIB, SAFETY_MARGIN_FRACTION};
use crate::distribution::DistributionSnapshot;

/// How much of the daily quota a credential still has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaTier {
    /// More than 80% remaining.
    Fresh,
    /// 50–80% remaining.
    Mid,
    /// 25–50% remaining.
    Low,
    /// Under 25% remaining.
    Critical,
}

impl QuotaTier {
    /// Classify remaining quota against the cap.
    pub fn classify(remaining: u64, quota_cap: u64) -> Self {
        let percent = remaining as f64 / quota_cap.max(1) as f64 * 100.0;
        if percent > 80.0 {
            QuotaTier::Fresh
        } else if percent >= 50.0 {
            QuotaTier::Mid
        } else if percent >= 25.0 {
            QuotaTier::Low
        } else {
            QuotaTier::Critical
        }
    }
}

/// Shape of the upcoming work, from the queue distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeRegime {
    /// More than 10% of files are 50 GiB+.
    UltraHeavy,
    /// 2–10% large files.
    Heavy,
    /// 0.5–2% large files.
    Balanced,
    /// Under 0.5% large files.
    Light,
    /// No usable snapshot; assume nothing.
    Conservative,
}

impl SizeRegime {
    /// Classify a snapshot, falling back to `Conservative` when it is
    /// missing or below medium confidence.
    pub fn classify(snapshot: Option<&DistributionSnapshot>) -> Self {
        let Some(snapshot) = snapshot else {
            return SizeRegime::Conservative;
        };
        if !snapshot.is_actionable() {
            return SizeRegime::Conservative;
        }
        let fraction = snapshot.large_file_fraction;
        if fraction > 0.10 {
            SizeRegime::UltraHeavy
        } else if fraction > 0.02 {
            SizeRegime::Heavy
        } else if fraction > 0.005 {
            SizeRegime::Balanced
        } else {
            SizeRegime::Light
        }
    }
}

/// Transfer ordering preference passed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    /// Largest files first.
    SizeDesc,
    /// Engine listing order.
    None,
}

/// Parameter bundle for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageParams {
    /// Concurrent transfers, 1..=8.
    pub transfers: u32,
    /// Byte cap for the stage (`--max-transfer`).
    pub stage_byte_cap: u64,
    /// Per-file size cap (`--max-size`), when constrained.
    pub per_file_size_cap: Option<u64>,
    pub order_by: OrderBy,
    /// Always cautious: the engine finishes in-flight transfers at the
    /// cap instead of cutting them off.
    pub cutoff_mode: CutoffMode,
    /// Diagnostic label for logs and the session snapshot.
    pub strategy_tag: &'static str,
}

/// Engine cutoff behavior at the byte cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CutoffMode {
    #[default]
    Cautious,
}

impl CutoffMode {
    /// Flag value understood by the engine.
    pub fn as_flag_value(&self) -> &'static str {
        "cautious"
    }
}

/// Select the parameter bundle for the next stage.
///
/// Deterministic in its inputs. `stage` is carried for symmetry with the
/// session loop; the policy keys off remaining quota, which already
/// declines stage over stage. The returned cap always satisfies
/// `stage_byte_cap <= remaining - safety_margin`.
pub fn select_stage_params(
    remaining: u64,
    snapshot: Option<&DistributionSnapshot>,
    _stage: u32,
    quota_cap: u64,
) -> StageParams {
    let tier = QuotaTier::classify(remaining, quota_cap);
    let regime = SizeRegime::classify(snapshot);
    let margin = (quota_cap as f64 * SAFETY_MARGIN_FRACTION) as u64;
    let hard_cap = remaining.saturating_sub(margin);

    if tier == QuotaTier::Critical {
        // Drain stage: full concurrency over small files, no ordering
        // pass, spend everything above the margin.
        return StageParams {
            transfers: 8,
            stage_byte_cap: hard_cap,
            per_file_size_cap: Some((remaining / 2).min(150 * GIB)),
            order_by: OrderBy::None,
            cutoff_mode: CutoffMode::Cautious,
            strategy_tag: "critical_drain",
        };
    }

    let row = |transfers: u32,
               stage_frac: f64,
               size_frac: Option<f64>,
               order_by: OrderBy,
               strategy_tag: &'static str| {
        StageParams {
            transfers,
            stage_byte_cap: frac(remaining, stage_frac).min(hard_cap),
            per_file_size_cap: size_frac.map(|f| frac(remaining, f)),
            order_by,
            cutoff_mode: CutoffMode::Cautious,
            strategy_tag,
        }
    };

    use OrderBy::{None as Unordered, SizeDesc};
    use SizeRegime::*;

    match (tier, regime) {
        (QuotaTier::Fresh, Light) => row(8, 0.5, Some(0.8), SizeDesc, "fresh_light"),
        (QuotaTier::Fresh, Balanced) => row(6, 0.5, Some(0.6), SizeDesc, "fresh_balanced"),
        (QuotaTier::Fresh, Heavy) => row(4, 0.45, Some(0.4), SizeDesc, "fresh_heavy"),
        (QuotaTier::Fresh, UltraHeavy) => row(2, 0.4, Some(0.2), SizeDesc, "fresh_ultra_heavy"),
        (QuotaTier::Fresh, Conservative) => row(4, 0.5, None, SizeDesc, "fresh_conservative"),

        (QuotaTier::Mid, Light) => row(8, 0.9, Some(0.6), SizeDesc, "mid_light"),
        (QuotaTier::Mid, Balanced) => row(6, 0.9, Some(0.7), SizeDesc, "mid_balanced"),
        (QuotaTier::Mid, Heavy) => row(4, 0.9, Some(0.75), SizeDesc, "mid_heavy"),
        (QuotaTier::Mid, UltraHeavy) => row(2, 0.8, Some(0.4), SizeDesc, "mid_ultra_heavy"),
        (QuotaTier::Mid, Conservative) => row(4, 0.8, None, SizeDesc, "mid_conservative"),

        (QuotaTier::Low, Light) => row(8, 0.9, Some(0.3), Unordered, "low_light"),
        (QuotaTier::Low, Balanced) => row(6, 0.9, Some(0.3), Unordered, "low_balanced"),
        (QuotaTier::Low, Heavy) => row(6, 0.85, Some(0.4), Unordered, "low_heavy"),
        (QuotaTier::Low, UltraHeavy) => row(4, 0.8, Some(0.4), Unordered, "low_ultra_heavy"),
        (QuotaTier::Low, Conservative) => row(6, 0.85, Some(0.3), Unordered, "low_conservative"),

        (QuotaTier::Critical, _) => unreachable!("critical tier handled above"),
    }
}

fn frac(bytes: u64, fraction: f64) -> u64 {
    (bytes as f64 * fraction) as u64
}

// =============================================================================
// Tests
// =============================================================================
