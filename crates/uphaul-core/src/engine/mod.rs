//! Transfer-engine integration: log-line classification, flag composition,
//! and the per-stage child driver.

mod driver;
mod events;
mod flags;

pub use driver::{EngineDriver, RateLimitHit, StageOutcome, StageSpec};
pub use events::{LineClassifier, LineEvent};
pub use flags::{compose_stage_args, size_suffix};
