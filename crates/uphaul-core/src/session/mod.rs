//! Session orchestration: the per-uploader state machine and its
//! supporting pieces.

mod capture;
mod metrics;
mod publisher;
mod runner;

pub use capture::QueueCapture;
pub use metrics::{SessionMetrics, format_bytes, format_duration};
pub use publisher::SessionPublisher;
pub use runner::{SessionEvent, SessionRunner, UploaderResult};
