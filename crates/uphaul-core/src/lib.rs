//! uphaul-core: quota-aware upload scheduling.
//!
//! This crate provides:
//! - A durable per-credential quota ledger and ban set
//! - File-size distribution tracking for strategy selection
//! - Stage parameterization from quota and distribution state
//! - A transfer-engine driver with live byte accounting
//! - Chunked upload planning
//! - The per-uploader session state machine
//! - Configuration and logging

pub mod bans;
pub mod chunker;
mod clock;
pub mod config;
pub mod constants;
pub mod distribution;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod openfiles;
pub mod persist;
pub mod rc;
pub mod session;
pub mod strategy;

pub use error::{Error, Result};
pub use logging::{LogFormat, init_logging};
pub use session::{SessionEvent, SessionRunner, UploaderResult};
