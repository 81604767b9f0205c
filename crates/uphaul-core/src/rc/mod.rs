//! Control-plane integration: the HTTP client and the standalone daemon
//! supervisor.

mod client;
mod daemon;

pub use client::{CoreStats, RcClient, TransferEntry};
pub(crate) use client::authority_of;
pub use daemon::ensure_standalone_rcd;
