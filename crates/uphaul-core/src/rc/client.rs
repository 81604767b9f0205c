//! Thin HTTP client for the engine's control-plane API.
//!
//! Stateless, loopback-only, bounded timeouts. Every failure degrades to
//! "unknown" (`None`/`false`) instead of propagating: a dead control plane
//! disables early termination and queue capture but never aborts a stage.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::constants::RC_TIMEOUT;
use crate::error::{Error, Result};

/// One in-flight transfer as reported by `core/stats`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransferEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub eta: Option<f64>,
}

/// Aggregate stats from `core/stats`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoreStats {
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub eta: Option<f64>,
    #[serde(default)]
    pub transferring: Vec<TransferEntry>,
    #[serde(default)]
    pub checking: Vec<String>,
    #[serde(default, rename = "totalBytes")]
    pub total_bytes: u64,
}

impl CoreStats {
    /// True when the engine has stopped moving bytes but is still scanning
    /// candidates: nothing transferring, zero aggregate speed, a non-empty
    /// checking queue. This is the early-termination condition.
    pub fn is_idle_scan(&self) -> bool {
        self.transferring.is_empty() && self.speed == 0.0 && !self.checking.is_empty()
    }

    /// Reported size of a path currently transferring, if any.
    pub fn size_of(&self, name: &str) -> Option<u64> {
        self.transferring
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.size)
    }
}

/// Control-plane HTTP client.
#[derive(Debug, Clone)]
pub struct RcClient {
    http: reqwest::Client,
    base_url: String,
    auth: Option<(String, String)>,
}

impl RcClient {
    /// Build a client for the given base URL with optional basic auth.
    pub fn new(url: &str, user: Option<&str>, pass: Option<&str>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(RC_TIMEOUT)
            .connect_timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| Error::ControlPlane {
                message: format!("cannot build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: url.trim_end_matches('/').to_string(),
            auth: user.map(|u| (u.to_string(), pass.unwrap_or_default().to_string())),
        })
    }

    /// The authority (`host:port`) of the base URL.
    pub fn authority(&self) -> &str {
        authority_of(&self.base_url)
    }

    /// Fetch aggregate transfer stats, or `None` if the control plane is
    /// unreachable or answers garbage.
    pub async fn core_stats(&self) -> Option<CoreStats> {
        match self.post("core/stats").await {
            Ok(response) => match response.json::<CoreStats>().await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    debug!(error = %e, "Unparsable core/stats response");
                    None
                }
            },
            Err(e) => {
                debug!(error = %e, "core/stats unreachable");
                None
            }
        }
    }

    /// Liveness probe. `false` means unreachable, not necessarily down.
    pub async fn noop(&self) -> bool {
        match self.post("rc/noop").await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn post(&self, endpoint: &str) -> reqwest::Result<reqwest::Response> {
        let mut request = self.http.post(format!("{}/{endpoint}", self.base_url));
        if let Some((user, pass)) = &self.auth {
            request = request.basic_auth(user, Some(pass));
        }
        request.send().await
    }
}

/// Strip scheme and path from a URL, leaving `host:port`.
pub(crate) fn authority_of(url: &str) -> &str {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    rest.split('/').next().unwrap_or(rest)
}

// =============================================================================
// Tests
// =============================================================================
