//! Startup configuration model.
//!
//! One JSON document, read once before any uploader work. Parse or
//! validation failures are fatal; everything downstream receives an
//! already-checked [`Config`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_GENERATE_LIST_TIMEOUT, DEFAULT_MAX_STAGES, DEFAULT_QUOTA_CAP,
    DEFAULT_RATE_LIMIT_DELAY_HOURS,
};
use crate::error::{Error, Result};

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub core: CoreConfig,
    pub uploaders: BTreeMap<String, UploaderConfig>,
    #[serde(default)]
    pub rc: RcConfig,
    /// Recognized rate-limit substrings mapped to their handling rule.
    /// When absent, the built-in defaults for the common 403 classes apply.
    #[serde(default)]
    pub rate_limits: Option<BTreeMap<String, RateLimitRule>>,
}

/// Engine and scheduler-wide settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    /// Path to the rclone-compatible engine binary.
    pub engine_binary_path: PathBuf,
    /// Optional engine configuration file, passed through verbatim.
    #[serde(default)]
    pub engine_config_path: Option<PathBuf>,
    /// Per-credential daily quota in bytes.
    #[serde(default = "default_quota_cap")]
    pub quota_cap_bytes: u64,
    /// Directory for the persistent caches. Defaults to the directory the
    /// config file was loaded from.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Pass the engine's dry-run flag; accounting still follows reported
    /// events.
    #[serde(default)]
    pub dry_run: bool,
    /// Upper bound on stages per credential.
    #[serde(default = "default_max_stages")]
    pub max_stages: u32,
}

/// One named upload job.
#[derive(Debug, Clone, Deserialize)]
pub struct UploaderConfig {
    /// Local source tree.
    pub local_path: PathBuf,
    /// Remote destination, e.g. `gdrive:/media`.
    pub remote_path: String,
    /// Directory of credential files, consumed in deterministic order.
    pub credential_path: PathBuf,
    /// Extra engine flags passed through verbatim (`flag -> value`, empty
    /// value for bare flags).
    #[serde(default)]
    pub engine_extras: BTreeMap<String, String>,
    /// Exclude patterns applied to listing and transfer alike.
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Skip files currently held open under `local_path`, re-checked
    /// before every stage.
    #[serde(default)]
    pub exclude_open_files: bool,
    /// Substrings exempting open files from that exclusion.
    #[serde(default)]
    pub opened_excludes: Vec<String>,
    #[serde(default)]
    pub chunked_upload: ChunkConfig,
    /// What to do when a stage fails after partial progress. There is no
    /// default: the operator must state the policy.
    pub on_partial_failure: PartialFailurePolicy,
}

/// Policy for a stage that failed after accounting partial progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialFailurePolicy {
    /// Surface the partial outcome and rotate to the next credential.
    Report,
    /// Re-run the failed stage once on the same credential.
    Retry,
}

/// Chunked-upload settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Bound on file-list generation, in seconds.
    #[serde(default = "default_list_timeout_secs")]
    pub generate_list_timeout_secs: u64,
}

impl ChunkConfig {
    /// The listing/capture timeout as a [`Duration`].
    pub fn generate_list_timeout(&self) -> Duration {
        Duration::from_secs(self.generate_list_timeout_secs)
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            generate_list_timeout_secs: DEFAULT_GENERATE_LIST_TIMEOUT.as_secs(),
        }
    }
}

/// Control-plane endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RcConfig {
    #[serde(default = "default_rc_url")]
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default)]
    pub standalone: StandaloneRcConfig,
}

impl Default for RcConfig {
    fn default() -> Self {
        Self {
            url: default_rc_url(),
            user: None,
            pass: None,
            standalone: StandaloneRcConfig::default(),
        }
    }
}

/// Standalone control-plane daemon settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StandaloneRcConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub addr: Option<String>,
    #[serde(default)]
    pub web_gui: bool,
    #[serde(default)]
    pub no_auth: bool,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
}

/// One rate-limit handling rule.
///
/// The shorthand form is a bare number of delay hours; the full form adds
/// an occurrence threshold within a sliding window.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RateLimitRule {
    Hours(u64),
    Full {
        delay_hours: u64,
        #[serde(default = "default_rule_count")]
        count: u32,
        #[serde(default = "default_rule_window_secs")]
        window_secs: u64,
    },
}

impl RateLimitRule {
    /// Ban duration applied when the rule fires.
    pub fn delay_hours(&self) -> u64 {
        match self {
            RateLimitRule::Hours(h) => *h,
            RateLimitRule::Full { delay_hours, .. } => *delay_hours,
        }
    }

    /// Occurrences required within the window before the rule fires.
    pub fn count(&self) -> u32 {
        match self {
            RateLimitRule::Hours(_) => 1,
            RateLimitRule::Full { count, .. } => (*count).max(1),
        }
    }

    /// Sliding window for occurrence counting.
    pub fn window(&self) -> Duration {
        match self {
            RateLimitRule::Hours(_) => Duration::from_secs(default_rule_window_secs()),
            RateLimitRule::Full { window_secs, .. } => Duration::from_secs(*window_secs),
        }
    }
}

impl Config {
    /// Load and validate the configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        let mut config: Config = serde_json::from_slice(&bytes)
            .map_err(|e| Error::config(format!("cannot parse {}: {e}", path.display())))?;

        if config.core.cache_dir.is_none() {
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            config.core.cache_dir = Some(parent.to_path_buf());
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate structural constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.core.quota_cap_bytes == 0 {
            return Err(Error::config("core.quota_cap_bytes must be positive"));
        }
        if self.core.max_stages == 0 {
            return Err(Error::config("core.max_stages must be positive"));
        }
        if self.uploaders.is_empty() {
            return Err(Error::config("at least one uploader must be configured"));
        }
        for (name, uploader) in &self.uploaders {
            if uploader.remote_path.is_empty() {
                return Err(Error::config(format!(
                    "uploaders.{name}.remote_path must not be empty"
                )));
            }
            if uploader.chunked_upload.enabled && uploader.chunked_upload.chunk_size == 0 {
                return Err(Error::config(format!(
                    "uploaders.{name}.chunked_upload.chunk_size must be positive"
                )));
            }
        }
        Ok(())
    }

    /// The directory holding the persistent caches.
    pub fn cache_dir(&self) -> &Path {
        self.core
            .cache_dir
            .as_deref()
            .unwrap_or_else(|| Path::new("."))
    }

    /// Effective rate-limit rules: operator-supplied, or the built-in
    /// defaults for the common 403 classes.
    pub fn rate_limit_rules(&self) -> BTreeMap<String, RateLimitRule> {
        match &self.rate_limits {
            Some(rules) => rules.clone(),
            None => default_rate_limits(),
        }
    }
}

impl UploaderConfig {
    /// List the credential files in deterministic order.
    ///
    /// Files sort by the first digit run in their name, then by name, so
    /// `sa-2.json` precedes `sa-10.json`.
    pub fn list_credentials(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.credential_path).map_err(|e| {
            Error::config(format!(
                "cannot read credential_path {}: {e}",
                self.credential_path.display()
            ))
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();

        files.sort_by_key(|p| {
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (first_digit_run(&name), name)
        });
        Ok(files)
    }
}

/// First contiguous digit run in a name, used for natural credential order.
fn first_digit_run(name: &str) -> u64 {
    let digits: String = name
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}

fn default_quota_cap() -> u64 {
    DEFAULT_QUOTA_CAP
}

fn default_max_stages() -> u32 {
    DEFAULT_MAX_STAGES
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_list_timeout_secs() -> u64 {
    DEFAULT_GENERATE_LIST_TIMEOUT.as_secs()
}

fn default_rc_url() -> String {
    "http://127.0.0.1:5572".to_string()
}

fn default_rule_count() -> u32 {
    1
}

fn default_rule_window_secs() -> u64 {
    300
}

/// Built-in rules for the 403 classes the provider is known to emit.
pub fn default_rate_limits() -> BTreeMap<String, RateLimitRule> {
    let mut rules = BTreeMap::new();
    for pattern in [
        "userRateLimitExceeded",
        "dailyLimitExceeded",
        "403: User rate limit",
    ] {
        rules.insert(
            pattern.to_string(),
            RateLimitRule::Hours(DEFAULT_RATE_LIMIT_DELAY_HOURS),
        );
    }
    rules
}
