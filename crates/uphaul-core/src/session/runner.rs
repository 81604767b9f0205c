//! The session state machine.
//!
//! One sequential loop per uploader: refresh bans against the quota
//! ledger, pick the first eligible credential in pool order, and drive
//! stages against it until its quota is spent, a rate limit bans it, or
//! the engine drains the source. Outcomes surface as plain
//! [`SessionEvent`] values; routing them to notifiers or dashboards is the
//! outer program's business.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::chunker::{ChunkPlan, Chunker, sweep_orphaned_artifacts};
use crate::clock::unix_now;
use crate::config::{Config, PartialFailurePolicy, UploaderConfig};
use crate::constants::MIN_VIABLE_QUOTA;
use crate::bans::BanSet;
use crate::distribution::DistributionStore;
use crate::engine::{EngineDriver, StageOutcome, StageSpec, compose_stage_args};
use crate::error::{Error, Result};
use crate::ledger::{QuotaLedger, basename};
use crate::openfiles::opened_files;
use crate::persist::JsonStore;
use crate::rc::{RcClient, ensure_standalone_rcd};
use crate::session::capture::QueueCapture;
use crate::session::metrics::{SessionMetrics, format_bytes};
use crate::session::publisher::SessionPublisher;
use crate::strategy::select_stage_params;

/// Outcome notifications for the outer program.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    UploadStarted {
        uploader: String,
        credentials: usize,
    },
    UploaderSkipped {
        uploader: String,
        next_unban_at: Option<u64>,
    },
    CredentialBanned {
        uploader: String,
        credential: String,
        pattern: String,
        unban_at: u64,
    },
    StageFinished {
        uploader: String,
        credential: String,
        stage: u32,
        files: u64,
        bytes: u64,
        early_terminated: bool,
    },
    UploadCompleted {
        uploader: String,
        summary: String,
    },
    UploadPartial {
        uploader: String,
        summary: String,
        reason: String,
    },
    UploadFailed {
        uploader: String,
        reason: String,
    },
}

/// How one uploader's session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploaderResult {
    /// The engine drained the source.
    Completed,
    /// No eligible credential was available; nothing was attempted.
    Skipped,
    /// Some progress, then interruption, exhaustion, or a reported
    /// failure.
    Partial(String),
    /// Failure with nothing accounted, or a fatal engine error.
    Failed(String),
}

/// How driving one credential ended.
enum CredentialEnd {
    SourceDrained,
    QuotaSpent,
    Banned,
    Interrupted,
    StageFailed { reason: String, progressed: bool },
    Fatal(String),
}

/// Top-level scheduler: owns the ledgers, the driver, and the loop.
pub struct SessionRunner {
    config: Config,
    ledger: Arc<QuotaLedger>,
    bans: Arc<BanSet>,
    distributions: Arc<DistributionStore>,
    publisher: SessionPublisher,
    rc: RcClient,
    driver: EngineDriver,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    shutdown: watch::Receiver<bool>,
}

impl SessionRunner {
    /// Build a runner from validated configuration.
    ///
    /// Opens the persistent caches under the config's cache directory and
    /// sweeps chunk artifacts left by a crashed previous run.
    pub fn new(config: Config, shutdown: watch::Receiver<bool>) -> Result<Self> {
        sweep_orphaned_artifacts();

        let cache_dir = config.cache_dir().to_path_buf();
        let ledger = Arc::new(QuotaLedger::open(
            JsonStore::new(cache_dir.join("sa_quota_cache.json")),
            config.core.quota_cap_bytes,
        ));
        let bans = Arc::new(BanSet::open(JsonStore::new(cache_dir.join("ban_cache.json"))));
        let distributions = Arc::new(DistributionStore::open(JsonStore::new(
            cache_dir.join("learned_sizes_cache.json"),
        )));
        let publisher =
            SessionPublisher::new(JsonStore::new(cache_dir.join("session_state.json")));

        let rc = RcClient::new(
            &config.rc.url,
            config.rc.user.as_deref(),
            config.rc.pass.as_deref(),
        )?;
        let driver = EngineDriver::new(
            &config.core.engine_binary_path,
            rc.clone(),
            config.rate_limit_rules(),
        );

        Ok(Self {
            config,
            ledger,
            bans,
            distributions,
            publisher,
            rc,
            driver,
            events: None,
            shutdown,
        })
    }

    /// Attach an event sink for outcome notifications.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// The shared quota ledger.
    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    /// The shared ban set.
    pub fn bans(&self) -> &Arc<BanSet> {
        &self.bans
    }

    /// Run the session across all configured uploaders, or just `only`.
    ///
    /// Returns an error when any uploader failed outright; skips and
    /// partial outcomes are reported through events and logs.
    pub async fn run(&mut self, only: Option<&str>) -> Result<()> {
        if self.config.rc.standalone.enabled {
            ensure_standalone_rcd(
                &self.rc,
                &self.config.core.engine_binary_path,
                self.config.core.engine_config_path.as_deref(),
                &self.config.rc,
            )
            .await;
        }

        let names: Vec<String> = self
            .config
            .uploaders
            .keys()
            .filter(|name| only.is_none_or(|o| o == name.as_str()))
            .cloned()
            .collect();
        if names.is_empty() {
            return Err(Error::config(format!(
                "no uploader matches {:?}",
                only.unwrap_or("<all>")
            )));
        }

        let mut failures = Vec::new();
        for name in names {
            match self.run_uploader(&name).await {
                Ok(UploaderResult::Completed) => {}
                Ok(UploaderResult::Skipped) => {}
                Ok(UploaderResult::Partial(reason)) => {
                    warn!(uploader = %name, reason = %reason, "Upload ended partially");
                }
                Ok(UploaderResult::Failed(reason)) => {
                    error!(uploader = %name, reason = %reason, "Upload failed");
                    failures.push(format!("{name}: {reason}"));
                }
                Err(e) => {
                    error!(uploader = %name, error = %e, "Upload aborted");
                    failures.push(format!("{name}: {e}"));
                }
            }
            if *self.shutdown.borrow() {
                info!("Interrupt requested, not starting further uploaders");
                break;
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Session {
                message: failures.join("; "),
            })
        }
    }

    /// Run one uploader's session to its end.
    pub async fn run_uploader(&mut self, name: &str) -> Result<UploaderResult> {
        let uploader = self
            .config
            .uploaders
            .get(name)
            .cloned()
            .ok_or_else(|| Error::config(format!("unknown uploader {name}")))?;

        let credentials: Vec<String> = uploader
            .list_credentials()?
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        if credentials.is_empty() {
            let reason = format!(
                "no credential files under {}",
                uploader.credential_path.display()
            );
            self.emit(SessionEvent::UploadFailed {
                uploader: name.to_string(),
                reason: reason.clone(),
            });
            return Ok(UploaderResult::Failed(reason));
        }

        // The pool on disk is authoritative: drop state for credentials
        // that were moved away.
        self.ledger.retain_credentials(name, &credentials);
        self.bans.retain_credentials(name, &credentials);

        info!(
            uploader = name,
            credentials = credentials.len(),
            source = %uploader.local_path.display(),
            dest = %uploader.remote_path,
            "Starting upload session"
        );
        self.publisher.start_session(name, credentials.len());
        self.emit(SessionEvent::UploadStarted {
            uploader: name.to_string(),
            credentials: credentials.len(),
        });

        let plan = self.build_chunk_plan(name, &uploader).await;

        // Capture the queue distribution in the background unless a
        // previous session already learned one.
        let mut capture = if self.distributions.queue_count(name) == 0 {
            Some(QueueCapture::spawn(
                self.rc.clone(),
                self.distributions.clone(),
                name.to_string(),
                uploader.local_path.clone(),
                uploader.chunked_upload.generate_list_timeout(),
            ))
        } else {
            None
        };

        let mut metrics = SessionMetrics::new();
        // Credentials this session already drove to their end; the pool is
        // walked forward-only.
        let mut spent: HashSet<String> = HashSet::new();

        let result = loop {
            if *self.shutdown.borrow() {
                break UploaderResult::Partial("interrupted".to_string());
            }

            // Quota expiry clears the paired ban before selection looks.
            let expired = self.ledger.sweep();
            self.bans.clear_for(&expired);
            self.bans.refresh();

            let selected = credentials.iter().enumerate().find(|(_, credential)| {
                !spent.contains(*credential)
                    && !self.bans.is_banned(name, credential)
                    && self.ledger.eligible(name, credential)
            });
            let Some((index, credential)) = selected else {
                if metrics.stages_run() == 0 {
                    break UploaderResult::Skipped;
                }
                break UploaderResult::Partial("all credentials exhausted".to_string());
            };
            let credential = credential.clone();

            self.publisher
                .update_credential(index, &credential, credentials.len());
            metrics.record_credential(&credential);

            match self
                .drive_credential(name, &uploader, &credential, plan.as_ref(), &mut metrics, &mut capture)
                .await?
            {
                CredentialEnd::SourceDrained => break UploaderResult::Completed,
                CredentialEnd::QuotaSpent => {
                    info!(
                        uploader = name,
                        credential = %basename(&credential),
                        "Credential quota spent, rotating"
                    );
                    spent.insert(credential);
                }
                CredentialEnd::Banned => {}
                CredentialEnd::Interrupted => {
                    break UploaderResult::Partial("interrupted".to_string());
                }
                CredentialEnd::StageFailed { reason, progressed } => {
                    if progressed {
                        break UploaderResult::Partial(reason);
                    }
                    break UploaderResult::Failed(reason);
                }
                CredentialEnd::Fatal(message) => {
                    break UploaderResult::Failed(message);
                }
            }
        };

        if let Some(capture) = capture.take() {
            capture.finish().await;
        }
        self.distributions.persist();
        self.publisher.end_session();
        self.report(name, &metrics, &result);
        Ok(result)
    }

    /// Drive stages against one credential until it is done.
    async fn drive_credential(
        &self,
        name: &str,
        uploader: &UploaderConfig,
        credential: &str,
        plan: Option<&ChunkPlan>,
        metrics: &mut SessionMetrics,
        capture: &mut Option<QueueCapture>,
    ) -> Result<CredentialEnd> {
        let quota_cap = self.ledger.cap();
        let mut stage = 1u32;
        let mut retried = false;

        loop {
            if *self.shutdown.borrow() {
                return Ok(CredentialEnd::Interrupted);
            }

            let remaining = self.ledger.remaining(name, credential);
            if remaining < MIN_VIABLE_QUOTA {
                return Ok(CredentialEnd::QuotaSpent);
            }

            let snapshot = self.distributions.queue_snapshot(name);
            let params = select_stage_params(remaining, snapshot.as_ref(), stage, quota_cap);
            self.publisher.update_stage(stage, params.strategy_tag);
            info!(
                uploader = name,
                credential = %basename(credential),
                stage,
                strategy = params.strategy_tag,
                remaining = %format_bytes(remaining),
                transfers = params.transfers,
                "Starting stage"
            );

            let outcome = match (plan, stage) {
                (Some(plan), 1) => {
                    self.run_chunked_stage(name, uploader, credential, &params, plan)
                        .await?
                }
                _ => {
                    // Files open right now get re-checked per stage.
                    let stage_excludes = self.open_file_excludes(name, uploader).await;
                    let args = compose_stage_args(
                        &self.config.core,
                        uploader,
                        &self.config.rc,
                        &params,
                        credential,
                        None,
                        &stage_excludes,
                    );
                    self.run_single(name, uploader, credential, args).await?
                }
            };

            // The first stage primes the queue tracker; later stages read
            // the learned snapshot.
            if let Some(capture) = capture.take() {
                let captured = capture.finish().await;
                info!(uploader = name, captured, "Queue distribution capture finished");
            }

            metrics.record_stage(&outcome);
            self.emit(SessionEvent::StageFinished {
                uploader: name.to_string(),
                credential: credential.to_string(),
                stage,
                files: outcome.transfer_count,
                bytes: outcome.total_bytes,
                early_terminated: outcome.early_terminated,
            });

            if let Some(hit) = &outcome.rate_limit {
                let unban_at = unix_now() + hit.delay_hours * 3600;
                self.bans.ban(name, credential, unban_at);
                self.emit(SessionEvent::CredentialBanned {
                    uploader: name.to_string(),
                    credential: credential.to_string(),
                    pattern: hit.pattern.clone(),
                    unban_at,
                });
                return Ok(CredentialEnd::Banned);
            }
            if let Some(message) = &outcome.fatal {
                return Ok(CredentialEnd::Fatal(message.clone()));
            }

            if !outcome.success {
                if *self.shutdown.borrow() {
                    return Ok(CredentialEnd::Interrupted);
                }
                let reason = format!(
                    "stage {stage} exited with {:?} and no recognized signal",
                    outcome.exit_code
                );
                if outcome.has_progress()
                    && uploader.on_partial_failure == PartialFailurePolicy::Retry
                    && !retried
                {
                    warn!(uploader = name, stage, "Stage failed with progress, retrying once");
                    retried = true;
                    continue;
                }
                return Ok(CredentialEnd::StageFailed {
                    reason,
                    progressed: outcome.has_progress(),
                });
            }

            if !outcome.max_transfer && !outcome.early_terminated {
                // Clean exit without hitting the cap: nothing left to move.
                return Ok(CredentialEnd::SourceDrained);
            }

            stage += 1;
            if stage > self.config.core.max_stages {
                warn!(
                    uploader = name,
                    max_stages = self.config.core.max_stages,
                    "Stage limit reached, rotating credential"
                );
                return Ok(CredentialEnd::QuotaSpent);
            }
        }
    }

    /// Stage 1 under a chunk plan: one child per artifact, merged outcome.
    async fn run_chunked_stage(
        &self,
        name: &str,
        uploader: &UploaderConfig,
        credential: &str,
        params: &crate::strategy::StageParams,
        plan: &ChunkPlan,
    ) -> Result<StageOutcome> {
        let total = plan.chunks().len();
        let mut combined: Option<StageOutcome> = None;

        for (index, chunk) in plan.chunks().iter().enumerate() {
            info!(
                uploader = name,
                chunk = index + 1,
                total,
                files = chunk.file_count,
                "Uploading chunk"
            );
            let args = compose_stage_args(
                &self.config.core,
                uploader,
                &self.config.rc,
                params,
                credential,
                Some(&chunk.path),
                &[],
            );
            let outcome = self.run_single(name, uploader, credential, args).await?;
            let stop = !outcome.success || outcome.max_transfer;

            combined = Some(match combined {
                None => outcome,
                Some(previous) => merge_outcomes(previous, outcome),
            });

            if stop {
                break;
            }
            if self.ledger.remaining(name, credential) < MIN_VIABLE_QUOTA {
                info!(uploader = name, "Quota low, stopping chunk loop to rotate");
                break;
            }
        }

        // build_plan never yields an empty chunk list.
        combined.ok_or_else(|| Error::engine("chunk plan was empty"))
    }

    async fn run_single(
        &self,
        name: &str,
        uploader: &UploaderConfig,
        credential: &str,
        args: Vec<String>,
    ) -> Result<StageOutcome> {
        let mut shutdown = self.shutdown.clone();
        self.driver
            .run_stage(
                StageSpec {
                    uploader: name,
                    credential,
                    local_path: &uploader.local_path,
                    args,
                },
                &self.ledger,
                &self.distributions,
                &mut shutdown,
            )
            .await
    }

    async fn build_chunk_plan(&self, name: &str, uploader: &UploaderConfig) -> Option<ChunkPlan> {
        if !uploader.chunked_upload.enabled {
            return None;
        }
        // Open files are excluded at listing time; the chunk artifacts
        // then carry that set for every batch.
        let open_excludes = self.open_file_excludes(name, uploader).await;
        let chunker = Chunker::new(
            &self.config.core.engine_binary_path,
            self.config.core.engine_config_path.as_deref(),
            uploader,
            &open_excludes,
        );
        match chunker.build_plan(uploader.chunked_upload.chunk_size).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(uploader = name, error = %e, "Chunk planning failed, falling back to unchunked upload");
                None
            }
        }
    }

    /// Patterns for files currently held open under the uploader's source,
    /// when the uploader opts into the guard.
    async fn open_file_excludes(&self, name: &str, uploader: &UploaderConfig) -> Vec<String> {
        if !uploader.exclude_open_files {
            return Vec::new();
        }
        let open = opened_files(&uploader.local_path, &uploader.opened_excludes).await;
        if !open.is_empty() {
            info!(
                uploader = name,
                count = open.len(),
                "Excluding currently-open files"
            );
        }
        open
    }

    fn report(&self, name: &str, metrics: &SessionMetrics, result: &UploaderResult) {
        let summary = metrics.summary();
        match result {
            UploaderResult::Completed => {
                info!(uploader = name, %summary, "Upload completed");
                self.emit(SessionEvent::UploadCompleted {
                    uploader: name.to_string(),
                    summary,
                });
            }
            UploaderResult::Skipped => {
                let next_unban_at = self.bans.earliest_unban(name);
                info!(uploader = name, ?next_unban_at, "Upload skipped, no eligible credential");
                self.emit(SessionEvent::UploaderSkipped {
                    uploader: name.to_string(),
                    next_unban_at,
                });
            }
            UploaderResult::Partial(reason) => {
                warn!(uploader = name, reason = %reason, %summary, "Upload partial");
                self.emit(SessionEvent::UploadPartial {
                    uploader: name.to_string(),
                    summary,
                    reason: reason.clone(),
                });
            }
            UploaderResult::Failed(reason) => {
                error!(uploader = name, reason = %reason, "Upload failed");
                self.emit(SessionEvent::UploadFailed {
                    uploader: name.to_string(),
                    reason: reason.clone(),
                });
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Fold a later chunk outcome into the running combination.
fn merge_outcomes(mut acc: StageOutcome, next: StageOutcome) -> StageOutcome {
    acc.success = next.success;
    acc.transfer_count += next.transfer_count;
    acc.total_bytes += next.total_bytes;
    acc.duration += next.duration;
    acc.avg_speed = if acc.duration.as_secs_f64() > 0.0 {
        acc.total_bytes as f64 / acc.duration.as_secs_f64()
    } else {
        0.0
    };
    acc.max_transfer |= next.max_transfer;
    acc.early_terminated |= next.early_terminated;
    acc.delay_hours = next.delay_hours;
    acc.rate_limit = next.rate_limit;
    acc.fatal = next.fatal;
    acc.exit_code = next.exit_code;
    acc
}

// =============================================================================
// Tests
// =============================================================================
