//! Chunk planning for batched uploads.
//!
//! Pre-partitions the source listing into fixed-count batches so the
//! engine never re-checks hundreds of thousands of files per invocation.
//! The listing comes from the engine's own recursive name listing (fast,
//! no stat); each batch becomes a file-list artifact in a uniquely
//! prefixed temp directory that is removed when the plan is dropped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::UploaderConfig;
use crate::constants::CHUNK_DIR_PREFIX;
use crate::error::{Error, Result};

/// One materialized batch.
#[derive(Debug)]
pub struct ChunkArtifact {
    /// File-list artifact fed to the engine via its file-list flag.
    pub path: PathBuf,
    /// Number of source files in this batch.
    pub file_count: usize,
}

/// An ordered batch plan over the full source listing.
///
/// Dropping the plan deletes every artifact.
#[derive(Debug)]
pub struct ChunkPlan {
    // Owns the artifact directory; removal happens on drop.
    _dir: TempDir,
    chunks: Vec<ChunkArtifact>,
    total_files: usize,
}

impl ChunkPlan {
    /// The batches, in listing order.
    pub fn chunks(&self) -> &[ChunkArtifact] {
        &self.chunks
    }

    /// Total files across all batches.
    pub fn total_files(&self) -> usize {
        self.total_files
    }
}

/// Builds chunk plans by asking the engine for a recursive listing.
pub struct Chunker {
    engine_binary: PathBuf,
    engine_config: Option<PathBuf>,
    source: PathBuf,
    excludes: Vec<String>,
    timeout: Duration,
}

impl Chunker {
    /// Create a chunker for one uploader.
    ///
    /// `extra_excludes` carries listing-time dynamic exclusions (the
    /// currently-open files) on top of the uploader's static patterns.
    pub fn new(
        engine_binary: &Path,
        engine_config: Option<&Path>,
        uploader: &UploaderConfig,
        extra_excludes: &[String],
    ) -> Self {
        let mut excludes = uploader.excludes.clone();
        excludes.extend(extra_excludes.iter().cloned());
        Self {
            engine_binary: engine_binary.to_path_buf(),
            engine_config: engine_config.map(Path::to_path_buf),
            source: uploader.local_path.clone(),
            excludes,
            timeout: uploader.chunked_upload.generate_list_timeout(),
        }
    }

    /// Generate the listing and materialize the batch plan.
    ///
    /// Returns `None` when the source holds no files. Listing failures and
    /// timeouts are errors; the caller falls back to an unchunked stage.
    pub async fn build_plan(&self, chunk_size: usize) -> Result<Option<ChunkPlan>> {
        let names = self.generate_listing().await?;
        if names.is_empty() {
            info!(source = %self.source.display(), "No files to upload");
            return Ok(None);
        }

        let total_files = names.len();
        let batches = partition(&names, chunk_size);

        // The directory name carries our pid so the orphan sweep can tell
        // a crashed run's leftovers from a live run's artifacts.
        let dir = tempfile::Builder::new()
            .prefix(&format!("{CHUNK_DIR_PREFIX}{}-", std::process::id()))
            .tempdir()
            .map_err(|e| Error::Chunker {
                message: format!("cannot create artifact directory: {e}"),
            })?;

        let mut chunks = Vec::with_capacity(batches.len());
        for (index, batch) in batches.iter().enumerate() {
            let path = dir.path().join(format!("chunk_{:04}.txt", index + 1));
            std::fs::write(&path, batch.join("\n")).map_err(|e| Error::Chunker {
                message: format!("cannot write {}: {e}", path.display()),
            })?;
            debug!(chunk = index + 1, files = batch.len(), "Materialized chunk artifact");
            chunks.push(ChunkArtifact {
                path,
                file_count: batch.len(),
            });
        }

        info!(
            chunks = chunks.len(),
            total_files,
            chunk_size,
            "Chunk plan ready"
        );
        Ok(Some(ChunkPlan {
            _dir: dir,
            chunks,
            total_files,
        }))
    }

    /// Run the engine's plain recursive name listing with a bounded wait.
    async fn generate_listing(&self) -> Result<Vec<String>> {
        let mut command = Command::new(&self.engine_binary);
        command
            .arg("lsf")
            .arg(&self.source)
            .arg("--recursive")
            .arg("--files-only");
        if let Some(config) = &self.engine_config {
            command.arg(format!("--config={}", config.display()));
        }
        for exclude in &self.excludes {
            command.arg(format!("--exclude={exclude}"));
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(source = %self.source.display(), "Generating file list");
        let child = command.spawn().map_err(|e| Error::Chunker {
            message: format!("cannot spawn listing: {e}"),
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Chunker {
                message: format!("listing timed out after {}s", self.timeout.as_secs()),
            })?
            .map_err(|e| Error::Chunker {
                message: format!("listing failed: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Chunker {
                message: format!("listing exited with {}: {}", output.status, stderr.trim()),
            });
        }

        let names: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        info!(files = names.len(), "Generated file list");
        Ok(names)
    }
}

/// Split `names` into ordered batches of at most `chunk_size`.
fn partition(names: &[String], chunk_size: usize) -> Vec<Vec<String>> {
    names
        .chunks(chunk_size.max(1))
        .map(|batch| batch.to_vec())
        .collect()
}

/// Remove artifact directories left behind by a crashed previous run.
///
/// Directory names embed the owning pid; anything tagged with another
/// process's pid is fair game.
pub fn sweep_orphaned_artifacts() {
    let temp = std::env::temp_dir();
    let Ok(entries) = std::fs::read_dir(&temp) else {
        return;
    };

    let own_pid = std::process::id();
    let mut removed = 0usize;
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(rest) = name.strip_prefix(CHUNK_DIR_PREFIX) else {
            continue;
        };
        let owner: Option<u32> = rest.split('-').next().and_then(|s| s.parse().ok());
        if owner == Some(own_pid) || !entry.path().is_dir() {
            continue;
        }
        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Failed to remove orphaned artifacts");
            }
        }
    }
    if removed > 0 {
        info!(removed, "Removed orphaned chunk artifact directories");
    }
}

// =============================================================================
// Tests
// =============================================================================
