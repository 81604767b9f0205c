//! Live open-file detection.
//!
//! A file still being written under the source tree (an import in
//! progress, a download mid-flight) must not be uploaded half-done.
//! Before each stage the scheduler asks `lsof` which files under the
//! source are currently held open and folds them into the stage's
//! exclude list.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

/// Exclusion-ready patterns for files currently open under `root`.
///
/// Entries matching an `opened_excludes` substring (case-insensitive)
/// stay uploadable. A missing or failing `lsof` yields an empty list and
/// the stage proceeds without the guard.
pub async fn opened_files(root: &Path, opened_excludes: &[String]) -> Vec<String> {
    let output = Command::new("lsof")
        .arg("-wFn")
        .arg("+D")
        .arg(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;

    let output = match output {
        Ok(output) => output,
        Err(e) => {
            warn!(error = %e, "Cannot run lsof, open-file exclusion disabled for this stage");
            return Vec::new();
        }
    };

    // lsof exits non-zero when nothing under the tree is open; stdout is
    // authoritative either way.
    let names = parse_lsof_names(
        &String::from_utf8_lossy(&output.stdout),
        root,
        opened_excludes,
    );

    let mut patterns = Vec::with_capacity(names.len());
    for relative in names {
        if root.join(&relative).is_file() {
            debug!(path = %relative, "File is open, excluding from upload");
            patterns.push(escape_glob(&relative));
        }
    }
    patterns
}

/// Root-relative paths from `lsof -F n` output, minus suppressed entries.
///
/// Field output interleaves `p<pid>`/`f<fd>` records with `n<name>`
/// records; only the name records matter here.
fn parse_lsof_names(data: &str, root: &Path, opened_excludes: &[String]) -> Vec<String> {
    data.lines()
        .filter_map(|line| line.strip_prefix('n'))
        .filter(|name| name.len() > 3)
        .filter_map(|name| Path::new(name).strip_prefix(root).ok())
        .map(|relative| relative.to_string_lossy().into_owned())
        .filter(|relative| {
            let lowered = relative.to_lowercase();
            !opened_excludes
                .iter()
                .any(|needle| lowered.contains(&needle.to_lowercase()))
        })
        .collect()
}

/// Escape engine filter metacharacters so a literal path matches itself.
pub(crate) fn escape_glob(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len());
    for c in path.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '{' | '}' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// =============================================================================
// Tests
// =============================================================================
