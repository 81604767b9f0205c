//! Child flag-set composition.
//!
//! One invocation per stage: subcommand, endpoints, credential, the stage
//! parameter bundle, operator extras, and the verbosity the line patterns
//! depend on. Chunked stages swap listing-time filters for a file-list
//! flag.

use std::path::Path;

use crate::config::{CoreConfig, RcConfig, UploaderConfig};
use crate::constants::{ENGINE_STATS_INTERVAL_SECS, GIB, MIB};
use crate::rc::authority_of;
use crate::strategy::{OrderBy, StageParams};

/// Compose the full argument vector for one stage invocation.
///
/// `files_from` points at the current chunk artifact in chunked mode; it
/// suppresses ordering, per-file size, and exclude flags, which were
/// already applied when the listing was generated. `stage_excludes`
/// carries the per-stage dynamic exclusions (currently-open files),
/// already escaped.
pub fn compose_stage_args(
    core: &CoreConfig,
    uploader: &UploaderConfig,
    rc: &RcConfig,
    params: &StageParams,
    credential: &str,
    files_from: Option<&Path>,
    stage_excludes: &[String],
) -> Vec<String> {
    let mut args = vec![
        "copy".to_string(),
        uploader.local_path.display().to_string(),
        uploader.remote_path.clone(),
        format!("--drive-service-account-file={credential}"),
        format!("--transfers={}", params.transfers),
        format!("--max-transfer={}", size_suffix(params.stage_byte_cap)),
        format!("--cutoff-mode={}", params.cutoff_mode.as_flag_value()),
        format!("--stats={ENGINE_STATS_INTERVAL_SECS}s"),
        "-v".to_string(),
    ];

    if let Some(config) = &core.engine_config_path {
        args.push(format!("--config={}", config.display()));
    }
    if core.dry_run {
        args.push("--dry-run".to_string());
    }

    match files_from {
        Some(list) => {
            args.push(format!("--files-from={}", list.display()));
        }
        None => {
            if let Some(cap) = params.per_file_size_cap {
                args.push(format!("--max-size={}", size_suffix(cap)));
            }
            if params.order_by == OrderBy::SizeDesc {
                args.push("--order-by=size,desc".to_string());
            }
            for exclude in uploader.excludes.iter().chain(stage_excludes) {
                args.push(format!("--exclude={exclude}"));
            }
        }
    }

    // The child serves the control plane itself unless a standalone
    // daemon owns the port.
    if !rc.standalone.enabled {
        args.push("--rc".to_string());
        args.push(format!("--rc-addr={}", authority_of(&rc.url)));
        match (&rc.user, &rc.pass) {
            (Some(user), Some(pass)) => {
                args.push(format!("--rc-user={user}"));
                args.push(format!("--rc-pass={pass}"));
            }
            _ => args.push("--rc-no-auth".to_string()),
        }
    }

    for (flag, value) in &uploader.engine_extras {
        if value.is_empty() {
            args.push(flag.clone());
        } else {
            args.push(format!("{flag}={value}"));
        }
    }

    args
}

/// Format a byte count as an engine size value.
///
/// The engine treats bare numbers as kibibytes, so a unit is always
/// attached: whole gibibytes or mebibytes where exact, raw bytes
/// otherwise.
pub fn size_suffix(bytes: u64) -> String {
    if bytes > 0 && bytes % GIB == 0 {
        format!("{}G", bytes / GIB)
    } else if bytes > 0 && bytes % MIB == 0 {
        format!("{}M", bytes / MIB)
    } else {
        format!("{bytes}B")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkConfig, PartialFailurePolicy, StandaloneRcConfig};
    use crate::strategy::select_stage_params;
    use crate::constants::DEFAULT_QUOTA_CAP;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn core() -> CoreConfig {
        CoreConfig {
            engine_binary_path: PathBuf::from("/usr/bin/rclone"),
            engine_config_path: Some(PathBuf::from("/etc/rclone.conf")),
            quota_cap_bytes: DEFAULT_QUOTA_CAP,
            cache_dir: None,
            dry_run: false,
            max_stages: 16,
        }
    }

    fn uploader() -> UploaderConfig {
        let mut extras = BTreeMap::new();
        extras.insert("--drive-chunk-size".to_string(), "128M".to_string());
        extras.insert("--fast-list".to_string(), String::new());
        UploaderConfig {
            local_path: PathBuf::from("/mnt/local"),
            remote_path: "gdrive:/media".into(),
            credential_path: PathBuf::from("/opt/sa"),
            engine_extras: extras,
            excludes: vec!["*.partial".to_string()],
            exclude_open_files: false,
            opened_excludes: Vec::new(),
            chunked_upload: ChunkConfig::default(),
            on_partial_failure: PartialFailurePolicy::Report,
        }
    }

    fn params() -> StageParams {
        select_stage_params(DEFAULT_QUOTA_CAP, None, 1, DEFAULT_QUOTA_CAP)
    }

    #[test]
    fn unchunked_invocation_carries_the_bundle() {
        let args = compose_stage_args(
            &core(),
            &uploader(),
            &RcConfig::default(),
            &params(),
            "/opt/sa/sa-1.json",
            None,
            &[],
        );

        assert_eq!(args[0], "copy");
        assert_eq!(args[1], "/mnt/local");
        assert_eq!(args[2], "gdrive:/media");
        assert!(args.contains(&"--drive-service-account-file=/opt/sa/sa-1.json".to_string()));
        assert!(args.contains(&"--transfers=4".to_string()));
        assert!(args.contains(&"--max-transfer=375G".to_string()));
        assert!(args.contains(&"--cutoff-mode=cautious".to_string()));
        assert!(args.contains(&"--stats=60s".to_string()));
        assert!(args.contains(&"--order-by=size,desc".to_string()));
        assert!(args.contains(&"--exclude=*.partial".to_string()));
        assert!(args.contains(&"--config=/etc/rclone.conf".to_string()));
        assert!(args.contains(&"-v".to_string()));
        // Extras pass through verbatim.
        assert!(args.contains(&"--drive-chunk-size=128M".to_string()));
        assert!(args.contains(&"--fast-list".to_string()));
        // Conservative regime: no per-file cap, no dry-run.
        assert!(!args.iter().any(|a| a.starts_with("--max-size")));
        assert!(!args.contains(&"--dry-run".to_string()));
    }

    #[test]
    fn chunked_invocation_swaps_filters_for_files_from() {
        let list = PathBuf::from("/tmp/uphaul-chunks-x/chunk_0001.txt");
        let args = compose_stage_args(
            &core(),
            &uploader(),
            &RcConfig::default(),
            &params(),
            "/opt/sa/sa-1.json",
            Some(&list),
            &["incoming/live.mkv".to_string()],
        );

        assert!(args.contains(&format!("--files-from={}", list.display())));
        assert!(!args.iter().any(|a| a.starts_with("--max-size")));
        assert!(!args.iter().any(|a| a.starts_with("--order-by")));
        assert!(!args.iter().any(|a| a.starts_with("--exclude")));
        // The byte cap still applies in chunked mode.
        assert!(args.contains(&"--max-transfer=375G".to_string()));
    }

    #[test]
    fn rc_serving_flags_without_standalone() {
        let args = compose_stage_args(
            &core(),
            &uploader(),
            &RcConfig::default(),
            &params(),
            "sa",
            None,
            &[],
        );
        assert!(args.contains(&"--rc".to_string()));
        assert!(args.contains(&"--rc-addr=127.0.0.1:5572".to_string()));
        assert!(args.contains(&"--rc-no-auth".to_string()));
    }

    #[test]
    fn rc_serving_suppressed_with_standalone_daemon() {
        let rc = RcConfig {
            standalone: StandaloneRcConfig {
                enabled: true,
                ..StandaloneRcConfig::default()
            },
            ..RcConfig::default()
        };
        let args = compose_stage_args(&core(), &uploader(), &rc, &params(), "sa", None, &[]);
        assert!(!args.contains(&"--rc".to_string()));
    }

    #[test]
    fn rc_basic_auth_flags() {
        let rc = RcConfig {
            user: Some("admin".to_string()),
            pass: Some("hunter2".to_string()),
            ..RcConfig::default()
        };
        let args = compose_stage_args(&core(), &uploader(), &rc, &params(), "sa", None, &[]);
        assert!(args.contains(&"--rc-user=admin".to_string()));
        assert!(args.contains(&"--rc-pass=hunter2".to_string()));
    }

    #[test]
    fn dry_run_flag() {
        let mut core = core();
        core.dry_run = true;
        let args = compose_stage_args(
            &core,
            &uploader(),
            &RcConfig::default(),
            &params(),
            "sa",
            None,
            &[],
        );
        assert!(args.contains(&"--dry-run".to_string()));
    }

    #[test]
    fn stage_excludes_are_appended_after_static_ones() {
        let open = vec!["incoming/live\\ [4k].mkv".to_string()];
        let args = compose_stage_args(
            &core(),
            &uploader(),
            &RcConfig::default(),
            &params(),
            "sa",
            None,
            &open,
        );

        let excludes: Vec<&String> = args.iter().filter(|a| a.starts_with("--exclude=")).collect();
        assert_eq!(excludes.len(), 2);
        assert_eq!(excludes[0], "--exclude=*.partial");
        assert_eq!(excludes[1], "--exclude=incoming/live\\ [4k].mkv");
    }

    #[test]
    fn size_suffix_prefers_exact_units() {
        assert_eq!(size_suffix(375 * GIB), "375G");
        assert_eq!(size_suffix(512 * MIB), "512M");
        assert_eq!(size_suffix(GIB + 1), format!("{}B", GIB + 1));
        assert_eq!(size_suffix(0), "0B");
    }
}
