//! Standalone control-plane daemon supervision.
//!
//! When the operator asks for a standalone control plane, the session loop
//! starts the engine's `rcd` daemon before the first stage, but only if
//! nothing already answers on the configured port. The daemon is
//! supervised, not owned: it is never torn down on exit and never
//! restarted if it dies mid-session.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{RcConfig, StandaloneRcConfig};
use crate::rc::client::{RcClient, authority_of};

/// Ensure the standalone daemon is running if configured.
///
/// Returns `true` when a control plane is answering on the configured
/// address afterwards. Failures degrade: the session proceeds unaided.
pub async fn ensure_standalone_rcd(
    client: &RcClient,
    engine_binary: &Path,
    engine_config: Option<&Path>,
    rc: &RcConfig,
) -> bool {
    if !rc.standalone.enabled {
        debug!("Standalone control plane not enabled");
        return false;
    }

    if client.noop().await {
        info!(addr = client.authority(), "Control-plane daemon already running");
        return true;
    }

    let args = rcd_args(&rc.standalone, &rc.url, engine_config);
    info!(binary = %engine_binary.display(), "Starting standalone control-plane daemon");

    // Detached: no kill_on_drop, output discarded. The daemon outlives the
    // orchestrator on purpose.
    let spawned = Command::new(engine_binary)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();

    if let Err(e) = spawned {
        warn!(error = %e, "Failed to start control-plane daemon");
        return false;
    }

    // Give it a moment to bind before probing.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let up = client.noop().await;
    if up {
        info!(addr = client.authority(), "Control-plane daemon started");
    } else {
        warn!("Control-plane daemon spawned but port is not answering");
    }
    up
}

/// Flag set for the daemon invocation.
fn rcd_args(
    standalone: &StandaloneRcConfig,
    rc_url: &str,
    engine_config: Option<&Path>,
) -> Vec<String> {
    let mut args = vec!["rcd".to_string()];

    if let Some(config) = engine_config {
        args.push(format!("--config={}", config.display()));
    }

    let addr = standalone
        .addr
        .clone()
        .unwrap_or_else(|| authority_of(rc_url).to_string());
    args.push(format!("--rc-addr={addr}"));

    if standalone.no_auth {
        args.push("--rc-no-auth".to_string());
    } else if let (Some(user), Some(pass)) = (&standalone.user, &standalone.pass) {
        args.push(format!("--rc-user={user}"));
        args.push(format!("--rc-pass={pass}"));
    }

    if standalone.web_gui {
        args.push("--rc-web-gui".to_string());
        args.push("--rc-web-gui-no-open-browser".to_string());
    }

    args
}

// =============================================================================
// Tests
// =============================================================================
