//! uphaul binary entry point.

mod cli;

use clap::Parser;
use tracing::{error, info, warn};

use uphaul_core::config::Config;
use uphaul_core::session::{SessionEvent, SessionRunner};

use crate::cli::{Cli, Command};

fn main() {
    let cli = Cli::parse();

    if let Err(e) =
        uphaul_core::init_logging(cli.verbosity(), cli.log_file.as_deref(), cli.log_format.into())
    {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "uphaul starting");

    // Fatal configuration errors abort before any uploader work.
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Cannot load configuration");
            eprintln!("uphaul: {e}");
            std::process::exit(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("uphaul: failed to create runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Upload { uploader } => {
            rt.block_on(run_upload(config, uploader.as_deref()))
        }
    };

    if let Err(e) = result {
        error!(error = %e, "Session failed");
        eprintln!("uphaul: {e}");
        std::process::exit(1);
    }
}

async fn run_upload(config: Config, only: Option<&str>) -> uphaul_core::Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();

    // First Ctrl-C terminates the stage gracefully; accounting is flushed
    // before the session winds down.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing accounting before exit");
            let _ = shutdown_tx.send(true);
        }
    });

    // Outcome events go to the log here; an embedding program would route
    // them to its own sinks instead.
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                SessionEvent::UploadStarted { uploader, credentials } => {
                    info!(%uploader, credentials, "Upload starting");
                }
                SessionEvent::UploaderSkipped { uploader, next_unban_at } => {
                    warn!(%uploader, ?next_unban_at, "Upload skipped, no credential available");
                }
                SessionEvent::CredentialBanned { uploader, credential, pattern, unban_at } => {
                    warn!(%uploader, %credential, %pattern, unban_at, "Credential suspended");
                }
                SessionEvent::StageFinished { uploader, stage, files, bytes, early_terminated, .. } => {
                    info!(%uploader, stage, files, bytes, early_terminated, "Stage finished");
                }
                SessionEvent::UploadCompleted { uploader, summary } => {
                    info!(%uploader, %summary, "Upload completed");
                }
                SessionEvent::UploadPartial { uploader, summary, reason } => {
                    warn!(%uploader, %summary, %reason, "Upload ended partially");
                }
                SessionEvent::UploadFailed { uploader, reason } => {
                    error!(%uploader, %reason, "Upload failed");
                }
            }
        }
    });

    let mut runner = SessionRunner::new(config, shutdown_rx)?.with_events(events_tx);
    runner.run(only).await
}
