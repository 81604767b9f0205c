//! Command-line argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Log output format for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for uphaul_core::LogFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Text => uphaul_core::LogFormat::Text,
            CliLogFormat::Json => uphaul_core::LogFormat::Json,
        }
    }
}

/// Quota-aware upload orchestrator.
#[derive(Debug, Parser)]
#[command(name = "uphaul", version, about = "Quota-aware upload orchestrator")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short = 'c', long, default_value = "config.json", global = true)]
    pub config: PathBuf,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long, default_value = "text", value_enum, global = true)]
    pub log_format: CliLogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run an upload session across the configured uploaders
    Upload {
        /// Restrict the session to one named uploader
        #[arg(value_name = "UPLOADER")]
        uploader: Option<String>,
    },
}

impl Cli {
    /// Effective verbosity: default is info unless quieted or raised.
    pub fn verbosity(&self) -> u8 {
        // -v maps on top of the info baseline.
        2 + self.verbose
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_subcommand_parses() {
        let cli = Cli::parse_from(["uphaul", "upload"]);
        assert!(matches!(cli.command, Command::Upload { uploader: None }));
        assert_eq!(cli.config, PathBuf::from("config.json"));
        assert_eq!(cli.verbosity(), 2);
    }

    #[test]
    fn upload_accepts_a_single_uploader() {
        let cli = Cli::parse_from(["uphaul", "upload", "gdrive"]);
        assert!(
            matches!(cli.command, Command::Upload { uploader: Some(name) } if name == "gdrive")
        );
    }

    #[test]
    fn verbosity_accumulates() {
        let cli = Cli::parse_from(["uphaul", "-vv", "upload"]);
        assert_eq!(cli.verbosity(), 4);
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = Cli::parse_from([
            "uphaul",
            "upload",
            "--config",
            "/etc/uphaul.json",
            "--log-format",
            "json",
        ]);
        assert_eq!(cli.config, PathBuf::from("/etc/uphaul.json"));
        assert_eq!(cli.log_format, CliLogFormat::Json);
    }
}
