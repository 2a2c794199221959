//! Command Line and Logging
//!
//! Argument parsing for the `adbcopy` binary and tracing initialization.
//! Logs go to stderr so listings and progress on stdout stay scriptable.

use adbcopy_core::ConflictPolicy;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Copy files to and from Android devices over adb
#[derive(Parser, Debug)]
#[command(name = "adbcopy")]
#[command(about = "Copy files to and from Android devices over adb", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "warn", global = true)]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Show timestamps in logs
    #[arg(long, global = true)]
    pub timestamps: bool,

    /// Configuration file instead of the default location
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Device serial, required when several devices are attached
    #[arg(short, long, value_name = "SERIAL", global = true)]
    pub device: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List attached devices
    Devices {
        /// Include offline and unauthorized devices
        #[arg(long)]
        all: bool,
    },

    /// List a remote directory
    Ls {
        /// Remote directory
        #[arg(default_value = "/sdcard")]
        remote: String,

        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Copy local files or folders to the device
    Push {
        /// Local sources followed by the remote destination
        #[arg(required = true, num_args = 2.., value_name = "PATH")]
        paths: Vec<String>,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Copy remote files or folders from the device
    Pull {
        /// Remote sources followed by the local destination; a lone source
        /// goes to the configured download directory
        #[arg(required = true, num_args = 1.., value_name = "PATH")]
        paths: Vec<String>,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Print device attach and detach events until interrupted
    Watch,

    /// Show the effective configuration
    DumpConfig,
}

/// Options shared by `push` and `pull`
#[derive(clap::Args, Debug, Clone, Default)]
pub struct TransferArgs {
    /// What to do when a destination exists (fail, overwrite, skip, rename)
    #[arg(long, value_name = "POLICY")]
    pub on_conflict: Option<ConflictPolicy>,

    /// Number of files copied at the same time
    #[arg(short = 'j', long, value_name = "N")]
    pub jobs: Option<usize>,

    /// Print the final task list as JSON
    #[arg(long)]
    pub json: bool,
}

/// Initialize logging based on CLI configuration
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    debug!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_push_takes_sources_then_destination() {
        let cli = Cli::try_parse_from([
            "adbcopy",
            "push",
            "a.txt",
            "photos",
            "/sdcard/Download",
            "--on-conflict",
            "rename",
        ])
        .unwrap();

        match cli.command {
            Command::Push { paths, transfer } => {
                assert_eq!(paths, vec!["a.txt", "photos", "/sdcard/Download"]);
                assert_eq!(transfer.on_conflict, Some(ConflictPolicy::Rename));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_push_needs_a_destination() {
        assert!(Cli::try_parse_from(["adbcopy", "push", "a.txt"]).is_err());
    }

    #[test]
    fn test_unknown_conflict_policy_is_rejected() {
        let result = Cli::try_parse_from([
            "adbcopy",
            "pull",
            "/sdcard/a.txt",
            "--on-conflict",
            "merge",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["adbcopy", "ls", "/sdcard/DCIM", "--device", "emulator-5554"])
            .unwrap();
        assert_eq!(cli.device.as_deref(), Some("emulator-5554"));
        assert_eq!(cli.log_level, "warn");
        assert!(matches!(cli.command, Command::Ls { ref remote, json: false } if remote == "/sdcard/DCIM"));
    }
}
