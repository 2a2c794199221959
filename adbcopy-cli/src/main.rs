//! adbcopy
//!
//! Command-line front end of the transfer engine: lists devices and remote
//! directories, copies files and folders in both directions and watches
//! for devices coming and going.

mod config;
mod diagnostics;
mod transfer;

use adbcopy_core::listing::sort_entries;
use adbcopy_core::{AdbChannel, CommandChannel, DeviceEvent, DeviceId, DeviceWatcher, Direction};
use anyhow::{bail, Context, Result};
use clap::Parser;
use config::Config;
use diagnostics::{Cli, Command};
use std::sync::Arc;
use tracing::{info, warn};
use transfer::TransferJob;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    diagnostics::init_logging(&cli)?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    let adb = Arc::new(AdbChannel::new(&config.adb.path).with_timeouts(
        config.transfer.command_timeout(),
        config.transfer.stall_timeout(),
    ));
    let channel: Arc<dyn CommandChannel> = adb.clone();

    match cli.command {
        Command::Devices { all } => list_devices(&adb, all).await,
        Command::Ls { ref remote, json } => {
            let device = select_device(channel.as_ref(), cli.device.as_deref()).await?;
            list_remote(channel.as_ref(), &device, remote, json).await
        }
        Command::Push { paths, transfer: args } => {
            let device = select_device(channel.as_ref(), cli.device.as_deref()).await?;
            let job = TransferJob::from_paths(device, Direction::Upload, paths, None)?
                .with_conflict(args.on_conflict);
            transfer::run(channel, &config, job, &args).await
        }
        Command::Pull { paths, transfer: args } => {
            let device = select_device(channel.as_ref(), cli.device.as_deref()).await?;
            if paths.len() == 1 {
                std::fs::create_dir_all(&config.paths.download_dir)
                    .context("Failed to create download directory")?;
            }
            let job = TransferJob::from_paths(
                device,
                Direction::Download,
                paths,
                Some(config.paths.download_dir.as_path()),
            )?
            .with_conflict(args.on_conflict);
            transfer::run(channel, &config, job, &args).await
        }
        Command::Watch => watch(channel, &config).await,
        Command::DumpConfig => dump_config(&config, cli.config.as_deref()),
    }
}

/// Pick the device to work with
///
/// An explicit serial must be attached and ready. Without one, exactly one
/// ready device must be attached.
async fn select_device(channel: &dyn CommandChannel, requested: Option<&str>) -> Result<DeviceId> {
    if !channel.is_available().await {
        bail!("adb is not available; install platform-tools or set [adb] path in the configuration");
    }

    let devices = channel
        .list_devices()
        .await
        .context("Failed to list devices")?;
    let ready: Vec<_> = devices.into_iter().filter(|d| d.is_ready()).collect();

    match requested {
        Some(serial) => ready
            .into_iter()
            .find(|device| device.id.as_str() == serial)
            .map(|device| device.id)
            .with_context(|| format!("Device {} is not attached or not authorized", serial)),
        None => match ready.as_slice() {
            [] => bail!("No device attached"),
            [only] => {
                info!("Using {} ({})", only.id, only.display_name());
                Ok(only.id.clone())
            }
            several => {
                let serials: Vec<&str> = several.iter().map(|d| d.id.as_str()).collect();
                bail!(
                    "Several devices attached ({}), pick one with --device",
                    serials.join(", ")
                )
            }
        },
    }
}

async fn list_devices(adb: &AdbChannel, all: bool) -> Result<()> {
    let devices = if all {
        adb.list_attached().await
    } else {
        adb.list_devices().await
    }
    .context("Failed to list devices")?;

    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }

    for device in devices {
        println!(
            "{:<24} {:<14} {}",
            device.id.as_str(),
            device.state,
            device.model.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn list_remote(
    channel: &dyn CommandChannel,
    device: &DeviceId,
    remote: &str,
    json: bool,
) -> Result<()> {
    let listing = channel
        .list_directory(device, remote)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))
        .with_context(|| format!("Cannot list {}", remote))?;

    for warning in &listing.warnings {
        warn!("Skipped listing line {}: {}", warning.line_number, warning.line);
    }

    let mut entries = listing.entries;
    sort_entries(&mut entries);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).context("Failed to serialize listing")?
        );
        return Ok(());
    }

    for entry in &entries {
        let modified = entry
            .modified
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".repeat(16));
        let name = match &entry.link_target {
            Some(target) => format!("{} -> {}", entry.name, target),
            None => entry.name.clone(),
        };
        println!(
            "{} {:<10} {:<10} {:>12} {} {}",
            entry.mode_string(),
            entry.owner,
            entry.group,
            transfer::format_size(entry.size),
            modified,
            name
        );
    }
    Ok(())
}

async fn watch(channel: Arc<dyn CommandChannel>, config: &Config) -> Result<()> {
    let watcher = Arc::new(DeviceWatcher::new(channel, config.poll_interval()));
    let mut events = watcher.subscribe();
    let poller = watcher.spawn();

    println!("Watching for devices, press Ctrl+C to stop");
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(DeviceEvent::Attached(device)) => {
                    println!("attached {} ({})", device.id, device.display_name());
                }
                Ok(DeviceEvent::Detached(id)) => println!("detached {}", id),
                Ok(DeviceEvent::Error { message }) => warn!("Device poll failed: {}", message),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Missed {} device event(s)", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                break;
            }
        }
    }

    poller.abort();
    Ok(())
}

fn dump_config(config: &Config, explicit: Option<&std::path::Path>) -> Result<()> {
    let location = explicit
        .map(std::path::Path::to_path_buf)
        .unwrap_or_else(Config::default_path);

    println!("# {}", location.display());
    print!(
        "{}",
        toml::to_string_pretty(config).context("Failed to serialize config")?
    );
    Ok(())
}
