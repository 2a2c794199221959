//! Push and Pull
//!
//! Resolves command-line sources into queue requests, runs them through a
//! [`TransferQueue`] and reports progress on stderr. Ctrl-C cancels every
//! task and stops folder expansion.

use crate::config::Config;
use crate::diagnostics::TransferArgs;
use adbcopy_core::path;
use adbcopy_core::progress::{format_hms, format_speed};
use adbcopy_core::{
    CancelFlag, CommandChannel, ConflictPolicy, DeviceId, DeviceWatcher, Direction, FileRequest,
    FolderRequest, QueueEvent, SortKey, TaskState, TaskView, TransferQueue,
};
use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Width of the progress line, cleared before other output
const LINE_WIDTH: usize = 78;

/// Sources and destination as given on the command line
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub device: DeviceId,
    pub direction: Direction,
    pub sources: Vec<String>,
    pub destination: String,
    pub conflict: Option<ConflictPolicy>,
}

impl TransferJob {
    /// Split `paths` into sources and the trailing destination
    pub fn from_paths(
        device: DeviceId,
        direction: Direction,
        mut paths: Vec<String>,
        fallback_destination: Option<&Path>,
    ) -> Result<Self> {
        let destination = match (paths.len(), fallback_destination) {
            (0, _) => bail!("Nothing to copy"),
            (1, Some(fallback)) => fallback.to_string_lossy().into_owned(),
            (1, None) => bail!("Missing destination"),
            _ => paths.pop().ok_or_else(|| anyhow!("Missing destination"))?,
        };

        Ok(Self {
            device,
            direction,
            sources: paths,
            destination,
            conflict: None,
        })
    }

    pub fn with_conflict(mut self, conflict: Option<ConflictPolicy>) -> Self {
        self.conflict = conflict;
        self
    }
}

/// One resolved source
#[derive(Debug)]
enum Planned {
    File(FileRequest),
    Folder(FolderRequest),
}

/// Run a push or pull to completion
///
/// Fails when any task did not complete or a folder could not be expanded.
pub async fn run(
    channel: Arc<dyn CommandChannel>,
    config: &Config,
    job: TransferJob,
    args: &TransferArgs,
) -> Result<()> {
    let mut queue_config = config.transfer.clone();
    if let Some(jobs) = args.jobs {
        queue_config.max_concurrency = jobs;
    }
    let queue =
        TransferQueue::new(Arc::clone(&channel), queue_config).context("Invalid transfer settings")?;

    let planned = match job.direction {
        Direction::Upload => plan_push(channel.as_ref(), &job).await?,
        Direction::Download => plan_pull(channel.as_ref(), &job).await?,
    };
    debug!("Planned {} source(s) for {}", planned.len(), job.device);

    let watcher = Arc::new(DeviceWatcher::new(Arc::clone(&channel), config.poll_interval()));
    if let Err(e) = watcher.poll_once().await {
        warn!("Initial device poll failed: {}", e);
    }
    let forward = watcher.forward_to(queue.clone());
    let poller = watcher.spawn();
    let printer = spawn_printer(&queue);

    let interrupt = CancelFlag::new();
    let signal = spawn_interrupt_handler(queue.clone(), interrupt.clone());

    let started = Instant::now();
    let mut expansion_failures = 0;
    queue.start().await;

    for item in planned {
        if interrupt.is_set() {
            break;
        }
        match item {
            Planned::File(request) => {
                queue.enqueue_file(request).await;
            }
            Planned::Folder(request) => {
                let source = request.source.clone();
                match queue.enqueue_folder(request.with_cancel(interrupt.clone())).await {
                    Ok(report) => info!(
                        "{}: {} file(s) in {} folder(s), {} warning(s)",
                        source,
                        report.tasks.len(),
                        report.directories,
                        report.warnings.len()
                    ),
                    Err(e) => {
                        expansion_failures += 1;
                        clear_line();
                        error!("Cannot copy {}: {}", source, e.user_message());
                    }
                }
            }
        }
    }

    queue.wait_idle().await;
    for handle in [signal, poller, forward, printer] {
        handle.abort();
    }
    clear_line();

    let views = queue.snapshot_sorted(SortKey::Creation, false).await;
    let stats = queue.stats().await;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&views).context("Failed to serialize tasks")?
        );
    } else {
        for view in &views {
            println!("{}", outcome_line(view));
        }
    }

    eprintln!(
        "{} copied ({}) in {}, {} skipped, {} failed, {} cancelled",
        stats.completed,
        format_size(stats.transferred_bytes),
        format_hms(started.elapsed()),
        stats.skipped,
        stats.failed,
        stats.cancelled
    );

    let incomplete = stats.failed + stats.cancelled + expansion_failures;
    if incomplete > 0 {
        bail!("{} transfer(s) did not complete", incomplete);
    }
    Ok(())
}

async fn plan_push(channel: &dyn CommandChannel, job: &TransferJob) -> Result<Vec<Planned>> {
    let into_dir = job.sources.len() > 1
        || job.destination.ends_with(path::SEPARATOR)
        || remote_is_dir(channel, &job.device, &job.destination).await?;

    let mut planned = Vec::with_capacity(job.sources.len());
    for source in &job.sources {
        let metadata = tokio::fs::metadata(source)
            .await
            .with_context(|| format!("Cannot read {}", source))?;

        let target = if into_dir {
            let name = local_name(Path::new(source))
                .ok_or_else(|| anyhow!("Cannot name {} on the device", source))?;
            path::join(&job.destination, &name)
        } else {
            path::normalize(&job.destination)
        };

        if metadata.is_dir() {
            let mut request =
                FolderRequest::new(job.device.clone(), source.as_str(), target, Direction::Upload);
            if let Some(conflict) = job.conflict {
                request = request.with_conflict(conflict);
            }
            planned.push(Planned::Folder(request));
        } else {
            let mut request = FileRequest::upload(job.device.clone(), source.as_str(), target)
                .with_size(metadata.len());
            if let Some(conflict) = job.conflict {
                request = request.with_conflict(conflict);
            }
            planned.push(Planned::File(request));
        }
    }
    Ok(planned)
}

async fn plan_pull(channel: &dyn CommandChannel, job: &TransferJob) -> Result<Vec<Planned>> {
    let destination = PathBuf::from(&job.destination);
    let into_dir = job.sources.len() > 1
        || job.destination.ends_with(std::path::MAIN_SEPARATOR)
        || destination.is_dir();

    let mut planned = Vec::with_capacity(job.sources.len());
    for source in &job.sources {
        let remote = path::normalize(source);

        let target = if into_dir {
            let name = path::file_name(&remote)
                .ok_or_else(|| anyhow!("Cannot pull {} without a file name", remote))?;
            destination.join(name)
        } else {
            destination.clone()
        };
        let target = target.to_string_lossy().into_owned();

        if remote_is_dir(channel, &job.device, &remote).await? {
            let mut request =
                FolderRequest::new(job.device.clone(), remote, target, Direction::Download);
            if let Some(conflict) = job.conflict {
                request = request.with_conflict(conflict);
            }
            planned.push(Planned::Folder(request));
            continue;
        }

        if !channel.path_exists(&job.device, &remote).await? {
            bail!("{}: no such file on {}", remote, job.device);
        }

        let mut request = FileRequest::download(job.device.clone(), remote.as_str(), target);
        match channel.file_size(&job.device, &remote).await {
            Ok(size) => request = request.with_size(size),
            Err(e) => debug!("Size of {} unknown: {}", remote, e),
        }
        if let Some(conflict) = job.conflict {
            request = request.with_conflict(conflict);
        }
        planned.push(Planned::File(request));
    }
    Ok(planned)
}

/// Whether `remote` is a directory, following symlinks
async fn remote_is_dir(channel: &dyn CommandChannel, device: &DeviceId, remote: &str) -> Result<bool> {
    let output = channel
        .execute(
            device,
            &format!("test -d {} && echo YES || echo NO", path::shell_quote(remote)),
            channel.command_timeout(),
        )
        .await
        .with_context(|| format!("Cannot inspect {} on {}", remote, device))?;
    Ok(output.trim() == "YES")
}

/// Final component of a local path, resolving `.` and `..`
fn local_name(source: &Path) -> Option<String> {
    let resolved;
    let named = match source.file_name() {
        Some(_) => source,
        None => {
            resolved = std::fs::canonicalize(source).ok()?;
            resolved.as_path()
        }
    };
    named.file_name().map(|name| name.to_string_lossy().into_owned())
}

fn spawn_interrupt_handler(queue: TransferQueue, interrupt: CancelFlag) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            return;
        }
        interrupt.set();
        let cancelled = queue.cancel_all().await;
        clear_line();
        warn!("Interrupted, cancelled {} task(s)", cancelled);
    })
}

fn spawn_printer(queue: &TransferQueue) -> JoinHandle<()> {
    let mut events = queue.subscribe();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(QueueEvent::Snapshot(views)) => {
                    if let Some(line) = progress_line(&views) {
                        eprint!("\r{:<width$.width$}", line, width = LINE_WIDTH);
                    }
                }
                Ok(QueueEvent::Warning(message)) => {
                    clear_line();
                    warn!("{}", message);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Progress printer skipped {} event(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn clear_line() {
    eprint!("\r{:width$}\r", "", width = LINE_WIDTH);
}

/// One line per task once the queue is idle
fn outcome_line(view: &TaskView) -> String {
    let label = match view.state {
        TaskState::Completed => "done",
        TaskState::Skipped => "skipped",
        TaskState::Cancelled => "cancelled",
        TaskState::Failed => "failed",
        TaskState::Queued | TaskState::Running | TaskState::Paused => "pending",
    };
    match &view.error {
        Some(error) if view.state == TaskState::Failed => {
            format!("{:<9} {} -> {}: {}", label, view.source, view.destination, error.message)
        }
        _ => format!("{:<9} {} -> {}", label, view.source, view.destination),
    }
}

/// Aggregate progress of a snapshot, `None` when nothing is running
fn progress_line(views: &[TaskView]) -> Option<String> {
    let running: Vec<&TaskView> = views
        .iter()
        .filter(|view| view.state == TaskState::Running)
        .collect();
    if running.is_empty() {
        return None;
    }

    let counted = views
        .iter()
        .filter(|view| !matches!(view.state, TaskState::Cancelled | TaskState::Skipped));
    let (mut transferred, mut total) = (0u64, 0u64);
    for view in counted {
        transferred += view.transferred;
        total += view.total.unwrap_or(view.transferred);
    }

    let done = views
        .iter()
        .filter(|view| view.state == TaskState::Completed)
        .count();
    let speed: f64 = running.iter().map(|view| view.speed).sum();
    let eta = if speed > 0.0 && total > transferred {
        format_hms(Duration::from_secs_f64((total - transferred) as f64 / speed))
    } else {
        "--:--:--".to_string()
    };
    let percent = if total == 0 {
        100.0
    } else {
        transferred as f64 * 100.0 / total as f64
    };

    Some(format!(
        "{}/{} files  {}/{}  {:.0}%  {}  ETA {}",
        done,
        views.len(),
        format_size(transferred),
        format_size(total),
        percent,
        format_speed(speed),
        eta
    ))
}

/// Human readable byte count
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use adbcopy_core::{TaskId, TaskState};
    use chrono::Local;
    use tempfile::TempDir;

    fn view(id: u64, state: TaskState, total: Option<u64>, transferred: u64) -> TaskView {
        TaskView {
            id: TaskId(id),
            device: "emulator-5554".to_string(),
            name: format!("file{}.bin", id),
            source: format!("/sdcard/file{}.bin", id),
            destination: format!("/tmp/file{}.bin", id),
            direction: Direction::Download,
            state,
            total,
            transferred,
            retry_count: 0,
            attempts: 1,
            error: None,
            conflict: ConflictPolicy::Fail,
            created_at: Local::now(),
            started_at: None,
            finished_at: None,
            speed: 0.0,
            eta_secs: None,
        }
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_job_takes_trailing_destination() {
        let job = TransferJob::from_paths(
            DeviceId::new("phone"),
            Direction::Upload,
            vec!["a.txt".into(), "b.txt".into(), "/sdcard/Download".into()],
            None,
        )
        .unwrap();
        assert_eq!(job.sources, vec!["a.txt", "b.txt"]);
        assert_eq!(job.destination, "/sdcard/Download");
    }

    #[test]
    fn test_lone_pull_source_uses_fallback() {
        let fallback = PathBuf::from("/home/user/Downloads");
        let job = TransferJob::from_paths(
            DeviceId::new("phone"),
            Direction::Download,
            vec!["/sdcard/DCIM".into()],
            Some(fallback.as_path()),
        )
        .unwrap();
        assert_eq!(job.sources, vec!["/sdcard/DCIM"]);
        assert_eq!(job.destination, "/home/user/Downloads");

        assert!(TransferJob::from_paths(
            DeviceId::new("phone"),
            Direction::Upload,
            vec!["a.txt".into()],
            None
        )
        .is_err());
    }

    #[test]
    fn test_local_name_resolves_dot() {
        let dir = TempDir::new().unwrap();
        let inner = dir.path().join("photos");
        std::fs::create_dir(&inner).unwrap();

        assert_eq!(local_name(&inner).as_deref(), Some("photos"));
        assert_eq!(local_name(&inner.join(".")).as_deref(), Some("photos"));
        assert_eq!(local_name(&inner.join("..")).as_deref(), dir.path().file_name().and_then(|n| n.to_str()));
    }

    #[test]
    fn test_progress_line_needs_running_task() {
        let views = vec![view(1, TaskState::Completed, Some(10), 10)];
        assert!(progress_line(&views).is_none());
    }

    #[test]
    fn test_progress_line_ignores_skipped() {
        let mut running = view(2, TaskState::Running, Some(2048), 1024);
        running.speed = 1024.0;
        let views = vec![
            view(1, TaskState::Completed, Some(1024), 1024),
            running,
            view(3, TaskState::Skipped, Some(1_000_000), 0),
        ];

        let line = progress_line(&views).unwrap();
        assert_eq!(
            line,
            "1/3 files  2.0 KB/3.0 KB  67%  1.0 KB/s  ETA 00:00:01"
        );
    }

    #[test]
    fn test_outcome_line_includes_error() {
        let mut failed = view(4, TaskState::Failed, Some(10), 3);
        failed.error = Some(adbcopy_core::task::TaskError {
            message: "Device disconnected: phone".to_string(),
            kind: adbcopy_core::ErrorKind::DeviceDisconnected,
        });
        assert_eq!(
            outcome_line(&failed),
            "failed    /sdcard/file4.bin -> /tmp/file4.bin: Device disconnected: phone"
        );
        assert_eq!(
            outcome_line(&view(5, TaskState::Completed, Some(1), 1)),
            "done      /sdcard/file5.bin -> /tmp/file5.bin"
        );
    }
}
