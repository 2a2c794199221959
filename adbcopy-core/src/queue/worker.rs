//! Queue workers
//!
//! A worker owns one slot of the pool. It runs an attempt without holding
//! the queue lock, records the outcome under the lock and either claims the
//! next Queued task or gives the slot back.

use super::{Job, JobOutcome, QueueInner};
use crate::channel::DeviceId;
use crate::fs_utils::{
    cleanup_partial_file, ensure_parent_dir, get_unique_local_path, numbered_name,
    timestamped_name,
};
use crate::path;
use crate::progress::ProgressSink;
use crate::task::{ConflictPolicy, Direction};
use crate::{AdbError, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound for numbered remote candidates before falling back to a timestamp
const MAX_RENAME_CANDIDATES: u32 = 1000;

pub(crate) async fn run_worker(inner: Arc<QueueInner>, mut job: Job) {
    loop {
        let outcome = execute(&inner, &job).await;

        let partial = {
            let mut guard = inner.state.lock().await;
            inner.settle(&mut guard, &job, outcome)
        };
        // The slot stays taken until the leftover is gone
        if let Some((device, direction, destination)) = partial {
            discard_partial(&inner, &device, direction, &destination).await;
        }

        let next = {
            let mut guard = inner.state.lock().await;
            let state = &mut *guard;

            let next = if state.paused {
                None
            } else {
                inner.claim_next(state)
            };
            if next.is_none() {
                state.running = state.running.saturating_sub(1);
                inner.notify_if_idle(state);
            }
            next
        };

        match next {
            Some(claimed) => job = claimed,
            None => break,
        }
    }
}

/// Run one attempt to its outcome
async fn execute(inner: &QueueInner, job: &Job) -> JobOutcome {
    if job.cancel.is_set() {
        return JobOutcome::Cancelled;
    }

    let destination = match resolve_destination(inner, job).await {
        Ok(Some(destination)) => destination,
        Ok(None) => {
            info!("Task {}: {} exists, skipped", job.id, job.destination);
            return JobOutcome::Skipped;
        }
        Err(e) => return JobOutcome::Failed(e),
    };

    if destination != job.destination {
        info!("Task {}: writing to {} instead", job.id, destination);
        let mut state = inner.state.lock().await;
        if let Some(task) = state.tasks.get_mut(&job.id) {
            task.destination = destination.clone();
            state.dirty = true;
        }
    }

    if job.cancel.is_set() {
        return JobOutcome::Cancelled;
    }

    match copy(inner, job, &destination).await {
        Ok(bytes) => JobOutcome::Completed(bytes),
        Err(AdbError::Paused) => {
            if !inner.channel.supports_resume() {
                discard_partial(inner, &job.device, job.direction, &destination).await;
            }
            info!("Task {} paused", job.id);
            JobOutcome::Paused
        }
        Err(AdbError::Cancelled(_)) => {
            discard_partial(inner, &job.device, job.direction, &destination).await;
            info!("Task {} cancelled", job.id);
            JobOutcome::Cancelled
        }
        Err(e) => {
            if !matches!(e, AdbError::DeviceDisconnected(_)) {
                discard_partial(inner, &job.device, job.direction, &destination).await;
            }
            JobOutcome::Failed(e)
        }
    }
}

async fn copy(inner: &QueueInner, job: &Job, destination: &str) -> Result<u64> {
    let mut sink = ProgressSink::new(
        job.id,
        job.generation,
        inner.progress_tx.clone(),
        inner.config.progress_interval(),
        job.cancel.clone(),
        job.pause.clone(),
    );

    match job.direction {
        Direction::Upload => {
            ensure_remote_parent(inner, &job.device, destination).await?;
            inner
                .channel
                .copy_to_device(
                    &job.device,
                    Path::new(&job.source),
                    destination,
                    job.offset,
                    &mut sink,
                )
                .await
        }
        Direction::Download => {
            ensure_parent_dir(destination).await?;
            inner
                .channel
                .copy_from_device(
                    &job.device,
                    &job.source,
                    Path::new(destination),
                    job.offset,
                    &mut sink,
                )
                .await
        }
    }
}

/// Apply the conflict policy; `None` means skip
async fn resolve_destination(inner: &QueueInner, job: &Job) -> Result<Option<String>> {
    // A resumed attempt continues its own partial destination
    if job.offset > 0 {
        return Ok(Some(job.destination.clone()));
    }

    let exists = match job.direction {
        Direction::Upload => {
            inner
                .channel
                .path_exists(&job.device, &job.destination)
                .await?
        }
        Direction::Download => tokio::fs::try_exists(&job.destination)
            .await
            .map_err(|e| AdbError::from_io_error(e, &format!("checking {}", job.destination)))?,
    };
    if !exists {
        return Ok(Some(job.destination.clone()));
    }

    match job.conflict {
        ConflictPolicy::Fail => Err(AdbError::DestinationConflict(job.destination.clone())),
        ConflictPolicy::Overwrite => {
            debug!("Task {}: overwriting {}", job.id, job.destination);
            Ok(Some(job.destination.clone()))
        }
        ConflictPolicy::Skip => Ok(None),
        ConflictPolicy::Rename => match job.direction {
            Direction::Upload => unique_remote_path(inner, &job.device, &job.destination)
                .await
                .map(Some),
            Direction::Download => Ok(Some(
                get_unique_local_path(&job.destination)
                    .await
                    .to_string_lossy()
                    .into_owned(),
            )),
        },
    }
}

/// First free `name (n).ext` next to `wanted` on the device
async fn unique_remote_path(inner: &QueueInner, device: &DeviceId, wanted: &str) -> Result<String> {
    let parent = path::parent(wanted);
    let name = path::file_name(wanted).unwrap_or_default();

    for n in 1..MAX_RENAME_CANDIDATES {
        let candidate = path::join(&parent, &numbered_name(&name, n));
        if !inner.channel.path_exists(device, &candidate).await? {
            return Ok(candidate);
        }
    }
    Ok(path::join(&parent, &timestamped_name(&name)))
}

/// Create the remote parent of `file` once per device and directory
async fn ensure_remote_parent(inner: &QueueInner, device: &DeviceId, file: &str) -> Result<()> {
    let parent = path::parent(file);
    if parent == path::ROOT {
        return Ok(());
    }

    let key = (device.clone(), parent);
    if inner.state.lock().await.created_dirs.contains(&key) {
        return Ok(());
    }

    debug!("Creating remote directory {} on {}", key.1, device);
    inner.channel.make_dir(device, &key.1).await?;
    inner.state.lock().await.created_dirs.insert(key);
    Ok(())
}

/// Remove the partial destination of an interrupted attempt
pub(crate) async fn discard_partial(
    inner: &QueueInner,
    device: &DeviceId,
    direction: Direction,
    destination: &str,
) {
    match direction {
        Direction::Download => cleanup_partial_file(destination).await,
        Direction::Upload => {
            if let Err(e) = inner.channel.remove(device, destination, false).await {
                warn!("Failed to clean up partial upload {}: {}", destination, e);
            } else {
                debug!("Cleaned up partial upload: {}", destination);
            }
        }
    }
}
