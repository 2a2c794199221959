//! Transfer Tasks
//!
//! A [`TransferTask`] is one file copy between the host and a device. Tasks
//! are owned by the [`TransferQueue`](crate::queue::TransferQueue); every state
//! change goes through a transition method that rejects moves the lifecycle
//! does not allow.
//!
//! ## Lifecycle
//!
//! ```text
//! Queued ──► Running ──► Completed | Skipped | Cancelled
//!   ▲  │        │  │
//!   │  │        │  └──► Failed ──► Queued (retry, new ticket)
//!   │  │        ▼
//!   │  │      Paused ──► Queued (resume, same ticket)
//!   │  ▼        │
//!   └ Cancelled ◄┘
//! ```

use crate::channel::DeviceId;
use crate::{AdbError, ErrorKind, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Task identifier, assigned monotonically; doubles as creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Copy direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Host to device
    Upload,
    /// Device to host
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskState {
    /// No worker will pick this task up again without an explicit retry
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled | TaskState::Skipped
        )
    }

    /// Ended successfully or by user choice, eligible for `clear_completed`
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Skipped
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// What to do when the destination already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Fail the task with `DestinationConflict`
    #[default]
    Fail,
    /// Replace the existing destination
    Overwrite,
    /// Leave the destination alone and mark the task skipped
    Skip,
    /// Write to the first free `name (n).ext` instead
    Rename,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(ConflictPolicy::Fail),
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            "skip" => Ok(ConflictPolicy::Skip),
            "rename" => Ok(ConflictPolicy::Rename),
            other => Err(format!(
                "unknown conflict policy '{}' (expected fail, overwrite, skip or rename)",
                other
            )),
        }
    }
}

/// Shared boolean flag polled at cooperative checkpoints
///
/// Used both for cancellation and for pause requests. Clones observe the
/// same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Failure recorded on a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    pub kind: ErrorKind,
}

impl From<&AdbError> for TaskError {
    fn from(error: &AdbError) -> Self {
        Self {
            message: error.to_string(),
            kind: error.kind(),
        }
    }
}

/// One file copy
#[derive(Debug)]
pub struct TransferTask {
    pub(crate) id: TaskId,
    pub(crate) device: DeviceId,
    pub(crate) source: String,
    pub(crate) destination: String,
    pub(crate) direction: Direction,
    pub(crate) total: Option<u64>,
    pub(crate) transferred: u64,
    pub(crate) state: TaskState,
    pub(crate) retry_count: u32,
    pub(crate) attempts: u32,
    pub(crate) generation: u64,
    pub(crate) last_error: Option<TaskError>,
    pub(crate) conflict: ConflictPolicy,
    pub(crate) ticket: u64,
    pub(crate) created_at: DateTime<Local>,
    pub(crate) started_at: Option<DateTime<Local>>,
    pub(crate) finished_at: Option<DateTime<Local>>,
    pub(crate) cancel: CancelFlag,
    pub(crate) pause: CancelFlag,
    /// Failure to record instead of `Cancelled` when the worker stops
    pub(crate) abort: Option<TaskError>,
}

impl TransferTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: TaskId,
        ticket: u64,
        device: DeviceId,
        source: String,
        destination: String,
        direction: Direction,
        total: Option<u64>,
        conflict: ConflictPolicy,
    ) -> Self {
        Self {
            id,
            device,
            source,
            destination,
            direction,
            total,
            transferred: 0,
            state: TaskState::Queued,
            retry_count: 0,
            attempts: 0,
            generation: 0,
            last_error: None,
            conflict,
            ticket,
            created_at: Local::now(),
            started_at: None,
            finished_at: None,
            cancel: CancelFlag::new(),
            pause: CancelFlag::new(),
            abort: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// File name shown for the task
    pub fn name(&self) -> String {
        crate::path::file_name(&self.source).unwrap_or_else(|| self.source.clone())
    }

    fn transition(&mut self, allowed: &[TaskState], to: TaskState) -> Result<()> {
        if !allowed.contains(&self.state) {
            return Err(AdbError::invalid_state(format!(
                "task {} cannot move from {} to {}",
                self.id, self.state, to
            )));
        }
        self.state = to;
        Ok(())
    }

    /// Queued -> Running; starts a new attempt and returns its generation
    pub(crate) fn start(&mut self) -> Result<u64> {
        self.transition(&[TaskState::Queued], TaskState::Running)?;
        self.attempts += 1;
        self.generation += 1;
        self.pause.clear();
        self.started_at = Some(Local::now());
        self.finished_at = None;
        Ok(self.generation)
    }

    /// Apply a progress report from attempt `generation`
    ///
    /// Reports from an older attempt, reports that would move the counter
    /// backwards and reports for tasks that are no longer running are
    /// ignored. Returns whether the task changed.
    pub(crate) fn record_progress(&mut self, generation: u64, bytes: u64, total: Option<u64>) -> bool {
        if self.state != TaskState::Running || generation != self.generation {
            return false;
        }
        if let Some(total) = total {
            self.total = Some(total.max(self.transferred));
        }
        let bytes = match self.total {
            Some(total) => bytes.min(total),
            None => bytes,
        };
        if bytes <= self.transferred {
            return false;
        }
        self.transferred = bytes;
        true
    }

    /// Running -> Completed
    pub(crate) fn complete(&mut self, bytes: u64) -> Result<()> {
        self.transition(&[TaskState::Running], TaskState::Completed)?;
        self.transferred = self.transferred.max(bytes);
        self.total = Some(self.transferred);
        self.last_error = None;
        self.finished_at = Some(Local::now());
        Ok(())
    }

    /// Running -> Skipped
    pub(crate) fn skip(&mut self) -> Result<()> {
        self.transition(&[TaskState::Running], TaskState::Skipped)?;
        self.finished_at = Some(Local::now());
        Ok(())
    }

    /// Running -> Failed
    pub(crate) fn fail(&mut self, error: &AdbError) -> Result<()> {
        self.fail_with(TaskError::from(error))
    }

    /// Running -> Failed with an already recorded error
    pub(crate) fn fail_with(&mut self, error: TaskError) -> Result<()> {
        self.fail_from(&[TaskState::Running], error)
    }

    /// Fail a task that is not running (device went away while queued)
    pub(crate) fn fail_pending(&mut self, error: &AdbError) -> Result<()> {
        self.fail_from(&[TaskState::Queued, TaskState::Paused], TaskError::from(error))
    }

    fn fail_from(&mut self, allowed: &[TaskState], error: TaskError) -> Result<()> {
        self.transition(allowed, TaskState::Failed)?;
        self.last_error = Some(error);
        self.finished_at = Some(Local::now());
        Ok(())
    }

    /// Running -> Paused
    pub(crate) fn pause(&mut self) -> Result<()> {
        self.transition(&[TaskState::Running], TaskState::Paused)
    }

    /// Paused -> Queued, keeping the admission ticket
    ///
    /// Without `keep_progress` the next attempt restarts from zero.
    pub(crate) fn resume(&mut self, keep_progress: bool) -> Result<()> {
        self.transition(&[TaskState::Paused], TaskState::Queued)?;
        self.pause.clear();
        if !keep_progress {
            self.transferred = 0;
        }
        Ok(())
    }

    /// Failed -> Queued with a fresh ticket at the tail of the pool
    pub(crate) fn retry(&mut self, ticket: u64) -> Result<()> {
        self.transition(&[TaskState::Failed], TaskState::Queued)?;
        self.retry_count += 1;
        self.transferred = 0;
        self.ticket = ticket;
        self.last_error = None;
        self.finished_at = None;
        self.abort = None;
        self.cancel.clear();
        self.pause.clear();
        Ok(())
    }

    /// Queued, Paused or Running -> Cancelled
    pub(crate) fn cancel(&mut self) -> Result<()> {
        self.transition(
            &[TaskState::Queued, TaskState::Paused, TaskState::Running],
            TaskState::Cancelled,
        )?;
        self.cancel.set();
        self.finished_at = Some(Local::now());
        Ok(())
    }

    /// Point-in-time copy for snapshots
    pub(crate) fn view(&self, speed: f64, eta: Option<std::time::Duration>) -> TaskView {
        TaskView {
            id: self.id,
            device: self.device.to_string(),
            name: self.name(),
            source: self.source.clone(),
            destination: self.destination.clone(),
            direction: self.direction,
            state: self.state,
            total: self.total,
            transferred: self.transferred,
            retry_count: self.retry_count,
            attempts: self.attempts,
            error: self.last_error.clone(),
            conflict: self.conflict,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            speed: if self.state == TaskState::Running { speed } else { 0.0 },
            eta_secs: if self.state == TaskState::Running {
                eta.map(|eta| eta.as_secs())
            } else {
                None
            },
        }
    }
}

/// Serializable snapshot of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub device: String,
    pub name: String,
    pub source: String,
    pub destination: String,
    pub direction: Direction,
    pub state: TaskState,
    pub total: Option<u64>,
    pub transferred: u64,
    pub retry_count: u32,
    pub attempts: u32,
    pub error: Option<TaskError>,
    pub conflict: ConflictPolicy,
    pub created_at: DateTime<Local>,
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
    /// Bytes per second over the speed window
    pub speed: f64,
    pub eta_secs: Option<u64>,
}

impl TaskView {
    /// Completion ratio in `0.0..=1.0`, `None` while the size is unknown
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some(self.transferred as f64 / total as f64),
            None => None,
        }
    }
}
