//! Transfer Queue
//!
//! Owns every [`TransferTask`], admits them into a bounded set of workers and
//! publishes their progress.
//!
//! ## Concurrency model
//!
//! - All structural changes go through one `tokio::sync::Mutex<QueueState>`.
//!   Snapshots are taken under the same lock.
//! - At most `max_concurrency` tasks are Running. Each worker runs one task
//!   to a terminal or Paused state, then claims the next Queued task under
//!   the lock or gives its slot back.
//! - Copies report progress through a [`ProgressSink`](crate::progress::ProgressSink)
//!   into a bounded channel drained by a single aggregator task.
//! - Admission is FIFO by ticket. A retried task gets a new ticket (tail of
//!   the pool); a resumed task keeps its ticket.
//!
//! ## Example
//!
//! ```rust,ignore
//! use adbcopy_core::channel::{AdbChannel, DeviceId};
//! use adbcopy_core::config::QueueConfig;
//! use adbcopy_core::queue::{FileRequest, TransferQueue};
//! use std::sync::Arc;
//!
//! let queue = TransferQueue::new(Arc::new(AdbChannel::default()), QueueConfig::default())?;
//! let device = DeviceId::new("emulator-5554");
//! queue.enqueue_file(FileRequest::download(device, "/sdcard/a.jpg", "/tmp/a.jpg")).await;
//! queue.start().await;
//! queue.wait_idle().await;
//! ```

mod expand;
mod worker;

pub use expand::{ExpansionReport, FolderRequest};

use crate::channel::{CommandChannel, DeviceId};
use crate::config::QueueConfig;
use crate::path;
use crate::progress::{ProgressAggregator, ProgressEvent};
use crate::task::{
    CancelFlag, ConflictPolicy, Direction, TaskError, TaskId, TaskState, TaskView, TransferTask,
};
use crate::{AdbError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Capacity of the queue event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the progress report channel
const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Request to copy a single file
#[derive(Debug, Clone)]
pub struct FileRequest {
    pub device: DeviceId,
    pub source: String,
    pub destination: String,
    pub direction: Direction,
    /// Known size, `None` when unknown
    pub size: Option<u64>,
    /// Conflict policy, the queue default when `None`
    pub conflict: Option<ConflictPolicy>,
}

impl FileRequest {
    /// Host file to device path
    pub fn upload(device: DeviceId, local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            device,
            source: local.into(),
            destination: remote.into(),
            direction: Direction::Upload,
            size: None,
            conflict: None,
        }
    }

    /// Device file to host path
    pub fn download(device: DeviceId, remote: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            device,
            source: remote.into(),
            destination: local.into(),
            direction: Direction::Download,
            size: None,
            conflict: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_conflict(mut self, conflict: ConflictPolicy) -> Self {
        self.conflict = Some(conflict);
        self
    }
}

/// Notifications published by the queue
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A task entered the queue
    TaskAdded(TaskId),
    /// A task changed lifecycle state
    StateChanged {
        id: TaskId,
        from: TaskState,
        to: TaskState,
    },
    /// Periodic view of every task, only sent when something changed
    Snapshot(Vec<TaskView>),
    /// Non-fatal problem, e.g. a skipped listing line or directory cycle
    Warning(String),
    /// Nothing is running and nothing can be admitted
    Idle,
}

/// Display order of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Creation,
    Name,
    Size,
    State,
}

/// Aggregate view of the queue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    /// Sum of known sizes of tasks that are not cancelled or skipped
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    /// Bytes per second across running tasks
    pub speed: f64,
    pub eta_secs: Option<u64>,
}

/// One admitted attempt handed to a worker
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub id: TaskId,
    pub generation: u64,
    pub device: DeviceId,
    pub source: String,
    pub destination: String,
    pub direction: Direction,
    pub conflict: ConflictPolicy,
    pub offset: u64,
    pub cancel: CancelFlag,
    pub pause: CancelFlag,
}

/// Destination left behind by an interrupted attempt
type Partial = (DeviceId, Direction, String);

/// How an attempt ended
#[derive(Debug)]
pub(crate) enum JobOutcome {
    Completed(u64),
    Skipped,
    Paused,
    Cancelled,
    Failed(AdbError),
}

#[derive(Debug)]
pub(crate) struct QueueState {
    tasks: BTreeMap<TaskId, TransferTask>,
    /// Queued tasks by (ticket, id); entries whose ticket no longer matches
    /// the task are stale and skipped on admission
    pending: BTreeSet<(u64, TaskId)>,
    running: usize,
    next_id: u64,
    next_ticket: u64,
    started: bool,
    paused: bool,
    dirty: bool,
    created_dirs: HashSet<(DeviceId, String)>,
    progress: ProgressAggregator,
    progress_rx: Option<mpsc::Receiver<ProgressEvent>>,
}

impl QueueState {
    fn take_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    fn is_idle(&self) -> bool {
        self.running == 0 && (self.pending.is_empty() || self.paused || !self.started)
    }

    fn views(&self) -> Vec<TaskView> {
        let now = Instant::now();
        self.tasks
            .values()
            .map(|task| {
                task.view(
                    self.progress.speed_at(task.id, now),
                    self.progress.eta_at(task.id, now),
                )
            })
            .collect()
    }
}

#[derive(Debug)]
pub(crate) struct QueueInner {
    channel: Arc<dyn CommandChannel>,
    config: QueueConfig,
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
    progress_tx: mpsc::Sender<ProgressEvent>,
    idle: Notify,
}

impl QueueInner {
    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn state_changed(&self, state: &mut QueueState, id: TaskId, from: TaskState, to: TaskState) {
        state.dirty = true;
        if from != to {
            debug!("Task {}: {} -> {}", id, from, to);
            self.emit(QueueEvent::StateChanged { id, from, to });
        }
    }

    fn warning(&self, message: String) {
        warn!("{}", message);
        self.emit(QueueEvent::Warning(message));
    }

    /// Fill free worker slots; returns the jobs to spawn
    fn admit(&self, state: &mut QueueState) -> Vec<Job> {
        let mut jobs = Vec::new();
        if !state.started || state.paused {
            return jobs;
        }
        while state.running < self.config.max_concurrency {
            let Some(job) = self.claim_next(state) else {
                break;
            };
            state.running += 1;
            jobs.push(job);
        }
        jobs
    }

    /// Move the next Queued task into Running
    fn claim_next(&self, state: &mut QueueState) -> Option<Job> {
        while let Some((ticket, id)) = state.pending.pop_first() {
            let Some(task) = state.tasks.get_mut(&id) else {
                continue;
            };
            if task.state != TaskState::Queued || task.ticket != ticket {
                continue;
            }

            let generation = match task.start() {
                Ok(generation) => generation,
                Err(e) => {
                    warn!("Cannot start task {}: {}", id, e);
                    continue;
                }
            };
            let offset = if self.channel.supports_resume() {
                task.transferred
            } else {
                0
            };

            let job = Job {
                id,
                generation,
                device: task.device.clone(),
                source: task.source.clone(),
                destination: task.destination.clone(),
                direction: task.direction,
                conflict: task.conflict,
                offset,
                cancel: task.cancel.clone(),
                pause: task.pause.clone(),
            };
            let total = task.total;

            state.progress.reset(id);
            state.progress.on_sample(id, offset, Instant::now());
            state.progress.set_total(id, total);
            self.state_changed(state, id, TaskState::Queued, TaskState::Running);
            return Some(job);
        }
        None
    }

    /// Record how an attempt ended
    ///
    /// Returns a partial destination the caller must remove once the lock is
    /// released.
    fn settle(&self, state: &mut QueueState, job: &Job, outcome: JobOutcome) -> Option<Partial> {
        let queue_paused = state.paused;
        let Some(task) = state.tasks.get_mut(&job.id) else {
            return None;
        };
        if task.generation != job.generation || task.state != TaskState::Running {
            return None;
        }

        // A cancel that landed after the pause checkpoint wins over the pause
        let mut partial = None;
        let outcome = match outcome {
            JobOutcome::Paused if job.cancel.is_set() => {
                if self.channel.supports_resume() && task.abort.is_none() {
                    partial = Some((task.device.clone(), task.direction, task.destination.clone()));
                }
                JobOutcome::Cancelled
            }
            other => other,
        };

        let mut disconnected = None;
        let mut requeue = false;
        let result = match outcome {
            JobOutcome::Completed(bytes) => {
                info!("Task {} completed ({} bytes)", job.id, bytes);
                task.complete(bytes)
            }
            JobOutcome::Skipped => task.skip(),
            JobOutcome::Paused => task.pause(),
            JobOutcome::Cancelled => match task.abort.take() {
                Some(error) => {
                    if error.kind == crate::ErrorKind::DeviceDisconnected {
                        disconnected = Some(task.device.clone());
                    }
                    task.fail_with(error)
                }
                None => task.cancel(),
            },
            JobOutcome::Failed(error) => {
                warn!("Task {} failed: {}", job.id, error);
                if matches!(error, AdbError::DeviceDisconnected(_)) {
                    disconnected = Some(task.device.clone());
                }
                let retry = error.is_recoverable()
                    && task.attempts < self.config.max_attempts
                    && !job.cancel.is_set();
                let failed = task.fail(&error);
                requeue = failed.is_ok() && retry;
                failed
            }
        };

        let to = task.state;
        if let Err(e) = result {
            warn!("Task {}: {}", job.id, e);
        }
        if to == TaskState::Paused {
            state.progress.reset(job.id);
        } else {
            state.progress.remove(job.id);
        }
        self.state_changed(state, job.id, TaskState::Running, to);

        // The queue was resumed while this attempt was winding down
        if to == TaskState::Paused && !queue_paused {
            let keep_progress = self.channel.supports_resume();
            if let Some(task) = state.tasks.get_mut(&job.id) {
                if task.resume(keep_progress).is_ok() {
                    debug!("Task {} resumed before its pause settled", job.id);
                    state.pending.insert((task.ticket, job.id));
                    self.state_changed(state, job.id, TaskState::Paused, TaskState::Queued);
                }
            }
        }

        if requeue {
            let ticket = state.take_ticket();
            if let Some(task) = state.tasks.get_mut(&job.id) {
                if task.retry(ticket).is_ok() {
                    info!(
                        "Retrying task {} (attempt {} of {})",
                        job.id,
                        task.attempts + 1,
                        self.config.max_attempts
                    );
                    state.pending.insert((ticket, job.id));
                    self.state_changed(state, job.id, TaskState::Failed, TaskState::Queued);
                }
            }
        }

        if let Some(device) = disconnected {
            self.fail_device(state, &device);
        }
        partial
    }

    /// Abort every task bound to `device`
    fn fail_device(&self, state: &mut QueueState, device: &DeviceId) -> usize {
        let error = AdbError::DeviceDisconnected(device.to_string());
        let mut affected = 0;
        let mut changes = Vec::new();

        for task in state.tasks.values_mut().filter(|t| &t.device == device) {
            match task.state {
                TaskState::Queued | TaskState::Paused => {
                    let from = task.state;
                    if task.fail_pending(&error).is_ok() {
                        state.pending.remove(&(task.ticket, task.id));
                        changes.push((task.id, from));
                        affected += 1;
                    }
                }
                TaskState::Running => {
                    task.abort = Some(TaskError::from(&error));
                    task.cancel.set();
                    affected += 1;
                }
                _ => {}
            }
        }

        for (id, from) in changes {
            state.progress.remove(id);
            self.state_changed(state, id, from, TaskState::Failed);
        }
        if affected > 0 {
            warn!("Device {} disconnected, aborted {} task(s)", device, affected);
        }
        affected
    }

    fn notify_if_idle(&self, state: &QueueState) {
        if state.is_idle() {
            self.emit(QueueEvent::Idle);
            self.idle.notify_waiters();
        }
    }
}

/// Concurrent transfer queue
///
/// Cheap to clone; clones share the same queue.
#[derive(Debug, Clone)]
pub struct TransferQueue {
    inner: Arc<QueueInner>,
}

impl TransferQueue {
    /// Create an idle queue; nothing runs before [`start`](Self::start)
    pub fn new(channel: Arc<dyn CommandChannel>, config: QueueConfig) -> Result<Self> {
        config.validate()?;

        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let state = QueueState {
            tasks: BTreeMap::new(),
            pending: BTreeSet::new(),
            running: 0,
            next_id: 1,
            next_ticket: 1,
            started: false,
            paused: false,
            dirty: false,
            created_dirs: HashSet::new(),
            progress: ProgressAggregator::new(config.speed_window()),
            progress_rx: Some(progress_rx),
        };

        Ok(Self {
            inner: Arc::new(QueueInner {
                channel,
                config,
                state: Mutex::new(state),
                events,
                progress_tx,
                idle: Notify::new(),
            }),
        })
    }

    pub fn channel(&self) -> Arc<dyn CommandChannel> {
        self.inner.channel.clone()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Subscribe to queue events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    fn spawn_workers(&self, jobs: Vec<Job>) {
        for job in jobs {
            tokio::spawn(worker::run_worker(self.inner.clone(), job));
        }
    }

    /// Add a single file copy
    pub async fn enqueue_file(&self, request: FileRequest) -> TaskId {
        let (source, destination) = match request.direction {
            Direction::Upload => (request.source, path::normalize(&request.destination)),
            Direction::Download => (path::normalize(&request.source), request.destination),
        };
        let conflict = request.conflict.unwrap_or(self.inner.config.default_conflict);

        let (id, jobs) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;

            let id = TaskId(state.next_id);
            state.next_id += 1;
            let ticket = state.take_ticket();

            debug!(
                "Enqueued task {}: {} {} -> {}",
                id, request.direction, source, destination
            );
            let task = TransferTask::new(
                id,
                ticket,
                request.device,
                source,
                destination,
                request.direction,
                request.size,
                conflict,
            );
            state.tasks.insert(id, task);
            state.pending.insert((ticket, id));
            state.dirty = true;
            self.inner.emit(QueueEvent::TaskAdded(id));

            let jobs = self.inner.admit(state);
            (id, jobs)
        };

        self.spawn_workers(jobs);
        id
    }

    /// Start processing
    ///
    /// Admits up to `max_concurrency` tasks before returning, so the next
    /// snapshot already shows them Running.
    pub async fn start(&self) {
        let jobs = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;

            if !state.started {
                state.started = true;
                if let Some(rx) = state.progress_rx.take() {
                    tokio::spawn(run_aggregator(
                        Arc::downgrade(&self.inner),
                        rx,
                        self.inner.config.snapshot_interval(),
                    ));
                }
                info!(
                    "Transfer queue started (max {} concurrent)",
                    self.inner.config.max_concurrency
                );
            }

            let jobs = self.inner.admit(state);
            if jobs.is_empty() {
                self.inner.notify_if_idle(state);
            }
            jobs
        };
        self.spawn_workers(jobs);
    }

    /// Pause every running task and stop admitting new ones
    pub async fn pause_all(&self) {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        state.paused = true;
        for task in state.tasks.values().filter(|t| t.state == TaskState::Running) {
            task.pause.set();
        }
        state.dirty = true;
        info!("Transfer queue paused");
    }

    /// Requeue paused tasks (keeping their tickets) and resume admission
    pub async fn resume_all(&self) {
        let keep_progress = self.inner.channel.supports_resume();

        let jobs = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            state.paused = false;

            let mut resumed = Vec::new();
            for task in state.tasks.values_mut() {
                match task.state {
                    TaskState::Paused => {
                        if task.resume(keep_progress).is_ok() {
                            state.pending.insert((task.ticket, task.id));
                            resumed.push(task.id);
                        }
                    }
                    // Pause requested but not yet observed
                    TaskState::Running => task.pause.clear(),
                    _ => {}
                }
            }
            for id in resumed {
                self.inner
                    .state_changed(state, id, TaskState::Paused, TaskState::Queued);
            }

            info!("Transfer queue resumed");
            self.inner.admit(state)
        };
        self.spawn_workers(jobs);
    }

    /// Cancel one task
    ///
    /// A running task stops at its next checkpoint; its partial destination
    /// is removed by the worker.
    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        let cleanup = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;

            let task = state
                .tasks
                .get_mut(&id)
                .ok_or(AdbError::TaskNotFound(id.0))?;

            let from = task.state;
            let cleanup = match from {
                TaskState::Queued => {
                    task.cancel()?;
                    state.pending.remove(&(task.ticket, id));
                    None
                }
                TaskState::Paused => {
                    task.cancel()?;
                    Some((task.device.clone(), task.direction, task.destination.clone()))
                }
                TaskState::Running => {
                    task.cancel.set();
                    return Ok(());
                }
                other => {
                    return Err(AdbError::invalid_state(format!(
                        "task {} is already {}",
                        id, other
                    )))
                }
            };

            state.progress.remove(id);
            self.inner.state_changed(state, id, from, TaskState::Cancelled);
            self.inner.notify_if_idle(state);
            cleanup
        };

        if let Some((device, direction, destination)) = cleanup {
            if self.inner.channel.supports_resume() {
                worker::discard_partial(&self.inner, &device, direction, &destination).await;
            }
        }
        Ok(())
    }

    /// Cancel every task that has not ended; returns how many were affected
    pub async fn cancel_all(&self) -> usize {
        let ids: Vec<TaskId> = {
            let state = self.inner.state.lock().await;
            state
                .tasks
                .values()
                .filter(|t| !t.state.is_terminal())
                .map(|t| t.id)
                .collect()
        };

        let mut cancelled = 0;
        for id in ids {
            if self.cancel(id).await.is_ok() {
                cancelled += 1;
            }
        }
        info!("Cancelled {} task(s)", cancelled);
        cancelled
    }

    /// Requeue a failed task at the tail of the pool
    pub async fn retry(&self, id: TaskId) -> Result<()> {
        self.requeue(id, None).await
    }

    /// Requeue a failed task with a different conflict policy
    ///
    /// This is how a `DestinationConflict` is resolved after the fact.
    pub async fn retry_with(&self, id: TaskId, conflict: ConflictPolicy) -> Result<()> {
        self.requeue(id, Some(conflict)).await
    }

    async fn requeue(&self, id: TaskId, conflict: Option<ConflictPolicy>) -> Result<()> {
        let jobs = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let ticket = state.next_ticket;

            let task = state
                .tasks
                .get_mut(&id)
                .ok_or(AdbError::TaskNotFound(id.0))?;
            task.retry(ticket)?;
            // Manual retries get a fresh attempt budget
            task.attempts = 0;
            if let Some(conflict) = conflict {
                task.conflict = conflict;
            }

            state.next_ticket += 1;
            state.pending.insert((ticket, id));
            self.inner
                .state_changed(state, id, TaskState::Failed, TaskState::Queued);
            self.inner.admit(state)
        };
        self.spawn_workers(jobs);
        Ok(())
    }

    /// Requeue every failed task in creation order
    pub async fn retry_failed(&self) -> usize {
        let ids: Vec<TaskId> = {
            let state = self.inner.state.lock().await;
            state
                .tasks
                .values()
                .filter(|t| t.state == TaskState::Failed)
                .map(|t| t.id)
                .collect()
        };

        let mut retried = 0;
        for id in ids {
            if self.retry(id).await.is_ok() {
                retried += 1;
            }
        }
        retried
    }

    /// Drop completed, cancelled and skipped tasks
    pub async fn clear_completed(&self) -> usize {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let finished: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.state.is_finished())
            .map(|t| t.id)
            .collect();
        for id in &finished {
            state.tasks.remove(id);
            state.progress.remove(*id);
        }
        if !finished.is_empty() {
            state.dirty = true;
        }
        finished.len()
    }

    /// Drop tasks that failed for good; returns how many were removed
    pub async fn clear_failed(&self) -> usize {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let failed: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Failed)
            .map(|t| t.id)
            .collect();
        for id in &failed {
            state.tasks.remove(id);
            state.progress.remove(*id);
        }
        if !failed.is_empty() {
            debug!("Cleared {} failed task(s)", failed.len());
            state.dirty = true;
        }
        failed.len()
    }

    /// Abort every task bound to a device that went away
    ///
    /// Queued and paused tasks fail immediately; running ones fail at their
    /// next checkpoint. Tasks on other devices are unaffected.
    pub async fn device_disconnected(&self, device: &DeviceId) -> usize {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let affected = self.inner.fail_device(state, device);
        self.inner.notify_if_idle(state);
        affected
    }

    /// Every task in creation order
    pub async fn snapshot(&self) -> Vec<TaskView> {
        self.inner.state.lock().await.views()
    }

    /// Every task ordered by `key`; ties keep creation order
    pub async fn snapshot_sorted(&self, key: SortKey, descending: bool) -> Vec<TaskView> {
        let mut views = self.snapshot().await;
        views.sort_by(|a, b| {
            let ordering = match key {
                SortKey::Creation => a.id.cmp(&b.id),
                SortKey::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
                SortKey::Size => a.total.unwrap_or(0).cmp(&b.total.unwrap_or(0)),
                SortKey::State => state_rank(a.state).cmp(&state_rank(b.state)),
            };
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
        views
    }

    /// One task
    pub async fn task(&self, id: TaskId) -> Option<TaskView> {
        self.snapshot().await.into_iter().find(|view| view.id == id)
    }

    /// Counts, byte totals, speed and ETA of the whole queue
    pub async fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock().await;
        let mut stats = QueueStats::default();
        let mut remaining = 0u64;
        let mut remaining_known = true;

        for task in state.tasks.values() {
            match task.state {
                TaskState::Queued => stats.queued += 1,
                TaskState::Running => stats.running += 1,
                TaskState::Paused => stats.paused += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::Failed => stats.failed += 1,
                TaskState::Cancelled => stats.cancelled += 1,
                TaskState::Skipped => stats.skipped += 1,
            }
            if matches!(task.state, TaskState::Cancelled | TaskState::Skipped) {
                continue;
            }

            stats.total_bytes += task.total.unwrap_or(0);
            stats.transferred_bytes += task.transferred;
            if matches!(
                task.state,
                TaskState::Queued | TaskState::Running | TaskState::Paused
            ) {
                match task.total {
                    Some(total) => remaining += total.saturating_sub(task.transferred),
                    None => remaining_known = false,
                }
            }
        }

        stats.speed = state.progress.queue_speed();
        if remaining_known && stats.speed > 0.0 {
            stats.eta_secs = Some((remaining as f64 / stats.speed).ceil() as u64);
        }
        stats
    }

    /// Wait until nothing is running and nothing can be admitted
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.state.lock().await.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

fn state_rank(state: TaskState) -> u8 {
    match state {
        TaskState::Running => 0,
        TaskState::Paused => 1,
        TaskState::Queued => 2,
        TaskState::Failed => 3,
        TaskState::Completed => 4,
        TaskState::Skipped => 5,
        TaskState::Cancelled => 6,
    }
}

/// Apply progress reports and publish throttled snapshots
///
/// Holds only a weak reference so a dropped queue stops the task.
async fn run_aggregator(
    inner: Weak<QueueInner>,
    mut rx: mpsc::Receiver<ProgressEvent>,
    snapshot_interval: Duration,
) {
    let mut tick = tokio::time::interval(snapshot_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = inner.upgrade() else { break };

                let mut guard = inner.state.lock().await;
                let state = &mut *guard;
                if let Some(task) = state.tasks.get_mut(&event.task) {
                    if task.record_progress(event.generation, event.bytes, event.total) {
                        state.progress.on_sample(event.task, task.transferred, event.at);
                        state.progress.set_total(event.task, task.total);
                        state.dirty = true;
                    }
                }
            }
            _ = tick.tick() => {
                let Some(inner) = inner.upgrade() else { break };

                let mut state = inner.state.lock().await;
                if state.dirty {
                    state.dirty = false;
                    let views = state.views();
                    drop(state);
                    inner.emit(QueueEvent::Snapshot(views));
                }
            }
        }
    }

    debug!("Progress aggregator stopped");
}
