//! Progress Reporting
//!
//! Two halves:
//!
//! - [`ProgressSink`] lives inside a copy operation. It turns cumulative byte
//!   counts into [`ProgressEvent`]s at a bounded rate and is the checkpoint
//!   where cancellation and pause requests are observed.
//! - [`ProgressAggregator`] lives with the queue state. It turns byte samples
//!   into speed, elapsed time and ETA over a sliding window.

use crate::task::{CancelFlag, TaskId};
use crate::{AdbError, Result};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

/// One cumulative progress report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub task: TaskId,
    /// Attempt the report belongs to
    pub generation: u64,
    /// Cumulative bytes of the current attempt, including the resume offset
    pub bytes: u64,
    /// Size discovered during the copy, if any
    pub total: Option<u64>,
    pub at: Instant,
}

/// Rate-limited progress reporter handed to copy operations
#[derive(Debug)]
pub struct ProgressSink {
    task: TaskId,
    generation: u64,
    sender: Option<mpsc::Sender<ProgressEvent>>,
    min_interval: Duration,
    last_sent: Option<Instant>,
    total: Option<u64>,
    total_dirty: bool,
    bytes: u64,
    cancel: CancelFlag,
    pause: CancelFlag,
}

impl ProgressSink {
    pub fn new(
        task: TaskId,
        generation: u64,
        sender: mpsc::Sender<ProgressEvent>,
        min_interval: Duration,
        cancel: CancelFlag,
        pause: CancelFlag,
    ) -> Self {
        Self {
            task,
            generation,
            sender: Some(sender),
            min_interval,
            last_sent: None,
            total: None,
            total_dirty: false,
            bytes: 0,
            cancel,
            pause,
        }
    }

    /// A sink that reports nowhere, for one-off copies outside a queue
    pub fn detached(cancel: CancelFlag) -> Self {
        Self {
            task: TaskId(0),
            generation: 0,
            sender: None,
            min_interval: Duration::ZERO,
            last_sent: None,
            total: None,
            total_dirty: false,
            bytes: 0,
            cancel,
            pause: CancelFlag::new(),
        }
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Last cumulative byte count seen by this sink
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Record the total size once the copy knows it
    pub fn set_total(&mut self, total: u64) {
        if self.total != Some(total) {
            self.total = Some(total);
            self.total_dirty = true;
        }
    }

    /// Cooperative checkpoint, called after every chunk
    ///
    /// Fails with `Cancelled` or `Paused` when the matching flag is raised,
    /// otherwise records `bytes` and emits an event if the reporting interval
    /// has elapsed.
    pub fn checkpoint(&mut self, bytes: u64) -> Result<()> {
        if self.cancel.is_set() {
            return Err(AdbError::Cancelled(format!("task {}", self.task)));
        }
        if self.pause.is_set() {
            return Err(AdbError::Paused);
        }

        self.bytes = self.bytes.max(bytes);

        let now = Instant::now();
        let due = match self.last_sent {
            None => true,
            Some(last) => now.duration_since(last) >= self.min_interval,
        };
        if due || self.total_dirty {
            self.emit(now);
        }
        Ok(())
    }

    /// Emit the final count regardless of the reporting interval
    pub fn flush(&mut self) {
        self.emit(Instant::now());
    }

    fn emit(&mut self, now: Instant) {
        let Some(sender) = &self.sender else {
            return;
        };
        let event = ProgressEvent {
            task: self.task,
            generation: self.generation,
            bytes: self.bytes,
            total: self.total,
            at: now,
        };
        // A full channel drops this report; the next one carries the
        // cumulative count anyway
        match sender.try_send(event) {
            Ok(()) => {
                self.last_sent = Some(now);
                self.total_dirty = false;
            }
            Err(e) => trace!("Dropping progress report for task {}: {}", self.task, e),
        }
    }
}

#[derive(Debug)]
struct TaskSamples {
    started: Instant,
    window: VecDeque<(Instant, u64)>,
    total: Option<u64>,
}

/// Speed, elapsed time and ETA estimation
#[derive(Debug)]
pub struct ProgressAggregator {
    window: Duration,
    tasks: HashMap<TaskId, TaskSamples>,
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

impl ProgressAggregator {
    /// Create an aggregator using a sliding window of `window`
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            tasks: HashMap::new(),
        }
    }

    /// Record a cumulative byte count for a task
    ///
    /// A count lower than the previous one means the transfer restarted and
    /// clears the window.
    pub fn on_sample(&mut self, task: TaskId, bytes: u64, at: Instant) {
        let samples = self.tasks.entry(task).or_insert_with(|| TaskSamples {
            started: at,
            window: VecDeque::new(),
            total: None,
        });

        if samples.window.back().is_some_and(|(_, last)| bytes < *last) {
            samples.window.clear();
        }
        samples.window.push_back((at, bytes));

        // Keep a single sample at or before the window boundary as baseline
        let Some(boundary) = at.checked_sub(self.window) else {
            return;
        };
        while samples.window.len() > 2 && samples.window[1].0 <= boundary {
            samples.window.pop_front();
        }

        // Interpolate an older baseline onto the boundary
        if let (Some(&(first_at, first)), Some(&(next_at, next))) =
            (samples.window.front(), samples.window.get(1))
        {
            if first_at < boundary && next_at > boundary {
                let span = next_at.duration_since(first_at).as_nanos();
                let into = boundary.duration_since(first_at).as_nanos();
                let gained = u128::from(next.saturating_sub(first)) * into / span;
                let bytes = first.saturating_add(u64::try_from(gained).unwrap_or(u64::MAX));
                samples.window[0] = (boundary, bytes.min(next));
            }
        }
    }

    pub fn set_total(&mut self, task: TaskId, total: Option<u64>) {
        if let Some(samples) = self.tasks.get_mut(&task) {
            samples.total = total;
        }
    }

    /// Bytes per second over the window, as of now
    pub fn speed(&self, task: TaskId) -> f64 {
        self.speed_at(task, Instant::now())
    }

    /// Bytes per second over the window, as of `now`
    ///
    /// A task whose last sample is older than the window is stalled and
    /// reports zero.
    pub fn speed_at(&self, task: TaskId, now: Instant) -> f64 {
        let Some(samples) = self.tasks.get(&task) else {
            return 0.0;
        };
        let (Some(&(first_at, first)), Some(&(last_at, last))) =
            (samples.window.front(), samples.window.back())
        else {
            return 0.0;
        };
        if now.saturating_duration_since(last_at) > self.window {
            return 0.0;
        }
        let span = last_at.saturating_duration_since(first_at).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        last.saturating_sub(first) as f64 / span
    }

    /// Remaining time, `None` when the total is unknown or nothing moves
    pub fn eta(&self, task: TaskId) -> Option<Duration> {
        self.eta_at(task, Instant::now())
    }

    pub fn eta_at(&self, task: TaskId, now: Instant) -> Option<Duration> {
        let samples = self.tasks.get(&task)?;
        let total = samples.total?;
        let speed = self.speed_at(task, now);
        if speed <= 0.0 {
            return None;
        }
        let done = samples.window.back().map(|(_, bytes)| *bytes).unwrap_or(0);
        let remaining = total.saturating_sub(done) as f64;
        Some(Duration::from_secs_f64(remaining / speed))
    }

    /// Time since the first sample of the task
    pub fn elapsed(&self, task: TaskId) -> Option<Duration> {
        self.tasks
            .get(&task)
            .map(|samples| Instant::now().saturating_duration_since(samples.started))
    }

    /// Sum of the speeds of every tracked task
    pub fn queue_speed(&self) -> f64 {
        let now = Instant::now();
        self.tasks.keys().map(|task| self.speed_at(*task, now)).sum()
    }

    /// Forget the samples of a task that restarts, keeping it tracked
    pub fn reset(&mut self, task: TaskId) {
        if let Some(samples) = self.tasks.get_mut(&task) {
            samples.window.clear();
            samples.started = Instant::now();
        }
    }

    /// Stop tracking a task
    pub fn remove(&mut self, task: TaskId) {
        self.tasks.remove(&task);
    }
}

/// Human readable transfer rate
///
/// ```rust
/// use adbcopy_core::progress::format_speed;
///
/// assert_eq!(format_speed(512.0), "512 B/s");
/// assert_eq!(format_speed(1536.0), "1.5 KB/s");
/// assert_eq!(format_speed(3.0 * 1024.0 * 1024.0), "3.0 MB/s");
/// ```
pub fn format_speed(bytes_per_second: f64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = KIB * 1024.0;
    const GIB: f64 = MIB * 1024.0;

    if bytes_per_second >= GIB {
        format!("{:.1} GB/s", bytes_per_second / GIB)
    } else if bytes_per_second >= MIB {
        format!("{:.1} MB/s", bytes_per_second / MIB)
    } else if bytes_per_second >= KIB {
        format!("{:.1} KB/s", bytes_per_second / KIB)
    } else {
        format!("{:.0} B/s", bytes_per_second.max(0.0))
    }
}

/// Duration as `HH:MM:SS`
pub fn format_hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
