//! adbcopy Core
//!
//! File-transfer engine for Android devices reached through the adb bridge.
//!
//! - [`channel`]: remote command execution and single-file streaming
//! - [`listing`]: `ls -la` output parsing into [`FileEntry`] records
//! - [`path`]: device path manipulation and navigation history
//! - [`queue`]: concurrent transfer queue with pause, resume, cancel and retry
//! - [`progress`]: rate-limited progress reporting and speed/ETA estimation
//! - [`watcher`]: device attach/detach polling

pub mod channel;
pub mod config;
pub mod fs_utils;
pub mod listing;
pub mod path;
pub mod progress;
pub mod queue;
pub mod task;
pub mod watcher;

mod error;

pub use channel::{AdbChannel, CommandChannel, DeviceId, DeviceInfo};
pub use config::QueueConfig;
pub use error::{AdbError, ErrorKind, Result};
pub use listing::{EntryKind, FileEntry, ParsedListing, Permissions};
pub use progress::{ProgressAggregator, ProgressSink};
pub use queue::{
    ExpansionReport, FileRequest, FolderRequest, QueueEvent, QueueStats, SortKey, TransferQueue,
};
pub use task::{CancelFlag, ConflictPolicy, Direction, TaskId, TaskState, TaskView};
pub use watcher::{DeviceEvent, DeviceWatcher};

#[cfg(test)]
pub(crate) mod test_utils;
