//! Error handling for the transfer engine
//!
//! Every fallible operation in the crate returns [`Result`], whose error type
//! [`AdbError`] covers the whole taxonomy of the engine: bridge discovery,
//! remote command execution, listing parsing, transfer interruption and
//! destination conflicts.
//!
//! ## Error Categories
//!
//! ### Device errors
//! - `DeviceUnavailable`: the bridge executable is missing or no device is
//!   attached. Reported once, never retried automatically.
//! - `DeviceDisconnected`: the device went away while a command was running.
//!   Aborts every task bound to that device.
//!
//! ### Command errors
//! - `Timeout`: the command did not finish in time. Retryable.
//! - `NonZeroExit`: the command ran and failed; stderr is kept verbatim.
//!   Retryable up to the task's attempt budget.
//!
//! ### Transfer interruptions
//! - `Cancelled`: user-initiated, not a failure.
//! - `Paused`: a cooperative pause reached a checkpoint.
//!
//! ### Destination errors
//! - `DestinationConflict`: the destination already exists and the caller
//!   did not choose how to resolve it.
//!
//! ## Classification
//!
//! ```rust
//! use adbcopy_core::{AdbError, ErrorKind};
//!
//! let error = AdbError::Timeout("ls -la '/sdcard'".to_string());
//! assert!(error.is_recoverable());
//! assert_eq!(error.kind(), ErrorKind::Timeout);
//!
//! let error = AdbError::DestinationConflict("/sdcard/a.txt".to_string());
//! assert!(!error.is_recoverable());
//! assert!(error.requires_user_action());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, AdbError>;

/// Errors that can occur while talking to a device or moving files
#[derive(Error, Debug)]
pub enum AdbError {
    /// I/O error on the local side
    ///
    /// Automatically converted from `std::io::Error`.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Bridge executable not found or no device attached
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Device detached (or went offline) while an operation was running
    #[error("Device disconnected: {0}")]
    DeviceDisconnected(String),

    /// Remote command or transfer chunk timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Remote command exited with a non-zero status
    #[error("Command exited with status {code}: {stderr}")]
    NonZeroExit {
        /// Exit status, `-1` when the process was killed by a signal
        code: i32,
        /// Raw standard error output
        stderr: String,
    },

    /// Remote command produced output that cannot be used
    #[error("Remote command failed: {0}")]
    RemoteCommandFailed(String),

    /// Listing line that cannot be classified
    #[error("Parse error: {0}")]
    Parse(String),

    /// Operation cancelled by the user
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Transfer interrupted by a pause request
    #[error("Transfer paused")]
    Paused,

    /// Destination already exists
    #[error("Destination already exists: {0}")]
    DestinationConflict(String),

    /// Unknown task identifier
    #[error("Task not found: {0}")]
    TaskNotFound(u64),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Insufficient permissions on the local side
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Disk full or similar exhaustion
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Anything the bridge reported that fits no other category
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Machine-distinguishable error category
///
/// Stored on failed tasks so callers can decide between retrying and giving
/// up without matching on error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Io,
    DeviceUnavailable,
    DeviceDisconnected,
    Timeout,
    NonZeroExit,
    RemoteCommandFailed,
    Parse,
    Cancelled,
    Paused,
    DestinationConflict,
    TaskNotFound,
    InvalidState,
    Configuration,
    PermissionDenied,
    ResourceExhausted,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Io => "io",
            ErrorKind::DeviceUnavailable => "device_unavailable",
            ErrorKind::DeviceDisconnected => "device_disconnected",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NonZeroExit => "non_zero_exit",
            ErrorKind::RemoteCommandFailed => "remote_command_failed",
            ErrorKind::Parse => "parse",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Paused => "paused",
            ErrorKind::DestinationConflict => "destination_conflict",
            ErrorKind::TaskNotFound => "task_not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Configuration => "configuration",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl AdbError {
    /// Convert an I/O error into a more specific variant where possible
    ///
    /// ```rust
    /// use adbcopy_core::AdbError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::TimedOut, "read stalled");
    /// let error = AdbError::from_io_error(io_error, "reading /sdcard/a.bin");
    /// assert!(matches!(error, AdbError::Timeout(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind as IoKind;

        match error.kind() {
            IoKind::TimedOut => AdbError::Timeout(format!("{}: {}", context, error)),
            IoKind::PermissionDenied => {
                AdbError::PermissionDenied(format!("{}: {}", context, error))
            }
            IoKind::NotFound if context.starts_with("spawning") => {
                AdbError::DeviceUnavailable(format!("{}: {}", context, error))
            }
            IoKind::BrokenPipe | IoKind::ConnectionReset | IoKind::UnexpectedEof => {
                AdbError::DeviceDisconnected(format!(
                    "{}: stream interrupted ({})",
                    context, error
                ))
            }
            _ => {
                let message = error.to_string().to_lowercase();
                if message.contains("no space") || message.contains("disk full") {
                    AdbError::ResourceExhausted(format!("{}: {}", context, error))
                } else {
                    AdbError::Io(error)
                }
            }
        }
    }

    /// Machine-readable category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdbError::Io(_) => ErrorKind::Io,
            AdbError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            AdbError::DeviceDisconnected(_) => ErrorKind::DeviceDisconnected,
            AdbError::Timeout(_) => ErrorKind::Timeout,
            AdbError::NonZeroExit { .. } => ErrorKind::NonZeroExit,
            AdbError::RemoteCommandFailed(_) => ErrorKind::RemoteCommandFailed,
            AdbError::Parse(_) => ErrorKind::Parse,
            AdbError::Cancelled(_) => ErrorKind::Cancelled,
            AdbError::Paused => ErrorKind::Paused,
            AdbError::DestinationConflict(_) => ErrorKind::DestinationConflict,
            AdbError::TaskNotFound(_) => ErrorKind::TaskNotFound,
            AdbError::InvalidState(_) => ErrorKind::InvalidState,
            AdbError::Configuration(_) => ErrorKind::Configuration,
            AdbError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            AdbError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            AdbError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Check if this error is transient and the operation may be retried
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AdbError::Timeout(_)
                | AdbError::NonZeroExit { .. }
                | AdbError::RemoteCommandFailed(_)
                | AdbError::Io(_)
        )
    }

    /// Check if this error cannot be resolved without the user
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            AdbError::DeviceUnavailable(_)
                | AdbError::DestinationConflict(_)
                | AdbError::PermissionDenied(_)
                | AdbError::ResourceExhausted(_)
                | AdbError::Configuration(_)
        )
    }

    /// Check if this error is a user interruption rather than a failure
    pub fn is_interruption(&self) -> bool {
        matches!(self, AdbError::Cancelled(_) | AdbError::Paused)
    }

    /// Short message suitable for a status line or notification
    pub fn user_message(&self) -> String {
        match self {
            AdbError::DeviceUnavailable(msg) => {
                format!("Device unavailable: {}. Check that adb is installed and a device is attached.", msg)
            }
            AdbError::DeviceDisconnected(msg) => {
                format!("Device disconnected: {}. Reconnect the device and retry.", msg)
            }
            AdbError::Timeout(msg) => {
                format!("Timeout: {}. The device may be busy or the cable unstable.", msg)
            }
            AdbError::NonZeroExit { code, stderr } => {
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    format!("Command failed with status {}.", code)
                } else {
                    format!("Command failed: {}.", stderr)
                }
            }
            AdbError::DestinationConflict(path) => {
                format!("{} already exists. Choose overwrite, skip or rename.", path)
            }
            AdbError::PermissionDenied(msg) => {
                format!("Permission denied: {}. Check file and directory permissions.", msg)
            }
            AdbError::ResourceExhausted(msg) => {
                format!("Resource exhausted: {}. Free up space and try again.", msg)
            }
            AdbError::Cancelled(msg) => format!("Cancelled: {}.", msg),
            AdbError::Paused => "Paused.".to_string(),
            AdbError::Io(e) => format!("I/O error: {}.", e),
            other => format!("{}.", other),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        AdbError::InvalidState(msg.into())
    }
}
