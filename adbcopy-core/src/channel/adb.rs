//! `adb` executable channel
//!
//! Spawns the bridge through `tokio::process`. Children are killed when
//! dropped, so a timed out or cancelled operation never leaves a stray `adb`
//! process behind.
//!
//! ## Streaming
//!
//! - Downloads read the stdout of `adb exec-out cat <path>` in 64 KiB chunks.
//! - Uploads write 64 KiB chunks into the stdin of `adb shell "cat > <path>"`.
//!
//! Every chunk is bounded by the stall timeout.

use super::device::{parse_device_list, DeviceId, DeviceInfo};
use super::r#trait::{CommandChannel, DEFAULT_COMMAND_TIMEOUT};
use crate::fs_utils::{open_destination, write_file_safe};
use crate::path::shell_quote;
use crate::progress::ProgressSink;
use crate::{AdbError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Buffer size for file streaming (64KB)
const BUFFER_SIZE: usize = 65536;

/// Timeout for the availability check
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for listing devices
const DEVICES_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time a copy may go without moving a chunk
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Production channel backed by the `adb` executable
#[derive(Debug, Clone)]
pub struct AdbChannel {
    adb_path: PathBuf,
    command_timeout: Duration,
    stall_timeout: Duration,
}

impl Default for AdbChannel {
    fn default() -> Self {
        Self::new("adb")
    }
}

impl AdbChannel {
    /// Create a channel using the executable at `adb_path` (or on `PATH`)
    pub fn new(adb_path: impl Into<PathBuf>) -> Self {
        Self {
            adb_path: adb_path.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    /// Override the command and per-chunk stall timeouts
    pub fn with_timeouts(mut self, command_timeout: Duration, stall_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self.stall_timeout = stall_timeout;
        self
    }

    pub fn adb_path(&self) -> &Path {
        &self.adb_path
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.adb_path);
        command
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    fn spawn_error(&self, error: std::io::Error) -> AdbError {
        AdbError::from_io_error(error, &format!("spawning {}", self.adb_path.display()))
    }

    /// Run `adb <args>` to completion within `limit`
    async fn run(&self, args: &[&str], limit: Duration) -> Result<Output> {
        debug!("Running adb {}", args.join(" "));

        let child = self.command().args(args).spawn().map_err(|e| self.spawn_error(e))?;

        timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| AdbError::Timeout(format!("adb {} after {:?}", args.join(" "), limit)))?
            .map_err(|e| AdbError::from_io_error(e, "waiting for adb"))
    }

    /// Every device the bridge reports, whatever its state
    pub async fn list_attached(&self) -> Result<Vec<DeviceInfo>> {
        let output = self.run(&["devices", "-l"], DEVICES_TIMEOUT).await?;
        if !output.status.success() {
            return Err(AdbError::DeviceUnavailable(format!(
                "adb devices failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_device_list(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn finish_stream(
        &self,
        device: &DeviceId,
        child: tokio::process::Child,
        what: &str,
    ) -> Result<()> {
        let output = timeout(self.stall_timeout, child.wait_with_output())
            .await
            .map_err(|_| AdbError::Timeout(format!("{} did not exit", what)))?
            .map_err(|e| AdbError::from_io_error(e, what))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(classify_failure(
                device,
                output.status.code().unwrap_or(-1),
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }
}

/// Map a failed bridge invocation to an error variant
///
/// Device-level failures are recognized from the bridge's own messages;
/// anything else is a failure of the remote command itself.
pub fn classify_failure(device: &DeviceId, code: i32, stderr: &str) -> AdbError {
    let lower = stderr.to_lowercase();

    if lower.contains("unauthorized") {
        return AdbError::DeviceUnavailable(format!("{}: {}", device, stderr.trim()));
    }

    let disconnected = (lower.contains("device '") && lower.contains("not found"))
        || lower.contains("device not found")
        || lower.contains("device offline")
        || lower.contains("no devices")
        || lower.contains("error: closed")
        || lower.contains("device still connecting");
    if disconnected {
        return AdbError::DeviceDisconnected(format!("{}: {}", device, stderr.trim()));
    }

    AdbError::NonZeroExit {
        code,
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl CommandChannel for AdbChannel {
    async fn is_available(&self) -> bool {
        match self.run(&["version"], PROBE_TIMEOUT).await {
            Ok(output) => output.status.success(),
            Err(e) => {
                debug!("adb not available: {}", e);
                false
            }
        }
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let devices = self.list_attached().await?;
        Ok(devices.into_iter().filter(DeviceInfo::is_ready).collect())
    }

    async fn execute(&self, device: &DeviceId, command: &str, limit: Duration) -> Result<String> {
        let output = self
            .run(&["-s", device.as_str(), "shell", command], limit)
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_failure(
                device,
                output.status.code().unwrap_or(-1),
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    async fn copy_to_device(
        &self,
        device: &DeviceId,
        local: &Path,
        remote: &str,
        offset: u64,
        progress: &mut ProgressSink,
    ) -> Result<u64> {
        if offset > 0 {
            debug!("Resume offset {} ignored, restarting upload", offset);
        }

        let context = format!("reading {}", local.display());
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| AdbError::from_io_error(e, &context))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| AdbError::from_io_error(e, &context))?
            .len();
        progress.set_total(size);

        info!("Uploading {} -> {}:{} ({} bytes)", local.display(), device, remote, size);

        let remote_command = format!("cat > {}", shell_quote(remote));
        let mut child = self
            .command()
            .args(["-s", device.as_str(), "shell", &remote_command])
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let Some(mut stdin) = child.stdin.take() else {
            return Err(AdbError::Unknown("adb stdin not captured".to_string()));
        };

        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut total_bytes = 0u64;

        let streamed: Result<()> = async {
            loop {
                let bytes_read = timeout(self.stall_timeout, file.read(&mut buffer))
                    .await
                    .map_err(|_| AdbError::Timeout(format!("{} stalled", context)))?
                    .map_err(|e| AdbError::from_io_error(e, &context))?;
                if bytes_read == 0 {
                    break;
                }

                timeout(self.stall_timeout, stdin.write_all(&buffer[..bytes_read]))
                    .await
                    .map_err(|_| AdbError::Timeout(format!("upload to {} stalled", remote)))?
                    .map_err(|e| AdbError::from_io_error(e, &format!("writing {}", remote)))?;

                total_bytes += bytes_read as u64;
                progress.checkpoint(total_bytes)?;
            }
            stdin
                .shutdown()
                .await
                .map_err(|e| AdbError::from_io_error(e, &format!("closing {}", remote)))
        }
        .await;
        drop(stdin);

        match streamed {
            Ok(()) => {}
            // The remote side hung up; its exit status explains why
            Err(AdbError::DeviceDisconnected(reason)) => {
                self.finish_stream(device, child, "adb shell").await?;
                return Err(AdbError::DeviceDisconnected(reason));
            }
            Err(e) => return Err(e),
        }

        self.finish_stream(device, child, "adb shell").await?;
        progress.flush();

        info!("Upload complete: {} bytes to {}:{}", total_bytes, device, remote);
        Ok(total_bytes)
    }

    async fn copy_from_device(
        &self,
        device: &DeviceId,
        remote: &str,
        local: &Path,
        offset: u64,
        progress: &mut ProgressSink,
    ) -> Result<u64> {
        if offset > 0 {
            debug!("Resume offset {} ignored, restarting download", offset);
        }

        // Also surfaces a missing source before any local file is created
        let expected = match self.file_size(device, remote).await {
            Ok(size) => {
                progress.set_total(size);
                Some(size)
            }
            Err(AdbError::Parse(reason)) => {
                warn!("Unknown size for {}: {}", remote, reason);
                None
            }
            Err(e) => return Err(e),
        };

        info!("Downloading {}:{} -> {}", device, remote, local.display());

        let remote_command = format!("cat {}", shell_quote(remote));
        let mut child = self
            .command()
            .args(["-s", device.as_str(), "exec-out", &remote_command])
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let Some(mut stdout) = child.stdout.take() else {
            return Err(AdbError::Unknown("adb stdout not captured".to_string()));
        };

        let mut file = open_destination(local, 0).await?;
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut total_bytes = 0u64;

        loop {
            let bytes_read = timeout(self.stall_timeout, stdout.read(&mut buffer))
                .await
                .map_err(|_| AdbError::Timeout(format!("download of {} stalled", remote)))?
                .map_err(|e| AdbError::from_io_error(e, &format!("reading {}", remote)))?;
            if bytes_read == 0 {
                break;
            }

            write_file_safe(&mut file, &buffer[..bytes_read]).await?;
            total_bytes += bytes_read as u64;
            progress.checkpoint(total_bytes)?;
        }

        file.flush()
            .await
            .map_err(|e| AdbError::from_io_error(e, &format!("flushing {}", local.display())))?;
        drop(stdout);
        self.finish_stream(device, child, "adb exec-out").await?;

        if let Some(expected) = expected {
            if total_bytes != expected {
                return Err(AdbError::RemoteCommandFailed(format!(
                    "short read of {}: received {} bytes, expected {}",
                    remote, total_bytes, expected
                )));
            }
        }
        progress.flush();

        info!("Download complete: {} bytes from {}:{}", total_bytes, device, remote);
        Ok(total_bytes)
    }

    fn command_timeout(&self) -> Duration {
        self.command_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceId {
        DeviceId::new("emulator-5554")
    }

    #[test]
    fn test_classify_disconnect_messages() {
        for stderr in [
            "error: device 'emulator-5554' not found",
            "error: device offline",
            "error: no devices/emulators found",
            "error: closed",
        ] {
            let error = classify_failure(&device(), 1, stderr);
            assert!(
                matches!(error, AdbError::DeviceDisconnected(_)),
                "{} -> {:?}",
                stderr,
                error
            );
        }
    }

    #[test]
    fn test_classify_unauthorized() {
        let error = classify_failure(&device(), 1, "error: device unauthorized.");
        assert!(matches!(error, AdbError::DeviceUnavailable(_)));
    }

    #[test]
    fn test_classify_command_failure_keeps_stderr() {
        let stderr = "ls: /data/secret: Permission denied\n";
        match classify_failure(&device(), 1, stderr) {
            AdbError::NonZeroExit { code, stderr: kept } => {
                assert_eq!(code, 1);
                assert_eq!(kept, stderr);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_command_is_not_a_disconnect() {
        let error = classify_failure(&device(), 127, "/system/bin/sh: stat: not found");
        assert!(matches!(error, AdbError::NonZeroExit { code: 127, .. }));
    }

    #[tokio::test]
    async fn test_missing_executable_is_unavailable() {
        let channel = AdbChannel::new("/nonexistent/adbcopy-test/adb");
        assert!(!channel.is_available().await);

        let error = channel.list_devices().await.unwrap_err();
        assert!(matches!(error, AdbError::DeviceUnavailable(_)));
    }

    #[test]
    fn test_default_timeouts() {
        let channel = AdbChannel::default();
        assert_eq!(channel.command_timeout(), DEFAULT_COMMAND_TIMEOUT);
        assert!(!channel.supports_resume());

        let channel = channel.with_timeouts(Duration::from_secs(5), Duration::from_secs(7));
        assert_eq!(channel.command_timeout(), Duration::from_secs(5));
        assert_eq!(channel.stall_timeout, Duration::from_secs(7));
    }
}
