//! Command channel trait

use super::device::{DeviceId, DeviceInfo};
use crate::listing::{parse_listing_detailed, ParsedListing};
use crate::path::{self, shell_quote};
use crate::progress::ProgressSink;
use crate::{AdbError, Result};
use async_trait::async_trait;
use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Timeout applied to remote commands unless the channel says otherwise
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote command execution against attached devices
///
/// Implementations must be cheap to share (`Arc<dyn CommandChannel>`) and
/// safe to call from several workers at once.
#[async_trait]
pub trait CommandChannel: Send + Sync + Debug {
    /// Whether the bridge utility is reachable
    ///
    /// Never errors; any detection failure reads as unavailable.
    async fn is_available(&self) -> bool;

    /// Attached and authorized devices, empty when none
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Run one remote command and return its standard output
    ///
    /// # Errors
    ///
    /// - `Timeout` when the command does not finish within `timeout`
    /// - `DeviceDisconnected` when the device is gone
    /// - `NonZeroExit` with the raw stderr when the command fails
    async fn execute(&self, device: &DeviceId, command: &str, timeout: Duration) -> Result<String>;

    /// Stream a local file to `remote`, starting at `offset`
    ///
    /// Reports cumulative bytes through `progress` and returns the number of
    /// bytes the destination holds afterwards.
    async fn copy_to_device(
        &self,
        device: &DeviceId,
        local: &Path,
        remote: &str,
        offset: u64,
        progress: &mut ProgressSink,
    ) -> Result<u64>;

    /// Stream `remote` into a local file, starting at `offset`
    async fn copy_from_device(
        &self,
        device: &DeviceId,
        remote: &str,
        local: &Path,
        offset: u64,
        progress: &mut ProgressSink,
    ) -> Result<u64>;

    /// Whether a non-zero copy offset is honored
    fn supports_resume(&self) -> bool {
        false
    }

    /// Timeout used by the provided helper operations
    fn command_timeout(&self) -> Duration {
        DEFAULT_COMMAND_TIMEOUT
    }

    /// List a remote directory
    ///
    /// The path is listed with a trailing separator so a symlink to a
    /// directory lists the directory it points to.
    async fn list_directory(&self, device: &DeviceId, dir: &str) -> Result<ParsedListing> {
        let dir = path::normalize(dir);
        let target = if dir == path::ROOT {
            dir.clone()
        } else {
            format!("{}/", dir)
        };
        let output = self
            .execute(
                device,
                &format!("ls -la {}", shell_quote(&target)),
                self.command_timeout(),
            )
            .await?;

        let listing = parse_listing_detailed(&output, &dir);
        debug!(
            "Listed {} on {}: {} entries, {} skipped",
            dir,
            device,
            listing.entries.len(),
            listing.warnings.len()
        );
        Ok(listing)
    }

    /// Whether anything exists at `path`
    async fn path_exists(&self, device: &DeviceId, path: &str) -> Result<bool> {
        let output = self
            .execute(
                device,
                &format!("test -e {} && echo YES || echo NO", shell_quote(path)),
                self.command_timeout(),
            )
            .await?;

        match output.trim() {
            "YES" => Ok(true),
            "NO" => Ok(false),
            other => Err(AdbError::RemoteCommandFailed(format!(
                "unexpected existence check output for {}: {:?}",
                path, other
            ))),
        }
    }

    /// Create a directory and any missing parents
    async fn make_dir(&self, device: &DeviceId, path: &str) -> Result<()> {
        self.execute(
            device,
            &format!("mkdir -p {}", shell_quote(path)),
            self.command_timeout(),
        )
        .await
        .map(|_| ())
    }

    /// Remove a file, or a whole tree when `recursive`
    async fn remove(&self, device: &DeviceId, path: &str, recursive: bool) -> Result<()> {
        let flags = if recursive { "-rf" } else { "-f" };
        self.execute(
            device,
            &format!("rm {} {}", flags, shell_quote(path)),
            self.command_timeout(),
        )
        .await
        .map(|_| ())
    }

    /// Rename or move a remote path
    async fn rename(&self, device: &DeviceId, from: &str, to: &str) -> Result<()> {
        self.execute(
            device,
            &format!("mv {} {}", shell_quote(from), shell_quote(to)),
            self.command_timeout(),
        )
        .await
        .map(|_| ())
    }

    /// Size of a remote file in bytes
    async fn file_size(&self, device: &DeviceId, path: &str) -> Result<u64> {
        let output = self
            .execute(
                device,
                &format!("stat -c %s {}", shell_quote(path)),
                self.command_timeout(),
            )
            .await?;

        output
            .trim()
            .parse()
            .map_err(|_| AdbError::Parse(format!("size of {}: {:?}", path, output.trim())))
    }
}
