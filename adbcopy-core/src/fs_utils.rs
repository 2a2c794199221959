//! Local File System Utilities
//!
//! Safe local file operations used by the transfer engine: lazy parent
//! directory creation, partial-file cleanup, conflict-free destination names
//! and local directory listings in the same [`FileEntry`] model the device
//! listings use.

use crate::listing::{EntryKind, FileEntry, Permissions};
use crate::{AdbError, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Upper bound for numbered candidates before falling back to a timestamp
const MAX_NUMBERED_CANDIDATES: u32 = 1000;

/// Ensure the parent directory of a file exists, creating it if necessary
///
/// # Errors
///
/// Returns `PermissionDenied` if creation fails due to permissions.
/// Returns `Io` for other filesystem errors.
pub async fn ensure_parent_dir(file_path: impl AsRef<Path>) -> Result<()> {
    let file_path = file_path.as_ref();

    if let Some(parent) = file_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            debug!("Creating parent directory: {}", parent.display());

            fs::create_dir_all(parent).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    AdbError::PermissionDenied(format!(
                        "Cannot create directory {}: permission denied",
                        parent.display()
                    ))
                } else {
                    AdbError::from_io_error(e, &format!("creating directory {}", parent.display()))
                }
            })?;
        }
    }

    Ok(())
}

/// Open a local destination file for writing at `offset`
///
/// An offset of zero truncates (or creates) the file. A non-zero offset keeps
/// the first `offset` bytes of an existing partial file and positions the
/// cursor right after them.
pub async fn open_destination(path: impl AsRef<Path>, offset: u64) -> Result<fs::File> {
    let path = path.as_ref();
    ensure_parent_dir(path).await?;

    let context = format!("opening {}", path.display());
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(offset == 0)
        .open(path)
        .await
        .map_err(|e| AdbError::from_io_error(e, &context))?;

    if offset > 0 {
        file.set_len(offset)
            .await
            .map_err(|e| AdbError::from_io_error(e, &context))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| AdbError::from_io_error(e, &context))?;
    }

    debug!("Opened {} at offset {}", path.display(), offset);
    Ok(file)
}

/// Write data to a file, converting disk full errors to `ResourceExhausted`
pub async fn write_file_safe(file: &mut fs::File, data: &[u8]) -> Result<()> {
    file.write_all(data)
        .await
        .map_err(|e| AdbError::from_io_error(e, "writing local file"))
}

/// Delete a partially written file
///
/// Logs failures but never errors.
pub async fn cleanup_partial_file(path: impl AsRef<Path>) {
    let path = path.as_ref();

    if path.exists() {
        if let Err(e) = fs::remove_file(path).await {
            warn!("Failed to clean up partial file {}: {}", path.display(), e);
        } else {
            debug!("Cleaned up partial file: {}", path.display());
        }
    }
}

/// Candidate name number `n` for `filename`: `name (n).ext`
///
/// ```rust
/// use adbcopy_core::fs_utils::numbered_name;
///
/// assert_eq!(numbered_name("photo.jpg", 2), "photo (2).jpg");
/// assert_eq!(numbered_name(".bashrc", 1), ".bashrc (1)");
/// ```
pub fn numbered_name(filename: &str, n: u32) -> String {
    // A leading dot marks a hidden file, not an extension
    match filename.rfind('.').filter(|pos| *pos > 0) {
        Some(pos) => {
            let (name, ext) = filename.split_at(pos);
            format!("{} ({}){}", name, n, ext)
        }
        None => format!("{} ({})", filename, n),
    }
}

/// Fallback name when every numbered candidate is taken
pub fn timestamped_name(filename: &str) -> String {
    let stamp = Local::now().format("%Y%m%d%H%M%S");
    match filename.rfind('.').filter(|pos| *pos > 0) {
        Some(pos) => {
            let (name, ext) = filename.split_at(pos);
            format!("{}_{}{}", name, stamp, ext)
        }
        None => format!("{}_{}", filename, stamp),
    }
}

/// Get a local path that does not collide with an existing file
///
/// Returns `path` itself when it is free, otherwise `name (1).ext`,
/// `name (2).ext`, ... in the same directory.
pub async fn get_unique_local_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if !path.exists() {
        return path.to_path_buf();
    }

    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    for n in 1..MAX_NUMBERED_CANDIDATES {
        let candidate = dir.join(numbered_name(&filename, n));
        if !candidate.exists() {
            return candidate;
        }
    }

    dir.join(timestamped_name(&filename))
}

/// List a local directory as [`FileEntry`] records
///
/// Symlinks are reported as symlinks (not followed); entries whose metadata
/// cannot be read are skipped with a warning.
pub async fn read_local_dir(dir: impl AsRef<Path>) -> Result<Vec<FileEntry>> {
    let dir = dir.as_ref();
    let context = format!("reading directory {}", dir.display());
    let mut reader = fs::read_dir(dir)
        .await
        .map_err(|e| AdbError::from_io_error(e, &context))?;

    let mut entries = Vec::new();
    while let Some(item) = reader
        .next_entry()
        .await
        .map_err(|e| AdbError::from_io_error(e, &context))?
    {
        let item_path = item.path();
        let metadata = match fs::symlink_metadata(&item_path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Skipping {}: {}", item_path.display(), e);
                continue;
            }
        };

        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else {
            local_special_kind(&file_type).unwrap_or(EntryKind::File)
        };

        let link_target = if kind == EntryKind::Symlink {
            fs::read_link(&item_path)
                .await
                .ok()
                .map(|target| target.to_string_lossy().into_owned())
        } else {
            None
        };

        entries.push(FileEntry {
            name: item.file_name().to_string_lossy().into_owned(),
            path: item_path.to_string_lossy().into_owned(),
            kind,
            size: if kind == EntryKind::File { metadata.len() } else { 0 },
            modified: metadata
                .modified()
                .ok()
                .map(|time| DateTime::<Local>::from(time).naive_local()),
            permissions: local_permissions(&metadata),
            owner: String::new(),
            group: String::new(),
            link_target,
        });
    }

    Ok(entries)
}

#[cfg(unix)]
fn local_special_kind(file_type: &std::fs::FileType) -> Option<EntryKind> {
    use std::os::unix::fs::FileTypeExt;

    if file_type.is_char_device() {
        Some(EntryKind::CharDevice)
    } else if file_type.is_block_device() {
        Some(EntryKind::BlockDevice)
    } else if file_type.is_fifo() {
        Some(EntryKind::Pipe)
    } else if file_type.is_socket() {
        Some(EntryKind::Socket)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn local_special_kind(_file_type: &std::fs::FileType) -> Option<EntryKind> {
    None
}

#[cfg(unix)]
fn local_permissions(metadata: &std::fs::Metadata) -> Permissions {
    use std::os::unix::fs::PermissionsExt;
    Permissions::from_mode(metadata.permissions().mode())
}

#[cfg(not(unix))]
fn local_permissions(metadata: &std::fs::Metadata) -> Permissions {
    if metadata.permissions().readonly() {
        Permissions::from_mode(0o444)
    } else {
        Permissions::from_mode(0o644)
    }
}
