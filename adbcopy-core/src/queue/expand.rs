//! Folder expansion
//!
//! Walks a source tree depth-first and enqueues one task per regular file,
//! keeping the relative layout under the destination. Directories are never
//! created here; workers create them lazily when the first file below them
//! is written, so empty subtrees are not reproduced.

use super::{FileRequest, TransferQueue};
use crate::channel::DeviceId;
use crate::fs_utils::read_local_dir;
use crate::listing::{EntryKind, FileEntry};
use crate::path;
use crate::task::{CancelFlag, ConflictPolicy, Direction, TaskId};
use crate::{AdbError, Result};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Request to copy a directory tree
#[derive(Debug, Clone)]
pub struct FolderRequest {
    pub device: DeviceId,
    /// Directory to copy (local for uploads, remote for downloads)
    pub source: String,
    /// Directory that will mirror `source`
    pub destination: String,
    pub direction: Direction,
    pub conflict: Option<ConflictPolicy>,
    /// Stops the walk at the next directory boundary when set
    pub cancel: Option<CancelFlag>,
}

impl FolderRequest {
    pub fn new(
        device: DeviceId,
        source: impl Into<String>,
        destination: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            device,
            source: source.into(),
            destination: destination.into(),
            direction,
            conflict: None,
            cancel: None,
        }
    }

    pub fn with_conflict(mut self, conflict: ConflictPolicy) -> Self {
        self.conflict = Some(conflict);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// What a folder expansion produced
#[derive(Debug, Clone, Default)]
pub struct ExpansionReport {
    /// Tasks in enqueue order
    pub tasks: Vec<TaskId>,
    /// Directories listed
    pub directories: usize,
    pub warnings: Vec<String>,
    /// The walk stopped early; tasks enqueued so far remain
    pub cancelled: bool,
}

#[derive(Debug)]
struct PendingDir {
    source: String,
    destination: String,
    /// Reached through a symlink whose target kind is not known yet
    via_symlink: bool,
}

impl TransferQueue {
    /// Expand a directory into file tasks
    ///
    /// # Errors
    ///
    /// Fails only when the top-level source cannot be listed. Problems below
    /// it (unreadable subdirectories, cycles, special files) become warnings.
    pub async fn enqueue_folder(&self, request: FolderRequest) -> Result<ExpansionReport> {
        let cancel = request.cancel.clone().unwrap_or_default();
        let mut report = ExpansionReport::default();
        let mut visited: HashSet<String> = HashSet::new();

        let root = match request.direction {
            Direction::Download => path::normalize(&request.source),
            Direction::Upload => request.source.clone(),
        };
        visited.insert(self.directory_key(&request, &root, None).await);

        let mut stack = vec![PendingDir {
            source: root.clone(),
            destination: request.destination.clone(),
            via_symlink: false,
        }];

        info!(
            "Expanding {} {} -> {}",
            request.direction, request.source, request.destination
        );

        while let Some(dir) = stack.pop() {
            if cancel.is_set() {
                info!("Expansion of {} cancelled", request.source);
                report.cancelled = true;
                break;
            }

            let entries = match self.list_source(&request, &dir.source, &mut report).await {
                Ok(entries) => entries,
                Err(e) if dir.source == root && !dir.via_symlink => return Err(e),
                Err(AdbError::NonZeroExit { .. }) if dir.via_symlink => {
                    // Symlink to something that is not a directory
                    self.enqueue_entry(&request, &dir.source, &dir.destination, None, &mut report)
                        .await;
                    continue;
                }
                Err(e) => {
                    self.expansion_warning(
                        &mut report,
                        format!("Cannot list {}: {}", dir.source, e),
                    );
                    continue;
                }
            };
            report.directories += 1;

            let mut subdirs = Vec::new();
            for entry in entries {
                let destination = child_destination(request.direction, &dir.destination, &entry.name);

                match entry.kind {
                    EntryKind::File => {
                        self.enqueue_entry(
                            &request,
                            &entry.path,
                            &destination,
                            Some(entry.size),
                            &mut report,
                        )
                        .await;
                    }
                    EntryKind::Directory | EntryKind::Symlink => {
                        if entry.kind == EntryKind::Symlink && request.direction == Direction::Upload {
                            match local_symlink_kind(&entry.path).await {
                                Some(LocalTarget::File(size)) => {
                                    self.enqueue_entry(
                                        &request,
                                        &entry.path,
                                        &destination,
                                        Some(size),
                                        &mut report,
                                    )
                                    .await;
                                    continue;
                                }
                                Some(LocalTarget::Directory) => {}
                                None => {
                                    self.expansion_warning(
                                        &mut report,
                                        format!("Skipping broken symlink {}", entry.path),
                                    );
                                    continue;
                                }
                            }
                        }

                        let key = self.directory_key(&request, &entry.path, Some(&entry)).await;
                        if !visited.insert(key.clone()) {
                            self.expansion_warning(
                                &mut report,
                                format!("Skipping {}: {} already visited", entry.path, key),
                            );
                            continue;
                        }
                        subdirs.push(PendingDir {
                            source: entry.path.clone(),
                            destination,
                            via_symlink: entry.kind == EntryKind::Symlink
                                && request.direction == Direction::Download,
                        });
                    }
                    _ => {
                        self.expansion_warning(
                            &mut report,
                            format!("Skipping {}: not a regular file", entry.path),
                        );
                    }
                }
            }

            // Reverse so the first subdirectory is walked first
            stack.extend(subdirs.into_iter().rev());
        }

        info!(
            "Expanded {}: {} file(s) in {} directorie(s), {} warning(s)",
            request.source,
            report.tasks.len(),
            report.directories,
            report.warnings.len()
        );
        Ok(report)
    }

    async fn list_source(
        &self,
        request: &FolderRequest,
        dir: &str,
        report: &mut ExpansionReport,
    ) -> Result<Vec<FileEntry>> {
        match request.direction {
            Direction::Download => {
                let listing = self.inner.channel.list_directory(&request.device, dir).await?;
                for warning in listing.warnings {
                    self.expansion_warning(
                        report,
                        format!(
                            "{}: skipped listing line {}: {}",
                            dir, warning.line_number, warning.reason
                        ),
                    );
                }
                Ok(listing.entries)
            }
            Direction::Upload => read_local_dir(dir).await,
        }
    }

    /// Identity of a directory for cycle detection, resolved through symlinks
    async fn directory_key(
        &self,
        request: &FolderRequest,
        dir: &str,
        entry: Option<&FileEntry>,
    ) -> String {
        match request.direction {
            Direction::Download => match entry.and_then(|e| e.link_target.as_deref()) {
                Some(target) if target.starts_with(path::SEPARATOR) => path::normalize(target),
                Some(target) => path::normalize(&format!("{}/{}", path::parent(dir), target)),
                None => path::normalize(dir),
            },
            Direction::Upload => tokio::fs::canonicalize(dir)
                .await
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| dir.to_string()),
        }
    }

    async fn enqueue_entry(
        &self,
        request: &FolderRequest,
        source: &str,
        destination: &str,
        size: Option<u64>,
        report: &mut ExpansionReport,
    ) {
        let file = FileRequest {
            device: request.device.clone(),
            source: source.to_string(),
            destination: destination.to_string(),
            direction: request.direction,
            size,
            conflict: request.conflict,
        };
        let id = self.enqueue_file(file).await;
        debug!("Expansion enqueued {} as task {}", source, id);
        report.tasks.push(id);
    }

    fn expansion_warning(&self, report: &mut ExpansionReport, message: String) {
        self.inner.warning(message.clone());
        report.warnings.push(message);
    }
}

/// Destination of a child entry: device paths for uploads, host paths for downloads
fn child_destination(direction: Direction, parent: &str, name: &str) -> String {
    match direction {
        Direction::Upload => path::join(parent, name),
        Direction::Download => Path::new(parent).join(name).to_string_lossy().into_owned(),
    }
}

enum LocalTarget {
    File(u64),
    Directory,
}

/// What a local symlink points to, `None` when dangling
async fn local_symlink_kind(link: &str) -> Option<LocalTarget> {
    let metadata = tokio::fs::metadata(link).await.ok()?;
    if metadata.is_dir() {
        Some(LocalTarget::Directory)
    } else {
        Some(LocalTarget::File(metadata.len()))
    }
}
