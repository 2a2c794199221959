//! In-memory command channel for tests
//!
//! [`MockChannel`] keeps a fake device filesystem and answers the shell
//! commands the provided [`CommandChannel`] helpers issue. Copies move data
//! in small chunks so tests can observe progress, and individual paths can be
//! held at a byte offset or made to fail.

use crate::channel::{CommandChannel, DeviceId, DeviceInfo};
use crate::fs_utils::{open_destination, write_file_safe};
use crate::path;
use crate::progress::ProgressSink;
use crate::queue::TransferQueue;
use crate::task::{Direction, TaskId, TaskState, TaskView};
use crate::{AdbError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const LISTING_DATE: &str = "2024-08-01 15:15";

/// Injected copy failure
#[derive(Debug, Clone)]
pub(crate) enum MockFailure {
    Timeout,
    Exit(i32, String),
    Disconnect,
}

/// One copy the channel was asked to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CopyRecord {
    pub direction: Direction,
    /// Device-side path
    pub remote: String,
    pub offset: u64,
}

#[derive(Debug, Default)]
struct MockState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    symlinks: BTreeMap<String, String>,
    unreadable: HashSet<String>,
    devices: Vec<DeviceInfo>,
    disconnected: HashSet<DeviceId>,
    commands: Vec<String>,
    copies: Vec<CopyRecord>,
    failures: HashMap<String, (MockFailure, u32)>,
    holds: HashMap<String, u64>,
}

#[derive(Debug)]
pub(crate) struct MockChannel {
    state: Mutex<MockState>,
    resumable: bool,
    chunk_size: usize,
    chunk_delay: Duration,
    rm_delay: Duration,
}

impl MockChannel {
    pub fn new() -> Self {
        let mut state = MockState::default();
        state.dirs.insert(path::ROOT.to_string());
        Self {
            state: Mutex::new(state),
            resumable: false,
            chunk_size: 4,
            chunk_delay: Duration::ZERO,
            rm_delay: Duration::ZERO,
        }
    }

    pub fn resumable(mut self) -> Self {
        self.resumable = true;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Slow down `rm`; the command is recorded before the delay
    pub fn with_rm_delay(mut self, delay: Duration) -> Self {
        self.rm_delay = delay;
        self
    }

    pub fn add_device(&self, serial: &str) {
        self.state.lock().unwrap().devices.push(DeviceInfo {
            id: DeviceId::new(serial),
            state: "device".to_string(),
            model: Some("Pixel".to_string()),
            product: None,
        });
    }

    pub fn set_devices(&self, devices: Vec<DeviceInfo>) {
        self.state.lock().unwrap().devices = devices;
    }

    pub fn add_dir(&self, dir: &str) {
        let mut state = self.state.lock().unwrap();
        insert_dir_all(&mut state.dirs, &path::normalize(dir));
    }

    pub fn add_file(&self, file: &str, data: &[u8]) {
        let file = path::normalize(file);
        let mut state = self.state.lock().unwrap();
        insert_dir_all(&mut state.dirs, &path::parent(&file));
        state.files.insert(file, data.to_vec());
    }

    pub fn add_symlink(&self, link: &str, target: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .symlinks
            .insert(path::normalize(link), target.to_string());
    }

    /// Listing `dir` fails with a permission error
    pub fn deny_listing(&self, dir: &str) {
        self.state
            .lock()
            .unwrap()
            .unreadable
            .insert(path::normalize(dir));
    }

    pub fn file(&self, file: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(&path::normalize(file))
            .cloned()
    }

    pub fn has_dir(&self, dir: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .dirs
            .contains(&path::normalize(dir))
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn mkdir_commands(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with("mkdir"))
            .collect()
    }

    pub fn copies(&self) -> Vec<CopyRecord> {
        self.state.lock().unwrap().copies.clone()
    }

    /// Device paths in the order copies started
    pub fn copy_order(&self) -> Vec<String> {
        self.copies().into_iter().map(|c| c.remote).collect()
    }

    /// Stall copies of `remote` once they reach `limit` bytes
    pub fn hold(&self, remote: &str, limit: u64) {
        self.state
            .lock()
            .unwrap()
            .holds
            .insert(path::normalize(remote), limit);
    }

    pub fn release(&self, remote: &str) {
        self.state
            .lock()
            .unwrap()
            .holds
            .remove(&path::normalize(remote));
    }

    /// Fail the next `times` copies of `remote`
    pub fn fail_next(&self, remote: &str, failure: MockFailure, times: u32) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(path::normalize(remote), (failure, times));
    }

    pub fn disconnect(&self, device: &DeviceId) {
        let mut state = self.state.lock().unwrap();
        state.disconnected.insert(device.clone());
        state.devices.retain(|d| &d.id != device);
    }

    fn check_connected(&self, device: &DeviceId) -> Result<()> {
        if self.state.lock().unwrap().disconnected.contains(device) {
            return Err(AdbError::DeviceDisconnected(device.to_string()));
        }
        Ok(())
    }

    /// Record the copy and apply any injected failure
    fn begin_copy(&self, device: &DeviceId, record: CopyRecord) -> Result<()> {
        self.check_connected(device)?;
        let mut state = self.state.lock().unwrap();
        let remote = record.remote.clone();
        state.copies.push(record);

        let Some((failure, remaining)) = state.failures.get_mut(&remote) else {
            return Ok(());
        };
        if *remaining == 0 {
            return Ok(());
        }
        *remaining -= 1;
        Err(match failure.clone() {
            MockFailure::Timeout => AdbError::Timeout(format!("copy of {}", remote)),
            MockFailure::Exit(code, stderr) => AdbError::NonZeroExit { code, stderr },
            MockFailure::Disconnect => AdbError::DeviceDisconnected(device.to_string()),
        })
    }

    fn is_held(&self, remote: &str, sent: u64) -> bool {
        self.state
            .lock()
            .unwrap()
            .holds
            .get(remote)
            .is_some_and(|limit| sent >= *limit)
    }

    /// Spin at a checkpoint while `remote` is held
    async fn wait_while_held(
        &self,
        device: &DeviceId,
        remote: &str,
        sent: u64,
        sink: &mut ProgressSink,
    ) -> Result<()> {
        while self.is_held(remote, sent) {
            self.check_connected(device)?;
            sink.checkpoint(sent)?;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        Ok(())
    }

    fn resolve(&self, state: &MockState, target: &str) -> String {
        let mut current = path::normalize(target);
        for _ in 0..8 {
            match state.symlinks.get(&current) {
                Some(link) if link.starts_with(path::SEPARATOR) => current = path::normalize(link),
                Some(link) => {
                    current = path::normalize(&format!("{}/{}", path::parent(&current), link))
                }
                None => break,
            }
        }
        current
    }

    fn list(&self, target: &str) -> Result<String> {
        let state = self.state.lock().unwrap();
        let dir = self.resolve(&state, target);

        if state.unreadable.contains(&dir) {
            return Err(AdbError::NonZeroExit {
                code: 1,
                stderr: format!("ls: {}: Permission denied", target),
            });
        }
        if !state.dirs.contains(&dir) {
            let reason = if state.files.contains_key(&dir) {
                "Not a directory"
            } else {
                "No such file or directory"
            };
            return Err(AdbError::NonZeroExit {
                code: 1,
                stderr: format!("ls: {}: {}", target, reason),
            });
        }

        let mut lines = vec![
            "total 16".to_string(),
            format!("drwxrwx--x 4 root sdcard_rw 4096 {} .", LISTING_DATE),
            format!("drwxrwx--x 4 root sdcard_rw 4096 {} ..", LISTING_DATE),
        ];
        let children = |p: &String| p.as_str() != path::ROOT && path::parent(p) == dir;

        for sub in state.dirs.iter().filter(|p| children(p)) {
            lines.push(format!(
                "drwxrwx--x 2 root sdcard_rw 4096 {} {}",
                LISTING_DATE,
                path::file_name(sub).unwrap_or_default()
            ));
        }
        for (file, data) in state.files.iter().filter(|(p, _)| children(p)) {
            lines.push(format!(
                "-rw-rw---- 1 root sdcard_rw {} {} {}",
                data.len(),
                LISTING_DATE,
                path::file_name(file).unwrap_or_default()
            ));
        }
        for (link, link_target) in state.symlinks.iter().filter(|(p, _)| children(p)) {
            lines.push(format!(
                "lrwxrwxrwx 1 root root {} {} {} -> {}",
                link_target.len(),
                LISTING_DATE,
                path::file_name(link).unwrap_or_default(),
                link_target
            ));
        }
        Ok(lines.join("\n") + "\n")
    }

    fn run_shell(&self, command: &str) -> Result<String> {
        let words = shell_words(command);
        let arg = |n: usize| words.get(n).cloned().unwrap_or_default();
        let not_found = |p: &str| AdbError::NonZeroExit {
            code: 1,
            stderr: format!("{}: No such file or directory", p),
        };

        match words.first().map(String::as_str) {
            Some("ls") => self.list(&arg(2)),
            Some("test") => {
                let state = self.state.lock().unwrap();
                let target = path::normalize(&arg(2));
                let exists = state.files.contains_key(&target)
                    || state.dirs.contains(&target)
                    || state.symlinks.contains_key(&target);
                Ok(if exists { "YES\n" } else { "NO\n" }.to_string())
            }
            Some("mkdir") => {
                let mut state = self.state.lock().unwrap();
                insert_dir_all(&mut state.dirs, &path::normalize(&arg(2)));
                Ok(String::new())
            }
            Some("rm") => {
                let recursive = arg(1) == "-rf";
                let target = path::normalize(&arg(2));
                let prefix = format!("{}/", target);
                let mut state = self.state.lock().unwrap();
                state.files.remove(&target);
                state.symlinks.remove(&target);
                if recursive {
                    state.files.retain(|p, _| !p.starts_with(&prefix));
                    state.dirs.retain(|p| p != &target && !p.starts_with(&prefix));
                }
                Ok(String::new())
            }
            Some("mv") => {
                let from = path::normalize(&arg(1));
                let to = path::normalize(&arg(2));
                let mut state = self.state.lock().unwrap();
                let data = state.files.remove(&from).ok_or_else(|| not_found(&from))?;
                state.files.insert(to, data);
                Ok(String::new())
            }
            Some("stat") => {
                let target = path::normalize(&arg(3));
                let state = self.state.lock().unwrap();
                state
                    .files
                    .get(&target)
                    .map(|data| format!("{}\n", data.len()))
                    .ok_or_else(|| not_found(&target))
            }
            _ => Err(AdbError::NonZeroExit {
                code: 127,
                stderr: format!("{}: not found", arg(0)),
            }),
        }
    }
}

#[async_trait]
impl CommandChannel for MockChannel {
    async fn is_available(&self) -> bool {
        true
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.state.lock().unwrap().devices.clone())
    }

    async fn execute(&self, device: &DeviceId, command: &str, _timeout: Duration) -> Result<String> {
        self.check_connected(device)?;
        self.state
            .lock()
            .unwrap()
            .commands
            .push(command.to_string());
        if command.starts_with("rm ") && !self.rm_delay.is_zero() {
            tokio::time::sleep(self.rm_delay).await;
        }
        self.run_shell(command)
    }

    async fn copy_to_device(
        &self,
        device: &DeviceId,
        local: &Path,
        remote: &str,
        offset: u64,
        progress: &mut ProgressSink,
    ) -> Result<u64> {
        let remote = path::normalize(remote);
        self.begin_copy(
            device,
            CopyRecord {
                direction: Direction::Upload,
                remote: remote.clone(),
                offset,
            },
        )?;

        if !self.has_dir(&path::parent(&remote)) {
            return Err(AdbError::NonZeroExit {
                code: 1,
                stderr: format!("sh: can't create {}: No such file or directory", remote),
            });
        }

        let data = tokio::fs::read(local)
            .await
            .map_err(|e| AdbError::from_io_error(e, &format!("reading {}", local.display())))?;
        progress.set_total(data.len() as u64);

        {
            let mut state = self.state.lock().unwrap();
            let partial = state.files.entry(remote.clone()).or_default();
            partial.truncate(offset as usize);
        }

        let mut sent = offset.min(data.len() as u64);
        loop {
            self.wait_while_held(device, &remote, sent, progress).await?;
            if sent >= data.len() as u64 {
                break;
            }
            self.check_connected(device)?;

            let end = (sent as usize + self.chunk_size).min(data.len());
            {
                let mut state = self.state.lock().unwrap();
                state
                    .files
                    .entry(remote.clone())
                    .or_default()
                    .extend_from_slice(&data[sent as usize..end]);
            }
            sent = end as u64;
            progress.checkpoint(sent)?;

            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }

        progress.flush();
        Ok(sent)
    }

    async fn copy_from_device(
        &self,
        device: &DeviceId,
        remote: &str,
        local: &Path,
        offset: u64,
        progress: &mut ProgressSink,
    ) -> Result<u64> {
        let remote = path::normalize(remote);
        self.begin_copy(
            device,
            CopyRecord {
                direction: Direction::Download,
                remote: remote.clone(),
                offset,
            },
        )?;

        let data = {
            let state = self.state.lock().unwrap();
            state.files.get(&self.resolve(&state, &remote)).cloned()
        };
        let data = data.ok_or_else(|| AdbError::NonZeroExit {
            code: 1,
            stderr: format!("cat: {}: No such file or directory", remote),
        })?;
        progress.set_total(data.len() as u64);

        let mut file = open_destination(local, offset).await?;
        let mut sent = offset.min(data.len() as u64);
        loop {
            self.wait_while_held(device, &remote, sent, progress).await?;
            if sent >= data.len() as u64 {
                break;
            }
            self.check_connected(device)?;

            let end = (sent as usize + self.chunk_size).min(data.len());
            write_file_safe(&mut file, &data[sent as usize..end]).await?;
            file.flush()
                .await
                .map_err(|e| AdbError::from_io_error(e, "flushing local file"))?;
            sent = end as u64;
            progress.checkpoint(sent)?;

            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }

        progress.flush();
        Ok(sent)
    }

    fn supports_resume(&self) -> bool {
        self.resumable
    }
}

fn insert_dir_all(dirs: &mut BTreeSet<String>, dir: &str) {
    let mut current = dir.to_string();
    while dirs.insert(current.clone()) && current != path::ROOT {
        current = path::parent(&current);
    }
}

/// Split a command line the way a POSIX shell would for single-quoted words
fn shell_words(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for quoted in chars.by_ref() {
                    if quoted == '\'' {
                        break;
                    }
                    current.push(quoted);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Poll `condition` until it holds, panicking after five seconds
pub(crate) async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

/// Wait until task `id` reaches `state` and return its view
pub(crate) async fn wait_for_state(queue: &TransferQueue, id: TaskId, state: TaskState) -> TaskView {
    wait_for(&format!("task {} to be {}", id, state), move || async move {
        queue.task(id).await.is_some_and(|view| view.state == state)
    })
    .await;
    queue.task(id).await.unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_words_unquotes() {
        assert_eq!(
            shell_words(r"mv '/sdcard/it'\''s' '/sdcard/b c'"),
            vec!["mv", "/sdcard/it's", "/sdcard/b c"]
        );
        assert_eq!(
            shell_words("test -e '/a' && echo YES || echo NO"),
            vec!["test", "-e", "/a", "&&", "echo", "YES", "||", "echo", "NO"]
        );
    }

    #[tokio::test]
    async fn test_listing_round_trips_through_parser() {
        let mock = MockChannel::new();
        mock.add_file("/sdcard/DCIM/a.jpg", b"12345");
        mock.add_dir("/sdcard/DCIM/Camera");
        let device = DeviceId::new("mock");

        let listing = mock.list_directory(&device, "/sdcard/DCIM").await.unwrap();
        assert!(listing.warnings.is_empty());
        let names: Vec<_> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Camera", "a.jpg"]);
        assert_eq!(listing.entries[1].size, 5);
        assert_eq!(listing.entries[1].path, "/sdcard/DCIM/a.jpg");
    }
}
