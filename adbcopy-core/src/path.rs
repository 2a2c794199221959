//! Path Model
//!
//! String-level manipulation of device paths plus per-panel navigation
//! history. Device paths are POSIX paths using `/`; backslashes coming from a
//! Windows host are treated as separators too, so every function here agrees
//! on a single canonical separator.
//!
//! All functions are pure: nothing here touches the filesystem or the device.
//!
//! ```rust
//! use adbcopy_core::path::{join, normalize, parent};
//!
//! assert_eq!(normalize("//sdcard///DCIM/"), "/sdcard/DCIM");
//! assert_eq!(join("/sdcard/", "Music"), "/sdcard/Music");
//! assert_eq!(parent(&join("/sdcard/", "Music")), normalize("/sdcard/"));
//! ```

use serde::{Deserialize, Serialize};

/// Canonical path separator
pub const SEPARATOR: char = '/';

/// Device root
pub const ROOT: &str = "/";

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Normalize a path to its canonical form
///
/// - `\` becomes `/`
/// - repeated separators collapse into one
/// - `.` segments disappear, `..` removes the previous segment
/// - trailing separators are dropped, except for the root itself
/// - an empty path is the root
///
/// Relative inputs stay relative (`a//b/` becomes `a/b`).
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with(is_separator) || path.is_empty();
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split(is_separator) {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }

    if absolute {
        format!("{}{}", SEPARATOR, segments.join("/"))
    } else if segments.is_empty() {
        ".".to_string()
    } else {
        segments.join("/")
    }
}

/// Join a directory path and an entry name
///
/// The name is taken literally; callers must not pass names containing a
/// separator (the listing parser never produces such names).
pub fn join(parent: &str, name: &str) -> String {
    let parent = normalize(parent);
    if parent == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Parent directory of a path; the root is its own parent
pub fn parent(path: &str) -> String {
    let path = normalize(path);
    match path.rfind(SEPARATOR) {
        Some(0) => ROOT.to_string(),
        Some(pos) => path[..pos].to_string(),
        None => ".".to_string(),
    }
}

/// Last component of a path, `None` for the root
pub fn file_name(path: &str) -> Option<String> {
    let path = normalize(path);
    if path == ROOT || path == "." {
        return None;
    }
    path.rsplit(SEPARATOR).next().map(str::to_string)
}

/// Components of `path` below `base`, or `None` if `path` is not inside it
pub fn relative_to(base: &str, path: &str) -> Option<Vec<String>> {
    let base = normalize(base);
    let path = normalize(path);

    if base == path {
        return Some(Vec::new());
    }

    let prefix = if base == ROOT {
        ROOT.to_string()
    } else {
        format!("{}/", base)
    };

    path.strip_prefix(&prefix)
        .map(|rest| rest.split(SEPARATOR).map(str::to_string).collect())
}

/// Quote a path for a POSIX shell command line
///
/// Single quotes inside the path are closed, escaped and reopened.
pub fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

/// Which side of the two-pane view a history belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelSide {
    Local,
    Remote,
}

/// Back/forward navigation for one panel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationHistory {
    current: String,
    back: Vec<String>,
    forward: Vec<String>,
}

impl NavigationHistory {
    /// Start a history at `start`
    pub fn new(start: &str) -> Self {
        Self {
            current: normalize(start),
            back: Vec::new(),
            forward: Vec::new(),
        }
    }

    /// Current location
    pub fn current(&self) -> &str {
        &self.current
    }

    /// Navigate to a new location
    ///
    /// Pushes the current path onto the back stack and clears the forward
    /// stack. Navigating to the current path is a no-op.
    pub fn go_to(&mut self, path: &str) -> &str {
        let path = normalize(path);
        if path != self.current {
            let previous = std::mem::replace(&mut self.current, path);
            self.back.push(previous);
            self.forward.clear();
        }
        &self.current
    }

    /// Navigate to the parent of the current location
    pub fn up(&mut self) -> &str {
        let up = parent(&self.current);
        self.go_to(&up)
    }

    /// Step back, returning the new current path
    pub fn back(&mut self) -> Option<String> {
        let previous = self.back.pop()?;
        let current = std::mem::replace(&mut self.current, previous);
        self.forward.push(current);
        Some(self.current.clone())
    }

    /// Step forward, returning the new current path
    pub fn forward(&mut self) -> Option<String> {
        let next = self.forward.pop()?;
        let current = std::mem::replace(&mut self.current, next);
        self.back.push(current);
        Some(self.current.clone())
    }

    pub fn can_go_back(&self) -> bool {
        !self.back.is_empty()
    }

    pub fn can_go_forward(&self) -> bool {
        !self.forward.is_empty()
    }
}

/// Navigation state for both panels
#[derive(Debug, Clone)]
pub struct Navigation {
    local: NavigationHistory,
    remote: NavigationHistory,
}

impl Navigation {
    pub fn new(local_start: &str, remote_start: &str) -> Self {
        Self {
            local: NavigationHistory::new(local_start),
            remote: NavigationHistory::new(remote_start),
        }
    }

    pub fn history(&self, side: PanelSide) -> &NavigationHistory {
        match side {
            PanelSide::Local => &self.local,
            PanelSide::Remote => &self.remote,
        }
    }

    pub fn history_mut(&mut self, side: PanelSide) -> &mut NavigationHistory {
        match side {
            PanelSide::Local => &mut self.local,
            PanelSide::Remote => &mut self.remote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("///"), "/");
        assert_eq!(normalize("/sdcard/"), "/sdcard");
        assert_eq!(normalize("/sdcard//DCIM///Camera"), "/sdcard/DCIM/Camera");
        assert_eq!(normalize("\\sdcard\\Download"), "/sdcard/Download");
        assert_eq!(normalize("/sdcard/./DCIM/../Music"), "/sdcard/Music");
        assert_eq!(normalize("/.."), "/");
        assert_eq!(normalize("a//b/"), "a/b");
        assert_eq!(normalize("../a"), "../a");
    }

    #[test]
    fn test_join_and_parent() {
        assert_eq!(join("/", "sdcard"), "/sdcard");
        assert_eq!(join("/sdcard/", "My File.txt"), "/sdcard/My File.txt");
        assert_eq!(parent("/sdcard/My File.txt"), "/sdcard");
        assert_eq!(parent("/sdcard"), "/");
        assert_eq!(parent("/"), "/");
    }

    #[test]
    fn test_parent_of_join_is_normalized_parent() {
        let parents = ["/", "", "/sdcard", "/sdcard/", "//storage//emulated/0/", "/a/./b"];
        let names = ["x", "with space", "ünïcode", ".hidden", "a -> b"];
        for p in parents {
            for n in names {
                assert_eq!(parent(&join(p, n)), normalize(p), "p={:?} n={:?}", p, n);
            }
        }
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("/sdcard/DCIM/"), Some("DCIM".to_string()));
        assert_eq!(file_name("/"), None);
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(
            relative_to("/sdcard", "/sdcard/DCIM/a.jpg"),
            Some(vec!["DCIM".to_string(), "a.jpg".to_string()])
        );
        assert_eq!(relative_to("/sdcard", "/sdcard"), Some(vec![]));
        assert_eq!(relative_to("/sdcard", "/sdcardX/a"), None);
        assert_eq!(relative_to("/", "/a"), Some(vec!["a".to_string()]));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/sdcard/a b"), "'/sdcard/a b'");
        assert_eq!(shell_quote("/sdcard/it's"), r"'/sdcard/it'\''s'");
    }

    #[test]
    fn test_history_go_to_clears_forward() {
        let mut history = NavigationHistory::new("/sdcard");
        history.go_to("/sdcard/DCIM");
        history.go_to("/sdcard/DCIM/Camera");

        assert_eq!(history.back(), Some("/sdcard/DCIM".to_string()));
        assert!(history.can_go_forward());

        history.go_to("/sdcard/Music");
        assert!(!history.can_go_forward());
        assert_eq!(history.back(), Some("/sdcard/DCIM".to_string()));
        assert_eq!(history.back(), Some("/sdcard".to_string()));
        assert_eq!(history.back(), None);
    }

    #[test]
    fn test_history_back_forward_round_trip() {
        let mut history = NavigationHistory::new("/");
        history.go_to("/a");
        history.go_to("/a/b");

        assert_eq!(history.back(), Some("/a".to_string()));
        assert_eq!(history.forward(), Some("/a/b".to_string()));
        assert_eq!(history.forward(), None);
        assert_eq!(history.current(), "/a/b");
    }

    #[test]
    fn test_history_same_path_is_noop() {
        let mut history = NavigationHistory::new("/sdcard");
        history.go_to("/sdcard/");
        assert!(!history.can_go_back());
    }

    #[test]
    fn test_history_up() {
        let mut history = NavigationHistory::new("/sdcard/DCIM");
        assert_eq!(history.up(), "/sdcard");
        assert_eq!(history.up(), "/");
        assert_eq!(history.up(), "/");
        assert_eq!(history.back(), Some("/sdcard".to_string()));
    }

    #[test]
    fn test_navigation_panels_are_independent() {
        let mut nav = Navigation::new("/home/user", "/sdcard");
        nav.history_mut(PanelSide::Remote).go_to("/sdcard/DCIM");

        assert_eq!(nav.history(PanelSide::Local).current(), "/home/user");
        assert!(!nav.history(PanelSide::Local).can_go_back());
        assert!(nav.history(PanelSide::Remote).can_go_back());
    }
}
