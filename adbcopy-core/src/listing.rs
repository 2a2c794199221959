//! Directory Listing Parser
//!
//! Turns the text printed by `ls -la` on the device into [`FileEntry`]
//! records. The parser is a pure function: it never touches the device and
//! never fails as a whole. Lines that do not fit the column grammar are
//! either ignored as noise (too few fields, e.g. `total 24`) or skipped with
//! a warning (enough fields but unclassifiable).
//!
//! ## Column grammar
//!
//! ```text
//! drwxrws---  2 user group 3452 2024-08-01 15:15 TestFolder
//! -rw-r--r--  1 root root  1234 Aug  1 15:15 file with  spaces.txt
//! lrwxrwxrwx  1 root root    21 2024-08-01 15:15 sdcard -> /storage/self/primary
//! crw-rw-rw-  1 root root  1, 3 2024-08-01 15:15 null
//! ```
//!
//! The name is everything after the time column, so internal whitespace
//! survives untouched.

use crate::path;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Minimum number of whitespace separated fields in a listing line
const MIN_FIELDS: usize = 8;

/// Separator between a symlink name and its target
const LINK_ARROW: &str = " -> ";

/// Kind of filesystem object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Pipe,
    Socket,
}

impl EntryKind {
    /// Decode the first character of a permission string
    pub fn from_type_char(c: char) -> Option<Self> {
        match c {
            '-' => Some(EntryKind::File),
            'd' => Some(EntryKind::Directory),
            'l' => Some(EntryKind::Symlink),
            'c' => Some(EntryKind::CharDevice),
            'b' => Some(EntryKind::BlockDevice),
            'p' => Some(EntryKind::Pipe),
            's' => Some(EntryKind::Socket),
            _ => None,
        }
    }

    fn type_char(self) -> char {
        match self {
            EntryKind::File => '-',
            EntryKind::Directory => 'd',
            EntryKind::Symlink => 'l',
            EntryKind::CharDevice => 'c',
            EntryKind::BlockDevice => 'b',
            EntryKind::Pipe => 'p',
            EntryKind::Socket => 's',
        }
    }
}

/// Read/write/execute bits of one permission class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Triad {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Triad {
    /// No access at all
    pub const NONE: Triad = Triad {
        read: false,
        write: false,
        execute: false,
    };

    fn bits(self) -> u32 {
        (self.read as u32) << 2 | (self.write as u32) << 1 | self.execute as u32
    }

    fn from_bits(bits: u32) -> Self {
        Triad {
            read: bits & 0o4 != 0,
            write: bits & 0o2 != 0,
            execute: bits & 0o1 != 0,
        }
    }

    /// Decode three permission characters
    ///
    /// `special` is the override letter allowed in the execute position
    /// (`s` for owner/group, `t` for other). Returns the triad and whether the
    /// special bit is set. Any character that does not belong in its position
    /// turns the whole triad into "no access".
    fn decode(chars: &[char], special: char) -> (Triad, bool) {
        let upper = special.to_ascii_uppercase();

        let read = match chars[0] {
            'r' => true,
            '-' => false,
            _ => return (Triad::NONE, false),
        };
        let write = match chars[1] {
            'w' => true,
            '-' => false,
            _ => return (Triad::NONE, false),
        };
        let (execute, special_bit) = match chars[2] {
            'x' => (true, false),
            '-' => (false, false),
            c if c == special => (true, true),
            c if c == upper => (false, true),
            _ => return (Triad::NONE, false),
        };

        (Triad { read, write, execute }, special_bit)
    }

    fn render(self, special: Option<char>) -> [char; 3] {
        let exec = match (self.execute, special) {
            (true, Some(s)) => s,
            (false, Some(s)) => s.to_ascii_uppercase(),
            (true, None) => 'x',
            (false, None) => '-',
        };
        [
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            exec,
        ]
    }
}

/// Decoded permission bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permissions {
    pub owner: Triad,
    pub group: Triad,
    pub other: Triad,
    pub setuid: bool,
    pub setgid: bool,
    pub sticky: bool,
}

impl Permissions {
    /// Decode the 9 permission characters following the type character
    ///
    /// ```rust
    /// use adbcopy_core::listing::Permissions;
    ///
    /// let perms = Permissions::parse("rwSr-xr-x");
    /// assert!(perms.setuid);
    /// assert!(!perms.owner.execute);
    /// ```
    pub fn parse(bits: &str) -> Self {
        let chars: Vec<char> = bits.chars().collect();
        if chars.len() < 9 {
            return Permissions::default();
        }

        let (owner, setuid) = Triad::decode(&chars[0..3], 's');
        let (group, setgid) = Triad::decode(&chars[3..6], 's');
        let (other, sticky) = Triad::decode(&chars[6..9], 't');

        Permissions {
            owner,
            group,
            other,
            setuid,
            setgid,
            sticky,
        }
    }

    /// Build from a numeric mode (as returned by `stat`)
    pub fn from_mode(mode: u32) -> Self {
        Permissions {
            owner: Triad::from_bits((mode >> 6) & 0o7),
            group: Triad::from_bits((mode >> 3) & 0o7),
            other: Triad::from_bits(mode & 0o7),
            setuid: mode & 0o4000 != 0,
            setgid: mode & 0o2000 != 0,
            sticky: mode & 0o1000 != 0,
        }
    }

    /// Numeric mode including the special bits
    pub fn mode(&self) -> u32 {
        (self.setuid as u32) << 11
            | (self.setgid as u32) << 10
            | (self.sticky as u32) << 9
            | self.owner.bits() << 6
            | self.group.bits() << 3
            | self.other.bits()
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = self.owner.render(self.setuid.then_some('s'));
        let group = self.group.render(self.setgid.then_some('s'));
        let other = self.other.render(self.sticky.then_some('t'));
        for c in owner.iter().chain(group.iter()).chain(other.iter()) {
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

/// One filesystem object, local or remote
///
/// Entries are snapshots: a new listing produces new entries and the old
/// collection is dropped wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Entry name, never containing a separator
    pub name: String,
    /// Parent path joined with the name
    pub path: String,
    pub kind: EntryKind,
    /// Size in bytes, 0 for directories and device nodes
    pub size: u64,
    pub modified: Option<NaiveDateTime>,
    pub permissions: Permissions,
    pub owner: String,
    pub group: String,
    pub link_target: Option<String>,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }

    /// Full 10 character permission string, e.g. `drwxrws---`
    pub fn mode_string(&self) -> String {
        format!("{}{}", self.kind.type_char(), self.permissions)
    }
}

/// A line that had enough fields but could not be classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingWarning {
    /// 1-based line number in the raw output
    pub line_number: usize,
    pub line: String,
    pub reason: String,
}

impl From<ListingWarning> for crate::AdbError {
    fn from(warning: ListingWarning) -> Self {
        crate::AdbError::Parse(format!(
            "line {}: {} ({:?})",
            warning.line_number, warning.reason, warning.line
        ))
    }
}

/// Result of parsing a listing, including the lines that were skipped
#[derive(Debug, Clone, Default)]
pub struct ParsedListing {
    pub entries: Vec<FileEntry>,
    pub warnings: Vec<ListingWarning>,
}

/// Parse `ls -la` output for the directory `parent`
pub fn parse_listing(raw: &str, parent: &str) -> Vec<FileEntry> {
    parse_listing_detailed(raw, parent).entries
}

/// Parse `ls -la` output, keeping track of unclassifiable lines
pub fn parse_listing_detailed(raw: &str, parent: &str) -> ParsedListing {
    let parent = path::normalize(parent);
    let current_year = chrono::Local::now().year();
    let mut listing = ParsedListing::default();

    for (index, line) in raw.lines().enumerate() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }

        match parse_line(line, &parent, current_year) {
            LineOutcome::Entry(entry) => listing.entries.push(entry),
            LineOutcome::Noise => debug!("Ignoring listing line: {:?}", line),
            LineOutcome::Invalid(reason) => {
                warn!("Skipping listing line {}: {} ({:?})", index + 1, reason, line);
                listing.warnings.push(ListingWarning {
                    line_number: index + 1,
                    line: line.to_string(),
                    reason,
                });
            }
        }
    }

    listing
}

/// Sort for display: directories first, then case-insensitive name
pub fn sort_entries(entries: &mut [FileEntry]) {
    entries.sort_by(|a, b| {
        b.is_dir()
            .cmp(&a.is_dir())
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}

enum LineOutcome {
    Entry(FileEntry),
    Noise,
    Invalid(String),
}

/// Whitespace tokenizer that can hand back the untouched remainder
struct Fields<'a> {
    rest: &'a str,
}

impl<'a> Fields<'a> {
    fn new(line: &'a str) -> Self {
        Self { rest: line }
    }

    fn next_field(&mut self) -> Option<&'a str> {
        let trimmed = self.rest.trim_start();
        if trimmed.is_empty() {
            return None;
        }
        let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
        let (field, rest) = trimmed.split_at(end);
        self.rest = rest;
        Some(field)
    }

    fn peek_field(&self) -> Option<&'a str> {
        Fields { rest: self.rest }.next_field()
    }

    /// Everything after the single separator following the last field
    fn remainder(self) -> &'a str {
        let mut chars = self.rest.chars();
        match chars.next() {
            Some(c) if c.is_whitespace() => chars.as_str(),
            _ => self.rest,
        }
    }
}

fn parse_line(line: &str, parent: &str, current_year: i32) -> LineOutcome {
    if line.split_whitespace().count() < MIN_FIELDS {
        return LineOutcome::Noise;
    }

    let mut fields = Fields::new(line);

    // Permission column, optionally followed by an ACL/SELinux marker
    let Some(mode) = fields.next_field() else {
        return LineOutcome::Noise;
    };
    let mode_chars: Vec<char> = mode.chars().collect();
    let valid_len = mode_chars.len() == 10
        || (mode_chars.len() == 11 && matches!(mode_chars[10], '+' | '.' | '@'));
    if !valid_len {
        return LineOutcome::Invalid(format!("permission column {:?} is not 10 characters", mode));
    }
    let Some(kind) = EntryKind::from_type_char(mode_chars[0]) else {
        return LineOutcome::Invalid(format!("unknown entry type {:?}", mode_chars[0]));
    };
    let bits: String = mode_chars[1..10].iter().collect();
    let permissions = Permissions::parse(&bits);

    let Some(links) = fields.next_field() else {
        return LineOutcome::Noise;
    };
    if links.parse::<u64>().is_err() {
        return LineOutcome::Invalid(format!("link count {:?} is not a number", links));
    }

    let (Some(owner), Some(group), Some(size_field)) =
        (fields.next_field(), fields.next_field(), fields.next_field())
    else {
        return LineOutcome::Noise;
    };

    let size = if matches!(kind, EntryKind::CharDevice | EntryKind::BlockDevice)
        && size_field.ends_with(',')
    {
        // "major, minor" takes two columns
        if fields.next_field().is_none() {
            return LineOutcome::Noise;
        }
        0
    } else {
        match size_field.parse::<u64>() {
            Ok(size) => size,
            Err(_) => {
                return LineOutcome::Invalid(format!("size {:?} is not a number", size_field))
            }
        }
    };

    let Some(date) = fields.next_field() else {
        return LineOutcome::Noise;
    };
    let modified = if date.chars().all(|c| c.is_ascii_alphabetic()) {
        let (Some(day), Some(time_or_year)) = (fields.next_field(), fields.next_field()) else {
            return LineOutcome::Noise;
        };
        parse_month_timestamp(date, day, time_or_year, current_year)
    } else {
        let Some(time) = fields.next_field() else {
            return LineOutcome::Noise;
        };
        // `--full-time` output carries a zone offset column
        if time.contains('.') && fields.peek_field().is_some_and(is_zone_offset) {
            fields.next_field();
        }
        parse_iso_timestamp(date, time)
    };

    let name_field = fields.remainder();
    if name_field.is_empty() {
        return LineOutcome::Noise;
    }

    let (name, link_target) = if kind == EntryKind::Symlink {
        match name_field.split_once(LINK_ARROW) {
            Some((name, target)) => (name, Some(target.to_string())),
            None => (name_field, None),
        }
    } else {
        (name_field, None)
    };

    if name == "." || name == ".." {
        return LineOutcome::Noise;
    }
    if name.contains(path::SEPARATOR) {
        return LineOutcome::Invalid(format!("name {:?} contains a path separator", name));
    }

    LineOutcome::Entry(FileEntry {
        name: name.to_string(),
        path: path::join(parent, name),
        kind,
        size: if kind == EntryKind::Directory { 0 } else { size },
        modified,
        permissions,
        owner: owner.to_string(),
        group: group.to_string(),
        link_target,
    })
}

fn is_zone_offset(field: &str) -> bool {
    field.len() == 5
        && (field.starts_with('+') || field.starts_with('-'))
        && field[1..].chars().all(|c| c.is_ascii_digit())
}

fn parse_iso_timestamp(date: &str, time: &str) -> Option<NaiveDateTime> {
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    let time = NaiveTime::parse_from_str(time, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M:%S%.f"))
        .ok()?;
    Some(date.and_time(time))
}

fn parse_month_timestamp(
    month: &str,
    day: &str,
    time_or_year: &str,
    current_year: i32,
) -> Option<NaiveDateTime> {
    if time_or_year.contains(':') {
        let date = NaiveDate::parse_from_str(
            &format!("{} {} {}", current_year, month, day),
            "%Y %b %d",
        )
        .ok()?;
        let time = NaiveTime::parse_from_str(time_or_year, "%H:%M").ok()?;
        Some(date.and_time(time))
    } else {
        let date = NaiveDate::parse_from_str(
            &format!("{} {} {}", time_or_year, month, day),
            "%Y %b %d",
        )
        .ok()?;
        date.and_hms_opt(0, 0, 0)
    }
}
