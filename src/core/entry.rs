//! Entries: named, typed, sized, timestamped units of a container
//!
//! [`Entry`] is the read-only view every layer understands. Archive drivers
//! add mutability through [`ArchiveEntry`]; controllers exchange plain
//! snapshots as [`FsEntry`].

use crate::core::error::{FsError, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Separator between name segments.
pub const SEPARATOR: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryType {
    File,
    Directory,
    /// Anything the host reports that is neither, e.g. a device node.
    Special,
}

/// Which size of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Size {
    /// Uncompressed content length.
    Data,
    /// Bytes occupied in the container.
    Storage,
}

impl Size {
    pub const ALL: [Size; 2] = [Size::Data, Size::Storage];

    fn index(self) -> usize {
        self as usize
    }
}

/// Which timestamp of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Create,
    Read,
    Write,
}

impl Access {
    pub const ALL: [Access; 3] = [Access::Create, Access::Read, Access::Write];

    fn index(self) -> usize {
        self as usize
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Read-only view of an addressable unit. `None` means unknown.
pub trait Entry {
    fn name(&self) -> &str;

    fn entry_type(&self) -> EntryType;

    fn size(&self, kind: Size) -> Option<u64>;

    fn time(&self, access: Access) -> Option<u64>;

    fn is_type(&self, entry_type: EntryType) -> bool {
        self.entry_type() == entry_type
    }
}

/// Mutable entry produced by an archive driver.
pub trait ArchiveEntry: Entry + Clone + fmt::Debug + Send + Sync + 'static {
    fn set_size(&mut self, kind: Size, value: Option<u64>);

    fn set_time(&mut self, access: Access, value: Option<u64>);
}

/// Plain snapshot of an entry, exchanged between controllers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    name: String,
    entry_type: EntryType,
    sizes: [Option<u64>; 2],
    times: [Option<u64>; 3],
    /// Child base names, for directories.
    members: Option<BTreeSet<String>>,
}

impl FsEntry {
    pub fn new(name: impl Into<String>, entry_type: EntryType) -> Self {
        FsEntry {
            name: name.into(),
            entry_type,
            sizes: [None; 2],
            times: [None; 3],
            members: None,
        }
    }

    /// Copies name, type, sizes and times of any entry.
    pub fn from_entry(entry: &dyn Entry) -> Self {
        let mut fs_entry = FsEntry::new(entry.name(), entry.entry_type());
        for kind in Size::ALL {
            fs_entry.sizes[kind.index()] = entry.size(kind);
        }
        for access in Access::ALL {
            fs_entry.times[access.index()] = entry.time(access);
        }
        fs_entry
    }

    pub fn with_members(mut self, members: BTreeSet<String>) -> Self {
        self.members = Some(members);
        self
    }

    pub fn members(&self) -> Option<&BTreeSet<String>> {
        self.members.as_ref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }
}

impl Entry for FsEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    fn size(&self, kind: Size) -> Option<u64> {
        self.sizes[kind.index()]
    }

    fn time(&self, access: Access) -> Option<u64> {
        self.times[access.index()]
    }
}

impl ArchiveEntry for FsEntry {
    fn set_size(&mut self, kind: Size, value: Option<u64>) {
        self.sizes[kind.index()] = value;
    }

    fn set_time(&mut self, access: Access, value: Option<u64>) {
        self.times[access.index()] = value;
    }
}

/// Normalized relative entry name.
///
/// No leading or trailing separator, no empty, `.` or `..` segments. The
/// empty name is the root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryName(String);

impl EntryName {
    pub const ROOT: EntryName = EntryName(String::new());

    /// Normalizes `name`, resolving `.` and `..` segments.
    pub fn new(name: &str) -> Result<Self> {
        let mut segments: Vec<&str> = Vec::new();
        for segment in name.split(SEPARATOR) {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(FsError::InvalidName(format!(
                            "'{}' escapes the root",
                            name
                        )));
                    }
                }
                s if s.contains('\\') || s.contains('\0') => {
                    return Err(FsError::InvalidName(name.to_string()));
                }
                s => segments.push(s),
            }
        }
        Ok(EntryName(segments.join("/")))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `None` for the root.
    pub fn parent(&self) -> Option<EntryName> {
        if self.is_root() {
            return None;
        }
        Some(match self.0.rfind(SEPARATOR) {
            Some(idx) => EntryName(self.0[..idx].to_string()),
            None => EntryName::ROOT,
        })
    }

    /// Last segment; empty for the root.
    pub fn base_name(&self) -> &str {
        match self.0.rfind(SEPARATOR) {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    pub fn join(&self, child: &EntryName) -> EntryName {
        match (self.is_root(), child.is_root()) {
            (true, _) => child.clone(),
            (_, true) => self.clone(),
            _ => EntryName(format!("{}{}{}", self.0, SEPARATOR, child.0)),
        }
    }

    /// Segments from the root down, e.g. `a/b/c` yields `a`, `a/b`, `a/b/c`.
    pub fn ancestry(&self) -> impl Iterator<Item = EntryName> + '_ {
        self.0
            .match_indices(SEPARATOR)
            .map(|(idx, _)| EntryName(self.0[..idx].to_string()))
            .chain((!self.is_root()).then(|| self.clone()))
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntryName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Archive entry name for a tree name: directories carry a trailing
/// separator.
pub fn archive_entry_name(name: &EntryName, entry_type: EntryType) -> String {
    match entry_type {
        EntryType::Directory if !name.is_root() => format!("{}{}", name, SEPARATOR),
        _ => name.to_string(),
    }
}
