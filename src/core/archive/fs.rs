//! In-memory archive file system tree
//!
//! Maps normalized entry names to [`CovariantEntry`]s. The root always
//! exists as a directory. Parents missing from the archive are synthesized as
//! ghost directories: directory entries without a write time, which are
//! never written to an output archive unless made real by an explicit
//! `mknod`.

use crate::core::container::InputContainer;
use crate::core::driver::ArchiveDriver;
use crate::core::entry::{
    archive_entry_name, now_millis, Access, ArchiveEntry, Entry, EntryName, EntryType, FsEntry,
    Size,
};
use crate::core::error::{FsError, Result};
use crate::core::options::{AccessModes, AccessOptions};
use indexmap::IndexMap;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use tracing::debug;

/// A tree name with all the archive entries backing it.
///
/// A name can be a file and, implicitly, a directory at the same time when
/// the archive holds both `a` and `a/b`.
#[derive(Debug, Clone)]
pub struct CovariantEntry<E> {
    name: EntryName,
    key: EntryType,
    entries: BTreeMap<EntryType, E>,
    members: BTreeSet<String>,
}

impl<E: Entry + Clone> CovariantEntry<E> {
    fn new(name: EntryName, entry_type: EntryType, entry: E) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(entry_type, entry);
        CovariantEntry {
            name,
            key: entry_type,
            entries,
            members: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &EntryName {
        &self.name
    }

    /// The representation this name currently resolves to.
    pub fn primary(&self) -> &E {
        &self.entries[&self.key]
    }

    pub fn entry_type(&self) -> EntryType {
        self.key
    }

    pub fn get(&self, entry_type: EntryType) -> Option<&E> {
        self.entries.get(&entry_type)
    }

    /// All representations, in type order.
    pub fn representations(&self) -> impl Iterator<Item = &E> {
        self.entries.values()
    }

    pub fn members(&self) -> &BTreeSet<String> {
        &self.members
    }

    pub fn is_directory(&self) -> bool {
        self.entries.contains_key(&EntryType::Directory)
    }

    /// Synthesized directory that was never made real.
    pub fn is_ghost(&self) -> bool {
        self.key == EntryType::Directory && self.primary().time(Access::Write).is_none()
    }

    /// Snapshot under the tree name, with members for directories.
    pub fn to_fs_entry(&self) -> FsEntry {
        let mut entry = FsEntry::from_entry(self.primary());
        entry.set_name(self.name.as_str());
        if self.key == EntryType::Directory {
            entry = entry.with_members(self.members.clone());
        }
        entry
    }
}

/// Mutable tree of one mounted archive.
pub struct ArchiveFileSystem<E> {
    entries: IndexMap<EntryName, CovariantEntry<E>>,
    read_only: bool,
}

impl<E: ArchiveEntry> ArchiveFileSystem<E> {
    /// Tree of a new archive: just the root.
    pub fn new_empty<D>(driver: &D) -> Self
    where
        D: ArchiveDriver<Entry = E> + ?Sized,
    {
        let mut root = driver.new_entry("", EntryType::Directory, None);
        root.set_time(Access::Write, Some(now_millis()));
        let mut entries = IndexMap::new();
        entries.insert(
            EntryName::ROOT,
            CovariantEntry::new(EntryName::ROOT, EntryType::Directory, root),
        );
        ArchiveFileSystem {
            entries,
            read_only: false,
        }
    }

    /// Tree of an existing archive.
    ///
    /// `root_template` is the archive file's entry in the parent file
    /// system; the root directory takes its timestamps.
    pub fn new_populated<D>(
        driver: &D,
        input: &dyn InputContainer<E>,
        root_template: &dyn Entry,
        read_only: bool,
    ) -> Self
    where
        D: ArchiveDriver<Entry = E> + ?Sized,
    {
        let mut root = driver.new_entry("", EntryType::Directory, Some(root_template));
        if root.time(Access::Write).is_none() {
            root.set_time(Access::Write, root_template.time(Access::Write).or(Some(0)));
        }
        let mut entries = IndexMap::new();
        entries.insert(
            EntryName::ROOT,
            CovariantEntry::new(EntryName::ROOT, EntryType::Directory, root),
        );

        let mut skipped = 0usize;
        for entry in input.entries() {
            let name = match EntryName::new(entry.name()) {
                Ok(name) if !name.is_root() => name,
                _ => {
                    skipped += 1;
                    continue;
                }
            };
            let entry_type = entry.entry_type();
            match entries.get_mut(&name) {
                Some(existing) => {
                    existing.entries.insert(entry_type, entry);
                    existing.key = entry_type;
                }
                None => {
                    entries.insert(name.clone(), CovariantEntry::new(name, entry_type, entry));
                }
            }
        }
        if skipped > 0 {
            debug!("Ignored {} archive entries with unusable names", skipped);
        }

        let mut fs = ArchiveFileSystem {
            entries,
            read_only,
        };
        let names: Vec<EntryName> = fs.entries.keys().cloned().collect();
        for name in names {
            fs.link_parents(driver, &name);
        }
        fs
    }

    /// Makes sure every ancestor of `name` is a directory listing its child,
    /// synthesizing ghosts where needed.
    fn link_parents<D>(&mut self, driver: &D, name: &EntryName)
    where
        D: ArchiveDriver<Entry = E> + ?Sized,
    {
        let mut child = name.clone();
        while let Some(parent) = child.parent() {
            let base = child.base_name().to_string();
            let ghost = || {
                driver.new_entry(
                    &archive_entry_name(&parent, EntryType::Directory),
                    EntryType::Directory,
                    None,
                )
            };
            let node = self
                .entries
                .entry(parent.clone())
                .or_insert_with(|| CovariantEntry::new(parent.clone(), EntryType::Directory, ghost()));
            if !node.is_directory() {
                node.entries.insert(EntryType::Directory, ghost());
            }
            node.key = EntryType::Directory;
            if !node.members.insert(base) {
                break;
            }
            child = parent;
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when only the root is left.
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn entry(&self, name: &EntryName) -> Option<&CovariantEntry<E>> {
        self.entries.get(name)
    }

    pub fn stat(&self, name: &EntryName) -> Option<FsEntry> {
        self.entries.get(name).map(CovariantEntry::to_fs_entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CovariantEntry<E>> {
        self.entries.values()
    }

    pub fn check_access(&self, name: &EntryName, modes: AccessModes) -> Result<()> {
        if !self.entries.contains_key(name) {
            return Err(FsError::NotFound(name.to_string()));
        }
        if modes.contains(AccessModes::WRITE) && self.read_only {
            return Err(FsError::ReadOnly(name.to_string()));
        }
        Ok(())
    }

    fn check_writable(&self, name: &EntryName) -> Result<()> {
        if self.read_only {
            return Err(FsError::ReadOnly(name.to_string()));
        }
        Ok(())
    }

    pub fn set_read_only(&mut self, name: &EntryName) -> Result<()> {
        if !self.entries.contains_key(name) {
            return Err(FsError::NotFound(name.to_string()));
        }
        if self.read_only {
            return Ok(());
        }
        Err(FsError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot make archive entry '{}' read-only", name),
        )))
    }

    /// Creates `name` or replaces an existing file.
    ///
    /// Returns the archive entry now backing `name`.
    pub fn mknod<D>(
        &mut self,
        driver: &D,
        name: &EntryName,
        entry_type: EntryType,
        options: AccessOptions,
        template: Option<&dyn Entry>,
    ) -> Result<E>
    where
        D: ArchiveDriver<Entry = E> + ?Sized,
    {
        self.check_writable(name)?;
        if entry_type == EntryType::Special {
            return Err(FsError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("cannot create special entry '{}' in an archive", name),
            )));
        }
        if name.is_root() {
            return Err(FsError::EntryExists(name.to_string()));
        }
        let time = template
            .and_then(|t| t.time(Access::Write))
            .unwrap_or_else(now_millis);

        if let Some(existing) = self.entries.get_mut(name) {
            match (existing.entry_type(), entry_type) {
                (EntryType::Directory, EntryType::Directory) if existing.is_ghost() => {
                    if let Some(dir) = existing.entries.get_mut(&EntryType::Directory) {
                        dir.set_time(Access::Write, Some(time));
                    }
                    debug!("Materialized directory '{}'", name);
                    return Ok(existing.primary().clone());
                }
                (EntryType::File, EntryType::File) => {
                    if options.contains(AccessOptions::EXCLUSIVE) {
                        return Err(FsError::EntryExists(name.to_string()));
                    }
                }
                _ => return Err(FsError::EntryExists(name.to_string())),
            }
        }

        let parent = name.parent().unwrap_or(EntryName::ROOT);
        match self.entries.get(&parent) {
            Some(node) if node.is_directory() => {}
            Some(_) => return Err(FsError::NotDirectory(parent.to_string())),
            None if options.contains(AccessOptions::CREATE_PARENTS) => {}
            None => return Err(FsError::NotFound(parent.to_string())),
        }

        let mut entry = driver.new_entry(&archive_entry_name(name, entry_type), entry_type, template);
        if entry.time(Access::Write).is_none() {
            entry.set_time(Access::Write, Some(time));
        }
        self.entries.insert(
            name.clone(),
            CovariantEntry::new(name.clone(), entry_type, entry.clone()),
        );
        self.link_parents(driver, name);
        self.touch_parent(name, time);
        Ok(entry)
    }

    pub fn unlink(&mut self, name: &EntryName) -> Result<()> {
        self.check_writable(name)?;
        if name.is_root() {
            return Err(FsError::InvalidName("cannot unlink the archive root".into()));
        }
        let node = self
            .entries
            .get(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        if !node.members.is_empty() {
            return Err(FsError::DirectoryNotEmpty(name.to_string()));
        }
        self.entries.shift_remove(name);
        let parent = name.parent().unwrap_or(EntryName::ROOT);
        if let Some(node) = self.entries.get_mut(&parent) {
            node.members.remove(name.base_name());
        }
        self.touch_parent(name, now_millis());
        Ok(())
    }

    /// Sets timestamps on every representation of `name`.
    pub fn set_time(&mut self, name: &EntryName, times: &[(Access, u64)]) -> Result<()> {
        self.check_writable(name)?;
        let node = self
            .entries
            .get_mut(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        for entry in node.entries.values_mut() {
            for &(access, value) in times {
                entry.set_time(access, Some(value));
            }
        }
        Ok(())
    }

    /// Bumps the parent's write time unless it is a ghost.
    fn touch_parent(&mut self, name: &EntryName, time: u64) {
        let parent = name.parent().unwrap_or(EntryName::ROOT);
        if let Some(node) = self.entries.get_mut(&parent) {
            if node.is_ghost() {
                return;
            }
            if let Some(dir) = node.entries.get_mut(&EntryType::Directory) {
                dir.set_time(Access::Write, Some(time));
            }
        }
    }

    /// Resets sizes of a new entry without content to an empty file.
    pub fn empty_content(entry: &mut E) {
        for kind in Size::ALL {
            entry.set_size(kind, None);
        }
        entry.set_size(Size::Data, Some(0));
    }
}
