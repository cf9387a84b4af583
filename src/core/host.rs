//! Host file system controller
//!
//! The root of every controller chain. Entries are files and directories
//! below a host directory. Output streams write to a temporary file next to
//! the target and replace the target atomically when closed, so a failed
//! or abandoned write leaves the previous content in place.

use crate::core::controller::FsController;
use crate::core::entry::{Access, ArchiveEntry, Entry, EntryName, EntryType, FsEntry, Size};
use crate::core::error::{FsError, Result};
use crate::core::model::{FsModel, MountPoint};
use crate::core::options::{AccessModes, AccessOptions, SyncOptions};
use crate::core::socket::{EntryWriter, InputSocket, OutputSocket};
use std::collections::BTreeSet;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tracing::debug;

pub struct HostController {
    model: Arc<FsModel>,
    root: PathBuf,
}

impl HostController {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        HostController {
            model: FsModel::new(MountPoint::root(), None),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &EntryName) -> PathBuf {
        if name.is_root() {
            self.root.clone()
        } else {
            self.root.join(name.as_str())
        }
    }
}

fn millis(time: io::Result<SystemTime>) -> Option<u64> {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
}

fn metadata(path: &Path) -> Result<Option<Metadata>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn stat_path(name: &EntryName, path: &Path) -> Result<Option<FsEntry>> {
    let Some(meta) = metadata(path)? else {
        return Ok(None);
    };
    let entry_type = if meta.is_file() {
        EntryType::File
    } else if meta.is_dir() {
        EntryType::Directory
    } else {
        EntryType::Special
    };
    let mut entry = FsEntry::new(name.as_str(), entry_type);
    if entry_type == EntryType::File {
        entry.set_size(Size::Data, Some(meta.len()));
        entry.set_size(Size::Storage, Some(meta.len()));
    }
    entry.set_time(Access::Write, millis(meta.modified()));
    entry.set_time(Access::Read, millis(meta.accessed()));
    entry.set_time(Access::Create, millis(meta.created()));
    if entry_type == EntryType::Directory {
        let mut members = BTreeSet::new();
        for child in fs::read_dir(path)? {
            members.insert(child?.file_name().to_string_lossy().into_owned());
        }
        entry = entry.with_members(members);
    }
    Ok(Some(entry))
}

/// Applies the write time of `template`, if any.
fn apply_template(path: &Path, template: Option<&dyn Entry>) -> Result<()> {
    if let Some(time) = template.and_then(|t| t.time(Access::Write)) {
        File::options()
            .write(true)
            .open(path)?
            .set_modified(UNIX_EPOCH + Duration::from_millis(time))?;
    }
    Ok(())
}

impl FsController for HostController {
    fn model(&self) -> &Arc<FsModel> {
        &self.model
    }

    fn stat(&mut self, _options: AccessOptions, name: &EntryName) -> Result<Option<FsEntry>> {
        stat_path(name, &self.path(name))
    }

    fn check_access(
        &mut self,
        _options: AccessOptions,
        name: &EntryName,
        modes: AccessModes,
    ) -> Result<()> {
        let path = self.path(name);
        let meta = metadata(&path)?.ok_or_else(|| FsError::NotFound(name.to_string()))?;
        if modes.contains(AccessModes::WRITE) && meta.permissions().readonly() {
            return Err(FsError::ReadOnly(name.to_string()));
        }
        Ok(())
    }

    fn set_read_only(&mut self, name: &EntryName) -> Result<()> {
        let path = self.path(name);
        let meta = metadata(&path)?.ok_or_else(|| FsError::NotFound(name.to_string()))?;
        let mut permissions = meta.permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&path, permissions)?;
        Ok(())
    }

    fn set_time(
        &mut self,
        _options: AccessOptions,
        name: &EntryName,
        times: &[(Access, u64)],
    ) -> Result<bool> {
        let path = self.path(name);
        if metadata(&path)?.is_none() {
            return Err(FsError::NotFound(name.to_string()));
        }
        let mut complete = true;
        for (access, time) in times {
            match access {
                Access::Write => {
                    File::options()
                        .write(true)
                        .open(&path)?
                        .set_modified(UNIX_EPOCH + Duration::from_millis(*time))?;
                }
                _ => complete = false,
            }
        }
        Ok(complete)
    }

    fn input<'a>(
        &'a mut self,
        _options: AccessOptions,
        name: EntryName,
    ) -> Box<dyn InputSocket<FsEntry> + 'a> {
        let path = self.path(&name);
        Box::new(HostInput { name, path })
    }

    fn output<'a>(
        &'a mut self,
        options: AccessOptions,
        name: EntryName,
        template: Option<FsEntry>,
    ) -> Box<dyn OutputSocket<FsEntry> + 'a> {
        let path = self.path(&name);
        Box::new(HostOutput {
            name,
            path,
            options,
            template,
        })
    }

    fn mknod(
        &mut self,
        options: AccessOptions,
        name: &EntryName,
        entry_type: EntryType,
        template: Option<FsEntry>,
    ) -> Result<()> {
        if name.is_root() {
            return Err(FsError::EntryExists(name.to_string()));
        }
        let path = self.path(name);
        let existing = metadata(&path)?;
        if options.contains(AccessOptions::CREATE_PARENTS) {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        match entry_type {
            EntryType::File => {
                match &existing {
                    Some(meta) if meta.is_dir() => {
                        return Err(FsError::IsDirectory(name.to_string()))
                    }
                    Some(_) if options.contains(AccessOptions::EXCLUSIVE) => {
                        return Err(FsError::EntryExists(name.to_string()))
                    }
                    _ => {}
                }
                File::create(&path)?;
            }
            EntryType::Directory => {
                if existing.is_some() {
                    return Err(FsError::EntryExists(name.to_string()));
                }
                fs::create_dir(&path)?;
            }
            EntryType::Special => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("cannot create special entry {}", name),
                )
                .into())
            }
        }
        apply_template(&path, template.as_ref().map(|t| t as &dyn Entry))
    }

    fn unlink(&mut self, _options: AccessOptions, name: &EntryName) -> Result<()> {
        let path = self.path(name);
        let meta = metadata(&path)?.ok_or_else(|| FsError::NotFound(name.to_string()))?;
        if meta.is_dir() {
            if fs::read_dir(&path)?.next().is_some() {
                return Err(FsError::DirectoryNotEmpty(name.to_string()));
            }
            fs::remove_dir(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        debug!("Removed {}", path.display());
        Ok(())
    }

    fn sync(&mut self, _options: SyncOptions) -> Result<()> {
        Ok(())
    }
}

struct HostInput {
    name: EntryName,
    path: PathBuf,
}

impl InputSocket<FsEntry> for HostInput {
    fn target(&mut self) -> Result<FsEntry> {
        stat_path(&self.name, &self.path)?.ok_or_else(|| FsError::NotFound(self.name.to_string()))
    }

    fn stream(&mut self, _peer: Option<&dyn Entry>) -> Result<Box<dyn Read + Send>> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.is_dir() => Err(FsError::IsDirectory(self.name.to_string())),
            Ok(_) => Ok(Box::new(File::open(&self.path)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(FsError::NotFound(self.name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

struct HostOutput {
    name: EntryName,
    path: PathBuf,
    options: AccessOptions,
    template: Option<FsEntry>,
}

impl OutputSocket<FsEntry> for HostOutput {
    fn target(&mut self) -> Result<FsEntry> {
        Ok(stat_path(&self.name, &self.path)?
            .unwrap_or_else(|| FsEntry::new(self.name.as_str(), EntryType::File)))
    }

    fn stream(&mut self, peer: Option<&dyn Entry>) -> Result<Box<dyn EntryWriter>> {
        let existing = metadata(&self.path)?;
        match &existing {
            Some(meta) if meta.is_dir() => return Err(FsError::IsDirectory(self.name.to_string())),
            Some(_) if self.options.contains(AccessOptions::EXCLUSIVE) => {
                return Err(FsError::EntryExists(self.name.to_string()))
            }
            _ => {}
        }
        let dir = match self.path.parent() {
            Some(dir) => dir.to_path_buf(),
            None => return Err(FsError::InvalidName(self.name.to_string())),
        };
        if self.options.contains(AccessOptions::CREATE_PARENTS) {
            fs::create_dir_all(&dir)?;
        } else if metadata(&dir)?.is_none() {
            return Err(FsError::NotFound(self.name.to_string()));
        }
        let template = self
            .template
            .clone()
            .or_else(|| peer.map(FsEntry::from_entry));
        let target = if self.options.contains(AccessOptions::APPEND) {
            HostTarget::Append(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            )
        } else {
            HostTarget::Replace(NamedTempFile::new_in(&dir)?)
        };
        Ok(Box::new(HostWriter {
            target,
            path: self.path.clone(),
            template,
        }))
    }
}

enum HostTarget {
    Append(File),
    Replace(NamedTempFile),
}

struct HostWriter {
    target: HostTarget,
    path: PathBuf,
    template: Option<FsEntry>,
}

impl Write for HostWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match &mut self.target {
            HostTarget::Append(file) => file.write(data),
            HostTarget::Replace(temp) => temp.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.target {
            HostTarget::Append(file) => file.flush(),
            HostTarget::Replace(temp) => temp.flush(),
        }
    }
}

impl EntryWriter for HostWriter {
    fn close(self: Box<Self>) -> Result<()> {
        let HostWriter {
            target,
            path,
            template,
        } = *self;
        match target {
            HostTarget::Append(mut file) => file.flush()?,
            HostTarget::Replace(mut temp) => {
                temp.flush()?;
                temp.persist(&path).map_err(|e| FsError::Io(e.error))?;
            }
        }
        debug!("Wrote {}", path.display());
        apply_template(&path, template.as_ref().map(|t| t as &dyn Entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::socket::{read_all, write_all};
    use tempfile::TempDir;

    fn name(s: &str) -> EntryName {
        EntryName::new(s).unwrap()
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let mut host = HostController::new(dir.path());

        write_all(
            &mut *host.output(AccessOptions::CREATE_PARENTS, name("a/b.txt"), None),
            b"hello",
        )
        .unwrap();

        assert_eq!(read_all(&mut *host.input(AccessOptions::empty(), name("a/b.txt"))).unwrap(), b"hello");
        let stat = host.stat(AccessOptions::empty(), &name("a")).unwrap().unwrap();
        assert_eq!(stat.entry_type(), EntryType::Directory);
        assert!(stat.members().unwrap().contains("b.txt"));
    }

    #[test]
    fn test_dropped_writer_keeps_old_content() {
        let dir = TempDir::new().unwrap();
        let mut host = HostController::new(dir.path());
        write_all(&mut *host.output(AccessOptions::empty(), name("f"), None), b"old").unwrap();

        let mut writer = host
            .output(AccessOptions::empty(), name("f"), None)
            .stream(None)
            .unwrap();
        writer.write_all(b"new").unwrap();
        drop(writer);

        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"old");
    }

    #[test]
    fn test_append() {
        let dir = TempDir::new().unwrap();
        let mut host = HostController::new(dir.path());
        write_all(&mut *host.output(AccessOptions::empty(), name("log"), None), b"one ").unwrap();
        write_all(&mut *host.output(AccessOptions::APPEND, name("log"), None), b"two").unwrap();

        assert_eq!(std::fs::read(dir.path().join("log")).unwrap(), b"one two");
    }

    #[test]
    fn test_template_sets_write_time() {
        let dir = TempDir::new().unwrap();
        let mut host = HostController::new(dir.path());
        let mut template = FsEntry::new("t", EntryType::File);
        template.set_time(Access::Write, Some(1_600_000_000_000));

        write_all(&mut *host.output(AccessOptions::empty(), name("t"), Some(template)), b"x").unwrap();

        let stat = host.stat(AccessOptions::empty(), &name("t")).unwrap().unwrap();
        assert_eq!(stat.time(Access::Write), Some(1_600_000_000_000));
    }

    #[test]
    fn test_unlink_non_empty_directory_fails() {
        let dir = TempDir::new().unwrap();
        let mut host = HostController::new(dir.path());
        host.mknod(AccessOptions::CREATE_PARENTS, &name("d/f"), EntryType::File, None)
            .unwrap();

        assert!(matches!(
            host.unlink(AccessOptions::empty(), &name("d")),
            Err(FsError::DirectoryNotEmpty(_))
        ));
        host.unlink(AccessOptions::empty(), &name("d/f")).unwrap();
        host.unlink(AccessOptions::empty(), &name("d")).unwrap();
        assert!(host.stat(AccessOptions::empty(), &name("d")).unwrap().is_none());
    }
}
