//! Target archive controller
//!
//! Owns the mount/sync lifecycle of one archive file:
//!
//! - **Unmounted**: no tree, no archives. The initial state and the state
//!   after every successful sync.
//! - **Mounted**: the tree exists, backed by an input archive (existing
//!   archive file), an output archive (new or modified archive), or both.
//! - **Sync**: copies every tree entry missing from the output archive into
//!   it, closes the input archive, then the output archive, and drops the
//!   tree.
//!
//! The controller is not thread safe. Callers hold the lock of the
//! [`SharedController`] around every call.

use crate::core::archive::fs::ArchiveFileSystem;
use crate::core::archive::io::{InputArchive, OutputArchive};
use crate::core::archive::policy::{GrowPolicy, Intention, Redundancy, SyncPolicy};
use crate::core::controller::{FsController, SharedController};
use crate::core::driver::ArchiveDriver;
use crate::core::entry::{Access, ArchiveEntry, Entry, EntryName, EntryType, FsEntry, Size};
use crate::core::error::{FsError, Result, Signal, SyncError, SyncErrorBuilder, SyncIssue};
use crate::core::io::{copy, CopyError};
use crate::core::model::FsModel;
use crate::core::options::{AccessModes, AccessOptions, SyncOptions};
use crate::core::socket::{read_all, EntryWriter, InputSocket, OutputSocket};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct TargetArchiveController<D: ArchiveDriver> {
    driver: Arc<D>,
    model: Arc<FsModel>,
    parent: SharedController,
    policy: Arc<dyn SyncPolicy>,
    tree: Option<ArchiveFileSystem<D::Entry>>,
    input: Option<InputArchive<D::Entry>>,
    output: Option<OutputArchive<D::Entry>>,
    /// Reason of a persistent false positive, kept until the next sync.
    false_positive: Option<String>,
}

impl<D: ArchiveDriver> TargetArchiveController<D> {
    /// Creates an unmounted controller.
    ///
    /// # Panics
    ///
    /// If `parent` does not serve the parent of the model's mount point.
    pub fn new(driver: Arc<D>, model: Arc<FsModel>, parent: SharedController) -> Self {
        {
            let parent = parent.lock();
            assert_eq!(
                model.mount_point().parent(),
                Some(parent.mount_point()),
                "parent controller does not serve the parent mount point"
            );
        }
        TargetArchiveController {
            driver,
            model,
            parent,
            policy: Arc::new(GrowPolicy),
            tree: None,
            input: None,
            output: None,
            false_positive: None,
        }
    }

    /// Replaces the policy deciding when staged entries need a sync.
    pub fn with_policy(mut self, policy: Arc<dyn SyncPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_mounted(&self) -> bool {
        self.tree.is_some()
    }

    pub fn has_input_archive(&self) -> bool {
        self.input.is_some()
    }

    pub fn has_output_archive(&self) -> bool {
        self.output.is_some()
    }

    fn path(&self) -> String {
        self.model.mount_point().path().to_string()
    }

    fn resolve(&self, name: &EntryName) -> String {
        self.model.mount_point().resolve(name)
    }

    fn redundancy(&self) -> Redundancy {
        Redundancy {
            content: self.driver.redundant_content_support(),
            meta_data: self.driver.redundant_meta_data_support(),
        }
    }

    /// Returns the tree, mounting the archive first if necessary.
    fn mount(
        &mut self,
        options: AccessOptions,
        autocreate: bool,
    ) -> Result<&mut ArchiveFileSystem<D::Entry>> {
        if let Some(reason) = &self.false_positive {
            return Err(FsError::false_positive(self.path(), true, reason));
        }
        let tree = match self.tree.take() {
            Some(tree) => tree,
            None => self.do_mount(options, autocreate)?,
        };
        Ok(self.tree.insert(tree))
    }

    fn do_mount(
        &mut self,
        options: AccessOptions,
        autocreate: bool,
    ) -> Result<ArchiveFileSystem<D::Entry>> {
        let name = self.model.mount_point().entry_name().clone();
        let parent_entry = self.parent_stat(&name)?;

        let Some(parent_entry) = parent_entry else {
            if !autocreate {
                return Err(FsError::false_positive(
                    self.path(),
                    false,
                    "archive file does not exist",
                ));
            }
            let output = self.make_output(options)?;
            self.output = Some(output);
            self.model.set_touched(true);
            info!("Mounted new archive {}", self.model.mount_point());
            return Ok(ArchiveFileSystem::new_empty(&*self.driver));
        };

        let read_only = self
            .parent
            .lock()
            .check_access(AccessOptions::empty(), &name, AccessModes::WRITE)
            .is_err();
        let result = {
            let mut parent = self.parent.lock();
            let mut socket = parent.input(AccessOptions::empty(), name.clone());
            self.driver.new_input_container(&self.model, &mut *socket)
        };
        let container = match result {
            Ok(container) => container,
            Err(e) if e.is_signal() || matches!(e, FsError::UnknownKey(_)) => return Err(e),
            Err(e) => {
                let persistent = !parent_entry.is_type(EntryType::Special);
                debug!("{} is not an archive: {}", self.model.mount_point(), e);
                if persistent {
                    self.false_positive = Some(e.to_string());
                }
                return Err(FsError::false_positive(self.path(), persistent, e));
            }
        };

        let tree =
            ArchiveFileSystem::new_populated(&*self.driver, &*container, &parent_entry, read_only);
        info!(
            "Mounted {} ({} entries{})",
            self.model.mount_point(),
            container.len(),
            if read_only { ", read-only" } else { "" }
        );
        self.input = Some(InputArchive::new(container));
        self.model.set_touched(true);
        Ok(tree)
    }

    /// Starts a new output archive over the archive file's output socket.
    fn make_output(&self, options: AccessOptions) -> Result<OutputArchive<D::Entry>> {
        let name = self.model.mount_point().entry_name().clone();
        let parent_options = (options & AccessOptions::CREATE_PARENTS) | AccessOptions::CACHE;
        let mut parent = self.parent.lock();
        let mut socket = parent.output(parent_options, name, None);
        let source = self.input.as_ref().map(|input| input.container());
        let container = self
            .driver
            .new_output_container(&self.model, &mut *socket, source)?;
        debug!("Started output archive for {}", self.model.mount_point());
        Ok(OutputArchive::new(container, self.driver.pool()))
    }

    /// Called before every tree mutation: makes sure there is an output
    /// archive to write the mutation to.
    fn touch(&mut self, options: AccessOptions) -> Result<()> {
        if self.output.is_none() {
            let output = self.make_output(options)?;
            self.output = Some(output);
        }
        self.model.set_touched(true);
        Ok(())
    }

    fn mounted(&mut self) -> Result<(&mut ArchiveFileSystem<D::Entry>, &D)> {
        match self.tree.as_mut() {
            Some(tree) => Ok((tree, &*self.driver)),
            None => Err(FsError::needs_sync(self.model.mount_point().path())),
        }
    }

    fn check_writable(&self, name: &EntryName) -> Result<()> {
        match &self.tree {
            Some(tree) if tree.is_read_only() => Err(FsError::ReadOnly(self.resolve(name))),
            _ => Ok(()),
        }
    }

    fn check_exists(&self, name: &EntryName) -> Result<()> {
        match &self.tree {
            Some(tree) if tree.entry(name).is_some() => Ok(()),
            _ => Err(FsError::NotFound(self.resolve(name))),
        }
    }

    /// Fails with a needs-sync signal if accessing `name` would be
    /// incoherent before the pending changes are written.
    fn check_sync(&self, options: AccessOptions, name: &EntryName, intention: Intention) -> Result<()> {
        if name.is_root() {
            return Ok(());
        }
        let Some(entry) = self.tree.as_ref().and_then(|tree| tree.entry(name)) else {
            return Ok(());
        };
        let archive_entry = entry.get(EntryType::File).unwrap_or_else(|| entry.primary());
        let archive_name = archive_entry.name();

        if let Some(output) = &self.output {
            if output.entry(archive_name).is_some()
                && !self
                    .policy
                    .tolerates_staged(options, intention, self.redundancy())
            {
                debug!("'{}' is staged in the output archive", self.resolve(name));
                return Err(FsError::needs_sync(self.resolve(name)));
            }
        }
        if intention == Intention::Read && archive_entry.is_type(EntryType::File) {
            let present = self
                .input
                .as_ref()
                .map_or(false, |input| input.entry(archive_name).is_some());
            if !present {
                debug!("'{}' has no content yet", self.resolve(name));
                return Err(FsError::needs_sync(self.resolve(name)));
            }
        }
        Ok(())
    }

    fn open_input(
        &mut self,
        options: AccessOptions,
        name: &EntryName,
        peer: Option<&dyn Entry>,
    ) -> Result<Box<dyn Read + Send>> {
        self.mount(options, false)?;
        self.check_sync(options, name, Intention::Read)?;
        let archive_name = match self.tree.as_ref().and_then(|tree| tree.entry(name)) {
            None => return Err(FsError::NotFound(self.resolve(name))),
            Some(entry) => match entry.get(EntryType::File) {
                Some(file) => file.name().to_string(),
                None => return Err(FsError::IsDirectory(self.resolve(name))),
            },
        };
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| FsError::needs_sync(self.resolve(name)))?;
        input.input(&archive_name).stream(peer)
    }

    fn open_output(
        &mut self,
        options: AccessOptions,
        name: &EntryName,
        template: Option<&FsEntry>,
        peer: Option<&dyn Entry>,
    ) -> Result<Box<dyn EntryWriter>> {
        self.mount(options, options.contains(AccessOptions::CREATE_PARENTS))?;
        self.check_sync(options, name, Intention::Write)?;
        self.check_writable(name)?;

        let appended = if options.contains(AccessOptions::APPEND) {
            self.existing_content(name)?
        } else {
            None
        };
        self.touch(options)?;
        let (tree, driver) = self.mounted()?;
        let entry = tree.mknod(
            driver,
            name,
            EntryType::File,
            options,
            template.map(|t| t as &dyn Entry),
        )?;
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| FsError::needs_sync(self.model.mount_point().path()))?;
        let mut writer = output.output(entry).stream(peer)?;
        if let Some(content) = appended {
            writer.write_all(&content)?;
        }
        Ok(writer)
    }

    /// Content of an existing file entry, for appending.
    fn existing_content(&self, name: &EntryName) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.tree.as_ref().and_then(|tree| tree.entry(name)) else {
            return Ok(None);
        };
        let Some(file) = entry.get(EntryType::File) else {
            return Err(FsError::IsDirectory(self.resolve(name)));
        };
        match &self.input {
            Some(input) if input.entry(file.name()).is_some() => {
                Ok(Some(read_all(&mut *input.input(file.name()))?))
            }
            _ => Ok(Some(Vec::new())),
        }
    }

    /// Writes every tree entry missing from the output archive.
    fn copy_entries(&self, builder: &mut SyncErrorBuilder) -> std::result::Result<(), SyncError> {
        let (Some(tree), Some(output)) = (self.tree.as_ref(), self.output.as_ref()) else {
            return Ok(());
        };
        let mount_point = self.path();
        let mut input_failed = false;
        let mut written = 0usize;

        for entry in tree.iter() {
            for archive_entry in entry.representations() {
                let archive_name = archive_entry.name();
                if output.entry(archive_name).is_some() {
                    continue;
                }
                let result = if archive_entry.is_type(EntryType::Directory) {
                    if entry.name().is_root() || archive_entry.time(Access::Write).is_none() {
                        continue;
                    }
                    write_empty(output, archive_entry.clone()).map_err(CopyError::Output)
                } else if let Some(input) = self
                    .input
                    .as_ref()
                    .filter(|input| input.entry(archive_name).is_some())
                {
                    copy(
                        &mut *input.container().input(archive_name),
                        &mut *output.output(archive_entry.clone()),
                    )
                    .map(|_| ())
                } else {
                    let mut fresh = archive_entry.clone();
                    ArchiveFileSystem::<D::Entry>::empty_content(&mut fresh);
                    write_empty(output, fresh).map_err(CopyError::Output)
                };

                match result {
                    Ok(()) => written += 1,
                    Err(CopyError::Input(e)) if !input_failed => {
                        input_failed = true;
                        builder.warn(SyncIssue::warning(mount_point.clone(), e));
                    }
                    Err(e) => return Err(builder.fail(mount_point, e.into_inner())),
                }
            }
        }
        debug!("Copied {} entries into {}", written, mount_point);
        Ok(())
    }

    /// Closes both archives and unmounts. Never fails; problems are
    /// recorded in `builder`.
    fn close(&mut self, options: SyncOptions, builder: &mut SyncErrorBuilder) {
        let mount_point = self.path();
        if let Some(mut input) = self.input.take() {
            if let Err(e) = input.close() {
                builder.warn(SyncIssue::warning(mount_point.clone(), e));
            }
        }
        if let Some(mut output) = self.output.take() {
            if options.contains(SyncOptions::ABORT_CHANGES) {
                output.discard();
            } else if let Err(e) = output.close() {
                builder.warn(SyncIssue::failure(mount_point.clone(), e));
            }
        }
        self.tree = None;
        if options.intersects(SyncOptions::ABORT_CHANGES | SyncOptions::CLEAR_CACHE) {
            self.model.set_touched(false);
        }
    }
}

fn write_empty<E: ArchiveEntry>(
    output: &OutputArchive<E>,
    entry: E,
) -> Result<()> {
    output.output(entry).stream(None)?.close()
}

impl<D: ArchiveDriver> FsController for TargetArchiveController<D> {
    fn model(&self) -> &Arc<FsModel> {
        &self.model
    }

    fn stat(&mut self, options: AccessOptions, name: &EntryName) -> Result<Option<FsEntry>> {
        let tree = self.mount(options, false)?;
        let Some(mut stat) = tree.stat(name) else {
            return Ok(None);
        };
        let tree = &self.tree;
        let staged = tree
            .as_ref()
            .and_then(|tree| tree.entry(name))
            .and_then(|entry| {
                self.output
                    .as_ref()
                    .and_then(|output| output.entry(entry.primary().name()))
            });
        if let Some(staged) = staged {
            for kind in Size::ALL {
                if let Some(size) = staged.size(kind) {
                    stat.set_size(kind, Some(size));
                }
            }
            if let Some(time) = staged.time(Access::Write) {
                stat.set_time(Access::Write, Some(time));
            }
        }
        Ok(Some(stat))
    }

    fn check_access(
        &mut self,
        options: AccessOptions,
        name: &EntryName,
        modes: AccessModes,
    ) -> Result<()> {
        self.mount(options, false)?.check_access(name, modes)
    }

    fn set_read_only(&mut self, name: &EntryName) -> Result<()> {
        self.mount(AccessOptions::empty(), false)?.set_read_only(name)
    }

    fn set_time(
        &mut self,
        options: AccessOptions,
        name: &EntryName,
        times: &[(Access, u64)],
    ) -> Result<bool> {
        self.mount(options, false)?;
        self.check_exists(name)?;
        self.check_sync(options, name, Intention::Metadata)?;
        self.check_writable(name)?;
        self.touch(options)?;
        let (tree, _) = self.mounted()?;
        tree.set_time(name, times)?;
        Ok(true)
    }

    fn input<'a>(
        &'a mut self,
        options: AccessOptions,
        name: EntryName,
    ) -> Box<dyn InputSocket<FsEntry> + 'a> {
        Box::new(TargetInput {
            controller: self,
            options,
            name,
        })
    }

    fn output<'a>(
        &'a mut self,
        options: AccessOptions,
        name: EntryName,
        template: Option<FsEntry>,
    ) -> Box<dyn OutputSocket<FsEntry> + 'a> {
        Box::new(TargetOutput {
            controller: self,
            options,
            name,
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
        if name.is_root() && entry_type == EntryType::Directory {
            return self.mknod_archive(options);
        }
        self.mount(options, options.contains(AccessOptions::CREATE_PARENTS))?;
        if entry_type == EntryType::File {
            self.check_sync(options, name, Intention::Write)?;
        }
        self.check_writable(name)?;
        self.touch(options)?;
        let (tree, driver) = self.mounted()?;
        tree.mknod(
            driver,
            name,
            entry_type,
            options,
            template.as_ref().map(|t| t as &dyn Entry),
        )?;
        Ok(())
    }

    fn unlink(&mut self, options: AccessOptions, name: &EntryName) -> Result<()> {
        let tree = self.mount(options, false)?;
        if name.is_root() {
            if !tree.is_empty() {
                return Err(FsError::DirectoryNotEmpty(self.path()));
            }
            return self.unlink_archive(options);
        }
        self.check_exists(name)?;
        self.check_sync(options, name, Intention::Metadata)?;
        self.check_writable(name)?;
        self.touch(options)?;
        let (tree, _) = self.mounted()?;
        tree.unlink(name)
    }

    fn sync(&mut self, options: SyncOptions) -> Result<()> {
        self.false_positive = None;
        if self.tree.is_none() {
            return Ok(());
        }

        let open_inputs = self.input.as_ref().map_or(0, |input| input.open_streams());
        let open_outputs = self.output.as_ref().map_or(0, |output| output.open_streams());
        if (open_inputs > 0 && !options.contains(SyncOptions::FORCE_CLOSE_INPUT))
            || (open_outputs > 0 && !options.contains(SyncOptions::FORCE_CLOSE_OUTPUT))
        {
            return Err(FsError::Busy(format!(
                "{} has {} open input and {} open output streams",
                self.model.mount_point(),
                open_inputs,
                open_outputs
            )));
        }
        if open_outputs > 0 {
            warn!(
                "Discarding {} unclosed entry streams of {}",
                open_outputs,
                self.model.mount_point()
            );
            if let Some(output) = &self.output {
                output.force_close_streams();
            }
        }

        let mut builder = SyncErrorBuilder::new();
        if !options.contains(SyncOptions::ABORT_CHANGES) {
            self.copy_entries(&mut builder)?;
        }
        self.close(options, &mut builder);
        info!("Synced {}", self.model.mount_point());
        builder.check()?;
        Ok(())
    }
}

impl<D: ArchiveDriver> TargetArchiveController<D> {
    /// Stats the archive file. An enclosing archive that does not exist
    /// yet does not contain it either.
    fn parent_stat(&self, name: &EntryName) -> Result<Option<FsEntry>> {
        match self.parent.lock().stat(AccessOptions::empty(), name) {
            Err(FsError::Signal(Signal::FalsePositive {
                persistent: false, ..
            })) => Ok(None),
            other => other,
        }
    }

    /// Creates a new, empty archive file.
    fn mknod_archive(&mut self, options: AccessOptions) -> Result<()> {
        let name = self.model.mount_point().entry_name().clone();
        let exists = self.tree.is_some() || self.parent_stat(&name)?.is_some();
        if exists {
            return Err(FsError::EntryExists(self.path()));
        }
        self.mount(options, true)?;
        Ok(())
    }

    /// Removes the archive file itself, discarding pending changes.
    fn unlink_archive(&mut self, options: AccessOptions) -> Result<()> {
        if let Some(output) = self.output.take() {
            output.discard();
        }
        if let Some(mut input) = self.input.take() {
            if let Err(e) = input.close() {
                warn!("Closing input archive of {} failed: {}", self.model.mount_point(), e);
            }
        }
        self.tree = None;
        self.model.set_touched(false);

        let name = self.model.mount_point().entry_name().clone();
        let mut parent = self.parent.lock();
        if parent.stat(AccessOptions::empty(), &name)?.is_some() {
            parent.unlink(options, &name)?;
        }
        info!("Removed archive {}", self.model.mount_point());
        Ok(())
    }
}

struct TargetInput<'a, D: ArchiveDriver> {
    controller: &'a mut TargetArchiveController<D>,
    options: AccessOptions,
    name: EntryName,
}

impl<'a, D: ArchiveDriver> InputSocket<FsEntry> for TargetInput<'a, D> {
    fn target(&mut self) -> Result<FsEntry> {
        self.controller
            .stat(self.options, &self.name)?
            .ok_or_else(|| FsError::NotFound(self.controller.resolve(&self.name)))
    }

    fn stream(&mut self, peer: Option<&dyn Entry>) -> Result<Box<dyn Read + Send>> {
        self.controller.open_input(self.options, &self.name, peer)
    }
}

struct TargetOutput<'a, D: ArchiveDriver> {
    controller: &'a mut TargetArchiveController<D>,
    options: AccessOptions,
    name: EntryName,
    template: Option<FsEntry>,
}

impl<'a, D: ArchiveDriver> OutputSocket<FsEntry> for TargetOutput<'a, D> {
    fn target(&mut self) -> Result<FsEntry> {
        let autocreate = self.options.contains(AccessOptions::CREATE_PARENTS);
        self.controller.mount(self.options, autocreate)?;
        Ok(match self.controller.stat(self.options, &self.name)? {
            Some(entry) => entry,
            None => FsEntry::new(self.name.as_str(), EntryType::File),
        })
    }

    fn stream(&mut self, peer: Option<&dyn Entry>) -> Result<Box<dyn EntryWriter>> {
        self.controller
            .open_output(self.options, &self.name, self.template.as_ref(), peer)
    }
}
