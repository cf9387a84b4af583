//! File system controller contract
//!
//! A controller serves one mount point. Controllers are stacked as
//! decorators (caching over target archive) and chained to the controller
//! of their parent mount point, which stores the archive file itself.
//!
//! Controllers are not internally synchronized. Callers share them as
//! [`SharedController`] and hold its lock for the duration of an operation.

use crate::core::entry::{Access, EntryName, EntryType, FsEntry};
use crate::core::error::Result;
use crate::core::model::{FsModel, MountPoint};
use crate::core::options::{AccessModes, AccessOptions, SyncOptions};
use crate::core::socket::{InputSocket, OutputSocket};
use parking_lot::Mutex;
use std::sync::Arc;

pub trait FsController: Send {
    fn model(&self) -> &Arc<FsModel>;

    fn mount_point(&self) -> &MountPoint {
        self.model().mount_point()
    }

    /// Metadata of an entry, `None` if it does not exist.
    fn stat(&mut self, options: AccessOptions, name: &EntryName) -> Result<Option<FsEntry>>;

    fn check_access(
        &mut self,
        options: AccessOptions,
        name: &EntryName,
        modes: AccessModes,
    ) -> Result<()>;

    fn set_read_only(&mut self, name: &EntryName) -> Result<()>;

    /// Sets the given timestamps. Returns false if some could not be set.
    fn set_time(
        &mut self,
        options: AccessOptions,
        name: &EntryName,
        times: &[(Access, u64)],
    ) -> Result<bool>;

    fn input<'a>(
        &'a mut self,
        options: AccessOptions,
        name: EntryName,
    ) -> Box<dyn InputSocket<FsEntry> + 'a>;

    /// `template` supplies metadata for the new entry, e.g. when copying.
    fn output<'a>(
        &'a mut self,
        options: AccessOptions,
        name: EntryName,
        template: Option<FsEntry>,
    ) -> Box<dyn OutputSocket<FsEntry> + 'a>;

    /// Creates or replaces an entry without content.
    fn mknod(
        &mut self,
        options: AccessOptions,
        name: &EntryName,
        entry_type: EntryType,
        template: Option<FsEntry>,
    ) -> Result<()>;

    fn unlink(&mut self, options: AccessOptions, name: &EntryName) -> Result<()>;

    /// Writes pending changes to the parent file system. Failures come back
    /// as [`crate::FsError::Sync`].
    fn sync(&mut self, options: SyncOptions) -> Result<()>;
}

/// A controller shared between its users and its child mount points.
pub type SharedController = Arc<Mutex<Box<dyn FsController>>>;

pub fn share(controller: Box<dyn FsController>) -> SharedController {
    Arc::new(Mutex::new(controller))
}
