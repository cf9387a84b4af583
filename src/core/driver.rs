//! Driver contracts
//!
//! An [`FsDriver`] creates the controller stack for one mount point. Archive
//! formats implement the richer [`ArchiveDriver`] and get the default stack,
//! a [`CachingController`] over a [`TargetArchiveController`], for free.

use crate::core::archive::TargetArchiveController;
use crate::core::buffer_pool::IoBufferPool;
use crate::core::cache::CachingController;
use crate::core::container::{InputContainer, OutputContainer};
use crate::core::controller::{FsController, SharedController};
use crate::core::entry::{ArchiveEntry, Entry, EntryType, FsEntry};
use crate::core::error::Result;
use crate::core::model::FsModel;
use crate::core::socket::{InputSocket, OutputSocket};
use std::sync::Arc;

/// Factory of controllers for one file system type.
pub trait FsDriver: Send + Sync {
    /// Creates the controller for `model`, whose archive file is stored in
    /// the file system of `parent`.
    fn new_controller(
        self: Arc<Self>,
        model: Arc<FsModel>,
        parent: SharedController,
    ) -> Box<dyn FsController>;
}

/// Contract of an archive format implementation.
pub trait ArchiveDriver: Send + Sync + 'static {
    type Entry: ArchiveEntry;

    /// Creates an archive entry. Directory names carry a trailing `/`.
    ///
    /// `template` supplies timestamps and sizes to copy, if any.
    fn new_entry(
        &self,
        name: &str,
        entry_type: EntryType,
        template: Option<&dyn Entry>,
    ) -> Self::Entry;

    /// Opens the archive read from `source`.
    ///
    /// Failures other than control-flow signals make the mount point a
    /// false positive.
    fn new_input_container(
        &self,
        model: &FsModel,
        source: &mut dyn InputSocket<FsEntry>,
    ) -> Result<Box<dyn InputContainer<Self::Entry>>>;

    /// Starts a new archive written to `sink`.
    ///
    /// `source` is the input archive being updated, if any, for drivers that
    /// can reuse its raw data.
    fn new_output_container(
        &self,
        model: &FsModel,
        sink: &mut dyn OutputSocket<FsEntry>,
        source: Option<&dyn InputContainer<Self::Entry>>,
    ) -> Result<Box<dyn OutputContainer<Self::Entry>>>;

    /// Whether the format tolerates several entries with the same name,
    /// so content can be appended instead of rewritten.
    fn redundant_content_support(&self) -> bool {
        false
    }

    /// Whether redundant metadata (e.g. a second central directory) is
    /// tolerated.
    fn redundant_meta_data_support(&self) -> bool {
        false
    }

    /// Pool for buffers staging entry content.
    fn pool(&self) -> Arc<dyn IoBufferPool>;
}

impl<D: ArchiveDriver> FsDriver for D {
    fn new_controller(
        self: Arc<Self>,
        model: Arc<FsModel>,
        parent: SharedController,
    ) -> Box<dyn FsController> {
        let pool = self.pool();
        let target = TargetArchiveController::new(self, model, parent);
        Box::new(CachingController::new(target, pool))
    }
}
