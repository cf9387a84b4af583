//! Mount points and file system models

use crate::core::entry::EntryName;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Location at which a file system is grafted into its parent.
///
/// The host root has no parent. Every archive mount point names its parent
/// mount point and the entry it occupies there.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MountPoint {
    path: String,
    parent: Option<Box<MountPoint>>,
    entry_name: EntryName,
}

impl MountPoint {
    /// The host root.
    pub fn root() -> Self {
        MountPoint {
            path: String::new(),
            parent: None,
            entry_name: EntryName::ROOT,
        }
    }

    /// Mount point of the archive stored as `entry_name` in `parent`.
    pub fn nested(parent: &MountPoint, entry_name: EntryName) -> Self {
        let path = if parent.path.is_empty() {
            entry_name.to_string()
        } else {
            format!("{}/{}", parent.path, entry_name)
        };
        MountPoint {
            path,
            parent: Some(Box::new(parent.clone())),
            entry_name,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parent(&self) -> Option<&MountPoint> {
        self.parent.as_deref()
    }

    /// Name of the archive entry in the parent file system.
    pub fn entry_name(&self) -> &EntryName {
        &self.entry_name
    }

    /// Number of archives between this mount point and the host root.
    pub fn depth(&self) -> usize {
        self.parent().map_or(0, |parent| parent.depth() + 1)
    }

    /// Resolves an entry of this file system to a display path.
    pub fn resolve(&self, name: &EntryName) -> String {
        match (self.path.is_empty(), name.is_root()) {
            (true, _) => name.to_string(),
            (_, true) => self.path.clone(),
            _ => format!("{}/{}", self.path, name),
        }
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str("/")
        } else {
            f.write_str(&self.path)
        }
    }
}

/// Per mount point state shared by every controller of that file system.
#[derive(Debug)]
pub struct FsModel {
    mount_point: MountPoint,
    parent: Option<Arc<FsModel>>,
    touched: AtomicBool,
}

impl FsModel {
    pub fn new(mount_point: MountPoint, parent: Option<Arc<FsModel>>) -> Arc<Self> {
        if let Some(parent) = &parent {
            assert_eq!(
                mount_point.parent(),
                Some(parent.mount_point()),
                "model parent does not match mount point parent"
            );
        }
        Arc::new(FsModel {
            mount_point,
            parent,
            touched: AtomicBool::new(false),
        })
    }

    pub fn mount_point(&self) -> &MountPoint {
        &self.mount_point
    }

    pub fn parent(&self) -> Option<&Arc<FsModel>> {
        self.parent.as_ref()
    }

    /// True while the file system has changes not yet synced.
    pub fn is_touched(&self) -> bool {
        self.touched.load(Ordering::Acquire)
    }

    pub fn set_touched(&self, touched: bool) {
        let was = self.touched.swap(touched, Ordering::AcqRel);
        if was != touched {
            tracing::debug!("{} touched = {}", self.mount_point, touched);
        }
    }
}
