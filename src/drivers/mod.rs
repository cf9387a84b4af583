//! Reference archive drivers
//!
//! Adapters from the `zip` and `tar` crates to [`ArchiveDriver`], plus a
//! driver decorator that seals a whole archive with AES-256-GCM.
//!
//! Archive files are read into memory when mounted. Output containers
//! accept one open entry stream at a time; concurrent writers are
//! serialized by the multiplexing container in front of them.
//!
//! [`ArchiveDriver`]: crate::core::driver::ArchiveDriver

pub mod sealed;
pub mod tar;
pub mod zip;

pub use self::sealed::{Passphrase, SealedDriver};
pub use self::tar::{TarDriver, TarEntry};
pub use self::zip::{ZipDriver, ZipEntry};

use crate::core::buffer_pool::IoBufferPool;
use crate::core::driver::FsDriver;
use crate::core::entry::{Access, Entry, EntryType, FsEntry, Size};
use crate::core::error::Result;
use crate::core::key::PromptingKeyManager;
use crate::core::registry::DriverCatalog;
use crate::core::socket::InputSocket;
use std::io::{Cursor, Read};
use std::sync::Arc;

/// Sizes and timestamps shared by the driver entry types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct EntryMeta {
    data: Option<u64>,
    storage: Option<u64>,
    create: Option<u64>,
    read: Option<u64>,
    write: Option<u64>,
}

impl EntryMeta {
    pub(crate) fn from_template(template: Option<&dyn Entry>) -> Self {
        let mut meta = EntryMeta::default();
        if let Some(template) = template {
            for access in Access::ALL {
                meta.set_time(access, template.time(access));
            }
            meta.data = template.size(Size::Data);
        }
        meta
    }

    pub(crate) fn size(&self, kind: Size) -> Option<u64> {
        match kind {
            Size::Data => self.data,
            Size::Storage => self.storage,
        }
    }

    pub(crate) fn set_size(&mut self, kind: Size, value: Option<u64>) {
        match kind {
            Size::Data => self.data = value,
            Size::Storage => self.storage = value,
        }
    }

    pub(crate) fn time(&self, access: Access) -> Option<u64> {
        match access {
            Access::Create => self.create,
            Access::Read => self.read,
            Access::Write => self.write,
        }
    }

    pub(crate) fn set_time(&mut self, access: Access, value: Option<u64>) {
        match access {
            Access::Create => self.create = value,
            Access::Read => self.read = value,
            Access::Write => self.write = value,
        }
    }
}

/// Archive entry name with the trailing `/` directories carry.
pub(crate) fn entry_name(name: &str, entry_type: EntryType) -> String {
    if entry_type == EntryType::Directory && !name.is_empty() && !name.ends_with('/') {
        format!("{}/", name)
    } else {
        name.to_string()
    }
}

/// Reads the whole archive file.
pub(crate) fn read_source(source: &mut dyn InputSocket<FsEntry>) -> Result<(FsEntry, Vec<u8>)> {
    let target = source.target()?;
    let mut data = Vec::new();
    source.stream(None)?.read_to_end(&mut data)?;
    Ok((target, data))
}

/// Input socket over bytes already in memory.
pub(crate) struct MemorySource {
    pub(crate) target: FsEntry,
    pub(crate) data: Vec<u8>,
}

impl InputSocket<FsEntry> for MemorySource {
    fn target(&mut self) -> Result<FsEntry> {
        Ok(self.target.clone())
    }

    fn stream(&mut self, _peer: Option<&dyn Entry>) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.data.clone())))
    }
}

/// Catalog with the drivers of this crate: `zip`, `tar` and `sealed-zip`.
pub fn builtin_catalog(
    pool: Arc<dyn IoBufferPool>,
    keys: Arc<PromptingKeyManager<Passphrase>>,
) -> DriverCatalog {
    let mut catalog = DriverCatalog::new();
    {
        let pool = pool.clone();
        catalog.register("zip", move || -> Arc<dyn FsDriver> {
            Arc::new(ZipDriver::new(pool.clone()))
        });
    }
    {
        let pool = pool.clone();
        catalog.register("tar", move || -> Arc<dyn FsDriver> {
            Arc::new(TarDriver::new(pool.clone()))
        });
    }
    catalog.register("sealed-zip", move || -> Arc<dyn FsDriver> {
        Arc::new(SealedDriver::new(ZipDriver::new(pool.clone()), keys.clone()))
    });
    catalog
}
