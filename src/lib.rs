//! # Matryoshka - Nested Archives as Directories
//!
//! `matryoshka` lets applications treat archive files as directories. A path
//! like `backup.tar/logs.zip/today.txt` reads `today.txt` from the zip file
//! stored inside the tar file, with any depth of nesting:
//!
//! - **Virtual file systems** mounted lazily for every archive on a path
//! - **Deferred writes** staged in content caches and the archive tree until
//!   a sync writes the archive files, innermost first
//! - **Drivers** for zip, tar and AES-256-GCM sealed zip archives
//! - **Configurable** suffix mappings and access defaults from TOML
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use matryoshka::{FsManager, Result, SyncOptions};
//!
//! # fn main() -> Result<()> {
//! let fs = FsManager::new("/data")?;
//!
//! // Archives and parent directories are created as needed
//! fs.write("reports.zip/2024/q1.txt", b"revenue up")?;
//!
//! // Reads see pending writes before anything is synced
//! let content = fs.read("reports.zip/2024/q1.txt")?;
//!
//! // List an archive directory
//! let quarters = fs.read_dir("reports.zip/2024")?;
//!
//! // Write reports.zip and release all resources
//! fs.sync(SyncOptions::UMOUNT)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! ```rust,no_run
//! use matryoshka::{Config, FsManagerBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! let config = Config::from_toml_str(
//!     r#"
//!     buffer_pool = "temp"
//!
//!     [drivers]
//!     "zip|jar|war" = "zip"
//!     "#,
//! )?;
//! let fs = FsManagerBuilder::new().root("/srv/apps").config(config).build()?;
//! fs.write("app.war/WEB-INF/web.xml", b"<web-app/>")?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod manager;

pub use crate::config::{BufferPoolKind, Config};
pub use crate::core::entry::{Access, Entry, EntryName, EntryType, FsEntry, Size};
pub use crate::core::error::{
    FsError, KeyError, Result, Severity, Signal, SyncError, SyncErrorBuilder, SyncIssue,
};
pub use crate::core::options::{AccessModes, AccessOptions, AccessPreferences, SyncOptions};
pub use crate::drivers::{Passphrase, SealedDriver, TarDriver, ZipDriver};
pub use crate::manager::{FsManager, FsManagerBuilder};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
