//! Controller stack
//!
//! Every mount point is served by a chain of controllers. The archive
//! controllers of a nested mount point read and write the archive file
//! through the controller of the parent mount point:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ CachingController       (a.tar/b.zip)       │
//! │  - per entry content caches                 │
//! ├─────────────────────────────────────────────┤
//! │ TargetArchiveController (a.tar/b.zip)       │
//! │  - archive tree, input + output archive     │
//! └───────────────┬─────────────────────────────┘
//!                 │ archive file "b.zip"
//! ┌───────────────▼─────────────────────────────┐
//! │ CachingController       (a.tar)             │
//! ├─────────────────────────────────────────────┤
//! │ TargetArchiveController (a.tar)             │
//! └───────────────┬─────────────────────────────┘
//!                 │ archive file "a.tar"
//! ┌───────────────▼─────────────────────────────┐
//! │ HostController          (/)                 │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! - [`entry`] / [`options`] - entry names, metadata and option sets
//! - [`socket`] / [`io`] - lazy stream factories and the copy utility
//! - [`container`] / [`multiplex`] - entry containers and the
//!   multiplexing output container
//! - [`buffer_pool`] - staging buffers (memory or temp files)
//! - [`archive`] - archive tree and the target archive controller
//! - [`cache`] - content caching controller
//! - [`registry`] / [`driver`] - suffix to driver mapping and driver
//!   contracts
//! - [`key`] - throttled key prompting

pub mod archive;
pub mod buffer_pool;
pub mod cache;
pub mod container;
pub mod controller;
pub mod driver;
pub mod entry;
pub mod error;
pub mod host;
pub mod io;
pub mod key;
pub mod model;
pub mod multiplex;
pub mod options;
pub mod registry;
pub mod socket;

pub use archive::TargetArchiveController;
pub use buffer_pool::{IoBuffer, IoBufferPool, MemoryPool, TempFilePool};
pub use cache::CachingController;
pub use container::{Container, InputContainer, MemoryContainer, OutputContainer};
pub use controller::{FsController, SharedController};
pub use driver::{ArchiveDriver, FsDriver};
pub use host::HostController;
pub use key::{KeyPrompt, KeyProvider, PromptingKeyManager, PromptingKeyProvider};
pub use model::{FsModel, MountPoint};
pub use multiplex::MultiplexingOutputContainer;
pub use registry::{DriverCatalog, DriverRegistry, DriverSpec, SuffixSet};
