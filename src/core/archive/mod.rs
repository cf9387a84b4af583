//! Archive file systems
//!
//! The pieces a [`TargetArchiveController`] is assembled from: the in-memory
//! tree, the input/output archive wrappers of one mount cycle and the policy
//! deciding when staged entries require a sync.

pub mod fs;
pub mod io;
pub mod policy;
pub mod target;

pub use fs::{ArchiveFileSystem, CovariantEntry};
pub use io::{InputArchive, OutputArchive};
pub use policy::{GrowPolicy, Intention, Redundancy, StrictPolicy, SyncPolicy};
pub use target::TargetArchiveController;
