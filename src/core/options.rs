//! Option sets for entry access, sync and access checks

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Preferences for a single input or output operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessOptions: u32 {
        /// Stage content through the content cache.
        const CACHE = 1 << 0;
        /// Create missing parent directories (and missing archives).
        const CREATE_PARENTS = 1 << 1;
        /// Append to existing content instead of replacing it.
        const APPEND = 1 << 2;
        /// Fail if the entry already exists.
        const EXCLUSIVE = 1 << 3;
        /// Prefer appending redundant entries over rewriting the archive.
        const GROW = 1 << 4;
        /// Store entries without compression.
        const STORE = 1 << 5;
        /// Compress entries.
        const COMPRESS = 1 << 6;
    }
}

bitflags! {
    /// Options controlling a sync.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SyncOptions: u32 {
        /// Discard pending changes instead of writing them.
        const ABORT_CHANGES = 1 << 0;
        /// Empty all content caches after flushing.
        const CLEAR_CACHE = 1 << 1;
        /// Close input archives even if streams are still open.
        const FORCE_CLOSE_INPUT = 1 << 2;
        /// Close output archives even if streams are still open.
        const FORCE_CLOSE_OUTPUT = 1 << 3;
    }
}

impl SyncOptions {
    /// Plain sync: write changes, keep caches.
    pub const SYNC: SyncOptions = SyncOptions::empty();

    /// Sync before unmounting: write changes and drop everything.
    pub const UMOUNT: SyncOptions = SyncOptions::CLEAR_CACHE
        .union(SyncOptions::FORCE_CLOSE_INPUT)
        .union(SyncOptions::FORCE_CLOSE_OUTPUT);
}

bitflags! {
    /// Access kinds probed by `check_access`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessModes: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Serializable form of the default access options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPreferences {
    pub create_parents: bool,
    pub cache: bool,
    pub grow: bool,
}

impl Default for AccessPreferences {
    fn default() -> Self {
        AccessPreferences {
            create_parents: true,
            cache: true,
            grow: false,
        }
    }
}

impl From<AccessPreferences> for AccessOptions {
    fn from(prefs: AccessPreferences) -> Self {
        let mut options = AccessOptions::empty();
        options.set(AccessOptions::CREATE_PARENTS, prefs.create_parents);
        options.set(AccessOptions::CACHE, prefs.cache);
        options.set(AccessOptions::GROW, prefs.grow);
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_umount_preset() {
        assert!(SyncOptions::UMOUNT.contains(SyncOptions::CLEAR_CACHE));
        assert!(!SyncOptions::UMOUNT.contains(SyncOptions::ABORT_CHANGES));
        assert!(SyncOptions::SYNC.is_empty());
    }

    #[test]
    fn test_preferences_to_options() {
        let options: AccessOptions = AccessPreferences::default().into();
        assert_eq!(options, AccessOptions::CACHE | AccessOptions::CREATE_PARENTS);

        let grow: AccessOptions = AccessPreferences {
            create_parents: false,
            cache: false,
            grow: true,
        }
        .into();
        assert_eq!(grow, AccessOptions::GROW);
    }
}
