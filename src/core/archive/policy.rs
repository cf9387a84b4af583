//! Consistency policy for entries already staged in the output archive
//!
//! Most archive formats cannot hold two entries of the same name, so once an
//! entry has been written to the output archive, touching it again requires
//! a sync first. Formats that tolerate redundant entries (the last one wins
//! on read) can skip that sync when the caller asked to grow the archive.

use crate::core::options::AccessOptions;

/// What the caller is about to do with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intention {
    /// Read content.
    Read,
    /// Replace content.
    Write,
    /// Change metadata only, e.g. timestamps or removal.
    Metadata,
}

/// Redundancy the active driver declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Redundancy {
    pub content: bool,
    pub meta_data: bool,
}

/// Decides whether an entry present in the output archive may be accessed
/// without a sync.
pub trait SyncPolicy: Send + Sync {
    fn tolerates_staged(
        &self,
        options: AccessOptions,
        intention: Intention,
        redundancy: Redundancy,
    ) -> bool;
}

/// Always require a sync.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictPolicy;

impl SyncPolicy for StrictPolicy {
    fn tolerates_staged(&self, _: AccessOptions, _: Intention, _: Redundancy) -> bool {
        false
    }
}

/// Honors [`AccessOptions::GROW`] where the driver supports redundancy.
///
/// Reads always need a sync, since the staged content is not readable until
/// the output archive is closed.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrowPolicy;

impl SyncPolicy for GrowPolicy {
    fn tolerates_staged(
        &self,
        options: AccessOptions,
        intention: Intention,
        redundancy: Redundancy,
    ) -> bool {
        if !options.contains(AccessOptions::GROW) {
            return false;
        }
        match intention {
            Intention::Read => false,
            Intention::Write => redundancy.content,
            Intention::Metadata => redundancy.meta_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: Redundancy = Redundancy {
        content: true,
        meta_data: true,
    };

    #[test]
    fn test_grow_needs_flag_and_support() {
        let policy = GrowPolicy;
        assert!(!policy.tolerates_staged(AccessOptions::empty(), Intention::Write, FULL));
        assert!(policy.tolerates_staged(AccessOptions::GROW, Intention::Write, FULL));
        assert!(!policy.tolerates_staged(
            AccessOptions::GROW,
            Intention::Write,
            Redundancy::default()
        ));
    }

    #[test]
    fn test_reads_always_sync() {
        assert!(!GrowPolicy.tolerates_staged(AccessOptions::GROW, Intention::Read, FULL));
        assert!(!StrictPolicy.tolerates_staged(AccessOptions::GROW, Intention::Write, FULL));
    }

    #[test]
    fn test_metadata_follows_meta_support() {
        let meta_only = Redundancy {
            content: false,
            meta_data: true,
        };
        assert!(GrowPolicy.tolerates_staged(AccessOptions::GROW, Intention::Metadata, meta_only));
        assert!(!GrowPolicy.tolerates_staged(AccessOptions::GROW, Intention::Write, meta_only));
    }
}
