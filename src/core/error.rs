//! Error types for the controller stack
//!
//! Three families live here:
//!
//! - [`Signal`] - control-flow signals (needs-sync, needs-lock-retry,
//!   false-positive). These are instructions to the caller, not failures, and
//!   are consumed by the retry loop in [`crate::FsManager`].
//! - [`FsError`] - everything an operation can fail with, signals included.
//! - [`SyncError`] - the aggregated outcome of a sync, built with
//!   [`SyncErrorBuilder`].

use std::fmt;
use std::io;
use thiserror::Error;

/// Control-flow signals raised by controllers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// The archive must be synced before the entry can be accessed.
    #[error("archive must be synced before '{0}' can be accessed")]
    NeedsSync(String),

    /// Lock contention: release all locks and retry the whole operation.
    #[error("lock contention, release all locks and retry")]
    NeedsLockRetry,

    /// The path looks like an archive but must be treated as a plain file or
    /// directory of the parent file system.
    #[error("'{path}' is not usable as an archive: {reason}")]
    FalsePositive {
        path: String,
        /// Persistent false positives stick until the next sync.
        persistent: bool,
        reason: String,
    },
}

/// Key prompting failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("key prompting was cancelled for {0}")]
    Cancelled(String),

    #[error("no key available for {0}")]
    Unavailable(String),

    #[error("key prompting timed out for {0}")]
    TimedOut(String),
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error(transparent)]
    Signal(#[from] Signal),

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists: {0}")]
    EntryExists(String),

    #[error("Entry is read-only: {0}")]
    ReadOnly(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Cannot stream a directory entry: {0}")]
    IsDirectory(String),

    #[error("Parent is not a directory: {0}")]
    NotDirectory(String),

    #[error("Resource busy: {0}")]
    Busy(String),

    #[error("Resource already released: {0}")]
    Released(String),

    #[error("Unknown key: {0}")]
    UnknownKey(#[from] KeyError),

    #[error("Invalid entry name: {0}")]
    InvalidName(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("I/O error: {0}")]
    Io(io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

impl FsError {
    /// Shorthand for a [`Signal::NeedsSync`] error.
    pub fn needs_sync(name: impl Into<String>) -> Self {
        FsError::Signal(Signal::NeedsSync(name.into()))
    }

    /// Shorthand for a [`Signal::FalsePositive`] error.
    pub fn false_positive(path: impl Into<String>, persistent: bool, reason: impl fmt::Display) -> Self {
        FsError::Signal(Signal::FalsePositive {
            path: path.into(),
            persistent,
            reason: reason.to_string(),
        })
    }

    /// Returns true for control-flow signals, which must never reach the
    /// application.
    pub fn is_signal(&self) -> bool {
        matches!(self, FsError::Signal(_))
    }

    pub fn signal(&self) -> Option<&Signal> {
        match self {
            FsError::Signal(signal) => Some(signal),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            FsError::NotFound(_) => true,
            FsError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Marker carried inside an [`io::Error`] by streams whose archive was closed
/// underneath them. Converts back into [`Signal::NeedsSync`].
#[derive(Error, Debug)]
#[error("archive entry '{0}' was closed by a sync")]
pub struct ArchiveClosed(pub String);

impl ArchiveClosed {
    pub fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::Other, self)
    }
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        if let Some(closed) = e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<ArchiveClosed>())
        {
            return FsError::needs_sync(closed.0.clone());
        }
        FsError::Io(e)
    }
}

impl From<FsError> for io::Error {
    fn from(e: FsError) -> Self {
        let kind = match &e {
            FsError::NotFound(_) => io::ErrorKind::NotFound,
            FsError::EntryExists(_) => io::ErrorKind::AlreadyExists,
            FsError::ReadOnly(_) => io::ErrorKind::PermissionDenied,
            FsError::InvalidName(_) | FsError::Config(_) => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        match e {
            FsError::Io(inner) => inner,
            other => io::Error::new(kind, other),
        }
    }
}

/// How bad a sync issue is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// The sync completed but something was left imperfect, e.g. a cache
    /// failed to clear or an input archive did not close cleanly.
    Warning,
    /// The physical archive may not have been written completely.
    Failure,
}

/// One problem observed during a sync.
#[derive(Debug)]
pub struct SyncIssue {
    pub mount_point: String,
    pub severity: Severity,
    pub cause: FsError,
}

impl SyncIssue {
    pub fn warning(mount_point: impl Into<String>, cause: impl Into<FsError>) -> Self {
        SyncIssue {
            mount_point: mount_point.into(),
            severity: Severity::Warning,
            cause: cause.into(),
        }
    }

    pub fn failure(mount_point: impl Into<String>, cause: impl Into<FsError>) -> Self {
        SyncIssue {
            mount_point: mount_point.into(),
            severity: Severity::Failure,
            cause: cause.into(),
        }
    }
}

impl fmt::Display for SyncIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            Severity::Warning => "warning",
            Severity::Failure => "failure",
        };
        write!(f, "{} at {}: {}", label, self.mount_point, self.cause)
    }
}

/// Aggregated sync outcome. Holds at least one issue.
#[derive(Error, Debug)]
pub struct SyncError {
    issues: Vec<SyncIssue>,
}

impl SyncError {
    /// The worst severity among all issues.
    pub fn severity(&self) -> Severity {
        self.issues
            .iter()
            .map(|issue| issue.severity)
            .max()
            .unwrap_or(Severity::Warning)
    }

    /// True when every issue is a warning.
    pub fn is_warning(&self) -> bool {
        self.severity() == Severity::Warning
    }

    pub fn issues(&self) -> &[SyncIssue] {
        &self.issues
    }

    pub fn into_issues(self) -> Vec<SyncIssue> {
        self.issues
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.issues.as_slice() {
            [] => write!(f, "sync failed"),
            [only] => write!(f, "sync {}", only),
            [first, rest @ ..] => write!(f, "sync {} (and {} more)", first, rest.len()),
        }
    }
}

/// Collects sync issues while cleanup keeps running.
///
/// The first [`fail`](Self::fail) is the hard failure; any later failure is
/// downgraded to a warning so the original cause is not replaced.
#[derive(Debug, Default)]
pub struct SyncErrorBuilder {
    issues: Vec<SyncIssue>,
    failed: bool,
}

impl SyncErrorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an issue with its own severity.
    pub fn warn(&mut self, issue: SyncIssue) {
        tracing::warn!("{}", issue);
        if issue.severity == Severity::Failure {
            self.failed = true;
        }
        self.issues.push(issue);
    }

    /// Records a hard failure and returns everything collected so far, for the
    /// caller to propagate immediately.
    pub fn fail(&mut self, mount_point: impl Into<String>, cause: impl Into<FsError>) -> SyncError {
        let mut issue = SyncIssue::failure(mount_point, cause);
        if self.failed {
            issue.severity = Severity::Warning;
        }
        self.failed = true;
        tracing::warn!("{}", issue);
        self.issues.push(issue);
        SyncError {
            issues: std::mem::take(&mut self.issues),
        }
    }

    /// Absorbs the issues of a nested sync error.
    pub fn merge(&mut self, error: SyncError) {
        for issue in error.issues {
            if issue.severity == Severity::Failure {
                self.failed = true;
            }
            self.issues.push(issue);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Fails if any issue was recorded.
    pub fn check(self) -> std::result::Result<(), SyncError> {
        if self.issues.is_empty() {
            Ok(())
        } else {
            Err(SyncError {
                issues: self.issues,
            })
        }
    }
}
