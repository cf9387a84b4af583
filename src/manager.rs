//! Top-level file system manager
//!
//! [`FsManager`] turns slash separated paths into a controller plus an entry
//! name. Every path segment whose file name carries a registered archive
//! suffix is mounted as a nested file system, so `a.tar/b.zip/c.txt` reads
//! `c.txt` from the zip stored in the tar stored in the host directory.
//!
//! Controllers answer with control-flow signals instead of blocking or
//! guessing. The manager consumes them in a bounded retry loop:
//!
//! - `NeedsSync`: syncs the affected mount point (children first) and
//!   retries, widening to the parent mount point if the signal repeats.
//! - `FalsePositive`: retries with the archive path treated as a plain file
//!   or directory of its parent file system.
//! - `NeedsLockRetry`: yields and retries.

use crate::config::Config;
use crate::core::controller::{share, FsController, SharedController};
use crate::core::driver::FsDriver;
use crate::core::entry::{Entry, EntryName, EntryType, FsEntry};
use crate::core::error::{FsError, Result, Signal, SyncErrorBuilder, SyncIssue};
use crate::core::host::HostController;
use crate::core::key::{KeyPrompt, NoPrompt, PromptingKeyManager};
use crate::core::model::{FsModel, MountPoint};
use crate::core::options::{AccessOptions, SyncOptions};
use crate::core::registry::DriverRegistry;
use crate::core::socket::{read_all, write_all};
use crate::drivers::{builtin_catalog, Passphrase};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Upper bound of attempts per operation.
pub const MAX_ATTEMPTS: usize = 16;

#[derive(Clone)]
struct Mount {
    model: Arc<FsModel>,
    controller: SharedController,
}

/// Controller and entry name a path resolved to.
struct Resolved {
    mount_point: MountPoint,
    controller: SharedController,
    name: EntryName,
}

/// Entry point for reading and writing paths that may cross archives.
///
/// # Examples
///
/// ```rust,no_run
/// use matryoshka::{FsManager, Result, SyncOptions};
///
/// # fn main() -> Result<()> {
/// let fs = FsManager::new("/tmp/data")?;
/// fs.write("backup.tar/logs.zip/today.txt", b"all quiet")?;
/// assert_eq!(fs.read("backup.tar/logs.zip/today.txt")?, b"all quiet");
/// fs.sync(SyncOptions::UMOUNT)?;
/// # Ok(())
/// # }
/// ```
pub struct FsManager {
    registry: Arc<DriverRegistry>,
    host: Mount,
    mounts: Mutex<IndexMap<MountPoint, Mount>>,
    /// Persistent false positives, forgotten on the next sync.
    false_positives: Mutex<HashSet<String>>,
    keys: Arc<PromptingKeyManager<Passphrase>>,
    options: AccessOptions,
}

impl FsManager {
    /// Manager over the host directory `root` with the default
    /// configuration.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        FsManagerBuilder::new().root(root).build()
    }

    pub fn builder() -> FsManagerBuilder {
        FsManagerBuilder::new()
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    pub fn keys(&self) -> &Arc<PromptingKeyManager<Passphrase>> {
        &self.keys
    }

    /// Default options of every operation.
    pub fn options(&self) -> AccessOptions {
        self.options
    }

    /// Number of archive mount points created so far.
    pub fn mounts(&self) -> usize {
        self.mounts.lock().len()
    }

    /// Reads the whole content of a file.
    pub fn read<P: AsRef<str>>(&self, path: P) -> Result<Vec<u8>> {
        let options = self.options;
        self.with_retry(path.as_ref(), |resolved| {
            let mut controller = resolved.controller.lock();
            let mut socket = controller.input(options, resolved.name.clone());
            read_all(&mut *socket)
        })
    }

    /// Creates or replaces a file.
    pub fn write<P: AsRef<str>>(&self, path: P, content: &[u8]) -> Result<()> {
        let options = self.options;
        self.with_retry(path.as_ref(), |resolved| {
            let mut controller = resolved.controller.lock();
            let mut socket = controller.output(options, resolved.name.clone(), None);
            write_all(&mut *socket, content)
        })?;
        debug!("Wrote {} bytes to {}", content.len(), path.as_ref());
        Ok(())
    }

    /// Appends to a file, creating it if necessary.
    pub fn append<P: AsRef<str>>(&self, path: P, content: &[u8]) -> Result<()> {
        let options = self.options | AccessOptions::APPEND;
        self.with_retry(path.as_ref(), |resolved| {
            let mut controller = resolved.controller.lock();
            let mut socket = controller.output(options, resolved.name.clone(), None);
            write_all(&mut *socket, content)
        })
    }

    /// Creates a directory. On an archive path this creates an empty
    /// archive.
    pub fn mkdir<P: AsRef<str>>(&self, path: P) -> Result<()> {
        let options = self.options;
        self.with_retry(path.as_ref(), |resolved| {
            resolved
                .controller
                .lock()
                .mknod(options, &resolved.name, EntryType::Directory, None)
        })
    }

    /// Removes a file or an empty directory. On an archive path this
    /// removes the archive file, which must be empty.
    pub fn remove<P: AsRef<str>>(&self, path: P) -> Result<()> {
        let options = self.options;
        self.with_retry(path.as_ref(), |resolved| {
            resolved.controller.lock().unlink(options, &resolved.name)?;
            if resolved.name.is_root() {
                self.keys.remove_provider(resolved.mount_point.path());
            }
            Ok(())
        })
    }

    /// Metadata of an entry, `None` if it does not exist.
    ///
    /// An archive path reports the archive as a directory.
    pub fn stat<P: AsRef<str>>(&self, path: P) -> Result<Option<FsEntry>> {
        let options = self.options;
        self.with_retry(path.as_ref(), |resolved| {
            resolved.controller.lock().stat(options, &resolved.name)
        })
    }

    pub fn exists<P: AsRef<str>>(&self, path: P) -> Result<bool> {
        Ok(self.stat(path)?.is_some())
    }

    /// Sorted member names of a directory.
    pub fn read_dir<P: AsRef<str>>(&self, path: P) -> Result<Vec<String>> {
        let path = path.as_ref();
        let entry = self
            .stat(path)?
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if !entry.is_type(EntryType::Directory) {
            return Err(FsError::NotDirectory(path.to_string()));
        }
        Ok(entry
            .members()
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Copies a file, keeping its timestamps.
    pub fn copy<P: AsRef<str>, Q: AsRef<str>>(&self, from: P, to: Q) -> Result<u64> {
        let from = from.as_ref();
        let template = self
            .stat(from)?
            .ok_or_else(|| FsError::NotFound(from.to_string()))?;
        if template.is_type(EntryType::Directory) {
            return Err(FsError::IsDirectory(from.to_string()));
        }
        let content = self.read(from)?;
        let options = self.options;
        self.with_retry(to.as_ref(), |resolved| {
            let mut controller = resolved.controller.lock();
            let mut socket = controller.output(options, resolved.name.clone(), Some(template.clone()));
            write_all(&mut *socket, &content)
        })?;
        Ok(content.len() as u64)
    }

    /// Syncs every mount point, innermost first, so each archive is written
    /// into its parent before the parent itself is written.
    ///
    /// All issues of all mount points are collected into one
    /// [`FsError::Sync`].
    pub fn sync(&self, options: SyncOptions) -> Result<()> {
        let mounts: Vec<(MountPoint, Mount)> = self
            .mounts
            .lock()
            .iter()
            .map(|(mount_point, mount)| (mount_point.clone(), mount.clone()))
            .collect();
        let mut builder = SyncErrorBuilder::new();
        Self::sync_all(mounts, options, &mut builder);
        self.false_positives.lock().clear();

        let clean = builder.is_empty();
        if clean && options.contains(SyncOptions::CLEAR_CACHE) {
            self.mounts.lock().clear();
        }
        info!("Synced {}", self.host.model.mount_point());
        builder.check()?;
        Ok(())
    }

    fn sync_all(
        mut mounts: Vec<(MountPoint, Mount)>,
        options: SyncOptions,
        builder: &mut SyncErrorBuilder,
    ) {
        mounts.sort_by_key(|(mount_point, _)| std::cmp::Reverse(mount_point.depth()));
        for (mount_point, mount) in mounts {
            match mount.controller.lock().sync(options) {
                Ok(()) => {}
                Err(FsError::Sync(e)) => builder.merge(e),
                Err(e) => builder.warn(SyncIssue::failure(mount_point.path(), e)),
            }
        }
    }

    /// Syncs `top` and every mount point nested in it.
    fn sync_subtree(&self, top: &MountPoint) -> Result<()> {
        let mounts: Vec<(MountPoint, Mount)> = self
            .mounts
            .lock()
            .iter()
            .filter(|(mount_point, _)| is_within(mount_point, top))
            .map(|(mount_point, mount)| (mount_point.clone(), mount.clone()))
            .collect();
        debug!("Syncing {} mount points under {}", mounts.len(), top);
        let mut builder = SyncErrorBuilder::new();
        Self::sync_all(mounts, SyncOptions::SYNC, &mut builder);
        builder.check()?;
        Ok(())
    }

    fn with_retry<T>(&self, path: &str, mut op: impl FnMut(&Resolved) -> Result<T>) -> Result<T> {
        let name = EntryName::new(path)?;
        let mut plain = HashSet::new();
        let mut syncs = 0usize;

        for attempt in 1..=MAX_ATTEMPTS {
            let resolved = self.resolve(&name, &plain)?;
            let signal = match op(&resolved) {
                Err(FsError::Signal(signal)) => signal,
                other => return other,
            };
            debug!("Attempt {} on '{}': {}", attempt, path, signal);
            match signal {
                Signal::FalsePositive {
                    path: archive,
                    persistent,
                    ..
                } => {
                    if persistent {
                        self.false_positives.lock().insert(archive.clone());
                    }
                    plain.insert(archive);
                }
                Signal::NeedsSync(_) => {
                    let top = widen(&resolved.mount_point, syncs);
                    syncs += 1;
                    if top.depth() > 0 {
                        self.sync_subtree(&top)?;
                    }
                }
                Signal::NeedsLockRetry => thread::yield_now(),
            }
        }
        warn!("Giving up on '{}' after {} attempts", path, MAX_ATTEMPTS);
        Err(FsError::Busy(path.to_string()))
    }

    /// Walks `path` from the host root, mounting every archive on the way.
    fn resolve(&self, path: &EntryName, plain: &HashSet<String>) -> Result<Resolved> {
        let mut current = self.host.clone();
        let mut relative = EntryName::ROOT;
        let mut walked = String::new();

        for segment in path.as_str().split('/').filter(|s| !s.is_empty()) {
            relative = relative.join(&EntryName::new(segment)?);
            if !walked.is_empty() {
                walked.push('/');
            }
            walked.push_str(segment);

            if plain.contains(&walked) || self.false_positives.lock().contains(&walked) {
                continue;
            }
            let Some((_, driver)) = self.registry.detect(segment)? else {
                continue;
            };
            let mount_point =
                MountPoint::nested(current.model.mount_point(), std::mem::take(&mut relative));
            current = self.mount(mount_point, driver, &current);
        }

        Ok(Resolved {
            mount_point: current.model.mount_point().clone(),
            controller: current.controller,
            name: relative,
        })
    }

    fn mount(&self, mount_point: MountPoint, driver: Arc<dyn FsDriver>, parent: &Mount) -> Mount {
        let mut mounts = self.mounts.lock();
        if let Some(mount) = mounts.get(&mount_point) {
            return mount.clone();
        }
        let model = FsModel::new(mount_point.clone(), Some(parent.model.clone()));
        let controller = share(driver.new_controller(model.clone(), parent.controller.clone()));
        debug!("New mount point {}", mount_point);
        let mount = Mount { model, controller };
        mounts.insert(mount_point, mount.clone());
        mount
    }
}

impl Drop for FsManager {
    fn drop(&mut self) {
        if let Err(e) = self.sync(SyncOptions::UMOUNT) {
            warn!("Unmounting on drop failed: {}", e);
        }
    }
}

fn is_within(mount_point: &MountPoint, top: &MountPoint) -> bool {
    let mut current = Some(mount_point);
    while let Some(mp) = current {
        if mp == top {
            return true;
        }
        current = mp.parent();
    }
    false
}

/// The ancestor `levels` steps above `mount_point`, stopping below the host
/// root.
fn widen(mount_point: &MountPoint, levels: usize) -> MountPoint {
    let mut top = mount_point;
    for _ in 0..levels {
        match top.parent() {
            Some(parent) if parent.depth() > 0 => top = parent,
            _ => break,
        }
    }
    top.clone()
}

/// Builder for [`FsManager`].
///
/// # Examples
///
/// ```rust,no_run
/// use matryoshka::{Config, FsManagerBuilder};
///
/// # fn main() -> matryoshka::Result<()> {
/// let config = Config::from_toml_str("default_suffixes = \"zip\"")?;
/// let fs = FsManagerBuilder::new()
///     .root("/data")
///     .config(config)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct FsManagerBuilder {
    root: Option<PathBuf>,
    config: Config,
    prompt: Option<Arc<dyn KeyPrompt<Passphrase>>>,
}

impl FsManagerBuilder {
    pub fn new() -> Self {
        FsManagerBuilder {
            root: None,
            config: Config::default(),
            prompt: None,
        }
    }

    /// Host directory all paths are relative to. Defaults to the current
    /// directory.
    pub fn root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Loads the configuration from a TOML file.
    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.config = Config::load(path)?;
        Ok(self)
    }

    /// Asks for passphrases of sealed archives. Without a prompt, sealed
    /// archives fail with [`FsError::UnknownKey`].
    pub fn prompt(mut self, prompt: Arc<dyn KeyPrompt<Passphrase>>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn build(self) -> Result<FsManager> {
        let root = match self.root {
            Some(root) => root,
            None => std::env::current_dir()?,
        };
        let prompt = self.prompt.unwrap_or_else(|| Arc::new(NoPrompt));
        let keys = Arc::new(PromptingKeyManager::with_retry_delay(
            prompt,
            self.config.key_retry_delay(),
        ));
        let catalog = builtin_catalog(self.config.buffer_pool.create(), keys.clone());
        let registry = self.config.registry(None, Arc::new(catalog))?;

        let host = HostController::new(&root);
        let host = Mount {
            model: host.model().clone(),
            controller: share(Box::new(host)),
        };
        info!(
            "File system manager over {:?} ({} archive suffixes)",
            root,
            registry.suffixes()
        );
        Ok(FsManager {
            registry: Arc::new(registry),
            host,
            mounts: Mutex::new(IndexMap::new()),
            false_positives: Mutex::new(HashSet::new()),
            keys,
            options: self.config.access.into(),
        })
    }
}

impl Default for FsManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
