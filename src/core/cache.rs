//! Content caching controller
//!
//! Stages entry content in write-back caches so that repeated reads and
//! writes of an entry do not go through the archive every time. Writes land
//! in a pooled buffer and reach the decorated controller only when the cache
//! is flushed by a sync.

use crate::core::buffer_pool::{IoBuffer, IoBufferPool};
use crate::core::controller::FsController;
use crate::core::entry::{Access, ArchiveEntry, Entry, EntryName, EntryType, FsEntry, Size};
use crate::core::error::{FsError, Result, SyncErrorBuilder, SyncIssue};
use crate::core::io::copy;
use crate::core::model::FsModel;
use crate::core::options::{AccessModes, AccessOptions, SyncOptions};
use crate::core::socket::{EntryWriter, InputSocket, OutputSocket};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, warn};

type CacheMap = Arc<Mutex<IndexMap<EntryName, Arc<EntryCache>>>>;

fn register(caches: &CacheMap, cache: &Arc<EntryCache>) {
    caches
        .lock()
        .entry(cache.name.clone())
        .or_insert_with(|| cache.clone());
}

/// Options a flush writes with: the cache itself is not involved any more
/// and the entry already exists.
fn flush_options(options: AccessOptions) -> AccessOptions {
    options - (AccessOptions::CACHE | AccessOptions::EXCLUSIVE | AccessOptions::APPEND)
}

#[derive(Default)]
struct CacheState {
    buffer: Option<IoBuffer>,
    dirty: bool,
    options: AccessOptions,
}

/// Write-back cache of one entry's content.
pub struct EntryCache {
    name: EntryName,
    pool: Arc<dyn IoBufferPool>,
    state: Mutex<CacheState>,
}

impl EntryCache {
    fn new(name: EntryName, pool: Arc<dyn IoBufferPool>) -> Self {
        EntryCache {
            name,
            pool,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn name(&self) -> &EntryName {
        &self.name
    }

    /// True if the cache holds content not yet written through.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    fn buffer(&self) -> Option<IoBuffer> {
        self.state.lock().buffer.clone()
    }

    /// Loads the entry's content from `inner` unless already cached.
    fn fill(&self, inner: &mut dyn FsController, options: AccessOptions) -> Result<IoBuffer> {
        if let Some(buffer) = self.buffer() {
            return Ok(buffer);
        }
        let buffer = self.pool.allocate()?;
        let loaded = copy(
            &mut *inner.input(flush_options(options), self.name.clone()),
            &mut *buffer.output(),
        );
        if let Err(e) = loaded {
            let _ = self.pool.release(buffer);
            return Err(e.into());
        }
        self.state.lock().buffer = Some(buffer.clone());
        debug!("Cached '{}'", self.name);
        Ok(buffer)
    }

    /// Installs freshly written content.
    fn commit(&self, buffer: IoBuffer, options: AccessOptions) {
        let stale = {
            let mut state = self.state.lock();
            state.dirty = true;
            state.options = flush_options(options);
            state.buffer.replace(buffer)
        };
        if let Some(stale) = stale {
            if let Err(e) = self.pool.release(stale) {
                warn!("Failed to release stale cache buffer of '{}': {}", self.name, e);
            }
        }
    }

    /// Writes dirty content through to `inner`.
    pub fn flush(&self, inner: &mut dyn FsController) -> Result<()> {
        let (buffer, options) = {
            let state = self.state.lock();
            match (&state.buffer, state.dirty) {
                (Some(buffer), true) => (buffer.clone(), state.options),
                _ => return Ok(()),
            }
        };
        copy(
            &mut *buffer.input(),
            &mut *inner.output(options, self.name.clone(), None),
        )?;
        self.state.lock().dirty = false;
        debug!("Flushed '{}'", self.name);
        Ok(())
    }

    /// Discards the cached content without writing it.
    pub fn clear(&self) -> Result<()> {
        let buffer = {
            let mut state = self.state.lock();
            state.dirty = false;
            state.buffer.take()
        };
        match buffer {
            Some(buffer) => self.pool.release(buffer),
            None => Ok(()),
        }
    }

    /// Metadata of the cached content.
    fn patch(&self, entry: &mut FsEntry) {
        let state = self.state.lock();
        if let (Some(buffer), true) = (&state.buffer, state.dirty) {
            entry.set_size(Size::Data, buffer.size(Size::Data));
            if let Some(time) = buffer.time(Access::Write) {
                entry.set_time(Access::Write, Some(time));
            }
        }
    }
}

/// Controller decorator staging entry content in [`EntryCache`]s.
pub struct CachingController<C> {
    inner: C,
    pool: Arc<dyn IoBufferPool>,
    caches: CacheMap,
}

impl<C: FsController> CachingController<C> {
    pub fn new(inner: C, pool: Arc<dyn IoBufferPool>) -> Self {
        CachingController {
            inner,
            pool,
            caches: Arc::new(Mutex::new(IndexMap::new())),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    /// Number of registered caches.
    pub fn cached(&self) -> usize {
        self.caches.lock().len()
    }

    fn registered(&self, name: &EntryName) -> Option<Arc<EntryCache>> {
        self.caches.lock().get(name).cloned()
    }

    fn cache_for(&self, name: &EntryName) -> Arc<EntryCache> {
        self.registered(name)
            .unwrap_or_else(|| Arc::new(EntryCache::new(name.clone(), self.pool.clone())))
    }

    fn evict(&self, name: &EntryName) {
        if let Some(cache) = self.caches.lock().shift_remove(name) {
            if let Err(e) = cache.clear() {
                warn!("Failed to clear cache of '{}': {}", name, e);
            }
        }
    }
}

impl<C: FsController> FsController for CachingController<C> {
    fn model(&self) -> &Arc<FsModel> {
        self.inner.model()
    }

    fn stat(&mut self, options: AccessOptions, name: &EntryName) -> Result<Option<FsEntry>> {
        let mut stat = self.inner.stat(options, name)?;
        if let (Some(entry), Some(cache)) = (stat.as_mut(), self.registered(name)) {
            cache.patch(entry);
        }
        Ok(stat)
    }

    fn check_access(
        &mut self,
        options: AccessOptions,
        name: &EntryName,
        modes: AccessModes,
    ) -> Result<()> {
        self.inner.check_access(options, name, modes)
    }

    fn set_read_only(&mut self, name: &EntryName) -> Result<()> {
        self.inner.set_read_only(name)
    }

    fn set_time(
        &mut self,
        options: AccessOptions,
        name: &EntryName,
        times: &[(Access, u64)],
    ) -> Result<bool> {
        self.inner.set_time(options, name, times)
    }

    fn input<'a>(
        &'a mut self,
        options: AccessOptions,
        name: EntryName,
    ) -> Box<dyn InputSocket<FsEntry> + 'a> {
        if self.registered(&name).is_none() && !options.contains(AccessOptions::CACHE) {
            return self.inner.input(options, name);
        }
        let cache = self.cache_for(&name);
        Box::new(CachedInput {
            controller: self,
            options,
            name,
            cache,
        })
    }

    fn output<'a>(
        &'a mut self,
        options: AccessOptions,
        name: EntryName,
        template: Option<FsEntry>,
    ) -> Box<dyn OutputSocket<FsEntry> + 'a> {
        let existing = self.registered(&name);
        let bypass = (existing.is_none() && !options.contains(AccessOptions::CACHE))
            || options.contains(AccessOptions::APPEND)
            || template.is_some();
        if bypass {
            return Box::new(BypassOutput {
                controller: self,
                options,
                name,
                template,
                evict: existing,
            });
        }
        let cache = self.cache_for(&name);
        Box::new(CachedOutput {
            controller: self,
            options,
            name,
            cache,
        })
    }

    fn mknod(
        &mut self,
        options: AccessOptions,
        name: &EntryName,
        entry_type: EntryType,
        template: Option<FsEntry>,
    ) -> Result<()> {
        self.inner.mknod(options, name, entry_type, template)?;
        if entry_type == EntryType::File {
            self.evict(name);
        }
        Ok(())
    }

    fn unlink(&mut self, options: AccessOptions, name: &EntryName) -> Result<()> {
        self.evict(name);
        self.inner.unlink(options, name)
    }

    fn sync(&mut self, options: SyncOptions) -> Result<()> {
        let mount_point = self.inner.mount_point().path().to_string();
        let mut builder = SyncErrorBuilder::new();
        let caches: Vec<Arc<EntryCache>> = self.caches.lock().values().cloned().collect();

        if !caches.is_empty() {
            let flush = !options.contains(SyncOptions::ABORT_CHANGES);
            let clear = !flush || options.contains(SyncOptions::CLEAR_CACHE);
            debug!(
                "Syncing {} caches of {} (flush = {}, clear = {})",
                caches.len(),
                mount_point,
                flush,
                clear
            );
            for cache in caches {
                let flushed = if flush {
                    cache.flush(&mut self.inner)
                } else {
                    Ok(())
                };
                if clear {
                    self.caches.lock().shift_remove(&cache.name);
                    if let Err(e) = cache.clear() {
                        builder.warn(SyncIssue::warning(mount_point.clone(), e));
                    }
                }
                if let Err(e) = flushed {
                    return Err(builder.fail(mount_point, e).into());
                }
            }
        }

        match self.inner.sync(options - SyncOptions::CLEAR_CACHE) {
            Ok(()) => {}
            Err(FsError::Sync(e)) => builder.merge(e),
            Err(e) => return Err(e),
        }
        builder.check()?;
        Ok(())
    }
}

struct CachedInput<'a, C> {
    controller: &'a mut CachingController<C>,
    options: AccessOptions,
    name: EntryName,
    cache: Arc<EntryCache>,
}

impl<'a, C: FsController> InputSocket<FsEntry> for CachedInput<'a, C> {
    fn target(&mut self) -> Result<FsEntry> {
        match self.controller.stat(self.options, &self.name)? {
            Some(entry) => Ok(entry),
            None => Err(FsError::NotFound(self.name.to_string())),
        }
    }

    fn stream(&mut self, _peer: Option<&dyn Entry>) -> Result<Box<dyn Read + Send>> {
        let buffer = self.cache.fill(&mut self.controller.inner, self.options)?;
        register(&self.controller.caches, &self.cache);
        buffer.input().stream(None)
    }
}

struct CachedOutput<'a, C> {
    controller: &'a mut CachingController<C>,
    options: AccessOptions,
    name: EntryName,
    cache: Arc<EntryCache>,
}

impl<'a, C: FsController> OutputSocket<FsEntry> for CachedOutput<'a, C> {
    fn target(&mut self) -> Result<FsEntry> {
        Ok(self
            .controller
            .stat(self.options, &self.name)?
            .unwrap_or_else(|| FsEntry::new(self.name.as_str(), EntryType::File)))
    }

    fn stream(&mut self, _peer: Option<&dyn Entry>) -> Result<Box<dyn EntryWriter>> {
        let controller = &mut *self.controller;
        controller
            .inner
            .mknod(self.options, &self.name, EntryType::File, None)?;
        let buffer = controller.pool.allocate()?;
        let writer = match buffer.output().stream(None) {
            Ok(writer) => writer,
            Err(e) => {
                let _ = controller.pool.release(buffer);
                return Err(e);
            }
        };
        Ok(Box::new(CacheWriter {
            inner: Some(writer),
            buffer: Some(buffer),
            cache: self.cache.clone(),
            caches: controller.caches.clone(),
            model: controller.inner.model().clone(),
            pool: controller.pool.clone(),
            options: self.options,
        }))
    }
}

/// Writes into a fresh buffer and swaps it into the cache on close.
struct CacheWriter {
    inner: Option<Box<dyn EntryWriter>>,
    buffer: Option<IoBuffer>,
    cache: Arc<EntryCache>,
    caches: CacheMap,
    model: Arc<FsModel>,
    pool: Arc<dyn IoBufferPool>,
    options: AccessOptions,
}

impl CacheWriter {
    fn writer(&mut self) -> io::Result<&mut Box<dyn EntryWriter>> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stream closed"))
    }
}

impl Write for CacheWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.writer()?.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl EntryWriter for CacheWriter {
    fn close(mut self: Box<Self>) -> Result<()> {
        let (Some(writer), Some(buffer)) = (self.inner.take(), self.buffer.take()) else {
            return Ok(());
        };
        if let Err(e) = writer.close() {
            let _ = self.pool.release(buffer);
            return Err(e);
        }
        self.cache.commit(buffer, self.options);
        register(&self.caches, &self.cache);
        self.model.set_touched(true);
        Ok(())
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.inner.take();
            let _ = self.pool.release(buffer);
        }
    }
}

/// Writes straight through, after evicting a stale cache.
struct BypassOutput<'a, C> {
    controller: &'a mut CachingController<C>,
    options: AccessOptions,
    name: EntryName,
    template: Option<FsEntry>,
    evict: Option<Arc<EntryCache>>,
}

impl<'a, C: FsController> OutputSocket<FsEntry> for BypassOutput<'a, C> {
    fn target(&mut self) -> Result<FsEntry> {
        self.controller
            .inner
            .output(self.options, self.name.clone(), self.template.clone())
            .target()
    }

    fn stream(&mut self, peer: Option<&dyn Entry>) -> Result<Box<dyn EntryWriter>> {
        if let Some(cache) = self.evict.take() {
            cache.flush(&mut self.controller.inner)?;
            self.controller.evict(&self.name);
        }
        self.controller
            .inner
            .output(self.options, self.name.clone(), self.template.clone())
            .stream(peer)
    }
}
