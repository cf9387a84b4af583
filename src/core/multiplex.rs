//! Multiplexing output container
//!
//! Streaming archive writers accept one open entry stream at a time. This
//! decorator lets callers keep several entries open for writing at once:
//! the first stream goes straight to the decorated container and occupies
//! its single slot, every stream opened while the slot is taken is staged
//! in an [`IoBuffer`]. Whenever the slot frees up, closed buffers are copied
//! into the container in the order they were opened.

use crate::core::buffer_pool::{IoBuffer, IoBufferPool};
use crate::core::container::{Container, OutputContainer};
use crate::core::entry::{Access, ArchiveEntry, Entry, Size};
use crate::core::error::{FsError, Result};
use crate::core::io::{copy, CopyError};
use crate::core::socket::{EntryWriter, OutputSocket};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{debug, warn};

struct Pending<E> {
    entry: E,
    buffer: IoBuffer,
    closed: bool,
}

struct MuxState<E> {
    container: Box<dyn OutputContainer<E>>,
    pool: Arc<dyn IoBufferPool>,
    /// A direct stream into `container` is open, or a drain is copying.
    busy: bool,
    buffers: IndexMap<String, Pending<E>>,
}

impl<E: ArchiveEntry> MuxState<E> {
    /// Copies closed buffers into the container while the slot is free.
    ///
    /// Input-side failures are logged and the drain goes on; the first one
    /// is returned once the drain is done. An output-side failure stops the
    /// drain immediately.
    fn drain(&mut self) -> Result<()> {
        let mut deferred: Option<FsError> = None;
        let names: Vec<String> = self.buffers.keys().cloned().collect();
        for name in names {
            if self.busy {
                break;
            }
            if !self.buffers.get(&name).map_or(false, |p| p.closed) {
                continue;
            }
            let Some(pending) = self.buffers.shift_remove(&name) else {
                continue;
            };

            self.busy = true;
            let result = copy(
                &mut *pending.buffer.input(),
                &mut *self.container.output(pending.entry),
            );
            self.busy = false;

            if let Err(e) = self.pool.release(pending.buffer) {
                warn!("Failed to release buffer for '{}': {}", name, e);
            }
            match result {
                Ok(bytes) => debug!("Drained '{}' ({} bytes)", name, bytes),
                Err(CopyError::Input(e)) => {
                    warn!("Skipping buffered entry '{}': {}", name, e);
                    deferred.get_or_insert(e);
                }
                Err(CopyError::Output(e)) => return Err(e),
            }
        }
        match deferred {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Output container that accepts concurrent entry streams over a container
/// that can only take one at a time.
pub struct MultiplexingOutputContainer<E> {
    state: Arc<Mutex<MuxState<E>>>,
}

impl<E: ArchiveEntry> MultiplexingOutputContainer<E> {
    pub fn new(container: Box<dyn OutputContainer<E>>, pool: Arc<dyn IoBufferPool>) -> Self {
        MultiplexingOutputContainer {
            state: Arc::new(Mutex::new(MuxState {
                container,
                pool,
                busy: false,
                buffers: IndexMap::new(),
            })),
        }
    }

    /// Number of entries staged in buffers.
    pub fn pending(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }
}

impl<E: ArchiveEntry> Container<E> for MultiplexingOutputContainer<E> {
    fn len(&self) -> usize {
        self.entries().len()
    }

    fn entries(&self) -> Vec<E> {
        let state = self.state.lock();
        let mut entries = state.container.entries();
        for (name, pending) in &state.buffers {
            if state.container.entry(name).is_none() {
                entries.push(pending.entry.clone());
            }
        }
        entries
    }

    fn entry(&self, name: &str) -> Option<E> {
        let state = self.state.lock();
        match state.buffers.get(name) {
            Some(pending) => Some(pending.entry.clone()),
            None => state.container.entry(name),
        }
    }
}

impl<E: ArchiveEntry> OutputContainer<E> for MultiplexingOutputContainer<E> {
    fn output(&self, entry: E) -> Box<dyn OutputSocket<E>> {
        Box::new(MuxOutput {
            state: self.state.clone(),
            entry,
        })
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.busy {
            return Err(FsError::Busy("an entry is still being written".into()));
        }
        if let Some((name, _)) = state.buffers.iter().find(|(_, p)| !p.closed) {
            return Err(FsError::Busy(format!("entry '{}' is still being written", name)));
        }
        state.drain()?;
        assert!(
            state.buffers.is_empty(),
            "multiplexing container closed with pending buffers"
        );
        state.container.close()
    }
}

struct MuxOutput<E> {
    state: Arc<Mutex<MuxState<E>>>,
    entry: E,
}

impl<E: ArchiveEntry> OutputSocket<E> for MuxOutput<E> {
    fn target(&mut self) -> Result<E> {
        Ok(self.entry.clone())
    }

    fn stream(&mut self, peer: Option<&dyn Entry>) -> Result<Box<dyn EntryWriter>> {
        let mut state = self.state.lock();
        let name = self.entry.name().to_string();

        if !state.busy {
            let writer = state.container.output(self.entry.clone()).stream(peer)?;
            state.busy = true;
            debug!("Writing '{}' directly", name);
            return Ok(Box::new(DirectWriter {
                state: self.state.clone(),
                inner: Some(writer),
            }));
        }

        let buffer = state.pool.allocate()?;
        let writer = match buffer.output().stream(None) {
            Ok(writer) => writer,
            Err(e) => {
                let _ = state.pool.release(buffer);
                return Err(e);
            }
        };
        let pending = Pending {
            entry: self.entry.clone(),
            buffer: buffer.clone(),
            closed: false,
        };
        if let Some(stale) = state.buffers.insert(name.clone(), pending) {
            debug!("Discarding stale buffer for '{}'", name);
            if let Err(e) = state.pool.release(stale.buffer) {
                warn!("Failed to release stale buffer for '{}': {}", name, e);
            }
        }
        debug!("Buffering '{}' ({} pending)", name, state.buffers.len());
        Ok(Box::new(BufferedWriter {
            state: self.state.clone(),
            name,
            buffer,
            inner: Some(writer),
        }))
    }
}

struct DirectWriter<E: ArchiveEntry> {
    state: Arc<Mutex<MuxState<E>>>,
    inner: Option<Box<dyn EntryWriter>>,
}

impl<E: ArchiveEntry> DirectWriter<E> {
    fn writer(&mut self) -> io::Result<&mut Box<dyn EntryWriter>> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stream closed"))
    }
}

impl<E: ArchiveEntry> Write for DirectWriter<E> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.writer()?.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl<E: ArchiveEntry> EntryWriter for DirectWriter<E> {
    fn close(mut self: Box<Self>) -> Result<()> {
        let closed = match self.inner.take() {
            Some(writer) => writer.close(),
            None => Ok(()),
        };
        let mut state = self.state.lock();
        state.busy = false;
        let drained = state.drain();
        closed.and(drained)
    }
}

impl<E: ArchiveEntry> Drop for DirectWriter<E> {
    fn drop(&mut self) {
        if self.inner.take().is_some() {
            warn!("Direct entry stream dropped without close, content discarded");
            let mut state = self.state.lock();
            state.busy = false;
            if let Err(e) = state.drain() {
                warn!("Drain after dropped stream failed: {}", e);
            }
        }
    }
}

struct BufferedWriter<E> {
    state: Arc<Mutex<MuxState<E>>>,
    name: String,
    buffer: IoBuffer,
    inner: Option<Box<dyn EntryWriter>>,
}

impl<E> BufferedWriter<E> {
    fn writer(&mut self) -> io::Result<&mut Box<dyn EntryWriter>> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stream closed"))
    }

    fn owns(&self, pending: &Pending<E>) -> bool {
        pending.buffer.name() == self.buffer.name()
    }
}

impl<E: ArchiveEntry> Write for BufferedWriter<E> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.writer()?.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl<E: ArchiveEntry> EntryWriter for BufferedWriter<E> {
    fn close(mut self: Box<Self>) -> Result<()> {
        let Some(writer) = self.inner.take() else {
            return Ok(());
        };
        writer.close()?;

        let mut state = self.state.lock();
        let buffer = self.buffer.clone();
        match state.buffers.get_mut(&self.name) {
            Some(pending) if self.owns(pending) => {
                for access in Access::ALL {
                    if pending.entry.time(access).is_none() {
                        pending.entry.set_time(access, buffer.time(access));
                    }
                }
                if pending.entry.size(Size::Data).is_none() {
                    pending.entry.set_size(Size::Data, buffer.size(Size::Data));
                }
                pending.closed = true;
            }
            // Replaced by a newer stream for the same entry.
            _ => return Ok(()),
        }
        state.drain()
    }
}

impl<E> Drop for BufferedWriter<E> {
    fn drop(&mut self) {
        if self.inner.take().is_none() {
            return;
        }
        warn!("Buffered stream for '{}' dropped without close", self.name);
        let mut state = self.state.lock();
        let owned = state
            .buffers
            .get(&self.name)
            .map_or(false, |pending| pending.buffer.name() == self.buffer.name());
        if owned {
            if let Some(pending) = state.buffers.shift_remove(&self.name) {
                let _ = state.pool.release(pending.buffer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer_pool::MemoryPool;
    use crate::core::container::MemoryContainer;
    use crate::core::entry::{EntryType, FsEntry};
    use crate::core::socket::write_all;

    fn setup() -> (MemoryContainer, Arc<MemoryPool>, MultiplexingOutputContainer<FsEntry>) {
        let sink = MemoryContainer::new();
        let pool = Arc::new(MemoryPool::new());
        let mux = MultiplexingOutputContainer::new(Box::new(sink.clone()), pool.clone());
        (sink, pool, mux)
    }

    fn file(name: &str) -> FsEntry {
        FsEntry::new(name, EntryType::File)
    }

    #[test]
    fn test_single_stream_goes_direct() {
        let (sink, pool, mux) = setup();
        write_all(&mut *mux.output(file("a")), b"aaa").unwrap();

        assert_eq!(sink.content("a").unwrap(), b"aaa");
        assert_eq!(pool.stats().allocated(), 0);
        assert!(!mux.is_busy());
    }

    #[test]
    fn test_buffered_entry_visible_before_drain() {
        let (sink, _pool, mux) = setup();
        let direct = mux.output(file("a")).stream(None).unwrap();
        let mut buffered = mux.output(file("b")).stream(None).unwrap();
        buffered.write_all(b"bb").unwrap();
        buffered.close().unwrap();

        assert!(sink.content("b").is_none());
        let b = mux.entry("b").unwrap();
        assert_eq!(b.size(Size::Data), Some(2));
        assert!(b.time(Access::Write).is_some());
        assert_eq!(mux.len(), 1);

        direct.close().unwrap();
        assert_eq!(sink.content("b").unwrap(), b"bb");
        assert_eq!(mux.pending(), 0);
    }

    #[test]
    fn test_reopening_pending_entry_discards_stale_buffer() {
        let (sink, pool, mux) = setup();
        let direct = mux.output(file("a")).stream(None).unwrap();
        write_all(&mut *mux.output(file("b")), b"old").unwrap();
        write_all(&mut *mux.output(file("b")), b"new").unwrap();
        assert_eq!(pool.stats().live(), 1);

        direct.close().unwrap();
        assert_eq!(sink.content("b").unwrap(), b"new");
        assert_eq!(pool.stats().live(), 0);
    }

    #[test]
    fn test_dropped_buffered_stream_is_forgotten() {
        let (sink, pool, mut mux) = setup();
        let direct = mux.output(file("a")).stream(None).unwrap();
        drop(mux.output(file("b")).stream(None).unwrap());
        direct.close().unwrap();

        OutputContainer::close(&mut mux).unwrap();
        assert_eq!(sink.names(), vec!["a"]);
        assert_eq!(pool.stats().live(), 0);
    }

    /// Memory pool that keeps a handle to every buffer it hands out.
    #[derive(Default)]
    struct KeepingPool {
        inner: MemoryPool,
        handed_out: Mutex<Vec<IoBuffer>>,
    }

    impl IoBufferPool for KeepingPool {
        fn allocate(&self) -> Result<IoBuffer> {
            let buffer = self.inner.allocate()?;
            self.handed_out.lock().push(buffer.clone());
            Ok(buffer)
        }

        fn release(&self, buffer: IoBuffer) -> Result<()> {
            self.inner.release(buffer)
        }
    }

    #[test]
    fn test_drain_continues_past_unreadable_buffer() {
        let sink = MemoryContainer::new();
        let pool = Arc::new(KeepingPool::default());
        let mut mux = MultiplexingOutputContainer::new(Box::new(sink.clone()), pool.clone());

        let direct = mux.output(file("a")).stream(None).unwrap();
        write_all(&mut *mux.output(file("b")), b"bb").unwrap();
        write_all(&mut *mux.output(file("c")), b"cc").unwrap();
        let lost = pool.handed_out.lock()[0].clone();
        pool.inner.release(lost).unwrap();

        let err = direct.close().unwrap_err();
        assert!(matches!(err, FsError::Released(_)));
        assert!(sink.content("b").is_none());
        assert_eq!(sink.content("c").unwrap(), b"cc");
        assert_eq!(mux.pending(), 0);

        OutputContainer::close(&mut mux).unwrap();
        assert_eq!(sink.names(), vec!["a", "c"]);
    }

    #[test]
    fn test_close_with_open_buffered_stream_fails() {
        let (sink, _pool, mut mux) = setup();
        let direct = mux.output(file("a")).stream(None).unwrap();
        let buffered = mux.output(file("b")).stream(None).unwrap();
        direct.close().unwrap();

        assert!(matches!(OutputContainer::close(&mut mux), Err(FsError::Busy(_))));
        assert!(!sink.is_closed());
        buffered.close().unwrap();
        OutputContainer::close(&mut mux).unwrap();
        assert!(sink.is_closed());
    }
}
