//! Input and output archives of one mount cycle
//!
//! Both wrappers own a driver container and a `closed` flag shared with
//! every stream they hand out. Once the archive is closed by a sync, the
//! streams still held by callers fail with [`ArchiveClosed`], which surfaces
//! as a needs-sync signal.

use crate::core::buffer_pool::IoBufferPool;
use crate::core::container::{Container, InputContainer, OutputContainer};
use crate::core::entry::{ArchiveEntry, Entry};
use crate::core::error::{ArchiveClosed, FsError, Result};
use crate::core::multiplex::MultiplexingOutputContainer;
use crate::core::socket::{EntryWriter, InputSocket, OutputSocket};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

pub struct InputArchive<E> {
    container: Box<dyn InputContainer<E>>,
    closed: Arc<AtomicBool>,
    /// One clone per open stream.
    streams: Arc<()>,
}

impl<E: ArchiveEntry> InputArchive<E> {
    pub fn new(container: Box<dyn InputContainer<E>>) -> Self {
        InputArchive {
            container,
            closed: Arc::new(AtomicBool::new(false)),
            streams: Arc::new(()),
        }
    }

    pub fn container(&self) -> &dyn InputContainer<E> {
        &*self.container
    }

    pub fn entry(&self, name: &str) -> Option<E> {
        self.container.entry(name)
    }

    pub fn open_streams(&self) -> usize {
        Arc::strong_count(&self.streams) - 1
    }

    /// Socket whose streams fail once this archive is closed.
    pub fn input(&self, name: &str) -> Box<dyn InputSocket<E>> {
        Box::new(GuardedInput {
            inner: self.container.input(name),
            closed: self.closed.clone(),
            streams: self.streams.clone(),
            name: name.to_string(),
        })
    }

    pub fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.container.close()
    }
}

struct GuardedInput<E> {
    inner: Box<dyn InputSocket<E>>,
    closed: Arc<AtomicBool>,
    streams: Arc<()>,
    name: String,
}

impl<E> InputSocket<E> for GuardedInput<E> {
    fn target(&mut self) -> Result<E> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FsError::needs_sync(self.name.clone()));
        }
        self.inner.target()
    }

    fn stream(&mut self, peer: Option<&dyn Entry>) -> Result<Box<dyn Read + Send>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FsError::needs_sync(self.name.clone()));
        }
        Ok(Box::new(GuardedReader {
            inner: self.inner.stream(peer)?,
            closed: self.closed.clone(),
            _stream: self.streams.clone(),
            name: self.name.clone(),
        }))
    }
}

struct GuardedReader {
    inner: Box<dyn Read + Send>,
    closed: Arc<AtomicBool>,
    _stream: Arc<()>,
    name: String,
}

impl Read for GuardedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ArchiveClosed(self.name.clone()).into_io());
        }
        self.inner.read(buf)
    }
}

type WriterSlot = Arc<Mutex<Option<Box<dyn EntryWriter>>>>;
type WriterRegistry = Arc<Mutex<Vec<Weak<Mutex<Option<Box<dyn EntryWriter>>>>>>>;

pub struct OutputArchive<E> {
    container: MultiplexingOutputContainer<E>,
    closed: Arc<AtomicBool>,
    writers: WriterRegistry,
}

impl<E: ArchiveEntry> OutputArchive<E> {
    /// Wraps a driver container so that several entries can be written at
    /// once.
    pub fn new(container: Box<dyn OutputContainer<E>>, pool: Arc<dyn IoBufferPool>) -> Self {
        OutputArchive {
            container: MultiplexingOutputContainer::new(container, pool),
            closed: Arc::new(AtomicBool::new(false)),
            writers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn entry(&self, name: &str) -> Option<E> {
        self.container.entry(name)
    }

    pub fn entries(&self) -> Vec<E> {
        self.container.entries()
    }

    /// Streams handed out and not yet closed or dropped.
    pub fn open_streams(&self) -> usize {
        let mut writers = self.writers.lock();
        writers.retain(|slot| slot.upgrade().map_or(false, |slot| slot.lock().is_some()));
        writers.len()
    }

    /// Socket whose streams fail once this archive is closed.
    pub fn output(&self, entry: E) -> Box<dyn OutputSocket<E>> {
        let name = entry.name().to_string();
        Box::new(GuardedOutput {
            inner: self.container.output(entry),
            closed: self.closed.clone(),
            writers: self.writers.clone(),
            name,
        })
    }

    /// Discards the content of every stream still open.
    pub fn force_close_streams(&self) -> usize {
        let slots: Vec<WriterSlot> = self
            .writers
            .lock()
            .drain(..)
            .filter_map(|slot| slot.upgrade())
            .collect();
        let mut discarded = 0;
        for slot in slots {
            if slot.lock().take().is_some() {
                discarded += 1;
            }
        }
        if discarded > 0 {
            debug!("Discarded {} open entry streams", discarded);
        }
        discarded
    }

    /// Writes the archive to its parent entry.
    pub fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.container.close()
    }

    /// Drops the archive without committing it. The parent keeps its
    /// previous content.
    pub fn discard(self) {
        self.closed.store(true, Ordering::Release);
        self.force_close_streams();
    }
}

struct GuardedOutput<E> {
    inner: Box<dyn OutputSocket<E>>,
    closed: Arc<AtomicBool>,
    writers: WriterRegistry,
    name: String,
}

impl<E> OutputSocket<E> for GuardedOutput<E> {
    fn target(&mut self) -> Result<E> {
        self.inner.target()
    }

    fn stream(&mut self, peer: Option<&dyn Entry>) -> Result<Box<dyn EntryWriter>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FsError::needs_sync(self.name.clone()));
        }
        let slot: WriterSlot = Arc::new(Mutex::new(Some(self.inner.stream(peer)?)));
        self.writers.lock().push(Arc::downgrade(&slot));
        Ok(Box::new(GuardedWriter {
            slot,
            closed: self.closed.clone(),
            name: self.name.clone(),
        }))
    }
}

struct GuardedWriter {
    slot: WriterSlot,
    closed: Arc<AtomicBool>,
    name: String,
}

impl GuardedWriter {
    fn closed_error(&self) -> io::Error {
        ArchiveClosed(self.name.clone()).into_io()
    }
}

impl Write for GuardedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        match self.slot.lock().as_mut() {
            Some(writer) => writer.write(data),
            None => Err(self.closed_error()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.slot.lock().as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl EntryWriter for GuardedWriter {
    fn close(self: Box<Self>) -> Result<()> {
        let writer = self.slot.lock().take();
        match writer {
            Some(writer) if !self.closed.load(Ordering::Acquire) => writer.close(),
            _ => Err(FsError::needs_sync(self.name.clone())),
        }
    }
}
