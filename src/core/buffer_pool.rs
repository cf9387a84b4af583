//! I/O buffer pools
//!
//! An [`IoBuffer`] is transient storage for one entry's content, used to
//! stage writes that cannot go to their final container yet. Buffers come
//! from an [`IoBufferPool`] and go back to it exactly once.
//!
//! Two pools are provided:
//! - [`MemoryPool`] keeps content in memory
//! - [`TempFilePool`] spills content to anonymous temp files

use crate::core::entry::{now_millis, Access, Entry, EntryType, Size};
use crate::core::error::{FsError, Result};
use crate::core::socket::{EntryWriter, InputSocket, OutputSocket};
use parking_lot::Mutex;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::debug;

/// Allocates and releases transient buffers.
pub trait IoBufferPool: Send + Sync {
    fn allocate(&self) -> Result<IoBuffer>;

    /// Releases the buffer's storage. A second release fails.
    fn release(&self, buffer: IoBuffer) -> Result<()>;
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

enum Storage {
    Memory(Vec<u8>),
    File(NamedTempFile),
    Released,
}

struct BufferInner {
    name: String,
    storage: Mutex<Storage>,
    times: Mutex<[Option<u64>; 3]>,
    released: AtomicBool,
}

/// Handle to a pooled buffer. Clones refer to the same storage.
#[derive(Clone)]
pub struct IoBuffer {
    inner: Arc<BufferInner>,
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("name", &self.inner.name)
            .field("released", &self.is_released())
            .finish()
    }
}

impl IoBuffer {
    fn new(storage: Storage) -> Self {
        let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
        let now = Some(now_millis());
        IoBuffer {
            inner: Arc::new(BufferInner {
                name: format!("buffer-{}", id),
                storage: Mutex::new(storage),
                times: Mutex::new([now, None, None]),
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn memory() -> Self {
        IoBuffer::new(Storage::Memory(Vec::new()))
    }

    pub fn temp_file(dir: Option<&PathBuf>) -> Result<Self> {
        let file = match dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        Ok(IoBuffer::new(Storage::File(file)))
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Socket reading the buffer's content.
    pub fn input(&self) -> Box<dyn InputSocket<IoBuffer>> {
        Box::new(BufferInput {
            buffer: self.clone(),
        })
    }

    /// Socket replacing the buffer's content.
    pub fn output(&self) -> Box<dyn OutputSocket<IoBuffer>> {
        Box::new(BufferOutput {
            buffer: self.clone(),
        })
    }

    /// Drops the storage. Fails if already released.
    fn release_storage(&self) -> Result<()> {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return Err(FsError::Released(self.inner.name.clone()));
        }
        *self.inner.storage.lock() = Storage::Released;
        debug!("Released {}", self.inner.name);
        Ok(())
    }

    fn check_live(&self) -> Result<()> {
        if self.is_released() {
            return Err(FsError::Released(self.inner.name.clone()));
        }
        Ok(())
    }

    fn touch(&self, access: Access) {
        self.inner.times.lock()[access as usize] = Some(now_millis());
    }
}

impl Entry for IoBuffer {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn entry_type(&self) -> EntryType {
        EntryType::File
    }

    fn size(&self, _kind: Size) -> Option<u64> {
        match &*self.inner.storage.lock() {
            Storage::Memory(data) => Some(data.len() as u64),
            Storage::File(file) => file.as_file().metadata().ok().map(|m| m.len()),
            Storage::Released => None,
        }
    }

    fn time(&self, access: Access) -> Option<u64> {
        self.inner.times.lock()[access as usize]
    }
}

struct BufferInput {
    buffer: IoBuffer,
}

impl InputSocket<IoBuffer> for BufferInput {
    fn target(&mut self) -> Result<IoBuffer> {
        Ok(self.buffer.clone())
    }

    fn stream(&mut self, _peer: Option<&dyn Entry>) -> Result<Box<dyn Read + Send>> {
        self.buffer.check_live()?;
        let stream: Box<dyn Read + Send> = match &*self.buffer.inner.storage.lock() {
            Storage::Memory(data) => Box::new(Cursor::new(data.clone())),
            Storage::File(file) => {
                let mut reader = file.reopen()?;
                reader.seek(SeekFrom::Start(0))?;
                Box::new(reader)
            }
            Storage::Released => return Err(FsError::Released(self.buffer.inner.name.clone())),
        };
        self.buffer.touch(Access::Read);
        Ok(stream)
    }
}

struct BufferOutput {
    buffer: IoBuffer,
}

impl OutputSocket<IoBuffer> for BufferOutput {
    fn target(&mut self) -> Result<IoBuffer> {
        Ok(self.buffer.clone())
    }

    fn stream(&mut self, _peer: Option<&dyn Entry>) -> Result<Box<dyn EntryWriter>> {
        self.buffer.check_live()?;
        let sink = match &*self.buffer.inner.storage.lock() {
            Storage::Memory(_) => Sink::Memory(Vec::new()),
            Storage::File(file) => {
                let writer = file.reopen()?;
                writer.set_len(0)?;
                Sink::File(writer)
            }
            Storage::Released => return Err(FsError::Released(self.buffer.inner.name.clone())),
        };
        Ok(Box::new(BufferWriter {
            buffer: self.buffer.clone(),
            sink,
        }))
    }
}

enum Sink {
    Memory(Vec<u8>),
    File(std::fs::File),
}

struct BufferWriter {
    buffer: IoBuffer,
    sink: Sink,
}

impl Write for BufferWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match &mut self.sink {
            Sink::Memory(buf) => {
                buf.extend_from_slice(data);
                Ok(data.len())
            }
            Sink::File(file) => file.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            Sink::Memory(_) => Ok(()),
            Sink::File(file) => file.flush(),
        }
    }
}

impl EntryWriter for BufferWriter {
    fn close(mut self: Box<Self>) -> Result<()> {
        self.buffer.check_live()?;
        match std::mem::replace(&mut self.sink, Sink::Memory(Vec::new())) {
            Sink::Memory(data) => {
                if let Storage::Memory(content) = &mut *self.buffer.inner.storage.lock() {
                    *content = data;
                }
            }
            Sink::File(mut file) => file.flush()?,
        }
        self.buffer.touch(Access::Write);
        Ok(())
    }
}

/// Allocation counters shared by the provided pools.
#[derive(Debug, Default)]
pub struct PoolStats {
    allocated: AtomicUsize,
    released: AtomicUsize,
}

impl PoolStats {
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    /// Buffers currently out of the pool.
    pub fn live(&self) -> usize {
        self.allocated().saturating_sub(self.released())
    }
}

/// Pool of in-memory buffers.
#[derive(Debug, Default)]
pub struct MemoryPool {
    stats: PoolStats,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

impl IoBufferPool for MemoryPool {
    fn allocate(&self) -> Result<IoBuffer> {
        self.stats.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(IoBuffer::memory())
    }

    fn release(&self, buffer: IoBuffer) -> Result<()> {
        buffer.release_storage()?;
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Pool of temp-file backed buffers, for content too large for memory.
#[derive(Debug, Default)]
pub struct TempFilePool {
    dir: Option<PathBuf>,
    stats: PoolStats,
}

impl TempFilePool {
    /// Creates buffers in the system temp directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates buffers in `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        TempFilePool {
            dir: Some(dir.into()),
            stats: PoolStats::default(),
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

impl IoBufferPool for TempFilePool {
    fn allocate(&self) -> Result<IoBuffer> {
        let buffer = IoBuffer::temp_file(self.dir.as_ref())?;
        self.stats.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(buffer)
    }

    fn release(&self, buffer: IoBuffer) -> Result<()> {
        buffer.release_storage()?;
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::socket::{read_all, write_all};

    fn roundtrip(pool: &dyn IoBufferPool) {
        let buffer = pool.allocate().unwrap();
        write_all(&mut *buffer.output(), b"first").unwrap();
        write_all(&mut *buffer.output(), b"second").unwrap();

        assert_eq!(read_all(&mut *buffer.input()).unwrap(), b"second");
        assert_eq!(buffer.size(Size::Data), Some(6));
        assert!(buffer.time(Access::Write).is_some());
        pool.release(buffer).unwrap();
    }

    #[test]
    fn test_memory_buffer_roundtrip() {
        let pool = MemoryPool::new();
        roundtrip(&pool);
        assert_eq!(pool.stats().live(), 0);
    }

    #[test]
    fn test_temp_file_buffer_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pool = TempFilePool::in_dir(dir.path());
        roundtrip(&pool);
        assert_eq!(pool.stats().allocated(), 1);
        assert_eq!(pool.stats().released(), 1);
    }

    #[test]
    fn test_double_release_fails() {
        let pool = MemoryPool::new();
        let buffer = pool.allocate().unwrap();
        let alias = buffer.clone();
        pool.release(buffer).unwrap();

        assert!(matches!(pool.release(alias.clone()), Err(FsError::Released(_))));
        assert!(alias.input().stream(None).is_err());
        assert_eq!(pool.stats().released(), 1);
    }

    #[test]
    fn test_unclosed_writer_leaves_content() {
        let pool = MemoryPool::new();
        let buffer = pool.allocate().unwrap();
        write_all(&mut *buffer.output(), b"kept").unwrap();
        {
            let mut writer = buffer.output().stream(None).unwrap();
            writer.write_all(b"dropped").unwrap();
        }
        assert_eq!(read_all(&mut *buffer.input()).unwrap(), b"kept");
    }
}
