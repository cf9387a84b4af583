//! Sockets: stream factories bound to one target entry
//!
//! A socket resolves its target lazily and can open any number of streams
//! over its lifetime, one at a time. `peer` is the entry on the other side
//! of a copy, if any, so drivers can reuse metadata or raw content.

use crate::core::entry::Entry;
use crate::core::error::Result;
use std::io::{Read, Write};

/// Byte sink that must be closed explicitly to commit its content.
///
/// Dropping a writer without closing it discards what was written where the
/// backing store allows that and logs a warning otherwise.
pub trait EntryWriter: Write + Send {
    /// Commits the written bytes.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Source of read streams for one entry.
pub trait InputSocket<E> {
    /// Resolves the target entry.
    fn target(&mut self) -> Result<E>;

    /// Opens a stream over the target's content.
    fn stream(&mut self, peer: Option<&dyn Entry>) -> Result<Box<dyn Read + Send>>;
}

/// Sink of write streams for one entry.
pub trait OutputSocket<E> {
    /// Resolves the target entry.
    fn target(&mut self) -> Result<E>;

    /// Opens a stream replacing (or appending to) the target's content.
    fn stream(&mut self, peer: Option<&dyn Entry>) -> Result<Box<dyn EntryWriter>>;
}

/// Reads a socket's whole content.
pub fn read_all<E>(socket: &mut dyn InputSocket<E>) -> Result<Vec<u8>> {
    let mut stream = socket.stream(None)?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Writes `data` through a socket and closes the stream.
pub fn write_all<E>(socket: &mut dyn OutputSocket<E>, data: &[u8]) -> Result<()> {
    let mut stream = socket.stream(None)?;
    stream.write_all(data)?;
    stream.close()
}

/// Writer over an in-memory vector that hands the bytes to a callback on
/// close. Drivers and tests use it for entries staged in memory.
pub struct VecWriter<F>
where
    F: FnOnce(Vec<u8>) -> Result<()> + Send,
{
    buf: Vec<u8>,
    commit: Option<F>,
}

impl<F> VecWriter<F>
where
    F: FnOnce(Vec<u8>) -> Result<()> + Send,
{
    pub fn new(commit: F) -> Self {
        VecWriter {
            buf: Vec::new(),
            commit: Some(commit),
        }
    }

    /// Starts from existing content, for appends.
    pub fn with_content(buf: Vec<u8>, commit: F) -> Self {
        VecWriter {
            buf,
            commit: Some(commit),
        }
    }
}

impl<F> Write for VecWriter<F>
where
    F: FnOnce(Vec<u8>) -> Result<()> + Send,
{
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<F> EntryWriter for VecWriter<F>
where
    F: FnOnce(Vec<u8>) -> Result<()> + Send,
{
    fn close(mut self: Box<Self>) -> Result<()> {
        match self.commit.take() {
            Some(commit) => commit(std::mem::take(&mut self.buf)),
            None => Ok(()),
        }
    }
}
