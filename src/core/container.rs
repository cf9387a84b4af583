//! Containers: collections of entries with socket factories
//!
//! Drivers produce [`InputContainer`]s to read an archive's entries and
//! [`OutputContainer`]s to write a new archive. Sockets handed out by a
//! container own whatever shared state they need, so they outlive the
//! borrow that created them.

use crate::core::entry::{now_millis, Access, ArchiveEntry, Entry, FsEntry, Size};
use crate::core::error::{FsError, Result};
use crate::core::socket::{EntryWriter, InputSocket, OutputSocket};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

/// A collection of entries with lookup by name.
pub trait Container<E> {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries, in container order.
    fn entries(&self) -> Vec<E>;

    fn entry(&self, name: &str) -> Option<E>;
}

/// Read side of an archive.
pub trait InputContainer<E>: Container<E> + Send {
    fn input(&self, name: &str) -> Box<dyn InputSocket<E>>;

    /// Releases the underlying resources. Open streams start failing.
    fn close(&mut self) -> Result<()>;
}

/// Write side of an archive.
pub trait OutputContainer<E>: Container<E> + Send {
    fn output(&self, entry: E) -> Box<dyn OutputSocket<E>>;

    /// Commits the archive to its parent entry.
    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: IndexMap<String, (FsEntry, Vec<u8>)>,
    writing: bool,
    closed: bool,
}

/// In-memory container that, like a streaming archive writer, accepts only
/// one open output stream at a time.
///
/// Clones share the same entries, which makes it handy as a staging area and
/// as an observable sink in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryContainer {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry with content directly.
    pub fn insert(&self, mut entry: FsEntry, data: Vec<u8>) {
        entry.set_size(Size::Data, Some(data.len() as u64));
        let mut state = self.state.lock();
        state.entries.insert(entry.name().to_string(), (entry, data));
    }

    /// Content of a committed entry.
    pub fn content(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().entries.get(name).map(|(_, data)| data.clone())
    }

    /// Committed entry names, in commit order.
    pub fn names(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    pub fn is_writing(&self) -> bool {
        self.state.lock().writing
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Container<FsEntry> for MemoryContainer {
    fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn entries(&self) -> Vec<FsEntry> {
        self.state
            .lock()
            .entries
            .values()
            .map(|(entry, _)| entry.clone())
            .collect()
    }

    fn entry(&self, name: &str) -> Option<FsEntry> {
        self.state.lock().entries.get(name).map(|(entry, _)| entry.clone())
    }
}

impl InputContainer<FsEntry> for MemoryContainer {
    fn input(&self, name: &str) -> Box<dyn InputSocket<FsEntry>> {
        Box::new(MemoryInput {
            state: self.state.clone(),
            name: name.to_string(),
        })
    }

    fn close(&mut self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

impl OutputContainer<FsEntry> for MemoryContainer {
    fn output(&self, entry: FsEntry) -> Box<dyn OutputSocket<FsEntry>> {
        Box::new(MemoryOutput {
            state: self.state.clone(),
            entry,
        })
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.writing {
            return Err(FsError::Busy("memory container has an open stream".into()));
        }
        state.closed = true;
        Ok(())
    }
}

struct MemoryInput {
    state: Arc<Mutex<MemoryState>>,
    name: String,
}

impl InputSocket<FsEntry> for MemoryInput {
    fn target(&mut self) -> Result<FsEntry> {
        self.state
            .lock()
            .entries
            .get(&self.name)
            .map(|(entry, _)| entry.clone())
            .ok_or_else(|| FsError::NotFound(self.name.clone()))
    }

    fn stream(&mut self, _peer: Option<&dyn Entry>) -> Result<Box<dyn Read + Send>> {
        let state = self.state.lock();
        let (_, data) = state
            .entries
            .get(&self.name)
            .ok_or_else(|| FsError::NotFound(self.name.clone()))?;
        Ok(Box::new(Cursor::new(data.clone())))
    }
}

struct MemoryOutput {
    state: Arc<Mutex<MemoryState>>,
    entry: FsEntry,
}

impl OutputSocket<FsEntry> for MemoryOutput {
    fn target(&mut self) -> Result<FsEntry> {
        Ok(self.entry.clone())
    }

    fn stream(&mut self, _peer: Option<&dyn Entry>) -> Result<Box<dyn EntryWriter>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(FsError::Busy("memory container is closed".into()));
        }
        if state.writing {
            return Err(FsError::Busy(format!(
                "cannot open '{}' while another entry is being written",
                self.entry.name()
            )));
        }
        state.writing = true;
        Ok(Box::new(MemoryWriter {
            state: self.state.clone(),
            entry: Some(self.entry.clone()),
            buf: Vec::new(),
        }))
    }
}

struct MemoryWriter {
    state: Arc<Mutex<MemoryState>>,
    entry: Option<FsEntry>,
    buf: Vec<u8>,
}

impl Write for MemoryWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl EntryWriter for MemoryWriter {
    fn close(mut self: Box<Self>) -> Result<()> {
        let Some(mut entry) = self.entry.take() else {
            return Ok(());
        };
        entry.set_size(Size::Data, Some(self.buf.len() as u64));
        if entry.time(Access::Write).is_none() {
            entry.set_time(Access::Write, Some(now_millis()));
        }
        let data = std::mem::take(&mut self.buf);
        let mut state = self.state.lock();
        state.entries.insert(entry.name().to_string(), (entry, data));
        state.writing = false;
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        if self.entry.take().is_some() {
            self.state.lock().writing = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entry::EntryType;
    use crate::core::socket::{read_all, write_all};

    #[test]
    fn test_one_stream_at_a_time() {
        let container = MemoryContainer::new();
        let mut a = container.output(FsEntry::new("a", EntryType::File));
        let mut b = container.output(FsEntry::new("b", EntryType::File));

        let writer = a.stream(None).unwrap();
        assert!(matches!(b.stream(None), Err(FsError::Busy(_))));
        writer.close().unwrap();

        write_all(&mut *b, b"bee").unwrap();
        assert_eq!(container.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_dropped_writer_frees_slot_without_commit() {
        let container = MemoryContainer::new();
        let mut a = container.output(FsEntry::new("a", EntryType::File));
        drop(a.stream(None).unwrap());

        assert!(!container.is_writing());
        assert!(container.is_empty());
    }

    #[test]
    fn test_read_back() {
        let container = MemoryContainer::new();
        container.insert(FsEntry::new("x", EntryType::File), b"hello".to_vec());

        let mut input = container.input("x");
        assert_eq!(read_all(&mut *input).unwrap(), b"hello");
        assert_eq!(input.target().unwrap().size(Size::Data), Some(5));
        assert!(container.input("missing").target().unwrap_err().is_not_found());
    }
}
