//! Socket-to-socket copy
//!
//! The copy overlaps reading and writing: a scoped reader thread fills
//! chunks into a bounded channel while the calling thread drains them into
//! the output stream. Chunk order is preserved, so the result is the same
//! as a plain sequential copy.

use crate::core::entry::Entry;
use crate::core::error::FsError;
use crate::core::socket::{InputSocket, OutputSocket};
use crossbeam::channel;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Chunk size of the reader thread.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks in flight between reader and writer.
const QUEUE_DEPTH: usize = 4;

/// A copy failure, classified by the side it came from.
#[derive(Error, Debug)]
pub enum CopyError {
    #[error("reading input failed: {0}")]
    Input(FsError),

    #[error("writing output failed: {0}")]
    Output(FsError),
}

impl CopyError {
    pub fn is_input(&self) -> bool {
        matches!(self, CopyError::Input(_))
    }

    pub fn into_inner(self) -> FsError {
        match self {
            CopyError::Input(e) | CopyError::Output(e) => e,
        }
    }
}

impl From<CopyError> for FsError {
    fn from(e: CopyError) -> Self {
        e.into_inner()
    }
}

/// Copies the content of `input` to `output` and closes the output stream.
///
/// Each side sees the other side's target as its peer. On any failure the
/// output stream is dropped unclosed, so nothing partial is committed.
pub fn copy<I, O>(
    input: &mut dyn InputSocket<I>,
    output: &mut dyn OutputSocket<O>,
) -> std::result::Result<u64, CopyError>
where
    I: Entry,
    O: Entry,
{
    let source = input.target().map_err(CopyError::Input)?;
    let sink = output.target().map_err(CopyError::Output)?;
    let reader = input.stream(Some(&sink)).map_err(CopyError::Input)?;
    let mut writer = output.stream(Some(&source)).map_err(CopyError::Output)?;

    let copied = pump(reader, &mut *writer)?;
    writer.close().map_err(CopyError::Output)?;
    Ok(copied)
}

/// Moves all bytes from `reader` to `writer` through the reader thread.
pub fn pump(
    mut reader: Box<dyn Read + Send>,
    writer: &mut dyn Write,
) -> std::result::Result<u64, CopyError> {
    let (tx, rx) = channel::bounded::<io::Result<Vec<u8>>>(QUEUE_DEPTH);

    std::thread::scope(|scope| {
        scope.spawn(move || loop {
            let mut chunk = vec![0u8; CHUNK_SIZE];
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    chunk.truncate(n);
                    if tx.send(Ok(chunk)).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        });

        // Owned here so an early return unblocks the reader before the join.
        let rx = rx;
        let mut total = 0u64;
        for message in rx.iter() {
            let chunk = message.map_err(|e| CopyError::Input(e.into()))?;
            writer
                .write_all(&chunk)
                .map_err(|e| CopyError::Output(e.into()))?;
            total += chunk.len() as u64;
        }
        writer.flush().map_err(|e| CopyError::Output(e.into()))?;
        Ok(total)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entry::{EntryType, FsEntry};
    use crate::core::error::Result;
    use crate::core::socket::{EntryWriter, VecWriter};
    use parking_lot::Mutex;
    use std::io::Cursor;
    use std::sync::Arc;

    struct MemInput {
        data: Vec<u8>,
        fail: bool,
    }

    impl InputSocket<FsEntry> for MemInput {
        fn target(&mut self) -> Result<FsEntry> {
            Ok(FsEntry::new("in", EntryType::File))
        }

        fn stream(&mut self, _peer: Option<&dyn Entry>) -> Result<Box<dyn Read + Send>> {
            if self.fail {
                return Ok(Box::new(FailingReader));
            }
            Ok(Box::new(Cursor::new(self.data.clone())))
        }
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::InvalidData, "corrupt"))
        }
    }

    struct MemOutput {
        sink: Arc<Mutex<Option<Vec<u8>>>>,
    }

    impl OutputSocket<FsEntry> for MemOutput {
        fn target(&mut self) -> Result<FsEntry> {
            Ok(FsEntry::new("out", EntryType::File))
        }

        fn stream(&mut self, peer: Option<&dyn Entry>) -> Result<Box<dyn EntryWriter>> {
            assert_eq!(peer.map(|p| p.name().to_string()), Some("in".to_string()));
            let sink = self.sink.clone();
            Ok(Box::new(VecWriter::new(move |bytes| {
                *sink.lock() = Some(bytes);
                Ok(())
            })))
        }
    }

    #[test]
    fn test_copy_large_content() {
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let sink = Arc::new(Mutex::new(None));
        let mut input = MemInput { data: data.clone(), fail: false };
        let mut output = MemOutput { sink: sink.clone() };

        let copied = copy(&mut input, &mut output).unwrap();
        assert_eq!(copied, data.len() as u64);
        assert_eq!(sink.lock().as_ref(), Some(&data));
    }

    #[test]
    fn test_input_failure_is_classified_and_not_committed() {
        let sink = Arc::new(Mutex::new(None));
        let mut input = MemInput { data: Vec::new(), fail: true };
        let mut output = MemOutput { sink: sink.clone() };

        let err = copy(&mut input, &mut output).unwrap_err();
        assert!(err.is_input());
        assert!(sink.lock().is_none());
    }
}
