//! ZIP driver over the `zip` crate

use super::{entry_name, read_source, EntryMeta};
use crate::core::buffer_pool::IoBufferPool;
use crate::core::container::{Container, InputContainer, OutputContainer};
use crate::core::driver::ArchiveDriver;
use crate::core::entry::{Access, ArchiveEntry, Entry, EntryType, FsEntry, Size};
use crate::core::error::{FsError, Result};
use crate::core::model::FsModel;
use crate::core::socket::{EntryWriter, InputSocket, OutputSocket};
use chrono::{Datelike, NaiveDate, Timelike};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;
use tracing::debug;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

/// Upper bound of the read buffer reserved from an entry's declared size.
const MAX_PREALLOCATION: u64 = 1 << 20;

fn zip_error(e: ZipError) -> FsError {
    match e {
        ZipError::Io(e) => FsError::from(e),
        ZipError::FileNotFound => FsError::NotFound("entry not found in ZIP archive".into()),
        other => FsError::Io(io::Error::new(io::ErrorKind::InvalidData, other)),
    }
}

fn to_millis(time: DateTime) -> Option<u64> {
    let date = NaiveDate::from_ymd_opt(time.year() as i32, time.month() as u32, time.day() as u32)?;
    let time = date.and_hms_opt(time.hour() as u32, time.minute() as u32, time.second() as u32)?;
    u64::try_from(time.and_utc().timestamp_millis()).ok()
}

fn to_zip_time(millis: u64) -> Option<DateTime> {
    let time = chrono::DateTime::from_timestamp_millis(i64::try_from(millis).ok()?)?.naive_utc();
    DateTime::from_date_and_time(
        u16::try_from(time.year()).ok()?,
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
    )
    .ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Stored,
    Deflated,
}

impl From<Method> for CompressionMethod {
    fn from(method: Method) -> Self {
        match method {
            Method::Stored => CompressionMethod::Stored,
            Method::Deflated => CompressionMethod::Deflated,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ZipEntry {
    name: String,
    entry_type: EntryType,
    meta: EntryMeta,
    method: Method,
}

impl ZipEntry {
    pub fn method(&self) -> Method {
        self.method
    }
}

impl Entry for ZipEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    fn size(&self, kind: Size) -> Option<u64> {
        self.meta.size(kind)
    }

    fn time(&self, access: Access) -> Option<u64> {
        self.meta.time(access)
    }
}

impl ArchiveEntry for ZipEntry {
    fn set_size(&mut self, kind: Size, value: Option<u64>) {
        self.meta.set_size(kind, value);
    }

    fn set_time(&mut self, access: Access, value: Option<u64>) {
        self.meta.set_time(access, value);
    }
}

pub struct ZipDriver {
    pool: Arc<dyn IoBufferPool>,
    method: Method,
}

impl ZipDriver {
    pub fn new(pool: Arc<dyn IoBufferPool>) -> Self {
        ZipDriver {
            pool,
            method: Method::Deflated,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }
}

impl ArchiveDriver for ZipDriver {
    type Entry = ZipEntry;

    fn new_entry(&self, name: &str, entry_type: EntryType, template: Option<&dyn Entry>) -> ZipEntry {
        ZipEntry {
            name: entry_name(name, entry_type),
            entry_type,
            meta: EntryMeta::from_template(template),
            method: self.method,
        }
    }

    fn new_input_container(
        &self,
        model: &FsModel,
        source: &mut dyn InputSocket<FsEntry>,
    ) -> Result<Box<dyn InputContainer<ZipEntry>>> {
        let (_, data) = read_source(source)?;
        let mut archive = ZipArchive::new(Cursor::new(data)).map_err(zip_error)?;
        let mut entries = IndexMap::new();
        for index in 0..archive.len() {
            let file = archive.by_index_raw(index).map_err(zip_error)?;
            let entry_type = if file.is_dir() {
                EntryType::Directory
            } else {
                EntryType::File
            };
            let mut meta = EntryMeta::default();
            meta.set_size(Size::Data, Some(file.size()));
            meta.set_size(Size::Storage, Some(file.compressed_size()));
            meta.set_time(Access::Write, to_millis(file.last_modified()));
            let method = match file.compression() {
                CompressionMethod::Stored => Method::Stored,
                _ => Method::Deflated,
            };
            let name = entry_name(file.name(), entry_type);
            entries.insert(
                name.clone(),
                ZipEntry {
                    name,
                    entry_type,
                    meta,
                    method,
                },
            );
        }
        debug!("Read {} ZIP entries of {}", entries.len(), model.mount_point());
        Ok(Box::new(ZipInput {
            entries,
            archive: Arc::new(Mutex::new(archive)),
        }))
    }

    fn new_output_container(
        &self,
        _model: &FsModel,
        sink: &mut dyn OutputSocket<FsEntry>,
        _source: Option<&dyn InputContainer<ZipEntry>>,
    ) -> Result<Box<dyn OutputContainer<ZipEntry>>> {
        let sink = sink.stream(None)?;
        Ok(Box::new(ZipOutput {
            state: Arc::new(Mutex::new(ZipOutState {
                writer: Some(ZipWriter::new(Cursor::new(Vec::new()))),
                sink: Some(sink),
                entries: IndexMap::new(),
                busy: false,
            })),
        }))
    }

    fn pool(&self) -> Arc<dyn IoBufferPool> {
        self.pool.clone()
    }
}

type SharedArchive = Arc<Mutex<ZipArchive<Cursor<Vec<u8>>>>>;

struct ZipInput {
    entries: IndexMap<String, ZipEntry>,
    archive: SharedArchive,
}

impl Container<ZipEntry> for ZipInput {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn entries(&self) -> Vec<ZipEntry> {
        self.entries.values().cloned().collect()
    }

    fn entry(&self, name: &str) -> Option<ZipEntry> {
        self.entries.get(name).cloned()
    }
}

impl InputContainer<ZipEntry> for ZipInput {
    fn input(&self, name: &str) -> Box<dyn InputSocket<ZipEntry>> {
        Box::new(ZipEntryInput {
            entry: self.entries.get(name).cloned(),
            name: name.to_string(),
            archive: self.archive.clone(),
        })
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct ZipEntryInput {
    entry: Option<ZipEntry>,
    name: String,
    archive: SharedArchive,
}

impl InputSocket<ZipEntry> for ZipEntryInput {
    fn target(&mut self) -> Result<ZipEntry> {
        self.entry
            .clone()
            .ok_or_else(|| FsError::NotFound(self.name.clone()))
    }

    fn stream(&mut self, _peer: Option<&dyn Entry>) -> Result<Box<dyn Read + Send>> {
        let mut archive = self.archive.lock();
        let mut file = archive.by_name(&self.name).map_err(zip_error)?;
        let mut data = Vec::with_capacity(file.size().min(MAX_PREALLOCATION) as usize);
        file.read_to_end(&mut data)?;
        Ok(Box::new(Cursor::new(data)))
    }
}

struct ZipOutState {
    writer: Option<ZipWriter<Cursor<Vec<u8>>>>,
    sink: Option<Box<dyn EntryWriter>>,
    entries: IndexMap<String, ZipEntry>,
    busy: bool,
}

impl ZipOutState {
    fn commit(&mut self, mut entry: ZipEntry, data: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| FsError::Io(io::Error::new(io::ErrorKind::Other, "ZIP output closed")))?;
        let mut options = FileOptions::default().compression_method(entry.method.into());
        if let Some(time) = entry.time(Access::Write).and_then(to_zip_time) {
            options = options.last_modified_time(time);
        }
        if entry.entry_type == EntryType::Directory {
            writer.add_directory(entry.name.clone(), options).map_err(zip_error)?;
            entry.set_size(Size::Data, Some(0));
        } else {
            writer.start_file(entry.name.clone(), options).map_err(zip_error)?;
            writer.write_all(data)?;
            entry.set_size(Size::Data, Some(data.len() as u64));
        }
        entry.set_size(Size::Storage, None);
        self.entries.insert(entry.name.clone(), entry);
        Ok(())
    }
}

struct ZipOutput {
    state: Arc<Mutex<ZipOutState>>,
}

impl Container<ZipEntry> for ZipOutput {
    fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn entries(&self) -> Vec<ZipEntry> {
        self.state.lock().entries.values().cloned().collect()
    }

    fn entry(&self, name: &str) -> Option<ZipEntry> {
        self.state.lock().entries.get(name).cloned()
    }
}

impl OutputContainer<ZipEntry> for ZipOutput {
    fn output(&self, entry: ZipEntry) -> Box<dyn OutputSocket<ZipEntry>> {
        Box::new(ZipEntryOutput {
            entry,
            state: self.state.clone(),
        })
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.busy {
            return Err(FsError::Busy("ZIP entry stream still open".into()));
        }
        let (Some(mut writer), Some(mut sink)) = (state.writer.take(), state.sink.take()) else {
            return Ok(());
        };
        let bytes = writer.finish().map_err(zip_error)?.into_inner();
        sink.write_all(&bytes)?;
        sink.close()?;
        debug!("Wrote ZIP archive with {} entries", state.entries.len());
        Ok(())
    }
}

struct ZipEntryOutput {
    entry: ZipEntry,
    state: Arc<Mutex<ZipOutState>>,
}

impl OutputSocket<ZipEntry> for ZipEntryOutput {
    fn target(&mut self) -> Result<ZipEntry> {
        Ok(self.entry.clone())
    }

    fn stream(&mut self, peer: Option<&dyn Entry>) -> Result<Box<dyn EntryWriter>> {
        let mut state = self.state.lock();
        if state.busy {
            return Err(FsError::Busy(self.entry.name.clone()));
        }
        state.busy = true;
        let mut entry = self.entry.clone();
        if let Some(peer) = peer {
            if entry.time(Access::Write).is_none() {
                entry.set_time(Access::Write, peer.time(Access::Write));
            }
        }
        Ok(Box::new(ZipEntryWriter {
            entry: Some(entry),
            data: Vec::new(),
            state: self.state.clone(),
        }))
    }
}

/// Collects the entry content; the entry is written to the archive on close.
struct ZipEntryWriter {
    entry: Option<ZipEntry>,
    data: Vec<u8>,
    state: Arc<Mutex<ZipOutState>>,
}

impl Write for ZipEntryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl EntryWriter for ZipEntryWriter {
    fn close(mut self: Box<Self>) -> Result<()> {
        let Some(entry) = self.entry.take() else {
            return Ok(());
        };
        let mut state = self.state.lock();
        state.busy = false;
        state.commit(entry, &self.data)
    }
}

impl Drop for ZipEntryWriter {
    fn drop(&mut self) {
        if self.entry.is_some() {
            self.state.lock().busy = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer_pool::MemoryPool;
    use crate::core::model::MountPoint;
    use crate::core::socket::{read_all, write_all, VecWriter};

    struct Bytes(Vec<u8>);

    impl InputSocket<FsEntry> for Bytes {
        fn target(&mut self) -> Result<FsEntry> {
            Ok(FsEntry::new("a.zip", EntryType::File))
        }

        fn stream(&mut self, _peer: Option<&dyn Entry>) -> Result<Box<dyn Read + Send>> {
            Ok(Box::new(Cursor::new(self.0.clone())))
        }
    }

    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl OutputSocket<FsEntry> for Sink {
        fn target(&mut self) -> Result<FsEntry> {
            Ok(FsEntry::new("a.zip", EntryType::File))
        }

        fn stream(&mut self, _peer: Option<&dyn Entry>) -> Result<Box<dyn EntryWriter>> {
            let out = self.0.clone();
            Ok(Box::new(VecWriter::new(move |data| {
                *out.lock() = data;
                Ok(())
            })))
        }
    }

    fn model() -> Arc<FsModel> {
        let root = FsModel::new(MountPoint::root(), None);
        FsModel::new(
            MountPoint::nested(root.mount_point(), crate::core::entry::EntryName::new("a.zip").unwrap()),
            Some(root),
        )
    }

    #[test]
    fn test_write_and_read_back() {
        let driver = ZipDriver::new(Arc::new(MemoryPool::new()));
        let model = model();
        let bytes = Arc::new(Mutex::new(Vec::new()));

        let mut output = driver
            .new_output_container(&model, &mut Sink(bytes.clone()), None)
            .unwrap();
        let dir = driver.new_entry("docs", EntryType::Directory, None);
        write_all(&mut *output.output(dir), b"").unwrap();
        let file = driver.new_entry("docs/readme.txt", EntryType::File, None);
        write_all(&mut *output.output(file), b"read me").unwrap();
        output.close().unwrap();

        let data = bytes.lock().clone();
        let input = driver.new_input_container(&model, &mut Bytes(data)).unwrap();
        let names: Vec<String> = input.entries().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["docs/", "docs/readme.txt"]);
        assert_eq!(input.entry("docs/").unwrap().entry_type(), EntryType::Directory);
        assert_eq!(read_all(&mut *input.input("docs/readme.txt")).unwrap(), b"read me");
    }

    #[test]
    fn test_one_stream_at_a_time() {
        let driver = ZipDriver::new(Arc::new(MemoryPool::new()));
        let model = model();
        let output = driver
            .new_output_container(&model, &mut Sink(Arc::new(Mutex::new(Vec::new()))), None)
            .unwrap();

        let first = output
            .output(driver.new_entry("a", EntryType::File, None))
            .stream(None)
            .unwrap();
        let second = output.output(driver.new_entry("b", EntryType::File, None)).stream(None);
        assert!(matches!(second, Err(FsError::Busy(_))));
        drop(first);
        assert!(output
            .output(driver.new_entry("b", EntryType::File, None))
            .stream(None)
            .is_ok());
    }

    #[test]
    fn test_declared_size_does_not_drive_allocation() {
        let driver = ZipDriver::new(Arc::new(MemoryPool::new()));
        let model = model();
        let bytes = Arc::new(Mutex::new(Vec::new()));
        let mut output = driver
            .new_output_container(&model, &mut Sink(bytes.clone()), None)
            .unwrap();
        let file = driver.new_entry("big.txt", EntryType::File, None);
        write_all(&mut *output.output(file), b"small").unwrap();
        output.close().unwrap();

        // Central directory header: uncompressed size at offset 24.
        let mut data = bytes.lock().clone();
        let header = data
            .windows(4)
            .position(|w| w == [0x50, 0x4b, 0x01, 0x02])
            .unwrap();
        data[header + 24..header + 28].copy_from_slice(&u32::MAX.to_le_bytes());

        let input = driver.new_input_container(&model, &mut Bytes(data)).unwrap();
        assert_eq!(read_all(&mut *input.input("big.txt")).unwrap(), b"small");
    }

    #[test]
    fn test_garbage_is_rejected() {
        let driver = ZipDriver::new(Arc::new(MemoryPool::new()));
        let result = driver.new_input_container(&model(), &mut Bytes(b"not a zip".to_vec()));
        assert!(result.is_err());
    }
}
