//! TAR driver over the `tar` crate
//!
//! TAR tolerates several entries with the same name, the last one wins on
//! extraction. The driver declares redundant content support accordingly,
//! which lets the grow policy rewrite staged entries without a sync.

use super::{entry_name, read_source, EntryMeta};
use crate::core::buffer_pool::IoBufferPool;
use crate::core::container::{Container, InputContainer, OutputContainer};
use crate::core::driver::ArchiveDriver;
use crate::core::entry::{Access, ArchiveEntry, Entry, EntryType, FsEntry, Size};
use crate::core::error::{FsError, Result};
use crate::core::model::FsModel;
use crate::core::socket::{EntryWriter, InputSocket, OutputSocket};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;
use tar::{Archive, Builder, EntryType as TarType, Header};
use tracing::debug;

const FILE_MODE: u32 = 0o644;
const DIRECTORY_MODE: u32 = 0o755;

#[derive(Debug, Clone)]
pub struct TarEntry {
    name: String,
    entry_type: EntryType,
    meta: EntryMeta,
    mode: u32,
}

impl TarEntry {
    pub fn mode(&self) -> u32 {
        self.mode
    }
}

impl Entry for TarEntry {
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

impl ArchiveEntry for TarEntry {
    fn set_size(&mut self, kind: Size, value: Option<u64>) {
        self.meta.set_size(kind, value);
    }

    fn set_time(&mut self, access: Access, value: Option<u64>) {
        self.meta.set_time(access, value);
    }
}

pub struct TarDriver {
    pool: Arc<dyn IoBufferPool>,
}

impl TarDriver {
    pub fn new(pool: Arc<dyn IoBufferPool>) -> Self {
        TarDriver { pool }
    }
}

impl ArchiveDriver for TarDriver {
    type Entry = TarEntry;

    fn new_entry(&self, name: &str, entry_type: EntryType, template: Option<&dyn Entry>) -> TarEntry {
        TarEntry {
            name: entry_name(name, entry_type),
            entry_type,
            meta: EntryMeta::from_template(template),
            mode: if entry_type == EntryType::Directory {
                DIRECTORY_MODE
            } else {
                FILE_MODE
            },
        }
    }

    fn new_input_container(
        &self,
        model: &FsModel,
        source: &mut dyn InputSocket<FsEntry>,
    ) -> Result<Box<dyn InputContainer<TarEntry>>> {
        let (_, data) = read_source(source)?;
        let mut archive = Archive::new(Cursor::new(data));
        let mut entries = IndexMap::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            let header = entry.header();
            let entry_type = match header.entry_type() {
                TarType::Directory => EntryType::Directory,
                TarType::Regular | TarType::Continuous => EntryType::File,
                _ => EntryType::Special,
            };
            let mut meta = EntryMeta::default();
            meta.set_time(Access::Write, header.mtime().ok().map(|secs| secs * 1000));
            let mode = header.mode().unwrap_or(FILE_MODE);
            let name = entry_name(&entry.path()?.to_string_lossy(), entry_type);

            let mut content = Vec::new();
            if entry_type == EntryType::File {
                entry.read_to_end(&mut content)?;
            }
            meta.set_size(Size::Data, Some(content.len() as u64));
            entries.insert(
                name.clone(),
                (
                    TarEntry {
                        name,
                        entry_type,
                        meta,
                        mode,
                    },
                    Arc::new(content),
                ),
            );
        }
        if entries.is_empty() {
            // An empty byte stream parses as an empty archive.
            debug!("{} holds no TAR entries", model.mount_point());
        }
        Ok(Box::new(TarInput { entries }))
    }

    fn new_output_container(
        &self,
        _model: &FsModel,
        sink: &mut dyn OutputSocket<FsEntry>,
        _source: Option<&dyn InputContainer<TarEntry>>,
    ) -> Result<Box<dyn OutputContainer<TarEntry>>> {
        let sink = sink.stream(None)?;
        Ok(Box::new(TarOutput {
            state: Arc::new(Mutex::new(TarOutState {
                builder: Some(Builder::new(sink)),
                entries: IndexMap::new(),
                busy: false,
            })),
        }))
    }

    fn redundant_content_support(&self) -> bool {
        true
    }

    fn redundant_meta_data_support(&self) -> bool {
        true
    }

    fn pool(&self) -> Arc<dyn IoBufferPool> {
        self.pool.clone()
    }
}

struct TarInput {
    entries: IndexMap<String, (TarEntry, Arc<Vec<u8>>)>,
}

impl Container<TarEntry> for TarInput {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn entries(&self) -> Vec<TarEntry> {
        self.entries.values().map(|(entry, _)| entry.clone()).collect()
    }

    fn entry(&self, name: &str) -> Option<TarEntry> {
        self.entries.get(name).map(|(entry, _)| entry.clone())
    }
}

impl InputContainer<TarEntry> for TarInput {
    fn input(&self, name: &str) -> Box<dyn InputSocket<TarEntry>> {
        Box::new(TarEntryInput {
            name: name.to_string(),
            found: self.entries.get(name).cloned(),
        })
    }

    fn close(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

struct TarEntryInput {
    name: String,
    found: Option<(TarEntry, Arc<Vec<u8>>)>,
}

impl InputSocket<TarEntry> for TarEntryInput {
    fn target(&mut self) -> Result<TarEntry> {
        match &self.found {
            Some((entry, _)) => Ok(entry.clone()),
            None => Err(FsError::NotFound(self.name.clone())),
        }
    }

    fn stream(&mut self, _peer: Option<&dyn Entry>) -> Result<Box<dyn Read + Send>> {
        match &self.found {
            Some((_, content)) => Ok(Box::new(Cursor::new(content.as_ref().clone()))),
            None => Err(FsError::NotFound(self.name.clone())),
        }
    }
}

struct TarOutState {
    builder: Option<Builder<Box<dyn EntryWriter>>>,
    entries: IndexMap<String, TarEntry>,
    busy: bool,
}

impl TarOutState {
    fn commit(&mut self, mut entry: TarEntry, data: &[u8]) -> Result<()> {
        let builder = self
            .builder
            .as_mut()
            .ok_or_else(|| FsError::Io(io::Error::new(io::ErrorKind::Other, "TAR output closed")))?;
        let mut header = Header::new_gnu();
        header.set_mode(entry.mode);
        header.set_mtime(entry.time(Access::Write).unwrap_or(0) / 1000);
        if entry.entry_type == EntryType::Directory {
            header.set_entry_type(TarType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, &entry.name, io::empty())?;
            entry.set_size(Size::Data, Some(0));
        } else {
            header.set_entry_type(TarType::Regular);
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, &entry.name, data)?;
            entry.set_size(Size::Data, Some(data.len() as u64));
        }
        self.entries.insert(entry.name.clone(), entry);
        Ok(())
    }
}

struct TarOutput {
    state: Arc<Mutex<TarOutState>>,
}

impl Container<TarEntry> for TarOutput {
    fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn entries(&self) -> Vec<TarEntry> {
        self.state.lock().entries.values().cloned().collect()
    }

    fn entry(&self, name: &str) -> Option<TarEntry> {
        self.state.lock().entries.get(name).cloned()
    }
}

impl OutputContainer<TarEntry> for TarOutput {
    fn output(&self, entry: TarEntry) -> Box<dyn OutputSocket<TarEntry>> {
        Box::new(TarEntryOutput {
            entry,
            state: self.state.clone(),
        })
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.busy {
            return Err(FsError::Busy("TAR entry stream still open".into()));
        }
        let Some(builder) = state.builder.take() else {
            return Ok(());
        };
        let sink = builder.into_inner()?;
        sink.close()?;
        debug!("Wrote TAR archive with {} entries", state.entries.len());
        Ok(())
    }
}

struct TarEntryOutput {
    entry: TarEntry,
    state: Arc<Mutex<TarOutState>>,
}

impl OutputSocket<TarEntry> for TarEntryOutput {
    fn target(&mut self) -> Result<TarEntry> {
        Ok(self.entry.clone())
    }

    fn stream(&mut self, peer: Option<&dyn Entry>) -> Result<Box<dyn EntryWriter>> {
        let mut state = self.state.lock();
        if state.busy {
            return Err(FsError::Busy(self.entry.name.clone()));
        }
        state.busy = true;
        let mut entry = self.entry.clone();
        if let Some(time) = peer.and_then(|p| p.time(Access::Write)) {
            if entry.time(Access::Write).is_none() {
                entry.set_time(Access::Write, Some(time));
            }
        }
        Ok(Box::new(TarEntryWriter {
            entry: Some(entry),
            data: Vec::new(),
            state: self.state.clone(),
        }))
    }
}

/// Collects the entry content, since the header needs the size up front.
struct TarEntryWriter {
    entry: Option<TarEntry>,
    data: Vec<u8>,
    state: Arc<Mutex<TarOutState>>,
}

impl Write for TarEntryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl EntryWriter for TarEntryWriter {
    fn close(mut self: Box<Self>) -> Result<()> {
        let Some(entry) = self.entry.take() else {
            return Ok(());
        };
        let mut state = self.state.lock();
        state.busy = false;
        state.commit(entry, &self.data)
    }
}

impl Drop for TarEntryWriter {
    fn drop(&mut self) {
        if self.entry.is_some() {
            self.state.lock().busy = false;
        }
    }
}
