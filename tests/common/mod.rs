//! Shared helpers for integration tests

#![allow(dead_code)]

use matryoshka::core::buffer_pool::{IoBufferPool, MemoryPool};
use matryoshka::core::controller::{share, FsController, SharedController};
use matryoshka::core::host::HostController;
use matryoshka::core::model::{FsModel, MountPoint};
use matryoshka::{EntryName, FsManager};
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Manager over a fresh scratch directory. Keep the directory alive for as
/// long as the manager is used.
pub fn manager() -> (TempDir, FsManager) {
    let dir = TempDir::new().unwrap();
    let fs = FsManager::new(dir.path()).unwrap();
    (dir, fs)
}

pub fn pool() -> Arc<dyn IoBufferPool> {
    Arc::new(MemoryPool::new())
}

/// Host controller over `dir` and the model of an archive `name` in it.
pub fn host_and_model(dir: &Path, name: &str) -> (SharedController, Arc<FsModel>) {
    let host = HostController::new(dir);
    let root = host.model().clone();
    let host = share(Box::new(host));
    let mount_point = MountPoint::nested(root.mount_point(), EntryName::new(name).unwrap());
    (host, FsModel::new(mount_point, Some(root)))
}

/// Builds a zip archive in memory.
pub fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    for (name, content) in files {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}

/// Builds a zip archive with uncompressed entries.
pub fn stored_zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Flips the first byte of `content` where it is stored in `data`, so the
/// entry fails its checksum.
pub fn corrupt(data: &mut [u8], content: &[u8]) {
    let at = data
        .windows(content.len())
        .position(|w| w == content)
        .unwrap();
    data[at] ^= 0xff;
}

/// Entry names of a zip archive, in archive order.
pub fn zip_names(data: &[u8]) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data)).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect()
}

/// Content of one zip entry.
pub fn zip_content(data: &[u8], name: &str) -> Vec<u8> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data)).unwrap();
    let mut file = archive.by_name(name).unwrap();
    let mut content = Vec::new();
    file.read_to_end(&mut content).unwrap();
    content
}

/// Entry names of a tar archive, in archive order.
pub fn tar_names(data: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(Cursor::new(data));
    archive
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

/// Content of one tar entry.
pub fn tar_content(data: &[u8], name: &str) -> Vec<u8> {
    let mut archive = tar::Archive::new(Cursor::new(data));
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().to_string_lossy() == name {
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            return content;
        }
    }
    panic!("no tar entry '{}'", name);
}
