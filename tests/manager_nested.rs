//! End-to-end tests of the manager over nested archives in a host directory

mod common;

use common::{manager, tar_content, tar_names, zip_bytes, zip_content, zip_names};
use matryoshka::core::key::{KeyPrompt, KeyResult};
use matryoshka::{
    Config, Entry, EntryType, FsError, FsManager, KeyError, Passphrase, Severity, SyncOptions,
};
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::Arc;
use tempfile::TempDir;

#[test]
fn test_zip_inside_tar_round_trip() {
    let (dir, fs) = manager();
    fs.write("outer.tar/inner.zip/notes/hello.txt", b"hello nested").unwrap();
    assert_eq!(fs.mounts(), 2);
    assert_eq!(fs.read("outer.tar/inner.zip/notes/hello.txt").unwrap(), b"hello nested");

    fs.sync(SyncOptions::UMOUNT).unwrap();
    let tar = std::fs::read(dir.path().join("outer.tar")).unwrap();
    assert_eq!(tar_names(&tar), vec!["inner.zip"]);
    let zip = tar_content(&tar, "inner.zip");
    assert_eq!(zip_content(&zip, "notes/hello.txt"), b"hello nested");

    let reopened = FsManager::new(dir.path()).unwrap();
    assert_eq!(
        reopened.read("outer.tar/inner.zip/notes/hello.txt").unwrap(),
        b"hello nested"
    );
}

#[test]
fn test_archives_list_like_directories() {
    let (dir, fs) = manager();
    std::fs::write(
        dir.path().join("pack.zip"),
        zip_bytes(&[("b.txt", b"b"), ("a/one.txt", b"1"), ("a/two.txt", b"2")]),
    )
    .unwrap();

    assert_eq!(fs.read_dir("pack.zip").unwrap(), vec!["a", "b.txt"]);
    assert_eq!(fs.read_dir("pack.zip/a").unwrap(), vec!["one.txt", "two.txt"]);
    assert!(fs.stat("pack.zip").unwrap().unwrap().is_type(EntryType::Directory));
    assert!(matches!(fs.read_dir("pack.zip/b.txt"), Err(FsError::NotDirectory(_))));
    assert_eq!(fs.read_dir("").unwrap(), vec!["pack.zip"]);
}

#[test]
fn test_rewrite_after_write_syncs_transparently() {
    let (dir, fs) = manager();
    fs.write("data.zip/value", b"1").unwrap();
    fs.sync(SyncOptions::SYNC).unwrap();

    // Appending stages the entry in the output archive; reading it back
    // needs a sync the manager performs on its own.
    fs.append("data.zip/value", b"2").unwrap();
    fs.append("data.zip/value", b"3").unwrap();
    assert_eq!(fs.read("data.zip/value").unwrap(), b"123");

    fs.sync(SyncOptions::UMOUNT).unwrap();
    let zip = std::fs::read(dir.path().join("data.zip")).unwrap();
    assert_eq!(zip_content(&zip, "value"), b"123");
}

#[test]
fn test_mkdir_creates_empty_archive() {
    let (dir, fs) = manager();
    fs.mkdir("empty.zip").unwrap();
    assert!(matches!(fs.mkdir("empty.zip"), Err(FsError::EntryExists(_))));
    fs.sync(SyncOptions::UMOUNT).unwrap();

    let zip = std::fs::read(dir.path().join("empty.zip")).unwrap();
    assert!(zip_names(&zip).is_empty());
    assert!(fs.read_dir("empty.zip").unwrap().is_empty());
}

#[test]
fn test_remove_entries_and_archive() {
    let (dir, fs) = manager();
    fs.write("rm.zip/a.txt", b"a").unwrap();
    fs.write("rm.zip/b.txt", b"b").unwrap();
    fs.sync(SyncOptions::UMOUNT).unwrap();

    fs.remove("rm.zip/a.txt").unwrap();
    assert!(!fs.exists("rm.zip/a.txt").unwrap());
    assert!(matches!(fs.remove("rm.zip"), Err(FsError::DirectoryNotEmpty(_))));

    fs.remove("rm.zip/b.txt").unwrap();
    fs.remove("rm.zip").unwrap();
    assert!(!dir.path().join("rm.zip").exists());
}

#[test]
fn test_copy_between_archives() {
    let (dir, fs) = manager();
    fs.write("src.tar/file.bin", &[7u8; 4096]).unwrap();
    fs.sync(SyncOptions::SYNC).unwrap();

    assert_eq!(fs.copy("src.tar/file.bin", "dst.zip/copy.bin").unwrap(), 4096);
    fs.sync(SyncOptions::UMOUNT).unwrap();

    let zip = std::fs::read(dir.path().join("dst.zip")).unwrap();
    assert_eq!(zip_content(&zip, "copy.bin"), vec![7u8; 4096]);
}

#[test]
fn test_plain_directory_named_like_an_archive() {
    let (dir, fs) = manager();
    std::fs::create_dir(dir.path().join("folder.zip")).unwrap();
    std::fs::write(dir.path().join("folder.zip/inside.txt"), b"plain").unwrap();

    assert_eq!(fs.read("folder.zip/inside.txt").unwrap(), b"plain");
    fs.write("folder.zip/more.txt", b"also plain").unwrap();
    assert_eq!(
        std::fs::read(dir.path().join("folder.zip/more.txt")).unwrap(),
        b"also plain"
    );
}

#[test]
fn test_configured_suffixes_only() {
    let dir = TempDir::new().unwrap();
    let config = Config::from_toml_str(
        r#"
        [drivers]
        "zip" = "zip"
        "tar" = ""
        "szip" = ""
        "#,
    )
    .unwrap();
    let fs = FsManager::builder().root(dir.path()).config(config).build().unwrap();

    fs.write("plain.tar/file.txt", b"directory").unwrap();
    assert!(dir.path().join("plain.tar").is_dir());
    assert_eq!(fs.mounts(), 0);
}

#[test]
fn test_sync_reports_all_failures() {
    let (dir, fs) = manager();
    fs.write("one.zip/x", b"x").unwrap();
    fs.write("two.zip/y", b"y").unwrap();

    // Without the host directory no archive can be written.
    let root = dir.path().to_path_buf();
    drop(dir);
    assert!(!root.exists());

    match fs.sync(SyncOptions::SYNC) {
        Err(FsError::Sync(e)) => {
            assert_eq!(e.severity(), Severity::Failure);
            let mounts: Vec<&str> = e.issues().iter().map(|i| i.mount_point.as_str()).collect();
            assert!(mounts.contains(&"one.zip"));
            assert!(mounts.contains(&"two.zip"));
        }
        other => panic!("expected a sync error, got {:?}", other),
    }
}

/// Answers with a fixed list of passphrases.
struct Answers {
    answers: Mutex<Vec<&'static str>>,
    asked: Mutex<usize>,
}

impl Answers {
    fn new(answers: &[&'static str]) -> Arc<Self> {
        let mut answers = answers.to_vec();
        answers.reverse();
        Arc::new(Answers {
            answers: Mutex::new(answers),
            asked: Mutex::new(0),
        })
    }

    fn next(&self, resource: &str) -> KeyResult<Passphrase> {
        *self.asked.lock() += 1;
        self.answers
            .lock()
            .pop()
            .map(Passphrase::new)
            .ok_or_else(|| KeyError::Cancelled(resource.to_string()))
    }
}

impl KeyPrompt<Passphrase> for Answers {
    fn prompt_for_writing(&self, resource: &str) -> KeyResult<Passphrase> {
        self.next(resource)
    }

    fn prompt_for_reading(&self, resource: &str, _invalid: bool) -> KeyResult<Passphrase> {
        self.next(resource)
    }
}

fn sealed_manager(dir: &TempDir, prompt: Arc<Answers>) -> FsManager {
    let mut config = Config::default();
    config.key_retry_delay_ms = 10;
    FsManager::builder()
        .root(dir.path())
        .config(config)
        .prompt(prompt)
        .build()
        .unwrap()
}

#[test]
fn test_sealed_archive_round_trip() {
    let dir = TempDir::new().unwrap();
    {
        let fs = sealed_manager(&dir, Answers::new(&["secret"]));
        fs.write("vault.szip/key.txt", b"treasure").unwrap();
        fs.sync(SyncOptions::UMOUNT).unwrap();
    }
    let raw = std::fs::read(dir.path().join("vault.szip")).unwrap();
    assert_eq!(&raw[..8], b"MTRYSEAL");
    assert!(zip::ZipArchive::new(Cursor::new(&raw)).is_err());

    let prompt = Answers::new(&["wrong", "secret"]);
    let fs = sealed_manager(&dir, prompt.clone());
    assert_eq!(fs.read("vault.szip/key.txt").unwrap(), b"treasure");
    assert_eq!(*prompt.asked.lock(), 2);
}

#[test]
fn test_sealed_archive_without_key_is_unknown_key() {
    let dir = TempDir::new().unwrap();
    {
        let fs = sealed_manager(&dir, Answers::new(&["secret"]));
        fs.write("vault.szip/key.txt", b"treasure").unwrap();
    }
    let fs = sealed_manager(&dir, Answers::new(&[]));
    assert!(matches!(fs.read("vault.szip/key.txt"), Err(FsError::UnknownKey(_))));
}
