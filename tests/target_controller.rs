//! Mount and sync lifecycle of the target archive controller

mod common;

use common::{
    corrupt, host_and_model, pool, stored_zip_bytes, tar_content, tar_names, zip_bytes, zip_content,
    zip_names,
};
use matryoshka::core::archive::TargetArchiveController;
use matryoshka::core::controller::FsController;
use matryoshka::core::socket::{read_all, write_all};
use matryoshka::{
    AccessOptions, Entry, EntryName, EntryType, FsError, Signal, SyncOptions, TarDriver, ZipDriver,
};
use std::sync::Arc;
use tempfile::TempDir;

fn zip_target(dir: &TempDir, archive: &str) -> TargetArchiveController<ZipDriver> {
    let (host, model) = host_and_model(dir.path(), archive);
    TargetArchiveController::new(Arc::new(ZipDriver::new(pool())), model, host)
}

fn tar_target(dir: &TempDir, archive: &str) -> TargetArchiveController<TarDriver> {
    let (host, model) = host_and_model(dir.path(), archive);
    TargetArchiveController::new(Arc::new(TarDriver::new(pool())), model, host)
}

fn name(s: &str) -> EntryName {
    EntryName::new(s).unwrap()
}

#[test]
fn test_sync_of_unmounted_controller_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let mut target = zip_target(&dir, "none.zip");

    target.sync(SyncOptions::ABORT_CHANGES).unwrap();
    target.sync(SyncOptions::UMOUNT).unwrap();
    assert!(!target.is_mounted());
    assert!(!dir.path().join("none.zip").exists());
}

#[test]
fn test_missing_archive_is_a_transient_false_positive() {
    let dir = TempDir::new().unwrap();
    let mut target = zip_target(&dir, "none.zip");

    let err = target.stat(AccessOptions::empty(), &name("x")).unwrap_err();
    match err.signal() {
        Some(Signal::FalsePositive {
            path, persistent, ..
        }) => {
            assert_eq!(path, "none.zip");
            assert!(!persistent);
        }
        other => panic!("expected a false positive, got {:?}", other),
    }
    assert!(!target.is_mounted());
}

#[test]
fn test_corrupt_archive_is_a_persistent_false_positive_until_sync() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("bad.zip"), b"definitely not a zip").unwrap();
    let mut target = zip_target(&dir, "bad.zip");

    for _ in 0..2 {
        let err = target.stat(AccessOptions::empty(), &EntryName::ROOT).unwrap_err();
        assert!(matches!(
            err.signal(),
            Some(Signal::FalsePositive { persistent: true, .. })
        ));
    }

    std::fs::write(dir.path().join("bad.zip"), zip_bytes(&[("ok.txt", b"ok")])).unwrap();
    target.sync(SyncOptions::SYNC).unwrap();
    assert!(target.stat(AccessOptions::empty(), &name("ok.txt")).unwrap().is_some());
}

#[test]
fn test_mount_reads_existing_archive() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("in.zip"),
        zip_bytes(&[("dir/", b""), ("dir/a.txt", b"alpha"), ("deep/er/b.txt", b"beta")]),
    )
    .unwrap();
    let mut target = zip_target(&dir, "in.zip");

    let root = target.stat(AccessOptions::empty(), &EntryName::ROOT).unwrap().unwrap();
    assert!(root.is_type(EntryType::Directory));
    assert!(target.is_mounted());
    assert!(target.has_input_archive());
    assert!(!target.has_output_archive());

    let ghost = target.stat(AccessOptions::empty(), &name("deep/er")).unwrap().unwrap();
    assert!(ghost.is_type(EntryType::Directory));
    assert_eq!(
        read_all(&mut *target.input(AccessOptions::empty(), name("dir/a.txt"))).unwrap(),
        b"alpha"
    );
}

#[test]
fn test_new_archive_omits_ghost_directories() {
    let dir = TempDir::new().unwrap();
    let mut target = zip_target(&dir, "new.zip");

    write_all(
        &mut *target.output(AccessOptions::CREATE_PARENTS, name("a/b/c.txt"), None),
        b"deep",
    )
    .unwrap();
    target
        .mknod(AccessOptions::CREATE_PARENTS, &name("made"), EntryType::Directory, None)
        .unwrap();
    assert!(target.has_output_archive());
    target.sync(SyncOptions::UMOUNT).unwrap();
    assert!(!target.is_mounted());

    let data = std::fs::read(dir.path().join("new.zip")).unwrap();
    let names = zip_names(&data);
    assert!(names.contains(&"a/b/c.txt".to_string()));
    assert!(names.contains(&"made/".to_string()));
    assert!(!names.contains(&"a/".to_string()));
    assert!(!names.contains(&"a/b/".to_string()));
}

#[test]
fn test_update_copies_untouched_entries() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("up.zip"),
        zip_bytes(&[("keep.txt", b"kept"), ("y/", b""), ("change.txt", b"old")]),
    )
    .unwrap();
    let mut target = zip_target(&dir, "up.zip");

    write_all(&mut *target.output(AccessOptions::empty(), name("change.txt"), None), b"new").unwrap();
    write_all(&mut *target.output(AccessOptions::empty(), name("added.txt"), None), b"add").unwrap();
    target.sync(SyncOptions::SYNC).unwrap();

    let data = std::fs::read(dir.path().join("up.zip")).unwrap();
    let mut names = zip_names(&data);
    names.sort();
    assert_eq!(names, vec!["added.txt", "change.txt", "keep.txt", "y/"]);
    assert_eq!(zip_content(&data, "keep.txt"), b"kept");
    assert_eq!(zip_content(&data, "change.txt"), b"new");
}

#[test]
fn test_first_unreadable_entry_is_a_warning() {
    let dir = TempDir::new().unwrap();
    let mut data = stored_zip_bytes(&[
        ("a.txt", b"first entry"),
        ("b.txt", b"second entry"),
        ("c.txt", b"third entry"),
    ]);
    corrupt(&mut data, b"first entry");
    std::fs::write(dir.path().join("c.zip"), data).unwrap();
    let mut target = zip_target(&dir, "c.zip");

    write_all(&mut *target.output(AccessOptions::empty(), name("n.txt"), None), b"new").unwrap();
    match target.sync(SyncOptions::SYNC) {
        Err(FsError::Sync(e)) => {
            assert!(e.is_warning());
            assert_eq!(e.issues().len(), 1);
        }
        other => panic!("expected a sync warning, got {:?}", other),
    }
    assert!(!target.is_mounted());

    let data = std::fs::read(dir.path().join("c.zip")).unwrap();
    let mut names = zip_names(&data);
    names.sort();
    assert_eq!(names, vec!["b.txt", "c.txt", "n.txt"]);
    assert_eq!(zip_content(&data, "b.txt"), b"second entry");
    assert_eq!(zip_content(&data, "n.txt"), b"new");
}

#[test]
fn test_second_unreadable_entry_fails_the_sync() {
    let dir = TempDir::new().unwrap();
    let mut data = stored_zip_bytes(&[
        ("a.txt", b"first entry"),
        ("b.txt", b"second entry"),
        ("c.txt", b"third entry"),
    ]);
    corrupt(&mut data, b"first entry");
    corrupt(&mut data, b"second entry");
    std::fs::write(dir.path().join("c.zip"), &data).unwrap();
    let mut target = zip_target(&dir, "c.zip");

    write_all(&mut *target.output(AccessOptions::empty(), name("n.txt"), None), b"new").unwrap();
    match target.sync(SyncOptions::SYNC) {
        Err(FsError::Sync(e)) => assert!(!e.is_warning()),
        other => panic!("expected a sync failure, got {:?}", other),
    }
    assert_eq!(std::fs::read(dir.path().join("c.zip")).unwrap(), data);
}

#[test]
fn test_staged_entry_needs_sync() {
    let dir = TempDir::new().unwrap();
    let mut target = zip_target(&dir, "stage.zip");
    write_all(
        &mut *target.output(AccessOptions::CREATE_PARENTS, name("s.txt"), None),
        b"1",
    )
    .unwrap();

    let read = read_all(&mut *target.input(AccessOptions::empty(), name("s.txt")));
    assert!(matches!(read.unwrap_err().signal(), Some(Signal::NeedsSync(_))));

    let rewrite = write_all(&mut *target.output(AccessOptions::empty(), name("s.txt"), None), b"2");
    assert!(matches!(rewrite.unwrap_err().signal(), Some(Signal::NeedsSync(_))));

    target.sync(SyncOptions::SYNC).unwrap();
    assert_eq!(
        read_all(&mut *target.input(AccessOptions::empty(), name("s.txt"))).unwrap(),
        b"1"
    );
}

#[test]
fn test_grow_appends_redundant_tar_entries() {
    let dir = TempDir::new().unwrap();
    let mut target = tar_target(&dir, "grow.tar");
    let grow = AccessOptions::CREATE_PARENTS | AccessOptions::GROW;

    write_all(&mut *target.output(grow, name("g.txt"), None), b"one").unwrap();
    write_all(&mut *target.output(grow, name("g.txt"), None), b"two").unwrap();
    target.sync(SyncOptions::SYNC).unwrap();

    let data = std::fs::read(dir.path().join("grow.tar")).unwrap();
    let copies = tar_names(&data).iter().filter(|n| *n == "g.txt").count();
    assert_eq!(copies, 2);
    assert_eq!(tar_content(&data, "g.txt"), b"one");
    assert_eq!(
        read_all(&mut *target.input(AccessOptions::empty(), name("g.txt"))).unwrap(),
        b"two"
    );
}

#[test]
fn test_open_stream_blocks_sync_unless_forced() {
    let dir = TempDir::new().unwrap();
    let mut target = zip_target(&dir, "busy.zip");
    let writer = target
        .output(AccessOptions::CREATE_PARENTS, name("open.txt"), None)
        .stream(None)
        .unwrap();

    assert!(matches!(target.sync(SyncOptions::SYNC), Err(FsError::Busy(_))));
    target.sync(SyncOptions::UMOUNT).unwrap();
    assert!(writer.close().is_err());

    // The entry exists in the tree, its discarded content does not.
    let data = std::fs::read(dir.path().join("busy.zip")).unwrap();
    assert_eq!(zip_content(&data, "open.txt"), b"");
}

#[test]
fn test_archive_root_mknod_and_unlink() {
    let dir = TempDir::new().unwrap();
    let mut target = zip_target(&dir, "root.zip");

    target
        .mknod(AccessOptions::empty(), &EntryName::ROOT, EntryType::Directory, None)
        .unwrap();
    assert!(matches!(
        target.mknod(AccessOptions::empty(), &EntryName::ROOT, EntryType::Directory, None),
        Err(FsError::EntryExists(_))
    ));
    target.sync(SyncOptions::SYNC).unwrap();
    assert!(dir.path().join("root.zip").is_file());

    write_all(&mut *target.output(AccessOptions::empty(), name("x"), None), b"x").unwrap();
    assert!(matches!(
        target.unlink(AccessOptions::empty(), &EntryName::ROOT),
        Err(FsError::DirectoryNotEmpty(_))
    ));
    target.unlink(AccessOptions::empty(), &name("x")).unwrap_err();
    target.sync(SyncOptions::SYNC).unwrap();
    target.unlink(AccessOptions::empty(), &name("x")).unwrap();
    target.unlink(AccessOptions::empty(), &EntryName::ROOT).unwrap();
    assert!(!dir.path().join("root.zip").exists());
}
