//! Multiplexing output container over a single-stream container

use matryoshka::core::buffer_pool::MemoryPool;
use matryoshka::core::container::{Container, MemoryContainer, OutputContainer};
use matryoshka::core::multiplex::MultiplexingOutputContainer;
use matryoshka::core::socket::write_all;
use matryoshka::{EntryType, FsEntry, FsError};
use std::io::Write;
use std::sync::Arc;
use std::thread;

fn file(name: &str) -> FsEntry {
    FsEntry::new(name, EntryType::File)
}

fn setup() -> (MemoryContainer, Arc<MemoryPool>, MultiplexingOutputContainer<FsEntry>) {
    let sink = MemoryContainer::new();
    let pool = Arc::new(MemoryPool::new());
    let mux = MultiplexingOutputContainer::new(Box::new(sink.clone()), pool.clone());
    (sink, pool, mux)
}

#[test]
fn test_entries_are_written_in_open_order() {
    let (sink, pool, mut mux) = setup();

    let mut a = mux.output(file("A")).stream(None).unwrap();
    let mut b = mux.output(file("B")).stream(None).unwrap();
    let mut c = mux.output(file("C")).stream(None).unwrap();
    a.write_all(b"a").unwrap();
    b.write_all(b"bb").unwrap();
    c.write_all(b"ccc").unwrap();

    // Closed in reverse order
    c.close().unwrap();
    b.close().unwrap();
    assert!(sink.names().is_empty());
    a.close().unwrap();

    assert_eq!(sink.names(), vec!["A", "B", "C"]);
    assert_eq!(sink.content("C").unwrap(), b"ccc");
    assert_eq!(mux.pending(), 0);

    OutputContainer::close(&mut mux).unwrap();
    assert!(sink.is_closed());
    assert_eq!(pool.stats().live(), 0);
}

#[test]
fn test_close_while_busy_leaves_container_open() {
    let (sink, _pool, mut mux) = setup();
    let direct = mux.output(file("A")).stream(None).unwrap();

    assert!(matches!(OutputContainer::close(&mut mux), Err(FsError::Busy(_))));
    assert!(!sink.is_closed());

    direct.close().unwrap();
    OutputContainer::close(&mut mux).unwrap();
    assert!(sink.is_closed());
}

#[test]
fn test_entry_lookup_covers_direct_and_buffered() {
    let (_sink, _pool, mux) = setup();
    write_all(&mut *mux.output(file("first")), b"1").unwrap();
    let direct = mux.output(file("second")).stream(None).unwrap();
    write_all(&mut *mux.output(file("third")), b"333").unwrap();

    assert!(mux.entry("first").is_some());
    assert!(mux.entry("third").is_some());
    assert!(mux.entry("missing").is_none());
    direct.close().unwrap();
    assert_eq!(mux.len(), 3);
}

#[test]
fn test_concurrent_writers_all_land() {
    let (sink, _pool, mut mux) = setup();
    let mux_ref = &mux;
    thread::scope(|scope| {
        for i in 0..8 {
            scope.spawn(move || {
                let name = format!("entry-{}", i);
                write_all(&mut *mux_ref.output(file(&name)), name.as_bytes()).unwrap();
            });
        }
    });

    OutputContainer::close(&mut mux).unwrap();
    let mut names = sink.names();
    names.sort();
    assert_eq!(names.len(), 8);
    for name in names {
        assert_eq!(sink.content(&name).unwrap(), name.as_bytes());
    }
}
