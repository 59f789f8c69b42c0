use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

use mqstore::mapped_file::segment_file_name;
use mqstore::{GetMessageStatus, Message, MessageStore, StoreConfig, TagFilter};
use tempfile::tempdir;

fn config(root: &Path) -> StoreConfig {
    StoreConfig {
        mapped_file_size_commit_log: 64 * 1024,
        mapped_file_entries_consume_queue: 128,
        max_message_size: 4096,
        max_hash_slot_num: 64,
        max_index_num: 256,
        ha_listen_port: 0,
        shutdown_grace_ms: 5000,
        ..StoreConfig::with_root(root)
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open(root: &Path) -> MessageStore {
    init_logging();
    let store = MessageStore::open(config(root)).expect("open store");
    store.load().expect("load store");
    store.start().expect("start store");
    store
}

/// Leaves the store looking like the process died while running.
fn mark_crashed(root: &Path) {
    std::fs::File::create(config(root).abort_file_path()).expect("abort file");
}

#[test]
fn corrupt_tail_record_is_truncated_and_appends_resume_without_gap() {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path());
    let mut ends = Vec::new();
    let mut third_offset = 0;
    for (i, body) in ["a", "b", "c"].iter().enumerate() {
        let append = store
            .put_message(&Message::new("T", 0, *body))
            .append_result
            .expect("appended");
        if i == 2 {
            third_offset = append.wrote_offset;
        }
        ends.push(append.wrote_offset + append.wrote_bytes as u64);
    }
    assert!(store.wait_dispatch_drained(Duration::from_secs(5)));
    store.shutdown();
    drop(store);

    // Zero the body CRC of the last record.
    let segment = config(dir.path())
        .store_path_commit_log()
        .join(segment_file_name(0));
    let mut file = OpenOptions::new()
        .write(true)
        .open(&segment)
        .expect("open segment");
    file.seek(SeekFrom::Start(third_offset + 8)).expect("seek");
    file.write_all(&[0u8; 4]).expect("corrupt crc");
    file.sync_all().expect("sync");
    drop(file);
    mark_crashed(dir.path());

    let store = open(dir.path());
    assert_eq!(store.max_physical_offset(), ends[1]);
    assert_eq!(store.get_max_offset_in_queue("T", 0), 2);
    let result = store
        .get_message("T", 0, 2, 10, &TagFilter::all())
        .expect("get at end");
    assert_eq!(result.status, GetMessageStatus::OffsetOverflowOne);

    let append = store
        .put_message(&Message::new("T", 0, "d"))
        .append_result
        .expect("appended after recovery");
    assert_eq!(append.wrote_offset, ends[1]);
    assert_eq!(append.logics_offset, 2);
    assert!(store.wait_dispatch_drained(Duration::from_secs(5)));

    let bodies: Vec<Vec<u8>> = store
        .get_message("T", 0, 0, 10, &TagFilter::all())
        .expect("get all")
        .decode_messages()
        .expect("decode")
        .into_iter()
        .map(|m| m.body)
        .collect();
    assert_eq!(bodies, vec![b"a".to_vec(), b"b".to_vec(), b"d".to_vec()]);
    store.shutdown();
}

#[test]
fn abnormal_recovery_twice_lands_on_the_same_watermark() {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path());
    for i in 0..6 {
        store.put_message(&Message::new("T", i % 2, format!("m{i}")));
    }
    assert!(store.wait_dispatch_drained(Duration::from_secs(5)));
    let end = store.max_physical_offset();
    store.shutdown();
    drop(store);

    let mut watermarks = Vec::new();
    for _ in 0..2 {
        mark_crashed(dir.path());
        let store = open(dir.path());
        watermarks.push((
            store.max_physical_offset(),
            store.get_max_offset_in_queue("T", 0),
            store.get_max_offset_in_queue("T", 1),
        ));
        store.shutdown();
    }
    assert_eq!(watermarks[0], (end, 3, 3));
    assert_eq!(watermarks[0], watermarks[1]);
}

#[test]
fn clean_restart_keeps_queues_and_offsets() {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path());
    for i in 0..4 {
        store.put_message(&Message::new("T", 0, format!("m{i}")));
    }
    store.shutdown();
    assert!(!config(dir.path()).abort_file_path().exists());
    drop(store);

    let store = open(dir.path());
    assert!(config(dir.path()).abort_file_path().exists());
    assert_eq!(store.get_max_offset_in_queue("T", 0), 4);
    let append = store
        .put_message(&Message::new("T", 0, "m4"))
        .append_result
        .expect("appended");
    assert_eq!(append.logics_offset, 4);
    store.shutdown();
}
