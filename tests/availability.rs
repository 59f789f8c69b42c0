use std::path::Path;

use mqstore::{FlushDiskType, Message, MessageStore, PutMessageStatus, StoreConfig};
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
        // Keep the background cleaner out of the way; passes run by hand.
        clean_resource_interval_ms: 3_600_000,
        disk_space_warning_level_ratio: 1.0,
        disk_space_clean_forcibly_ratio: 1.0,
        ..StoreConfig::with_root(root)
    }
}

fn open(config: StoreConfig) -> MessageStore {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = MessageStore::open(config).expect("open store");
    store.load().expect("load store");
    store.start().expect("start store");
    store
}

#[test]
fn full_disk_refuses_writes_until_space_is_back() {
    let dir = tempdir().expect("tempdir");
    let store = open(config(dir.path()));
    assert_eq!(
        store.put_message(&Message::new("T", 0, "before")).status,
        PutMessageStatus::PutOk
    );

    // Any used space is over a zero warning level.
    store.set_disk_space_warning_level_ratio(0.0);
    store.clean_once().expect("clean");
    assert!(!store.running_flags().is_writeable());
    assert_eq!(
        store.put_message(&Message::new("T", 0, "refused")).status,
        PutMessageStatus::ServiceNotAvailable
    );

    store.set_disk_space_warning_level_ratio(1.0);
    store.clean_once().expect("clean");
    assert!(store.running_flags().is_writeable());
    let result = store.put_message(&Message::new("T", 0, "after"));
    assert_eq!(result.status, PutMessageStatus::PutOk);
    assert_eq!(result.append_result.expect("appended").logics_offset, 1);
    store.shutdown();
}

#[test]
fn sync_flush_put_returns_once_the_record_is_on_disk() {
    let dir = tempdir().expect("tempdir");
    let store = open(StoreConfig {
        flush_disk_type: FlushDiskType::SyncFlush,
        ..config(dir.path())
    });
    for i in 0..3 {
        let result = store.put_message(&Message::new("T", 0, format!("durable-{i}")));
        assert_eq!(result.status, PutMessageStatus::PutOk);
        let append = result.append_result.expect("appended");
        assert!(store.flushed_physical_offset() >= append.wrote_offset + append.wrote_bytes as u64);
    }

    let info = store.runtime_info();
    assert_eq!(
        info.get("commitLogFlushedOffset"),
        Some(&store.max_physical_offset().to_string())
    );
    assert_eq!(info.get("segmentAllocateErrors").map(String::as_str), Some("0"));
    store.shutdown();
}
