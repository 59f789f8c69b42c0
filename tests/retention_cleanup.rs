use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use mqstore::{GetMessageStatus, Message, MessageStore, StoreConfig, TagFilter};
use tempfile::tempdir;

const SEGMENT_SIZE: u64 = 4096;

fn config(root: &Path) -> StoreConfig {
    StoreConfig {
        mapped_file_size_commit_log: SEGMENT_SIZE as usize,
        mapped_file_entries_consume_queue: 128,
        max_message_size: 1024,
        max_hash_slot_num: 64,
        max_index_num: 256,
        ha_listen_port: 0,
        shutdown_grace_ms: 5000,
        // Every hour is a delete hour and nothing is reserved.
        delete_when: (0..24).map(|h| h.to_string()).collect::<Vec<_>>().join(";"),
        file_reserved_time_hours: 0,
        delete_commit_log_files_interval_ms: 0,
        delete_consume_queue_files_interval_ms: 0,
        clean_resource_interval_ms: 3_600_000,
        disk_space_warning_level_ratio: 1.0,
        disk_space_clean_forcibly_ratio: 1.0,
        ..StoreConfig::with_root(root)
    }
}

fn put(store: &MessageStore, topic: &str, n: usize) {
    for _ in 0..n {
        let result = store.put_message(&Message::new(topic, 0, vec![7u8; 900]));
        assert!(result.is_ok());
    }
}

#[test]
fn cleanup_never_removes_a_live_queue_minimum() {
    let dir = tempdir().expect("tempdir");
    let store = MessageStore::open(config(dir.path())).expect("open");
    store.load().expect("load");
    store.start().expect("start");

    // Segment 0 holds A, segment 1 holds B, segment 2 holds A again.
    put(&store, "A", 4);
    put(&store, "B", 4);
    put(&store, "A", 2);
    assert!(store.wait_dispatch_drained(Duration::from_secs(5)));
    assert_eq!(store.min_physical_offset(), 0);

    let report = store.clean_once().expect("clean");
    assert_eq!(report.commit_log_files, 2);
    assert_eq!(store.min_physical_offset(), 2 * SEGMENT_SIZE);

    for topic in ["A", "B"] {
        let min = store.get_min_offset_in_queue(topic, 0);
        let max = store.get_max_offset_in_queue(topic, 0);
        if min < max {
            let phys = store.get_commit_log_offset_in_queue(topic, 0, min);
            assert!(phys >= store.min_physical_offset(), "{topic} min points into a deleted segment");
            assert!(store.look_message_by_offset(phys).is_some());
        }
    }
    assert_eq!(store.get_min_offset_in_queue("A", 0), 4);
    assert_eq!(store.get_min_offset_in_queue("B", 0), 4);

    let stale = store
        .get_message("A", 0, 0, 10, &TagFilter::all())
        .expect("get stale");
    assert_eq!(stale.status, GetMessageStatus::OffsetTooSmall);
    assert_eq!(stale.next_begin_offset, 4);
    let live = store
        .get_message("A", 0, 4, 10, &TagFilter::all())
        .expect("get live");
    assert_eq!(live.status, GetMessageStatus::Found);
    assert_eq!(live.message_count(), 2);

    // A second pass has nothing older than the newest segment left.
    let again = store.clean_once().expect("clean again");
    assert_eq!(again.commit_log_files, 0);

    // B now only points below the log and can be dropped.
    assert_eq!(store.clean_expired_consume_queues().expect("clean queues"), 1);
    let gone = store
        .get_message("B", 0, 0, 10, &TagFilter::all())
        .expect("get B");
    assert_eq!(gone.status, GetMessageStatus::NoMatchedLogicQueue);
    store.shutdown();
}

#[test]
fn unused_topics_are_destroyed() {
    let dir = tempdir().expect("tempdir");
    let store = MessageStore::open(config(dir.path())).expect("open");
    store.load().expect("load");
    store.start().expect("start");
    put(&store, "keep", 1);
    put(&store, "drop", 1);
    assert!(store.wait_dispatch_drained(Duration::from_secs(5)));

    let keep: HashSet<String> = ["keep".to_string()].into_iter().collect();
    assert_eq!(store.clean_unused_topics(&keep).expect("clean topics"), 1);
    assert_eq!(store.get_max_offset_in_queue("keep", 0), 1);
    assert_eq!(store.get_max_offset_in_queue("drop", 0), 0);
    assert!(!config(dir.path()).store_path_consume_queue().join("drop").exists());

    // A dropped topic starts again at queue offset 0.
    let append = store
        .put_message(&Message::new("drop", 0, "again"))
        .append_result
        .expect("appended");
    assert_eq!(append.logics_offset, 0);
    store.shutdown();
}
