use std::path::Path;
use std::time::Duration;

use mqstore::message::{check_message_and_return_size, decode, RecordCheck};
use mqstore::{Message, MessageStore, StoreConfig, TagFilter};
use tempfile::tempdir;

const SEGMENT_SIZE: usize = 4096;

fn config(root: &Path) -> StoreConfig {
    StoreConfig {
        mapped_file_size_commit_log: SEGMENT_SIZE,
        mapped_file_entries_consume_queue: 128,
        max_message_size: 1024,
        max_hash_slot_num: 64,
        max_index_num: 256,
        ha_listen_port: 0,
        shutdown_grace_ms: 5000,
        ..StoreConfig::with_root(root)
    }
}

#[test]
fn record_that_does_not_fit_moves_to_the_next_segment() {
    let dir = tempdir().expect("tempdir");
    let store = MessageStore::open(config(dir.path())).expect("open");
    store.load().expect("load");
    store.start().expect("start");

    // 91 fixed + 900 body + 1 topic byte = 992 bytes, four per segment.
    let mut offsets = Vec::new();
    for i in 0..10u8 {
        let append = store
            .put_message(&Message::new("T", 0, vec![i; 900]))
            .append_result
            .expect("appended");
        assert_eq!(append.wrote_bytes, 992);
        offsets.push(append.wrote_offset);
    }
    assert_eq!(&offsets[..5], &[0, 992, 1984, 2976, 4096]);
    assert_eq!(offsets[8], 2 * SEGMENT_SIZE as u64);
    assert!(store.wait_dispatch_drained(Duration::from_secs(5)));

    // Walk the raw log, skipping blank tails.
    let mut sequential = Vec::new();
    let mut offset = 0u64;
    while offset < store.max_physical_offset() {
        let data = store.get_commit_log_data(offset).expect("log data");
        match check_message_and_return_size(data.as_slice(), true) {
            RecordCheck::Valid(request) => {
                let record = data.sub(0, request.msg_size as usize).expect("record bytes");
                sequential.push(decode(record.as_slice(), true).expect("decode"));
                offset += request.msg_size as u64;
            }
            RecordCheck::Blank => offset += SEGMENT_SIZE as u64 - offset % SEGMENT_SIZE as u64,
            RecordCheck::Invalid => panic!("invalid record at {offset}"),
        }
    }

    let by_queue = store
        .get_message("T", 0, 0, 32, &TagFilter::all())
        .expect("get")
        .decode_messages()
        .expect("decode");
    assert_eq!(sequential.len(), 10);
    assert_eq!(by_queue.len(), 10);
    for (i, (a, b)) in sequential.iter().zip(&by_queue).enumerate() {
        assert_eq!(a.commit_log_offset, b.commit_log_offset);
        assert_eq!(a.body, b.body);
        assert_eq!(a.queue_offset, i as u64);
        assert_eq!(a.body, vec![i as u8; 900]);
    }
    store.shutdown();
}
