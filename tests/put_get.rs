use std::path::Path;
use std::time::Duration;

use mqstore::message::sys_flag;
use mqstore::{GetMessageStatus, Message, MessageStore, PutMessageStatus, StoreConfig, TagFilter};
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

fn open(root: &Path) -> MessageStore {
    let store = MessageStore::open(config(root)).expect("open store");
    store.load().expect("load store");
    store.start().expect("start store");
    store
}

#[test]
fn three_messages_then_overflow_one() {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path());
    for body in ["a", "b", "c"] {
        let result = store.put_message(&Message::new("T", 0, body));
        assert_eq!(result.status, PutMessageStatus::PutOk);
    }
    assert!(store.wait_dispatch_drained(Duration::from_secs(5)));

    let result = store
        .get_message("T", 0, 0, 10, &TagFilter::all())
        .expect("get message");
    assert_eq!(result.status, GetMessageStatus::Found);
    assert_eq!(result.next_begin_offset, 3);
    assert_eq!((result.min_offset, result.max_offset), (0, 3));
    let bodies: Vec<Vec<u8>> = result
        .decode_messages()
        .expect("decode")
        .into_iter()
        .map(|m| m.body)
        .collect();
    assert_eq!(bodies, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

    let overflow = store
        .get_message("T", 0, 3, 10, &TagFilter::all())
        .expect("get at max");
    assert_eq!(overflow.status, GetMessageStatus::OffsetOverflowOne);
    assert_eq!(overflow.next_begin_offset, 3);

    let badly = store
        .get_message("T", 0, 9, 10, &TagFilter::all())
        .expect("get past max");
    assert_eq!(badly.status, GetMessageStatus::OffsetOverflowBadly);
    assert_eq!(badly.next_begin_offset, 0);
    store.shutdown();
    drop(store);

    let store = open(dir.path());
    let reopened = store
        .get_message("T", 0, 1, 10, &TagFilter::all())
        .expect("get after restart");
    assert_eq!(reopened.status, GetMessageStatus::Found);
    assert_eq!(reopened.message_count(), 2);
    let next = store.put_message(&Message::new("T", 0, "d"));
    assert_eq!(next.append_result.expect("appended").logics_offset, 3);
    store.shutdown();
}

#[test]
fn oversized_topic_is_rejected_without_moving_the_log() {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path());
    store.put_message(&Message::new("T", 0, "x"));
    let before = store.max_physical_offset();

    let topic = "t".repeat(128);
    let result = store.put_message(&Message::new(topic, 0, "x"));
    assert_eq!(result.status, PutMessageStatus::MessageIllegal);
    assert!(result.append_result.is_none());
    assert_eq!(store.max_physical_offset(), before);
    store.shutdown();
}

#[test]
fn offsets_increase_and_queue_offsets_count_dispatched_records() {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path());
    let mut last_end = 0u64;
    let mut expected_queue_offset = [0u64; 2];
    for i in 0..40u32 {
        let queue_id = i % 2;
        let mut msg = Message::new("orders", queue_id, format!("body-{i}"));
        let prepared = i % 7 == 3;
        if prepared {
            msg = msg.with_transaction(sys_flag::TRANSACTION_PREPARED_TYPE);
        }
        let append = store
            .put_message(&msg)
            .append_result
            .expect("appended");
        assert_eq!(append.wrote_offset, last_end, "physical offsets are gapless");
        last_end = append.wrote_offset + append.wrote_bytes as u64;
        if prepared {
            assert_eq!(append.logics_offset, 0);
        } else {
            assert_eq!(append.logics_offset, expected_queue_offset[queue_id as usize]);
            expected_queue_offset[queue_id as usize] += 1;
        }
    }
    assert!(store.wait_dispatch_drained(Duration::from_secs(5)));
    for queue_id in 0..2u32 {
        assert_eq!(
            store.get_max_offset_in_queue("orders", queue_id),
            expected_queue_offset[queue_id as usize]
        );
        let mut previous = None;
        for offset in 0..expected_queue_offset[queue_id as usize] {
            let phys = store.get_commit_log_offset_in_queue("orders", queue_id, offset);
            if let Some(prev) = previous {
                assert!(phys > prev);
            }
            previous = Some(phys);
            let msg = store.look_message_by_offset(phys).expect("record");
            assert_eq!(msg.queue_offset, offset);
            assert_eq!(msg.queue_id, queue_id);
        }
    }
    assert_eq!(store.max_physical_offset(), last_end);
    store.shutdown();
}

#[test]
fn small_pulls_resume_where_the_last_one_stopped() {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path());
    for i in 0..5 {
        store.put_message(&Message::new("T", 3, format!("m{i}")));
    }
    assert!(store.wait_dispatch_drained(Duration::from_secs(5)));

    let mut offset = 0;
    let mut seen = Vec::new();
    while offset < 5 {
        let result = store
            .get_message("T", 3, offset, 2, &TagFilter::all())
            .expect("pull");
        assert_eq!(result.status, GetMessageStatus::Found);
        assert!(result.message_count() <= 2);
        for msg in result.decode_messages().expect("decode") {
            seen.push(String::from_utf8(msg.body).expect("utf8"));
        }
        offset = result.next_begin_offset;
    }
    assert_eq!(seen, ["m0", "m1", "m2", "m3", "m4"]);
    assert_eq!(store.get_message_total_in_queue("T", 3), 5);
    store.shutdown();
}
