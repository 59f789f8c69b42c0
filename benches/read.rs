use std::time::Duration;

use criterion::{black_box, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use mqstore::{Message, MessageStore, StoreConfig, TagFilter};

const MESSAGES: u64 = 20_000;

fn bench_get_message(c: &mut Criterion) {
    let _ = env_logger::try_init();
    let dir = tempdir().expect("tempdir");
    let config = StoreConfig {
        ha_listen_port: 0,
        ..StoreConfig::with_root(dir.path())
    };
    let store = MessageStore::open(config).expect("open");
    store.load().expect("load");
    store.start().expect("start");
    for i in 0..MESSAGES {
        let tags = if i % 2 == 0 { "TagA" } else { "TagB" };
        let msg = Message::new("bench", 0, vec![0u8; 256]).with_tags(tags);
        assert!(store.put_message(&msg).is_ok());
    }
    assert!(store.wait_dispatch_drained(Duration::from_secs(30)));

    let mut group = c.benchmark_group("get_message");
    for (name, filter) in [("all", TagFilter::all()), ("tag", TagFilter::parse("TagA"))] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &filter, |b, filter| {
            let mut offset = 0;
            b.iter(|| {
                let result = store
                    .get_message("bench", 0, black_box(offset), 32, filter)
                    .expect("get");
                offset = result.next_begin_offset % MESSAGES;
                black_box(result.buffer_total_size)
            });
        });
    }
    group.finish();
    store.shutdown();
}

criterion_group!(benches, bench_get_message);
criterion_main!(benches);
