//! Store counters reported through `runtime_info`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::clock::wall_ms;

#[derive(Debug, Default, Clone, Copy)]
struct TopicPuts {
    times: u64,
    size: u64,
}

#[derive(Debug)]
pub struct StoreStats {
    boot_timestamp: u64,
    put_message_failed_times: AtomicU64,
    put_message_entire_time_max: AtomicU64,
    get_message_times_total_found: AtomicU64,
    get_message_times_total_miss: AtomicU64,
    get_message_transfered_msg_count: AtomicU64,
    get_message_entire_time_max: AtomicU64,
    dispatch_max_buffer: AtomicU64,
    topics: Mutex<HashMap<String, TopicPuts>>,
}

impl Default for StoreStats {
    fn default() -> Self {
        Self {
            boot_timestamp: wall_ms(),
            put_message_failed_times: AtomicU64::new(0),
            put_message_entire_time_max: AtomicU64::new(0),
            get_message_times_total_found: AtomicU64::new(0),
            get_message_times_total_miss: AtomicU64::new(0),
            get_message_transfered_msg_count: AtomicU64::new(0),
            get_message_entire_time_max: AtomicU64::new(0),
            dispatch_max_buffer: AtomicU64::new(0),
            topics: Mutex::new(HashMap::new()),
        }
    }
}

impl StoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_topic_put(&self, topic: &str, size: u64) {
        if let Ok(mut topics) = self.topics.lock() {
            let entry = topics.entry(topic.to_string()).or_default();
            entry.times += 1;
            entry.size += size;
        }
    }

    pub fn record_put_failed(&self) {
        self.put_message_failed_times.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put_elapsed(&self, elapsed_ms: u64) {
        self.put_message_entire_time_max
            .fetch_max(elapsed_ms, Ordering::Relaxed);
    }

    pub fn record_get(&self, found: bool, transferred: u64, elapsed_ms: u64) {
        if found {
            self.get_message_times_total_found
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.get_message_times_total_miss
                .fetch_add(1, Ordering::Relaxed);
        }
        self.get_message_transfered_msg_count
            .fetch_add(transferred, Ordering::Relaxed);
        self.get_message_entire_time_max
            .fetch_max(elapsed_ms, Ordering::Relaxed);
    }

    pub fn record_dispatch_buffer(&self, pending: u64) {
        self.dispatch_max_buffer.fetch_max(pending, Ordering::Relaxed);
    }

    pub fn put_message_times_total(&self) -> u64 {
        self.topics
            .lock()
            .map(|topics| topics.values().map(|t| t.times).sum())
            .unwrap_or(0)
    }

    pub fn put_message_size_total(&self) -> u64 {
        self.topics
            .lock()
            .map(|topics| topics.values().map(|t| t.size).sum())
            .unwrap_or(0)
    }

    pub fn topic_put_times(&self, topic: &str) -> u64 {
        self.topics
            .lock()
            .ok()
            .and_then(|topics| topics.get(topic).map(|t| t.times))
            .unwrap_or(0)
    }

    pub fn get_message_times_total_found(&self) -> u64 {
        self.get_message_times_total_found.load(Ordering::Relaxed)
    }

    pub fn get_message_times_total_miss(&self) -> u64 {
        self.get_message_times_total_miss.load(Ordering::Relaxed)
    }

    pub fn runtime_info(&self) -> BTreeMap<String, String> {
        let now = wall_ms();
        let times = self.put_message_times_total();
        let size = self.put_message_size_total();
        let mut info = BTreeMap::new();
        let mut put = |key: &str, value: u64| {
            info.insert(key.to_string(), value.to_string());
        };
        put("bootTimestamp", self.boot_timestamp);
        put("runtimeMs", now.saturating_sub(self.boot_timestamp));
        put("putMessageTimesTotal", times);
        put("putMessageSizeTotal", size);
        put("putMessageAverageSize", if times == 0 { 0 } else { size / times });
        put(
            "putMessageFailedTimes",
            self.put_message_failed_times.load(Ordering::Relaxed),
        );
        put(
            "putMessageEntireTimeMax",
            self.put_message_entire_time_max.load(Ordering::Relaxed),
        );
        put("getMessageTimesTotalFound", self.get_message_times_total_found());
        put("getMessageTimesTotalMiss", self.get_message_times_total_miss());
        put(
            "getMessageTransferedMsgCount",
            self.get_message_transfered_msg_count.load(Ordering::Relaxed),
        );
        put(
            "getMessageEntireTimeMax",
            self.get_message_entire_time_max.load(Ordering::Relaxed),
        );
        put("dispatchMaxBuffer", self.dispatch_max_buffer.load(Ordering::Relaxed));
        info
    }
}
