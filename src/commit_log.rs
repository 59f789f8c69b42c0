//! The append-only commit log.
//!
//! Every message of every topic lands here, in the order producers win the
//! write lock. The physical offset of a record is its byte position in the
//! logical stream formed by the segment files; consume queues and the key
//! index only ever point back into it.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::allocate::AllocateService;
use crate::checkpoint::StoreCheckpoint;
use crate::clock::{wall_ms, Clock};
use crate::config::{FlushDiskType, StoreConfig};
use crate::dispatch::{DispatchRequest, DispatchService};
use crate::flags::RunningFlags;
use crate::flush::{FlushTarget, GroupCommit, RealTimeFlush};
use crate::mapped_file::{MappedFile, SelectedBuffer};
use crate::mapped_file_queue::MappedFileQueue;
use crate::message::{
    calc_msg_length, check_message_and_return_size, create_message_id, encode_blank,
    encode_record, properties_to_string, read_u64, tags_string_to_tags_code, Message,
    RecordCheck, RecordStamp, TransactionType, END_FILE_MIN_BLANK_LENGTH, MAX_PROPERTIES_LENGTH,
    MAX_TOPIC_LENGTH, PROPERTY_KEYS, PROPERTY_UNIQ_KEY, STORE_TIMESTAMP_POSITION,
};
use crate::stats::StoreStats;
use crate::{Error, Result};

/// Normal recovery rescans this many segments from the end.
const RECOVER_FROM_LAST_FILES: usize = 3;
/// Consecutive segment allocation failures before the store stops writes.
const MAX_ALLOCATE_FAILURES: u32 = 3;
const SLOW_PUT_WARN_MS: u64 = 500;
const DISPATCH_BACK_OFF: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMessageStatus {
    PutOk,
    FlushDiskTimeout,
    FlushSlaveTimeout,
    SlaveNotAvailable,
    ServiceNotAvailable,
    CreateMappedFileFailed,
    MessageIllegal,
    PropertiesSizeExceeded,
    OsPageCacheBusy,
    UnknownError,
}

impl PutMessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PutMessageStatus::PutOk => "PUT_OK",
            PutMessageStatus::FlushDiskTimeout => "FLUSH_DISK_TIMEOUT",
            PutMessageStatus::FlushSlaveTimeout => "FLUSH_SLAVE_TIMEOUT",
            PutMessageStatus::SlaveNotAvailable => "SLAVE_NOT_AVAILABLE",
            PutMessageStatus::ServiceNotAvailable => "SERVICE_NOT_AVAILABLE",
            PutMessageStatus::CreateMappedFileFailed => "CREATE_MAPEDFILE_FAILED",
            PutMessageStatus::MessageIllegal => "MESSAGE_ILLEGAL",
            PutMessageStatus::PropertiesSizeExceeded => "PROPERTIES_SIZE_EXCEEDED",
            PutMessageStatus::OsPageCacheBusy => "OS_PAGECACHE_BUSY",
            PutMessageStatus::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl std::fmt::Display for PutMessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an appended record landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendMessageResult {
    pub wrote_offset: u64,
    pub wrote_bytes: usize,
    pub msg_id: String,
    pub store_timestamp: u64,
    /// Queue offset assigned to the record (0 for transaction markers).
    pub logics_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutMessageResult {
    pub status: PutMessageStatus,
    pub append_result: Option<AppendMessageResult>,
}

impl PutMessageResult {
    pub fn new(status: PutMessageStatus, append_result: Option<AppendMessageResult>) -> Self {
        Self {
            status,
            append_result,
        }
    }

    pub fn failed(status: PutMessageStatus) -> Self {
        Self::new(status, None)
    }

    /// The record is in the log, whether or not every durability wait was met.
    pub fn is_ok(&self) -> bool {
        self.append_result.is_some()
            && matches!(
                self.status,
                PutMessageStatus::PutOk
                    | PutMessageStatus::FlushDiskTimeout
                    | PutMessageStatus::FlushSlaveTimeout
                    | PutMessageStatus::SlaveNotAvailable
            )
    }
}

enum Flusher {
    RealTime(RealTimeFlush),
    GroupCommit(GroupCommit),
}

struct PutState {
    buf: Vec<u8>,
    // Next queue offset per (topic, queue id).
    topic_queue_table: HashMap<(String, u32), u64>,
}

pub struct CommitLog {
    config: Arc<StoreConfig>,
    queue: Arc<MappedFileQueue>,
    put_lock: Mutex<PutState>,
    // Wall time the current lock holder started, 0 when nobody holds it.
    begin_time_in_lock: AtomicU64,
    last_store_timestamp: Arc<AtomicU64>,
    allocate_failures: AtomicU32,
    store_host: SocketAddrV4,
    clock: Arc<dyn Clock>,
    checkpoint: Arc<StoreCheckpoint>,
    flags: Arc<RunningFlags>,
    stats: Arc<StoreStats>,
    dispatcher: Arc<DispatchService>,
    flusher: Mutex<Option<Arc<Flusher>>>,
}

impl CommitLog {
    pub fn new(
        config: Arc<StoreConfig>,
        allocator: Option<Arc<AllocateService>>,
        clock: Arc<dyn Clock>,
        checkpoint: Arc<StoreCheckpoint>,
        flags: Arc<RunningFlags>,
        stats: Arc<StoreStats>,
        dispatcher: Arc<DispatchService>,
    ) -> Result<Self> {
        let store_host: SocketAddrV4 = config
            .store_host
            .parse()
            .map_err(|_| Error::Config(format!("store_host `{}` is not ip:port", config.store_host)))?;
        let queue = MappedFileQueue::new(
            config.store_path_commit_log(),
            config.mapped_file_size_commit_log,
            allocator,
        );
        Ok(Self {
            queue: Arc::new(queue),
            put_lock: Mutex::new(PutState {
                buf: Vec::with_capacity(config.max_message_size),
                topic_queue_table: HashMap::new(),
            }),
            begin_time_in_lock: AtomicU64::new(0),
            last_store_timestamp: Arc::new(AtomicU64::new(0)),
            allocate_failures: AtomicU32::new(0),
            store_host,
            clock,
            checkpoint,
            flags,
            stats,
            dispatcher,
            flusher: Mutex::new(None),
            config,
        })
    }

    pub fn load(&self) -> Result<()> {
        self.queue.load()?;
        log::info!(
            "load commit log {}",
            if self.queue.is_empty() { "empty" } else { "OK" }
        );
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        let target = FlushTarget {
            queue: Arc::clone(&self.queue),
            checkpoint: Arc::clone(&self.checkpoint),
            last_store_timestamp: Arc::clone(&self.last_store_timestamp),
        };
        let flusher = match self.config.flush_disk_type {
            FlushDiskType::SyncFlush => Flusher::GroupCommit(GroupCommit::start(target)?),
            FlushDiskType::AsyncFlush => Flusher::RealTime(RealTimeFlush::start(
                target,
                Duration::from_millis(self.config.flush_interval_commit_log_ms),
                self.config.flush_commit_log_least_pages,
                Duration::from_millis(self.config.flush_commit_log_thorough_interval_ms),
            )?),
        };
        *self
            .flusher
            .lock()
            .map_err(|_| Error::Corrupt("flusher lock poisoned"))? = Some(Arc::new(flusher));
        Ok(())
    }

    /// Stops the flush service after its final full flush.
    pub fn shutdown(&self, grace: Duration) {
        let flusher = self.flusher.lock().ok().and_then(|mut f| f.take());
        match flusher.as_deref() {
            Some(Flusher::RealTime(flush)) => flush.shutdown(grace),
            Some(Flusher::GroupCommit(flush)) => flush.shutdown(grace),
            None => {}
        }
    }

    fn flusher(&self) -> Option<Arc<Flusher>> {
        self.flusher.lock().ok()?.clone()
    }

    /// Appends `msg`, assigning its physical and queue offsets, then applies
    /// the flush policy.
    pub fn put_message(&self, msg: &Message) -> PutMessageResult {
        let properties = properties_to_string(&msg.properties);
        if msg.topic.len() > MAX_TOPIC_LENGTH || properties.len() > MAX_PROPERTIES_LENGTH {
            log::warn!(
                "message illegal, topic length {} properties length {}",
                msg.topic.len(),
                properties.len()
            );
            return PutMessageResult::failed(PutMessageStatus::MessageIllegal);
        }
        if properties.len() > self.config.max_properties_size {
            log::warn!("properties size {} exceeded", properties.len());
            return PutMessageResult::failed(PutMessageStatus::PropertiesSizeExceeded);
        }
        let msg_len = calc_msg_length(msg.body.len(), msg.topic.len(), properties.len());
        if msg_len > self.config.max_message_size {
            log::warn!("message size {msg_len} exceeded {}", self.config.max_message_size);
            return PutMessageResult::failed(PutMessageStatus::MessageIllegal);
        }

        let Ok(mut state) = self.put_lock.lock() else {
            return PutMessageResult::failed(PutMessageStatus::UnknownError);
        };
        let begin = wall_ms();
        self.begin_time_in_lock.store(begin, Ordering::Release);
        let store_timestamp = self.clock.now_ms();
        let appended = self.append_locked(&mut state, msg, properties.as_bytes(), msg_len, store_timestamp);
        self.begin_time_in_lock.store(0, Ordering::Release);
        drop(state);

        let elapsed = wall_ms().saturating_sub(begin);
        if elapsed > SLOW_PUT_WARN_MS {
            log::warn!("put message in lock cost {elapsed}ms, body {}", msg.body.len());
        }
        let (result, back_off) = match appended {
            Ok(appended) => appended,
            Err(status) => return PutMessageResult::failed(status),
        };
        if back_off {
            std::thread::sleep(DISPATCH_BACK_OFF);
        }
        self.stats.record_topic_put(&msg.topic, result.wrote_bytes as u64);

        let mut status = PutMessageStatus::PutOk;
        match self.flusher().as_deref() {
            Some(Flusher::GroupCommit(flush)) => {
                let next_offset = result.wrote_offset + result.wrote_bytes as u64;
                let timeout = Duration::from_millis(self.config.sync_flush_timeout_ms);
                if !flush.wait_for_flush(next_offset, timeout) {
                    log::error!(
                        "flush disk timeout, topic {} queue {} offset {}",
                        msg.topic,
                        msg.queue_id,
                        result.wrote_offset
                    );
                    status = PutMessageStatus::FlushDiskTimeout;
                }
            }
            Some(Flusher::RealTime(flush)) => flush.wakeup(),
            None => {}
        }
        PutMessageResult::new(status, Some(result))
    }

    fn append_locked(
        &self,
        state: &mut PutState,
        msg: &Message,
        properties: &[u8],
        msg_len: usize,
        store_timestamp: u64,
    ) -> std::result::Result<(AppendMessageResult, bool), PutMessageStatus> {
        let mut file = self.last_file_for_append()?;
        if file.remaining() < msg_len + END_FILE_MIN_BLANK_LENGTH {
            let pos = file.wrote_position();
            let remaining = file.remaining();
            if remaining >= END_FILE_MIN_BLANK_LENGTH {
                file.write_at(pos, &encode_blank(remaining))
                    .map_err(|_| PutMessageStatus::UnknownError)?;
            }
            file.set_wrote_position(file.file_size());
            file = self.last_file_for_append()?;
        }

        let transaction = msg.transaction_type();
        let key = (msg.topic.clone(), msg.queue_id);
        let queue_offset = match transaction {
            TransactionType::Prepared | TransactionType::Rollback => 0,
            _ => state.topic_queue_table.get(&key).copied().unwrap_or(0),
        };
        let physical_offset = file.file_from_offset() + file.wrote_position() as u64;
        let stamp = RecordStamp {
            queue_offset,
            physical_offset,
            store_timestamp,
            store_host: self.store_host,
        };
        encode_record(&mut state.buf, msg, properties, stamp);
        match file.append(&state.buf) {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                log::error!("append at {physical_offset} failed");
                return Err(PutMessageStatus::UnknownError);
            }
        }
        if transaction.is_dispatched() {
            *state.topic_queue_table.entry(key).or_insert(0) += 1;
        }
        self.last_store_timestamp
            .store(store_timestamp, Ordering::Release);

        let request = DispatchRequest {
            topic: msg.topic.clone(),
            queue_id: msg.queue_id,
            commit_log_offset: physical_offset,
            msg_size: msg_len as u32,
            tags_code: msg.tags().map(tags_string_to_tags_code).unwrap_or(0),
            store_timestamp,
            consume_queue_offset: queue_offset,
            keys: msg.properties.get(PROPERTY_KEYS).cloned().unwrap_or_default(),
            uniq_key: msg.properties.get(PROPERTY_UNIQ_KEY).cloned(),
            sys_flag: msg.sys_flag,
            prepared_transaction_offset: msg.prepared_transaction_offset,
        };
        let back_off = self.dispatcher.put_request(request);
        Ok((
            AppendMessageResult {
                wrote_offset: physical_offset,
                wrote_bytes: msg_len,
                msg_id: create_message_id(self.store_host, physical_offset),
                store_timestamp,
                logics_offset: queue_offset,
            },
            back_off,
        ))
    }

    fn last_file_for_append(&self) -> std::result::Result<Arc<MappedFile>, PutMessageStatus> {
        match self.queue.get_last_mapped_file(0) {
            Ok(file) => {
                self.allocate_failures.store(0, Ordering::Relaxed);
                Ok(file)
            }
            Err(err) => {
                let failures = self.allocate_failures.fetch_add(1, Ordering::Relaxed) + 1;
                log::error!("create mapped file failed ({failures} in a row): {err}");
                if failures >= MAX_ALLOCATE_FAILURES && self.flags.get_and_make_not_writeable() {
                    log::error!("segment allocation keeps failing, store marked not writeable");
                }
                Err(PutMessageStatus::CreateMappedFileFailed)
            }
        }
    }

    /// The current lock holder has been inside longer than the busy timeout.
    pub fn is_os_page_cache_busy(&self) -> bool {
        let begin = self.begin_time_in_lock.load(Ordering::Acquire);
        begin > 0 && wall_ms().saturating_sub(begin) > self.config.os_page_cache_busy_timeout_ms
    }

    /// Milliseconds the current holder has spent in the write lock.
    pub fn lock_time_millis(&self) -> u64 {
        match self.begin_time_in_lock.load(Ordering::Acquire) {
            0 => 0,
            begin => wall_ms().saturating_sub(begin),
        }
    }

    /// Bytes `[offset, offset + size)`, if published.
    pub fn get_message(&self, offset: u64, size: usize) -> Option<SelectedBuffer> {
        let file = self.queue.find_mapped_file_by_offset(offset, offset == 0)?;
        let pos = offset.checked_sub(file.file_from_offset())? as usize;
        file.select(pos, size)
    }

    /// Every published byte from `offset` to the end of its segment.
    pub fn get_data(&self, offset: u64) -> Option<SelectedBuffer> {
        let file = self.queue.find_mapped_file_by_offset(offset, offset == 0)?;
        let pos = offset.checked_sub(file.file_from_offset())? as usize;
        file.select_from(pos)
    }

    /// Start of the segment after the one holding `offset`.
    pub fn roll_next_file(&self, offset: u64) -> u64 {
        let size = self.queue.mapped_file_size() as u64;
        offset + size - offset % size
    }

    pub fn pickup_store_timestamp(&self, offset: u64, size: usize) -> Option<u64> {
        let buffer = self.get_message(offset, size)?;
        read_u64(buffer.as_slice(), STORE_TIMESTAMP_POSITION)
    }

    pub fn min_offset(&self) -> u64 {
        self.queue.min_offset()
    }

    pub fn max_offset(&self) -> u64 {
        self.queue.max_offset()
    }

    pub fn flushed_where(&self) -> u64 {
        self.queue.flushed_where()
    }

    pub fn mapped_file_size(&self) -> usize {
        self.queue.mapped_file_size()
    }

    /// Replica write path: appends raw master bytes that must start exactly at
    /// the current end of the log. Returns `false` on a gap or overflow.
    pub fn append_data(&self, start_offset: u64, data: &[u8]) -> Result<bool> {
        let _state = self
            .put_lock
            .lock()
            .map_err(|_| Error::Corrupt("put lock poisoned"))?;
        let file = self.queue.get_last_mapped_file(start_offset)?;
        let end = file.file_from_offset() + file.wrote_position() as u64;
        if end != start_offset {
            log::warn!("append data at {start_offset} but log ends at {end}");
            return Ok(false);
        }
        file.append(data)
    }

    /// Flushes every written byte.
    pub fn flush(&self) -> Result<()> {
        FlushTarget {
            queue: Arc::clone(&self.queue),
            checkpoint: Arc::clone(&self.checkpoint),
            last_store_timestamp: Arc::clone(&self.last_store_timestamp),
        }
        .flush(0)
    }

    /// Finds the end of the last intact record and truncates the log there.
    ///
    /// After a clean exit only the newest segments are checked. Otherwise
    /// every segment is scanned and records at or past the checkpoint are fed
    /// to dispatch again. Returns the recovered end offset.
    pub fn recover(&self, last_exit_ok: bool) -> Result<u64> {
        let files = self.queue.mapped_files();
        if files.is_empty() {
            self.queue.set_flushed_where(0);
            return Ok(0);
        }
        let (start, redispatch_from) = if last_exit_ok {
            (files.len().saturating_sub(RECOVER_FROM_LAST_FILES), None)
        } else {
            let floor = if self.config.message_index_enable {
                self.checkpoint.min_timestamp_index()
            } else {
                self.checkpoint.min_timestamp()
            };
            (0, Some(floor))
        };
        let process_offset = self.scan(&files[start..], redispatch_from);
        log::info!(
            "{} recovery of commit log ends at {process_offset}",
            if last_exit_ok { "normal" } else { "abnormal" }
        );
        self.queue.set_flushed_where(process_offset);
        self.checkpoint.set_physic_offset(process_offset);
        self.queue.truncate_dirty_files(process_offset)?;
        Ok(process_offset)
    }

    fn scan(&self, files: &[Arc<MappedFile>], redispatch_from: Option<u64>) -> u64 {
        let mut process_offset = files.first().map(|f| f.file_from_offset()).unwrap_or(0);
        for file in files {
            let from = file.file_from_offset();
            let bytes = file.slice(0, file.wrote_position()).unwrap_or(&[]);
            let mut pos = 0usize;
            loop {
                if pos >= bytes.len() {
                    process_offset = from + pos as u64;
                    break;
                }
                match check_message_and_return_size(&bytes[pos..], true) {
                    RecordCheck::Valid(request) if request.commit_log_offset == from + pos as u64 => {
                        pos += request.msg_size as usize;
                        if let Some(floor) = redispatch_from {
                            if request.store_timestamp >= floor {
                                self.last_store_timestamp
                                    .fetch_max(request.store_timestamp, Ordering::AcqRel);
                                self.dispatcher.put_request(request);
                            }
                        }
                    }
                    RecordCheck::Blank => {
                        process_offset = from + file.file_size() as u64;
                        break;
                    }
                    _ => {
                        log::info!("recover commit log stops at {}", from + pos as u64);
                        return from + pos as u64;
                    }
                }
            }
        }
        process_offset
    }

    /// Replaces the per-queue offset counters, used after recovery.
    pub fn set_topic_queue_table(&self, table: HashMap<(String, u32), u64>) {
        if let Ok(mut state) = self.put_lock.lock() {
            state.topic_queue_table = table;
        }
    }

    pub fn remove_queue_from_topic_queue_table(&self, topic: &str, queue_id: u32) {
        if let Ok(mut state) = self.put_lock.lock() {
            state.topic_queue_table.remove(&(topic.to_string(), queue_id));
            log::info!("remove queue {topic}-{queue_id} from topic queue table");
        }
    }

    pub fn next_queue_offset(&self, topic: &str, queue_id: u32) -> u64 {
        self.put_lock
            .lock()
            .ok()
            .and_then(|state| state.topic_queue_table.get(&(topic.to_string(), queue_id)).copied())
            .unwrap_or(0)
    }

    /// Oldest segments older than `expired_ms` (all but the newest when
    /// `clean_immediately`).
    pub fn expired_files(&self, expired_ms: u64, clean_immediately: bool) -> Vec<Arc<MappedFile>> {
        self.queue.expired_files_by_time(expired_ms, clean_immediately)
    }

    pub fn delete_files(&self, doomed: &[Arc<MappedFile>], interval: Duration) -> Result<usize> {
        self.queue.delete_files(doomed, interval)
    }

    pub fn destroy(&self) -> Result<()> {
        self.queue.destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::consume_queue::ConsumeQueueTable;
    use crate::message::{decode, sys_flag};
    use std::path::Path;
    use tempfile::tempdir;

    struct Fixture {
        log: CommitLog,
        queues: Arc<ConsumeQueueTable>,
    }

    fn open(root: &Path, segment: usize) -> Result<Fixture> {
        let config = StoreConfig {
            mapped_file_size_commit_log: segment,
            mapped_file_entries_consume_queue: 64,
            max_message_size: 2048,
            ..StoreConfig::with_root(root)
        };
        let checkpoint = Arc::new(StoreCheckpoint::open(&config.checkpoint_path())?);
        let queues = Arc::new(ConsumeQueueTable::new(
            config.store_path_consume_queue(),
            config.mapped_file_size_consume_queue(),
        ));
        let flags = Arc::new(RunningFlags::new());
        let stats = Arc::new(StoreStats::new());
        let dispatcher = Arc::new(DispatchService::new(
            Arc::clone(&queues),
            None,
            Arc::clone(&checkpoint),
            Arc::clone(&flags),
            Arc::clone(&stats),
            1000,
        ));
        let log = CommitLog::new(
            Arc::new(config),
            None,
            Arc::new(SystemClock),
            checkpoint,
            flags,
            stats,
            dispatcher,
        )?;
        log.load()?;
        queues.load()?;
        Ok(Fixture { log, queues })
    }

    fn put(log: &CommitLog, body: &[u8]) -> AppendMessageResult {
        let result = log.put_message(&Message::new("T", 0, body.to_vec()));
        assert_eq!(result.status, PutMessageStatus::PutOk);
        result.append_result.expect("appended")
    }

    #[test]
    fn offsets_are_sequential_and_records_read_back() -> Result<()> {
        let dir = tempdir()?;
        let f = open(dir.path(), 64 * 1024)?;
        let a = put(&f.log, b"a");
        let b = put(&f.log, b"bb");
        assert_eq!(a.wrote_offset, 0);
        assert_eq!(b.wrote_offset, a.wrote_bytes as u64);
        assert_eq!((a.logics_offset, b.logics_offset), (0, 1));

        let bytes = f.log.get_message(b.wrote_offset, b.wrote_bytes).expect("published");
        let ext = decode(bytes.as_slice(), true)?;
        assert_eq!(ext.body, b"bb");
        assert_eq!(ext.queue_offset, 1);
        assert_eq!(f.log.pickup_store_timestamp(b.wrote_offset, b.wrote_bytes), Some(b.store_timestamp));
        assert_eq!(f.log.max_offset(), b.wrote_offset + b.wrote_bytes as u64);
        assert!(f.log.get_message(f.log.max_offset(), 1).is_none());
        assert_eq!(f.queues.find("T", 0).expect("queue").max_offset_in_queue(), 2);
        Ok(())
    }

    #[test]
    fn transaction_markers_take_no_queue_offset() -> Result<()> {
        let dir = tempdir()?;
        let f = open(dir.path(), 64 * 1024)?;
        put(&f.log, b"x");
        let prepared = Message::new("T", 0, b"p".to_vec())
            .with_transaction(sys_flag::TRANSACTION_PREPARED_TYPE);
        let result = f.log.put_message(&prepared);
        assert_eq!(result.append_result.expect("appended").logics_offset, 0);
        assert_eq!(f.log.next_queue_offset("T", 0), 1);
        assert_eq!(put(&f.log, b"y").logics_offset, 1);
        Ok(())
    }

    #[test]
    fn oversized_topic_is_illegal_and_leaves_log_untouched() -> Result<()> {
        let dir = tempdir()?;
        let f = open(dir.path(), 64 * 1024)?;
        let topic = "t".repeat(MAX_TOPIC_LENGTH + 1);
        let result = f.log.put_message(&Message::new(topic, 0, b"a".to_vec()));
        assert_eq!(result.status, PutMessageStatus::MessageIllegal);
        assert_eq!(f.log.max_offset(), 0);
        Ok(())
    }

    #[test]
    fn roll_writes_blank_marker_and_starts_next_segment() -> Result<()> {
        let dir = tempdir()?;
        let f = open(dir.path(), 4096)?;
        let body = vec![b'x'; 900];
        let mut last = put(&f.log, &body);
        while last.wrote_offset < 4096 {
            last = put(&f.log, &body);
        }
        assert_eq!(last.wrote_offset, 4096);
        let tail = last.wrote_bytes as u64 * 4;
        let blank = f.log.get_data(tail).expect("blank");
        assert!(matches!(check_message_and_return_size(blank.as_slice(), true), RecordCheck::Blank));
        assert_eq!(f.log.roll_next_file(tail), 4096);

        let cq = f.queues.find("T", 0).expect("queue");
        assert_eq!(cq.entry_at(4).expect("entry").physical_offset, 4096);
        Ok(())
    }

    #[test]
    fn abnormal_recovery_truncates_corrupt_tail_and_resumes_without_gap() -> Result<()> {
        let dir = tempdir()?;
        let third = {
            let f = open(dir.path(), 64 * 1024)?;
            put(&f.log, b"one");
            put(&f.log, b"two");
            let third = put(&f.log, b"three");
            let file = f.log.queue.last_mapped_file().expect("segment");
            // flip a body byte so the crc no longer matches
            let body_at = third.wrote_offset as usize + 88;
            let byte = file.slice(body_at, 1).expect("byte")[0];
            file.write_at(body_at, &[byte ^ 0xff])?;
            f.log.flush()?;
            third
        };
        let f = open(dir.path(), 64 * 1024)?;
        f.queues.recover()?;
        assert_eq!(f.log.recover(false)?, third.wrote_offset);
        assert_eq!(f.log.recover(false)?, third.wrote_offset);
        f.queues.truncate_dirty(third.wrote_offset)?;
        assert_eq!(f.queues.find("T", 0).expect("queue").max_offset_in_queue(), 2);

        f.log.set_topic_queue_table(HashMap::from([(("T".to_string(), 0), 2)]));
        let next = put(&f.log, b"four");
        assert_eq!(next.wrote_offset, third.wrote_offset);
        assert_eq!(next.logics_offset, 2);
        Ok(())
    }

    #[test]
    fn append_data_rejects_gaps() -> Result<()> {
        let dir = tempdir()?;
        let f = open(dir.path(), 4096)?;
        assert!(f.log.append_data(0, &[1u8; 100])?);
        assert!(!f.log.append_data(50, &[1u8; 10])?);
        assert!(f.log.append_data(100, &[2u8; 10])?);
        assert_eq!(f.log.max_offset(), 110);
        Ok(())
    }
}
