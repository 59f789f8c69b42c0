//! The message store: commit log, consume queues, key index and the services
//! that keep them in step.
//!
//! A master appends through [`MessageStore::put_message`] and dispatches each
//! record to its consume queue and the index right away. A slave takes raw
//! commit log bytes from its master and a reput loop dispatches them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::allocate::AllocateService;
use crate::checkpoint::StoreCheckpoint;
use crate::cleanup::{self, CleanReport, CleanService};
use crate::clock::{Clock, SystemClock};
use crate::commit_log::{CommitLog, PutMessageResult, PutMessageStatus};
use crate::config::{BrokerRole, StoreConfig};
use crate::consume_queue::{ConsumeQueue, ConsumeQueueTable, CQ_STORE_UNIT_SIZE};
use crate::dispatch::DispatchService;
use crate::filter::MessageFilter;
use crate::flags::RunningFlags;
use crate::ha::HaService;
use crate::index::IndexService;
use crate::mapped_file::SelectedBuffer;
use crate::message::{
    check_message_and_return_size, create_message_id, decode, read_u32, Message, MessageExt,
    RecordCheck, KEY_SEPARATOR,
};
use crate::service::ServiceThread;
use crate::stats::StoreStats;
use crate::{Error, Result};

/// Bytes of consume queue entries one pull may scan.
const MAX_FILTER_BYTES: usize = 16_000;
const QUERY_ROUNDS: usize = 3;
const REPUT_INTERVAL: Duration = Duration::from_millis(1);
const SHUTDOWN_FLUSH_RETRIES: usize = 3;
/// Rejections between two "store unavailable" warnings.
const REJECT_WARN_EVERY: u64 = 50_000;
const FALLBACK_PHYSICAL_MEMORY: u64 = 8 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMessageStatus {
    Found,
    NoMatchedMessage,
    NoMessageInQueue,
    NoMatchedLogicQueue,
    OffsetFoundNull,
    OffsetOverflowBadly,
    OffsetOverflowOne,
    OffsetTooSmall,
    MessageWasRemoving,
}

impl GetMessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GetMessageStatus::Found => "FOUND",
            GetMessageStatus::NoMatchedMessage => "NO_MATCHED_MESSAGE",
            GetMessageStatus::NoMessageInQueue => "NO_MESSAGE_IN_QUEUE",
            GetMessageStatus::NoMatchedLogicQueue => "NO_MATCHED_LOGIC_QUEUE",
            GetMessageStatus::OffsetFoundNull => "OFFSET_FOUND_NULL",
            GetMessageStatus::OffsetOverflowBadly => "OFFSET_OVERFLOW_BADLY",
            GetMessageStatus::OffsetOverflowOne => "OFFSET_OVERFLOW_ONE",
            GetMessageStatus::OffsetTooSmall => "OFFSET_TOO_SMALL",
            GetMessageStatus::MessageWasRemoving => "MESSAGE_WAS_REMOVING",
        }
    }
}

impl std::fmt::Display for GetMessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pull: the raw records plus where the consumer continues.
pub struct GetMessageResult {
    pub status: GetMessageStatus,
    pub messages: Vec<SelectedBuffer>,
    pub next_begin_offset: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    /// The pulled range is far behind the head and likely paged out.
    pub suggest_pulling_from_slave: bool,
    pub buffer_total_size: usize,
}

impl GetMessageResult {
    fn new(status: GetMessageStatus) -> Self {
        Self {
            status,
            messages: Vec::new(),
            next_begin_offset: 0,
            min_offset: 0,
            max_offset: 0,
            suggest_pulling_from_slave: false,
            buffer_total_size: 0,
        }
    }

    fn add(&mut self, buffer: SelectedBuffer) {
        self.buffer_total_size += buffer.len();
        self.messages.push(buffer);
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Decodes every returned record.
    pub fn decode_messages(&self) -> Result<Vec<MessageExt>> {
        self.messages
            .iter()
            .map(|buffer| decode(buffer.as_slice(), true))
            .collect()
    }
}

/// Records matching a key query, re-validated against topic and key.
#[derive(Default)]
pub struct QueryMessageResult {
    pub messages: Vec<SelectedBuffer>,
    pub index_last_update_timestamp: u64,
    pub index_last_update_phy_offset: u64,
    pub buffer_total_size: usize,
}

impl QueryMessageResult {
    fn add(&mut self, buffer: SelectedBuffer) {
        self.buffer_total_size += buffer.len();
        self.messages.push(buffer);
    }

    pub fn decode_messages(&self) -> Result<Vec<MessageExt>> {
        self.messages
            .iter()
            .map(|buffer| decode(buffer.as_slice(), true))
            .collect()
    }
}

pub struct MessageStore {
    config: Arc<StoreConfig>,
    checkpoint: Arc<StoreCheckpoint>,
    flags: Arc<RunningFlags>,
    stats: Arc<StoreStats>,
    allocator: Arc<AllocateService>,
    queues: Arc<ConsumeQueueTable>,
    index: Option<Arc<IndexService>>,
    dispatcher: Arc<DispatchService>,
    commit_log: Arc<CommitLog>,
    cleaner: Arc<CleanService>,
    ha: Arc<HaService>,
    queue_flusher: Mutex<Option<ServiceThread>>,
    reput: Mutex<Option<ServiceThread>>,
    // Next commit log byte the slave reput loop dispatches.
    reput_from_offset: Arc<AtomicU64>,
    running: AtomicBool,
    reject_count: AtomicU64,
    total_physical_memory: u64,
}

impl MessageStore {
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Opens the store with `clock` stamping appended records.
    pub fn open_with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.store_path_root_dir)?;
        let config = Arc::new(config);
        let checkpoint = Arc::new(StoreCheckpoint::open(&config.checkpoint_path())?);
        let flags = Arc::new(RunningFlags::new());
        let stats = Arc::new(StoreStats::new());
        let queues = Arc::new(ConsumeQueueTable::new(
            config.store_path_consume_queue(),
            config.mapped_file_size_consume_queue(),
        ));
        let index = config.message_index_enable.then(|| {
            Arc::new(IndexService::new(
                config.store_path_index(),
                config.max_hash_slot_num,
                config.max_index_num,
                Arc::clone(&checkpoint),
                Arc::clone(&flags),
            ))
        });
        let dispatcher = Arc::new(DispatchService::new(
            Arc::clone(&queues),
            index.clone(),
            Arc::clone(&checkpoint),
            Arc::clone(&flags),
            Arc::clone(&stats),
            config.put_msg_index_high_water,
        ));
        let allocator = AllocateService::start()?;
        let commit_log = Arc::new(CommitLog::new(
            Arc::clone(&config),
            Some(Arc::clone(&allocator)),
            clock,
            Arc::clone(&checkpoint),
            Arc::clone(&flags),
            Arc::clone(&stats),
            Arc::clone(&dispatcher),
        )?);
        let cleaner = Arc::new(CleanService::new(
            Arc::clone(&config),
            Arc::clone(&commit_log),
            Arc::clone(&queues),
            index.clone(),
            Arc::clone(&flags),
        ));
        let ha = Arc::new(HaService::new(Arc::clone(&config), Arc::clone(&commit_log)));
        Ok(Self {
            config,
            checkpoint,
            flags,
            stats,
            allocator,
            queues,
            index,
            dispatcher,
            commit_log,
            cleaner,
            ha,
            queue_flusher: Mutex::new(None),
            reput: Mutex::new(None),
            reput_from_offset: Arc::new(AtomicU64::new(0)),
            running: AtomicBool::new(false),
            reject_count: AtomicU64::new(0),
            total_physical_memory: total_physical_memory_size(),
        })
    }

    /// Maps existing files and recovers. A leftover abort file means the
    /// previous process did not shut down cleanly.
    pub fn load(&self) -> Result<()> {
        let last_exit_ok = !self.config.abort_file_path().exists();
        log::info!(
            "last shutdown {}",
            if last_exit_ok { "normally" } else { "abnormally" }
        );
        self.commit_log.load()?;
        self.queues.load()?;
        if let Some(index) = &self.index {
            index.load(last_exit_ok)?;
        }
        self.recover(last_exit_ok)
    }

    fn recover(&self, last_exit_ok: bool) -> Result<()> {
        self.queues.recover()?;
        let end = self.commit_log.recover(last_exit_ok)?;
        if self.queues.max_physic_offset() >= end as i64 {
            log::info!("truncate consume queues past recovered commit log end {end}");
        }
        self.queues.truncate_dirty(end)?;

        let table: HashMap<(String, u32), u64> = self
            .queues
            .all()
            .into_iter()
            .map(|cq| ((cq.topic().to_string(), cq.queue_id()), cq.max_offset_in_queue()))
            .collect();
        self.commit_log.set_topic_queue_table(table);
        self.queues.correct_min_offsets(self.commit_log.min_offset());
        self.reput_from_offset.store(end, Ordering::Release);
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        std::fs::File::create(self.config.abort_file_path())?;
        self.dispatcher.start()?;
        if let Some(index) = &self.index {
            index.start()?;
        }
        self.commit_log.start()?;
        self.start_queue_flusher()?;
        self.cleaner.start()?;
        if self.config.broker_role == BrokerRole::Slave {
            self.start_reput()?;
        }
        self.ha.start()?;
        self.running.store(true, Ordering::Release);
        log::info!("message store started as {:?}", self.config.broker_role);
        Ok(())
    }

    fn start_queue_flusher(&self) -> Result<()> {
        let queues = Arc::clone(&self.queues);
        let checkpoint = Arc::clone(&self.checkpoint);
        let interval = Duration::from_millis(self.config.flush_interval_consume_queue_ms);
        let thorough = Duration::from_millis(self.config.flush_consume_queue_thorough_interval_ms);
        let least_pages = self.config.flush_consume_queue_least_pages;
        let worker = ServiceThread::spawn("flush-consume-queue", move |ctx| {
            let mut last_thorough = Instant::now();
            while !ctx.is_stopped() {
                ctx.wait_for_running(interval);
                let mut pages = least_pages;
                if last_thorough.elapsed() >= thorough {
                    last_thorough = Instant::now();
                    pages = 0;
                }
                if let Err(err) = flush_queues(&queues, &checkpoint, pages) {
                    log::warn!("consume queue flush failed: {err}");
                }
            }
            for _ in 0..SHUTDOWN_FLUSH_RETRIES {
                match flush_queues(&queues, &checkpoint, 0) {
                    Ok(()) => break,
                    Err(err) => log::warn!("consume queue flush at shutdown failed: {err}"),
                }
            }
        })?;
        *self
            .queue_flusher
            .lock()
            .map_err(|_| Error::Corrupt("queue flusher lock poisoned"))? = Some(worker);
        Ok(())
    }

    fn start_reput(&self) -> Result<()> {
        let commit_log = Arc::clone(&self.commit_log);
        let dispatcher = Arc::clone(&self.dispatcher);
        let from = Arc::clone(&self.reput_from_offset);
        log::info!("reput starts at {}", from.load(Ordering::Acquire));
        let worker = ServiceThread::spawn("reput-service", move |ctx| {
            while !ctx.is_stopped() {
                ctx.wait_for_running(REPUT_INTERVAL);
                do_reput(&commit_log, &dispatcher, &from);
            }
            do_reput(&commit_log, &dispatcher, &from);
        })?;
        *self
            .reput
            .lock()
            .map_err(|_| Error::Corrupt("reput lock poisoned"))? = Some(worker);
        Ok(())
    }

    /// Stops every service, waiting for dispatch and flushes to drain. The
    /// abort file is removed only when nothing was left undispatched.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            self.allocator.shutdown();
            return;
        }
        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        self.ha.shutdown(grace);
        self.cleaner.shutdown(grace);
        if let Some(reput) = self.reput.lock().ok().and_then(|mut r| r.take()) {
            reput.shutdown(grace);
        }
        if !self.dispatcher.wait_drained(grace) {
            log::warn!("dispatch still has pending requests at shutdown");
        }
        self.dispatcher.shutdown(grace);
        if let Some(index) = &self.index {
            index.shutdown(grace);
        }
        if let Some(flusher) = self.queue_flusher.lock().ok().and_then(|mut f| f.take()) {
            flusher.shutdown(grace);
        }
        self.commit_log.shutdown(grace);
        self.allocator.shutdown();
        if let Err(err) = self.checkpoint.shutdown() {
            log::error!("checkpoint flush at shutdown failed: {err}");
        }
        if self.dispatcher.has_remaining() {
            log::warn!("keep abort file, dispatch did not finish");
            return;
        }
        if let Err(err) = std::fs::remove_file(self.config.abort_file_path()) {
            log::warn!("remove abort file failed: {err}");
        }
        log::info!("message store shutdown");
    }

    /// Deletes every file of the store. Call after [`shutdown`](Self::shutdown).
    pub fn destroy(&self) -> Result<()> {
        self.queues.destroy()?;
        self.commit_log.destroy()?;
        if let Some(index) = &self.index {
            index.destroy()?;
        }
        for path in [self.config.abort_file_path(), self.config.checkpoint_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn reject(&self, reason: &str) -> PutMessageResult {
        let count = self.reject_count.fetch_add(1, Ordering::Relaxed);
        if count % REJECT_WARN_EVERY == 0 {
            log::warn!("put message rejected: {reason}, flags {:#x}", self.flags.flag_bits());
        }
        PutMessageResult::failed(PutMessageStatus::ServiceNotAvailable)
    }

    pub fn put_message(&self, msg: &Message) -> PutMessageResult {
        if !self.running.load(Ordering::Acquire) {
            return self.reject("message store has shutdown");
        }
        if self.config.broker_role == BrokerRole::Slave {
            return self.reject("message store is a slave");
        }
        if !self.flags.is_writeable() {
            return self.reject("message store is not writeable");
        }
        if self.commit_log.is_os_page_cache_busy() {
            return PutMessageResult::failed(PutMessageStatus::OsPageCacheBusy);
        }

        let begin = Instant::now();
        let mut result = self.commit_log.put_message(msg);
        self.stats
            .record_put_elapsed(begin.elapsed().as_millis() as u64);
        let Some(append) = result.append_result.as_ref() else {
            self.stats.record_put_failed();
            return result;
        };
        self.ha.notify_new_data();
        if self.config.broker_role == BrokerRole::SyncMaster {
            let next_offset = append.wrote_offset + append.wrote_bytes as u64;
            if !self.ha.is_slave_ok(next_offset) {
                result.status = PutMessageStatus::SlaveNotAvailable;
            } else if !self
                .ha
                .wait_for_slave_ack(next_offset, Duration::from_millis(self.config.sync_flush_timeout_ms))
            {
                log::error!(
                    "slave ack timeout, topic {} queue {} offset {next_offset}",
                    msg.topic,
                    msg.queue_id
                );
                result.status = PutMessageStatus::FlushSlaveTimeout;
            }
        }
        result
    }

    fn check_readable(&self) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::NotAvailable("message store has shutdown"));
        }
        if !self.flags.is_readable() {
            return Err(Error::NotAvailable("message store is not readable"));
        }
        Ok(())
    }

    fn is_in_disk(&self, max_offset_py: u64, offset_py: u64) -> bool {
        let memory = self.total_physical_memory
            * u64::from(self.config.access_message_in_memory_max_ratio)
            / 100;
        max_offset_py.saturating_sub(offset_py) > memory
    }

    fn is_the_batch_full(
        &self,
        size_py: usize,
        max_msg_nums: usize,
        buffer_total: usize,
        message_total: usize,
        in_disk: bool,
    ) -> bool {
        if buffer_total == 0 || message_total == 0 {
            return false;
        }
        if message_total >= max_msg_nums {
            return true;
        }
        let (max_bytes, max_count) = if in_disk {
            (
                self.config.max_transfer_bytes_on_message_in_disk,
                self.config.max_transfer_count_on_message_in_disk,
            )
        } else {
            (
                self.config.max_transfer_bytes_on_message_in_memory,
                self.config.max_transfer_count_on_message_in_memory,
            )
        };
        buffer_total + size_py > max_bytes || message_total + 1 > max_count
    }

    /// Pulls up to `max_msg_nums` records of a queue starting at queue offset
    /// `offset`.
    pub fn get_message(
        &self,
        topic: &str,
        queue_id: u32,
        offset: u64,
        max_msg_nums: usize,
        filter: &dyn MessageFilter,
    ) -> Result<GetMessageResult> {
        self.check_readable()?;
        let begin = Instant::now();
        let max_offset_py = self.commit_log.max_offset();

        let Some(cq) = self.queues.find(topic, queue_id) else {
            let result = GetMessageResult::new(GetMessageStatus::NoMatchedLogicQueue);
            self.stats
                .record_get(false, 0, begin.elapsed().as_millis() as u64);
            return Ok(result);
        };
        let min_offset = cq.min_offset_in_queue();
        let max_offset = cq.max_offset_in_queue();
        let mut result = if max_offset == 0 {
            GetMessageResult::new(GetMessageStatus::NoMessageInQueue)
        } else if offset < min_offset {
            let mut r = GetMessageResult::new(GetMessageStatus::OffsetTooSmall);
            r.next_begin_offset = min_offset;
            r
        } else if offset == max_offset {
            let mut r = GetMessageResult::new(GetMessageStatus::OffsetOverflowOne);
            r.next_begin_offset = offset;
            r
        } else if offset > max_offset {
            let mut r = GetMessageResult::new(GetMessageStatus::OffsetOverflowBadly);
            r.next_begin_offset = if min_offset == 0 { min_offset } else { max_offset };
            r
        } else {
            self.read_queue(&cq, offset, max_msg_nums, filter, max_offset_py)
        };
        result.min_offset = min_offset;
        result.max_offset = max_offset;
        self.stats.record_get(
            result.status == GetMessageStatus::Found,
            result.message_count() as u64,
            begin.elapsed().as_millis() as u64,
        );
        Ok(result)
    }

    fn read_queue(
        &self,
        cq: &ConsumeQueue,
        offset: u64,
        max_msg_nums: usize,
        filter: &dyn MessageFilter,
        max_offset_py: u64,
    ) -> GetMessageResult {
        let Some(entries) = cq.index_buffer(offset) else {
            let mut result = GetMessageResult::new(GetMessageStatus::OffsetFoundNull);
            result.next_begin_offset = cq.roll_next_file(offset);
            log::warn!(
                "consume queue {}-{} has no entry at {offset}, roll to {}",
                cq.topic(),
                cq.queue_id(),
                result.next_begin_offset
            );
            return result;
        };
        let mut result = GetMessageResult::new(GetMessageStatus::NoMatchedMessage);
        let max_filter_bytes = MAX_FILTER_BYTES.max(max_msg_nums.saturating_mul(CQ_STORE_UNIT_SIZE));
        let bytes = entries.as_slice();
        let mut next_phy_file_start: Option<u64> = None;
        let mut max_phy_offset_pulling = 0u64;
        let mut i = 0usize;
        while i + CQ_STORE_UNIT_SIZE <= bytes.len() && i < max_filter_bytes {
            let Some(entry) = crate::consume_queue::CqEntry::decode(&bytes[i..]) else {
                break;
            };
            let (offset_py, size_py) = (entry.physical_offset, entry.size as usize);
            max_phy_offset_pulling = offset_py;
            if next_phy_file_start.is_some_and(|start| offset_py < start) {
                i += CQ_STORE_UNIT_SIZE;
                continue;
            }
            let in_disk = self.is_in_disk(max_offset_py, offset_py);
            if self.is_the_batch_full(
                size_py,
                max_msg_nums,
                result.buffer_total_size,
                result.message_count(),
                in_disk,
            ) {
                break;
            }
            i += CQ_STORE_UNIT_SIZE;

            if !filter.is_matched_by_consume_queue(entry.tags_code) {
                continue;
            }
            let Some(buffer) = self.commit_log.get_message(offset_py, size_py) else {
                if result.buffer_total_size == 0 {
                    result.status = GetMessageStatus::MessageWasRemoving;
                }
                next_phy_file_start = Some(self.commit_log.roll_next_file(offset_py));
                continue;
            };
            if filter.needs_commit_log() {
                let matched = decode(buffer.as_slice(), true)
                    .map(|msg| filter.is_matched_by_commit_log(&msg))
                    .unwrap_or(false);
                if !matched {
                    continue;
                }
            }
            result.add(buffer);
            result.status = GetMessageStatus::Found;
            next_phy_file_start = None;
        }
        result.next_begin_offset = offset + (i / CQ_STORE_UNIT_SIZE) as u64;
        let memory = self.total_physical_memory
            * u64::from(self.config.access_message_in_memory_max_ratio)
            / 100;
        result.suggest_pulling_from_slave =
            max_offset_py.saturating_sub(max_phy_offset_pulling) > memory;
        result
    }

    pub fn get_max_offset_in_queue(&self, topic: &str, queue_id: u32) -> u64 {
        self.queues
            .find(topic, queue_id)
            .map(|cq| cq.max_offset_in_queue())
            .unwrap_or(0)
    }

    pub fn get_min_offset_in_queue(&self, topic: &str, queue_id: u32) -> u64 {
        self.queues
            .find(topic, queue_id)
            .map(|cq| cq.min_offset_in_queue())
            .unwrap_or(0)
    }

    pub fn get_message_total_in_queue(&self, topic: &str, queue_id: u32) -> u64 {
        self.queues
            .find(topic, queue_id)
            .map(|cq| cq.message_total_in_queue())
            .unwrap_or(0)
    }

    /// Commit log offset of the record at queue offset `consume_offset`.
    pub fn get_commit_log_offset_in_queue(&self, topic: &str, queue_id: u32, consume_offset: u64) -> u64 {
        self.queues
            .find(topic, queue_id)
            .and_then(|cq| cq.entry_at(consume_offset))
            .map(|entry| entry.physical_offset)
            .unwrap_or(0)
    }

    /// Queue offset whose store time is closest to `timestamp`.
    pub fn get_offset_in_queue_by_time(&self, topic: &str, queue_id: u32, timestamp: u64) -> u64 {
        let Some(cq) = self.queues.find(topic, queue_id) else {
            return 0;
        };
        cq.offset_for_timestamp(timestamp, self.commit_log.min_offset(), |offset, size| {
            self.commit_log.pickup_store_timestamp(offset, size as usize)
        })
    }

    pub fn get_message_store_timestamp(&self, topic: &str, queue_id: u32, consume_offset: u64) -> Option<u64> {
        let entry = self.queues.find(topic, queue_id)?.entry_at(consume_offset)?;
        self.commit_log
            .pickup_store_timestamp(entry.physical_offset, entry.size as usize)
    }

    /// Store time of the oldest live record of a queue.
    pub fn get_earliest_message_time(&self, topic: &str, queue_id: u32) -> Option<u64> {
        let cq = self.queues.find(topic, queue_id)?;
        self.get_message_store_timestamp(topic, queue_id, cq.min_offset_in_queue())
    }

    /// Store time of the oldest record in the commit log.
    pub fn earliest_message_time(&self) -> Option<u64> {
        let min = self.commit_log.min_offset();
        let size = read_u32(self.commit_log.get_message(min, 4)?.as_slice(), 0)?;
        self.commit_log.pickup_store_timestamp(min, size as usize)
    }

    /// Whether the record at `consume_offset` is likely paged out.
    pub fn check_in_disk_by_consume_offset(&self, topic: &str, queue_id: u32, consume_offset: u64) -> bool {
        match self.queues.find(topic, queue_id).and_then(|cq| cq.entry_at(consume_offset)) {
            Some(entry) => self.is_in_disk(self.commit_log.max_offset(), entry.physical_offset),
            None => false,
        }
    }

    /// The record starting at `commit_log_offset`, sized from its header.
    pub fn select_one_message_by_offset(&self, commit_log_offset: u64) -> Option<SelectedBuffer> {
        let head = self.commit_log.get_message(commit_log_offset, 4)?;
        let size = read_u32(head.as_slice(), 0)? as usize;
        self.commit_log.get_message(commit_log_offset, size)
    }

    pub fn select_one_message_by_offset_and_size(
        &self,
        commit_log_offset: u64,
        size: usize,
    ) -> Option<SelectedBuffer> {
        self.commit_log.get_message(commit_log_offset, size)
    }

    pub fn look_message_by_offset(&self, commit_log_offset: u64) -> Option<MessageExt> {
        let buffer = self.select_one_message_by_offset(commit_log_offset)?;
        match decode(buffer.as_slice(), true) {
            Ok(msg) => Some(msg),
            Err(err) => {
                log::warn!("decode record at {commit_log_offset} failed: {err}");
                None
            }
        }
    }

    /// Records of `topic` whose keys contain `key`, stored within
    /// `[begin, end]`. Index candidates are checked against the record since
    /// key hashes collide.
    pub fn query_message(&self, topic: &str, key: &str, max_num: usize, begin: u64, end: u64) -> QueryMessageResult {
        let mut result = QueryMessageResult::default();
        let Some(index) = &self.index else {
            return result;
        };
        let mut last_query_msg_time = end;
        for _ in 0..QUERY_ROUNDS {
            let mut found = index.query_offset(topic, key, max_num, begin, last_query_msg_time);
            if found.phy_offsets.is_empty() {
                break;
            }
            found.phy_offsets.sort_unstable();
            result.index_last_update_timestamp = found.index_last_update_timestamp;
            result.index_last_update_phy_offset = found.index_last_update_phy_offset;

            for (n, &offset) in found.phy_offsets.iter().enumerate() {
                let Some(msg) = self.look_message_by_offset(offset) else {
                    continue;
                };
                if n == 0 {
                    last_query_msg_time = msg.store_timestamp;
                }
                let key_matches = msg
                    .keys()
                    .is_some_and(|keys| keys.split(KEY_SEPARATOR).any(|k| k == key))
                    || msg
                        .properties
                        .get(crate::message::PROPERTY_UNIQ_KEY)
                        .is_some_and(|uniq| uniq == key);
                if msg.topic != topic || !key_matches {
                    continue;
                }
                if let Some(buffer) = self.select_one_message_by_offset(offset) {
                    result.add(buffer);
                }
            }
            if result.buffer_total_size > 0 || last_query_msg_time < begin {
                break;
            }
        }
        result
    }

    /// Message ids of the records at queue offsets `[min, max)`, mapped to
    /// their queue offsets.
    pub fn get_message_ids(
        &self,
        topic: &str,
        queue_id: u32,
        min_offset: u64,
        max_offset: u64,
        store_host: SocketAddrV4,
    ) -> BTreeMap<String, u64> {
        let mut ids = BTreeMap::new();
        let Some(cq) = self.queues.find(topic, queue_id) else {
            return ids;
        };
        let start = min_offset.max(cq.min_offset_in_queue());
        let end = max_offset.min(cq.max_offset_in_queue());
        for queue_offset in start..end {
            if let Some(entry) = cq.entry_at(queue_offset) {
                ids.insert(create_message_id(store_host, entry.physical_offset), queue_offset);
            }
        }
        ids
    }

    /// Raw commit log bytes from `offset` to the end of its segment.
    pub fn get_commit_log_data(&self, offset: u64) -> Option<SelectedBuffer> {
        if !self.running.load(Ordering::Acquire) {
            log::warn!("message store has shutdown, get commit log data rejected");
            return None;
        }
        self.commit_log.get_data(offset)
    }

    /// Appends raw bytes that must start exactly at the end of the local log.
    pub fn append_to_commit_log(&self, start_offset: u64, data: &[u8]) -> Result<bool> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::NotAvailable("message store has shutdown"));
        }
        let appended = self.commit_log.append_data(start_offset, data)?;
        if appended {
            if let Ok(reput) = self.reput.lock() {
                if let Some(reput) = reput.as_ref() {
                    reput.wakeup();
                }
            }
        } else {
            log::error!("append to commit log at {start_offset} rejected");
        }
        Ok(appended)
    }

    pub fn execute_delete_files_manually(&self) {
        self.cleaner.execute_delete_files_manually();
    }

    pub fn set_disk_space_warning_level_ratio(&self, ratio: f64) {
        self.cleaner.set_disk_space_warning_level_ratio(ratio);
    }

    /// One cleanup pass on the caller's thread.
    pub fn clean_once(&self) -> Result<CleanReport> {
        self.cleaner.run_once()
    }

    pub fn clean_expired_consume_queues(&self) -> Result<usize> {
        cleanup::clean_expired_consume_queues(&self.commit_log, &self.queues)
    }

    pub fn clean_unused_topics(&self, keep: &HashSet<String>) -> Result<usize> {
        cleanup::clean_unused_topics(&self.commit_log, &self.queues, keep)
    }

    pub fn truncate_dirty_logic_files(&self, physical_offset: u64) -> Result<()> {
        self.queues.truncate_dirty(physical_offset)
    }

    pub fn update_ha_master_address(&self, address: &str) {
        self.ha.update_master_address(address);
    }

    pub fn slave_fall_behind_much(&self) -> u64 {
        self.ha.slave_fall_behind_much()
    }

    pub fn ha_service(&self) -> &HaService {
        &self.ha
    }

    pub fn max_physical_offset(&self) -> u64 {
        self.commit_log.max_offset()
    }

    pub fn min_physical_offset(&self) -> u64 {
        self.commit_log.min_offset()
    }

    /// Commit log bytes known to be on disk.
    pub fn flushed_physical_offset(&self) -> u64 {
        self.commit_log.flushed_where()
    }

    /// Commit log bytes not yet dispatched by the slave reput loop.
    pub fn dispatch_behind_bytes(&self) -> u64 {
        if self.config.broker_role != BrokerRole::Slave {
            return 0;
        }
        self.commit_log
            .max_offset()
            .saturating_sub(self.reput_from_offset.load(Ordering::Acquire))
    }

    /// Blocks until every accepted record reached its consume queue, or
    /// `timeout` passes.
    pub fn wait_dispatch_drained(&self, timeout: Duration) -> bool {
        self.dispatcher.wait_drained(timeout)
    }

    pub fn is_os_page_cache_busy(&self) -> bool {
        self.commit_log.is_os_page_cache_busy()
    }

    pub fn running_flags(&self) -> &RunningFlags {
        &self.flags
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn runtime_info(&self) -> BTreeMap<String, String> {
        let mut info = self.stats.runtime_info();
        let mut put = |key: &str, value: String| {
            info.insert(key.to_string(), value);
        };
        put("commitLogMinOffset", self.min_physical_offset().to_string());
        put("commitLogMaxOffset", self.max_physical_offset().to_string());
        put("commitLogFlushedOffset", self.flushed_physical_offset().to_string());
        put("dispatchBehindBytes", self.dispatch_behind_bytes().to_string());
        put("segmentAllocateErrors", self.allocator.error_count().to_string());
        put("pageCacheLockTimeMills", self.commit_log.lock_time_millis().to_string());
        put("runningFlags", format!("{:#x}", self.flags.flag_bits()));
        put("brokerRole", format!("{:?}", self.config.broker_role));
        if let Some(ratio) =
            cleanup::disk_partition_space_used_percent(&self.config.store_path_commit_log())
        {
            put("commitLogDiskRatio", format!("{ratio:.4}"));
        }
        if let Some(earliest) = self.earliest_message_time() {
            put("earliestMessageTimeStamp", earliest.to_string());
        }
        if self.config.broker_role != BrokerRole::Slave {
            put("slaveFallBehindMuch", self.slave_fall_behind_much().to_string());
        }
        info
    }
}

impl Drop for MessageStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn flush_queues(queues: &ConsumeQueueTable, checkpoint: &StoreCheckpoint, least_pages: usize) -> Result<()> {
    let logics_ts = checkpoint.logics_msg_timestamp();
    queues.flush(least_pages)?;
    if least_pages == 0 {
        if logics_ts > 0 {
            checkpoint.set_logics_msg_timestamp(logics_ts);
        }
        checkpoint.flush()?;
    }
    Ok(())
}

/// Dispatches replicated records from `from` up to the local log end. A
/// partially replicated record at the end is left for the next pass.
fn do_reput(commit_log: &CommitLog, dispatcher: &DispatchService, from: &AtomicU64) {
    loop {
        let offset = from.load(Ordering::Acquire);
        if offset >= commit_log.max_offset() {
            return;
        }
        let offset = offset.max(commit_log.min_offset());
        let Some(data) = commit_log.get_data(offset) else {
            return;
        };
        let bytes = data.as_slice();
        let mut pos = 0usize;
        while pos < bytes.len() {
            match check_message_and_return_size(&bytes[pos..], false) {
                RecordCheck::Valid(request) => {
                    pos += request.msg_size as usize;
                    dispatcher.put_request(request);
                    from.store(offset + pos as u64, Ordering::Release);
                }
                RecordCheck::Blank => {
                    from.store(commit_log.roll_next_file(offset + pos as u64), Ordering::Release);
                    break;
                }
                RecordCheck::Invalid => return,
            }
        }
    }
}

#[cfg(unix)]
fn total_physical_memory_size() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let (pages, page_size) = unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
    if pages <= 0 || page_size <= 0 {
        return FALLBACK_PHYSICAL_MEMORY;
    }
    pages as u64 * page_size as u64
}

#[cfg(not(unix))]
fn total_physical_memory_size() -> u64 {
    FALLBACK_PHYSICAL_MEMORY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::TagFilter;
    use tempfile::tempdir;

    fn small_config(root: &std::path::Path) -> StoreConfig {
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

    #[test]
    fn batch_limits_use_memory_ceilings_for_recent_data() -> Result<()> {
        let dir = tempdir()?;
        let store = MessageStore::open(small_config(dir.path()))?;
        assert!(!store.is_the_batch_full(100, 32, 0, 0, false));
        assert!(store.is_the_batch_full(100, 2, 200, 2, false));
        assert!(store.is_the_batch_full(100, 64, 200, 32, false));
        assert!(!store.is_the_batch_full(100, 64, 200, 8, false));
        assert!(store.is_the_batch_full(100, 64, 200, 8, true));
        Ok(())
    }

    #[test]
    fn tag_filter_skips_unmatched_entries_but_advances() -> Result<()> {
        let dir = tempdir()?;
        let store = MessageStore::open(small_config(dir.path()))?;
        store.load()?;
        store.start()?;
        for (i, tag) in ["A", "B", "A", "B"].iter().enumerate() {
            let msg = Message::new("T", 0, format!("m{i}")).with_tags(*tag);
            assert_eq!(store.put_message(&msg).status, PutMessageStatus::PutOk);
        }
        store.dispatcher.wait_drained(Duration::from_secs(5));

        let result = store.get_message("T", 0, 0, 10, &TagFilter::parse("B"))?;
        assert_eq!(result.status, GetMessageStatus::Found);
        assert_eq!(result.next_begin_offset, 4);
        let bodies: Vec<Vec<u8>> = result.decode_messages()?.into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec![b"m1".to_vec(), b"m3".to_vec()]);

        let none = store.get_message("T", 0, 0, 10, &TagFilter::parse("C"))?;
        assert_eq!(none.status, GetMessageStatus::NoMatchedMessage);
        assert_eq!(none.next_begin_offset, 4);

        let missing = store.get_message("U", 0, 0, 10, &TagFilter::all())?;
        assert_eq!(missing.status, GetMessageStatus::NoMatchedLogicQueue);
        store.shutdown();
        Ok(())
    }

    #[test]
    fn put_before_start_is_not_available() -> Result<()> {
        let dir = tempdir()?;
        let store = MessageStore::open(small_config(dir.path()))?;
        store.load()?;
        let result = store.put_message(&Message::new("T", 0, "x"));
        assert_eq!(result.status, PutMessageStatus::ServiceNotAvailable);
        assert!(store.get_message("T", 0, 0, 1, &TagFilter::all()).is_err());
        Ok(())
    }
}
