//! Asynchronous fan-out from the commit log to consume queues and the index.
//!
//! Producers push requests onto the write side of a double buffer; the
//! dispatch thread swaps sides and applies the read side in order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::checkpoint::StoreCheckpoint;
use crate::consume_queue::ConsumeQueueTable;
use crate::flags::RunningFlags;
use crate::index::IndexService;
use crate::message::TransactionType;
use crate::service::ServiceThread;
use crate::stats::StoreStats;
use crate::{Error, Result};

const DISPATCH_POLL_INTERVAL: Duration = Duration::from_millis(100);
const PUT_ENTRY_RETRIES: usize = 5;
const PUT_ENTRY_RETRY_BACKOFF: Duration = Duration::from_millis(1000);

/// Everything needed to derive one consume-queue entry and the index keys of
/// one commit-log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub topic: String,
    pub queue_id: u32,
    pub commit_log_offset: u64,
    pub msg_size: u32,
    pub tags_code: i64,
    pub store_timestamp: u64,
    pub consume_queue_offset: u64,
    pub keys: String,
    pub uniq_key: Option<String>,
    pub sys_flag: i32,
    pub prepared_transaction_offset: u64,
}

impl DispatchRequest {
    pub fn transaction_type(&self) -> TransactionType {
        TransactionType::from_sys_flag(self.sys_flag)
    }
}

struct Shared {
    requests_write: Mutex<Vec<DispatchRequest>>,
    // Held from swap to apply so batches land in physical order even when a
    // stopping worker and an inline caller drain at the same time.
    dispatching: Mutex<()>,
    // Requests accepted but not yet applied.
    pending: AtomicUsize,
    queues: Arc<ConsumeQueueTable>,
    index: Option<Arc<IndexService>>,
    checkpoint: Arc<StoreCheckpoint>,
    flags: Arc<RunningFlags>,
    stats: Arc<StoreStats>,
    high_water: usize,
}

pub struct DispatchService {
    shared: Arc<Shared>,
    worker: Mutex<Option<ServiceThread>>,
}

impl DispatchService {
    pub fn new(
        queues: Arc<ConsumeQueueTable>,
        index: Option<Arc<IndexService>>,
        checkpoint: Arc<StoreCheckpoint>,
        flags: Arc<RunningFlags>,
        stats: Arc<StoreStats>,
        high_water: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                requests_write: Mutex::new(Vec::new()),
                dispatching: Mutex::new(()),
                pending: AtomicUsize::new(0),
                queues,
                index,
                checkpoint,
                flags,
                stats,
                high_water,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let worker = ServiceThread::spawn("dispatch-service", move |ctx| {
            let mut requests_read = Vec::new();
            while !ctx.is_stopped() {
                ctx.wait_for_running(DISPATCH_POLL_INTERVAL);
                shared.swap_and_dispatch(&mut requests_read);
            }
            // Drain whatever producers pushed before the stop.
            shared.swap_and_dispatch(&mut requests_read);
        })?;
        *self
            .worker
            .lock()
            .map_err(|_| Error::Corrupt("dispatch lock poisoned"))? = Some(worker);
        Ok(())
    }

    /// Queues `request`. Returns `true` when the backlog is above the high
    /// water mark and the producer should back off briefly.
    pub fn put_request(&self, request: DispatchRequest) -> bool {
        let size = match self.shared.requests_write.lock() {
            Ok(mut requests) => {
                requests.push(request);
                requests.len()
            }
            Err(_) => return false,
        };
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        self.shared.stats.record_dispatch_buffer(size as u64);
        if let Ok(worker) = self.worker.lock() {
            match worker.as_ref() {
                Some(worker) => worker.wakeup(),
                None => {
                    drop(worker);
                    let mut read = Vec::new();
                    self.shared.swap_and_dispatch(&mut read);
                }
            }
        }
        size > self.shared.high_water
    }

    pub fn has_remaining(&self) -> bool {
        self.shared.pending.load(Ordering::Acquire) > 0
    }

    /// Blocks until every queued request has been applied or `timeout`
    /// elapses. Returns `true` when drained.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while self.has_remaining() {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub fn shutdown(&self, grace: Duration) {
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            worker.shutdown(grace);
        }
        let mut read = Vec::new();
        self.shared.swap_and_dispatch(&mut read);
    }
}

impl Shared {
    fn swap_and_dispatch(&self, requests_read: &mut Vec<DispatchRequest>) {
        let Ok(_dispatching) = self.dispatching.lock() else {
            return;
        };
        match self.requests_write.lock() {
            Ok(mut requests) => std::mem::swap(&mut *requests, requests_read),
            Err(_) => return,
        }
        if requests_read.is_empty() {
            return;
        }
        let applied = requests_read.len();
        self.do_dispatch(requests_read);
        requests_read.clear();
        self.pending.fetch_sub(applied, Ordering::AcqRel);
    }

    fn do_dispatch(&self, requests: &[DispatchRequest]) {
        for request in requests {
            if request.transaction_type().is_dispatched() {
                self.put_message_position_info(request);
            }
        }
        if let Some(index) = &self.index {
            index.put_request(requests.to_vec());
        }
    }

    fn put_message_position_info(&self, request: &DispatchRequest) {
        let cq = self.queues.find_or_create(&request.topic, request.queue_id);
        for attempt in 0..PUT_ENTRY_RETRIES {
            match cq.put_entry(
                request.commit_log_offset,
                request.msg_size,
                request.tags_code,
                request.consume_queue_offset,
            ) {
                Ok(true) => {
                    self.checkpoint
                        .set_logics_msg_timestamp(request.store_timestamp);
                    return;
                }
                Ok(false) => log::warn!(
                    "put consume queue entry {}-{} at {} did not fit, retry {attempt}",
                    request.topic,
                    request.queue_id,
                    request.consume_queue_offset
                ),
                Err(err) => log::warn!(
                    "put consume queue entry {}-{} at {} failed: {err}, retry {attempt}",
                    request.topic,
                    request.queue_id,
                    request.consume_queue_offset
                ),
            }
            std::thread::sleep(PUT_ENTRY_RETRY_BACKOFF);
        }
        log::error!(
            "consume queue {}-{} cannot be written, marking logics queue error",
            request.topic,
            request.queue_id
        );
        self.flags.make_logics_queue_error();
    }
}
