//! Commit log flush services.
//!
//! `RealTimeFlush` is the asynchronous policy: a background loop flushes in
//! page batches and does a full flush on a longer interval. `GroupCommit` is
//! the synchronous policy: producers hand in the offset they need durable and
//! wait for one flush that covers every request queued alongside theirs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use crate::checkpoint::StoreCheckpoint;
use crate::mapped_file_queue::MappedFileQueue;
use crate::service::ServiceThread;
use crate::Result;

const GROUP_COMMIT_INTERVAL: Duration = Duration::from_millis(10);
const SHUTDOWN_FLUSH_RETRIES: usize = 10;

/// What a flush acts on, shared with the commit log.
#[derive(Clone)]
pub(crate) struct FlushTarget {
    pub(crate) queue: Arc<MappedFileQueue>,
    pub(crate) checkpoint: Arc<StoreCheckpoint>,
    // Store time of the newest appended record.
    pub(crate) last_store_timestamp: Arc<AtomicU64>,
}

impl FlushTarget {
    /// Flushes and advances the checkpoint. `least_pages == 0` flushes every
    /// written byte.
    pub(crate) fn flush(&self, least_pages: usize) -> Result<()> {
        let store_timestamp = self.last_store_timestamp.load(Ordering::Acquire);
        let max_offset = self.queue.max_offset();
        if least_pages == 0 {
            while !self.queue.flush(0)? {}
        } else {
            self.queue.flush(least_pages)?;
        }
        let flushed = self.queue.flushed_where();
        self.checkpoint.set_physic_offset(flushed);
        if flushed >= max_offset && store_timestamp > 0 {
            self.checkpoint.set_physic_msg_timestamp(store_timestamp);
        }
        Ok(())
    }

    fn flush_on_shutdown(&self) {
        for _ in 0..SHUTDOWN_FLUSH_RETRIES {
            match self.flush(0) {
                Ok(()) if self.queue.flushed_where() >= self.queue.max_offset() => return,
                Ok(()) => {}
                Err(err) => log::warn!("commit log flush at shutdown failed: {err}"),
            }
        }
    }
}

pub(crate) struct RealTimeFlush {
    worker: ServiceThread,
}

impl RealTimeFlush {
    pub(crate) fn start(
        target: FlushTarget,
        interval: Duration,
        least_pages: usize,
        thorough_interval: Duration,
    ) -> Result<Self> {
        let worker = ServiceThread::spawn("flush-commit-log", move |ctx| {
            let mut last_thorough = Instant::now();
            while !ctx.is_stopped() {
                ctx.wait_for_running(interval);
                let mut pages = least_pages;
                if last_thorough.elapsed() >= thorough_interval {
                    last_thorough = Instant::now();
                    pages = 0;
                }
                if let Err(err) = target.flush(pages) {
                    log::warn!("commit log flush failed: {err}");
                }
            }
            target.flush_on_shutdown();
        })?;
        Ok(Self { worker })
    }

    pub(crate) fn wakeup(&self) {
        self.worker.wakeup();
    }

    pub(crate) fn shutdown(&self, grace: Duration) {
        self.worker.shutdown(grace);
    }
}

struct GroupCommitRequest {
    next_offset: u64,
    reply: mpsc::SyncSender<bool>,
}

pub(crate) struct GroupCommit {
    requests_write: Arc<Mutex<Vec<GroupCommitRequest>>>,
    worker: ServiceThread,
}

impl GroupCommit {
    pub(crate) fn start(target: FlushTarget) -> Result<Self> {
        let requests_write = Arc::new(Mutex::new(Vec::new()));
        let requests = Arc::clone(&requests_write);
        let worker = ServiceThread::spawn("group-commit", move |ctx| {
            let mut requests_read = Vec::new();
            while !ctx.is_stopped() {
                ctx.wait_for_running(GROUP_COMMIT_INTERVAL);
                do_commit(&target, &requests, &mut requests_read);
            }
            // Requests that raced the stop still get an answer.
            std::thread::sleep(GROUP_COMMIT_INTERVAL);
            do_commit(&target, &requests, &mut requests_read);
            target.flush_on_shutdown();
        })?;
        Ok(Self {
            requests_write,
            worker,
        })
    }

    /// Waits until every byte below `next_offset` is durable. Returns `false`
    /// on timeout or flush failure.
    pub(crate) fn wait_for_flush(&self, next_offset: u64, timeout: Duration) -> bool {
        let (reply, response) = mpsc::sync_channel(1);
        match self.requests_write.lock() {
            Ok(mut requests) => requests.push(GroupCommitRequest { next_offset, reply }),
            Err(_) => return false,
        }
        self.worker.wakeup();
        response.recv_timeout(timeout).unwrap_or(false)
    }

    pub(crate) fn shutdown(&self, grace: Duration) {
        self.worker.shutdown(grace);
    }
}

fn do_commit(
    target: &FlushTarget,
    requests_write: &Mutex<Vec<GroupCommitRequest>>,
    requests_read: &mut Vec<GroupCommitRequest>,
) {
    if let Ok(mut requests) = requests_write.lock() {
        std::mem::swap(&mut *requests, requests_read);
    }
    if requests_read.is_empty() {
        if let Err(err) = target.flush(0) {
            log::warn!("group commit flush failed: {err}");
        }
        return;
    }
    for request in requests_read.drain(..) {
        // The record may straddle two segments.
        let mut flush_ok = target.queue.flushed_where() >= request.next_offset;
        for _ in 0..2 {
            if flush_ok {
                break;
            }
            if let Err(err) = target.flush(0) {
                log::warn!("group commit flush failed: {err}");
                break;
            }
            flush_ok = target.queue.flushed_where() >= request.next_offset;
        }
        if !flush_ok {
            log::warn!("group commit did not reach {}", request.next_offset);
        }
        let _ = request.reply.try_send(flush_ok);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn group_commit_flushes_past_requested_offset() -> Result<()> {
        let dir = tempdir()?;
        let queue = Arc::new(MappedFileQueue::new(dir.path().join("log"), 4096, None));
        let checkpoint = Arc::new(StoreCheckpoint::open(&dir.path().join("checkpoint"))?);
        let target = FlushTarget {
            queue: Arc::clone(&queue),
            checkpoint: Arc::clone(&checkpoint),
            last_store_timestamp: Arc::new(AtomicU64::new(42)),
        };
        queue.get_last_mapped_file(0)?.append(&[7u8; 100])?;

        let commit = GroupCommit::start(target)?;
        assert!(commit.wait_for_flush(100, Duration::from_secs(5)));
        commit.shutdown(Duration::from_secs(5));
        assert_eq!(queue.flushed_where(), 100);
        assert_eq!(checkpoint.physic_offset(), 100);
        assert_eq!(checkpoint.physic_msg_timestamp(), 42);
        Ok(())
    }

    #[test]
    fn wait_for_flush_times_out_without_a_worker() -> Result<()> {
        let dir = tempdir()?;
        let queue = Arc::new(MappedFileQueue::new(dir.path().join("log"), 4096, None));
        let target = FlushTarget {
            queue: Arc::clone(&queue),
            checkpoint: Arc::new(StoreCheckpoint::open(&dir.path().join("checkpoint"))?),
            last_store_timestamp: Arc::new(AtomicU64::new(0)),
        };
        queue.get_last_mapped_file(0)?.append(&[7u8; 64])?;

        let commit = GroupCommit::start(target)?;
        commit.shutdown(Duration::from_secs(5));
        let begin = Instant::now();
        assert!(!commit.wait_for_flush(64, Duration::from_millis(50)));
        assert!(begin.elapsed() >= Duration::from_millis(50));
        Ok(())
    }
}
