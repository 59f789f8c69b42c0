//! Retention of commit log segments, consume queue segments and index files.
//!
//! A pass runs when the daily delete window is open, when a disk is fuller
//! than the configured ratio, or while manual passes remain. Consume queues
//! and the index are always cut to the new physical floor before the commit
//! log segments below it are removed.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::commit_log::CommitLog;
use crate::config::StoreConfig;
use crate::consume_queue::ConsumeQueueTable;
use crate::flags::RunningFlags;
use crate::index::IndexService;
use crate::service::ServiceThread;
use crate::{Error, Result};

const MS_PER_HOUR: u64 = 60 * 60 * 1000;

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub commit_log_files: usize,
    pub consume_queue_files: usize,
    pub index_files: usize,
}

pub struct CleanService {
    config: Arc<StoreConfig>,
    commit_log: Arc<CommitLog>,
    queues: Arc<ConsumeQueueTable>,
    index: Option<Arc<IndexService>>,
    flags: Arc<RunningFlags>,
    manual_delete_passes: AtomicU32,
    clean_immediately: AtomicBool,
    // f64 bits; adjustable while running.
    warning_level_ratio: AtomicU64,
    // Commit log minimum the queues were last cleaned to.
    last_physical_min_offset: AtomicU64,
    worker: Mutex<Option<ServiceThread>>,
}

impl CleanService {
    pub fn new(
        config: Arc<StoreConfig>,
        commit_log: Arc<CommitLog>,
        queues: Arc<ConsumeQueueTable>,
        index: Option<Arc<IndexService>>,
        flags: Arc<RunningFlags>,
    ) -> Self {
        let warning_level_ratio = AtomicU64::new(config.disk_space_warning_level_ratio.to_bits());
        Self {
            config,
            commit_log,
            queues,
            index,
            flags,
            manual_delete_passes: AtomicU32::new(0),
            clean_immediately: AtomicBool::new(false),
            warning_level_ratio,
            last_physical_min_offset: AtomicU64::new(0),
            worker: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        let service = Arc::clone(self);
        let interval = Duration::from_millis(self.config.clean_resource_interval_ms);
        let worker = ServiceThread::spawn("clean-service", move |ctx| {
            while !ctx.is_stopped() {
                ctx.wait_for_running(interval);
                if ctx.is_stopped() {
                    break;
                }
                if let Err(err) = service.run_once() {
                    log::warn!("cleanup pass failed: {err}");
                }
            }
        })?;
        *self
            .worker
            .lock()
            .map_err(|_| Error::Corrupt("clean service lock poisoned"))? = Some(worker);
        Ok(())
    }

    pub fn shutdown(&self, grace: Duration) {
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            worker.shutdown(grace);
        }
    }

    /// Arms the configured number of passes that ignore the grace window and
    /// wakes the service.
    pub fn execute_delete_files_manually(&self) {
        let passes = self.config.max_manual_delete_passes;
        self.manual_delete_passes.store(passes, Ordering::Release);
        log::info!("execute delete files manually, {passes} passes");
        if let Ok(worker) = self.worker.lock() {
            if let Some(worker) = worker.as_ref() {
                worker.wakeup();
            }
        }
    }

    /// Disk usage above which writes are refused until a later pass sees the
    /// disk below it again.
    pub fn set_disk_space_warning_level_ratio(&self, ratio: f64) {
        log::info!("disk space warning level ratio set to {ratio}");
        self.warning_level_ratio.store(ratio.to_bits(), Ordering::Release);
    }

    pub fn disk_space_warning_level_ratio(&self) -> f64 {
        f64::from_bits(self.warning_level_ratio.load(Ordering::Acquire))
    }

    pub fn manual_delete_passes(&self) -> u32 {
        self.manual_delete_passes.load(Ordering::Acquire)
    }

    /// One cleanup pass: expired commit log segments first (cutting queues
    /// and index to the new floor), then queue segments left behind by an
    /// earlier commit log deletion.
    pub fn run_once(&self) -> Result<CleanReport> {
        let mut report = self.delete_expired_commit_log()?;
        let min_offset = self.commit_log.min_offset();
        if min_offset > self.last_physical_min_offset.load(Ordering::Acquire) {
            let (queue_files, index_files) = self.clean_queues_to(min_offset)?;
            report.consume_queue_files += queue_files;
            report.index_files += index_files;
        }
        Ok(report)
    }

    fn delete_expired_commit_log(&self) -> Result<CleanReport> {
        let time_up = self.is_time_to_delete();
        let space_full = self.is_space_to_delete();
        let manual = self
            .manual_delete_passes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if !(time_up || space_full || manual) {
            return Ok(CleanReport::default());
        }
        let clean_at_once =
            self.config.clean_file_forcibly_enable && self.clean_immediately.load(Ordering::Acquire);
        log::info!(
            "begin to delete expired commit log files, time up {time_up} space full {space_full} manual {manual} clean at once {clean_at_once}"
        );

        let expired_ms = self.config.file_reserved_time_hours.saturating_mul(MS_PER_HOUR);
        let doomed = self
            .commit_log
            .expired_files(expired_ms, clean_at_once || manual);
        let Some(last) = doomed.last() else {
            return Ok(CleanReport::default());
        };
        let floor = last.file_from_offset() + last.file_size() as u64;
        let (consume_queue_files, index_files) = self.clean_queues_to(floor)?;
        let interval = Duration::from_millis(self.config.delete_commit_log_files_interval_ms);
        let commit_log_files = self.commit_log.delete_files(&doomed, interval)?;
        if commit_log_files > 0 {
            log::info!("deleted {commit_log_files} commit log files below {floor}");
        }
        Ok(CleanReport {
            commit_log_files,
            consume_queue_files,
            index_files,
        })
    }

    /// Drops queue segments and index files wholly below `min_physical_offset`
    /// and moves every queue minimum to or past it.
    fn clean_queues_to(&self, min_physical_offset: u64) -> Result<(usize, usize)> {
        let interval = Duration::from_millis(self.config.delete_consume_queue_files_interval_ms);
        let mut queue_files = 0;
        for cq in self.queues.all() {
            let deleted = cq.delete_expired_segments(min_physical_offset)?;
            if deleted > 0 && !interval.is_zero() {
                std::thread::sleep(interval);
            }
            queue_files += deleted;
        }
        let index_files = match &self.index {
            Some(index) => index.delete_expired(min_physical_offset)?,
            None => 0,
        };
        self.last_physical_min_offset
            .fetch_max(min_physical_offset, Ordering::AcqRel);
        Ok((queue_files, index_files))
    }

    fn is_time_to_delete(&self) -> bool {
        let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
        let open = hour_matches(&self.config.delete_when, now.hour());
        if open {
            log::info!("it's time to reclaim disk space, {}", self.config.delete_when);
        }
        open
    }

    fn is_space_to_delete(&self) -> bool {
        let max_used = f64::from(self.config.disk_max_used_space_ratio.clamp(10, 95)) / 100.0;
        self.clean_immediately.store(false, Ordering::Release);

        let physic_ratio = disk_partition_space_used_percent(&self.config.store_path_commit_log());
        match physic_ratio {
            Some(ratio) if ratio > self.disk_space_warning_level_ratio() => {
                if self.flags.get_and_make_disk_full() {
                    log::error!("physic disk maybe full soon {ratio:.2}, so mark disk full");
                }
                self.clean_immediately.store(true, Ordering::Release);
            }
            Some(ratio) if ratio > self.config.disk_space_clean_forcibly_ratio => {
                self.clean_immediately.store(true, Ordering::Release);
            }
            _ => {
                if self.flags.get_and_make_disk_ok() {
                    log::info!("physic disk space OK, so mark disk ok");
                }
            }
        }
        if physic_ratio.map_or(true, |ratio| ratio > max_used) {
            log::info!("physic disk usage {physic_ratio:?} over {max_used}, reclaim");
            return true;
        }

        let logics_ratio = disk_partition_space_used_percent(&self.config.store_path_consume_queue());
        if logics_ratio.map_or(true, |ratio| ratio > max_used) {
            log::info!("logics disk usage {logics_ratio:?} over {max_used}, reclaim");
            return true;
        }
        false
    }
}

/// Whether `hour` is one of the `;`-separated hours in `delete_when`.
pub fn hour_matches(delete_when: &str, hour: u8) -> bool {
    delete_when
        .split(';')
        .filter_map(|h| h.trim().parse::<u8>().ok())
        .any(|h| h == hour)
}

/// Used fraction of the partition holding `path` (or its nearest existing
/// ancestor).
#[cfg(unix)]
pub fn disk_partition_space_used_percent(path: &Path) -> Option<f64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let existing = path.ancestors().find(|p| p.exists())?;
    let c_path = CString::new(existing.as_os_str().as_bytes()).ok()?;
    // SAFETY: statvfs is plain old data and fully written on success.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let frsize = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * frsize;
    let free = stat.f_bfree as u64 * frsize;
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(free) as f64 / total as f64)
}

#[cfg(not(unix))]
pub fn disk_partition_space_used_percent(_path: &Path) -> Option<f64> {
    None
}

/// Destroys queues whose newest entry lies below the commit log minimum.
/// Returns the number removed.
pub fn clean_expired_consume_queues(commit_log: &CommitLog, queues: &ConsumeQueueTable) -> Result<usize> {
    let min_commit_log_offset = commit_log.min_offset();
    let mut removed = 0;
    for cq in queues.all() {
        let Some(last) = cq.last_physical_offset() else {
            continue;
        };
        if last >= min_commit_log_offset {
            continue;
        }
        log::info!(
            "clean expired consume queue {}-{}, last offset {last} below commit log min {min_commit_log_offset}",
            cq.topic(),
            cq.queue_id()
        );
        queues.remove(cq.topic(), cq.queue_id());
        commit_log.remove_queue_from_topic_queue_table(cq.topic(), cq.queue_id());
        cq.destroy()?;
        removed += 1;
    }
    Ok(removed)
}

/// Destroys every queue of every topic not in `keep`. Returns the number of
/// topics removed.
pub fn clean_unused_topics(
    commit_log: &CommitLog,
    queues: &ConsumeQueueTable,
    keep: &HashSet<String>,
) -> Result<usize> {
    let mut removed = 0;
    for topic in queues.topics() {
        if keep.contains(&topic) {
            continue;
        }
        for cq in queues.remove_topic(&topic) {
            commit_log.remove_queue_from_topic_queue_table(&topic, cq.queue_id());
            cq.destroy()?;
        }
        log::info!("clean unused topic {topic}");
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn delete_window_accepts_hour_lists() {
        assert!(hour_matches("04", 4));
        assert!(hour_matches("03;04", 3));
        assert!(!hour_matches("03;04", 5));
        assert!(!hour_matches("", 0));
    }

    #[cfg(unix)]
    #[test]
    fn disk_usage_is_a_fraction_for_missing_leaf() {
        let dir = tempdir().expect("tempdir");
        let ratio = disk_partition_space_used_percent(&dir.path().join("not/yet/created"))
            .expect("statvfs");
        assert!((0.0..=1.0).contains(&ratio));
    }
}
