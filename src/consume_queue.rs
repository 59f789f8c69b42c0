//! Per (topic, queue id) logical queue of fixed-size entries pointing into the
//! commit log.
//!
//! Entry `n` sits at byte `n * CQ_STORE_UNIT_SIZE` of the queue's stream:
//! physical offset (u64), record size (u32), tag hash (i64), little-endian.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::mapped_file::{MappedFile, SelectedBuffer};
use crate::mapped_file_queue::MappedFileQueue;
use crate::message::{read_u32, read_u64};
use crate::{Error, Result};

pub const CQ_STORE_UNIT_SIZE: usize = 20;

/// Recovery starts this many segments from the end.
const RECOVER_FROM_LAST_FILES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqEntry {
    pub physical_offset: u64,
    pub size: u32,
    pub tags_code: i64,
}

impl CqEntry {
    /// Decodes the entry at the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        Some(Self {
            physical_offset: read_u64(bytes, 0)?,
            size: read_u32(bytes, 8)?,
            tags_code: read_u64(bytes, 12)? as i64,
        })
    }

    fn encode(&self) -> [u8; CQ_STORE_UNIT_SIZE] {
        let mut out = [0u8; CQ_STORE_UNIT_SIZE];
        out[..8].copy_from_slice(&self.physical_offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out[12..].copy_from_slice(&self.tags_code.to_le_bytes());
        out
    }

    fn is_valid(&self) -> bool {
        self.size > 0
    }

    /// Iterates the entries packed in `bytes`.
    pub fn iter(bytes: &[u8]) -> impl Iterator<Item = CqEntry> + '_ {
        bytes.chunks_exact(CQ_STORE_UNIT_SIZE).filter_map(CqEntry::decode)
    }
}

/// Placeholder written before the first real entry of a queue that starts
/// at a non-zero logical offset.
const BLANK_ENTRY: CqEntry = CqEntry {
    physical_offset: 0,
    size: i32::MAX as u32,
    tags_code: 0,
};

pub struct ConsumeQueue {
    topic: String,
    queue_id: u32,
    queue: MappedFileQueue,
    mapped_file_size: usize,
    // Physical offset of the newest entry, -1 when empty.
    max_physic_offset: AtomicI64,
    // Byte offset of the first live entry.
    min_logic_offset: AtomicU64,
    write_lock: Mutex<()>,
}

impl ConsumeQueue {
    pub fn new(topic: &str, queue_id: u32, store_path: &Path, mapped_file_size: usize) -> Self {
        let dir = store_path.join(topic).join(queue_id.to_string());
        Self {
            topic: topic.to_string(),
            queue_id,
            queue: MappedFileQueue::new(dir, mapped_file_size, None),
            mapped_file_size,
            max_physic_offset: AtomicI64::new(-1),
            min_logic_offset: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    pub fn load(&self) -> Result<()> {
        self.queue.load()?;
        log::info!(
            "load consume queue {}-{} {}",
            self.topic,
            self.queue_id,
            if self.queue.is_empty() { "empty" } else { "OK" }
        );
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| Error::Corrupt("consume queue lock poisoned"))
    }

    /// Scans the newest segments for the last valid entry and drops anything
    /// after it.
    pub fn recover(&self) -> Result<()> {
        let _guard = self.lock()?;
        let files = self.queue.mapped_files();
        if files.is_empty() {
            return Ok(());
        }
        let start = files.len().saturating_sub(RECOVER_FROM_LAST_FILES);
        let mut process_offset = files[start].file_from_offset();
        let mut max_physic = -1i64;
        for file in &files[start..] {
            let bytes = file.slice(0, file.wrote_position()).unwrap_or(&[]);
            let mut valid = 0usize;
            for entry in CqEntry::iter(bytes) {
                if !entry.is_valid() {
                    break;
                }
                valid += CQ_STORE_UNIT_SIZE;
                max_physic = entry.physical_offset as i64;
            }
            process_offset = file.file_from_offset() + valid as u64;
            if valid < self.mapped_file_size {
                log::info!(
                    "recover consume queue {}-{} to {}",
                    self.topic,
                    self.queue_id,
                    process_offset
                );
                break;
            }
        }
        self.queue.truncate_dirty_files(process_offset)?;
        self.max_physic_offset.store(max_physic, Ordering::Release);
        Ok(())
    }

    /// Appends the entry for queue offset `cq_offset`. Entries whose physical
    /// offset is not past the newest entry are skipped as duplicates.
    pub fn put_entry(&self, physical_offset: u64, size: u32, tags_code: i64, cq_offset: u64) -> Result<bool> {
        let _guard = self.lock()?;
        if physical_offset as i64 <= self.max_physic_offset.load(Ordering::Acquire) {
            return Ok(true);
        }
        let expect_logic_offset = cq_offset * CQ_STORE_UNIT_SIZE as u64;
        let first_in_queue = self.queue.is_empty();
        let file = self.queue.get_last_mapped_file(expect_logic_offset)?;

        if first_in_queue && cq_offset != 0 && file.wrote_position() == 0 {
            self.min_logic_offset.store(expect_logic_offset, Ordering::Release);
            self.fill_pre_blank(&file, expect_logic_offset)?;
            log::info!(
                "fill pre blank space {} {} {}",
                file.path().display(),
                expect_logic_offset,
                file.wrote_position()
            );
        }

        if cq_offset != 0 {
            let current = file.file_from_offset() + file.wrote_position() as u64;
            if expect_logic_offset < current {
                return Ok(true);
            }
            if expect_logic_offset != current {
                log::warn!(
                    "logic queue order maybe wrong, expect {} current {} topic {} queue {}",
                    expect_logic_offset,
                    current,
                    self.topic,
                    self.queue_id
                );
            }
        }

        let entry = CqEntry {
            physical_offset,
            size,
            tags_code,
        };
        let appended = file.append(&entry.encode())?;
        if appended {
            self.max_physic_offset
                .store(physical_offset as i64, Ordering::Release);
        }
        Ok(appended)
    }

    fn fill_pre_blank(&self, file: &MappedFile, until_where: u64) -> Result<()> {
        let until = (until_where % self.mapped_file_size as u64) as usize;
        let blank = BLANK_ENTRY.encode();
        let mut pos = 0;
        while pos < until {
            file.append(&blank)?;
            pos += CQ_STORE_UNIT_SIZE;
        }
        Ok(())
    }

    /// Entries from `start_index` to the end of the written region of the
    /// containing segment.
    pub fn index_buffer(&self, start_index: u64) -> Option<SelectedBuffer> {
        let offset = start_index.checked_mul(CQ_STORE_UNIT_SIZE as u64)?;
        if offset < self.min_logic_offset.load(Ordering::Acquire) {
            return None;
        }
        let file = self.queue.find_mapped_file_by_offset(offset, false)?;
        file.select_from((offset % self.mapped_file_size as u64) as usize)
    }

    pub fn entry_at(&self, index: u64) -> Option<CqEntry> {
        let buffer = self.index_buffer(index)?;
        CqEntry::decode(buffer.as_slice())
    }

    /// First queue offset of the segment after the one holding `index`.
    pub fn roll_next_file(&self, index: u64) -> u64 {
        let units = (self.mapped_file_size / CQ_STORE_UNIT_SIZE) as u64;
        index + units - index % units
    }

    pub fn min_offset_in_queue(&self) -> u64 {
        self.min_logic_offset.load(Ordering::Acquire) / CQ_STORE_UNIT_SIZE as u64
    }

    pub fn max_offset_in_queue(&self) -> u64 {
        self.queue.max_offset() / CQ_STORE_UNIT_SIZE as u64
    }

    pub fn message_total_in_queue(&self) -> u64 {
        self.max_offset_in_queue()
            .saturating_sub(self.min_offset_in_queue())
    }

    pub fn max_physic_offset(&self) -> i64 {
        self.max_physic_offset.load(Ordering::Acquire)
    }

    pub fn min_logic_offset(&self) -> u64 {
        self.min_logic_offset.load(Ordering::Acquire)
    }

    /// Commit-log end (offset + size) of the newest entry.
    pub fn last_physical_offset(&self) -> Option<u64> {
        let file = self.queue.last_mapped_file()?;
        let wrote = file.wrote_position();
        if wrote < CQ_STORE_UNIT_SIZE {
            return None;
        }
        let entry = CqEntry::decode(file.slice(wrote - CQ_STORE_UNIT_SIZE, CQ_STORE_UNIT_SIZE)?)?;
        entry
            .is_valid()
            .then(|| entry.physical_offset + entry.size as u64)
    }

    /// Moves the live minimum to the first entry at or past
    /// `min_physical_offset`, or to the end of the queue when every entry
    /// points below it. The minimum only moves forward.
    pub fn correct_min_offset(&self, min_physical_offset: u64) {
        let mut logic = self.queue.max_offset();
        'files: for file in self.queue.mapped_files() {
            let bytes = file.slice(0, file.wrote_position()).unwrap_or(&[]);
            for (i, entry) in CqEntry::iter(bytes).enumerate() {
                if entry.is_valid() && entry != BLANK_ENTRY && entry.physical_offset >= min_physical_offset {
                    logic = file.file_from_offset() + (i * CQ_STORE_UNIT_SIZE) as u64;
                    break 'files;
                }
            }
        }
        let prev = self.min_logic_offset.fetch_max(logic, Ordering::AcqRel);
        if logic > prev {
            log::info!(
                "compute logics min offset {}-{} {}",
                self.topic,
                self.queue_id,
                logic / CQ_STORE_UNIT_SIZE as u64
            );
        }
    }

    /// Deletes whole segments whose newest entry points below
    /// `min_physical_offset`, then advances the live minimum.
    pub fn delete_expired_segments(&self, min_physical_offset: u64) -> Result<usize> {
        let files = self.queue.mapped_files();
        let mut doomed = Vec::new();
        for file in files.iter().take(files.len().saturating_sub(1)) {
            let last = file
                .slice(self.mapped_file_size - CQ_STORE_UNIT_SIZE, CQ_STORE_UNIT_SIZE)
                .and_then(CqEntry::decode);
            match last {
                Some(entry) if entry.physical_offset < min_physical_offset => {
                    doomed.push(Arc::clone(file))
                }
                _ => break,
            }
        }
        let deleted = self.queue.delete_files(&doomed, Duration::ZERO)?;
        if let Some(first) = self.queue.first_mapped_file() {
            self.min_logic_offset
                .fetch_max(first.file_from_offset(), Ordering::AcqRel);
        }
        self.correct_min_offset(min_physical_offset);
        Ok(deleted)
    }

    /// Drops entries pointing at or past `physical_offset`.
    pub fn truncate_dirty_logic_files(&self, physical_offset: u64) -> Result<()> {
        let _guard = self.lock()?;
        loop {
            let Some(file) = self.queue.last_mapped_file() else {
                self.max_physic_offset.store(-1, Ordering::Release);
                return Ok(());
            };
            let wrote = file.wrote_position();
            let bytes = file.slice(0, wrote).unwrap_or(&[]);
            let mut keep = 0usize;
            let mut last_physic = None;
            for entry in CqEntry::iter(bytes) {
                if !entry.is_valid() || entry.physical_offset >= physical_offset {
                    break;
                }
                keep += CQ_STORE_UNIT_SIZE;
                last_physic = Some(entry.physical_offset);
            }
            if keep == 0 {
                self.queue.delete_last_mapped_file()?;
                continue;
            }
            file.set_wrote_position(keep);
            file.set_flushed_position(file.flushed_position().min(keep));
            if keep + CQ_STORE_UNIT_SIZE <= self.mapped_file_size {
                file.write_at(keep, &[0u8; CQ_STORE_UNIT_SIZE])?;
            }
            if let Some(offset) = last_physic {
                self.max_physic_offset.store(offset as i64, Ordering::Release);
            }
            return Ok(());
        }
    }

    /// Queue offset whose record store time is closest to `timestamp`; ties go
    /// to the earlier entry.
    pub fn offset_for_timestamp<F>(&self, timestamp: u64, min_physical_offset: u64, store_time: F) -> u64
    where
        F: Fn(u64, u32) -> Option<u64>,
    {
        let max = self.max_offset_in_queue();
        let mut low = self.min_offset_in_queue();
        if low >= max {
            return 0;
        }
        // Skip entries whose records were already removed from the log.
        let mut high = max - 1;
        while low < high {
            let mid = low + (high - low) / 2;
            match self.entry_at(mid) {
                Some(entry) if entry.physical_offset >= min_physical_offset => high = mid,
                Some(_) => low = mid + 1,
                None => return 0,
            }
        }
        let start = low;
        let mut low = start;
        let mut high = max - 1;
        let mut left: Option<(u64, u64)> = None;
        let mut right: Option<(u64, u64)> = None;
        while low <= high {
            let mid = low + (high - low) / 2;
            let Some(ts) = self
                .entry_at(mid)
                .and_then(|e| store_time(e.physical_offset, e.size))
            else {
                break;
            };
            if ts == timestamp {
                return mid;
            }
            if ts > timestamp {
                right = Some((mid, ts));
                if mid == 0 {
                    break;
                }
                high = mid - 1;
            } else {
                left = Some((mid, ts));
                low = mid + 1;
            }
        }
        match (left, right) {
            (Some((l, lts)), Some((r, rts))) => {
                if timestamp - lts > rts - timestamp {
                    r
                } else {
                    l
                }
            }
            (Some((l, _)), None) => l,
            (None, Some((r, _))) => r,
            (None, None) => start,
        }
    }

    pub fn flush(&self, least_pages: usize) -> Result<bool> {
        self.queue.flush(least_pages)
    }

    pub fn destroy(&self) -> Result<()> {
        let _guard = self.lock()?;
        self.queue.destroy()?;
        self.max_physic_offset.store(-1, Ordering::Release);
        self.min_logic_offset.store(0, Ordering::Release);
        if let Some(topic_dir) = self.queue.store_path().parent() {
            let _ = std::fs::remove_dir(topic_dir);
        }
        Ok(())
    }
}

type QueueMap = HashMap<String, HashMap<u32, Arc<ConsumeQueue>>>;

/// Every consume queue of the store, keyed by topic then queue id. Queues are
/// created on first write; concurrent creators converge on one instance.
pub struct ConsumeQueueTable {
    store_path: PathBuf,
    mapped_file_size: usize,
    queues: RwLock<QueueMap>,
}

impl ConsumeQueueTable {
    pub fn new(store_path: impl Into<PathBuf>, mapped_file_size: usize) -> Self {
        Self {
            store_path: store_path.into(),
            mapped_file_size,
            queues: RwLock::new(HashMap::new()),
        }
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Opens every `<topic>/<queue id>` directory under the store path.
    pub fn load(&self) -> Result<()> {
        if !self.store_path.exists() {
            return Ok(());
        }
        let mut loaded: QueueMap = HashMap::new();
        for topic_entry in std::fs::read_dir(&self.store_path)? {
            let topic_entry = topic_entry?;
            if !topic_entry.file_type()?.is_dir() {
                continue;
            }
            let Some(topic) = topic_entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            for queue_entry in std::fs::read_dir(topic_entry.path())? {
                let queue_entry = queue_entry?;
                let Some(queue_id) = queue_entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.parse::<u32>().ok())
                else {
                    continue;
                };
                let cq = ConsumeQueue::new(&topic, queue_id, &self.store_path, self.mapped_file_size);
                cq.load()?;
                loaded
                    .entry(topic.clone())
                    .or_default()
                    .insert(queue_id, Arc::new(cq));
            }
        }
        *self.write()? = loaded;
        Ok(())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, QueueMap>> {
        self.queues
            .write()
            .map_err(|_| Error::Corrupt("consume queue table lock poisoned"))
    }

    pub fn find(&self, topic: &str, queue_id: u32) -> Option<Arc<ConsumeQueue>> {
        self.queues.read().ok()?.get(topic)?.get(&queue_id).cloned()
    }

    pub fn find_or_create(&self, topic: &str, queue_id: u32) -> Arc<ConsumeQueue> {
        if let Some(cq) = self.find(topic, queue_id) {
            return cq;
        }
        let mut queues = match self.queues.write() {
            Ok(queues) => queues,
            Err(poisoned) => poisoned.into_inner(),
        };
        let store_path = &self.store_path;
        let size = self.mapped_file_size;
        Arc::clone(
            queues
                .entry(topic.to_string())
                .or_default()
                .entry(queue_id)
                .or_insert_with(|| Arc::new(ConsumeQueue::new(topic, queue_id, store_path, size))),
        )
    }

    pub fn all(&self) -> Vec<Arc<ConsumeQueue>> {
        self.queues
            .read()
            .map(|queues| queues.values().flat_map(|m| m.values().cloned()).collect())
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.queues
            .read()
            .map(|queues| queues.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove(&self, topic: &str, queue_id: u32) -> Option<Arc<ConsumeQueue>> {
        let mut queues = self.write().ok()?;
        let by_id = queues.get_mut(topic)?;
        let removed = by_id.remove(&queue_id);
        if by_id.is_empty() {
            queues.remove(topic);
        }
        removed
    }

    pub fn remove_topic(&self, topic: &str) -> Vec<Arc<ConsumeQueue>> {
        self.write()
            .ok()
            .and_then(|mut queues| queues.remove(topic))
            .map(|by_id| by_id.into_values().collect())
            .unwrap_or_default()
    }

    /// Largest physical offset any queue points at, -1 when all are empty.
    pub fn max_physic_offset(&self) -> i64 {
        self.all()
            .iter()
            .map(|cq| cq.max_physic_offset())
            .max()
            .unwrap_or(-1)
    }

    pub fn recover(&self) -> Result<()> {
        for cq in self.all() {
            cq.recover()?;
        }
        Ok(())
    }

    pub fn truncate_dirty(&self, physical_offset: u64) -> Result<()> {
        for cq in self.all() {
            cq.truncate_dirty_logic_files(physical_offset)?;
        }
        Ok(())
    }

    pub fn correct_min_offsets(&self, min_physical_offset: u64) {
        for cq in self.all() {
            cq.correct_min_offset(min_physical_offset);
        }
    }

    /// Flushes every queue. Returns `true` when no queue made progress.
    pub fn flush(&self, least_pages: usize) -> Result<bool> {
        let mut idle = true;
        for cq in self.all() {
            idle &= cq.flush(least_pages)?;
        }
        Ok(idle)
    }

    pub fn destroy(&self) -> Result<()> {
        let queues = std::mem::take(&mut *self.write()?);
        for cq in queues.values().flat_map(|m| m.values()) {
            cq.destroy()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const FILE_SIZE: usize = CQ_STORE_UNIT_SIZE * 4;

    #[test]
    fn table_creates_once_and_reloads_from_disk() -> Result<()> {
        let dir = tempdir()?;
        {
            let table = ConsumeQueueTable::new(dir.path(), FILE_SIZE);
            let a = table.find_or_create("T", 2);
            let b = table.find_or_create("T", 2);
            assert!(Arc::ptr_eq(&a, &b));
            a.put_entry(0, 10, 0, 0)?;
            table.find_or_create("U", 0).put_entry(10, 10, 0, 0)?;
            assert_eq!(table.max_physic_offset(), 10);
        }
        let table = ConsumeQueueTable::new(dir.path(), FILE_SIZE);
        table.load()?;
        table.recover()?;
        assert_eq!(table.all().len(), 2);
        assert_eq!(table.find("T", 2).expect("queue").max_offset_in_queue(), 1);
        assert!(table.find("T", 0).is_none());
        assert_eq!(table.remove_topic("U").len(), 1);
        assert_eq!(table.topics(), vec!["T".to_string()]);
        Ok(())
    }

    #[test]
    fn put_and_lookup_entries_across_segments() -> Result<()> {
        let dir = tempdir()?;
        let cq = ConsumeQueue::new("T", 0, dir.path(), FILE_SIZE);
        for i in 0..6u64 {
            assert!(cq.put_entry(i * 100, 100, 7, i)?);
        }
        assert_eq!(cq.max_offset_in_queue(), 6);
        assert_eq!(cq.min_offset_in_queue(), 0);

        let buffer = cq.index_buffer(1).expect("entries");
        let entries: Vec<_> = CqEntry::iter(buffer.as_slice()).collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].physical_offset, 100);

        let next = cq.entry_at(4).expect("second segment");
        assert_eq!(next.physical_offset, 400);
        assert_eq!(cq.roll_next_file(1), 4);
        assert_eq!(cq.last_physical_offset(), Some(600));
        Ok(())
    }

    #[test]
    fn duplicate_physical_offsets_are_skipped() -> Result<()> {
        let dir = tempdir()?;
        let cq = ConsumeQueue::new("T", 0, dir.path(), FILE_SIZE);
        cq.put_entry(0, 10, 0, 0)?;
        cq.put_entry(10, 10, 0, 1)?;
        cq.put_entry(10, 10, 0, 1)?;
        assert_eq!(cq.max_offset_in_queue(), 2);
        Ok(())
    }

    #[test]
    fn first_entry_past_zero_fills_blanks() -> Result<()> {
        let dir = tempdir()?;
        let cq = ConsumeQueue::new("T", 1, dir.path(), FILE_SIZE);
        cq.put_entry(5000, 10, 0, 6)?;
        assert_eq!(cq.min_offset_in_queue(), 6);
        assert_eq!(cq.max_offset_in_queue(), 7);
        assert!(cq.index_buffer(5).is_none());
        assert_eq!(cq.entry_at(6).expect("entry").physical_offset, 5000);
        Ok(())
    }

    #[test]
    fn truncate_and_recover_agree() -> Result<()> {
        let dir = tempdir()?;
        {
            let cq = ConsumeQueue::new("T", 0, dir.path(), FILE_SIZE);
            for i in 0..6u64 {
                cq.put_entry(i * 100, 100, 0, i)?;
            }
            cq.truncate_dirty_logic_files(300)?;
            assert_eq!(cq.max_offset_in_queue(), 3);
            assert_eq!(cq.max_physic_offset(), 200);
        }
        let cq = ConsumeQueue::new("T", 0, dir.path(), FILE_SIZE);
        cq.load()?;
        cq.recover()?;
        assert_eq!(cq.max_offset_in_queue(), 3);
        assert_eq!(cq.max_physic_offset(), 200);
        Ok(())
    }

    #[test]
    fn expired_segments_advance_min_without_regress() -> Result<()> {
        let dir = tempdir()?;
        let cq = ConsumeQueue::new("T", 0, dir.path(), FILE_SIZE);
        for i in 0..10u64 {
            cq.put_entry(i * 100, 100, 0, i)?;
        }
        assert_eq!(cq.delete_expired_segments(450)?, 1);
        assert_eq!(cq.min_offset_in_queue(), 5);
        cq.correct_min_offset(0);
        assert_eq!(cq.min_offset_in_queue(), 5);
        Ok(())
    }

    #[test]
    fn offset_for_timestamp_picks_closest() -> Result<()> {
        let dir = tempdir()?;
        let cq = ConsumeQueue::new("T", 0, dir.path(), FILE_SIZE);
        for i in 0..6u64 {
            cq.put_entry(i * 100, 100, 0, i)?;
        }
        // store time = physical offset * 10
        let store_time = |offset: u64, _size: u32| Some(offset * 10);
        assert_eq!(cq.offset_for_timestamp(2000, 0, store_time), 2);
        assert_eq!(cq.offset_for_timestamp(2400, 0, store_time), 2);
        assert_eq!(cq.offset_for_timestamp(2600, 0, store_time), 3);
        assert_eq!(cq.offset_for_timestamp(99_999, 0, store_time), 5);
        assert_eq!(cq.offset_for_timestamp(0, 250, store_time), 3);
        Ok(())
    }
}
