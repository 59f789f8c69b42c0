//! Hash index from `topic#key` to commit-log offsets.
//!
//! Each index file is named by the creation time in milliseconds and laid out
//! as a 40-byte header, `slot_num` 4-byte hash slots, then `index_num` 20-byte
//! entries. A slot holds the number of the newest entry hashed to it; each
//! entry links to the previous one in its chain, so lookups walk newest first.
//! Entry numbers start at 1; 0 marks an empty slot or the end of a chain.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};

use crate::checkpoint::StoreCheckpoint;
use crate::clock::wall_ms;
use crate::dispatch::DispatchRequest;
use crate::flags::RunningFlags;
use crate::mapped_file::{parse_segment_file_name, segment_file_name};
use crate::message::{string_hash_code, KEY_SEPARATOR};
use crate::service::ServiceThread;
use crate::{Error, Result};

pub const INDEX_HEADER_SIZE: usize = 40;
const HASH_SLOT_SIZE: usize = 4;
const INDEX_ENTRY_SIZE: usize = 20;
const INVALID_INDEX: u32 = 0;

const BEGIN_TIMESTAMP: usize = 0;
const END_TIMESTAMP: usize = 8;
const BEGIN_PHY_OFFSET: usize = 16;
const END_PHY_OFFSET: usize = 24;
const HASH_SLOT_COUNT: usize = 32;
const INDEX_COUNT: usize = 36;

/// Upper bound on candidates returned by one query.
pub const MAX_MSGS_NUM_BATCH: usize = 64;
const CREATE_RETRIES: usize = 3;
const INDEX_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn build_key(topic: &str, key: &str) -> String {
    format!("{topic}#{key}")
}

fn key_hash(key: &str) -> u32 {
    string_hash_code(key).unsigned_abs() & i32::MAX as u32
}

fn get_u32(map: &[u8], pos: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&map[pos..pos + 4]);
    u32::from_le_bytes(raw)
}

fn get_u64(map: &[u8], pos: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&map[pos..pos + 8]);
    u64::from_le_bytes(raw)
}

fn put_u32(map: &mut [u8], pos: usize, value: u32) {
    map[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(map: &mut [u8], pos: usize, value: u64) {
    map[pos..pos + 8].copy_from_slice(&value.to_le_bytes());
}

pub struct IndexFile {
    path: PathBuf,
    slot_num: usize,
    index_num: usize,
    map: RwLock<MmapMut>,
}

impl IndexFile {
    fn file_len(slot_num: usize, index_num: usize) -> usize {
        INDEX_HEADER_SIZE + slot_num * HASH_SLOT_SIZE + index_num * INDEX_ENTRY_SIZE
    }

    /// Creates an empty index file continuing after `end_phy_offset` and
    /// `end_timestamp` of its predecessor.
    pub fn create(
        path: &Path,
        slot_num: usize,
        index_num: usize,
        end_phy_offset: u64,
        end_timestamp: u64,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let len = Self::file_len(slot_num, index_num);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        put_u64(&mut map, BEGIN_PHY_OFFSET, end_phy_offset);
        put_u64(&mut map, END_PHY_OFFSET, end_phy_offset);
        put_u64(&mut map, BEGIN_TIMESTAMP, end_timestamp);
        put_u64(&mut map, END_TIMESTAMP, end_timestamp);
        put_u32(&mut map, INDEX_COUNT, 1);
        Ok(Self {
            path: path.to_path_buf(),
            slot_num,
            index_num,
            map: RwLock::new(map),
        })
    }

    pub fn open(path: &Path, slot_num: usize, index_num: usize) -> Result<Self> {
        let len = Self::file_len(slot_num, index_num);
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() != len as u64 {
            return Err(Error::CorruptMetadata("index file size mismatch"));
        }
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        if get_u32(&map, INDEX_COUNT) == 0 {
            put_u32(&mut map, INDEX_COUNT, 1);
        }
        Ok(Self {
            path: path.to_path_buf(),
            slot_num,
            index_num,
            map: RwLock::new(map),
        })
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MmapMut>> {
        self.map
            .read()
            .map_err(|_| Error::Corrupt("index lock poisoned"))
    }

    fn header(&self, pos: usize) -> u64 {
        self.map.read().map(|map| get_u64(&map, pos)).unwrap_or(0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn begin_timestamp(&self) -> u64 {
        self.header(BEGIN_TIMESTAMP)
    }

    pub fn end_timestamp(&self) -> u64 {
        self.header(END_TIMESTAMP)
    }

    pub fn begin_phy_offset(&self) -> u64 {
        self.header(BEGIN_PHY_OFFSET)
    }

    pub fn end_phy_offset(&self) -> u64 {
        self.header(END_PHY_OFFSET)
    }

    pub fn index_count(&self) -> u32 {
        self.map
            .read()
            .map(|map| get_u32(&map, INDEX_COUNT))
            .unwrap_or(0)
    }

    pub fn is_write_full(&self) -> bool {
        self.index_count() as usize >= self.index_num
    }

    /// Adds `key`. Returns `false` when the file is full.
    pub fn put_key(&self, key: &str, phy_offset: u64, store_timestamp: u64) -> Result<bool> {
        let mut map = self
            .map
            .write()
            .map_err(|_| Error::Corrupt("index lock poisoned"))?;
        let index_count = get_u32(&map, INDEX_COUNT);
        if index_count as usize >= self.index_num {
            return Ok(false);
        }
        let hash = key_hash(key);
        let slot_pos = INDEX_HEADER_SIZE + (hash as usize % self.slot_num) * HASH_SLOT_SIZE;
        let mut slot_value = get_u32(&map, slot_pos);
        if slot_value > index_count {
            slot_value = INVALID_INDEX;
        }

        let begin_timestamp = get_u64(&map, BEGIN_TIMESTAMP);
        let time_diff = if begin_timestamp == 0 || index_count <= 1 {
            0
        } else {
            (store_timestamp.saturating_sub(begin_timestamp) / 1000).min(i32::MAX as u64) as u32
        };

        let entry_pos = INDEX_HEADER_SIZE
            + self.slot_num * HASH_SLOT_SIZE
            + index_count as usize * INDEX_ENTRY_SIZE;
        put_u32(&mut map, entry_pos, hash);
        put_u64(&mut map, entry_pos + 4, phy_offset);
        put_u32(&mut map, entry_pos + 12, time_diff);
        put_u32(&mut map, entry_pos + 16, slot_value);
        put_u32(&mut map, slot_pos, index_count);

        if index_count <= 1 {
            put_u64(&mut map, BEGIN_PHY_OFFSET, phy_offset);
            put_u64(&mut map, BEGIN_TIMESTAMP, store_timestamp);
        }
        let slots = get_u32(&map, HASH_SLOT_COUNT);
        put_u32(&mut map, HASH_SLOT_COUNT, slots + 1);
        put_u32(&mut map, INDEX_COUNT, index_count + 1);
        put_u64(&mut map, END_PHY_OFFSET, phy_offset);
        put_u64(&mut map, END_TIMESTAMP, store_timestamp);
        Ok(true)
    }

    /// Whether `[begin, end]` overlaps the time span of this file.
    pub fn is_time_matched(&self, begin: u64, end: u64) -> bool {
        let (file_begin, file_end) = (self.begin_timestamp(), self.end_timestamp());
        (begin < file_begin && end > file_end)
            || (begin >= file_begin && begin <= file_end)
            || (end >= file_begin && end <= file_end)
    }

    /// Appends to `out` the offsets chained under `key` and stored within
    /// `[begin, end]`, newest first, until `out` holds `max` items.
    pub fn select_phy_offsets(
        &self,
        out: &mut Vec<u64>,
        key: &str,
        max: usize,
        begin: u64,
        end: u64,
    ) -> Result<()> {
        let map = self.read()?;
        let hash = key_hash(key);
        let slot_pos = INDEX_HEADER_SIZE + (hash as usize % self.slot_num) * HASH_SLOT_SIZE;
        let index_count = get_u32(&map, INDEX_COUNT);
        let begin_timestamp = get_u64(&map, BEGIN_TIMESTAMP);
        let mut next = get_u32(&map, slot_pos);
        if next == INVALID_INDEX || next >= index_count {
            return Ok(());
        }
        loop {
            if out.len() >= max {
                break;
            }
            let entry_pos =
                INDEX_HEADER_SIZE + self.slot_num * HASH_SLOT_SIZE + next as usize * INDEX_ENTRY_SIZE;
            let hash_read = get_u32(&map, entry_pos);
            let phy_offset = get_u64(&map, entry_pos + 4);
            let time_diff = get_u32(&map, entry_pos + 12) as u64;
            let prev = get_u32(&map, entry_pos + 16);

            let time_read = begin_timestamp + time_diff * 1000;
            let time_matched = time_read >= begin && time_read <= end;
            if hash_read == hash && time_matched {
                out.push(phy_offset);
            }
            if prev == INVALID_INDEX || prev >= index_count || prev == next || time_read < begin {
                break;
            }
            next = prev;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.read()?.flush()?;
        Ok(())
    }

    pub fn destroy(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Candidates for a key query plus the newest index watermark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOffsetResult {
    pub phy_offsets: Vec<u64>,
    pub index_last_update_timestamp: u64,
    pub index_last_update_phy_offset: u64,
}

/// Owns the index files and the thread that writes them.
pub struct IndexService {
    store_path: PathBuf,
    slot_num: usize,
    index_num: usize,
    files: RwLock<Vec<Arc<IndexFile>>>,
    checkpoint: Arc<StoreCheckpoint>,
    flags: Arc<RunningFlags>,
    requests: Mutex<Option<mpsc::Sender<Vec<DispatchRequest>>>>,
    worker: Mutex<Option<ServiceThread>>,
}

impl IndexService {
    pub fn new(
        store_path: impl Into<PathBuf>,
        slot_num: usize,
        index_num: usize,
        checkpoint: Arc<StoreCheckpoint>,
        flags: Arc<RunningFlags>,
    ) -> Self {
        Self {
            store_path: store_path.into(),
            slot_num,
            index_num,
            files: RwLock::new(Vec::new()),
            checkpoint,
            flags,
            requests: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    fn files(&self) -> Vec<Arc<IndexFile>> {
        self.files.read().map(|f| f.clone()).unwrap_or_default()
    }

    /// Maps existing index files. After an unclean exit, files written past
    /// the checkpointed index time are dropped and rebuilt by recovery.
    pub fn load(&self, last_exit_ok: bool) -> Result<()> {
        if !self.store_path.exists() {
            return Ok(());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.store_path)? {
            let entry = entry?;
            if let Some(ts) = entry.file_name().to_str().and_then(parse_segment_file_name) {
                names.push(ts);
            }
        }
        names.sort_unstable();
        let mut loaded = Vec::with_capacity(names.len());
        for name in names {
            let path = self.store_path.join(segment_file_name(name));
            let file = IndexFile::open(&path, self.slot_num, self.index_num)?;
            if !last_exit_ok && file.end_timestamp() > self.checkpoint.index_msg_timestamp() {
                log::info!(
                    "drop index file {} newer than checkpoint {}",
                    path.display(),
                    self.checkpoint.index_msg_timestamp()
                );
                file.destroy()?;
                continue;
            }
            log::info!("load index file {} OK", path.display());
            loaded.push(Arc::new(file));
        }
        *self
            .files
            .write()
            .map_err(|_| Error::Corrupt("index list lock poisoned"))? = loaded;
        Ok(())
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        let (tx, rx) = mpsc::channel::<Vec<DispatchRequest>>();
        let service = Arc::clone(self);
        let worker = ServiceThread::spawn("index-service", move |ctx| {
            while !ctx.is_stopped() {
                match rx.recv_timeout(INDEX_POLL_INTERVAL) {
                    Ok(batch) => service.build_index(&batch),
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            while let Ok(batch) = rx.try_recv() {
                service.build_index(&batch);
            }
        })?;
        if let Ok(mut requests) = self.requests.lock() {
            *requests = Some(tx);
        }
        if let Ok(mut slot) = self.worker.lock() {
            *slot = Some(worker);
        }
        Ok(())
    }

    /// Queues a dispatched batch for indexing. Without a running worker the
    /// batch is indexed inline.
    pub fn put_request(&self, batch: Vec<DispatchRequest>) {
        let sent = match self.requests.lock() {
            Ok(requests) => match requests.as_ref() {
                Some(tx) => tx.send(batch).map_err(|err| err.0),
                None => Err(batch),
            },
            Err(_) => return,
        };
        if let Err(batch) = sent {
            self.build_index(&batch);
        }
    }

    pub fn build_index(&self, batch: &[DispatchRequest]) {
        for request in batch {
            if let Err(err) = self.build_one(request) {
                log::error!("build index for {} failed: {err}", request.commit_log_offset);
                self.flags.make_index_file_error();
                return;
            }
        }
    }

    fn build_one(&self, request: &DispatchRequest) -> Result<()> {
        if !request.transaction_type().is_dispatched() {
            return Ok(());
        }
        let mut file = self.last_writable_file()?;
        if request.commit_log_offset < file.end_phy_offset() {
            return Ok(());
        }
        let keys = request
            .uniq_key
            .iter()
            .map(String::as_str)
            .chain(request.keys.split(KEY_SEPARATOR))
            .filter(|k| !k.is_empty());
        for key in keys {
            let full_key = build_key(&request.topic, key);
            while !file.put_key(&full_key, request.commit_log_offset, request.store_timestamp)? {
                log::warn!("index file {} full, rolling", file.path().display());
                file = self.last_writable_file()?;
            }
        }
        Ok(())
    }

    fn last_writable_file(&self) -> Result<Arc<IndexFile>> {
        for attempt in 0..CREATE_RETRIES {
            match self.get_and_create_last_index_file() {
                Ok(file) => return Ok(file),
                Err(err) => {
                    log::warn!("create index file attempt {attempt} failed: {err}");
                    std::thread::sleep(Duration::from_millis(1000));
                }
            }
        }
        Err(Error::NotAvailable("index file cannot be created"))
    }

    fn get_and_create_last_index_file(&self) -> Result<Arc<IndexFile>> {
        let previous = {
            let files = self
                .files
                .read()
                .map_err(|_| Error::Corrupt("index list lock poisoned"))?;
            match files.last() {
                Some(last) if !last.is_write_full() => return Ok(Arc::clone(last)),
                other => other.cloned(),
            }
        };
        let (end_phy, end_ts) = previous
            .as_ref()
            .map(|f| (f.end_phy_offset(), f.end_timestamp()))
            .unwrap_or((0, 0));
        let mut name = wall_ms();
        while self.store_path.join(segment_file_name(name)).exists() {
            name += 1;
        }
        let path = self.store_path.join(segment_file_name(name));
        let file = Arc::new(IndexFile::create(&path, self.slot_num, self.index_num, end_phy, end_ts)?);
        self.files
            .write()
            .map_err(|_| Error::Corrupt("index list lock poisoned"))?
            .push(Arc::clone(&file));
        log::info!("create index file {}", path.display());
        if let Some(previous) = previous {
            previous.flush()?;
            self.checkpoint
                .set_index_msg_timestamp(previous.end_timestamp());
            self.checkpoint.flush()?;
        }
        Ok(file)
    }

    /// Offsets of records with `key` in `topic` stored within `[begin, end]`,
    /// newest file first. Hash collisions are possible; callers re-check.
    pub fn query_offset(&self, topic: &str, key: &str, max: usize, begin: u64, end: u64) -> QueryOffsetResult {
        let max = max.min(MAX_MSGS_NUM_BATCH);
        let mut result = QueryOffsetResult::default();
        let files = self.files();
        if let Some(last) = files.last() {
            result.index_last_update_timestamp = last.end_timestamp();
            result.index_last_update_phy_offset = last.end_phy_offset();
        }
        let full_key = build_key(topic, key);
        for file in files.iter().rev() {
            if file.is_time_matched(begin, end) {
                if let Err(err) = file.select_phy_offsets(&mut result.phy_offsets, &full_key, max, begin, end) {
                    log::warn!("query index {} failed: {err}", file.path().display());
                }
            }
            if file.begin_timestamp() < begin || result.phy_offsets.len() >= max {
                break;
            }
        }
        result
    }

    /// Removes index files (never the newest) whose entries all point below
    /// `min_offset`.
    pub fn delete_expired(&self, min_offset: u64) -> Result<usize> {
        let mut files = self
            .files
            .write()
            .map_err(|_| Error::Corrupt("index list lock poisoned"))?;
        let mut doomed = 0;
        while files.len() > 1 && files[doomed].end_phy_offset() < min_offset {
            doomed += 1;
            if doomed == files.len() - 1 {
                break;
            }
        }
        let removed: Vec<_> = files.drain(..doomed).collect();
        drop(files);
        for file in &removed {
            file.destroy()?;
            log::info!("delete expired index file {}", file.path().display());
        }
        Ok(removed.len())
    }

    /// Flushes the newest file and records its end time in the checkpoint.
    pub fn flush(&self) -> Result<()> {
        if let Some(last) = self.files().last() {
            last.flush()?;
            self.checkpoint.set_index_msg_timestamp(last.end_timestamp());
        }
        Ok(())
    }

    pub fn shutdown(&self, grace: Duration) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(worker) = worker.take() {
                worker.shutdown(grace);
            }
        }
        if let Ok(mut requests) = self.requests.lock() {
            requests.take();
        }
        if let Err(err) = self.flush() {
            log::warn!("flush index on shutdown failed: {err}");
        }
    }

    pub fn destroy(&self) -> Result<()> {
        let files = std::mem::take(
            &mut *self
                .files
                .write()
                .map_err(|_| Error::Corrupt("index list lock poisoned"))?,
        );
        for file in files {
            file.destroy()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request(topic: &str, keys: &str, offset: u64, ts: u64) -> DispatchRequest {
        DispatchRequest {
            topic: topic.to_string(),
            queue_id: 0,
            commit_log_offset: offset,
            msg_size: 100,
            tags_code: 0,
            store_timestamp: ts,
            consume_queue_offset: 0,
            keys: keys.to_string(),
            uniq_key: None,
            sys_flag: 0,
            prepared_transaction_offset: 0,
        }
    }

    fn service(dir: &Path, slots: usize, entries: usize) -> Result<IndexService> {
        let checkpoint = Arc::new(StoreCheckpoint::open(&dir.join("checkpoint"))?);
        Ok(IndexService::new(
            dir.join("index"),
            slots,
            entries,
            checkpoint,
            Arc::new(RunningFlags::new()),
        ))
    }

    #[test]
    fn colliding_keys_chain_newest_first() -> Result<()> {
        let dir = tempdir()?;
        let file = IndexFile::create(&dir.path().join(segment_file_name(1)), 1, 8, 0, 0)?;
        assert!(file.put_key("T#a", 100, 10_000)?);
        assert!(file.put_key("T#b", 200, 11_000)?);
        assert!(file.put_key("T#a", 300, 12_000)?);

        let mut out = Vec::new();
        file.select_phy_offsets(&mut out, "T#a", 10, 0, u64::MAX)?;
        assert_eq!(out, vec![300, 100]);
        assert_eq!(file.begin_timestamp(), 10_000);
        assert_eq!(file.end_phy_offset(), 300);
        Ok(())
    }

    #[test]
    fn service_rolls_full_files_and_queries_across_them() -> Result<()> {
        let dir = tempdir()?;
        let index = service(dir.path(), 4, 3)?;
        index.build_index(&[
            request("T", "k1", 100, 1_000),
            request("T", "k1 k2", 200, 2_000),
            request("T", "k1", 300, 3_000),
        ]);
        assert!(index.files().len() >= 2);
        let result = index.query_offset("T", "k1", 10, 0, u64::MAX);
        let mut offsets = result.phy_offsets.clone();
        offsets.sort_unstable();
        assert_eq!(offsets, vec![100, 200, 300]);
        assert_eq!(result.index_last_update_phy_offset, 300);

        let other = index.query_offset("U", "k1", 10, 0, u64::MAX);
        assert!(other.phy_offsets.is_empty());
        Ok(())
    }

    #[test]
    fn duplicate_requests_are_not_reindexed() -> Result<()> {
        let dir = tempdir()?;
        let index = service(dir.path(), 16, 32)?;
        index.build_index(&[request("T", "k", 100, 1_000), request("T", "k", 200, 2_000)]);
        index.build_index(&[request("T", "k", 100, 1_000)]);
        let result = index.query_offset("T", "k", 10, 0, u64::MAX);
        assert_eq!(result.phy_offsets, vec![200, 100]);
        Ok(())
    }

    #[test]
    fn expired_files_are_deleted_but_not_the_newest() -> Result<()> {
        let dir = tempdir()?;
        let index = service(dir.path(), 4, 2)?;
        for i in 1..=4u64 {
            index.build_index(&[request("T", "k", i * 100, i * 1_000)]);
        }
        let before = index.files().len();
        assert!(before >= 3);
        let removed = index.delete_expired(u64::MAX)?;
        assert_eq!(removed, before - 1);
        assert_eq!(index.files().len(), 1);
        Ok(())
    }
}
