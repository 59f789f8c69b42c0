//! Persisted recovery bounds.
//!
//! A 4 KiB mapped file holding, little-endian at fixed offsets: the store time
//! of the last flushed commit-log record, of the last flushed consume-queue
//! entry, of the last flushed index file, and the flushed physical offset.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use memmap2::{MmapMut, MmapOptions};

use crate::{Error, Result};

const CHECKPOINT_SIZE: usize = 4096;
const PHYSIC_MSG_TIMESTAMP: usize = 0;
const LOGICS_MSG_TIMESTAMP: usize = 8;
const INDEX_MSG_TIMESTAMP: usize = 16;
const PHYSIC_OFFSET: usize = 24;

/// Recovery rewinds this far behind the recorded flush times.
const MIN_TIMESTAMP_SLACK_MS: u64 = 3000;

pub struct StoreCheckpoint {
    file: File,
    map: Mutex<MmapMut>,
    physic_msg_timestamp: AtomicU64,
    logics_msg_timestamp: AtomicU64,
    index_msg_timestamp: AtomicU64,
    physic_offset: AtomicU64,
}

impl StoreCheckpoint {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let existed = path.exists();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() != CHECKPOINT_SIZE as u64 {
            file.set_len(CHECKPOINT_SIZE as u64)?;
        }
        let map = unsafe { MmapOptions::new().len(CHECKPOINT_SIZE).map_mut(&file)? };
        let read = |pos: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&map[pos..pos + 8]);
            u64::from_le_bytes(raw)
        };
        let checkpoint = Self {
            physic_msg_timestamp: AtomicU64::new(read(PHYSIC_MSG_TIMESTAMP)),
            logics_msg_timestamp: AtomicU64::new(read(LOGICS_MSG_TIMESTAMP)),
            index_msg_timestamp: AtomicU64::new(read(INDEX_MSG_TIMESTAMP)),
            physic_offset: AtomicU64::new(read(PHYSIC_OFFSET)),
            file,
            map: Mutex::new(map),
        };
        if existed {
            log::info!(
                "checkpoint physic ts {} logics ts {} index ts {} physic offset {}",
                checkpoint.physic_msg_timestamp(),
                checkpoint.logics_msg_timestamp(),
                checkpoint.index_msg_timestamp(),
                checkpoint.physic_offset()
            );
        }
        Ok(checkpoint)
    }

    pub fn physic_msg_timestamp(&self) -> u64 {
        self.physic_msg_timestamp.load(Ordering::Acquire)
    }

    pub fn set_physic_msg_timestamp(&self, ts: u64) {
        self.physic_msg_timestamp.store(ts, Ordering::Release);
    }

    pub fn logics_msg_timestamp(&self) -> u64 {
        self.logics_msg_timestamp.load(Ordering::Acquire)
    }

    pub fn set_logics_msg_timestamp(&self, ts: u64) {
        self.logics_msg_timestamp.store(ts, Ordering::Release);
    }

    pub fn index_msg_timestamp(&self) -> u64 {
        self.index_msg_timestamp.load(Ordering::Acquire)
    }

    pub fn set_index_msg_timestamp(&self, ts: u64) {
        self.index_msg_timestamp.store(ts, Ordering::Release);
    }

    pub fn physic_offset(&self) -> u64 {
        self.physic_offset.load(Ordering::Acquire)
    }

    pub fn set_physic_offset(&self, offset: u64) {
        self.physic_offset.store(offset, Ordering::Release);
    }

    /// Records stored before this time are known to be fully dispatched.
    pub fn min_timestamp(&self) -> u64 {
        self.physic_msg_timestamp()
            .min(self.logics_msg_timestamp())
            .saturating_sub(MIN_TIMESTAMP_SLACK_MS)
    }

    /// Like [`min_timestamp`](Self::min_timestamp) but also bounded by the
    /// index flush time.
    pub fn min_timestamp_index(&self) -> u64 {
        self.min_timestamp().min(self.index_msg_timestamp())
    }

    pub fn flush(&self) -> Result<()> {
        let mut map = self
            .map
            .lock()
            .map_err(|_| Error::Corrupt("checkpoint lock poisoned"))?;
        let fields = [
            (PHYSIC_MSG_TIMESTAMP, self.physic_msg_timestamp()),
            (LOGICS_MSG_TIMESTAMP, self.logics_msg_timestamp()),
            (INDEX_MSG_TIMESTAMP, self.index_msg_timestamp()),
            (PHYSIC_OFFSET, self.physic_offset()),
        ];
        for (pos, value) in fields {
            map[pos..pos + 8].copy_from_slice(&value.to_le_bytes());
        }
        map.flush()?;
        Ok(())
    }

    pub fn shutdown(&self) -> Result<()> {
        self.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn values_survive_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("checkpoint");
        {
            let checkpoint = StoreCheckpoint::open(&path)?;
            checkpoint.set_physic_msg_timestamp(10_000);
            checkpoint.set_logics_msg_timestamp(8_000);
            checkpoint.set_index_msg_timestamp(4_000);
            checkpoint.set_physic_offset(4096);
            checkpoint.flush()?;
        }
        let checkpoint = StoreCheckpoint::open(&path)?;
        assert_eq!(checkpoint.physic_offset(), 4096);
        assert_eq!(checkpoint.min_timestamp(), 5_000);
        assert_eq!(checkpoint.min_timestamp_index(), 4_000);
        Ok(())
    }
}
