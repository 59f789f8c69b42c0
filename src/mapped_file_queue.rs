//! An ordered run of equally sized segments forming one logical stream.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::allocate::AllocateService;
use crate::clock::wall_ms;
use crate::mapped_file::{parse_segment_file_name, segment_file_name, MappedFile};
use crate::{Error, Result};

/// Upper bound of segments removed by one time-based retention pass.
const DELETE_FILES_BATCH_MAX: usize = 10;
const TRUNCATE_CLEAR_LEN: usize = 64;

pub struct MappedFileQueue {
    store_path: PathBuf,
    mapped_file_size: usize,
    files: RwLock<Vec<Arc<MappedFile>>>,
    flushed_where: AtomicU64,
    allocator: Option<Arc<AllocateService>>,
}

impl MappedFileQueue {
    pub fn new(
        store_path: impl Into<PathBuf>,
        mapped_file_size: usize,
        allocator: Option<Arc<AllocateService>>,
    ) -> Self {
        Self {
            store_path: store_path.into(),
            mapped_file_size,
            files: RwLock::new(Vec::new()),
            flushed_where: AtomicU64::new(0),
            allocator,
        }
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn mapped_file_size(&self) -> usize {
        self.mapped_file_size
    }

    /// Maps every segment already on disk, in offset order.
    pub fn load(&self) -> Result<()> {
        if !self.store_path.exists() {
            return Ok(());
        }
        let mut offsets = Vec::new();
        for entry in std::fs::read_dir(&self.store_path)? {
            let entry = entry?;
            if let Some(offset) = entry.file_name().to_str().and_then(parse_segment_file_name) {
                offsets.push(offset);
            }
        }
        offsets.sort_unstable();

        let mut loaded = Vec::with_capacity(offsets.len());
        for offset in offsets {
            let path = self.store_path.join(segment_file_name(offset));
            let len = std::fs::metadata(&path)?.len();
            if len != self.mapped_file_size as u64 {
                log::warn!(
                    "{} length {} does not match segment size {}",
                    path.display(),
                    len,
                    self.mapped_file_size
                );
                return Err(Error::Corrupt("segment size mismatch"));
            }
            loaded.push(Arc::new(MappedFile::open(&path, self.mapped_file_size)?));
            log::info!("load {} OK", path.display());
        }
        *self.write_files()? = loaded;
        Ok(())
    }

    fn write_files(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<Arc<MappedFile>>>> {
        self.files
            .write()
            .map_err(|_| Error::Corrupt("segment list lock poisoned"))
    }

    /// Snapshot of the current segments.
    pub fn mapped_files(&self) -> Vec<Arc<MappedFile>> {
        self.files.read().map(|files| files.clone()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().map(|files| files.is_empty()).unwrap_or(true)
    }

    pub fn first_mapped_file(&self) -> Option<Arc<MappedFile>> {
        self.files.read().ok()?.first().cloned()
    }

    pub fn last_mapped_file(&self) -> Option<Arc<MappedFile>> {
        self.files.read().ok()?.last().cloned()
    }

    /// Newest segment with free space, creating one at `start_offset` (rounded
    /// down to a segment boundary) or after the full newest segment.
    pub fn get_last_mapped_file(&self, start_offset: u64) -> Result<Arc<MappedFile>> {
        let size = self.mapped_file_size as u64;
        let create_offset = match self.last_mapped_file() {
            Some(last) if !last.is_full() => return Ok(last),
            Some(last) => last.file_from_offset() + size,
            None => start_offset - start_offset % size,
        };
        let next_path = self.store_path.join(segment_file_name(create_offset));
        let file = match &self.allocator {
            Some(allocator) => {
                let next_next = self.store_path.join(segment_file_name(create_offset + size));
                allocator.acquire(&next_path, &next_next, self.mapped_file_size)?
            }
            None => Arc::new(MappedFile::create(&next_path, self.mapped_file_size)?),
        };
        self.write_files()?.push(Arc::clone(&file));
        Ok(file)
    }

    /// Segment containing `offset`. With `return_first_on_not_found`, offsets
    /// below the retained range resolve to the first segment.
    pub fn find_mapped_file_by_offset(
        &self,
        offset: u64,
        return_first_on_not_found: bool,
    ) -> Option<Arc<MappedFile>> {
        let files = self.files.read().ok()?;
        let first = files.first()?;
        let size = self.mapped_file_size as u64;
        let first_offset = first.file_from_offset();
        if offset >= first_offset {
            let index = ((offset - first_offset) / size) as usize;
            if let Some(file) = files.get(index) {
                if offset < file.file_from_offset() + size {
                    return Some(Arc::clone(file));
                }
            }
        }
        if return_first_on_not_found {
            return Some(Arc::clone(first));
        }
        None
    }

    pub fn min_offset(&self) -> u64 {
        self.first_mapped_file()
            .map(|file| file.file_from_offset())
            .unwrap_or(0)
    }

    pub fn max_offset(&self) -> u64 {
        self.last_mapped_file()
            .map(|file| file.file_from_offset() + file.wrote_position() as u64)
            .unwrap_or(0)
    }

    pub fn flushed_where(&self) -> u64 {
        self.flushed_where.load(Ordering::Acquire)
    }

    pub fn set_flushed_where(&self, offset: u64) {
        self.flushed_where.store(offset, Ordering::Release);
    }

    /// Flushes the segment holding the flush cursor. Returns `true` when the
    /// cursor did not move.
    pub fn flush(&self, least_pages: usize) -> Result<bool> {
        let flushed_where = self.flushed_where();
        let Some(file) = self.find_mapped_file_by_offset(flushed_where, flushed_where == 0) else {
            return Ok(true);
        };
        let position = file.flush(least_pages)?;
        let new_where = file.file_from_offset() + position as u64;
        self.set_flushed_where(new_where.max(flushed_where));
        Ok(new_where <= flushed_where)
    }

    /// Drops every byte at or after `offset`: the containing segment is cut
    /// back, later segments are deleted.
    pub fn truncate_dirty_files(&self, offset: u64) -> Result<()> {
        let size = self.mapped_file_size as u64;
        let mut files = self.write_files()?;
        let mut kept = Vec::with_capacity(files.len());
        for file in files.drain(..) {
            let from = file.file_from_offset();
            if from + size <= offset {
                kept.push(file);
            } else if offset >= from {
                let pos = (offset - from) as usize;
                file.set_wrote_position(pos);
                file.set_flushed_position(pos);
                // Clear the head of the cut region so a later scan stops here.
                let clear = TRUNCATE_CLEAR_LEN.min(self.mapped_file_size - pos);
                file.write_at(pos, &[0u8; TRUNCATE_CLEAR_LEN][..clear])?;
                kept.push(file);
            } else {
                log::info!("truncate dirty segment {}", file.path().display());
                file.destroy()?;
            }
        }
        *files = kept;
        Ok(())
    }

    /// Oldest segments, never the newest, last modified more than
    /// `expired_ms` ago (or all of them when `clean_immediately`).
    pub fn expired_files_by_time(&self, expired_ms: u64, clean_immediately: bool) -> Vec<Arc<MappedFile>> {
        let files = self.mapped_files();
        let now = wall_ms();
        let mut expired = Vec::new();
        for file in files.iter().take(files.len().saturating_sub(1)) {
            let live_until = file.last_modified_ms().saturating_add(expired_ms);
            if now < live_until && !clean_immediately {
                break;
            }
            expired.push(Arc::clone(file));
            if expired.len() >= DELETE_FILES_BATCH_MAX {
                break;
            }
        }
        expired
    }

    /// Destroys `doomed` (oldest-first prefix of the queue), pausing `interval`
    /// between files. Returns the number removed.
    pub fn delete_files(&self, doomed: &[Arc<MappedFile>], interval: Duration) -> Result<usize> {
        let mut deleted = 0;
        for (i, file) in doomed.iter().enumerate() {
            if i > 0 && !interval.is_zero() {
                std::thread::sleep(interval);
            }
            {
                let mut files = self.write_files()?;
                if files.len() <= 1 {
                    break;
                }
                files.retain(|f| !Arc::ptr_eq(f, file));
            }
            file.destroy()?;
            log::info!("delete expired segment {}", file.path().display());
            deleted += 1;
        }
        Ok(deleted)
    }

    pub fn delete_last_mapped_file(&self) -> Result<()> {
        let last = self.write_files()?.pop();
        if let Some(file) = last {
            file.destroy()?;
            log::info!("delete last segment {}", file.path().display());
        }
        Ok(())
    }

    /// Deletes every segment and the directory.
    pub fn destroy(&self) -> Result<()> {
        let files = std::mem::take(&mut *self.write_files()?);
        for file in files {
            file.destroy()?;
        }
        self.set_flushed_where(0);
        if self.store_path.exists() {
            let _ = std::fs::remove_dir(&self.store_path);
        }
        Ok(())
    }
}
