//! Fixed-size memory-mapped segment files.
//!
//! A segment is named by the zero-padded offset of its first byte in the
//! logical stream it belongs to (commit log or one consume queue). Exactly one
//! thread appends to a segment at a time; readers copy or borrow bytes below the
//! published write position and never take a lock.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use memmap2::{MmapOptions, MmapRaw};

use crate::{Error, Result};

pub const OS_PAGE_SIZE: usize = 4096;

/// Segment file name for a stream offset (e.g. `00000000001073741824`).
pub fn segment_file_name(offset: u64) -> String {
    format!("{:020}", offset)
}

pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    if name.len() != 20 {
        return None;
    }
    name.parse::<u64>().ok()
}

pub struct MappedFile {
    path: PathBuf,
    file_from_offset: u64,
    file_size: usize,
    file: File,
    map: MmapRaw,
    // Bytes appended and visible to readers. Stored with Release after the
    // bytes are copied in.
    wrote_position: AtomicUsize,
    flushed_position: AtomicUsize,
}

impl MappedFile {
    /// Creates (or truncates) a segment of `file_size` bytes at `path`.
    pub fn create(path: &Path, file_size: usize) -> Result<Self> {
        if file_size == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let file_from_offset = file_from_offset(path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(file_size as u64)?;
        let map = MmapOptions::new().len(file_size).map_raw(&file)?;
        Ok(Self {
            path: path.to_path_buf(),
            file_from_offset,
            file_size,
            file,
            map,
            wrote_position: AtomicUsize::new(0),
            flushed_position: AtomicUsize::new(0),
        })
    }

    /// Maps an existing segment. Both watermarks start at the end of the file;
    /// recovery moves them back to the last valid byte.
    pub fn open(path: &Path, file_size: usize) -> Result<Self> {
        let file_from_offset = file_from_offset(path)?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len != file_size {
            return Err(Error::Corrupt("segment size mismatch"));
        }
        let map = MmapOptions::new().len(file_size).map_raw(&file)?;
        Ok(Self {
            path: path.to_path_buf(),
            file_from_offset,
            file_size,
            file,
            map,
            wrote_position: AtomicUsize::new(file_size),
            flushed_position: AtomicUsize::new(file_size),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_from_offset(&self) -> u64 {
        self.file_from_offset
    }

    pub fn file_size(&self) -> usize {
        self.file_size
    }

    pub fn wrote_position(&self) -> usize {
        self.wrote_position.load(Ordering::Acquire)
    }

    pub fn set_wrote_position(&self, pos: usize) {
        self.wrote_position
            .store(pos.min(self.file_size), Ordering::Release);
    }

    pub fn flushed_position(&self) -> usize {
        self.flushed_position.load(Ordering::Acquire)
    }

    pub fn set_flushed_position(&self, pos: usize) {
        self.flushed_position
            .store(pos.min(self.file_size), Ordering::Release);
    }

    pub fn is_full(&self) -> bool {
        self.wrote_position() >= self.file_size
    }

    pub fn remaining(&self) -> usize {
        self.file_size - self.wrote_position()
    }

    /// Copies `data` into the mapping at `pos` without publishing it.
    ///
    /// Only the segment's single writer may call this, and only at or above
    /// the current write position.
    pub(crate) fn write_at(&self, pos: usize, data: &[u8]) -> Result<()> {
        let end = pos
            .checked_add(data.len())
            .ok_or(Error::Corrupt("range overflow"))?;
        if end > self.file_size {
            return Err(Error::Corrupt("range out of bounds"));
        }
        // SAFETY: bounds checked above; readers never look at bytes at or past
        // the published write position, which is <= pos for the single writer.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.map.as_mut_ptr().add(pos), data.len());
        }
        Ok(())
    }

    /// Appends `data` at the write position and publishes it. Returns `false`
    /// when it does not fit.
    pub fn append(&self, data: &[u8]) -> Result<bool> {
        let pos = self.wrote_position();
        if pos + data.len() > self.file_size {
            return Ok(false);
        }
        self.write_at(pos, data)?;
        self.set_wrote_position(pos + data.len());
        Ok(true)
    }

    /// Borrow of published bytes `[pos, pos + len)`.
    pub(crate) fn slice(&self, pos: usize, len: usize) -> Option<&[u8]> {
        let end = pos.checked_add(len)?;
        if end > self.wrote_position() {
            return None;
        }
        // SAFETY: the range is below the published write position, so the
        // writer no longer touches it and the Acquire load above orders the
        // bytes before this read.
        Some(unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(pos), len) })
    }

    /// View of `size` published bytes starting at `pos`.
    pub fn select(self: &Arc<Self>, pos: usize, size: usize) -> Option<SelectedBuffer> {
        self.slice(pos, size)?;
        Some(SelectedBuffer {
            file: Arc::clone(self),
            pos,
            len: size,
        })
    }

    /// View of every published byte from `pos` to the write position.
    pub fn select_from(self: &Arc<Self>, pos: usize) -> Option<SelectedBuffer> {
        let wrote = self.wrote_position();
        if pos >= wrote {
            return None;
        }
        Some(SelectedBuffer {
            file: Arc::clone(self),
            pos,
            len: wrote - pos,
        })
    }

    fn able_to_flush(&self, least_pages: usize) -> bool {
        let flushed = self.flushed_position();
        let wrote = self.wrote_position();
        if self.is_full() {
            return wrote > flushed;
        }
        if least_pages > 0 {
            return (wrote / OS_PAGE_SIZE).saturating_sub(flushed / OS_PAGE_SIZE) >= least_pages;
        }
        wrote > flushed
    }

    /// Flushes dirty pages when at least `least_pages` are pending (0 = any).
    /// Returns the flushed position.
    pub fn flush(&self, least_pages: usize) -> Result<usize> {
        if self.able_to_flush(least_pages) {
            let flushed = self.flushed_position();
            let wrote = self.wrote_position();
            self.map.flush_range(flushed, wrote - flushed)?;
            self.set_flushed_position(wrote);
        }
        Ok(self.flushed_position())
    }

    /// Touches every page so the first appends do not fault.
    pub fn warm(&self) {
        let mut offset = 0;
        while offset < self.file_size {
            // SAFETY: in bounds; only called before the segment is handed out.
            unsafe {
                std::ptr::write_volatile(self.map.as_mut_ptr().add(offset), 0);
            }
            offset += OS_PAGE_SIZE;
        }
    }

    pub fn last_modified_ms(&self) -> u64 {
        self.file
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Removes the file. Outstanding [`SelectedBuffer`]s keep the mapping alive
    /// until they are dropped.
    pub fn destroy(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn file_from_offset(path: &Path) -> Result<u64> {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(parse_segment_file_name)
        .ok_or(Error::Unsupported("segment file name is not a stream offset"))
}

/// Reference-counted view into published segment bytes.
pub struct SelectedBuffer {
    file: Arc<MappedFile>,
    pos: usize,
    len: usize,
}

impl SelectedBuffer {
    /// Absolute stream offset of the first byte.
    pub fn start_offset(&self) -> u64 {
        self.file.file_from_offset() + self.pos as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // The range was published when the view was taken.
        self.file.slice(self.pos, self.len).unwrap_or(&[])
    }

    /// Narrower view `[from, from + len)` relative to this one.
    pub fn sub(&self, from: usize, len: usize) -> Option<SelectedBuffer> {
        if from.checked_add(len)? > self.len {
            return None;
        }
        Some(SelectedBuffer {
            file: Arc::clone(&self.file),
            pos: self.pos + from,
            len,
        })
    }
}

impl AsRef<[u8]> for SelectedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for SelectedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedBuffer")
            .field("start_offset", &self.start_offset())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_publishes_and_select_respects_watermark() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(segment_file_name(8192));
        let file = Arc::new(MappedFile::create(&path, 8192)?);
        assert_eq!(file.file_from_offset(), 8192);
        assert!(file.append(b"hello")?);
        assert!(file.select(0, 6).is_none());
        let view = file.select(0, 5).expect("published");
        assert_eq!(view.as_slice(), b"hello");
        assert_eq!(view.start_offset(), 8192);
        assert!(!file.append(&vec![0u8; 8192])?);
        Ok(())
    }

    #[test]
    fn reopen_preserves_bytes_and_starts_full() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(segment_file_name(0));
        {
            let file = MappedFile::create(&path, 4096)?;
            file.append(b"abc")?;
            file.flush(0)?;
            assert_eq!(file.flushed_position(), 3);
        }
        let file = Arc::new(MappedFile::open(&path, 4096)?);
        assert!(file.is_full());
        assert_eq!(file.select(0, 3).expect("bytes").as_slice(), b"abc");
        assert!(matches!(MappedFile::open(&path, 8192), Err(Error::Corrupt(_))));
        Ok(())
    }

    #[test]
    fn view_survives_destroy() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(segment_file_name(0));
        let file = Arc::new(MappedFile::create(&path, 4096)?);
        file.append(b"keep")?;
        let view = file.select(0, 4).expect("view");
        file.destroy()?;
        drop(file);
        assert!(!path.exists());
        assert_eq!(view.as_slice(), b"keep");
        Ok(())
    }
}
