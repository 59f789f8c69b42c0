use std::sync::atomic::{AtomicU32, Ordering};

pub const NOT_READABLE: u32 = 1;
pub const NOT_WRITEABLE: u32 = 1 << 1;
pub const WRITE_LOGICS_QUEUE_ERROR: u32 = 1 << 2;
pub const WRITE_INDEX_FILE_ERROR: u32 = 1 << 3;
pub const DISK_FULL: u32 = 1 << 4;

const WRITE_BLOCKERS: u32 =
    NOT_WRITEABLE | WRITE_LOGICS_QUEUE_ERROR | WRITE_INDEX_FILE_ERROR | DISK_FULL;

/// Store health bits shared by every service.
#[derive(Debug, Default)]
pub struct RunningFlags {
    bits: AtomicU32,
}

impl RunningFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag_bits(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }

    pub fn is_readable(&self) -> bool {
        self.flag_bits() & NOT_READABLE == 0
    }

    pub fn is_writeable(&self) -> bool {
        self.flag_bits() & WRITE_BLOCKERS == 0
    }

    pub fn make_not_readable(&self) {
        self.bits.fetch_or(NOT_READABLE, Ordering::AcqRel);
    }

    pub fn make_readable(&self) {
        self.bits.fetch_and(!NOT_READABLE, Ordering::AcqRel);
    }

    /// Returns `true` when the store was writeable before.
    pub fn get_and_make_not_writeable(&self) -> bool {
        self.bits.fetch_or(NOT_WRITEABLE, Ordering::AcqRel) & NOT_WRITEABLE == 0
    }

    pub fn make_writeable(&self) {
        self.bits.fetch_and(!NOT_WRITEABLE, Ordering::AcqRel);
    }

    pub fn make_logics_queue_error(&self) {
        self.bits.fetch_or(WRITE_LOGICS_QUEUE_ERROR, Ordering::AcqRel);
    }

    pub fn is_logics_queue_error(&self) -> bool {
        self.flag_bits() & WRITE_LOGICS_QUEUE_ERROR != 0
    }

    pub fn make_index_file_error(&self) {
        self.bits.fetch_or(WRITE_INDEX_FILE_ERROR, Ordering::AcqRel);
    }

    pub fn is_index_file_error(&self) -> bool {
        self.flag_bits() & WRITE_INDEX_FILE_ERROR != 0
    }

    /// Sets the disk-full bit. Returns `true` when the disk was fine before.
    pub fn get_and_make_disk_full(&self) -> bool {
        self.bits.fetch_or(DISK_FULL, Ordering::AcqRel) & DISK_FULL == 0
    }

    /// Clears the disk-full bit. Returns `true` when the disk was fine before.
    pub fn get_and_make_disk_ok(&self) -> bool {
        self.bits.fetch_and(!DISK_FULL, Ordering::AcqRel) & DISK_FULL == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_full_blocks_writes_until_cleared() {
        let flags = RunningFlags::new();
        assert!(flags.is_writeable());
        assert!(flags.get_and_make_disk_full());
        assert!(!flags.get_and_make_disk_full());
        assert!(!flags.is_writeable());
        assert!(flags.is_readable());
        assert!(!flags.get_and_make_disk_ok());
        assert!(flags.is_writeable());
    }
}
