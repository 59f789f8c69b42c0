//! Background segment pre-allocation.
//!
//! The commit log asks for the next segment and the one after it; the worker
//! creates and warms both off the write path so that a roll usually finds its
//! file ready.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::mapped_file::MappedFile;
use crate::{Error, Result};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Slot {
    Pending,
    Ready(Arc<MappedFile>),
    Failed(String),
}

struct Shared {
    slots: Mutex<HashMap<PathBuf, Slot>>,
    ready: Condvar,
    stopped: AtomicBool,
    errors: AtomicU64,
}

pub struct AllocateService {
    shared: Arc<Shared>,
    requests: mpsc::Sender<(PathBuf, usize)>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AllocateService {
    pub fn start() -> Result<Arc<Self>> {
        let shared = Arc::new(Shared {
            slots: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
            stopped: AtomicBool::new(false),
            errors: AtomicU64::new(0),
        });
        let (requests, request_rx) = mpsc::channel::<(PathBuf, usize)>();
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("segment-alloc".to_string())
            .spawn(move || run(worker, request_rx))
            .map_err(Error::Io)?;
        Ok(Arc::new(Self {
            shared,
            requests,
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Returns the segment at `next_path`, queueing `next_next_path` for
    /// pre-allocation.
    pub fn acquire(
        &self,
        next_path: &Path,
        next_next_path: &Path,
        file_size: usize,
    ) -> Result<Arc<MappedFile>> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(Error::NotAvailable("segment allocator stopped"));
        }
        self.enqueue(next_path, file_size)?;
        self.enqueue(next_next_path, file_size)?;

        let deadline = Instant::now() + WAIT_TIMEOUT;
        let mut slots = self
            .shared
            .slots
            .lock()
            .map_err(|_| Error::Corrupt("allocator lock poisoned"))?;
        loop {
            match slots.remove(next_path) {
                Some(Slot::Ready(file)) => return Ok(file),
                Some(Slot::Failed(reason)) => {
                    log::error!("allocate {} failed: {reason}", next_path.display());
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        reason,
                    )));
                }
                Some(Slot::Pending) => {
                    slots.insert(next_path.to_path_buf(), Slot::Pending);
                }
                None => return Err(Error::Corrupt("segment exists outside the allocator")),
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!("allocate {} timed out", next_path.display());
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "segment allocation timed out",
                )));
            }
            let (guard, _) = self
                .shared
                .ready
                .wait_timeout(slots, deadline - now)
                .map_err(|_| Error::Corrupt("allocator lock poisoned"))?;
            slots = guard;
        }
    }

    fn enqueue(&self, path: &Path, file_size: usize) -> Result<()> {
        let mut slots = self
            .shared
            .slots
            .lock()
            .map_err(|_| Error::Corrupt("allocator lock poisoned"))?;
        if slots.contains_key(path) || path.exists() {
            return Ok(());
        }
        slots.insert(path.to_path_buf(), Slot::Pending);
        self.requests
            .send((path.to_path_buf(), file_size))
            .map_err(|_| Error::NotAvailable("segment allocator stopped"))
    }

    pub fn error_count(&self) -> u64 {
        self.shared.errors.load(Ordering::Relaxed)
    }

    /// Stops the worker and deletes segments that were allocated but never
    /// handed out.
    pub fn shutdown(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
        if let Ok(mut slots) = self.shared.slots.lock() {
            for (path, slot) in slots.drain() {
                if let Slot::Ready(file) = slot {
                    log::info!("delete pre-allocated segment {}", path.display());
                    let _ = file.destroy();
                }
            }
        }
        self.shared.ready.notify_all();
    }
}

fn run(shared: Arc<Shared>, requests: mpsc::Receiver<(PathBuf, usize)>) {
    log::info!("segment allocator started");
    while !shared.stopped.load(Ordering::Acquire) {
        let (path, file_size) = match requests.recv_timeout(POLL_INTERVAL) {
            Ok(request) => request,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };
        let slot = match MappedFile::create(&path, file_size) {
            Ok(file) => {
                file.warm();
                Slot::Ready(Arc::new(file))
            }
            Err(err) => {
                shared.errors.fetch_add(1, Ordering::Relaxed);
                let _ = std::fs::remove_file(&path);
                Slot::Failed(err.to_string())
            }
        };
        if let Ok(mut slots) = shared.slots.lock() {
            if slots.contains_key(&path) {
                slots.insert(path, slot);
            } else if let Slot::Ready(file) = slot {
                let _ = file.destroy();
            }
        }
        shared.ready.notify_all();
    }
    log::info!("segment allocator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapped_file::segment_file_name;
    use tempfile::tempdir;

    #[test]
    fn acquire_returns_file_and_preallocates_next() -> Result<()> {
        let dir = tempdir()?;
        let service = AllocateService::start()?;
        let first = dir.path().join(segment_file_name(0));
        let second = dir.path().join(segment_file_name(4096));
        let file = service.acquire(&first, &second, 4096)?;
        assert_eq!(file.file_from_offset(), 0);
        assert_eq!(file.wrote_position(), 0);

        let third = dir.path().join(segment_file_name(8192));
        let next = service.acquire(&second, &third, 4096)?;
        assert_eq!(next.file_from_offset(), 4096);

        service.shutdown();
        assert!(!third.exists() || third.metadata()?.len() == 4096);
        Ok(())
    }
}
