//! Background service threads.
//!
//! Every service runs its own loop on a named thread: it sleeps until woken or
//! until its interval elapses, does one unit of work, and drains whatever is
//! pending once asked to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::{Error, Result};

const JOIN_POLL: Duration = Duration::from_millis(10);

/// Handed to the service body.
pub struct ServiceContext {
    stopped: Arc<AtomicBool>,
    wakeups: mpsc::Receiver<()>,
}

impl ServiceContext {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Blocks until woken or `interval` elapses. Returns `true` when woken.
    pub fn wait_for_running(&self, interval: Duration) -> bool {
        match self.wakeups.recv_timeout(interval) {
            Ok(()) => true,
            Err(mpsc::RecvTimeoutError::Timeout) => false,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                thread::sleep(interval);
                false
            }
        }
    }
}

pub struct ServiceThread {
    name: &'static str,
    stopped: Arc<AtomicBool>,
    wakeups: mpsc::SyncSender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceThread {
    pub fn spawn<F>(name: &'static str, body: F) -> Result<Self>
    where
        F: FnOnce(ServiceContext) + Send + 'static,
    {
        let stopped = Arc::new(AtomicBool::new(false));
        let (wakeups, wakeup_rx) = mpsc::sync_channel(1);
        let ctx = ServiceContext {
            stopped: Arc::clone(&stopped),
            wakeups: wakeup_rx,
        };
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                log::info!("{name} service started");
                body(ctx);
                log::info!("{name} service end");
            })
            .map_err(Error::Io)?;
        Ok(Self {
            name,
            stopped,
            wakeups,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn wakeup(&self) {
        let _ = self.wakeups.try_send(());
    }

    /// Signals the loop to stop and waits up to `grace` for it to finish its
    /// drain. A thread still running after that is left detached.
    pub fn shutdown(&self, grace: Duration) {
        self.stopped.store(true, Ordering::Release);
        self.wakeup();
        let handle = match self.handle.lock() {
            Ok(mut handle) => handle.take(),
            Err(_) => None,
        };
        let Some(handle) = handle else {
            return;
        };
        let deadline = Instant::now() + grace;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::warn!("{} did not stop within {:?}", self.name, grace);
                return;
            }
            thread::sleep(JOIN_POLL);
        }
        if handle.join().is_err() {
            log::error!("{} panicked", self.name);
        }
    }
}

impl Drop for ServiceThread {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        self.wakeup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn wakeup_runs_body_and_shutdown_drains() -> Result<()> {
        let runs = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(AtomicBool::new(false));
        let (r, d) = (Arc::clone(&runs), Arc::clone(&drained));
        let service = ServiceThread::spawn("test-service", move |ctx| {
            while !ctx.is_stopped() {
                if ctx.wait_for_running(Duration::from_secs(10)) {
                    r.fetch_add(1, Ordering::SeqCst);
                }
            }
            d.store(true, Ordering::SeqCst);
        })?;
        service.wakeup();
        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(runs.load(Ordering::SeqCst) >= 1);
        service.shutdown(Duration::from_secs(5));
        assert!(drained.load(Ordering::SeqCst));
        Ok(())
    }
}
