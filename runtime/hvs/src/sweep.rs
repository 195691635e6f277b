//! Sweep worker
//!
//! Reclaiming stale display lists takes the arena lock and reads channel
//! registers, neither of which belongs in interrupt context. The interrupt
//! path only calls [`SweepHandle::schedule`]; the actual sweep runs on a
//! dedicated thread.
//!
//! Requests go through a channel of capacity one, so scheduling while a
//! sweep is already pending is a no-op. One pending request is enough: the
//! sweep looks at the whole queue, not at the event that triggered it.
//!
//! With a fallback interval configured the worker also wakes on its own
//! and sweeps, so a missed end-of-frame interrupt only delays reclaim
//! instead of stalling it until the arena runs dry.

use crate::{HvsError, Result};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepRequest {
    Sweep,
    Shutdown,
}

/// Why a sweep is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepCause {
    /// Requested through [`SweepHandle::schedule`]
    Scheduled,
    /// The fallback interval elapsed without a request
    Fallback,
    /// Run synchronously by a caller, e.g. before retrying a failed
    /// allocation
    Demand,
}

/// Cloneable, non-blocking way to request a sweep
#[derive(Clone)]
pub struct SweepHandle {
    tx: Sender<SweepRequest>,
    cancelled: Arc<AtomicBool>,
}

impl SweepHandle {
    /// Queue a sweep unless one is already pending
    ///
    /// Never blocks. Returns `true` if a new request was queued.
    pub fn schedule(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return false;
        }

        match self.tx.try_send(SweepRequest::Sweep) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Receiving end of the request channel, consumed by [`SweepWorker::spawn`]
pub struct SweepQueue {
    rx: Receiver<SweepRequest>,
    handle: SweepHandle,
}

/// Create the request channel
///
/// Split from spawning so the handle can be stored in the state the
/// worker's job closes over.
pub fn sweep_queue() -> (SweepHandle, SweepQueue) {
    let (tx, rx) = bounded(1);
    let handle = SweepHandle {
        tx,
        cancelled: Arc::new(AtomicBool::new(false)),
    };
    (handle.clone(), SweepQueue { rx, handle })
}

/// Owner of the worker thread
pub struct SweepWorker {
    handle: SweepHandle,
    thread: Option<JoinHandle<()>>,
}

impl SweepWorker {
    /// Start the worker thread
    ///
    /// # Arguments
    /// * `queue` - Request channel from [`sweep_queue`]
    /// * `fallback` - Sweep on our own after this long without a request
    /// * `job` - The sweep itself, called on the worker thread
    ///
    /// # Errors
    /// `WorkerSpawn` if the thread cannot be created.
    pub fn spawn<F>(queue: SweepQueue, fallback: Option<Duration>, job: F) -> Result<Self>
    where
        F: FnMut(SweepCause) + Send + 'static,
    {
        let SweepQueue { rx, handle } = queue;

        let cancelled = Arc::clone(&handle.cancelled);
        let thread = thread::Builder::new()
            .name("hvs-sweep".to_string())
            .spawn(move || worker_loop(rx, cancelled, fallback, job))
            .map_err(|e| HvsError::WorkerSpawn(e.to_string()))?;

        log::debug!("sweep worker started (fallback {:?})", fallback);

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> SweepHandle {
        self.handle.clone()
    }

    /// Cancel pending work and wait for the thread to exit
    ///
    /// A sweep that is already running finishes first. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        self.handle.cancelled.store(true, Ordering::Release);

        // Blocks only while a request is still pending. The worker drops
        // it on seeing the cancel flag, or exits and disconnects us.
        let _ = self.handle.tx.send(SweepRequest::Shutdown);

        if thread.join().is_err() {
            log::error!("sweep worker panicked");
        }
        log::debug!("sweep worker stopped");
    }
}

impl Drop for SweepWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<F>(
    rx: Receiver<SweepRequest>,
    cancelled: Arc<AtomicBool>,
    fallback: Option<Duration>,
    mut job: F,
) where
    F: FnMut(SweepCause),
{
    loop {
        let cause = match fallback {
            Some(interval) => match rx.recv_timeout(interval) {
                Ok(SweepRequest::Sweep) => SweepCause::Scheduled,
                Ok(SweepRequest::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => SweepCause::Fallback,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(SweepRequest::Sweep) => SweepCause::Scheduled,
                Ok(SweepRequest::Shutdown) | Err(_) => break,
            },
        };

        if cancelled.load(Ordering::Acquire) {
            break;
        }

        job(cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_scheduled_sweep_runs() {
        let (done_tx, done_rx) = mpsc::channel();
        let mut worker = SweepWorker::spawn(sweep_queue().1, None, move |cause| {
            let _ = done_tx.send(cause);
        })
        .unwrap();

        assert!(worker.handle().schedule());
        let cause = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(cause, SweepCause::Scheduled);

        worker.shutdown();
    }

    #[test]
    fn test_requests_coalesce() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        let counter = Arc::clone(&runs);
        let mut worker = SweepWorker::spawn(sweep_queue().1, None, move |_| {
            let _ = started_tx.send(());
            // Hold the worker busy until the test lets go
            let _ = gate_rx.recv();
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let handle = worker.handle();
        assert!(handle.schedule());
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Worker is busy: the first request fills the slot, the rest coalesce
        assert!(handle.schedule());
        assert!(!handle.schedule());
        assert!(!handle.schedule());

        gate_tx.send(()).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        gate_tx.send(()).unwrap();

        worker.shutdown();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fallback_fires_without_requests() {
        let (done_tx, done_rx) = mpsc::channel();
        let mut worker = SweepWorker::spawn(sweep_queue().1, Some(Duration::from_millis(5)), move |cause| {
            let _ = done_tx.send(cause);
        })
        .unwrap();

        let cause = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(cause, SweepCause::Fallback);
        worker.shutdown();
    }

    #[test]
    fn test_shutdown_cancels_scheduling() {
        let mut worker = SweepWorker::spawn(sweep_queue().1, None, |_| {}).unwrap();
        let handle = worker.handle();

        worker.shutdown();
        assert!(handle.is_cancelled());
        assert!(!handle.schedule());

        // Second shutdown is a no-op
        worker.shutdown();
    }
}
