//! Capture threads.
//!
//! One `CaptureWorker` per `FrameSource`. The worker thread owns the source for its
//! whole life, reads at the backend's native rate, and publishes every frame into
//! the source's `CaptureBuffer`. The device handle is dropped on the worker thread
//! after its loop exits, so nothing can touch it after release.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::frame::{CaptureBuffer, RawFrame};

/// A capture backend producing `RawFrame`s.
pub trait FrameSource: Send {
    /// Source identifier (e.g. "left").
    fn id(&self) -> &str;

    /// Open (or reopen) the underlying device.
    fn connect(&mut self) -> Result<()>;

    /// Capture the next frame.
    ///
    /// `Ok(None)` means no frame this attempt (dropped, timed out, discarded).
    /// `Err` means the connection is gone and `connect` must be called again.
    fn next_frame(&mut self) -> Result<Option<RawFrame>>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Counters for one source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub device: String,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub backlog_discards: u64,
    pub reconnects: u64,
    pub healthy: bool,
}

/// Owns the capture thread for one source.
pub struct CaptureWorker {
    id: String,
    buffer: Arc<CaptureBuffer>,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<SourceStats>>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    /// Start capturing from an already connected source.
    pub fn spawn(source: Box<dyn FrameSource>, reconnect_delay: Duration) -> Result<Self> {
        let id = source.id().to_string();
        let buffer = Arc::new(CaptureBuffer::new(id.clone()));
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(Mutex::new(source.stats()));

        let handle = {
            let buffer = Arc::clone(&buffer);
            let running = Arc::clone(&running);
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name(format!("capture-{}", id))
                .spawn(move || capture_loop(source, buffer, running, stats, reconnect_delay))
                .with_context(|| format!("spawn capture thread for source {}", id))?
        };

        log::info!("CaptureWorker: started source {}", id);
        Ok(Self {
            id,
            buffer,
            running,
            stats,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The slot this worker publishes into.
    pub fn buffer(&self) -> Arc<CaptureBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn stats(&self) -> SourceStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Signal the thread to stop and join it, waiting at most `timeout`.
    ///
    /// Returns false if the thread did not exit in time; it is then detached and
    /// will release its device when its current read returns.
    pub fn stop(mut self, timeout: Duration) -> bool {
        self.running.store(false, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(
                    "CaptureWorker: source {} did not stop within {:?}; detaching",
                    self.id,
                    timeout
                );
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }

        if handle.join().is_err() {
            log::error!("CaptureWorker: capture thread for {} panicked", self.id);
        } else {
            log::info!("CaptureWorker: stopped source {}", self.id);
        }
        true
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Start a worker for each source in order.
///
/// Sources are pulled lazily, so a source is only opened once every earlier one
/// is running. On the first failure the running workers are stopped, waiting at
/// most `shutdown_timeout` each, and the error is returned.
pub fn start_workers<I>(
    sources: I,
    reconnect_delay: Duration,
    shutdown_timeout: Duration,
) -> Result<Vec<CaptureWorker>>
where
    I: IntoIterator<Item = Result<Box<dyn FrameSource>>>,
{
    let mut workers = Vec::new();
    for source in sources {
        match source.and_then(|source| CaptureWorker::spawn(source, reconnect_delay)) {
            Ok(worker) => workers.push(worker),
            Err(err) => {
                if !workers.is_empty() {
                    log::warn!(
                        "CaptureWorker: startup failed, stopping {} started sources",
                        workers.len()
                    );
                    stop_workers(workers, shutdown_timeout);
                }
                return Err(err);
            }
        }
    }
    Ok(workers)
}

/// Stop every worker, waiting at most `timeout` each. Returns how many stopped cleanly.
pub fn stop_workers(workers: Vec<CaptureWorker>, timeout: Duration) -> usize {
    workers
        .into_iter()
        .map(|worker| worker.stop(timeout))
        .filter(|&clean| clean)
        .count()
}

fn capture_loop(
    mut source: Box<dyn FrameSource>,
    buffer: Arc<CaptureBuffer>,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<SourceStats>>,
    reconnect_delay: Duration,
) {
    let mut reconnects = 0u64;
    while running.load(Ordering::Acquire) {
        match source.next_frame() {
            Ok(Some(frame)) => buffer.publish(frame),
            Ok(None) => {}
            Err(err) => {
                log::warn!(
                    "CaptureWorker: source {} failed: {:#}; reconnecting in {:?}",
                    source.id(),
                    err,
                    reconnect_delay
                );
                if !sleep_while_running(&running, reconnect_delay) {
                    break;
                }
                reconnects += 1;
                match source.connect() {
                    Ok(()) => log::info!("CaptureWorker: source {} reconnected", source.id()),
                    Err(err) => log::warn!(
                        "CaptureWorker: reconnect of {} failed: {:#}",
                        source.id(),
                        err
                    ),
                }
            }
        }

        let mut snapshot = source.stats();
        snapshot.reconnects = reconnects;
        snapshot.healthy = source.is_healthy();
        *stats.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
    // Source (and its device handle) is dropped here, on the capture thread.
}

fn sleep_while_running(running: &AtomicBool, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(20)));
    }
    false
}
