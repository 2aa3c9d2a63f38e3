//! Trace batching and flush scheduling
//!
//! Completed traces from every execution in the process land in one shared
//! queue. A batch leaves the queue when either trigger fires first:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ EXECUTION THREADS                                            │
//! │   handle_trace_event(trace) → queue.push(trace)              │
//! │   queue.len() == max_batch_size → drain + flush (caller)     │
//! └──────────────────────────────────────────────────────────────┘
//!                          │ Mutex<Vec<Trace>>
//!                          ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │ SCHEDULER THREAD                                             │
//! │   every flush_interval: drain non-empty queue + flush        │
//! │   on stop: final drain + flush, then flusher.shutdown()      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Draining happens under the mutex and flushing outside it, so a slow
//! upload never blocks ingestion and no trace is flushed twice. A failed
//! flush drops its batch; nothing is retried.
//!
//! The stopped flag is only flipped while the queue lock is held, and every
//! flush runs under a shared read gate that the final flush takes for write.
//! A trace is either accepted before stop and flushed before
//! `Flusher::shutdown`, or refused and counted as dropped.

use crate::config::ConfigError;
use crate::event::Trace;
use crossbeam::channel::{self, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a [`Flusher`]
#[derive(Error, Debug)]
pub enum FlushError {
    #[error("export failed: {0}")]
    Export(String),

    #[error("transport shutdown failed: {0}")]
    Shutdown(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Delivery capability injected into a [`TraceBatcher`]
pub trait Flusher: Send + Sync + 'static {
    /// Deliver one batch; called with a non-empty batch once per trigger
    fn flush(&self, batch: Vec<Trace>) -> Result<(), FlushError>;

    /// Release the underlying transport after the final flush
    fn shutdown(&self) -> Result<(), FlushError> {
        Ok(())
    }
}

/// Anything that accepts completed traces
pub trait TraceSink: Send + Sync {
    fn handle_trace_event(&self, trace: Trace);
}

/// Count and time thresholds for flushing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Flush as soon as this many traces are queued
    pub max_batch_size: usize,
    /// Flush whatever is queued at least this often (milliseconds)
    pub flush_interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            flush_interval_ms: 1000,
        }
    }
}

impl BatchConfig {
    /// Sub-millisecond intervals round up to 1 ms; only a zero interval stays zero
    pub fn new(max_batch_size: usize, flush_interval: Duration) -> Self {
        let mut flush_interval_ms = u64::try_from(flush_interval.as_millis()).unwrap_or(u64::MAX);
        if flush_interval_ms == 0 && !flush_interval.is_zero() {
            flush_interval_ms = 1;
        }
        Self {
            max_batch_size,
            flush_interval_ms,
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "max_batch_size must be > 0".to_string(),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "flush_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// What caused a flush (for logs)
#[derive(Debug, Clone, Copy)]
enum FlushTrigger {
    Count,
    Timer,
    Manual,
    Final,
}

/// Batcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub traces_received: u64,
    pub batches_flushed: u64,
    pub batches_failed: u64,
    /// Traces lost to failed flushes or arriving after stop
    pub traces_dropped: u64,
    pub pending: usize,
}

struct Shared<F> {
    queue: Mutex<Vec<Trace>>,
    /// Read by every in-flight flush, written by the final flush
    gate: RwLock<()>,
    flusher: F,
    stopped: AtomicBool,
    traces_received: AtomicU64,
    batches_flushed: AtomicU64,
    batches_failed: AtomicU64,
    traces_dropped: AtomicU64,
}

impl<F: Flusher> Shared<F> {
    fn queue(&self) -> MutexGuard<'_, Vec<Trace>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drain(&self) -> Vec<Trace> {
        std::mem::take(&mut *self.queue())
    }

    fn read_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drain and flush while holding the read gate
    fn flush_queued(&self, trigger: FlushTrigger) -> Result<(), FlushError> {
        let _gate = self.read_gate();
        self.flush_batch(self.drain(), trigger)
    }

    /// Flip the stopped flag under the queue lock; true if it was already set
    fn mark_stopped(&self) -> bool {
        let _queue = self.queue();
        self.stopped.swap(true, Ordering::SeqCst)
    }

    fn flush_batch(&self, batch: Vec<Trace>, trigger: FlushTrigger) -> Result<(), FlushError> {
        if batch.is_empty() {
            return Ok(());
        }

        let size = batch.len();
        tracing::debug!(traces = size, ?trigger, "flushing trace batch");
        match self.flusher.flush(batch) {
            Ok(()) => {
                self.batches_flushed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.batches_failed.fetch_add(1, Ordering::Relaxed);
                self.traces_dropped.fetch_add(size as u64, Ordering::Relaxed);
                tracing::error!(traces = size, ?trigger, "flush failed, dropping batch: {}", e);
                Err(e)
            }
        }
    }

    /// Last flush before the transport goes away
    fn final_flush(&self) {
        let _gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        let _ = self.flush_batch(self.drain(), FlushTrigger::Final);
        if let Err(e) = self.flusher.shutdown() {
            tracing::error!("failed to shut down trace transport: {}", e);
        }
    }
}

struct Scheduler {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Process-wide trace buffer with count and interval flush triggers
///
/// # Example
///
/// ```
/// use rastreo::batcher::{BatchConfig, FlushError, Flusher, TraceBatcher};
/// use rastreo::event::{TelemetryId, Trace};
/// use std::time::Duration;
///
/// struct Discard;
///
/// impl Flusher for Discard {
///     fn flush(&self, _batch: Vec<Trace>) -> Result<(), FlushError> {
///         Ok(())
///     }
/// }
///
/// let batcher = TraceBatcher::new(BatchConfig::new(2, Duration::from_secs(1)), Discard)?;
/// batcher.start();
/// batcher.handle_trace_event(Trace::new(TelemetryId::new(), Vec::new()));
/// batcher.handle_trace_event(Trace::new(TelemetryId::new(), Vec::new()));
/// assert_eq!(batcher.stats().batches_flushed, 1);
/// batcher.stop(true);
/// # Ok::<(), rastreo::config::ConfigError>(())
/// ```
pub struct TraceBatcher<F: Flusher> {
    shared: Arc<Shared<F>>,
    config: BatchConfig,
    scheduler: Mutex<Option<Scheduler>>,
}

impl<F: Flusher> TraceBatcher<F> {
    /// Fails if `max_batch_size` or `flush_interval_ms` is zero
    pub fn new(config: BatchConfig, flusher: F) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Vec::with_capacity(config.max_batch_size)),
                gate: RwLock::new(()),
                flusher,
                stopped: AtomicBool::new(false),
                traces_received: AtomicU64::new(0),
                batches_flushed: AtomicU64::new(0),
                batches_failed: AtomicU64::new(0),
                traces_dropped: AtomicU64::new(0),
            }),
            config,
            scheduler: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn flusher(&self) -> &F {
        &self.shared.flusher
    }

    /// Arm the interval scheduler; a second call is a no-op
    pub fn start(&self) {
        let mut slot = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() || self.shared.stopped.load(Ordering::SeqCst) {
            return;
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let interval = self.config.flush_interval();
        let handle = thread::spawn(move || {
            let ticker = channel::tick(interval);
            loop {
                channel::select! {
                    recv(ticker) -> _ => {
                        let _ = shared.flush_queued(FlushTrigger::Timer);
                    }
                    recv(stop_rx) -> _ => break,
                }
            }
            shared.final_flush();
        });

        tracing::debug!(?interval, "trace flush scheduler started");
        *slot = Some(Scheduler { stop_tx, handle });
    }

    /// Queue a completed trace, flushing synchronously at the count threshold
    pub fn handle_trace_event(&self, trace: Trace) {
        let _gate = self.shared.read_gate();
        let ready = {
            let mut queue = self.shared.queue();
            if self.shared.stopped.load(Ordering::SeqCst) {
                drop(queue);
                self.shared.traces_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(trace_id = %trace.telemetry_id, "batcher stopped, dropping trace");
                return;
            }
            self.shared.traces_received.fetch_add(1, Ordering::Relaxed);
            queue.push(trace);
            if queue.len() >= self.config.max_batch_size {
                Some(std::mem::take(&mut *queue))
            } else {
                None
            }
        };

        if let Some(batch) = ready {
            let _ = self.shared.flush_batch(batch, FlushTrigger::Count);
        }
    }

    /// Flush whatever is queued now; an empty queue is a successful no-op
    pub fn flush_pending(&self) -> Result<(), FlushError> {
        self.shared.flush_queued(FlushTrigger::Manual)
    }

    /// Halt the scheduler, flush what remains and shut the transport down
    ///
    /// With `wait` the call returns once both have completed; otherwise they
    /// run on a detached thread. Count flushes already in flight finish
    /// before the transport is shut down.
    pub fn stop(&self, wait: bool) {
        if self.shared.mark_stopped() {
            return;
        }

        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match scheduler {
            Some(Scheduler { stop_tx, handle }) => {
                let _ = stop_tx.send(());
                if wait && handle.join().is_err() {
                    tracing::error!("trace flush scheduler panicked");
                }
            }
            None if wait => self.shared.final_flush(),
            None => {
                let shared = Arc::clone(&self.shared);
                thread::spawn(move || shared.final_flush());
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            traces_received: self.shared.traces_received.load(Ordering::Relaxed),
            batches_flushed: self.shared.batches_flushed.load(Ordering::Relaxed),
            batches_failed: self.shared.batches_failed.load(Ordering::Relaxed),
            traces_dropped: self.shared.traces_dropped.load(Ordering::Relaxed),
            pending: self.shared.queue().len(),
        }
    }
}

impl<F: Flusher> TraceSink for TraceBatcher<F> {
    fn handle_trace_event(&self, trace: Trace) {
        TraceBatcher::handle_trace_event(self, trace);
    }
}

impl<F: Flusher> Drop for TraceBatcher<F> {
    fn drop(&mut self) {
        self.stop(true);
    }
}
