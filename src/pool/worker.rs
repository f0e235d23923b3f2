//! Worker thread logic for the scan pool
//!
//! Each worker:
//! - Pulls jobs from the shared task queue
//! - Runs each job exactly once, isolating panics to that job
//! - Keeps draining until shutdown is requested and the queue is empty

use crate::error::PoolError;
use crate::pool::queue::{TaskReceiver, WorkGuard};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// How long an idle worker waits before re-checking for shutdown
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Statistics collected by a worker
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Jobs that ran to completion
    pub completed: AtomicU64,

    /// Jobs that panicked
    pub panicked: AtomicU64,
}

impl WorkerStats {
    fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_panic(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }
}

/// A worker thread that runs queued jobs
pub struct Worker {
    /// Worker ID
    id: usize,

    /// Thread handle
    handle: Option<JoinHandle<()>>,

    /// Worker statistics
    stats: Arc<WorkerStats>,
}

impl Worker {
    /// Spawn a new worker thread
    pub fn spawn(
        id: usize,
        queue_rx: TaskReceiver,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, PoolError> {
        let stats = Arc::new(WorkerStats::default());
        let stats_clone = Arc::clone(&stats);

        let handle = thread::Builder::new()
            .name(format!("scand-worker-{}", id))
            .spawn(move || worker_loop(id, queue_rx, shutdown, stats_clone))
            .map_err(|e| PoolError::Spawn {
                id,
                reason: e.to_string(),
            })?;

        Ok(Self {
            id,
            handle: Some(handle),
            stats,
        })
    }

    /// Get worker ID
    pub fn id(&self) -> usize {
        self.id
    }

    /// Get worker statistics
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Wait for the worker to finish
    pub fn join(mut self) -> Result<(), PoolError> {
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| PoolError::Panicked {
                id: self.id,
                message: "Worker thread panicked".into(),
            })
        } else {
            Ok(())
        }
    }
}

/// Main worker loop
fn worker_loop(
    id: usize,
    queue_rx: TaskReceiver,
    shutdown: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
) {
    debug!(worker = id, "Worker starting");

    loop {
        let job = match queue_rx.recv_timeout(IDLE_POLL) {
            Some(job) => job,
            None if shutdown.load(Ordering::Acquire) && queue_rx.is_empty() => break,
            None => continue,
        };

        // Mark as actively working
        let _guard = WorkGuard::new(&queue_rx);

        // The job's group ticket is released during unwinding too
        match panic::catch_unwind(AssertUnwindSafe(move || job.run())) {
            Ok(()) => stats.record_completed(),
            Err(payload) => {
                stats.record_panic();
                error!(
                    worker = id,
                    panic = %panic_message(payload.as_ref()),
                    "Task panicked"
                );
            }
        }
    }

    debug!(
        worker = id,
        completed = stats.completed.load(Ordering::Relaxed),
        "Worker shutting down"
    );
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Aggregate statistics from multiple workers
pub fn aggregate_stats(workers: &[Worker]) -> (u64, u64) {
    let mut completed = 0u64;
    let mut panicked = 0u64;

    for worker in workers {
        completed += worker.stats.completed.load(Ordering::Relaxed);
        panicked += worker.stats.panicked.load(Ordering::Relaxed);
    }

    (completed, panicked)
}
