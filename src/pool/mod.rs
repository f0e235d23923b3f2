//! Fixed-size worker pool for multiscan
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  try_send   ┌──────────────────┐
//! │ Dispatcher │────────────>│ Bounded queue    │
//! └────────────┘<────────────└────────┬─────────┘
//!              Refused(PoolFull, task)│ recv
//!                         ┌───────────┼───────────┐
//!                         v           v           v
//!                    ┌─────────┐ ┌─────────┐ ┌─────────┐
//!                    │ worker 0│ │ worker 1│ │ worker N│
//!                    └─────────┘ └─────────┘ └─────────┘
//! ```
//!
//! Dispatch never blocks: a full queue is reported to the caller together
//! with the task, so the caller chooses between waiting and giving up. Each
//! accepted task runs exactly once on some worker, and belongs to a
//! [`Group`] the caller can wait on.

pub mod active;
pub mod queue;
pub mod worker;

pub use active::{ActiveTask, ActiveTaskGuard, ActiveTasks};
pub use queue::{Group, QueueStats, Refused, Task};

use crate::error::{DispatchError, PoolError};
use parking_lot::Mutex;
use queue::{Job, TaskQueue};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use worker::Worker;

/// Contract the dispatcher relies on
pub trait TaskPool: Send + Sync {
    /// Open a new task group
    fn group(&self) -> Group;

    /// Queue a task without blocking
    ///
    /// On success the task will run exactly once. On failure it never runs
    /// and is handed back inside the [`Refused`].
    fn dispatch(&self, group: &Group, task: Task) -> Result<(), Refused>;
}

/// Thread-backed [`TaskPool`]
pub struct ThreadPool {
    queue: TaskQueue,
    workers: Mutex<Vec<Worker>>,
    shutdown: Arc<AtomicBool>,
    next_group: AtomicU64,
    size: usize,
}

impl ThreadPool {
    /// Spawn `worker_count` workers over a queue of `queue_size` slots
    pub fn new(worker_count: usize, queue_size: usize) -> Result<Self, PoolError> {
        let queue = TaskQueue::new(queue_size);
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(worker_count);

        for id in 0..worker_count {
            match Worker::spawn(id, queue.receiver(), Arc::clone(&shutdown)) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    shutdown.store(true, Ordering::Release);
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(e);
                }
            }
        }

        debug!(workers = worker_count, queue = queue_size, "Worker pool started");

        Ok(Self {
            queue,
            workers: Mutex::new(workers),
            shutdown,
            next_group: AtomicU64::new(1),
            size: worker_count,
        })
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently running a task
    pub fn busy_workers(&self) -> usize {
        self.queue.active_workers()
    }

    /// Tasks waiting in the queue
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Check if the pool still accepts work
    pub fn is_open(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting work, run everything already queued, join workers
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        let (completed, panicked) = worker::aggregate_stats(&workers);
        for worker in workers {
            let id = worker.id();
            if let Err(e) = worker.join() {
                warn!(worker = id, error = %e, "Worker did not exit cleanly");
            }
        }

        // A dispatch racing the shutdown flag may have landed after the
        // workers left; run it here so accepted tasks still run once.
        let receiver = self.queue.receiver();
        while let Some(job) = receiver.try_recv() {
            job.run();
        }

        debug!(
            completed = completed,
            panicked = panicked,
            full_queue = self.queue.stats().rejected_count(),
            "Worker pool stopped"
        );
    }
}

impl TaskPool for ThreadPool {
    fn group(&self) -> Group {
        Group::new(self.next_group.fetch_add(1, Ordering::Relaxed))
    }

    fn dispatch(&self, group: &Group, task: Task) -> Result<(), Refused> {
        if !self.is_open() {
            return Err(Refused::new(DispatchError::PoolClosed, task));
        }
        self.queue.sender().try_send(Job::new(group, task))
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
