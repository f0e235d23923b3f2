//! Per-thread registry of what each worker is doing
//!
//! Used for diagnostics: the progress display shows which file each
//! thread is busy with. A slot exists only while its guard is alive.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// What one thread is working on
#[derive(Debug, Clone)]
pub struct ActiveTask {
    /// Thread name, if any
    pub thread: Option<String>,

    /// Subject being worked on (usually a path)
    pub label: String,

    /// Short description of the operation
    pub detail: Option<&'static str>,

    /// When the task started
    pub started: Instant,
}

impl ActiveTask {
    /// Time spent on the task so far
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Shared registry of active tasks
#[derive(Clone, Default)]
pub struct ActiveTasks {
    slots: Arc<Mutex<HashMap<ThreadId, ActiveTask>>>,
}

impl ActiveTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label the calling thread until the returned guard is dropped
    pub fn begin(&self, label: impl Into<String>, detail: Option<&'static str>) -> ActiveTaskGuard {
        let current = thread::current();
        let task = ActiveTask {
            thread: current.name().map(str::to_string),
            label: label.into(),
            detail,
            started: Instant::now(),
        };
        self.slots.lock().insert(current.id(), task);

        ActiveTaskGuard {
            tasks: self.clone(),
            thread: current.id(),
        }
    }

    /// Copy of all active slots, oldest first
    pub fn snapshot(&self) -> Vec<ActiveTask> {
        let mut tasks: Vec<_> = self.slots.lock().values().cloned().collect();
        tasks.sort_by_key(|t| t.started);
        tasks
    }

    /// Number of labelled threads
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

/// Clears the thread's slot on drop
pub struct ActiveTaskGuard {
    tasks: ActiveTasks,
    thread: ThreadId,
}

impl Drop for ActiveTaskGuard {
    fn drop(&mut self) {
        self.tasks.slots.lock().remove(&self.thread);
    }
}
