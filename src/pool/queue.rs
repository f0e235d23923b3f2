//! Task queue with fail-fast dispatch
//!
//! This module provides the bounded queue feeding the worker pool. When the
//! queue is full, dispatch fails immediately with a capacity error instead
//! of blocking. The refused task is handed back in a [`Refused`] so the
//! caller can decide whether to wait and offer it again.
//!
//! Every queued job carries a [`GroupTicket`]; the ticket is released when
//! the job finishes (or is dropped), which is what [`Group::wait`] waits on.

use crate::error::DispatchError;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A unit of work as the pool sees it
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Batch of tasks that can be waited on together
#[derive(Clone)]
pub struct Group {
    id: u64,
    state: Arc<GroupState>,
}

#[derive(Default)]
struct GroupState {
    pending: Mutex<usize>,
    idle: Condvar,
}

impl Group {
    /// Create an empty group
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: Arc::new(GroupState::default()),
        }
    }

    /// Group identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Tasks accepted but not yet finished
    pub fn pending(&self) -> usize {
        *self.state.pending.lock()
    }

    /// Block until every task in the group has finished
    pub fn wait(&self) {
        let mut pending = self.state.pending.lock();
        while *pending > 0 {
            self.state.idle.wait(&mut pending);
        }
    }

    /// Block until the group drains or the timeout passes
    ///
    /// Returns true if the group drained.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.state.pending.lock();
        while *pending > 0 {
            if self.state.idle.wait_for(&mut pending, timeout).timed_out() {
                return *pending == 0;
            }
        }
        true
    }

    /// Register one task with the group
    pub fn enter(&self) -> GroupTicket {
        *self.state.pending.lock() += 1;
        GroupTicket {
            group: self.clone(),
        }
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Membership of one task in a group; released on drop
pub struct GroupTicket {
    group: Group,
}

impl Drop for GroupTicket {
    fn drop(&mut self) {
        let mut pending = self.group.state.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.group.state.idle.notify_all();
        }
    }
}

/// A task bound to its group
pub struct Job {
    task: Task,
    _ticket: GroupTicket,
}

impl Job {
    /// Bind a task to a group
    pub fn new(group: &Group, task: Task) -> Self {
        Self {
            _ticket: group.enter(),
            task,
        }
    }

    /// Run the task; the ticket is released when the job is consumed
    pub fn run(self) {
        (self.task)();
    }

    /// Unbind the task, leaving its group
    fn into_task(self) -> Task {
        self.task
    }
}

/// A task the pool did not accept, returned to its owner
pub struct Refused {
    /// Why the task was refused
    pub reason: DispatchError,

    /// The task itself, never run
    pub task: Task,
}

impl Refused {
    pub fn new(reason: DispatchError, task: Task) -> Self {
        Self { reason, task }
    }

    /// Check if the pool was only full (offering the task later may work)
    pub fn is_capacity(&self) -> bool {
        self.reason.is_capacity()
    }
}

impl fmt::Debug for Refused {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Refused")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

/// Statistics for the task queue
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Total jobs enqueued
    pub enqueued: AtomicU64,

    /// Total jobs dequeued
    pub dequeued: AtomicU64,

    /// Offers refused because the queue was full
    pub rejected: AtomicU64,
}

impl QueueStats {
    /// Get number of rejected jobs
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Bounded job queue
pub struct TaskQueue {
    /// Sender for adding jobs
    sender: Sender<Job>,

    /// Receiver for getting jobs
    receiver: Receiver<Job>,

    /// Number of workers currently running a job
    active_workers: Arc<AtomicUsize>,

    /// Queue statistics
    stats: Arc<QueueStats>,
}

impl TaskQueue {
    /// Create a new queue with the specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);

        Self {
            sender,
            receiver,
            active_workers: Arc::new(AtomicUsize::new(0)),
            stats: Arc::new(QueueStats::default()),
        }
    }

    /// Get a sender for this queue
    pub fn sender(&self) -> TaskSender {
        TaskSender {
            sender: self.sender.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Get a receiver for this queue (clone for each worker)
    pub fn receiver(&self) -> TaskReceiver {
        TaskReceiver {
            receiver: self.receiver.clone(),
            active_workers: Arc::clone(&self.active_workers),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Get queue statistics
    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }

    /// Number of workers currently running a job
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Get current queue length
    pub fn len(&self) -> usize {
        self.receiver.len()
    }
}

/// Handle for sending jobs to the queue
#[derive(Clone)]
pub struct TaskSender {
    sender: Sender<Job>,
    stats: Arc<QueueStats>,
}

impl TaskSender {
    /// Try to queue a job without blocking
    ///
    /// A refused job leaves its group and its task comes back to the caller.
    pub fn try_send(&self, job: Job) -> Result<(), Refused> {
        match self.sender.try_send(job) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(Refused::new(DispatchError::PoolFull, job.into_task()))
            }
            Err(TrySendError::Disconnected(job)) => {
                Err(Refused::new(DispatchError::PoolClosed, job.into_task()))
            }
        }
    }
}

/// Handle for receiving jobs from the queue
#[derive(Clone)]
pub struct TaskReceiver {
    receiver: Receiver<Job>,
    active_workers: Arc<AtomicUsize>,
    stats: Arc<QueueStats>,
}

impl TaskReceiver {
    /// Try to receive a job without blocking
    pub fn try_recv(&self) -> Option<Job> {
        match self.receiver.try_recv() {
            Ok(job) => {
                self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
                Some(job)
            }
            Err(_) => None,
        }
    }

    /// Receive with timeout
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Job> {
        match self.receiver.recv_timeout(timeout) {
            Ok(job) => {
                self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
                Some(job)
            }
            Err(_) => None,
        }
    }

    /// Mark this worker as active
    pub fn begin_work(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    /// Mark this worker as idle
    pub fn end_work(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// RAII guard for marking work as active
pub struct WorkGuard<'a> {
    receiver: &'a TaskReceiver,
}

impl<'a> WorkGuard<'a> {
    /// Create a new work guard (marks worker as active)
    pub fn new(receiver: &'a TaskReceiver) -> Self {
        receiver.begin_work();
        Self { receiver }
    }
}

impl<'a> Drop for WorkGuard<'a> {
    fn drop(&mut self) {
        self.receiver.end_work();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn noop() -> Task {
        Box::new(|| {})
    }

    #[test]
    fn test_queue_basic() {
        let queue = TaskQueue::new(10);
        let group = Group::new(1);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        queue
            .sender()
            .try_send(Job::new(&group, Box::new(move || flag.store(true, Ordering::SeqCst))))
            .unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(group.pending(), 1);

        queue.receiver().try_recv().unwrap().run();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(group.pending(), 0);
    }

    #[test]
    fn test_queue_full_fails_fast() {
        let queue = TaskQueue::new(2);
        let sender = queue.sender();
        let group = Group::new(1);

        sender.try_send(Job::new(&group, noop())).unwrap();
        sender.try_send(Job::new(&group, noop())).unwrap();

        // Queue is full - the rejected job gives its ticket back
        let refused = sender.try_send(Job::new(&group, noop())).unwrap_err();
        assert_eq!(refused.reason, DispatchError::PoolFull);
        assert!(refused.is_capacity());
        assert_eq!(group.pending(), 2);
        assert_eq!(queue.stats().rejected_count(), 1);
    }

    #[test]
    fn test_refused_task_is_returned() {
        let queue = TaskQueue::new(1);
        let sender = queue.sender();
        let group = Group::new(1);
        let ran = Arc::new(AtomicBool::new(false));

        sender.try_send(Job::new(&group, noop())).unwrap();
        let flag = Arc::clone(&ran);
        let refused = sender
            .try_send(Job::new(&group, Box::new(move || flag.store(true, Ordering::SeqCst))))
            .unwrap_err();

        // Drain the slot and offer the same task again
        queue.receiver().try_recv().unwrap().run();
        sender.try_send(Job::new(&group, refused.task)).unwrap();
        queue.receiver().try_recv().unwrap().run();

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(group.pending(), 0);
    }

    #[test]
    fn test_work_guard_tracks_active_workers() {
        let queue = TaskQueue::new(10);
        let receiver = queue.receiver();
        let group = Group::new(1);

        queue.sender().try_send(Job::new(&group, noop())).unwrap();
        assert_eq!(queue.active_workers(), 0);

        let guard = WorkGuard::new(&receiver);
        let job = receiver.try_recv().unwrap();

        // Queue empty but worker active
        assert!(queue.is_empty());
        assert_eq!(queue.active_workers(), 1);

        job.run();
        drop(guard);
        assert_eq!(queue.active_workers(), 0);
    }

    #[test]
    fn test_group_wait() {
        let group = Group::new(7);
        let tickets: Vec<_> = (0..4).map(|_| group.enter()).collect();
        assert_eq!(group.pending(), 4);
        assert!(!group.wait_timeout(Duration::from_millis(10)));

        let handle = thread::spawn(move || drop(tickets));
        group.wait();
        handle.join().unwrap();

        assert_eq!(group.pending(), 0);
        assert!(group.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_dropped_job_releases_ticket() {
        let group = Group::new(1);
        let job = Job::new(&group, noop());
        assert_eq!(group.pending(), 1);
        drop(job);
        assert_eq!(group.pending(), 0);
    }
}
