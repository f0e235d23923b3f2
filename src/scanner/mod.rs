//! Scan requests over filesystem trees
//!
//! A request walks one top-level path. Every visited entry becomes a
//! [`VisitEvent`](classify::VisitEvent), the classifier decides what to do
//! with it, and the dispatcher either scans inline or fans the file out to
//! the worker pool.
//!
//! ```text
//!  walkdir ──> VisitEvent ──> classify() ──> Verdict
//!                                              │
//!                               ┌──────────────┴──────────────┐
//!                               v                             v
//!                        Scan: inline scan            MultiScan: WorkUnit
//!                        (walk thread)                 -> TaskPool
//! ```
//!
//! All state for one request lives in a [`ScanContext`] shared by every
//! unit the request spawns. Counters are atomics so multiscan units can
//! post results without locking.

pub mod classify;
pub mod dispatch;
pub mod walk;

pub use classify::{classify, Action, ClassifyPolicy, FileFacts, Note, Verdict, VisitEvent, VisitReason};
pub use dispatch::{scan_descriptor, Dispatcher, Flow, StopReason};
pub use walk::{scan_tree, ScanSummary, TreeWalk};

use crate::config::ScanConfig;
use crate::engine::EngineHandle;
use crate::pool::{ActiveTasks, Group};
use crate::remedy::{NoRemediation, Remediation};
use crate::reply::Reporter;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// How eligible files are scanned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Inline on the walk thread; the first detection stops the walk
    Scan,

    /// Fanned out to the worker pool; the walk never stops on a detection
    MultiScan,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Scan => f.write_str("SCAN"),
            ScanMode::MultiScan => f.write_str("MULTISCAN"),
        }
    }
}

/// Per-request counters
#[derive(Debug, Default)]
pub struct ScanCounters {
    /// Regular files visited
    pub total: AtomicU64,

    /// Detections
    pub infected: AtomicU64,

    /// Errors reported
    pub errors: AtomicU64,

    /// Bytes handed to the engine
    pub bytes_scanned: AtomicU64,
}

impl ScanCounters {
    pub fn record_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_infected(&self) {
        self.infected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_scanned.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> ScanTotals {
        ScanTotals {
            total: self.total.load(Ordering::Relaxed),
            infected: self.infected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_scanned: self.bytes_scanned.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`ScanCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanTotals {
    pub total: u64,
    pub infected: u64,
    pub errors: u64,
    pub bytes_scanned: u64,
}

impl ScanTotals {
    /// Returns true if nothing was found and nothing failed
    pub fn is_clean(&self) -> bool {
        self.infected == 0 && self.errors == 0
    }
}

impl std::ops::AddAssign for ScanTotals {
    fn add_assign(&mut self, other: Self) {
        self.total += other.total;
        self.infected += other.infected;
        self.errors += other.errors;
        self.bytes_scanned += other.bytes_scanned;
    }
}

/// State shared by everything one request spawns
pub struct ScanContext {
    mode: ScanMode,
    counters: ScanCounters,
    reporter: Reporter,
    engine: EngineHandle,
    config: Arc<ScanConfig>,
    remediation: Arc<dyn Remediation>,
    active: ActiveTasks,
    group: Option<Group>,

    /// Set by a fatal outcome; stops this request only
    abort: AtomicBool,

    /// Set from outside (Ctrl-C); stops every request sharing it
    interrupt: Option<Arc<AtomicBool>>,
}

impl ScanContext {
    /// Create a context with no remediation, no group and a private
    /// active-task registry
    pub fn new(mode: ScanMode, engine: EngineHandle, reporter: Reporter, config: Arc<ScanConfig>) -> Self {
        Self {
            mode,
            counters: ScanCounters::default(),
            reporter,
            engine,
            config,
            remediation: Arc::new(NoRemediation),
            active: ActiveTasks::new(),
            group: None,
            abort: AtomicBool::new(false),
            interrupt: None,
        }
    }

    /// Run this action on every detection
    pub fn with_remediation(mut self, remediation: Arc<dyn Remediation>) -> Self {
        self.remediation = remediation;
        self
    }

    /// Report active tasks into a shared registry
    pub fn with_active_tasks(mut self, active: ActiveTasks) -> Self {
        self.active = active;
        self
    }

    /// Attach the pool group this request's units are dispatched under
    pub fn with_group(mut self, group: Group) -> Self {
        self.group = Some(group);
        self
    }

    /// Observe an external interrupt flag
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    pub fn counters(&self) -> &ScanCounters {
        &self.counters
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn remediation(&self) -> &dyn Remediation {
        self.remediation.as_ref()
    }

    pub fn active(&self) -> &ActiveTasks {
        &self.active
    }

    pub fn group(&self) -> Option<&Group> {
        self.group.as_ref()
    }

    /// Stop the request: the walk dispatches nothing further and queued
    /// units skip their scan
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    /// Returns true once the request was aborted or interrupted
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
            || self
                .interrupt
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

impl fmt::Debug for ScanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanContext")
            .field("mode", &self.mode)
            .field("counters", &self.counters.snapshot())
            .field("group", &self.group)
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}
