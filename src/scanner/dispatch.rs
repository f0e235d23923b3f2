//! Scan dispatch
//!
//! The [`Dispatcher`] applies a verdict from the classifier and, for
//! scan-eligible files, either runs the engine inline or packages a
//! [`WorkUnit`] for the pool.
//!
//! Fan-out takes an [`EngineLease`] before dispatch. The lease travels
//! inside the unit and is dropped exactly once: after the unit runs, or
//! immediately if the pool refuses the unit.
//!
//! A full queue is backpressure, not failure: the walk waits for room and
//! offers the same unit again. Only a closed pool or a retired engine ends
//! the request.

use crate::engine::{EngineLease, ScanEngine, ScanOutcome};
use crate::error::{DispatchError, EngineError};
use crate::pool::{Task, TaskPool};
use crate::reply::{self, CleanReport, Reply};
use crate::scanner::classify::{classify, Action, ClassifyPolicy, VisitEvent, VisitReason};
use crate::scanner::{ScanContext, ScanMode};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, trace};

/// Active-task detail for multiscan units
const MULTISCAN_DETAIL: &str = "MULTISCANFILE";

/// First wait after the queue turns a unit away
const FULL_QUEUE_BACKOFF: Duration = Duration::from_millis(1);

/// Longest wait between offers to a full queue
const FULL_QUEUE_BACKOFF_MAX: Duration = Duration::from_millis(50);

/// Whether the walk keeps going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop(StopReason),
}

/// Why a walk stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A detection in SCAN mode
    Detection,

    /// Resource exhaustion, a closed pool or a retired engine
    Fatal,

    /// The request was aborted from elsewhere
    Aborted,
}

/// Applies verdicts and runs or queues scans for one request
pub struct Dispatcher {
    ctx: Arc<ScanContext>,
    policy: ClassifyPolicy,
    pool: Option<Arc<dyn TaskPool>>,
}

impl Dispatcher {
    /// Create a dispatcher
    ///
    /// Units are fanned out only in multiscan mode with both a pool and a
    /// context group; otherwise files are scanned inline.
    pub fn new(ctx: Arc<ScanContext>, pool: Option<Arc<dyn TaskPool>>) -> Self {
        let policy = ClassifyPolicy::new(ctx.mode(), ctx.config());
        Self { ctx, policy, pool }
    }

    pub fn context(&self) -> &Arc<ScanContext> {
        &self.ctx
    }

    /// Handle one walk event
    pub fn visit(&self, event: &VisitEvent) -> Flow {
        if self.ctx.is_aborted() {
            return Flow::Stop(StopReason::Aborted);
        }

        let verdict = classify(event, &self.policy);
        let counters = self.ctx.counters();

        if verdict.counts_total {
            counters.record_total();
        }
        if verdict.counts_error {
            counters.record_error();
        }
        if let Some(reply) = &verdict.reply {
            self.ctx.reporter().client(reply);
        }
        if let Some(note) = &verdict.note {
            reply::log(note.severity, &note.message);
        }

        match verdict.action {
            Action::SkipSilent | Action::SkipReport => Flow::Continue,
            Action::Fatal => {
                self.ctx.abort();
                Flow::Stop(StopReason::Fatal)
            }
            Action::Scan => {
                let size = match &event.reason {
                    VisitReason::RegularFile(facts) => facts.size,
                    _ => 0,
                };
                self.dispatch(&event.path, size)
            }
        }
    }

    fn dispatch(&self, path: &Path, size: u64) -> Flow {
        match (self.ctx.mode(), &self.pool, self.ctx.group()) {
            (ScanMode::MultiScan, Some(pool), Some(_)) => self.fan_out(pool.as_ref(), path, size),
            (mode, _, _) => {
                let outcome = scan_path(&self.ctx, self.ctx.engine().engine(), path, size, None);
                if outcome.is_fatal() {
                    self.ctx.abort();
                    Flow::Stop(StopReason::Fatal)
                } else if outcome.is_infected() && mode == ScanMode::Scan {
                    Flow::Stop(StopReason::Detection)
                } else {
                    Flow::Continue
                }
            }
        }
    }

    fn fan_out(&self, pool: &dyn TaskPool, path: &Path, size: u64) -> Flow {
        let Some(group) = self.ctx.group() else {
            return Flow::Continue;
        };

        let lease = match self.ctx.engine().acquire() {
            Ok(lease) => lease,
            Err(e) => return self.dispatch_failed(path, e),
        };

        let unit = WorkUnit {
            path: path.to_path_buf(),
            size,
            lease,
            ctx: Arc::clone(&self.ctx),
        };

        let mut task: Task = Box::new(move || unit.run());
        let mut backoff = FULL_QUEUE_BACKOFF;
        loop {
            // On a final refusal the task, and the lease inside it, is dropped here
            match pool.dispatch(group, task) {
                Ok(()) => return Flow::Continue,
                Err(refused) if refused.is_capacity() => {
                    if self.ctx.is_aborted() {
                        return Flow::Stop(StopReason::Aborted);
                    }
                    trace!(path = %path.display(), wait_ms = backoff.as_millis() as u64, "Queue full, waiting");
                    task = refused.task;
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(FULL_QUEUE_BACKOFF_MAX);
                }
                Err(refused) => return self.dispatch_failed(path, refused.reason),
            }
        }
    }

    fn dispatch_failed(&self, path: &Path, e: DispatchError) -> Flow {
        error!(path = %path.display(), error = %e, "Thread dispatch failed");
        self.ctx.counters().record_error();
        self.ctx.reporter().client(&Reply::Failed {
            subject: path.display().to_string(),
            reason: EngineError::OutOfMemory.to_string(),
        });
        self.ctx.abort();
        Flow::Stop(StopReason::Fatal)
    }
}

/// One multiscan file queued on the pool
pub struct WorkUnit {
    path: PathBuf,
    size: u64,
    lease: EngineLease,
    ctx: Arc<ScanContext>,
}

impl WorkUnit {
    /// Scan the file and post the result into the request
    pub fn run(self) {
        if self.ctx.is_aborted() {
            debug!(path = %self.path.display(), "Request aborted, unit skipped");
            return;
        }

        let outcome = scan_path(
            &self.ctx,
            self.lease.engine(),
            &self.path,
            self.size,
            Some(MULTISCAN_DETAIL),
        );
        if outcome.is_fatal() {
            self.ctx.abort();
        }
    }
}

/// Scan one file and report the outcome
///
/// Shared by the inline path and by work units.
pub(crate) fn scan_path(
    ctx: &ScanContext,
    engine: &dyn ScanEngine,
    path: &Path,
    size: u64,
    detail: Option<&'static str>,
) -> ScanOutcome {
    let subject = path.display().to_string();

    let outcome = {
        let _task = ctx.active().begin(subject.clone(), detail);
        engine.scan_path(path)
    };

    record(ctx, &subject, &subject, &outcome, size, CleanReport::LogOnly);
    outcome
}

/// Scan an already-open file, labelled `fd[N]`
///
/// Clean results are always reported.
pub fn scan_descriptor(ctx: &ScanContext, file: &mut File) -> ScanOutcome {
    let subject = descriptor_label(file);

    let metadata = match file.metadata() {
        Ok(metadata) => metadata,
        Err(e) => {
            debug!(subject = %subject, error = %e, "fstat failed");
            let outcome = ScanOutcome::Error(EngineError::Stat);
            ctx.counters().record_error();
            ctx.reporter().outcome(&subject, &subject, &outcome, CleanReport::Always);
            return outcome;
        }
    };

    if !metadata.is_file() {
        ctx.counters().record_error();
        ctx.reporter().emit(&Reply::NotRegular {
            subject: subject.clone(),
        });
        return ScanOutcome::Error(EngineError::Other("Not a regular file".to_string()));
    }

    ctx.counters().record_total();
    let outcome = {
        let _task = ctx.active().begin(subject.clone(), None);
        ctx.engine().engine().scan_file(file)
    };

    record(ctx, &subject, &subject, &outcome, metadata.len(), CleanReport::Always);
    outcome
}

/// Post an engine outcome into the request's counters, the client channel
/// and the remediation action
pub(crate) fn record(
    ctx: &ScanContext,
    subject: &str,
    log_label: &str,
    outcome: &ScanOutcome,
    size: u64,
    clean: CleanReport,
) {
    let counters = ctx.counters();
    match outcome {
        ScanOutcome::Infected(_) => counters.record_infected(),
        ScanOutcome::Error(_) => counters.record_error(),
        ScanOutcome::Clean => {}
    }
    if !matches!(outcome, ScanOutcome::Error(_)) {
        counters.record_bytes(size);
    }

    ctx.reporter().outcome(subject, log_label, outcome, clean);

    if let ScanOutcome::Infected(name) = outcome {
        ctx.remediation().run(subject, name);
    }
}

#[cfg(unix)]
fn descriptor_label(file: &File) -> String {
    use std::os::unix::io::AsRawFd;
    format!("fd[{}]", file.as_raw_fd())
}

#[cfg(not(unix))]
fn descriptor_label(_file: &File) -> String {
    "fd[-1]".to_string()
}
