//! Tree walk driver
//!
//! [`TreeWalk`] turns a `walkdir` traversal into [`VisitEvent`]s: one per
//! file, symlink, special file, unreadable entry and over-deep directory.
//! Nested directories that are simply descended into produce no event.
//!
//! [`scan_tree`] runs one request: it feeds every event to the dispatcher,
//! stops on the first stop signal, waits for the request's pool group and
//! sends the `<path>: OK` summary when nothing was found or failed.

use crate::pool::TaskPool;
use crate::reply::Reply;
use crate::scanner::classify::{FileFacts, VisitEvent, VisitReason};
use crate::scanner::dispatch::{Dispatcher, Flow, StopReason};
use crate::scanner::{ScanContext, ScanTotals};
use std::fs::{File, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

/// Event iterator over one top-level path
pub struct TreeWalk {
    inner: walkdir::IntoIter,

    /// Directories at this depth or deeper are not entered (0 = no limit)
    max_recursion: usize,

    /// Device id of `/proc`, when there is one
    procfs: Option<u64>,
}

impl TreeWalk {
    /// Walk `root` without following symlinks below it
    pub fn new(root: impl AsRef<Path>, max_recursion: usize) -> Self {
        let inner = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        Self {
            inner,
            max_recursion,
            procfs: procfs_device(),
        }
    }

    fn error_event(&self, e: walkdir::Error) -> VisitEvent {
        let top_level = e.depth() == 0;
        let path = e.path().map(Path::to_path_buf).unwrap_or_default();

        let reason = match e.io_error() {
            Some(io) if io.kind() == io::ErrorKind::OutOfMemory => VisitReason::AllocationFailure {
                detail: Some(os_error_text(io)),
            },
            Some(io) => VisitReason::StatFailure {
                detail: Some(os_error_text(io)),
            },
            None => VisitReason::StatFailure {
                detail: Some(e.to_string()),
            },
        };

        VisitEvent::new(path, top_level, reason)
    }

    fn file_event(&self, entry: DirEntry, top_level: bool) -> VisitEvent {
        match entry.metadata() {
            Ok(metadata) => {
                let facts = self.facts(entry.path(), &metadata);
                VisitEvent::new(entry.into_path(), top_level, VisitReason::RegularFile(facts))
            }
            Err(e) => {
                let detail = e.io_error().map(os_error_text).or_else(|| Some(e.to_string()));
                VisitEvent::new(entry.into_path(), top_level, VisitReason::StatFailure { detail })
            }
        }
    }

    fn facts(&self, path: &Path, metadata: &Metadata) -> FileFacts {
        let device = device_of(metadata);
        FileFacts {
            size: metadata.len(),
            device,
            readable: File::open(path).is_ok(),
            on_procfs: self.procfs == Some(device),
        }
    }
}

impl Iterator for TreeWalk {
    type Item = VisitEvent;

    fn next(&mut self) -> Option<VisitEvent> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(self.error_event(e)),
            };

            let depth = entry.depth();
            let top_level = depth == 0;
            let file_type = entry.file_type();

            if file_type.is_symlink() {
                return Some(VisitEvent::new(entry.into_path(), top_level, VisitReason::Symlink));
            }

            if file_type.is_dir() {
                if top_level {
                    return Some(VisitEvent::new(
                        entry.into_path(),
                        true,
                        VisitReason::TopLevelDirectory,
                    ));
                }
                if self.max_recursion > 0 && depth >= self.max_recursion {
                    self.inner.skip_current_dir();
                    return Some(VisitEvent::new(
                        entry.into_path(),
                        false,
                        VisitReason::RecursionLimit,
                    ));
                }
                continue;
            }

            if file_type.is_file() {
                return Some(self.file_event(entry, top_level));
            }

            return Some(VisitEvent::new(
                entry.into_path(),
                top_level,
                VisitReason::UnsupportedType,
            ));
        }
    }
}

/// Result of one tree request
#[derive(Debug, Clone)]
pub struct ScanSummary {
    /// Top-level path of the request
    pub path: PathBuf,

    /// Final counters, including every unit the request spawned
    pub totals: ScanTotals,

    /// Why the walk ended early, if it did
    pub stopped: Option<StopReason>,

    /// Wall-clock time of the request
    pub elapsed: Duration,
}

impl ScanSummary {
    /// Files visited per second
    pub fn files_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.totals.total as f64 / secs
        } else {
            0.0
        }
    }
}

/// Scan one top-level path
pub fn scan_tree(ctx: Arc<ScanContext>, pool: Option<Arc<dyn TaskPool>>, toplevel: &Path) -> ScanSummary {
    let start = Instant::now();
    let dispatcher = Dispatcher::new(Arc::clone(&ctx), pool);
    let mut stopped = None;

    debug!(path = %toplevel.display(), mode = %ctx.mode(), "Request started");

    for event in TreeWalk::new(toplevel, ctx.config().max_directory_recursion) {
        if let Flow::Stop(reason) = dispatcher.visit(&event) {
            stopped = Some(reason);
            break;
        }
    }

    // Units already queued finish (or skip) before the request reports
    if let Some(group) = ctx.group() {
        group.wait();
    }
    if stopped.is_none() && ctx.is_aborted() {
        stopped = Some(StopReason::Aborted);
    }

    let totals = ctx.counters().snapshot();
    if stopped.is_none() && totals.is_clean() {
        ctx.reporter().client(&Reply::Ok {
            subject: toplevel.display().to_string(),
        });
    }

    let summary = ScanSummary {
        path: toplevel.to_path_buf(),
        totals,
        stopped,
        elapsed: start.elapsed(),
    };

    info!(
        path = %toplevel.display(),
        files = totals.total,
        infected = totals.infected,
        errors = totals.errors,
        stopped = ?stopped,
        "Request finished"
    );

    summary
}

/// OS error text without the `(os error N)` suffix
fn os_error_text(e: &io::Error) -> String {
    let text = e.to_string();
    match text.find(" (os error") {
        Some(idx) => text[..idx].to_string(),
        None => text,
    }
}

#[cfg(unix)]
fn device_of(metadata: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.dev()
}

#[cfg(not(unix))]
fn device_of(_metadata: &Metadata) -> u64 {
    0
}

#[cfg(target_os = "linux")]
fn procfs_device() -> Option<u64> {
    std::fs::metadata("/proc").ok().map(|m| device_of(&m))
}

#[cfg(not(target_os = "linux"))]
fn procfs_device() -> Option<u64> {
    None
}
