//! Walk-event classification
//!
//! [`classify`] maps one [`VisitEvent`] to a [`Verdict`]: what to do with
//! the entry, what (if anything) the client is told, what is logged and
//! which counters move. It performs no I/O; everything it needs is in the
//! event and the policy, so the same input always yields the same verdict.
//!
//! Regular files go through the eligibility checks in order:
//! 1. On the process-information filesystem: skipped without a word
//! 2. Matches the exclude pattern: `Excluded` (not in multiscan)
//! 3. Zero length: `Empty file` (top-level only)
//! 4. Unreadable: `Access denied. ERROR`

use crate::config::ScanConfig;
use crate::reply::{Reply, Severity};
use crate::scanner::ScanMode;
use regex::Regex;
use std::path::{Path, PathBuf};

/// Why the walk is visiting an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisitReason {
    /// Memory ran out while walking
    AllocationFailure { detail: Option<String> },

    /// The entry could not be stat'ed
    StatFailure { detail: Option<String> },

    /// A directory deeper than the recursion limit
    RecursionLimit,

    /// A symbolic link (never followed below the top level)
    Symlink,

    /// A socket, FIFO, device node or similar
    UnsupportedType,

    /// The directory the request was started on
    TopLevelDirectory,

    /// A regular file
    RegularFile(FileFacts),
}

/// Metadata snapshot of a regular file taken by the walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFacts {
    /// Size in bytes
    pub size: u64,

    /// Device the file lives on
    pub device: u64,

    /// Whether the file can be opened for reading
    pub readable: bool,

    /// Whether the device is the process-information pseudo filesystem
    pub on_procfs: bool,
}

/// One entry produced by the walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitEvent {
    pub path: PathBuf,

    /// True for the path the request was started on
    pub top_level: bool,

    pub reason: VisitReason,
}

impl VisitEvent {
    pub fn new(path: impl Into<PathBuf>, top_level: bool, reason: VisitReason) -> Self {
        Self {
            path: path.into(),
            top_level,
            reason,
        }
    }

    /// Path as reported to the client
    pub fn subject(&self) -> String {
        self.path.display().to_string()
    }
}

/// What the walk does with an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Skip; nothing sent to the client
    SkipSilent,

    /// Skip and tell the client why
    SkipReport,

    /// Hand to the dispatcher
    Scan,

    /// Abort the walk
    Fatal,
}

/// A log line that goes with a verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub severity: Severity,
    pub message: String,
}

impl Note {
    fn new(severity: Severity, message: String) -> Self {
        Self { severity, message }
    }
}

/// The classifier's decision for one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub action: Action,

    /// Line for the client, if any
    pub reply: Option<Reply>,

    /// Line for the log, if any
    pub note: Option<Note>,

    /// Count the entry as a visited regular file
    pub counts_total: bool,

    /// Count the entry as an error
    pub counts_error: bool,
}

impl Verdict {
    fn new(action: Action) -> Self {
        Self {
            action,
            reply: None,
            note: None,
            counts_total: false,
            counts_error: false,
        }
    }

    fn reply(mut self, reply: Reply) -> Self {
        self.reply = Some(reply);
        self
    }

    fn reply_if(self, condition: bool, reply: impl FnOnce() -> Reply) -> Self {
        if condition {
            self.reply(reply())
        } else {
            self
        }
    }

    fn note(mut self, severity: Severity, message: String) -> Self {
        self.note = Some(Note::new(severity, message));
        self
    }

    fn total(mut self) -> Self {
        self.counts_total = true;
        self
    }

    fn error(mut self) -> Self {
        self.counts_error = true;
        self
    }
}

/// Static inputs to [`classify`]
#[derive(Debug, Clone)]
pub struct ClassifyPolicy {
    pub mode: ScanMode,
    pub exclude: Option<Regex>,
}

impl ClassifyPolicy {
    pub fn new(mode: ScanMode, config: &ScanConfig) -> Self {
        Self {
            mode,
            exclude: config.exclude_path.clone(),
        }
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.exclude
            .as_ref()
            .is_some_and(|re| re.is_match(&path.to_string_lossy()))
    }
}

/// Decide what to do with one walk event
pub fn classify(event: &VisitEvent, policy: &ClassifyPolicy) -> Verdict {
    let subject = event.subject();

    match &event.reason {
        VisitReason::AllocationFailure { detail } => Verdict::new(Action::Fatal)
            .note(
                Severity::Error,
                format!(
                    "Memory allocation failed during walk of {}{}",
                    subject,
                    detail_suffix(detail)
                ),
            )
            .error(),

        VisitReason::StatFailure { detail } => {
            let action = if event.top_level {
                Action::SkipReport
            } else {
                Action::SkipSilent
            };
            Verdict::new(action)
                .reply_if(event.top_level, || Reply::StatFailed {
                    subject: subject.clone(),
                    detail: detail.clone(),
                })
                .note(Severity::Warning, format!("lstat() failed on: {}", subject))
                .error()
        }

        VisitReason::RecursionLimit => Verdict::new(Action::SkipSilent).note(
            Severity::Warning,
            format!("Directory recursion limit reached, skipping {}", subject),
        ),

        VisitReason::Symlink => Verdict::new(Action::SkipSilent)
            .note(Severity::Debug, format!("Skipping symlink: {}", subject)),

        VisitReason::UnsupportedType => {
            let action = if event.top_level {
                Action::SkipReport
            } else {
                Action::SkipSilent
            };
            Verdict::new(action)
                .reply_if(event.top_level, || Reply::UnsupportedType {
                    subject: subject.clone(),
                })
                .note(Severity::Debug, format!("Not supported file type: {}", subject))
        }

        VisitReason::TopLevelDirectory => Verdict::new(Action::SkipSilent),

        VisitReason::RegularFile(facts) => classify_file(event, facts, policy, subject).total(),
    }
}

fn classify_file(event: &VisitEvent, facts: &FileFacts, policy: &ClassifyPolicy, subject: String) -> Verdict {
    if facts.on_procfs {
        return Verdict::new(Action::SkipSilent);
    }

    if policy.is_excluded(&event.path) {
        return match policy.mode {
            ScanMode::MultiScan => Verdict::new(Action::SkipSilent),
            ScanMode::Scan => Verdict::new(Action::SkipReport).reply(Reply::Excluded { subject }),
        };
    }

    if facts.size == 0 {
        return if event.top_level {
            Verdict::new(Action::SkipReport).reply(Reply::EmptyFile { subject })
        } else {
            Verdict::new(Action::SkipSilent)
        };
    }

    if !facts.readable {
        return Verdict::new(Action::SkipReport)
            .note(Severity::Debug, format!("Access denied: {}", subject))
            .reply(Reply::AccessDenied { subject })
            .error();
    }

    Verdict::new(Action::Scan)
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail
        .as_deref()
        .map(|d| format!(": {}", d))
        .unwrap_or_default()
}
