//! Progress reporting for scan requests
//!
//! Provides a live spinner and the end-of-run summary. Both go to stderr;
//! stdout is the client reply channel.

use crate::pool::ActiveTask;
use crate::scanner::ScanTotals;
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// What the spinner shows
#[derive(Debug, Clone, Default)]
pub struct ScanProgress {
    /// Counters so far
    pub totals: ScanTotals,

    /// Time since the run started
    pub elapsed: Duration,

    /// Longest-running active task
    pub current: Option<ActiveTask>,

    /// Workers running a unit
    pub busy_workers: usize,

    /// Pool size (0 when scanning inline)
    pub total_workers: usize,

    /// Units waiting in the pool queue
    pub queued: usize,
}

impl ScanProgress {
    /// Files visited per second
    pub fn files_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.totals.total as f64 / secs
        } else {
            0.0
        }
    }

    /// One-line status for the spinner
    pub fn message(&self) -> String {
        let mut msg = format!(
            "Files: {} | Infected: {} | Errors: {} | Scanned: {} | Rate: {:.0}/s",
            format_number(self.totals.total),
            format_number(self.totals.infected),
            format_number(self.totals.errors),
            format_size(self.totals.bytes_scanned, BINARY),
            self.files_per_second(),
        );

        if self.total_workers > 0 {
            msg.push_str(&format!(
                " | Workers: {}/{} | Queued: {}",
                self.busy_workers, self.total_workers, self.queued
            ));
        }

        if let Some(task) = &self.current {
            msg.push_str(&format!(" | {} ({}s)", task.label, task.elapsed().as_secs()));
        }

        msg
    }
}

/// Progress reporter that displays scan status
pub struct ProgressReporter {
    /// Progress bar
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());

        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        bar.set_style(style);

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update the progress display
    pub fn update(&self, progress: &ScanProgress) {
        self.bar.set_message(progress.message());
    }

    /// Finish and clear the progress display
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print a summary of the run
pub fn print_summary(totals: &ScanTotals, requests: usize, duration: Duration) {
    let duration_secs = duration.as_secs_f64();
    let rate = if duration_secs > 0.0 {
        totals.total as f64 / duration_secs
    } else {
        0.0
    };

    let title = if totals.infected > 0 {
        style("Scan Complete - infections found").red().bold()
    } else {
        style("Scan Complete").green().bold()
    };

    eprintln!();
    eprintln!("{}", title);
    eprintln!("{}", style("─".repeat(50)).dim());
    eprintln!("  {} {}", style("Requests:").bold(), requests);
    eprintln!("  {} {}", style("Files:").bold(), format_number(totals.total));
    eprintln!(
        "  {} {}",
        style("Scanned:").bold(),
        format_size(totals.bytes_scanned, BINARY)
    );
    eprintln!(
        "  {} {:.1}s ({:.0} files/sec)",
        style("Duration:").bold(),
        duration_secs,
        rate
    );
    if totals.infected > 0 {
        eprintln!(
            "  {} {}",
            style("Infected:").red().bold(),
            format_number(totals.infected)
        );
    }
    if totals.errors > 0 {
        eprintln!(
            "  {} {}",
            style("Errors:").yellow().bold(),
            format_number(totals.errors)
        );
    }
    eprintln!();
}

/// Print a header at the start of the run
pub fn print_header(request: &str, signatures: usize, workers: Option<usize>) {
    eprintln!();
    eprintln!(
        "{} {}",
        style("scand").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("{}", style("─".repeat(50)).dim());
    eprintln!("  {} {}", style("Request:").bold(), request);
    eprintln!("  {} {}", style("Signatures:").bold(), format_number(signatures as u64));
    if let Some(workers) = workers {
        eprintln!("  {} {}", style("Workers:").bold(), workers);
    }
    eprintln!();
}
