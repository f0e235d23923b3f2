//! scand - scan-dispatch core of a malware-scanning daemon
//!
//! Entry point for the CLI application. Replies go to stdout; logs, the
//! progress spinner and the summary go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use scand::config::{CliArgs, Command, ScanConfig};
use scand::engine::{EngineHandle, SignatureEngine};
use scand::error::EngineError;
use scand::pool::{ActiveTasks, TaskPool, ThreadPool};
use scand::progress::{print_header, print_summary, ProgressReporter, ScanProgress};
use scand::remedy::{NoRemediation, Remediation, VirusEventCommand};
use scand::reply::{ClientOutput, Reply, Reporter};
use scand::scanner::{scan_descriptor, scan_tree, ScanContext, ScanMode, ScanTotals};
use scand::stream::scan_stream;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Exit status when something was found
const EXIT_INFECTED: u8 = 1;

/// Exit status when something failed
const EXIT_ERROR: u8 = 2;

fn main() -> ExitCode {
    match run() {
        Ok(totals) if totals.infected > 0 => ExitCode::from(EXIT_INFECTED),
        Ok(totals) if totals.errors > 0 => ExitCode::from(EXIT_ERROR),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// Everything a request needs that outlives the request
struct Runner {
    config: Arc<ScanConfig>,
    engine: EngineHandle,
    reporter: Reporter,
    remediation: Arc<dyn Remediation>,
    active: ActiveTasks,
    interrupt: Arc<AtomicBool>,
    progress: Option<ProgressReporter>,
    started: Instant,
}

impl Runner {
    fn context(&self, mode: ScanMode) -> ScanContext {
        ScanContext::new(mode, self.engine.clone(), self.reporter.clone(), Arc::clone(&self.config))
            .with_remediation(Arc::clone(&self.remediation))
            .with_active_tasks(self.active.clone())
            .with_interrupt(Arc::clone(&self.interrupt))
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Run `f` while a ticker thread keeps the spinner current
    fn with_progress<T>(
        &self,
        ctx: &ScanContext,
        pool: Option<&ThreadPool>,
        before: ScanTotals,
        f: impl FnOnce() -> T,
    ) -> T {
        let Some(progress) = &self.progress else {
            return f();
        };

        let done = AtomicBool::new(false);
        thread::scope(|scope| {
            scope.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    let mut totals = before;
                    totals += ctx.counters().snapshot();
                    progress.update(&ScanProgress {
                        totals,
                        elapsed: self.started.elapsed(),
                        current: self.active.snapshot().into_iter().next(),
                        busy_workers: pool.map_or(0, ThreadPool::busy_workers),
                        total_workers: pool.map_or(0, ThreadPool::size),
                        queued: pool.map_or(0, ThreadPool::queued),
                    });
                    thread::sleep(Duration::from_millis(200));
                }
            });

            let result = f();
            done.store(true, Ordering::Relaxed);
            result
        })
    }
}

fn run() -> Result<ScanTotals> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    // Validate and create config
    let config = Arc::new(ScanConfig::from_args(&args).context("Invalid configuration")?);

    // Load the engine
    let engine = load_engine(config.signatures.as_deref())?;
    info!(signatures = engine.len(), "Signature database loaded");
    let signature_count = engine.len();
    let engine = EngineHandle::new(engine);

    let remediation: Arc<dyn Remediation> = match &config.virus_event {
        Some(command) => Arc::new(VirusEventCommand::new(command.clone())),
        None => Arc::new(NoRemediation),
    };

    // Setup signal handler for graceful shutdown
    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupt);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, finishing current request...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let terminator = if args.null_terminated { b'\0' } else { b'\n' };

    // Print header
    if args.progress && !args.quiet {
        let workers = matches!(args.command, Command::Multiscan { .. }).then_some(config.worker_count);
        print_header(request_name(&args.command), signature_count, workers);
    }

    let runner = Runner {
        reporter: Reporter::new(ClientOutput::stdout(terminator), config.log_clean),
        config,
        engine,
        remediation,
        active: ActiveTasks::new(),
        interrupt,
        progress: args.progress.then(ProgressReporter::new),
        started: Instant::now(),
    };

    let (totals, requests) = match &args.command {
        Command::Scan { paths } => run_tree(&runner, ScanMode::Scan, paths)?,
        Command::Multiscan { paths } => run_tree(&runner, ScanMode::MultiScan, paths)?,
        Command::Stream => run_stream(&runner)?,
        Command::Fildes { paths } => run_fildes(&runner, paths),
    };

    // Finish progress
    if let Some(ref p) = runner.progress {
        p.finish_and_clear();
    }

    // Print summary
    if !args.quiet {
        print_summary(&totals, requests, runner.started.elapsed());
    }

    if runner.interrupted() {
        info!("Run was interrupted before completion");
    }

    Ok(totals)
}

/// Run one SCAN or MULTISCAN request per path
fn run_tree(runner: &Runner, mode: ScanMode, paths: &[PathBuf]) -> Result<(ScanTotals, usize)> {
    let pool = match mode {
        ScanMode::MultiScan => Some(Arc::new(
            ThreadPool::new(runner.config.worker_count, runner.config.queue_size)
                .context("Failed to start worker pool")?,
        )),
        ScanMode::Scan => None,
    };

    let mut totals = ScanTotals::default();
    let mut requests = 0;

    for path in paths {
        if runner.interrupted() {
            break;
        }

        let mut ctx = runner.context(mode);
        if let Some(pool) = &pool {
            ctx = ctx.with_group(pool.group());
        }
        let ctx = Arc::new(ctx);
        let shared_pool = pool.clone().map(|p| p as Arc<dyn TaskPool>);

        let summary = runner.with_progress(&ctx, pool.as_deref(), totals, || {
            scan_tree(Arc::clone(&ctx), shared_pool, path)
        });

        debug!(
            path = %summary.path.display(),
            rate = %format!("{:.0}", summary.files_per_second()),
            "Request summary"
        );
        totals += summary.totals;
        requests += 1;
    }

    if let Some(pool) = pool {
        pool.shutdown();
    }

    Ok((totals, requests))
}

/// Run one STREAM request
fn run_stream(runner: &Runner) -> Result<(ScanTotals, usize)> {
    // Create tokio runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create async runtime")?;

    let ctx = Arc::new(runner.context(ScanMode::Scan));
    let result = runner.with_progress(&ctx, None, ScanTotals::default(), || {
        runtime.block_on(scan_stream(Arc::clone(&ctx)))
    });

    if let Err(e) = result {
        // Already reported and counted by the session
        debug!(error = %e, "Stream session failed");
    }

    Ok((ctx.counters().snapshot(), 1))
}

/// Open each path and scan it through its descriptor
fn run_fildes(runner: &Runner, paths: &[PathBuf]) -> (ScanTotals, usize) {
    let ctx = runner.context(ScanMode::Scan);

    runner.with_progress(&ctx, None, ScanTotals::default(), || {
        for path in paths {
            if runner.interrupted() {
                break;
            }
            match File::open(path) {
                Ok(mut file) => {
                    scan_descriptor(&ctx, &mut file);
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Open failed");
                    ctx.counters().record_error();
                    ctx.reporter().emit(&Reply::Failed {
                        subject: path.display().to_string(),
                        reason: EngineError::Open.to_string(),
                    });
                }
            }
        }
    });

    (ctx.counters().snapshot(), paths.len())
}

fn load_engine(signatures: Option<&Path>) -> Result<SignatureEngine> {
    let path = signatures.context("No signature database given (use --signatures or SCAND_SIGNATURES)")?;
    SignatureEngine::load(path).with_context(|| format!("Failed to load signatures from {}", path.display()))
}

fn request_name(command: &Command) -> &'static str {
    match command {
        Command::Scan { .. } => "SCAN",
        Command::Multiscan { .. } => "MULTISCAN",
        Command::Stream => "STREAM",
        Command::Fildes { .. } => "FILDES",
    }
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("scand=debug,warn")
    } else {
        EnvFilter::new("scand=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
