//! Integration tests for scand
//!
//! These drive whole requests through the public API against temporary
//! directories and loopback sockets, capturing the client channel in memory.

use parking_lot::Mutex;
use regex::Regex;
use scand::config::{PortRange, ScanConfig};
use scand::engine::{EngineHandle, ScanEngine, ScanOutcome, SignatureEngine};
use scand::error::StreamError;
use scand::pool::{TaskPool, ThreadPool};
use scand::remedy::Remediation;
use scand::reply::{ClientOutput, OutputBuffer, Reporter};
use scand::scanner::{scan_descriptor, scan_tree, ScanContext, ScanMode, StopReason};
use scand::stream::scan_stream;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// "MALWARE"
const SIGNATURES: &str = "# test database\nTest.Marker:4d414c57415245\n";

#[derive(Default)]
struct Recorder(Mutex<Vec<(String, String)>>);

impl Remediation for Recorder {
    fn run(&self, subject: &str, signature: &str) {
        self.0.lock().push((subject.to_string(), signature.to_string()));
    }
}

/// Engine that takes its time over every file and finds nothing
#[derive(Default)]
struct SlowEngine {
    scanned: Arc<AtomicUsize>,
}

impl ScanEngine for SlowEngine {
    fn scan_file(&self, _file: &mut fs::File) -> ScanOutcome {
        thread::sleep(Duration::from_millis(2));
        self.scanned.fetch_add(1, Ordering::SeqCst);
        ScanOutcome::Clean
    }
}

fn engine() -> EngineHandle {
    EngineHandle::new(SignatureEngine::parse(SIGNATURES).unwrap())
}

fn context(mode: ScanMode, engine: EngineHandle, config: ScanConfig) -> (ScanContext, OutputBuffer) {
    let (output, buffer) = ClientOutput::buffer(b'\n');
    let ctx = ScanContext::new(mode, engine, Reporter::new(output, false), Arc::new(config));
    (ctx, buffer)
}

fn loopback_config() -> ScanConfig {
    ScanConfig {
        stream_bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
        stream_ports: PortRange::from_options(20000, 60000),
        read_timeout: Some(Duration::from_secs(5)),
        ..ScanConfig::default()
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

#[test]
fn test_clean_tree_reports_only_summary() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), b"hello").unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();
    fs::write(dir.path().join("sub/b.txt"), b"world").unwrap();
    fs::write(dir.path().join("sub/empty"), b"").unwrap();

    let (ctx, buffer) = context(ScanMode::Scan, engine(), ScanConfig::default());
    let summary = scan_tree(Arc::new(ctx), None, dir.path());

    assert_eq!(buffer.lines(), vec![format!("{}: OK", display(dir.path()))]);
    assert_eq!(summary.totals.total, 3);
    assert_eq!(summary.totals.bytes_scanned, 10);
    assert!(summary.stopped.is_none());
}

#[test]
fn test_empty_top_level_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty");
    fs::write(&path, b"").unwrap();

    let (ctx, buffer) = context(ScanMode::Scan, engine(), ScanConfig::default());
    scan_tree(Arc::new(ctx), None, &path);

    let lines = buffer.lines();
    assert_eq!(lines[0], format!("{}: Empty file", display(&path)));
}

#[test]
fn test_excluded_file() {
    let dir = tempdir().unwrap();
    let skipped = dir.path().join("skip.bin");
    fs::write(&skipped, b"MALWARE").unwrap();

    let config = ScanConfig {
        exclude_path: Some(Regex::new(r"skip\.bin$").unwrap()),
        ..ScanConfig::default()
    };

    // Inline scans report the exclusion
    let (ctx, buffer) = context(ScanMode::Scan, engine(), config.clone());
    let summary = scan_tree(Arc::new(ctx), None, dir.path());
    assert_eq!(
        buffer.lines(),
        vec![format!("{}: Excluded", display(&skipped)), format!("{}: OK", display(dir.path()))]
    );
    assert_eq!(summary.totals.infected, 0);

    // Multiscan skips it silently
    let (ctx, buffer) = context(ScanMode::MultiScan, engine(), config);
    scan_tree(Arc::new(ctx), None, dir.path());
    assert_eq!(buffer.lines(), vec![format!("{}: OK", display(dir.path()))]);
}

#[test]
fn test_inline_detection_halts_walk() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a_clean"), b"nothing here").unwrap();
    let first = dir.path().join("b_bad");
    fs::write(&first, b"xxMALWARExx").unwrap();
    fs::write(dir.path().join("c_bad"), b"MALWARE").unwrap();

    let recorder = Arc::new(Recorder::default());
    let (ctx, buffer) = context(ScanMode::Scan, engine(), ScanConfig::default());
    let ctx = ctx.with_remediation(recorder.clone());
    let summary = scan_tree(Arc::new(ctx), None, dir.path());

    assert_eq!(buffer.lines(), vec![format!("{}: Test.Marker FOUND", display(&first))]);
    assert_eq!(summary.stopped, Some(StopReason::Detection));
    assert_eq!(summary.totals.total, 2);
    assert_eq!(summary.totals.infected, 1);
    assert_eq!(
        recorder.0.lock().clone(),
        vec![(display(&first), "Test.Marker".to_string())]
    );
}

#[test]
fn test_multiscan_scans_every_file() {
    let dir = tempdir().unwrap();
    for i in 0..4 {
        fs::write(dir.path().join(format!("clean{}", i)), vec![b'a'; 1000 + i]).unwrap();
    }
    let bad = dir.path().join("infected");
    fs::write(&bad, b"prefix MALWARE suffix").unwrap();

    let engine = engine();
    let pool = Arc::new(ThreadPool::new(4, 64).unwrap());
    let recorder = Arc::new(Recorder::default());
    let (ctx, buffer) = context(ScanMode::MultiScan, engine.clone(), ScanConfig::default());
    let ctx = ctx.with_remediation(recorder.clone()).with_group(pool.group());

    let shared: Arc<dyn TaskPool> = pool.clone();
    let summary = scan_tree(Arc::new(ctx), Some(shared), dir.path());

    // Every unit finished before the request returned
    assert_eq!(buffer.lines(), vec![format!("{}: Test.Marker FOUND", display(&bad))]);
    assert_eq!(summary.totals.total, 5);
    assert_eq!(summary.totals.infected, 1);
    assert!(summary.stopped.is_none());
    assert_eq!(recorder.0.lock().len(), 1);
    assert!(engine.is_idle());

    pool.shutdown();
    assert!(!pool.is_open());
}

#[test]
fn test_multiscan_more_files_than_queue() {
    let dir = tempdir().unwrap();
    for i in 0..100 {
        fs::write(dir.path().join(format!("file{:03}", i)), b"clean").unwrap();
    }
    fs::write(dir.path().join("empty"), b"").unwrap();

    let slow = SlowEngine::default();
    let scanned = Arc::clone(&slow.scanned);
    let engine = EngineHandle::new(slow);
    let pool = Arc::new(ThreadPool::new(1, 16).unwrap());
    let (ctx, buffer) = context(ScanMode::MultiScan, engine.clone(), ScanConfig::default());
    let ctx = ctx.with_group(pool.group());

    let shared: Arc<dyn TaskPool> = pool.clone();
    let summary = scan_tree(Arc::new(ctx), Some(shared), dir.path());

    // A full queue holds the walk back instead of failing the request
    assert!(summary.stopped.is_none());
    assert_eq!(summary.totals.total, 101);
    assert_eq!(summary.totals.errors, 0);
    assert_eq!(scanned.load(Ordering::SeqCst), 100);
    assert_eq!(buffer.lines(), vec![format!("{}: OK", display(dir.path()))]);
    assert!(engine.is_idle());

    pool.shutdown();
}

#[test]
fn test_multiscan_empty_top_level_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty");
    fs::write(&path, b"").unwrap();

    let slow = SlowEngine::default();
    let scanned = Arc::clone(&slow.scanned);
    let pool = Arc::new(ThreadPool::new(2, 16).unwrap());
    let (ctx, buffer) = context(ScanMode::MultiScan, EngineHandle::new(slow), ScanConfig::default());
    let ctx = ctx.with_group(pool.group());

    let shared: Arc<dyn TaskPool> = pool.clone();
    let summary = scan_tree(Arc::new(ctx), Some(shared), &path);

    assert_eq!(buffer.lines()[0], format!("{}: Empty file", display(&path)));
    assert_eq!(summary.totals.total, 1);
    assert_eq!(summary.totals.errors, 0);
    assert_eq!(scanned.load(Ordering::SeqCst), 0);
    assert!(summary.stopped.is_none());
}

#[test]
fn test_multiscan_requests_share_pool() {
    let pool = Arc::new(ThreadPool::new(2, 16).unwrap());
    let engine = engine();

    for _ in 0..3 {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f"), b"clean").unwrap();

        let (ctx, buffer) = context(ScanMode::MultiScan, engine.clone(), ScanConfig::default());
        let ctx = ctx.with_group(pool.group());
        let shared: Arc<dyn TaskPool> = pool.clone();
        scan_tree(Arc::new(ctx), Some(shared), dir.path());

        assert_eq!(buffer.lines(), vec![format!("{}: OK", display(dir.path()))]);
    }

    assert!(engine.is_idle());
}

#[test]
fn test_missing_path_reports_lstat_failure() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("missing");

    let (ctx, buffer) = context(ScanMode::Scan, engine(), ScanConfig::default());
    let summary = scan_tree(Arc::new(ctx), None, &missing);

    assert_eq!(
        buffer.lines(),
        vec![format!("{}: lstat() failed: No such file or directory. ERROR", display(&missing))]
    );
    assert_eq!(summary.totals.errors, 1);
}

#[test]
fn test_retired_engine_aborts_request() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("f");
    fs::write(&path, b"data").unwrap();

    let engine = engine();
    engine.retire();
    let pool = Arc::new(ThreadPool::new(2, 16).unwrap());
    let (ctx, buffer) = context(ScanMode::MultiScan, engine.clone(), ScanConfig::default());
    let ctx = ctx.with_group(pool.group());
    let shared: Arc<dyn TaskPool> = pool.clone();
    let summary = scan_tree(Arc::new(ctx), Some(shared), dir.path());

    assert_eq!(summary.stopped, Some(StopReason::Fatal));
    assert_eq!(buffer.lines(), vec![format!("{}: Can't allocate memory ERROR", display(&path))]);
    assert_eq!(summary.totals.errors, 1);
    assert!(engine.is_idle());
}

#[test]
fn test_fildes_directory_rejected() {
    let dir = tempdir().unwrap();
    let (ctx, buffer) = context(ScanMode::Scan, engine(), ScanConfig::default());

    let mut handle = fs::File::open(dir.path()).unwrap();
    scan_descriptor(&ctx, &mut handle);

    let lines = buffer.lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("fd["));
    assert!(lines[0].ends_with("]: Not a regular file. ERROR"));
    assert_eq!(ctx.counters().snapshot().errors, 1);
}

#[test]
fn test_fildes_infected_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("f");
    fs::write(&path, b"..MALWARE..").unwrap();

    let (ctx, buffer) = context(ScanMode::Scan, engine(), ScanConfig::default());
    let mut handle = fs::File::open(&path).unwrap();
    let outcome = scan_descriptor(&ctx, &mut handle);

    assert!(outcome.is_infected());
    let lines = buffer.lines();
    assert!(lines[0].ends_with(": Test.Marker FOUND"));
}

/// Wait for the session to announce its port
async fn announced_port(buffer: &OutputBuffer) -> u16 {
    for _ in 0..500 {
        if let Some(line) = buffer.lines().iter().find(|l| l.starts_with("PORT ")) {
            return line["PORT ".len()..].parse().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no port announced");
}

async fn connect(port: u16) -> TcpStream {
    TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_stream_zero_bytes() {
    let (ctx, buffer) = context(ScanMode::Scan, engine(), loopback_config());
    let ctx = Arc::new(ctx);
    let session = tokio::spawn(scan_stream(Arc::clone(&ctx)));

    let port = announced_port(&buffer).await;
    let peer = connect(port).await;
    drop(peer);

    let outcome = session.await.unwrap().unwrap();
    assert!(!outcome.is_infected());
    assert_eq!(buffer.lines(), vec![format!("PORT {}", port), "stream: OK".to_string()]);
    assert_eq!(ctx.counters().snapshot().total, 1);
}

#[tokio::test]
async fn test_stream_detection() {
    let recorder = Arc::new(Recorder::default());
    let (ctx, buffer) = context(ScanMode::Scan, engine(), loopback_config());
    let ctx = Arc::new(ctx.with_remediation(recorder.clone()));
    let session = tokio::spawn(scan_stream(Arc::clone(&ctx)));

    let port = announced_port(&buffer).await;
    let mut peer = connect(port).await;
    peer.write_all(b"some bytes then MALWARE").await.unwrap();
    peer.shutdown().await.unwrap();

    let outcome = session.await.unwrap().unwrap();
    assert!(outcome.is_infected());
    assert_eq!(buffer.lines()[1], "stream: Test.Marker FOUND");
    assert_eq!(recorder.0.lock()[0].0, "stream");
    assert_eq!(ctx.counters().snapshot().bytes_scanned, 23);
}

#[tokio::test]
async fn test_stream_cap_truncates() {
    let config = ScanConfig {
        stream_max_length: Some(4),
        ..loopback_config()
    };
    let (ctx, buffer) = context(ScanMode::Scan, engine(), config);
    let ctx = Arc::new(ctx);
    let session = tokio::spawn(scan_stream(Arc::clone(&ctx)));

    let port = announced_port(&buffer).await;
    let mut peer = connect(port).await;
    // The session may close before the rest is read
    let _ = peer.write_all(b"abcdMALWARE").await;

    let outcome = session.await.unwrap().unwrap();
    assert!(!outcome.is_infected());
    assert_eq!(buffer.lines()[1], "stream: OK");
    assert_eq!(ctx.counters().snapshot().bytes_scanned, 4);
}

#[tokio::test]
async fn test_stream_accept_timeout() {
    let config = ScanConfig {
        read_timeout: Some(Duration::from_millis(100)),
        ..loopback_config()
    };
    let (ctx, buffer) = context(ScanMode::Scan, engine(), config);
    let ctx = Arc::new(ctx);

    let result = scan_stream(Arc::clone(&ctx)).await;

    assert!(matches!(result, Err(StreamError::AcceptTimeout { .. })));
    let lines = buffer.lines();
    assert!(lines[0].starts_with("PORT "));
    assert_eq!(lines[1], "Accept timeout. ERROR");
    assert_eq!(ctx.counters().snapshot().errors, 1);
}

#[tokio::test]
async fn test_stream_no_free_port() {
    // Hold the only port in the range
    let held = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = held.local_addr().unwrap().port();

    let config = ScanConfig {
        stream_ports: PortRange::from_options(u32::from(port), u32::from(port)),
        ..loopback_config()
    };
    let (ctx, buffer) = context(ScanMode::Scan, engine(), config);
    let ctx = Arc::new(ctx);

    let result = scan_stream(Arc::clone(&ctx)).await;

    assert!(matches!(result, Err(StreamError::NoFreePort { attempts: 1, .. })));
    assert_eq!(buffer.lines(), vec!["Can't find any free port. ERROR".to_string()]);
    assert_eq!(ctx.counters().snapshot().errors, 1);
    drop(held);
}

#[tokio::test]
async fn test_stream_temp_files_removed() {
    let staging = tempdir().unwrap();
    let config = ScanConfig {
        temporary_directory: staging.path().to_path_buf(),
        ..loopback_config()
    };
    let (ctx, buffer) = context(ScanMode::Scan, engine(), config);
    let session = tokio::spawn(scan_stream(Arc::new(ctx)));

    let port = announced_port(&buffer).await;
    let mut peer = connect(port).await;
    peer.write_all(b"payload").await.unwrap();
    peer.shutdown().await.unwrap();
    session.await.unwrap().unwrap();

    assert_eq!(fs::read_dir(staging.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_stream_leave_temporary_files() {
    let staging = tempdir().unwrap();
    let config = ScanConfig {
        temporary_directory: staging.path().to_path_buf(),
        leave_temporary_files: true,
        ..loopback_config()
    };
    let (ctx, buffer) = context(ScanMode::Scan, engine(), config);
    let session = tokio::spawn(scan_stream(Arc::new(ctx)));

    let port = announced_port(&buffer).await;
    let mut peer = connect(port).await;
    peer.write_all(b"payload").await.unwrap();
    peer.shutdown().await.unwrap();
    session.await.unwrap().unwrap();

    let kept: Vec<_> = fs::read_dir(staging.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(kept.len(), 1);
    assert_eq!(fs::read(&kept[0]).unwrap(), b"payload");
}

#[tokio::test]
async fn test_stream_read_timeout_removes_temp_file() {
    let staging = tempdir().unwrap();
    let config = ScanConfig {
        temporary_directory: staging.path().to_path_buf(),
        read_timeout: Some(Duration::from_millis(200)),
        ..loopback_config()
    };
    let (ctx, buffer) = context(ScanMode::Scan, engine(), config);
    let ctx = Arc::new(ctx);
    let session = tokio::spawn(scan_stream(Arc::clone(&ctx)));

    let port = announced_port(&buffer).await;
    let mut peer = connect(port).await;
    peer.write_all(b"partial").await.unwrap();

    // The peer stays connected and silent past the read deadline
    let result = session.await.unwrap();
    drop(peer);

    assert!(matches!(result, Err(StreamError::ReadTimeout)));
    assert_eq!(buffer.lines().last().map(String::as_str), Some("read timeout ERROR"));
    assert_eq!(ctx.counters().snapshot().errors, 1);
    assert_eq!(fs::read_dir(staging.path()).unwrap().count(), 0);
}
