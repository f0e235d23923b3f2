//! Streaming scans
//!
//! The client asks for a stream scan, the session answers with a port, and
//! the client pushes raw bytes to that port. The bytes are staged into a
//! temporary file and scanned once the peer closes or the cap is reached.
//!
//! ```text
//! NegotiatingPort ──> Bound ──> AwaitingConnection ──> Receiving ──> ReadyToScan ──> Done
//!        │              │               │                  │               │
//!        └──────────────┴───────────────┴──────────────────┴───────────────┴──> Failed
//! ```
//!
//! Every network wait has its own deadline. Sockets and the staged file are
//! owned by the session and released on every exit path. Each failure is
//! reported to the client once and counted once as a request error.

pub mod port;
pub mod receive;

pub use receive::{ReceiveEnd, Received};

use crate::engine::{EngineLease, ScanOutcome};
use crate::error::{EngineError, StreamError, StreamResult};
use crate::reply::{CleanReport, Reply};
use crate::scanner::dispatch::record;
use crate::scanner::ScanContext;
use std::fmt;
use std::io::{Seek, SeekFrom};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, warn};

/// Subject name stream results are reported under
pub const STREAM_SUBJECT: &str = "stream";

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStage {
    NegotiatingPort,
    Bound,
    AwaitingConnection,
    Receiving,
    ReadyToScan,
    Done,
    Failed,
}

impl fmt::Display for StreamStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamStage::NegotiatingPort => "negotiating-port",
            StreamStage::Bound => "bound",
            StreamStage::AwaitingConnection => "awaiting-connection",
            StreamStage::Receiving => "receiving",
            StreamStage::ReadyToScan => "ready-to-scan",
            StreamStage::Done => "done",
            StreamStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One streaming scan
pub struct StreamSession {
    ctx: Arc<ScanContext>,
    stage: StreamStage,
    port: Option<u16>,
    peer: Option<SocketAddr>,
    received: u64,
}

impl StreamSession {
    pub fn new(ctx: Arc<ScanContext>) -> Self {
        Self {
            ctx,
            stage: StreamStage::NegotiatingPort,
            port: None,
            peer: None,
            received: 0,
        }
    }

    pub fn stage(&self) -> StreamStage {
        self.stage
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Bytes staged so far
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Run the session to completion
    ///
    /// Every outcome, including failures, has already been reported to the
    /// client when this returns.
    pub async fn run(&mut self) -> StreamResult<ScanOutcome> {
        let ctx = Arc::clone(&self.ctx);
        let config = ctx.config();

        // NegotiatingPort
        let range = config.stream_ports;
        let start = port::random_start(range);
        let (port, socket) = match port::bind_first(range, start, |p| port::bind_socket(config.stream_bind, p)) {
            Ok(bound) => bound,
            Err(e) => return Err(self.fail(Reply::NoFreePort, "ScanStream: Can't find any free port", e)),
        };
        self.port = Some(port);

        let listener = match socket.listen(1) {
            Ok(listener) => listener,
            Err(source) => {
                return Err(self.fail(Reply::AcceptFailed, "ScanStream: listen() failed", StreamError::Listen { port, source }));
            }
        };
        self.advance(StreamStage::Bound);

        if let Err(source) = ctx.reporter().output().send(&Reply::Port(port)) {
            self.stage = StreamStage::Failed;
            ctx.counters().record_error();
            error!(port = port, error = %source, "ScanStream: error transmitting port");
            return Err(StreamError::PortAnnounce { port, source });
        }
        self.advance(StreamStage::AwaitingConnection);

        let (mut stream, peer) = self.accept(&listener, port).await?;
        self.peer = Some(peer);
        debug!(peer = %peer.ip(), port = port, "Accepted stream connection");
        let label = format!("{}({}@{})", STREAM_SUBJECT, peer.ip(), port);

        // Receiving
        let staged = match self.stage_file() {
            Ok(staged) => staged,
            Err(source) => {
                return Err(self.fail(Reply::TempCreate, &format!("{}: Can't create temporary file", label), StreamError::TempCreate(source)));
            }
        };
        self.advance(StreamStage::Receiving);

        let mut writer = match staged.as_file().try_clone() {
            Ok(file) => tokio::fs::File::from_std(file),
            Err(source) => {
                return Err(self.fail(Reply::TempWrite, &format!("{}: Can't write to temporary file", label), StreamError::TempWrite(source)));
            }
        };
        let received = self.intake(&mut stream, &mut writer, &label).await?;
        drop(writer);
        if received.end == ReceiveEnd::CapReached {
            warn!(
                peer = %peer.ip(),
                port = port,
                max = ?config.stream_max_length,
                "ScanStream: Size limit reached"
            );
        }
        self.advance(StreamStage::ReadyToScan);

        // Done: the peer socket and listener close before the result goes out
        drop(stream);
        drop(listener);

        ctx.counters().record_total();
        let lease = match ctx.engine().acquire() {
            Ok(lease) => lease,
            Err(e) => {
                let outcome = ScanOutcome::Error(EngineError::OutOfMemory);
                record(&ctx, STREAM_SUBJECT, &label, &outcome, 0, CleanReport::Always);
                self.stage = StreamStage::Failed;
                return Err(e.into());
            }
        };

        let outcome = scan_staged(Arc::clone(&ctx), lease, staged, peer.ip().to_string()).await;
        record(&ctx, STREAM_SUBJECT, &label, &outcome, received.bytes, CleanReport::Always);
        self.advance(StreamStage::Done);

        Ok(outcome)
    }

    async fn accept(&mut self, listener: &TcpListener, port: u16) -> StreamResult<(TcpStream, SocketAddr)> {
        let timeout = self.ctx.config().read_timeout;
        match receive::with_deadline(timeout, listener.accept()).await {
            Some(Ok(accepted)) => Ok(accepted),
            Some(Err(source)) => Err(self.fail(
                Reply::AcceptFailed,
                &format!("ScanStream {}: accept() failed", port),
                StreamError::Accept { port, source },
            )),
            None => Err(self.fail(
                Reply::AcceptTimeout,
                &format!("ScanStream {}: accept timeout", port),
                StreamError::AcceptTimeout { port },
            )),
        }
    }

    fn stage_file(&self) -> std::io::Result<NamedTempFile> {
        let config = self.ctx.config();
        tempfile::Builder::new()
            .prefix("scand-stream-")
            .keep(config.leave_temporary_files)
            .tempfile_in(&config.temporary_directory)
    }

    /// Stage the peer's bytes into `writer`, failing the session on error
    async fn intake<R, W>(&mut self, reader: &mut R, writer: &mut W, label: &str) -> StreamResult<Received>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let ctx = Arc::clone(&self.ctx);
        let config = ctx.config();
        match receive::receive(reader, writer, config.stream_max_length, config.read_timeout).await {
            Ok(received) => {
                self.received = received.bytes;
                Ok(received)
            }
            Err(e) => {
                let (reply, message) = match &e {
                    StreamError::ReadTimeout => (Reply::ReadTimeout, "read timeout"),
                    StreamError::TempWrite(_) => (Reply::TempWrite, "Can't write to temporary file"),
                    _ => (Reply::ReadPoll, "read poll failed"),
                };
                Err(self.fail(reply, &format!("{}: {}", label, message), e))
            }
        }
    }

    fn advance(&mut self, stage: StreamStage) {
        debug!(port = ?self.port, from = %self.stage, to = %stage, "Stream session");
        self.stage = stage;
    }

    /// Enter the failed state: count it, tell the client, log, hand back the error
    fn fail(&mut self, reply: Reply, message: &str, e: StreamError) -> StreamError {
        self.stage = StreamStage::Failed;
        self.ctx.counters().record_error();
        self.ctx.reporter().client(&reply);
        error!(error = %e, "{}", message);
        e
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("stage", &self.stage)
            .field("port", &self.port)
            .field("peer", &self.peer)
            .field("received", &self.received)
            .finish()
    }
}

/// Rewind the staged file and scan it on the blocking pool
///
/// The staged file is dropped (and removed unless kept) when the scan ends.
async fn scan_staged(ctx: Arc<ScanContext>, lease: EngineLease, mut staged: NamedTempFile, peer: String) -> ScanOutcome {
    let task = tokio::task::spawn_blocking(move || {
        let file = staged.as_file_mut();
        if file.seek(SeekFrom::Start(0)).is_err() {
            return ScanOutcome::Error(EngineError::Seek);
        }

        let _task = ctx.active().begin(peer, None);
        lease.engine().scan_file(file)
    });

    match task.await {
        Ok(outcome) => outcome,
        Err(e) => ScanOutcome::Error(EngineError::Other(format!("scan task failed: {}", e))),
    }
}

/// Run one streaming scan on `ctx`
pub async fn scan_stream(ctx: Arc<ScanContext>) -> StreamResult<ScanOutcome> {
    StreamSession::new(ctx).run().await
}
