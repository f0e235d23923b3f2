//! Client replies and result reporting
//!
//! [`Reply`] is the one place reply wording lives. Client tooling parses
//! these lines, so the text is a compatibility contract.
//!
//! [`ClientOutput`] writes one reply per line with the terminator the client
//! asked for (newline, or NUL for `z`-prefixed commands). It is cheap to clone
//! and safe to share between multiscan units; writes are serialized.
//!
//! [`Reporter`] pairs the client line with a log line at the matching level.

use crate::engine::ScanOutcome;
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One client-visible reply line, without terminator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `<subject>: OK`
    Ok { subject: String },

    /// `<subject>: <signature> FOUND`
    Found { subject: String, signature: String },

    /// `<subject>: <reason> ERROR`
    Failed { subject: String, reason: String },

    /// `<subject>: Excluded`
    Excluded { subject: String },

    /// `<subject>: Empty file`
    EmptyFile { subject: String },

    /// `<subject>: Access denied. ERROR`
    AccessDenied { subject: String },

    /// `<subject>: Not supported file type. ERROR`
    UnsupportedType { subject: String },

    /// `<subject>: lstat() failed: <detail>. ERROR`
    StatFailed { subject: String, detail: Option<String> },

    /// `<subject>: Not a regular file. ERROR`
    NotRegular { subject: String },

    /// `PORT <number>`
    Port(u16),

    /// `Can't find any free port. ERROR`
    NoFreePort,

    /// `Accept timeout. ERROR`
    AcceptTimeout,

    /// `accept() ERROR`
    AcceptFailed,

    /// `read timeout ERROR`
    ReadTimeout,

    /// `read poll ERROR`
    ReadPoll,

    /// `Temporary file -> write ERROR`
    TempWrite,

    /// `Temporary file -> create ERROR`
    TempCreate,
}

impl Reply {
    /// Log severity for this reply
    pub fn severity(&self) -> Severity {
        match self {
            Reply::Ok { .. } | Reply::Found { .. } | Reply::Failed { .. } => Severity::Info,
            Reply::Excluded { .. }
            | Reply::EmptyFile { .. }
            | Reply::AccessDenied { .. }
            | Reply::UnsupportedType { .. }
            | Reply::Port(_) => Severity::Debug,
            Reply::StatFailed { .. } | Reply::NotRegular { .. } => Severity::Warning,
            Reply::NoFreePort
            | Reply::AcceptTimeout
            | Reply::AcceptFailed
            | Reply::ReadTimeout
            | Reply::ReadPoll
            | Reply::TempWrite
            | Reply::TempCreate => Severity::Error,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok { subject } => write!(f, "{}: OK", subject),
            Reply::Found { subject, signature } => write!(f, "{}: {} FOUND", subject, signature),
            Reply::Failed { subject, reason } => write!(f, "{}: {} ERROR", subject, reason),
            Reply::Excluded { subject } => write!(f, "{}: Excluded", subject),
            Reply::EmptyFile { subject } => write!(f, "{}: Empty file", subject),
            Reply::AccessDenied { subject } => write!(f, "{}: Access denied. ERROR", subject),
            Reply::UnsupportedType { subject } => {
                write!(f, "{}: Not supported file type. ERROR", subject)
            }
            Reply::StatFailed { subject, detail: Some(detail) } => {
                write!(f, "{}: lstat() failed: {}. ERROR", subject, detail)
            }
            Reply::StatFailed { subject, detail: None } => {
                write!(f, "{}: lstat() failed. ERROR", subject)
            }
            Reply::NotRegular { subject } => write!(f, "{}: Not a regular file. ERROR", subject),
            Reply::Port(port) => write!(f, "PORT {}", port),
            Reply::NoFreePort => f.write_str("Can't find any free port. ERROR"),
            Reply::AcceptTimeout => f.write_str("Accept timeout. ERROR"),
            Reply::AcceptFailed => f.write_str("accept() ERROR"),
            Reply::ReadTimeout => f.write_str("read timeout ERROR"),
            Reply::ReadPoll => f.write_str("read poll ERROR"),
            Reply::TempWrite => f.write_str("Temporary file -> write ERROR"),
            Reply::TempCreate => f.write_str("Temporary file -> create ERROR"),
        }
    }
}

/// Log severity, mirroring the daemon's log prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// `!`
    Error,
    /// `^`
    Warning,
    /// `~`
    Info,
    /// `*`
    Debug,
}

/// Write one log line at a severity
pub fn log(severity: Severity, message: &str) {
    match severity {
        Severity::Error => error!("{}", message),
        Severity::Warning => warn!("{}", message),
        Severity::Info => info!("{}", message),
        Severity::Debug => debug!("{}", message),
    }
}

/// Shared, line-oriented client channel
#[derive(Clone)]
pub struct ClientOutput {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
    terminator: u8,
}

impl ClientOutput {
    /// Wrap a writer
    pub fn new(writer: impl Write + Send + 'static, terminator: u8) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(writer))),
            terminator,
        }
    }

    /// Reply on this process's stdout
    pub fn stdout(terminator: u8) -> Self {
        Self::new(io::stdout(), terminator)
    }

    /// Collect replies in memory
    pub fn buffer(terminator: u8) -> (Self, OutputBuffer) {
        let buffer = OutputBuffer {
            bytes: Arc::new(Mutex::new(Vec::new())),
            terminator,
        };
        let writer = BufferWriter(Arc::clone(&buffer.bytes));
        (Self::new(writer, terminator), buffer)
    }

    /// Send one reply followed by the terminator
    pub fn send(&self, reply: &Reply) -> io::Result<()> {
        let mut line = reply.to_string().into_bytes();
        line.push(self.terminator);

        let mut sink = self.sink.lock();
        sink.write_all(&line)?;
        sink.flush()
    }
}

impl fmt::Debug for ClientOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOutput")
            .field("terminator", &self.terminator)
            .finish_non_exhaustive()
    }
}

/// In-memory capture of a client channel
#[derive(Clone, Debug)]
pub struct OutputBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
    terminator: u8,
}

impl OutputBuffer {
    /// Replies received so far, terminators stripped
    pub fn lines(&self) -> Vec<String> {
        let bytes = self.bytes.lock();
        bytes
            .split(|b| *b == self.terminator)
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    /// Raw bytes received so far
    pub fn raw(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

struct BufferWriter(Arc<Mutex<Vec<u8>>>);

impl Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// How a clean result is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanReport {
    /// Never to the client; logged when clean logging is enabled
    /// (walked files, which get a request summary instead)
    LogOnly,

    /// Always to the client, logged only when clean logging is enabled
    Always,
}

/// Formats outcomes onto the client channel and into the log
#[derive(Clone, Debug)]
pub struct Reporter {
    output: ClientOutput,
    log_clean: bool,
}

impl Reporter {
    /// Create a reporter
    pub fn new(output: ClientOutput, log_clean: bool) -> Self {
        Self { output, log_clean }
    }

    /// Underlying client channel
    pub fn output(&self) -> &ClientOutput {
        &self.output
    }

    /// Send a reply to the client only
    ///
    /// A vanished client is not an error for the scan itself, so write
    /// failures are logged and otherwise ignored.
    pub fn client(&self, reply: &Reply) {
        if let Err(e) = self.output.send(reply) {
            debug!(error = %e, reply = %reply, "Client write failed");
        }
    }

    /// Send a reply and log it at its own severity
    pub fn emit(&self, reply: &Reply) {
        self.client(reply);
        log(reply.severity(), &reply.to_string());
    }

    /// Report an engine outcome
    ///
    /// `subject` is what the client sees; `log_label` is what the log sees
    /// (the stream path logs the peer address instead of `stream`).
    pub fn outcome(&self, subject: &str, log_label: &str, outcome: &ScanOutcome, clean: CleanReport) {
        match outcome {
            ScanOutcome::Infected(name) => {
                self.client(&Reply::Found {
                    subject: subject.to_string(),
                    signature: name.clone(),
                });
                info!("{}: {} FOUND", log_label, name);
            }
            ScanOutcome::Error(e) => {
                self.client(&Reply::Failed {
                    subject: subject.to_string(),
                    reason: e.to_string(),
                });
                info!("{}: {} ERROR", log_label, e);
            }
            ScanOutcome::Clean => {
                let reply = Reply::Ok {
                    subject: subject.to_string(),
                };
                if clean == CleanReport::Always {
                    self.client(&reply);
                }
                if self.log_clean {
                    info!("{}: OK", log_label);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> String {
        "/tmp/file".to_string()
    }

    #[test]
    fn test_reply_wording() {
        let cases = [
            (Reply::Ok { subject: subject() }, "/tmp/file: OK"),
            (
                Reply::Found { subject: subject(), signature: "Eicar-Test".into() },
                "/tmp/file: Eicar-Test FOUND",
            ),
            (
                Reply::Failed { subject: subject(), reason: "Can't read file".into() },
                "/tmp/file: Can't read file ERROR",
            ),
            (Reply::Excluded { subject: subject() }, "/tmp/file: Excluded"),
            (Reply::EmptyFile { subject: subject() }, "/tmp/file: Empty file"),
            (Reply::AccessDenied { subject: subject() }, "/tmp/file: Access denied. ERROR"),
            (
                Reply::UnsupportedType { subject: subject() },
                "/tmp/file: Not supported file type. ERROR",
            ),
            (
                Reply::StatFailed { subject: subject(), detail: Some("No such file or directory".into()) },
                "/tmp/file: lstat() failed: No such file or directory. ERROR",
            ),
            (Reply::NotRegular { subject: "fd[7]".into() }, "fd[7]: Not a regular file. ERROR"),
            (Reply::Port(3310), "PORT 3310"),
            (Reply::NoFreePort, "Can't find any free port. ERROR"),
            (Reply::AcceptTimeout, "Accept timeout. ERROR"),
            (Reply::AcceptFailed, "accept() ERROR"),
            (Reply::ReadTimeout, "read timeout ERROR"),
            (Reply::ReadPoll, "read poll ERROR"),
            (Reply::TempWrite, "Temporary file -> write ERROR"),
            (Reply::TempCreate, "Temporary file -> create ERROR"),
        ];

        for (reply, text) in cases {
            assert_eq!(reply.to_string(), text);
        }
    }

    #[test]
    fn test_terminator() {
        let (output, buffer) = ClientOutput::buffer(b'\0');
        output.send(&Reply::Port(2000)).unwrap();
        output.send(&Reply::Ok { subject: "stream".into() }).unwrap();

        assert_eq!(buffer.raw(), b"PORT 2000\0stream: OK\0".to_vec());
        assert_eq!(buffer.lines(), vec!["PORT 2000", "stream: OK"]);
    }

    #[test]
    fn test_clean_reporting() {
        let (output, buffer) = ClientOutput::buffer(b'\n');
        let quiet = Reporter::new(output.clone(), false);
        quiet.outcome("/a", "/a", &ScanOutcome::Clean, CleanReport::LogOnly);
        quiet.outcome("fd[3]", "fd[3]", &ScanOutcome::Clean, CleanReport::Always);

        let chatty = Reporter::new(output, true);
        chatty.outcome("/b", "/b", &ScanOutcome::Clean, CleanReport::LogOnly);
        chatty.outcome("stream", "stream(127.0.0.1@2000)", &ScanOutcome::Clean, CleanReport::Always);

        assert_eq!(buffer.lines(), vec!["fd[3]: OK", "stream: OK"]);
    }

    #[test]
    fn test_reply_severity() {
        assert_eq!(Reply::Found { subject: subject(), signature: "X".into() }.severity(), Severity::Info);
        assert_eq!(Reply::Excluded { subject: subject() }.severity(), Severity::Debug);
        assert_eq!(Reply::NotRegular { subject: "fd[3]".into() }.severity(), Severity::Warning);
        assert_eq!(Reply::TempCreate.severity(), Severity::Error);
    }
}
