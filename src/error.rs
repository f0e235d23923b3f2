//! Error types for scand
//!
//! This module defines the error hierarchy for the scan-dispatch core:
//! - Engine error codes (reported to clients as `<subject>: <text> ERROR`)
//! - Streaming session failures, one variant per terminal state
//! - Worker pool dispatch and lifecycle errors
//! - Configuration and CLI errors
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Display text of client-visible errors is part of the wire contract
//! - Resource exhaustion is distinguishable from plain I/O failure

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Error codes returned by a scanning engine
///
/// The `Display` text is what clients receive between the subject and the
/// trailing `ERROR`, so it must stay stable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Allocation or reference-count failure; always fatal to the request
    #[error("Can't allocate memory")]
    OutOfMemory,

    /// The data source could not be opened
    #[error("Can't open file or directory")]
    Open,

    /// Reading the data source failed
    #[error("Can't read file")]
    Read,

    /// Repositioning the data source failed
    #[error("Can't set file offset")]
    Seek,

    /// Querying the data source metadata failed
    #[error("Can't get file status")]
    Stat,

    /// Engine-specific failure with its own text
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Check if this error must abort the current walk or session
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::OutOfMemory)
    }

    /// Map an I/O error raised while reading a data source
    pub fn from_read(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::OutOfMemory => EngineError::OutOfMemory,
            _ => EngineError::Read,
        }
    }
}

/// Streaming scan failures
///
/// Each variant is a distinct terminal state of a streaming session.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Every port in the configured range was taken
    #[error("no free port in range {min}-{max} after {attempts} attempts")]
    NoFreePort { min: u16, max: u16, attempts: u32 },

    /// Listening on the bound socket failed
    #[error("listen() failed on port {port}: {source}")]
    Listen { port: u16, source: io::Error },

    /// The negotiated port could not be sent to the client
    #[error("failed to announce port {port}: {source}")]
    PortAnnounce { port: u16, source: io::Error },

    /// No peer connected before the deadline
    #[error("accept timeout on port {port}")]
    AcceptTimeout { port: u16 },

    /// Waiting for or accepting the peer failed
    #[error("accept() failed on port {port}: {source}")]
    Accept { port: u16, source: io::Error },

    /// The staging file could not be created
    #[error("can't create temporary file: {0}")]
    TempCreate(io::Error),

    /// Writing to the staging file failed
    #[error("can't write to temporary file: {0}")]
    TempWrite(io::Error),

    /// The peer went quiet past the deadline
    #[error("read timeout")]
    ReadTimeout,

    /// Reading from the peer failed
    #[error("read poll failed: {0}")]
    ReadPoll(io::Error),

    /// The staged stream could not be handed to the engine
    #[error("scan of staged stream failed: {0}")]
    Scan(#[from] DispatchError),
}

/// Errors raised when handing work to the worker pool
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The engine is being replaced and refuses new references
    #[error("engine reference could not be taken: engine is retired")]
    EngineRetired,

    /// The pool queue is at capacity
    #[error("worker pool queue is full")]
    PoolFull,

    /// The pool is shutting down or gone
    #[error("worker pool is shutting down")]
    PoolClosed,
}

impl DispatchError {
    /// Check if this error is a capacity signal (the caller may try later)
    pub fn is_capacity(&self) -> bool {
        matches!(self, DispatchError::PoolFull)
    }
}

/// Worker pool lifecycle errors
#[derive(Error, Debug)]
pub enum PoolError {
    /// Worker thread could not be spawned
    #[error("Failed to spawn worker {id}: {reason}")]
    Spawn { id: usize, reason: String },

    /// Worker thread panicked outside of a task
    #[error("Worker {id} panicked: {message}")]
    Panicked { id: usize, message: String },
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid worker count
    #[error("Invalid worker count {count}: must be between 1 and {max}")]
    InvalidWorkerCount { count: usize, max: usize },

    /// Invalid queue size
    #[error("Invalid queue size {size}: must be at least {min}")]
    InvalidQueueSize { size: usize, min: usize },

    /// Invalid exclude pattern
    #[error("Invalid exclude pattern '{pattern}': {reason}")]
    InvalidExcludePattern { pattern: String, reason: String },

    /// Temporary directory missing or not a directory
    #[error("Invalid temporary directory '{path}': {reason}")]
    InvalidTempDir { path: PathBuf, reason: String },

    /// Signature database could not be read
    #[error("Cannot load signatures from '{path}': {reason}")]
    Signatures { path: PathBuf, reason: String },

    /// Signature database line is malformed
    #[error("Invalid signature on line {line}: {reason}")]
    InvalidSignature { line: usize, reason: String },
}

/// Result type alias for StreamError
pub type StreamResult<T> = std::result::Result<T, StreamError>;
