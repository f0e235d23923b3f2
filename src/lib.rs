//! scand - scan-dispatch core of a malware-scanning daemon
//!
//! Walks filesystem trees and network streams, decides what to scan and
//! how, and hands the work to a scanning engine either inline or through a
//! worker pool. Every unit of work produces one client reply line.
//!
//! # Features
//!
//! - **Path classification**: every visited entry is classified by a pure
//!   function (exclusions, empty files, access checks, special files).
//!
//! - **Multiscan**: eligible files are fanned out to a fixed worker pool.
//!   The engine is shared through counted leases so it is never released
//!   while a queued unit still needs it.
//!
//! - **Streaming scans**: a fresh port per stream, one peer, a deadline on
//!   every wait, and a byte cap on what gets staged and scanned.
//!
//! - **Stable reply format**: one place defines the exact reply wording.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Requests                                │
//! │        SCAN / MULTISCAN <path>      STREAM       FILDES <fd>     │
//! └──────────┬────────────────────────────┬──────────────┬───────────┘
//!            │                            │              │
//!            ▼                            ▼              │
//! ┌──────────────────────┐     ┌──────────────────────┐  │
//! │  TreeWalk (walkdir)  │     │   StreamSession      │  │
//! │  VisitEvent          │     │   port ─> accept ─>  │  │
//! │        │             │     │   receive ─> temp    │  │
//! │        ▼             │     └──────────┬───────────┘  │
//! │  classify()          │                │              │
//! │        │             │                │              │
//! │        ▼             │                │              │
//! │  Dispatcher ─────────┼──> ThreadPool  │              │
//! │   inline │           │   (crossbeam)  │              │
//! └──────────┼───────────┘        │       │              │
//!            ▼                    ▼       ▼              ▼
//!     ┌─────────────────────────────────────────────────────────┐
//!     │   EngineHandle / EngineLease  ──>  dyn ScanEngine        │
//!     └───────────────────────────┬─────────────────────────────┘
//!                                 ▼
//!     ┌─────────────────────────────────────────────────────────┐
//!     │  Reporter: client reply + log line, Remediation on FOUND │
//!     └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Scan a tree inline, stopping at the first detection
//! scand -s sigs.db scan /srv/upload
//!
//! # Scan every file on 16 workers
//! scand -s sigs.db multiscan /srv/share -w 16
//!
//! # Receive one stream and scan it
//! scand -s sigs.db --stream-min-port 30000 --stream-max-port 30100 stream
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod progress;
pub mod remedy;
pub mod reply;
pub mod scanner;
pub mod stream;

pub use config::{CliArgs, PortRange, ScanConfig};
pub use engine::{EngineHandle, EngineLease, ScanEngine, ScanOutcome, SignatureEngine};
pub use error::{ConfigError, DispatchError, EngineError, StreamError};
pub use pool::{TaskPool, ThreadPool};
pub use reply::{ClientOutput, Reply, Reporter};
pub use scanner::{scan_descriptor, scan_tree, ScanContext, ScanMode, ScanSummary, ScanTotals};
pub use stream::{scan_stream, StreamSession};
