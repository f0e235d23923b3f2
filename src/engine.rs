//! Scanning engine seam
//!
//! The detection algorithm lives behind [`ScanEngine`]. The core only ever
//! sees a [`ScanOutcome`] per data source.
//!
//! [`EngineHandle`] shares one engine across concurrent work units. Every
//! unit holds an [`EngineLease`]; taking a lease increments the reference
//! count and dropping it decrements it exactly once. A retired engine (one
//! being replaced by a reload) refuses new leases while existing ones finish.
//!
//! [`SignatureEngine`] is a small literal byte-signature matcher used by the
//! `scand` binary and the test suite.

use crate::error::{ConfigError, DispatchError, EngineError};
use regex::bytes::RegexSet;
use std::fmt::{self, Write as _};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Result of scanning one data source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Nothing matched
    Clean,

    /// A signature matched; carries the signature name
    Infected(String),

    /// The engine could not finish
    Error(EngineError),
}

impl ScanOutcome {
    /// Returns true if a signature matched
    pub fn is_infected(&self) -> bool {
        matches!(self, ScanOutcome::Infected(_))
    }

    /// Returns true if the outcome must abort the current walk or session
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScanOutcome::Error(e) if e.is_fatal())
    }
}

/// A malware-detection engine
pub trait ScanEngine: Send + Sync {
    /// Scan an open file from its current position
    fn scan_file(&self, file: &mut File) -> ScanOutcome;

    /// Scan a file by path
    fn scan_path(&self, path: &Path) -> ScanOutcome {
        match File::open(path) {
            Ok(mut file) => self.scan_file(&mut file),
            Err(e) if e.kind() == std::io::ErrorKind::OutOfMemory => {
                ScanOutcome::Error(EngineError::OutOfMemory)
            }
            Err(_) => ScanOutcome::Error(EngineError::Open),
        }
    }
}

struct Shared {
    engine: Box<dyn ScanEngine>,
    leases: AtomicUsize,
    retired: AtomicBool,
}

/// Shared handle to the engine owned by a request or the daemon
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    /// Wrap an engine for sharing
    pub fn new(engine: impl ScanEngine + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine: Box::new(engine),
                leases: AtomicUsize::new(0),
                retired: AtomicBool::new(false),
            }),
        }
    }

    /// Borrow the engine for an inline scan on the owner's thread
    pub fn engine(&self) -> &dyn ScanEngine {
        self.shared.engine.as_ref()
    }

    /// Take a reference for a unit that outlives the caller's borrow
    pub fn acquire(&self) -> Result<EngineLease, DispatchError> {
        // Count first so a concurrent retire never sees zero while we race in
        self.shared.leases.fetch_add(1, Ordering::AcqRel);
        let lease = EngineLease {
            shared: Arc::clone(&self.shared),
        };

        if self.shared.retired.load(Ordering::Acquire) {
            // Dropping the lease gives the reference back
            return Err(DispatchError::EngineRetired);
        }

        Ok(lease)
    }

    /// Number of leases currently outstanding
    pub fn outstanding(&self) -> usize {
        self.shared.leases.load(Ordering::Acquire)
    }

    /// Refuse new leases; existing ones stay valid until dropped
    pub fn retire(&self) {
        self.shared.retired.store(true, Ordering::Release);
    }

    /// Returns true once the engine refuses new leases
    pub fn is_retired(&self) -> bool {
        self.shared.retired.load(Ordering::Acquire)
    }

    /// Returns true if the engine can be replaced without stranding a unit
    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("outstanding", &self.outstanding())
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// One counted reference to a shared engine
pub struct EngineLease {
    shared: Arc<Shared>,
}

impl EngineLease {
    /// Borrow the engine
    pub fn engine(&self) -> &dyn ScanEngine {
        self.shared.engine.as_ref()
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        self.shared.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for EngineLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineLease").finish_non_exhaustive()
    }
}

/// Read size for signature matching
const READ_CHUNK: usize = 64 * 1024;

/// Literal byte-signature engine
///
/// Each signature is a name and a byte string; a file is infected when any
/// byte string occurs anywhere in it. Matching runs over fixed chunks with
/// enough overlap that a signature spanning a chunk boundary is still seen.
pub struct SignatureEngine {
    names: Vec<String>,
    set: RegexSet,
    longest: usize,
}

impl SignatureEngine {
    /// Build from `(name, bytes)` pairs
    pub fn from_signatures<N, B>(signatures: impl IntoIterator<Item = (N, B)>) -> Result<Self, ConfigError>
    where
        N: Into<String>,
        B: AsRef<[u8]>,
    {
        let mut names = Vec::new();
        let mut patterns = Vec::new();
        let mut longest = 0;

        for (index, (name, bytes)) in signatures.into_iter().enumerate() {
            let bytes = bytes.as_ref();
            if bytes.is_empty() {
                return Err(ConfigError::InvalidSignature {
                    line: index + 1,
                    reason: "empty pattern".to_string(),
                });
            }
            longest = longest.max(bytes.len());
            names.push(name.into());
            patterns.push(literal_pattern(bytes));
        }

        let set = RegexSet::new(&patterns).map_err(|e| ConfigError::InvalidSignature {
            line: 0,
            reason: e.to_string(),
        })?;

        Ok(Self { names, set, longest })
    }

    /// Parse a signature database: one `Name:hexbytes` per line
    ///
    /// Blank lines and lines starting with `#` are ignored.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut signatures = Vec::new();

        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (name, hex) = line.split_once(':').ok_or_else(|| ConfigError::InvalidSignature {
                line: index + 1,
                reason: "expected Name:hexbytes".to_string(),
            })?;

            let bytes = decode_hex(hex.trim()).ok_or_else(|| ConfigError::InvalidSignature {
                line: index + 1,
                reason: format!("bad hex pattern '{}'", hex.trim()),
            })?;

            signatures.push((name.trim().to_string(), bytes));
        }

        Self::from_signatures(signatures)
    }

    /// Load a signature database from disk
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Signatures {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&text)
    }

    /// Number of loaded signatures
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns true if no signatures are loaded
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn first_match(&self, haystack: &[u8]) -> Option<&str> {
        self.set
            .matches(haystack)
            .iter()
            .next()
            .map(|i| self.names[i].as_str())
    }
}

impl ScanEngine for SignatureEngine {
    fn scan_file(&self, file: &mut File) -> ScanOutcome {
        if self.is_empty() {
            return ScanOutcome::Clean;
        }

        let overlap = self.longest.saturating_sub(1);
        let mut window = Vec::with_capacity(READ_CHUNK + overlap);
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            let n = match file.read(&mut chunk) {
                Ok(0) => return ScanOutcome::Clean,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return ScanOutcome::Error(EngineError::from_read(&e)),
            };

            window.extend_from_slice(&chunk[..n]);
            if let Some(name) = self.first_match(&window) {
                return ScanOutcome::Infected(name.to_string());
            }

            // Keep the tail so a match straddling two reads is still found
            let keep = overlap.min(window.len());
            window.drain(..window.len() - keep);
        }
    }
}

impl fmt::Debug for SignatureEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureEngine")
            .field("signatures", &self.names.len())
            .finish()
    }
}

fn literal_pattern(bytes: &[u8]) -> String {
    let mut pattern = String::with_capacity(5 + bytes.len() * 4);
    pattern.push_str("(?-u)");
    for b in bytes {
        let _ = write!(pattern, "\\x{:02x}", b);
    }
    pattern
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.is_empty() || hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}
