//! Configuration types for scand
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime configuration with validation
//! - Stream port range clamping

use crate::error::ConfigError;
use clap::{Parser, Subcommand};
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Maximum reasonable worker count
const MAX_WORKERS: usize = 512;

/// Minimum queue size
const MIN_QUEUE_SIZE: usize = 16;

/// Lowest port a stream session may bind
pub const STREAM_PORT_FLOOR: u16 = 1024;

/// Highest port a stream session may bind
pub const STREAM_PORT_CEILING: u16 = 65535;

/// Default cap on a single stream (10 MiB)
const DEFAULT_STREAM_MAX_LENGTH: u64 = 10 * 1024 * 1024;

/// Scan-dispatch core of a malware-scanning daemon
#[derive(Parser, Debug, Clone)]
#[command(
    name = "scand",
    version,
    about = "Walks paths and network streams and dispatches them to a scanning engine",
    long_about = "Runs SCAN, MULTISCAN, STREAM and FILDES requests against a signature engine.\n\n\
                  Replies are written to stdout one per line using the daemon reply format\n\
                  (`<subject>: OK`, `<subject>: <name> FOUND`, `<subject>: <text> ERROR`).",
    after_help = "EXAMPLES:\n    \
        scand -s sigs.db scan /home/user/Downloads\n    \
        scand -s sigs.db multiscan /srv/share -w 16\n    \
        scand -s sigs.db --exclude-path '^/proc/' scan /\n    \
        scand -s sigs.db --stream-min-port 30000 --stream-max-port 30100 stream"
)]
pub struct CliArgs {
    /// Request to run
    #[command(subcommand)]
    pub command: Command,

    /// Signature database (one `Name:hexbytes` per line)
    #[arg(short = 's', long, env = "SCAND_SIGNATURES", value_name = "FILE", global = true)]
    pub signatures: Option<PathBuf>,

    /// Don't scan files whose path matches this regular expression
    #[arg(long, env = "SCAND_EXCLUDE_PATH", value_name = "REGEX", global = true)]
    pub exclude_path: Option<String>,

    /// Lowest port for streaming scans
    #[arg(long, env = "SCAND_STREAM_MIN_PORT", default_value = "1024", value_name = "PORT", global = true)]
    pub stream_min_port: u32,

    /// Highest port for streaming scans
    #[arg(long, env = "SCAND_STREAM_MAX_PORT", default_value = "65535", value_name = "PORT", global = true)]
    pub stream_max_port: u32,

    /// Address streaming sessions listen on
    #[arg(long, env = "SCAND_STREAM_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED), value_name = "ADDR", global = true)]
    pub stream_bind: IpAddr,

    /// Stream accept/read timeout in seconds (0 waits forever)
    #[arg(long, env = "SCAND_READ_TIMEOUT", default_value = "120", value_name = "SECS", global = true)]
    pub read_timeout: u64,

    /// Maximum bytes accepted from one stream (0 for no limit)
    #[arg(long, env = "SCAND_STREAM_MAX_LENGTH", default_value_t = DEFAULT_STREAM_MAX_LENGTH, value_name = "BYTES", global = true)]
    pub stream_max_length: u64,

    /// Directory for staged stream data
    #[arg(long, env = "SCAND_TMPDIR", value_name = "DIR", global = true)]
    pub temporary_directory: Option<PathBuf>,

    /// Keep staged stream files after scanning
    #[arg(long, env = "SCAND_LEAVE_TEMPORARY_FILES", global = true)]
    pub leave_temporary_files: bool,

    /// Log clean files too
    #[arg(long, env = "SCAND_LOG_CLEAN", global = true)]
    pub log_clean: bool,

    /// Maximum directory depth below each scanned path
    #[arg(long, env = "SCAND_MAX_DIRECTORY_RECURSION", default_value = "15", value_name = "NUM", global = true)]
    pub max_directory_recursion: usize,

    /// Shell command to run on detection (%v is replaced by the signature name)
    #[arg(long, env = "SCAND_VIRUS_EVENT", value_name = "COMMAND", global = true)]
    pub virus_event: Option<String>,

    /// Number of worker threads for multiscan
    #[arg(short = 'w', long, env = "SCAND_WORKERS", default_value_t = default_workers(), value_name = "NUM", global = true)]
    pub workers: usize,

    /// Worker queue capacity (dispatch fails fast beyond this)
    #[arg(long, env = "SCAND_QUEUE_SIZE", default_value = "1024", value_name = "NUM", global = true)]
    pub queue_size: usize,

    /// Terminate replies with NUL instead of newline
    #[arg(short = 'z', long = "null", global = true)]
    pub null_terminated: bool,

    /// Show a progress spinner on stderr
    #[arg(short = 'p', long, global = true)]
    pub progress: bool,

    /// Quiet mode - suppress the summary
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose logging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Requests
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Scan paths inline, stopping a walk at the first detection
    Scan {
        /// Files or directories to scan
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
    },

    /// Scan paths on the worker pool, never stopping on detection
    Multiscan {
        /// Files or directories to scan
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
    },

    /// Negotiate a port, receive one stream and scan it
    Stream,

    /// Open each path and scan it through its descriptor
    Fildes {
        /// Files to open and scan
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
    },
}

fn default_workers() -> usize {
    num_cpus::get()
}

/// Inclusive port range for streaming sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    /// Lowest port
    pub min: u16,

    /// Highest port
    pub max: u16,
}

impl PortRange {
    /// Clamp configured bounds into a usable range
    ///
    /// `min` falls back to 1024 unless it lies within `[1024, 65535]`;
    /// `max` falls back to 65535 unless it lies within `[min, 65535]`.
    pub fn from_options(min: u32, max: u32) -> Self {
        let floor = u32::from(STREAM_PORT_FLOOR);
        let ceiling = u32::from(STREAM_PORT_CEILING);

        let min = if (floor..=ceiling).contains(&min) {
            min as u16
        } else {
            STREAM_PORT_FLOOR
        };

        let max = if (u32::from(min)..=ceiling).contains(&max) {
            max as u16
        } else {
            STREAM_PORT_CEILING
        };

        Self { min, max }
    }

    /// Number of ports in the range
    pub fn len(&self) -> u32 {
        u32::from(self.max) - u32::from(self.min) + 1
    }

    /// A range always holds at least one port
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Check if a port lies in the range
    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Signature database path
    pub signatures: Option<PathBuf>,

    /// Compiled exclude pattern
    pub exclude_path: Option<Regex>,

    /// Stream port range
    pub stream_ports: PortRange,

    /// Stream listen address
    pub stream_bind: IpAddr,

    /// Accept/read deadline (None waits forever)
    pub read_timeout: Option<Duration>,

    /// Stream byte cap (None for unlimited)
    pub stream_max_length: Option<u64>,

    /// Staging directory for streams
    pub temporary_directory: PathBuf,

    /// Keep staged stream files
    pub leave_temporary_files: bool,

    /// Report clean results
    pub log_clean: bool,

    /// Maximum directory depth below a scanned path
    pub max_directory_recursion: usize,

    /// Detection command template
    pub virus_event: Option<String>,

    /// Number of worker threads
    pub worker_count: usize,

    /// Worker queue capacity
    pub queue_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            signatures: None,
            exclude_path: None,
            stream_ports: PortRange::from_options(1024, 65535),
            stream_bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            read_timeout: Some(Duration::from_secs(120)),
            stream_max_length: Some(DEFAULT_STREAM_MAX_LENGTH),
            temporary_directory: std::env::temp_dir(),
            leave_temporary_files: false,
            log_clean: false,
            max_directory_recursion: 15,
            virus_event: None,
            worker_count: default_workers(),
            queue_size: 1024,
        }
    }
}

impl ScanConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Result<Self, ConfigError> {
        // Validate worker count
        if args.workers == 0 || args.workers > MAX_WORKERS {
            return Err(ConfigError::InvalidWorkerCount {
                count: args.workers,
                max: MAX_WORKERS,
            });
        }

        // Validate queue size
        if args.queue_size < MIN_QUEUE_SIZE {
            return Err(ConfigError::InvalidQueueSize {
                size: args.queue_size,
                min: MIN_QUEUE_SIZE,
            });
        }

        // Compile exclude pattern
        let exclude_path = args
            .exclude_path
            .as_deref()
            .map(|p| {
                Regex::new(p).map_err(|e| ConfigError::InvalidExcludePattern {
                    pattern: p.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        // Validate staging directory
        let temporary_directory = args
            .temporary_directory
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        if !temporary_directory.is_dir() {
            return Err(ConfigError::InvalidTempDir {
                path: temporary_directory,
                reason: "not an existing directory".to_string(),
            });
        }

        Ok(Self {
            signatures: args.signatures.clone(),
            exclude_path,
            stream_ports: PortRange::from_options(args.stream_min_port, args.stream_max_port),
            stream_bind: args.stream_bind,
            read_timeout: seconds_or_forever(args.read_timeout),
            stream_max_length: (args.stream_max_length > 0).then_some(args.stream_max_length),
            temporary_directory,
            leave_temporary_files: args.leave_temporary_files,
            log_clean: args.log_clean,
            max_directory_recursion: args.max_directory_recursion,
            virus_event: args.virus_event.clone(),
            worker_count: args.workers,
            queue_size: args.queue_size,
        })
    }
}

/// A zero timeout means "wait forever"
fn seconds_or_forever(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["scand"];
        argv.extend_from_slice(extra);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_port_range_defaults() {
        assert_eq!(PortRange::from_options(0, 0), PortRange { min: 1024, max: 65535 });
        assert_eq!(PortRange::from_options(80, 90), PortRange { min: 1024, max: 65535 });
        assert_eq!(PortRange::from_options(70000, 2000), PortRange { min: 1024, max: 2000 });
    }

    #[test]
    fn test_default_stream_ports() {
        let config = ScanConfig::from_args(&parse(&["stream"])).unwrap();
        assert_eq!(config.stream_ports, PortRange { min: 1024, max: 65535 });
        assert_eq!(ScanConfig::default().stream_ports, config.stream_ports);
    }

    #[test]
    fn test_port_range_max_below_min() {
        let range = PortRange::from_options(5000, 4000);
        assert_eq!(range, PortRange { min: 5000, max: 65535 });
    }

    #[test]
    fn test_port_range_single_port() {
        let range = PortRange::from_options(40000, 40000);
        assert_eq!(range.len(), 1);
        assert!(range.contains(40000));
        assert!(!range.contains(40001));
    }

    #[test]
    fn test_from_args() {
        let args = parse(&[
            "--exclude-path",
            r"\.snapshot",
            "--read-timeout",
            "0",
            "--stream-max-length",
            "0",
            "-w",
            "4",
            "scan",
            "/tmp",
        ]);
        let config = ScanConfig::from_args(&args).unwrap();

        assert_eq!(config.worker_count, 4);
        assert_eq!(config.read_timeout, None);
        assert_eq!(config.stream_max_length, None);
        let exclude = config.exclude_path.unwrap();
        assert!(exclude.is_match("/data/.snapshot/hourly.0"));
        assert!(!exclude.is_match("/data/myfile.txt"));
    }

    #[test]
    fn test_invalid_worker_count() {
        let args = parse(&["-w", "0", "stream"]);
        assert!(matches!(
            ScanConfig::from_args(&args),
            Err(ConfigError::InvalidWorkerCount { count: 0, .. })
        ));
    }

    #[test]
    fn test_invalid_exclude_pattern() {
        let args = parse(&["--exclude-path", "(unclosed", "stream"]);
        assert!(matches!(
            ScanConfig::from_args(&args),
            Err(ConfigError::InvalidExcludePattern { .. })
        ));
    }

    #[test]
    fn test_missing_temp_dir() {
        let args = parse(&["--temporary-directory", "/nonexistent/scand-tmp", "stream"]);
        assert!(matches!(
            ScanConfig::from_args(&args),
            Err(ConfigError::InvalidTempDir { .. })
        ));
    }

    #[test]
    fn test_scan_requires_path() {
        assert!(CliArgs::try_parse_from(["scand", "scan"]).is_err());
    }
}
