//! Post-detection remediation
//!
//! A [`Remediation`] runs once per detection and never for clean or failed
//! scans. [`VirusEventCommand`] runs a configured shell command with `%v`
//! replaced by the signature name.

use std::process::Command;
use tracing::{debug, error, warn};

/// Environment variable carrying the infected subject
pub const ENV_FILENAME: &str = "CLAM_VIRUSEVENT_FILENAME";

/// Environment variable carrying the signature name
pub const ENV_VIRUSNAME: &str = "CLAM_VIRUSEVENT_VIRUSNAME";

/// Action taken after a detection
pub trait Remediation: Send + Sync {
    /// Handle one detection of `signature` in `subject`
    fn run(&self, subject: &str, signature: &str);
}

/// Does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRemediation;

impl Remediation for NoRemediation {
    fn run(&self, _subject: &str, _signature: &str) {}
}

/// Runs a shell command per detection
#[derive(Debug, Clone)]
pub struct VirusEventCommand {
    template: String,
}

impl VirusEventCommand {
    /// Create from a command template
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Expand the template for one signature
    pub fn expand(&self, signature: &str) -> String {
        self.template.replace("%v", signature)
    }
}

impl Remediation for VirusEventCommand {
    fn run(&self, subject: &str, signature: &str) {
        let command = self.expand(signature);
        debug!(command = %command, subject = %subject, "Running VirusEvent");

        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(&command)
            .env(ENV_FILENAME, subject)
            .env(ENV_VIRUSNAME, signature)
            .status();

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                warn!(command = %command, status = %status, "VirusEvent command failed");
            }
            Err(e) => {
                error!(command = %command, error = %e, "Can't execute VirusEvent command");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_expand() {
        let cmd = VirusEventCommand::new("logger -t av 'found %v (%v)'");
        assert_eq!(cmd.expand("Eicar"), "logger -t av 'found Eicar (Eicar)'");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_sees_environment() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("event.txt");
        let cmd = VirusEventCommand::new(format!(
            "echo \"%v $CLAM_VIRUSEVENT_FILENAME\" > {}",
            out.display()
        ));

        cmd.run("/srv/upload/bad.exe", "Test.Sig");

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "Test.Sig /srv/upload/bad.exe");
    }
}
