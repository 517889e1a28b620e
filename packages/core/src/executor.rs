//! Host command execution.
//!
//! Mounting needs root. The agent normally runs as root under the host
//! framework; for manual runs, commands can be wrapped in `sudo` or `pkexec`.

use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, IoResultExt, Result};

/// How root privileges are obtained for host commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeEscalation {
    /// Already root; run commands as they are.
    #[default]
    None,
    /// Polkit prompt.
    Pkexec,
    /// Terminal prompt (or NOPASSWD rules).
    Sudo,
}

impl PrivilegeEscalation {
    fn wrapper(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Pkexec => Some("pkexec"),
            Self::Sudo => Some("sudo"),
        }
    }
}

/// Exit status and trimmed output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with code 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stderr if there is any, otherwise a note about the exit code.
    pub fn failure_message(&self, program: &str) -> String {
        if self.stderr.is_empty() {
            format!("{program} exited with code {}", self.code.unwrap_or(-1))
        } else {
            self.stderr.clone()
        }
    }
}

/// Runs host commands with the configured escalation.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    escalation: PrivilegeEscalation,
}

impl ExecutionContext {
    /// Commands run unwrapped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Unwrapped when the effective user is root, `sudo` otherwise.
    pub fn auto() -> Self {
        if nix::unistd::geteuid().is_root() {
            Self::new()
        } else {
            Self::with_escalation(PrivilegeEscalation::Sudo)
        }
    }

    /// Commands are wrapped according to `escalation`.
    pub fn with_escalation(escalation: PrivilegeEscalation) -> Self {
        Self { escalation }
    }

    /// The configured escalation.
    pub fn escalation(&self) -> PrivilegeEscalation {
        self.escalation
    }

    /// Whether commands run without a wrapper.
    pub fn is_direct(&self) -> bool {
        self.escalation.wrapper().is_none()
    }

    /// Runs `program` as root and returns its output, whatever the exit code.
    pub fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let (label, mut command) = match self.escalation.wrapper() {
            None => (program.to_string(), Command::new(program)),
            Some(wrapper) => {
                let mut command = Command::new(wrapper);
                command.arg(program);
                (format!("{wrapper} {program}"), command)
            }
        };
        command.args(args);

        let shown: Vec<String> = args.iter().map(|arg| redact(arg)).collect();
        debug!(command = %label, args = ?shown, "running host command");
        let output = command.output().command_context(label)?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Like [`run`](Self::run), but a non-zero exit is an error.
    pub fn run_checked(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(program, args)?;
        if output.success() {
            return Ok(output);
        }

        // pkexec exits with 126 when the prompt is dismissed
        if self.escalation == PrivilegeEscalation::Pkexec && output.code == Some(126) {
            return Err(Error::AuthenticationCancelled);
        }
        Err(Error::CommandExit {
            command: program.to_string(),
            code: output.code.unwrap_or(-1),
            stderr: output.stderr,
        })
    }

    /// `mkdir -p` as root.
    pub fn create_dir(&self, path: &str) -> Result<()> {
        self.run_checked("mkdir", &["-p", path]).map(drop)
    }

    /// `rmdir` as root; fails on non-empty directories.
    pub fn remove_dir(&self, path: &str) -> Result<()> {
        self.run_checked("rmdir", &[path]).map(drop)
    }
}

/// Masks `secret=` values inside comma separated option strings.
fn redact(arg: &str) -> String {
    if !arg.contains("secret=") {
        return arg.to_string();
    }
    arg.split(',')
        .map(|opt| {
            if opt.starts_with("secret=") {
                "secret=<redacted>"
            } else {
                opt
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}
