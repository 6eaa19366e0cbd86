//! Host command execution
//!
//! Every mutation the provisioner makes outside the unit file goes through the
//! [`Host`] trait. Steps never build `std::process::Command` themselves: they
//! describe a [`HostCommand`] and hand it to the host, which decides how (or
//! whether) to run it.
//!
//! - [`SystemHost`] runs commands for real, in a new process group, with a
//!   per-call timeout.
//! - [`DryRunHost`] logs and records commands without executing them.

use std::cell::RefCell;
use std::fmt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::{ProvisionError, Result};
use crate::process_guard::{CommandProcessGroup, DEFAULT_KILL_GRACE, wait_with_timeout};

/// A program invocation described as data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for HostCommand {
    /// Shell-ready rendering, also used for the user-data script
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.env {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", key, shell_quote(value))?;
            first = false;
        }
        if !first {
            f.write_str(" ")?;
        }
        f.write_str(&shell_quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

/// Quote a word for POSIX sh, leaving plain words untouched
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Output from a host command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Successful, silent output
    pub fn ok() -> Self {
        Self {
            exit_code: Some(0),
            success: true,
            ..Self::default()
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code: Some(code),
            success: false,
            ..Self::default()
        }
    }

    /// stderr then stdout, trimmed, for error messages and classification
    pub fn diagnostics(&self) -> String {
        let mut text = self.stderr.trim().to_string();
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stdout);
        }
        text
    }
}

/// Everything a provisioning step may ask of the machine it configures
pub trait Host {
    /// Run a command to completion.
    ///
    /// A non-zero exit is reported through `CommandOutput::success`, not as
    /// an error. `Err` means the command could not be run at all, or was
    /// killed after `timeout`.
    fn run(&self, cmd: &HostCommand, timeout: Duration) -> Result<CommandOutput>;

    /// Whether `path` exists and is executable
    fn is_executable(&self, path: &Path) -> bool;

    /// Whether the provisioner holds root privileges
    fn is_privileged(&self) -> bool;

    /// True for hosts that only record what would happen
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// The machine we are running on
#[derive(Debug, Clone)]
pub struct SystemHost {
    kill_grace: Duration,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemHost {
    pub fn new() -> Self {
        Self {
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Override the SIGTERM to SIGKILL grace period used on timeout
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

impl Host for SystemHost {
    fn run(&self, cmd: &HostCommand, timeout: Duration) -> Result<CommandOutput> {
        tracing::info!(command = %cmd, ?timeout, "Running host command");

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();
        for (key, value) in &cmd.env {
            command.env(key, value);
        }

        let child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ProvisionError::config(format!(
                "Command '{}' not found on this host",
                cmd.program
            )),
            std::io::ErrorKind::PermissionDenied => ProvisionError::permission(format!(
                "Not permitted to execute '{}': {}",
                cmd.program, e
            )),
            _ => ProvisionError::Io(e),
        })?;

        let output = wait_with_timeout(child, timeout, self.kill_grace)?;
        if output.timed_out {
            return Err(ProvisionError::timeout(format!(
                "'{}' did not finish within {}s",
                cmd,
                timeout.as_secs()
            )));
        }

        let exit_code = output.status.and_then(|s| s.code());
        let success = output.status.is_some_and(|s| s.success());
        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code,
            success,
        };

        if success {
            tracing::debug!(command = %cmd, "Host command succeeded");
        } else {
            tracing::warn!(command = %cmd, exit_code = exit_code.unwrap_or(-1), "Host command failed");
        }
        Ok(result)
    }

    fn is_executable(&self, path: &Path) -> bool {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    fn is_privileged(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }
}

/// Records commands instead of running them
#[derive(Debug, Default)]
pub struct DryRunHost {
    commands: RefCell<Vec<HostCommand>>,
}

impl DryRunHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands that would have run, in order
    pub fn commands(&self) -> Vec<HostCommand> {
        self.commands.borrow().clone()
    }
}

impl Host for DryRunHost {
    fn run(&self, cmd: &HostCommand, _timeout: Duration) -> Result<CommandOutput> {
        tracing::info!(command = %cmd, "[dry-run] would run");
        self.commands.borrow_mut().push(cmd.clone());
        Ok(CommandOutput::ok())
    }

    fn is_executable(&self, _path: &Path) -> bool {
        true
    }

    fn is_privileged(&self) -> bool {
        true
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}
