// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External command execution.
//!
//! Every external effect the provisioner has on the machine, e.g.,
//! partitioning, formatting, mounting, installing, tunnel creation, goes
//! through the [`Host`] trait. The real implementation shells out via
//! [`std::process::Command`]. Swapping the host out allows the whole
//! provisioning sequence to be exercised against a recording fake.

use std::{
    ffi::{OsStr, OsString},
    fmt::{Display, Formatter, Result as FmtResult},
    path::Path,
    process::Command,
};
use tracing::{debug, instrument};

/// A single external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: OsString,
    args: Vec<OsString>,
}

impl Invocation {
    /// Construct new invocation of target program without arguments.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Construct invocation from an argument vector.
    ///
    /// The first element is treated as the program. Returns [`None`] if the
    /// vector is empty.
    pub fn from_argv(argv: impl IntoIterator<Item = impl Into<OsString>>) -> Option<Self> {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv.next()?;
        Some(Self {
            program,
            args: argv.collect(),
        })
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append many arguments.
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &OsStr {
        self.program.as_os_str()
    }

    pub fn arguments(&self) -> &[OsString] {
        self.args.as_slice()
    }
}

impl Display for Invocation {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.program.to_string_lossy().as_ref())?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(fmt, " '{arg}'")?;
            } else {
                write!(fmt, " {arg}")?;
            }
        }

        Ok(())
    }
}

/// Layer of indirection for external effects on the machine.
pub trait Host: Send + Sync {
    /// Run command to completion, capturing its output.
    ///
    /// Returns standard output on success. A non-zero exit status is an error
    /// carrying whatever the command printed.
    fn exec(&self, cmd: &Invocation) -> Result<String>;

    /// Run command attached to the current terminal.
    ///
    /// Blocks until the command exits.
    fn exec_interactive(&self, cmd: &Invocation) -> Result<()>;

    /// Check if path names a block device.
    fn is_block_device(&self, path: &Path) -> bool;
}

/// Host access through the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl Host for SystemHost {
    #[instrument(skip(self), fields(cmd = %cmd), level = "debug")]
    fn exec(&self, cmd: &Invocation) -> Result<String> {
        let output = Command::new(cmd.program())
            .args(cmd.arguments())
            .output()
            .map_err(|err| HostError::Spawn {
                program: cmd.program().to_string_lossy().into_owned(),
                source: err,
            })?;
        let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
        let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();

        if !output.status.success() {
            let mut message = String::new();
            if !stdout.is_empty() {
                message.push_str(format!("stdout: {stdout}").as_str());
            }

            if !stderr.is_empty() {
                message.push_str(format!("stderr: {stderr}").as_str());
            }

            return Err(HostError::Failed {
                command: cmd.to_string(),
                message: chomp(message),
            });
        }

        debug!("{}", stdout.trim_end());
        Ok(stdout)
    }

    #[instrument(skip(self), fields(cmd = %cmd), level = "debug")]
    fn exec_interactive(&self, cmd: &Invocation) -> Result<()> {
        let status = Command::new(cmd.program())
            .args(cmd.arguments())
            .spawn()
            .and_then(|mut child| child.wait())
            .map_err(|err| HostError::Spawn {
                program: cmd.program().to_string_lossy().into_owned(),
                source: err,
            })?;

        if !status.success() {
            return Err(HostError::Failed {
                command: cmd.to_string(),
                message: status.to_string(),
            });
        }

        Ok(())
    }

    fn is_block_device(&self, path: &Path) -> bool {
        use std::os::unix::fs::FileTypeExt;

        std::fs::metadata(path)
            .map(|meta| meta.file_type().is_block_device())
            .unwrap_or(false)
    }
}

// INVARIANT: Chomp trailing newlines.
fn chomp(message: String) -> String {
    message
        .strip_suffix("\r\n")
        .or(message.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(message)
}

/// Host interaction error types.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Command could not be started at all.
    #[error("failed to run {program:?}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Command ran but reported failure.
    #[error("command `{command}` failed: {message}")]
    Failed { command: String, message: String },
}

impl HostError {
    /// Text the failing command printed, if any.
    pub fn message(&self) -> &str {
        match self {
            Self::Spawn { .. } => "",
            Self::Failed { message, .. } => message.as_str(),
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = HostError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn invocation_display_quotes_whitespace() {
        let cmd = Invocation::new("curl")
            .args(["-sf", "-d"])
            .arg(r#"{"name": "llama3.2"}"#);
        assert_eq!(cmd.to_string(), r#"curl -sf -d '{"name": "llama3.2"}'"#);
    }

    #[test]
    fn invocation_from_argv() {
        let cmd = Invocation::from_argv(["nixos-install", "--root", "/mnt"]);
        assert_eq!(
            cmd,
            Some(Invocation::new("nixos-install").args(["--root", "/mnt"]))
        );
        assert_eq!(Invocation::from_argv(Vec::<String>::new()), None);
    }

    #[test]
    fn system_host_reports_failure_output() {
        let cmd = Invocation::new("sh").args(["-c", "echo nope >&2; exit 3"]);
        let result = SystemHost.exec(&cmd);
        match result {
            Err(HostError::Failed { message, .. }) => assert_eq!(message, "stderr: nope"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn system_host_captures_stdout() -> anyhow::Result<()> {
        let output = SystemHost.exec(&Invocation::new("sh").args(["-c", "echo hi"]))?;
        assert_eq!(output, "hi\n");
        Ok(())
    }
}
