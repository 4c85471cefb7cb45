//! External command execution with a hard upper bound on runtime.

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::trace;

use crate::errors::{HostError, Result};

#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// How a tool's stdout/stderr are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    Output,
    /// Discard output. Needed for tools that daemonize: a detached child
    /// would otherwise hold our pipe open until the timeout fires.
    Discard,
}

/// Run `program` with `args`, killing it if it outlives `timeout`.
///
/// A missing binary maps to `ExternalToolMissing`; a timeout maps to an
/// `Io` error of kind `TimedOut`. Non-zero exit codes are returned to the
/// caller, since some tools (`screen -ls`) exit non-zero on success.
pub async fn run_tool<I, S>(
    program: &str,
    args: I,
    cwd: Option<&Path>,
    capture: Capture,
    timeout: Duration,
) -> Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    match capture {
        Capture::Output => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        Capture::Discard => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    trace!(program, "running external tool");

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
            return Err(HostError::ExternalToolMissing(program.to_string()));
        }
        Ok(Err(e)) => return Err(HostError::Io(e)),
        Err(_) => {
            return Err(HostError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("'{}' did not finish within {:?}", program, timeout),
            )));
        }
    };

    Ok(ToolOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
