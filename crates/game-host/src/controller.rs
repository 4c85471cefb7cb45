//! Process controllers: how the server gets launched and signalled.
//!
//! `Screen` wraps the server in a detached screen session whose window log
//! is the log file; console input goes through `screen -X stuff`.
//! `Direct` spawns the server in its own process group with stdout/stderr
//! appended to the log file and keeps its stdin pipe open so the /proc
//! fallback in the command channel has something to write to.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, Pid};
use serde::Serialize;
use tokio::process::{ChildStdin, Command};
use tracing::{info, warn};

use crate::config::ControllerPreference;
use crate::errors::{HostError, Result};
use crate::multiplexer::ScreenSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ControllerMode {
    Screen,
    Direct,
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub log_path: PathBuf,
}

/// Result of a launch. The probe, not this struct, decides whether the
/// server is actually up.
#[derive(Debug, Default)]
pub struct Launched {
    pub pid: Option<u32>,
    pub stdin: Option<ChildStdin>,
    pub warning: Option<String>,
}

#[derive(Debug)]
pub enum ProcessController {
    Screen(ScreenSession),
    Direct,
}

impl ProcessController {
    /// Pick a controller from the configured preference and what is
    /// installed. The second value is the reason for running degraded.
    pub async fn select(
        preference: ControllerPreference,
        session_name: &str,
        tool_timeout: Duration,
    ) -> (Self, Option<String>) {
        if preference == ControllerPreference::Direct {
            return (ProcessController::Direct, None);
        }
        match ScreenSession::check_available(tool_timeout).await {
            Ok(()) => (
                ProcessController::Screen(ScreenSession::new(session_name, tool_timeout)),
                None,
            ),
            Err(e) => {
                warn!(
                    "screen is unavailable ({}); running in direct-spawn mode, \
                     console input falls back to /proc stdin writes",
                    e
                );
                let reason = match e {
                    HostError::ExternalToolMissing(tool) => {
                        format!("'{}' is not installed", tool)
                    }
                    other => other.to_string(),
                };
                (ProcessController::Direct, Some(reason))
            }
        }
    }

    pub fn mode(&self) -> ControllerMode {
        match self {
            ProcessController::Screen(_) => ControllerMode::Screen,
            ProcessController::Direct => ControllerMode::Direct,
        }
    }

    pub fn session(&self) -> Option<&ScreenSession> {
        match self {
            ProcessController::Screen(session) => Some(session),
            ProcessController::Direct => None,
        }
    }

    pub async fn launch(&self, spec: &LaunchSpec) -> Result<Launched> {
        ensure_parent_dir(&spec.log_path)?;
        match self {
            ProcessController::Screen(session) => {
                session
                    .create(&spec.executable, &spec.args, &spec.working_dir)
                    .await?;
                let warning = match session.bind_log(&spec.log_path).await {
                    Ok(()) => None,
                    Err(e) => {
                        warn!(session = session.name(), "failed to bind session log: {}", e);
                        Some(format!("session log could not be enabled: {}", e))
                    }
                };
                Ok(Launched {
                    pid: None,
                    stdin: None,
                    warning,
                })
            }
            ProcessController::Direct => spawn_direct(spec),
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn spawn_direct(spec: &LaunchSpec) -> Result<Launched> {
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_path)?;
    let log_err = log.try_clone()?;

    let mut cmd = Command::new(&spec.executable);
    cmd.args(&spec.args)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .process_group(0);

    let mut child = cmd.spawn().map_err(|source| HostError::Spawn {
        program: spec.executable.display().to_string(),
        source,
    })?;
    let pid = child.id();
    let stdin = child.stdin.take();
    info!(?pid, executable = %spec.executable.display(), "server spawned directly");

    // Reap the child so it does not linger as a zombie after it exits.
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => info!(?pid, %status, "server process exited"),
            Err(e) => warn!(?pid, "failed to wait for server process: {}", e),
        }
    });

    Ok(Launched {
        pid,
        stdin,
        warning: None,
    })
}

/// Send `signal` to `pid`, or to its whole group when it leads one.
///
/// A process that no longer exists is not an error.
pub fn signal_process(pid: u32, signal: Signal) -> Result<()> {
    let nix_pid = Pid::from_raw(pid as i32);
    let leads_group = matches!(getpgid(Some(nix_pid)), Ok(pgid) if pgid == nix_pid);
    let result = if leads_group {
        killpg(nix_pid, signal)
    } else {
        kill(nix_pid, signal)
    };
    match result {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(errno) => Err(HostError::Io(std::io::Error::from(errno))),
    }
}
