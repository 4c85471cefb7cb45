//! Liveness probing for the managed server.
//!
//! The probe observes and never mutates. Every OS-level failure degrades to
//! "not running" with a warning, so callers always get a report.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tracing::{trace, warn};

use crate::errors::HostError;
use crate::multiplexer::ScreenSession;

/// Linux truncates process names (`comm`) to 15 bytes.
const COMM_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProbeSource {
    Session,
    ProcessTable,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    pub source: ProbeSource,
}

impl ProbeReport {
    pub fn not_running() -> Self {
        Self {
            running: false,
            pid: None,
            uptime_seconds: None,
            source: ProbeSource::None,
        }
    }
}

pub struct ProcessHandle {
    session: Option<ScreenSession>,
    executable: PathBuf,
    executable_name: String,
}

impl ProcessHandle {
    pub fn new(session: Option<ScreenSession>, executable: PathBuf) -> Self {
        let executable_name = executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            session,
            executable,
            executable_name,
        }
    }

    pub async fn probe(&self) -> ProbeReport {
        if let Some(session) = &self.session {
            match session.find_pid().await {
                Ok(Some(pid)) => {
                    return ProbeReport {
                        running: true,
                        pid: Some(pid),
                        uptime_seconds: process_uptime(pid).await,
                        source: ProbeSource::Session,
                    };
                }
                Ok(None) => trace!(session = session.name(), "no screen session"),
                Err(e) => warn!(
                    session = session.name(),
                    "screen session probe failed, scanning process table: {}", e
                ),
            }
        }

        let executable = self.executable.clone();
        let name = self.executable_name.clone();
        match tokio::task::spawn_blocking(move || scan_process_table(&executable, &name)).await {
            Ok(Some((pid, uptime))) => ProbeReport {
                running: true,
                pid: Some(pid),
                uptime_seconds: Some(uptime),
                source: ProbeSource::ProcessTable,
            },
            Ok(None) => ProbeReport::not_running(),
            Err(e) => {
                let err = HostError::ProbeFailure(e.to_string());
                warn!("{}, treating server as not running", err);
                ProbeReport::not_running()
            }
        }
    }
}

/// Seconds the process has been running, if it still exists.
pub async fn process_uptime(pid: u32) -> Option<u64> {
    let result = tokio::task::spawn_blocking(move || {
        let mut sys = System::new();
        let sys_pid = Pid::from_u32(pid);
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::nothing(),
        );
        sys.process(sys_pid).map(|p| p.run_time())
    })
    .await;
    match result {
        Ok(uptime) => uptime,
        Err(e) => {
            warn!(pid, "uptime query failed: {}", e);
            None
        }
    }
}

/// Oldest live process that looks like the managed executable.
fn scan_process_table(executable: &Path, name: &str) -> Option<(u32, u64)> {
    if name.is_empty() {
        return None;
    }
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    let own_pid = std::process::id();
    sys.processes()
        .values()
        .filter(|p| p.pid().as_u32() != own_pid)
        .filter(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        .filter(|p| matches_executable(p.name(), p.cmd(), executable, name))
        .max_by_key(|p| p.run_time())
        .map(|p| (p.pid().as_u32(), p.run_time()))
}

/// Whether a process-table entry is the managed executable.
///
/// Matches on the (possibly truncated) process name, or on the first two
/// argv entries, which covers interpreters running a script
/// (`/bin/sh /srv/start.sh`). Later argv entries are ignored so that a
/// launcher mentioning the path (`screen -dmS name /srv/start.sh`) does not
/// count.
pub fn matches_executable(
    process_name: &OsStr,
    cmd: &[OsString],
    executable: &Path,
    executable_name: &str,
) -> bool {
    let process_name = process_name.to_string_lossy();
    let truncated: String = executable_name.chars().take(COMM_LEN).collect();
    if process_name == executable_name
        || (executable_name.len() > COMM_LEN && process_name == truncated)
    {
        return true;
    }
    cmd.iter().take(2).any(|arg| {
        let arg = Path::new(arg);
        arg == executable || arg.file_name() == Some(OsStr::new(executable_name))
    })
}
