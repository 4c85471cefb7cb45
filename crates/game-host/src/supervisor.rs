//! Lifecycle state machine for the managed server.
//!
//! Every probe-then-act sequence runs under one async mutex, so concurrent
//! `start()` calls queue up and the second one sees the first one's process
//! instead of launching a duplicate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use nix::sys::signal::Signal;
use serde::Serialize;
use tokio::process::ChildStdin;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{HostConfig, Timings};
use crate::controller::{signal_process, ControllerMode, LaunchSpec, ProcessController};
use crate::errors::HostError;
use crate::multiplexer::ScreenSession;
use crate::probe::{ProbeReport, ProbeSource, ProcessHandle};

/// How often stop() re-probes while waiting out the grace window.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Pause after SIGKILL before the confirming probe.
const KILL_SETTLE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ProcessState {
    Stopped,
    Starting {
        started_at: DateTime<Utc>,
    },
    Running {
        pid: u32,
        started_at: DateTime<Utc>,
    },
    Stopping {
        pid: u32,
        deadline_at: DateTime<Utc>,
    },
}

impl ProcessState {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting { .. } => "starting",
            ProcessState::Running { .. } => "running",
            ProcessState::Stopping { .. } => "stopping",
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            ProcessState::Starting { started_at } | ProcessState::Running { started_at, .. } => {
                Some(*started_at)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub success: bool,
    pub message: String,
    /// SIGKILL was needed.
    pub escalated: bool,
}

#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    pub state: ProcessState,
    pub probe: ProbeReport,
}

/// Where console input for the running server should go.
#[derive(Debug, Clone)]
pub enum DeliveryTarget {
    Session { session: ScreenSession, pid: u32 },
    Stdin { pid: u32 },
}

struct SupervisorInner {
    state: ProcessState,
    /// Write end of a directly spawned server's stdin. Held so the server
    /// does not see EOF and so /proc/<pid>/fd/0 stays writable.
    stdin_pipe: Option<ChildStdin>,
}

impl SupervisorInner {
    /// Bring the recorded state in line with what the OS reports.
    fn reconcile(&mut self, report: &ProbeReport) {
        match (&self.state, report.running, report.pid) {
            (ProcessState::Running { pid, .. }, false, _) => {
                warn!(pid, "server is no longer running");
                self.state = ProcessState::Stopped;
                self.stdin_pipe = None;
            }
            (ProcessState::Stopped, true, Some(pid)) => {
                info!(pid, "adopting already-running server");
                self.state = ProcessState::Running {
                    pid,
                    started_at: started_from_uptime(report.uptime_seconds),
                };
            }
            // Leftovers from a start or stop that did not run to completion.
            (ProcessState::Starting { .. } | ProcessState::Stopping { .. }, false, _) => {
                warn!(state = self.state.label(), "server is not running, resetting state");
                self.state = ProcessState::Stopped;
                self.stdin_pipe = None;
            }
            (ProcessState::Starting { started_at }, true, Some(pid)) => {
                self.state = ProcessState::Running {
                    pid,
                    started_at: *started_at,
                };
            }
            (ProcessState::Stopping { .. }, true, Some(pid)) => {
                warn!(pid, "server outlived an interrupted stop");
                self.state = ProcessState::Running {
                    pid,
                    started_at: started_from_uptime(report.uptime_seconds),
                };
            }
            (ProcessState::Running { pid: old, started_at }, true, Some(pid)) if *old != pid => {
                debug!(old, pid, "server pid changed");
                self.state = ProcessState::Running {
                    pid,
                    started_at: *started_at,
                };
            }
            _ => {}
        }
    }
}

fn started_from_uptime(uptime_seconds: Option<u64>) -> DateTime<Utc> {
    let uptime = uptime_seconds.unwrap_or(0);
    Utc::now() - TimeDelta::try_seconds(uptime as i64).unwrap_or(TimeDelta::zero())
}

pub struct ProcessSupervisor {
    inner: Mutex<SupervisorInner>,
    handle: ProcessHandle,
    controller: ProcessController,
    launch: LaunchSpec,
    timings: Timings,
    degraded_reason: Option<String>,
    signals_sent: AtomicUsize,
}

impl ProcessSupervisor {
    pub fn new(
        config: &HostConfig,
        controller: ProcessController,
        degraded_reason: Option<String>,
    ) -> Self {
        let handle = ProcessHandle::new(controller.session().cloned(), config.executable.clone());
        Self {
            inner: Mutex::new(SupervisorInner {
                state: ProcessState::Stopped,
                stdin_pipe: None,
            }),
            handle,
            controller,
            launch: LaunchSpec {
                executable: config.executable.clone(),
                args: config.args.clone(),
                working_dir: config.working_dir(),
                log_path: config.log_path(),
            },
            timings: config.timings.clone(),
            degraded_reason,
            signals_sent: AtomicUsize::new(0),
        }
    }

    pub fn mode(&self) -> ControllerMode {
        self.controller.mode()
    }

    /// Why the host is running without a screen session, if it is.
    pub fn degraded_reason(&self) -> Option<&str> {
        self.degraded_reason.as_deref()
    }

    /// Number of termination signals sent over the supervisor's lifetime.
    pub fn signals_sent(&self) -> usize {
        self.signals_sent.load(Ordering::Relaxed)
    }

    pub async fn status(&self) -> SupervisorStatus {
        let mut inner = self.inner.lock().await;
        let probe = self.handle.probe().await;
        inner.reconcile(&probe);
        SupervisorStatus {
            state: inner.state.clone(),
            probe,
        }
    }

    pub async fn state(&self) -> ProcessState {
        self.inner.lock().await.state.clone()
    }

    pub async fn start(&self) -> StartOutcome {
        let mut inner = self.inner.lock().await;
        let report = self.handle.probe().await;
        inner.reconcile(&report);
        if report.running {
            let pid = report.pid.unwrap_or_default();
            return StartOutcome {
                success: false,
                message: HostError::AlreadyRunning { pid }.to_string(),
                pid: report.pid,
            };
        }

        let started_at = Utc::now();
        inner.state = ProcessState::Starting { started_at };
        info!(
            mode = ?self.controller.mode(),
            executable = %self.launch.executable.display(),
            "starting server"
        );

        let launched = match self.controller.launch(&self.launch).await {
            Ok(launched) => launched,
            Err(e) => {
                warn!("server launch failed: {}", e);
                inner.state = ProcessState::Stopped;
                return StartOutcome {
                    success: false,
                    message: format!("Failed to start server: {}", e),
                    pid: None,
                };
            }
        };
        inner.stdin_pipe = launched.stdin;

        tokio::time::sleep(self.timings.start_settle()).await;

        let report = self.handle.probe().await;
        match report.pid.filter(|_| report.running) {
            Some(pid) => {
                inner.state = ProcessState::Running { pid, started_at };
                info!(pid, "server started");
                let mut message = String::from("Server started");
                if let Some(reason) = &self.degraded_reason {
                    message.push_str(&format!(
                        " without a screen session ({}); console commands use the /proc stdin fallback",
                        reason
                    ));
                }
                if let Some(warning) = launched.warning {
                    message.push_str(&format!("; warning: {}", warning));
                }
                StartOutcome {
                    success: true,
                    message,
                    pid: Some(pid),
                }
            }
            None => {
                warn!(spawned_pid = ?launched.pid, "server exited during startup");
                inner.state = ProcessState::Stopped;
                inner.stdin_pipe = None;
                StartOutcome {
                    success: false,
                    message: format!(
                        "Server exited during startup; check {}",
                        self.launch.log_path.display()
                    ),
                    pid: None,
                }
            }
        }
    }

    pub async fn stop(&self) -> StopOutcome {
        let mut inner = self.inner.lock().await;
        let report = self.handle.probe().await;
        inner.reconcile(&report);
        let Some(pid) = report.pid.filter(|_| report.running) else {
            return StopOutcome {
                success: false,
                message: HostError::NotRunning.to_string(),
                escalated: false,
            };
        };

        let grace = self.timings.stop_grace();
        let started_at = match &inner.state {
            ProcessState::Running { started_at, .. } => *started_at,
            _ => Utc::now(),
        };
        inner.state = ProcessState::Stopping {
            pid,
            deadline_at: Utc::now() + TimeDelta::from_std(grace).unwrap_or(TimeDelta::zero()),
        };
        info!(pid, ?grace, "stopping server");
        self.send_signal(pid, Signal::SIGTERM);

        let deadline = Instant::now() + grace;
        let mut current = report;
        while current.running {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL.min(deadline - now)).await;
            current = self.handle.probe().await;
        }

        let escalated = current.running;
        if escalated {
            let target = current.pid.unwrap_or(pid);
            warn!(pid = target, "server ignored SIGTERM, sending SIGKILL");
            self.send_signal(target, Signal::SIGKILL);
            tokio::time::sleep(KILL_SETTLE).await;
        }

        let last = self.handle.probe().await;
        inner.stdin_pipe = None;
        match last.pid.filter(|_| last.running) {
            Some(survivor) => {
                warn!(pid = survivor, "server survived forced termination");
                inner.state = ProcessState::Running {
                    pid: survivor,
                    started_at,
                };
                StopOutcome {
                    success: false,
                    message: format!("Server (pid {}) survived forced termination", survivor),
                    escalated,
                }
            }
            None => {
                inner.state = ProcessState::Stopped;
                info!(pid, escalated, "server stopped");
                let message = if escalated {
                    format!(
                        "Server did not exit within {}s and was forcibly killed",
                        grace.as_secs_f32()
                    )
                } else {
                    "Server stopped".to_string()
                };
                StopOutcome {
                    success: true,
                    message,
                    escalated,
                }
            }
        }
    }

    /// Run `start` on a task of its own. Dropping the returned future does
    /// not cancel the launch.
    pub async fn start_detached(self: &Arc<Self>) -> StartOutcome {
        let supervisor = Arc::clone(self);
        match tokio::spawn(async move { supervisor.start().await }).await {
            Ok(outcome) => outcome,
            Err(e) => StartOutcome {
                success: false,
                message: format!("start task failed: {}", e),
                pid: None,
            },
        }
    }

    /// Run `stop` on a task of its own, so SIGKILL escalation still happens
    /// when the requesting connection goes away.
    pub async fn stop_detached(self: &Arc<Self>) -> StopOutcome {
        let supervisor = Arc::clone(self);
        match tokio::spawn(async move { supervisor.stop().await }).await {
            Ok(outcome) => outcome,
            Err(e) => StopOutcome {
                success: false,
                message: format!("stop task failed: {}", e),
                escalated: false,
            },
        }
    }

    /// Where to write console input, or `NotRunning`.
    pub async fn delivery_target(&self) -> Result<DeliveryTarget, HostError> {
        let mut inner = self.inner.lock().await;
        let report = self.handle.probe().await;
        inner.reconcile(&report);
        let pid = report
            .pid
            .filter(|_| report.running)
            .ok_or(HostError::NotRunning)?;
        match (report.source, self.controller.session()) {
            (ProbeSource::Session, Some(session)) => Ok(DeliveryTarget::Session {
                session: session.clone(),
                pid,
            }),
            _ => Ok(DeliveryTarget::Stdin { pid }),
        }
    }

    fn send_signal(&self, pid: u32, signal: Signal) {
        self.signals_sent.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = signal_process(pid, signal) {
            warn!(pid, ?signal, "failed to signal server: {}", e);
        }
    }
}
