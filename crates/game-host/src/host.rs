//! The request/response surface of the daemon.
//!
//! `Host` wires the supervisor, command channel, tailer, metrics publisher
//! and session registry together. The socket server calls into it; nothing
//! here knows about frames.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::command::{CommandChannel, CommandOutcome};
use crate::config::HostConfig;
use crate::controller::{ControllerMode, ProcessController};
use crate::errors::Result;
use crate::metrics::{MetricsPublisher, MetricsTimer};
use crate::protocol::Outbound;
use crate::session::{ConnectionContext, SessionRegistry, TeardownReport};
use crate::supervisor::{ProcessSupervisor, StartOutcome, StopOutcome};
use crate::tailer::{LogTailer, SubscribeMode};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    pub log_path: PathBuf,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub mode: ControllerMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    pub connections: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeAck {
    pub subscribed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_lines: Option<usize>,
    pub full_history: bool,
    /// A previous subscription on this connection was replaced.
    pub replaced: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeAck {
    pub unsubscribed: bool,
}

pub struct Host {
    config: HostConfig,
    supervisor: Arc<ProcessSupervisor>,
    commands: Arc<CommandChannel>,
    tailer: LogTailer,
    metrics: Arc<MetricsPublisher>,
    sessions: SessionRegistry,
}

impl Host {
    /// Validate `config`, pick a controller and assemble the components.
    pub async fn build(config: HostConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let (controller, degraded) = ProcessController::select(
            config.controller,
            &config.session_name,
            config.timings.tool_timeout(),
        )
        .await;
        info!(
            executable = %config.executable_name(),
            mode = ?controller.mode(),
            log = %config.log_path().display(),
            "host configured"
        );

        let supervisor = Arc::new(ProcessSupervisor::new(&config, controller, degraded));
        let commands = Arc::new(CommandChannel::new(Arc::clone(&supervisor), &config));
        let tailer = LogTailer::new(
            config.log_path(),
            config.timings.poll_interval(),
            config.strip_control_sequences,
        );
        let metrics = Arc::new(MetricsPublisher::new(&config));
        metrics.start_update_checks();

        Ok(Arc::new(Self {
            config,
            supervisor,
            commands,
            tailer,
            metrics,
            sessions: SessionRegistry::new(),
        }))
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub async fn get_status(&self) -> StatusReport {
        let status = self.supervisor.status().await;
        StatusReport {
            running: status.probe.running,
            pid: status.probe.pid,
            uptime_seconds: status.probe.uptime_seconds,
            log_path: self.config.log_path(),
            state: status.state.label(),
            started_at: status.state.started_at(),
            mode: self.supervisor.mode(),
            degraded_reason: self.supervisor.degraded_reason().map(str::to_string),
            config_path: self.config.config_file.clone(),
            connections: self.sessions.live_connections(),
        }
    }

    /// Lifecycle changes run detached from the requesting connection, so a
    /// viewer that disconnects mid-stop cannot cut the escalation short.
    pub async fn start_process(&self) -> StartOutcome {
        self.supervisor.start_detached().await
    }

    pub async fn stop_process(&self) -> StopOutcome {
        self.supervisor.stop_detached().await
    }

    pub async fn send_command(&self, text: &str) -> CommandOutcome {
        self.commands.send(text).await
    }

    /// Subscribe `ctx` to the log, replacing any subscription it already
    /// has. The initial snapshot is queued before this returns.
    pub async fn subscribe_logs(
        &self,
        ctx: &mut ConnectionContext,
        initial_lines: Option<usize>,
        full_history: bool,
    ) -> Result<SubscribeAck> {
        let replaced = ctx.close_subscription();
        let mode = if full_history {
            SubscribeMode::FullHistory
        } else {
            SubscribeMode::InitialLines(initial_lines.unwrap_or(self.config.initial_lines))
        };
        let sub = self
            .tailer
            .subscribe(ctx.id(), mode, ctx.outbound().clone())
            .await
            .inspect_err(|e| warn!(subscriber = %ctx.id(), "log subscription failed: {}", e))?;
        ctx.set_subscription(sub);
        Ok(SubscribeAck {
            subscribed: true,
            initial_lines: match mode {
                SubscribeMode::InitialLines(n) => Some(n),
                SubscribeMode::FullHistory => None,
            },
            full_history,
            replaced,
        })
    }

    pub fn unsubscribe_logs(&self, ctx: &mut ConnectionContext) -> UnsubscribeAck {
        let unsubscribed = ctx.close_subscription();
        if unsubscribed {
            info!(subscriber = %ctx.id(), "log subscription closed");
        }
        UnsubscribeAck { unsubscribed }
    }

    /// Register a connection and start its metrics pushes.
    pub fn connect(&self, outbound: mpsc::Sender<Outbound>) -> ConnectionContext {
        let mut ctx = self.sessions.on_connect(outbound);
        let timer = MetricsTimer::spawn(Arc::clone(&self.metrics), ctx.outbound().clone());
        ctx.set_metrics_timer(timer);
        ctx
    }

    pub fn disconnect(&self, ctx: ConnectionContext) -> TeardownReport {
        self.sessions.on_disconnect(ctx)
    }
}
