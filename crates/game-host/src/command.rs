//! Console command delivery and output correlation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::errors::{HostError, Result};
use crate::supervisor::{DeliveryTarget, ProcessSupervisor};
use crate::tailer::split_lines;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured_output: Option<Vec<String>>,
}

/// A delivered command waiting for its output.
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub text: String,
    pub submitted_at: DateTime<Utc>,
    pub before_offset: u64,
}

pub struct CommandChannel {
    supervisor: Arc<ProcessSupervisor>,
    log_path: PathBuf,
    retries: u32,
    interval: Duration,
    write_timeout: Duration,
    /// Lowercased blocked substrings.
    blocked: Vec<String>,
    strip: bool,
}

impl CommandChannel {
    pub fn new(supervisor: Arc<ProcessSupervisor>, config: &HostConfig) -> Self {
        Self {
            supervisor,
            log_path: config.log_path(),
            retries: config.timings.correlation_retries,
            interval: config.timings.correlation_interval(),
            write_timeout: config.timings.tool_timeout(),
            blocked: config
                .blocked_commands
                .iter()
                .map(|b| b.trim().to_lowercase())
                .filter(|b| !b.is_empty())
                .collect(),
            strip: config.strip_control_sequences,
        }
    }

    /// Deliver `text` to the server console and collect the log lines that
    /// appear shortly after.
    pub async fn send(&self, text: &str) -> CommandOutcome {
        match self.deliver_and_capture(text).await {
            Ok(lines) => CommandOutcome {
                success: true,
                message: if lines.is_empty() {
                    "Command sent (no output captured)".to_string()
                } else {
                    format!("Command sent ({} lines captured)", lines.len())
                },
                captured_output: Some(lines),
            },
            Err(e) => {
                match &e {
                    HostError::NotRunning | HostError::CommandRejected(_) => {
                        debug!(command = text, "command refused: {}", e)
                    }
                    _ => warn!(command = text, "command delivery failed: {}", e),
                }
                CommandOutcome {
                    success: false,
                    message: e.to_string(),
                    captured_output: None,
                }
            }
        }
    }

    /// Reject blank commands and anything on the blocklist.
    ///
    /// Substring matching is easy to sidestep; it stops accidents, not a
    /// determined operator.
    pub fn check(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(HostError::CommandRejected("command is empty".into()));
        }
        if text.contains('\n') || text.contains('\r') {
            return Err(HostError::CommandRejected(
                "command must be a single line".into(),
            ));
        }
        let lowered = text.to_lowercase();
        if let Some(pattern) = self.blocked.iter().find(|p| lowered.contains(p.as_str())) {
            return Err(HostError::CommandRejected(format!(
                "matches blocked pattern '{}'",
                pattern
            )));
        }
        Ok(())
    }

    async fn deliver_and_capture(&self, text: &str) -> Result<Vec<String>> {
        self.check(text)?;
        let target = self.supervisor.delivery_target().await?;

        let record = CommandRecord {
            text: text.to_string(),
            submitted_at: Utc::now(),
            before_offset: file_len(&self.log_path),
        };

        match &target {
            DeliveryTarget::Session { session, .. } => session.stuff(text).await?,
            DeliveryTarget::Stdin { pid } => {
                write_proc_stdin(*pid, text, self.write_timeout).await?
            }
        }
        info!(command = text, target = ?target, "command delivered");

        Ok(self.correlate(&record).await)
    }

    /// Poll the log for growth after `record` and return the complete lines
    /// appended since. Anything else the server logged in the window is
    /// captured too.
    async fn correlate(&self, record: &CommandRecord) -> Vec<String> {
        for _ in 0..self.retries {
            tokio::time::sleep(self.interval).await;
            let path = self.log_path.clone();
            let offset = record.before_offset;
            let strip = self.strip;
            match tokio::task::spawn_blocking(move || read_complete_lines(&path, offset, strip))
                .await
            {
                Ok(Ok(lines)) if !lines.is_empty() => {
                    debug!(
                        command = %record.text,
                        elapsed_ms = (Utc::now() - record.submitted_at).num_milliseconds(),
                        lines = lines.len(),
                        "captured command output"
                    );
                    return lines;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("failed to read log for command output: {}", e),
                Err(e) => warn!("command output read task failed: {}", e),
            }
        }
        Vec::new()
    }
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Complete lines written after `offset`. A file that shrank below
/// `offset` is read from the start.
fn read_complete_lines(path: &Path, offset: u64, strip: bool) -> io::Result<Vec<String>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let size = file.metadata()?.len();
    let start = if size < offset { 0 } else { offset };
    if size == start {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::Start(start))?;
    let mut data = Vec::new();
    file.take(size - start).read_to_end(&mut data)?;

    let Some(end) = memchr::memrchr(b'\n', &data) else {
        return Ok(Vec::new());
    };
    Ok(split_lines(&data[..=end], strip))
}

/// Write `text` plus newline to the server's stdin through procfs.
async fn write_proc_stdin(pid: u32, text: &str, timeout: Duration) -> Result<()> {
    let path = PathBuf::from(format!("/proc/{}/fd/0", pid));
    let line = format!("{}\n", text);
    let write = tokio::task::spawn_blocking(move || -> io::Result<()> {
        let mut stdin = OpenOptions::new().write(true).open(&path)?;
        stdin.write_all(line.as_bytes())?;
        stdin.flush()
    });
    match tokio::time::timeout(timeout, write).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(HostError::DeliveryFailure(format!(
            "write to /proc/{}/fd/0 failed: {}",
            pid, e
        ))),
        Ok(Err(e)) => Err(HostError::DeliveryFailure(e.to_string())),
        Err(_) => Err(HostError::DeliveryFailure(format!(
            "write to /proc/{}/fd/0 timed out",
            pid
        ))),
    }
}
