//! Host configuration.
//!
//! Loaded from a JSON file with camelCase keys. Everything except
//! `executable` has a default, so a minimal config is a single line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{HostError, Result};

pub const DEFAULT_SESSION_NAME: &str = "gameserver";
pub const DEFAULT_INITIAL_LINES: usize = 100;

/// Which process controller to use. `Auto` picks screen when it is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ControllerPreference {
    #[default]
    Auto,
    Screen,
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timings {
    pub stop_grace_ms: u64,
    pub start_settle_ms: u64,
    pub correlation_retries: u32,
    pub correlation_interval_ms: u64,
    pub metrics_interval_ms: u64,
    pub update_check_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub tool_timeout_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            stop_grace_ms: 5_000,
            start_settle_ms: 1_000,
            correlation_retries: 20,
            correlation_interval_ms: 100,
            metrics_interval_ms: 5_000,
            update_check_interval_ms: 30_000,
            poll_interval_ms: 2_000,
            tool_timeout_ms: 3_000,
        }
    }
}

impl Timings {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn start_settle(&self) -> Duration {
        Duration::from_millis(self.start_settle_ms)
    }

    pub fn correlation_interval(&self) -> Duration {
        Duration::from_millis(self.correlation_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn update_check_interval(&self) -> Duration {
        Duration::from_millis(self.update_check_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }
}

fn default_blocked_commands() -> Vec<String> {
    ["rm -rf", "mkfs", "shutdown", "reboot", "poweroff", "halt", "dd if="]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// The managed server's own config file. Only reported, never parsed.
    pub config_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub session_name: String,
    pub controller: ControllerPreference,
    pub socket_path: Option<PathBuf>,
    pub initial_lines: usize,
    pub strip_control_sequences: bool,
    pub blocked_commands: Vec<String>,
    pub update_manifest_url: Option<String>,
    pub server_version: Option<String>,
    pub timings: Timings,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::new(),
            args: Vec::new(),
            working_dir: None,
            config_file: None,
            log_file: None,
            session_name: DEFAULT_SESSION_NAME.to_string(),
            controller: ControllerPreference::Auto,
            socket_path: None,
            initial_lines: DEFAULT_INITIAL_LINES,
            strip_control_sequences: true,
            blocked_commands: default_blocked_commands(),
            update_manifest_url: None,
            server_version: None,
            timings: Timings::default(),
        }
    }
}

impl HostConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| HostError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: HostConfig =
            serde_json::from_str(&raw).map_err(|source| HostError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.executable.as_os_str().is_empty() {
            return Err(HostError::Config("executable must be set".into()));
        }
        if self.session_name.trim().is_empty() {
            return Err(HostError::Config("sessionName must not be blank".into()));
        }
        if self.session_name.contains(char::is_whitespace) || self.session_name.contains('.') {
            return Err(HostError::Config(format!(
                "sessionName '{}' must not contain whitespace or '.'",
                self.session_name
            )));
        }
        let t = &self.timings;
        let intervals = [
            ("correlationIntervalMs", t.correlation_interval_ms),
            ("metricsIntervalMs", t.metrics_interval_ms),
            ("updateCheckIntervalMs", t.update_check_interval_ms),
            ("pollIntervalMs", t.poll_interval_ms),
            ("toolTimeoutMs", t.tool_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(HostError::Config(format!("timings.{} must be > 0", name)));
            }
        }
        Ok(())
    }

    /// Directory the server runs in: explicit, else the executable's parent.
    pub fn working_dir(&self) -> PathBuf {
        if let Some(dir) = &self.working_dir {
            return dir.clone();
        }
        self.executable
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn log_path(&self) -> PathBuf {
        match &self.log_file {
            Some(path) => path.clone(),
            None => self.working_dir().join("logs").join("latest.log"),
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        match &self.socket_path {
            Some(path) => path.clone(),
            None => {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/".to_string());
                PathBuf::from(home).join(".game-host").join("host.sock")
            }
        }
    }

    /// File name used to recognise the server in the process table.
    pub fn executable_name(&self) -> String {
        self.executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
