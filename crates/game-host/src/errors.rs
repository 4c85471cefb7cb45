use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Server is not running")]
    NotRunning,

    #[error("Server is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("Process probe failed: {0}")]
    ProbeFailure(String),

    #[error("Command could not be delivered: {0}")]
    DeliveryFailure(String),

    #[error("Log watch setup failed: {0}")]
    WatchSetupFailure(String),

    #[error("External tool '{0}' is not available")]
    ExternalToolMissing(String),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command rejected: {0}")]
    CommandRejected(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HostError>;
