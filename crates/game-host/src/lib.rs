//! Supervision and log streaming for a single game server process.

pub mod command;
pub mod config;
pub mod controller;
pub mod errors;
pub mod host;
pub mod logging;
pub mod metrics;
pub mod multiplexer;
pub mod probe;
pub mod protocol;
pub mod sanitize;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod tailer;
pub mod tools;

pub use config::HostConfig;
pub use errors::{HostError, Result};
pub use host::Host;
