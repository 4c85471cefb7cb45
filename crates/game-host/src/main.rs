//! game-host daemon: supervises one game server and serves its console and
//! log over a Unix socket.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{error, info};

use game_host::server::{self, Server};
use game_host::{logging, Host, HostConfig, Result};

/// Supervise a game server process and stream its log to connected viewers
#[derive(Parser, Debug)]
#[command(name = "game-host", version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "GAME_HOST_CONFIG")]
    config: PathBuf,

    /// Override the control socket path from the config file
    #[arg(short, long, env = "GAME_HOST_SOCKET")]
    socket: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset (e.g. "debug", "game_host=trace")
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    logging::init(args.log_level.as_deref());

    if let Err(e) = run(args).await {
        error!("{}", e);
        eprintln!("game-host: {}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = HostConfig::load(&args.config)?;
    if let Some(socket) = args.socket {
        config.socket_path = Some(socket);
    }
    if args.check {
        println!("configuration OK: {}", args.config.display());
        return Ok(());
    }

    let socket_path = config.socket_path();
    let host = Host::build(config).await?;
    let listener = server::bind(&socket_path)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "game-host started"
    );

    Server::new(host, listener, socket_path)
        .run(server::shutdown_signal())
        .await
}
