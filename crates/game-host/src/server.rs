//! Unix socket server: accept loop and per-connection handler.

use std::fs;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::host::Host;
use crate::protocol::{
    error_response, ok_response, parse_request, FrameDecoder, Outbound, Request, MSG_REQUEST,
};
use crate::session::ConnectionContext;

/// Per-connection outbound queue depth.
const OUTBOUND_QUEUE: usize = 256;
/// How long a closing connection gets to flush queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Bind the control socket, replacing a stale one, readable by the owner only.
pub fn bind(socket_path: &Path) -> Result<UnixListener> {
    if let Some(parent) = socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    // Clean up stale socket from previous crash
    match fs::remove_file(socket_path) {
        Ok(()) => debug!(path = %socket_path.display(), "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let std_listener = StdUnixListener::bind(socket_path)?;
    fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600))?;
    std_listener.set_nonblocking(true)?;
    Ok(UnixListener::from_std(std_listener)?)
}

pub struct Server {
    host: Arc<Host>,
    listener: UnixListener,
    socket_path: PathBuf,
}

impl Server {
    pub fn new(host: Arc<Host>, listener: UnixListener, socket_path: PathBuf) -> Self {
        Self {
            host,
            listener,
            socket_path,
        }
    }

    /// Serve until `shutdown` resolves, then remove the socket file.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(socket = %self.socket_path.display(), "listening");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let host = Arc::clone(&self.host);
                            tokio::spawn(handle_client(stream, host));
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    }
                }
                _ = &mut shutdown => {
                    info!("shutting down");
                    break;
                }
            }
        }
        if let Err(e) = fs::remove_file(&self.socket_path) {
            warn!(socket = %self.socket_path.display(), "failed to remove socket: {}", e);
        }
        Ok(())
    }
}

/// Resolves on SIGTERM or ctrl-c.
pub async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = terminate => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}

async fn handle_client(stream: UnixStream, host: Arc<Host>) {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
    let mut writer_task = tokio::spawn(write_frames(writer, rx));

    let mut ctx = host.connect(tx);
    info!(subscriber = %ctx.id(), "client connected");

    read_requests(reader, &host, &mut ctx).await;

    let subscriber = ctx.id();
    let report = host.disconnect(ctx);
    info!(
        %subscriber,
        closed_subscription = report.closed_subscription,
        cancelled_metrics = report.cancelled_metrics,
        aborted_commands = report.aborted_commands,
        "client disconnected"
    );

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }
}

async fn write_frames(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(msg) = rx.recv().await {
        let frame = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode outbound message: {}", e);
                continue;
            }
        };
        if writer.write_all(&frame).await.is_err() {
            break;
        }
    }
}

async fn read_requests(mut reader: OwnedReadHalf, host: &Arc<Host>, ctx: &mut ConnectionContext) {
    let mut decoder = FrameDecoder::default();
    let mut read_buf = vec![0u8; 65536];
    loop {
        let n = match reader.read(&mut read_buf).await {
            Ok(0) => break, // Disconnected
            Ok(n) => n,
            Err(e) => {
                debug!(subscriber = %ctx.id(), "read failed: {}", e);
                break;
            }
        };
        decoder.extend(&read_buf[..n]);

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) if frame.msg_type == MSG_REQUEST => {
                    process_request(host, ctx, &frame.payload).await;
                }
                Ok(Some(frame)) => {
                    debug!(subscriber = %ctx.id(), msg_type = frame.msg_type, "ignoring frame");
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(subscriber = %ctx.id(), "closing connection: {}", e);
                    return;
                }
            }
        }
    }
}

async fn process_request(host: &Arc<Host>, ctx: &mut ConnectionContext, payload: &[u8]) {
    let (id, request) = match parse_request(payload) {
        Ok(parsed) => parsed,
        Err((id, e)) => {
            debug!(subscriber = %ctx.id(), "bad request: {}", e);
            let _ = ctx
                .outbound()
                .send(Outbound::Response(error_response(&id, &e)))
                .await;
            return;
        }
    };
    debug!(subscriber = %ctx.id(), op = request.op(), "request");

    match request {
        Request::SubscribeLogs {
            initial_lines,
            full_history,
        } => {
            let response = match host
                .subscribe_logs(ctx, initial_lines, full_history.unwrap_or(false))
                .await
            {
                Ok(ack) => ok_response(&id, &ack),
                Err(e) => error_response(&id, &e),
            };
            let _ = ctx.outbound().send(Outbound::Response(response)).await;
        }
        Request::UnsubscribeLogs => {
            let ack = host.unsubscribe_logs(ctx);
            let _ = ctx
                .outbound()
                .send(Outbound::Response(ok_response(&id, &ack)))
                .await;
        }
        // Lifecycle work can wait on the supervisor lock or the correlation
        // window; run it off the read loop so the connection stays responsive.
        // Disconnect aborts only the wait for start/stop, which run detached.
        other => {
            let host = Arc::clone(host);
            let outbound = ctx.outbound().clone();
            ctx.spawn_command(async move {
                let response = match other {
                    Request::GetStatus => ok_response(&id, &host.get_status().await),
                    Request::StartProcess => ok_response(&id, &host.start_process().await),
                    Request::StopProcess => ok_response(&id, &host.stop_process().await),
                    Request::SendCommand { text } => {
                        ok_response(&id, &host.send_command(&text).await)
                    }
                    Request::SubscribeLogs { .. } | Request::UnsubscribeLogs => return,
                };
                let _ = outbound.send(Outbound::Response(response)).await;
            });
        }
    }
}
