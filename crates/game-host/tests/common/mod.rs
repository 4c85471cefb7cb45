//! Reusable test harness for game-host integration tests.
//!
//! Provides helpers for spawning the daemon against a shell-script fake
//! server, connecting over its Unix socket, and exchanging the
//! length-prefixed binary protocol frames.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

// ── Message types (must match the daemon) ───────────────────────────

pub const MSG_REQUEST: u8 = 0x20;
pub const MSG_RESPONSE: u8 = 0x21;
pub const MSG_LOG_INITIAL: u8 = 0x22;
pub const MSG_LOG_INITIAL_GZ: u8 = 0x23;
pub const MSG_LOG_UPDATE: u8 = 0x24;
pub const MSG_METRICS: u8 = 0x25;

/// Fake server: announces itself, then echoes console input back as log
/// output until it reads `stop`.
pub const ECHO_SERVER: &str = r#"echo "[INFO] Server starting"
while read line; do
  if [ "$line" = "stop" ]; then
    echo "[INFO] Stopping server"
    exit 0
  fi
  echo "[INFO] > $line"
done
exit 0"#;

// ── Frame encoding/decoding ─────────────────────────────────────────

pub fn encode_frame(msg_type: u8, data: &[u8]) -> Vec<u8> {
    let len = (data.len() + 1) as u32;
    let mut frame = Vec::with_capacity(5 + data.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.push(msg_type);
    frame.extend_from_slice(data);
    frame
}

/// Decoded frame: (message_type, payload_after_type_byte)
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: u8,
    pub data: Vec<u8>,
}

impl Frame {
    /// Payload as JSON, inflating LOG_INITIAL_GZ.
    pub fn json(&self) -> Value {
        let raw = if self.msg_type == MSG_LOG_INITIAL_GZ {
            use flate2::read::GzDecoder;
            let mut out = Vec::new();
            GzDecoder::new(&self.data[..])
                .read_to_end(&mut out)
                .expect("bad gzip payload");
            out
        } else {
            self.data.clone()
        };
        serde_json::from_slice(&raw).expect("frame payload is not JSON")
    }

    pub fn is_log(&self) -> bool {
        matches!(
            self.msg_type,
            MSG_LOG_INITIAL | MSG_LOG_INITIAL_GZ | MSG_LOG_UPDATE
        )
    }

    /// `lines` of a log push.
    pub fn lines(&self) -> Vec<String> {
        self.json()["lines"]
            .as_array()
            .expect("log push without lines")
            .iter()
            .map(|l| l.as_str().unwrap_or_default().to_string())
            .collect()
    }
}

// ── GameHostHandle ──────────────────────────────────────────────────

/// Options for a daemon under test.
pub struct HostOptions<'a> {
    pub server_script: &'a str,
    pub controller: &'a str,
    pub initial_lines: usize,
    pub extra: Value,
}

impl Default for HostOptions<'_> {
    fn default() -> Self {
        Self {
            server_script: ECHO_SERVER,
            controller: "direct",
            initial_lines: 100,
            extra: json!({}),
        }
    }
}

/// Handle to a running game-host process. Cleans up on drop.
pub struct GameHostHandle {
    pub child: Child,
    pub socket_path: PathBuf,
    pub log_path: PathBuf,
    pub server_path: PathBuf,
    pub session_name: String,
    pub dir: tempfile::TempDir,
}

impl GameHostHandle {
    /// Append raw text to the server log, as the server itself would.
    pub fn append_log(&self, text: &str) {
        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }
}

impl Drop for GameHostHandle {
    fn drop(&mut self) {
        // Best-effort stop of a server left running by a failed test
        if let Ok(mut client) = connect(&self.socket_path) {
            let _ = client.request(json!({"op": "stopProcess"}));
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
        if self.session_name.starts_with("gh-test") {
            let _ = Command::new("screen")
                .args(["-S", &self.session_name, "-X", "quit"])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
        let _ = fs::remove_file(&self.socket_path);
    }
}

// ── SocketClient ────────────────────────────────────────────────────

/// Client wrapper for a connected Unix socket with frame-level read/write.
pub struct SocketClient {
    stream: UnixStream,
    read_buf: Vec<u8>,
    backlog: VecDeque<Frame>,
    next_id: u64,
}

impl SocketClient {
    pub fn new(stream: UnixStream) -> Self {
        stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
        Self {
            stream,
            read_buf: Vec::new(),
            backlog: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Send a typed frame: [4B len][msg_type][data]
    pub fn send_frame(&mut self, msg_type: u8, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(&encode_frame(msg_type, data))
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    /// Send a request with a fresh id and wait for the matching response.
    /// Frames that arrive in between stay queued for `recv_frame`.
    pub fn request(&mut self, mut body: Value) -> io::Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        body["id"] = json!(id);
        self.send_frame(MSG_REQUEST, body.to_string().as_bytes())?;
        self.wait_response(id, Duration::from_secs(15))
    }

    pub fn wait_response(&mut self, id: u64, timeout: Duration) -> io::Result<Value> {
        let deadline = Instant::now() + timeout;
        let mut skipped = Vec::new();
        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(io::Error::new(io::ErrorKind::TimedOut, "no response"));
            }
            match self.read_frame(remaining) {
                Some(frame) if frame.msg_type == MSG_RESPONSE => {
                    let value = frame.json();
                    if value["id"] == json!(id) {
                        break Ok(value);
                    }
                    skipped.push(frame);
                }
                Some(frame) => skipped.push(frame),
                None => break Err(io::Error::new(io::ErrorKind::UnexpectedEof, "disconnected")),
            }
        };
        for frame in skipped.into_iter().rev() {
            self.backlog.push_front(frame);
        }
        result
    }

    /// Read the next frame. Returns None on timeout or disconnect.
    pub fn recv_frame(&mut self) -> Option<Frame> {
        if let Some(frame) = self.backlog.pop_front() {
            return Some(frame);
        }
        self.read_frame(Duration::from_secs(5))
    }

    fn read_frame(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;

        loop {
            // Try to parse a frame from the buffer
            if self.read_buf.len() >= 4 {
                let msg_len = u32::from_be_bytes([
                    self.read_buf[0],
                    self.read_buf[1],
                    self.read_buf[2],
                    self.read_buf[3],
                ]) as usize;
                if self.read_buf.len() >= 4 + msg_len && msg_len > 0 {
                    let payload: Vec<u8> = self.read_buf[4..4 + msg_len].to_vec();
                    self.read_buf.drain(..4 + msg_len);
                    return Some(Frame {
                        msg_type: payload[0],
                        data: payload[1..].to_vec(),
                    });
                }
            }

            if Instant::now() > deadline {
                return None;
            }

            // Read more data
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.stream
                .set_read_timeout(Some(remaining.max(Duration::from_millis(50))))
                .ok();

            let mut buf = [0u8; 65536];
            match self.stream.read(&mut buf) {
                Ok(0) => return None, // disconnected
                Ok(n) => self.read_buf.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(_) => return None,
            }
        }
    }

    /// Wait for a specific message type, discarding others.
    pub fn wait_for_message(&mut self, target_type: u8, timeout: Duration) -> Option<Frame> {
        self.wait_for(timeout, |f| f.msg_type == target_type)
    }

    /// Wait for the next log push of either kind, discarding other frames.
    pub fn wait_for_log(&mut self, timeout: Duration) -> Option<Frame> {
        self.wait_for(timeout, Frame::is_log)
    }

    fn wait_for(&mut self, timeout: Duration, pred: impl Fn(&Frame) -> bool) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        while let Some(frame) = self.backlog.pop_front() {
            if pred(&frame) {
                return Some(frame);
            }
        }
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match self.read_frame(remaining) {
                Some(frame) if pred(&frame) => return Some(frame),
                Some(_) => continue, // discard other messages
                None => return None,
            }
        }
    }

    /// True once the daemon has closed the connection.
    pub fn is_closed(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.stream
                .set_read_timeout(Some(remaining.max(Duration::from_millis(50))))
                .ok();
            let mut buf = [0u8; 65536];
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(_) => return true,
            }
        }
    }
}

// ── Spawn helpers ───────────────────────────────────────────────────

pub fn screen_available() -> bool {
    Command::new("screen")
        .arg("-v")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

/// Write the fake server and a config, then start the daemon.
/// Returns once the socket accepts connections.
pub fn spawn_game_host(options: HostOptions<'_>) -> io::Result<GameHostHandle> {
    let dir = tempfile::tempdir()?;
    let tag = format!("{:08x}", rand_u32());

    // Unique file name: the process-table probe matches on it.
    let server_path = dir.path().join(format!("srv-{}.sh", tag));
    fs::write(
        &server_path,
        format!("#!/bin/sh\n{}\n", options.server_script),
    )?;
    fs::set_permissions(&server_path, fs::Permissions::from_mode(0o755))?;

    let socket_path = dir.path().join("run").join("host.sock");
    let log_path = dir.path().join("logs").join("latest.log");
    let session_name = format!("gh-test-{}", tag);

    let mut config = json!({
        "executable": server_path,
        "workingDir": dir.path(),
        "logFile": log_path,
        "sessionName": session_name,
        "controller": options.controller,
        "socketPath": socket_path,
        "initialLines": options.initial_lines,
        "timings": {
            "startSettleMs": 400,
            "stopGraceMs": 2000,
            "pollIntervalMs": 100,
            "metricsIntervalMs": 500,
        },
    });
    if let (Some(target), Some(extra)) = (config.as_object_mut(), options.extra.as_object()) {
        for (k, v) in extra {
            target.insert(k.clone(), v.clone());
        }
    }
    let config_path = dir.path().join("game-host.json");
    fs::write(&config_path, serde_json::to_vec_pretty(&config)?)?;

    let child = Command::new(env!("CARGO_BIN_EXE_game-host"))
        .arg("--config")
        .arg(&config_path)
        .env("RUST_LOG", "game_host=debug")
        .env("HOME", dir.path())
        .stdout(Stdio::null())
        .spawn()?;

    // Wait for socket to appear
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if socket_path.exists() && UnixStream::connect(&socket_path).is_ok() {
            break;
        }
        if Instant::now() > deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "Socket did not appear within 10 seconds",
            ));
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    Ok(GameHostHandle {
        child,
        socket_path,
        log_path,
        server_path,
        session_name,
        dir,
    })
}

/// Connect to a game-host's Unix socket.
pub fn connect(socket_path: &Path) -> io::Result<SocketClient> {
    let stream = UnixStream::connect(socket_path)?;
    Ok(SocketClient::new(stream))
}

/// Simple random u32 for unique names.
fn rand_u32() -> u32 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    Instant::now().hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() as u32
}
