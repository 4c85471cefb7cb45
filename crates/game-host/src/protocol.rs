//! Socket wire format.
//!
//! Every frame is `[u32 BE length][type byte][payload]`, where the length
//! covers the type byte and payload. Requests and responses carry JSON;
//! log snapshots above the gzip threshold go out compressed when that
//! actually saves bytes.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::errors::{HostError, Result};
use crate::metrics::MetricsSnapshot;
use crate::tailer::{LogPush, LogPushKind};

pub const MSG_REQUEST: u8 = 0x20;
pub const MSG_RESPONSE: u8 = 0x21;
pub const MSG_LOG_INITIAL: u8 = 0x22;
pub const MSG_LOG_INITIAL_GZ: u8 = 0x23;
pub const MSG_LOG_UPDATE: u8 = 0x24;
pub const MSG_METRICS: u8 = 0x25;

pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
const GZIP_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

/// Frame `payload`, refusing anything the peer's decoder would reject.
pub fn encode_frame(msg_type: u8, payload: &[u8]) -> Result<Vec<u8>> {
    encode_frame_within(msg_type, payload, MAX_FRAME_SIZE)
}

fn encode_frame_within(msg_type: u8, payload: &[u8], max_frame: usize) -> Result<Vec<u8>> {
    let len = payload.len() + 1;
    if len > max_frame {
        return Err(HostError::Protocol(format!(
            "outbound frame of {} bytes exceeds limit of {}",
            len, max_frame
        )));
    }
    let mut frame = Vec::with_capacity(4 + len);
    frame.extend_from_slice(&(len as u32).to_be_bytes());
    frame.push(msg_type);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Incremental frame parser for a byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    max_frame: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_frame,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Next complete frame, `Ok(None)` if more bytes are needed. Zero-length
    /// frames are skipped. An oversized length prefix is an error; the
    /// stream cannot be resynchronised after it.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if self.pending.len() < 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([
                self.pending[0],
                self.pending[1],
                self.pending[2],
                self.pending[3],
            ]) as usize;
            if len > self.max_frame {
                return Err(HostError::Protocol(format!(
                    "frame of {} bytes exceeds limit of {}",
                    len, self.max_frame
                )));
            }
            if self.pending.len() < 4 + len {
                return Ok(None);
            }
            let mut frame: Vec<u8> = self.pending.drain(..4 + len).skip(4).collect();
            if frame.is_empty() {
                continue;
            }
            let msg_type = frame.remove(0);
            return Ok(Some(Frame {
                msg_type,
                payload: frame,
            }));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    GetStatus,
    StartProcess,
    StopProcess,
    SendCommand {
        text: String,
    },
    SubscribeLogs {
        #[serde(default)]
        initial_lines: Option<usize>,
        #[serde(default)]
        full_history: Option<bool>,
    },
    UnsubscribeLogs,
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Request::GetStatus => "getStatus",
            Request::StartProcess => "startProcess",
            Request::StopProcess => "stopProcess",
            Request::SendCommand { .. } => "sendCommand",
            Request::SubscribeLogs { .. } => "subscribeLogs",
            Request::UnsubscribeLogs => "unsubscribeLogs",
        }
    }
}

/// Parse a REQUEST payload. On failure the error carries whatever `id`
/// could be recovered so the client can still match the response.
pub fn parse_request(payload: &[u8]) -> std::result::Result<(Value, Request), (Value, HostError)> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| (Value::Null, HostError::Protocol(format!("invalid JSON: {}", e))))?;
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    if !value.is_object() {
        return Err((id, HostError::Protocol("request must be a JSON object".into())));
    }
    let request = Request::deserialize(&value)
        .map_err(|e| (id.clone(), HostError::Protocol(format!("invalid request: {}", e))))?;
    Ok((id, request))
}

/// Messages queued for a connection's writer.
#[derive(Debug)]
pub enum Outbound {
    Response(Value),
    Log(LogPush),
    Metrics(MetricsSnapshot),
}

impl From<LogPush> for Outbound {
    fn from(push: LogPush) -> Self {
        Outbound::Log(push)
    }
}

impl From<MetricsSnapshot> for Outbound {
    fn from(snapshot: MetricsSnapshot) -> Self {
        Outbound::Metrics(snapshot)
    }
}

impl Outbound {
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.encode_within(MAX_FRAME_SIZE)
    }

    /// Encode into one frame of at most `max_frame` bytes. A log push that
    /// does not fit loses its oldest lines until it does.
    fn encode_within(&self, max_frame: usize) -> Result<Vec<u8>> {
        match self {
            Outbound::Response(value) => {
                encode_frame_within(MSG_RESPONSE, &to_json(value)?, max_frame)
            }
            Outbound::Metrics(snapshot) => {
                encode_frame_within(MSG_METRICS, &to_json(snapshot)?, max_frame)
            }
            Outbound::Log(push) => {
                let mut trimmed: Option<LogPush> = None;
                loop {
                    let current = trimmed.as_ref().unwrap_or(push);
                    let (msg_type, payload) = log_payload(current)?;
                    if payload.len() < max_frame || current.lines.len() <= 1 {
                        return encode_frame_within(msg_type, &payload, max_frame);
                    }
                    let dropped = current.lines.len() / 2;
                    warn!(
                        dropped,
                        kept = current.lines.len() - dropped,
                        "log push exceeds frame limit, dropping oldest lines"
                    );
                    let next = LogPush {
                        kind: current.kind,
                        lines: current.lines[dropped..].to_vec(),
                    };
                    trimmed = Some(next);
                }
            }
        }
    }
}

fn log_payload(push: &LogPush) -> Result<(u8, Vec<u8>)> {
    let body = to_json(push)?;
    Ok(match push.kind {
        LogPushKind::Update => (MSG_LOG_UPDATE, body),
        LogPushKind::Initial => match gzip_if_smaller(&body) {
            Some(compressed) => (MSG_LOG_INITIAL_GZ, compressed),
            None => (MSG_LOG_INITIAL, body),
        },
    })
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| HostError::Protocol(e.to_string()))
}

fn gzip_if_smaller(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < GZIP_THRESHOLD {
        return None;
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).ok()?;
    let compressed = encoder.finish().ok()?;
    (compressed.len() < data.len()).then_some(compressed)
}

/// `{id, ok: true, ...body}`. Non-object bodies land under `result`.
pub fn ok_response<T: Serialize>(id: &Value, body: &T) -> Value {
    let mut map = match serde_json::to_value(body) {
        Ok(Value::Object(map)) => map,
        Ok(Value::Null) => Map::new(),
        Ok(other) => {
            let mut map = Map::new();
            map.insert("result".into(), other);
            map
        }
        Err(e) => return error_response(id, &HostError::Protocol(e.to_string())),
    };
    map.insert("id".into(), id.clone());
    map.insert("ok".into(), Value::Bool(true));
    Value::Object(map)
}

/// `{id, ok: false, error}`.
pub fn error_response(id: &Value, error: &HostError) -> Value {
    serde_json::json!({
        "id": id,
        "ok": false,
        "error": error.to_string(),
    })
}
