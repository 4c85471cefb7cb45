//! Log file fan-out.
//!
//! Every subscriber gets its own `LogCursor` and its own task, so a slow
//! viewer only ever stalls itself. A subscriber first receives an `initial`
//! snapshot (last N lines, or the whole file), then `update` pushes with
//! exactly the complete lines appended since its previous read.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::errors::{HostError, Result};
use crate::sanitize::strip_control_sequences;

/// Chunk size for the backward scan that finds the last N lines.
const TAIL_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeMode {
    InitialLines(usize),
    FullHistory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogPushKind {
    Initial,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogPush {
    #[serde(rename = "type")]
    pub kind: LogPushKind,
    pub lines: Vec<String>,
}

impl LogPush {
    pub fn initial(lines: Vec<String>) -> Self {
        Self {
            kind: LogPushKind::Initial,
            lines,
        }
    }

    pub fn update(lines: Vec<String>) -> Self {
        Self {
            kind: LogPushKind::Update,
            lines,
        }
    }
}

/// What a cursor read produced.
#[derive(Debug, PartialEq, Eq)]
pub enum CursorRead {
    /// Complete lines appended since the previous read (possibly none).
    Appended(Vec<String>),
    /// The file shrank; every complete line from offset 0.
    Reset(Vec<String>),
}

/// One subscriber's position in the log file.
#[derive(Debug)]
pub struct LogCursor {
    subscriber: SubscriberId,
    path: PathBuf,
    /// Bytes consumed from the file, including `pending`.
    offset: u64,
    /// Trailing bytes of an unterminated line.
    pending: Vec<u8>,
    last_polled_at: Option<DateTime<Utc>>,
    strip: bool,
}

impl LogCursor {
    pub fn new(subscriber: SubscriberId, path: PathBuf, offset: u64, strip: bool) -> Self {
        Self {
            subscriber,
            path,
            offset,
            pending: Vec::new(),
            last_polled_at: None,
            strip,
        }
    }

    pub fn subscriber(&self) -> SubscriberId {
        self.subscriber
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset of the end of the last line handed out.
    pub fn delivered_offset(&self) -> u64 {
        self.offset - self.pending.len() as u64
    }

    pub fn last_polled_at(&self) -> Option<DateTime<Utc>> {
        self.last_polled_at
    }

    /// Read whatever was appended since the last call.
    ///
    /// A missing file reads as empty. If the file is now shorter than the
    /// cursor, the cursor rewinds to 0 and the whole file is returned as a
    /// `Reset`.
    pub fn read_new(&mut self) -> io::Result<CursorRead> {
        self.last_polled_at = Some(Utc::now());
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(self.rewind_if_shrunk(0).unwrap_or(CursorRead::Appended(Vec::new())));
            }
            Err(e) => return Err(e),
        };
        let size = file.metadata()?.len();

        let reset = size < self.offset;
        if reset {
            debug!(
                subscriber = %self.subscriber,
                offset = self.offset,
                size,
                "log file shrank, rewinding cursor"
            );
            self.offset = 0;
            self.pending.clear();
        }
        if size == self.offset {
            return Ok(if reset {
                CursorRead::Reset(Vec::new())
            } else {
                CursorRead::Appended(Vec::new())
            });
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut chunk = Vec::with_capacity((size - self.offset) as usize);
        file.take(size - self.offset).read_to_end(&mut chunk)?;
        self.offset += chunk.len() as u64;

        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(&chunk);
        let complete = match memchr::memrchr(b'\n', &data) {
            Some(idx) => idx + 1,
            None => 0,
        };
        self.pending = data.split_off(complete);
        let lines = split_lines(&data, self.strip);

        Ok(if reset {
            CursorRead::Reset(lines)
        } else {
            CursorRead::Appended(lines)
        })
    }

    fn rewind_if_shrunk(&mut self, size: u64) -> Option<CursorRead> {
        if size < self.offset {
            self.offset = 0;
            self.pending.clear();
            Some(CursorRead::Reset(Vec::new()))
        } else {
            None
        }
    }
}

/// Split newline-terminated bytes into lines, dropping a trailing `\r`.
pub(crate) fn split_lines(data: &[u8], strip: bool) -> Vec<String> {
    if data.is_empty() {
        return Vec::new();
    }
    let body = data.strip_suffix(b"\n").unwrap_or(data);
    body.split(|&b| b == b'\n')
        .map(|raw| {
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            let line = String::from_utf8_lossy(raw);
            if strip {
                strip_control_sequences(&line)
            } else {
                line.into_owned()
            }
        })
        .collect()
}

/// Initial snapshot for a new subscriber: the selected lines and the offset
/// just past the last complete line. A trailing partial line is left for the
/// cursor to pick up once it is terminated.
pub fn snapshot(path: &Path, mode: SubscribeMode, strip: bool) -> io::Result<(Vec<String>, u64)> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let size = file.metadata()?.len();
    let end = last_line_end(&mut file, size)?;

    let lines = match mode {
        SubscribeMode::FullHistory => {
            let mut data = Vec::with_capacity(end as usize);
            file.seek(SeekFrom::Start(0))?;
            (&mut file).take(end).read_to_end(&mut data)?;
            split_lines(&data, strip)
        }
        SubscribeMode::InitialLines(n) => {
            let start = tail_start(&mut file, end, n)?;
            let mut data = Vec::with_capacity((end - start) as usize);
            file.seek(SeekFrom::Start(start))?;
            (&mut file).take(end - start).read_to_end(&mut data)?;
            split_lines(&data, strip)
        }
    };
    Ok((lines, end))
}

/// Offset just past the last `\n` at or before `size`, or 0.
fn last_line_end(file: &mut File, size: u64) -> io::Result<u64> {
    let mut pos = size;
    let mut buf = vec![0u8; TAIL_CHUNK_SIZE];
    while pos > 0 {
        let read_size = (pos as usize).min(TAIL_CHUNK_SIZE);
        let chunk_start = pos - read_size as u64;
        file.seek(SeekFrom::Start(chunk_start))?;
        file.read_exact(&mut buf[..read_size])?;
        if let Some(idx) = memchr::memrchr(b'\n', &buf[..read_size]) {
            return Ok(chunk_start + idx as u64 + 1);
        }
        pos = chunk_start;
    }
    Ok(0)
}

/// Offset where the last `n` lines ending at `end` begin. `end` must be 0 or
/// sit just past a newline.
fn tail_start(file: &mut File, end: u64, n: usize) -> io::Result<u64> {
    if n == 0 || end == 0 {
        return Ok(end);
    }
    // The newline terminating the final line is not a separator.
    let mut pos = end - 1;
    let mut seen = 0usize;
    let mut buf = vec![0u8; TAIL_CHUNK_SIZE];
    while pos > 0 {
        let read_size = (pos as usize).min(TAIL_CHUNK_SIZE);
        let chunk_start = pos - read_size as u64;
        file.seek(SeekFrom::Start(chunk_start))?;
        file.read_exact(&mut buf[..read_size])?;
        for idx in memchr::memrchr_iter(b'\n', &buf[..read_size]) {
            seen += 1;
            if seen == n {
                return Ok(chunk_start + idx as u64 + 1);
            }
        }
        pos = chunk_start;
    }
    Ok(0)
}

/// Ways of learning that the log file changed, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStrategy {
    /// OS file-change notification on the parent directory.
    Notify,
    /// Fixed-interval polling.
    Poll(Duration),
}

/// An armed watch strategy.
pub enum ChangeSource {
    Notify {
        _watcher: RecommendedWatcher,
        events: mpsc::Receiver<()>,
        /// Safety net for dropped or coalesced events.
        backstop: Interval,
    },
    Poll(Interval),
}

impl ChangeSource {
    /// Arm the first strategy that can be set up.
    pub fn open(path: &Path, strategies: &[WatchStrategy]) -> Result<Self> {
        let mut last_error = None;
        for strategy in strategies {
            match Self::arm(path, *strategy) {
                Ok(source) => return Ok(source),
                Err(e) => {
                    warn!(?strategy, path = %path.display(), "log watch strategy failed: {}", e);
                    last_error = Some(e);
                }
            }
        }
        Err(HostError::WatchSetupFailure(match last_error {
            Some(e) => e.to_string(),
            None => "no watch strategy configured".to_string(),
        }))
    }

    fn arm(path: &Path, strategy: WatchStrategy) -> Result<Self> {
        match strategy {
            WatchStrategy::Poll(interval) => {
                if interval.is_zero() {
                    return Err(HostError::WatchSetupFailure("zero poll interval".into()));
                }
                Ok(ChangeSource::Poll(ticker(interval)))
            }
            WatchStrategy::Notify => {
                let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    Some(dir) => dir.to_path_buf(),
                    None => PathBuf::from("."),
                };
                let file_name = path.file_name().map(|n| n.to_os_string());
                let (tx, events) = mpsc::channel(1);
                let mut watcher =
                    notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                        Ok(event) => {
                            let relevant = event
                                .paths
                                .iter()
                                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                            if relevant {
                                // Full channel means a wake-up is already queued.
                                let _ = tx.try_send(());
                            }
                        }
                        Err(e) => warn!("log watch error: {}", e),
                    })
                    .map_err(|e| HostError::WatchSetupFailure(e.to_string()))?;
                watcher
                    .watch(&dir, RecursiveMode::NonRecursive)
                    .map_err(|e| HostError::WatchSetupFailure(e.to_string()))?;
                Ok(ChangeSource::Notify {
                    _watcher: watcher,
                    events,
                    backstop: ticker(Duration::from_secs(5)),
                })
            }
        }
    }

    pub fn is_notify(&self) -> bool {
        matches!(self, ChangeSource::Notify { .. })
    }

    /// Wait for the next possible change.
    pub async fn changed(&mut self) {
        match self {
            ChangeSource::Notify {
                events, backstop, ..
            } => {
                tokio::select! {
                    event = events.recv() => {
                        if event.is_none() {
                            // Watcher thread is gone; fall back to the backstop.
                            backstop.tick().await;
                        }
                    }
                    _ = backstop.tick() => {}
                }
            }
            ChangeSource::Poll(interval) => {
                interval.tick().await;
            }
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// A live subscription. Dropping it stops delivery.
#[derive(Debug)]
pub struct LogSubscription {
    subscriber: SubscriberId,
    task: JoinHandle<()>,
}

impl LogSubscription {
    pub fn subscriber(&self) -> SubscriberId {
        self.subscriber
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn close(self) {
        self.task.abort();
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Shared entry point for subscribing to the managed server's log.
#[derive(Debug, Clone)]
pub struct LogTailer {
    path: PathBuf,
    strip: bool,
    strategies: Vec<WatchStrategy>,
}

impl LogTailer {
    pub fn new(path: PathBuf, poll_interval: Duration, strip: bool) -> Self {
        Self::with_strategies(
            path,
            strip,
            vec![WatchStrategy::Notify, WatchStrategy::Poll(poll_interval)],
        )
    }

    pub fn with_strategies(path: PathBuf, strip: bool, strategies: Vec<WatchStrategy>) -> Self {
        Self {
            path,
            strip,
            strategies,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send the initial snapshot to `sink`, then keep pushing appended
    /// lines until the subscription is dropped or `sink` closes.
    pub async fn subscribe<T>(
        &self,
        subscriber: SubscriberId,
        mode: SubscribeMode,
        sink: mpsc::Sender<T>,
    ) -> Result<LogSubscription>
    where
        T: From<LogPush> + Send + 'static,
    {
        let path = self.path.clone();
        let strip = self.strip;
        let (lines, offset) =
            tokio::task::spawn_blocking(move || snapshot(&path, mode, strip))
                .await
                .map_err(|e| HostError::Io(io::Error::other(e)))??;

        let mut source = ChangeSource::open(&self.path, &self.strategies)?;
        info!(
            %subscriber,
            ?mode,
            notify = source.is_notify(),
            initial_lines = lines.len(),
            "log subscription opened"
        );

        sink.send(T::from(LogPush::initial(lines)))
            .await
            .map_err(|_| HostError::Protocol("subscriber disconnected".into()))?;

        let mut cursor = LogCursor::new(subscriber, self.path.clone(), offset, strip);
        let task = tokio::spawn(async move {
            loop {
                source.changed().await;
                let read = tokio::task::spawn_blocking(move || {
                    let read = cursor.read_new();
                    (cursor, read)
                })
                .await;
                let (returned, read) = match read {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(%subscriber, "log read task failed: {}", e);
                        break;
                    }
                };
                cursor = returned;

                let push = match read {
                    Ok(CursorRead::Appended(lines)) if lines.is_empty() => continue,
                    Ok(CursorRead::Appended(lines)) => LogPush::update(lines),
                    Ok(CursorRead::Reset(lines)) => {
                        info!(%subscriber, "log file was truncated or rotated, resending");
                        LogPush::initial(lines)
                    }
                    Err(e) => {
                        warn!(%subscriber, "log read failed: {}", e);
                        continue;
                    }
                };
                if sink.send(T::from(push)).await.is_err() {
                    debug!(%subscriber, "log sink closed");
                    break;
                }
            }
        });

        Ok(LogSubscription { subscriber, task })
    }
}
