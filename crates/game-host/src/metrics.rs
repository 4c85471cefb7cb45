//! Host metrics and update availability, pushed to every connection.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::HostConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuLoad {
    pub usage_percent: f32,
    pub load_one: f64,
    pub load_five: f64,
    pub load_fifteen: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(
    tag = "status",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum UpdateInfo {
    Unavailable { reason: String },
    UpToDate { current: String },
    Available { current: String, latest: String },
}

impl UpdateInfo {
    fn unavailable(reason: impl Into<String>) -> Self {
        UpdateInfo::Unavailable {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub cpu_load: CpuLoad,
    pub memory: MemoryUsage,
    /// Host uptime in seconds.
    pub uptime: u64,
    pub timestamp: DateTime<Utc>,
    pub update_info: UpdateInfo,
    pub version: String,
}

#[derive(Debug, Deserialize)]
struct UpdateManifest {
    version: Option<String>,
    tag_name: Option<String>,
}

struct CachedUpdate {
    info: UpdateInfo,
    checked_at: Option<Instant>,
}

pub struct MetricsPublisher {
    system: Arc<std::sync::Mutex<System>>,
    manifest_url: Option<String>,
    server_version: Option<String>,
    check_interval: Duration,
    fetch_timeout: Duration,
    metrics_interval: Duration,
    update: std::sync::Mutex<CachedUpdate>,
    /// Held for the duration of a manifest fetch.
    refresh_gate: Mutex<()>,
    checker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MetricsPublisher {
    pub fn new(config: &HostConfig) -> Self {
        let initial = if config.update_manifest_url.is_some() {
            UpdateInfo::unavailable("update check pending")
        } else {
            UpdateInfo::unavailable("no update manifest configured")
        };
        Self {
            system: Arc::new(std::sync::Mutex::new(System::new())),
            manifest_url: config.update_manifest_url.clone(),
            server_version: config.server_version.clone(),
            check_interval: config.timings.update_check_interval(),
            fetch_timeout: config.timings.tool_timeout(),
            metrics_interval: config.timings.metrics_interval(),
            update: std::sync::Mutex::new(CachedUpdate {
                info: initial,
                checked_at: None,
            }),
            refresh_gate: Mutex::new(()),
            checker: std::sync::Mutex::new(None),
        }
    }

    /// Start the shared background update check. Metrics pushes only read
    /// its cached result, so a hung fetch never delays a heartbeat. No-op
    /// without a manifest URL or when already started.
    pub fn start_update_checks(self: &Arc<Self>) {
        if self.manifest_url.is_none() {
            return;
        }
        let mut checker = self.checker.lock().unwrap_or_else(|e| e.into_inner());
        if checker.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let publisher: Weak<Self> = Arc::downgrade(self);
        let interval = self.check_interval;
        *checker = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(publisher) = publisher.upgrade() else {
                    break;
                };
                publisher.refresh_updates().await;
            }
        }));
        debug!(?interval, "update checks scheduled");
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Sample the host now. CPU usage is measured since the previous sample,
    /// so the very first one reads 0.
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let system = Arc::clone(&self.system);
        let sampled = tokio::task::spawn_blocking(move || {
            let mut sys = system.lock().unwrap_or_else(|e| e.into_inner());
            sys.refresh_cpu_usage();
            sys.refresh_memory();
            let load = System::load_average();
            (
                CpuLoad {
                    usage_percent: sys.global_cpu_usage(),
                    load_one: load.one,
                    load_five: load.five,
                    load_fifteen: load.fifteen,
                },
                MemoryUsage {
                    total: sys.total_memory(),
                    used: sys.used_memory(),
                    free: sys.available_memory(),
                },
            )
        })
        .await;

        let (cpu_load, memory) = match sampled {
            Ok(pair) => pair,
            Err(e) => {
                warn!("metrics sampling failed: {}", e);
                (
                    CpuLoad {
                        usage_percent: 0.0,
                        load_one: 0.0,
                        load_five: 0.0,
                        load_fifteen: 0.0,
                    },
                    MemoryUsage {
                        total: 0,
                        used: 0,
                        free: 0,
                    },
                )
            }
        };

        MetricsSnapshot {
            cpu_load,
            memory,
            uptime: System::uptime(),
            timestamp: Utc::now(),
            update_info: self.cached_update().info.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Re-fetch the update manifest unless a check finished less than one
    /// interval ago. Concurrent callers share one fetch.
    pub async fn refresh_updates(&self) -> UpdateInfo {
        let _gate = self.refresh_gate.lock().await;
        {
            let cached = self.cached_update();
            let fresh = cached
                .checked_at
                .is_some_and(|at| at.elapsed() < self.check_interval);
            if fresh {
                return cached.info.clone();
            }
        }
        let Some(url) = self.manifest_url.clone() else {
            return self.cached_update().info.clone();
        };

        let timeout = self.fetch_timeout;
        let fetch = tokio::task::spawn_blocking(move || fetch_latest(&url, timeout));
        let info = match tokio::time::timeout(timeout + Duration::from_millis(500), fetch).await {
            Ok(Ok(Ok(latest))) => compare_versions(self.server_version.as_deref(), &latest),
            Ok(Ok(Err(reason))) => {
                debug!("update check failed: {}", reason);
                UpdateInfo::unavailable(reason)
            }
            Ok(Err(e)) => UpdateInfo::unavailable(e.to_string()),
            Err(_) => UpdateInfo::unavailable("update check timed out"),
        };
        if let UpdateInfo::Available { current, latest } = &info {
            info!(%current, %latest, "server update available");
        }
        let mut cached = self.cached_update();
        cached.info = info.clone();
        cached.checked_at = Some(Instant::now());
        info
    }

    fn cached_update(&self) -> std::sync::MutexGuard<'_, CachedUpdate> {
        self.update.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn fetch_latest(url: &str, timeout: Duration) -> Result<String, String> {
    let body = ureq::get(url)
        .timeout(timeout)
        .call()
        .map_err(|e| e.to_string())?
        .into_string()
        .map_err(|e| e.to_string())?;
    let manifest: UpdateManifest =
        serde_json::from_str(&body).map_err(|e| format!("invalid manifest: {}", e))?;
    manifest
        .version
        .or(manifest.tag_name)
        .ok_or_else(|| "manifest has no version".to_string())
}

fn compare_versions(current: Option<&str>, latest: &str) -> UpdateInfo {
    let Some(current) = current else {
        return UpdateInfo::unavailable(format!(
            "latest is {} but the installed server version is not configured",
            latest
        ));
    };
    let normalize = |v: &str| v.trim().trim_start_matches('v').to_string();
    if normalize(current) == normalize(latest) {
        UpdateInfo::UpToDate {
            current: current.to_string(),
        }
    } else {
        UpdateInfo::Available {
            current: current.to_string(),
            latest: latest.to_string(),
        }
    }
}

/// Per-connection metrics push loop. Dropping it stops the pushes.
#[derive(Debug)]
pub struct MetricsTimer {
    task: JoinHandle<()>,
}

impl MetricsTimer {
    pub fn spawn<T>(publisher: Arc<MetricsPublisher>, sink: mpsc::Sender<T>) -> Self
    where
        T: From<MetricsSnapshot> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut metrics = tokio::time::interval(publisher.metrics_interval());
            metrics.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                metrics.tick().await;
                let snapshot = publisher.snapshot().await;
                match sink.try_send(T::from(snapshot)) {
                    Ok(()) => {}
                    // Metrics are periodic; skip one rather than queue.
                    Err(TrySendError::Full(_)) => debug!("outbound queue full, metrics skipped"),
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        });
        Self { task }
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Drop for MetricsPublisher {
    fn drop(&mut self) {
        let checker = self.checker.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = checker.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timings;
    use std::path::PathBuf;
    use std::thread;

    /// Serve `body` to every request until the returned sender is dropped.
    fn start_manifest_server(body: &'static str) -> (std::sync::mpsc::Sender<()>, String) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("Failed to start test server");
        let port = server.server_addr().to_ip().unwrap().port();
        let url = format!("http://127.0.0.1:{}/manifest.json", port);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        thread::spawn(move || loop {
            if !matches!(stop_rx.try_recv(), Err(std::sync::mpsc::TryRecvError::Empty)) {
                break;
            }
            match server.recv_timeout(Duration::from_millis(50)) {
                Ok(Some(request)) => {
                    let _ = request.respond(tiny_http::Response::from_string(body));
                }
                Ok(None) => {}
                Err(_) => break,
            }
        });
        (stop_tx, url)
    }

    fn config(url: Option<String>, version: Option<&str>) -> HostConfig {
        HostConfig {
            executable: PathBuf::from("/bin/true"),
            update_manifest_url: url,
            server_version: version.map(str::to_string),
            timings: Timings {
                metrics_interval_ms: 50,
                update_check_interval_ms: 60_000,
                tool_timeout_ms: 2_000,
                ..Timings::default()
            },
            ..HostConfig::default()
        }
    }

    #[tokio::test]
    async fn snapshot_reports_host_figures() {
        let publisher = MetricsPublisher::new(&config(None, None));
        let snapshot = publisher.snapshot().await;
        assert!(snapshot.memory.total > 0);
        assert!(snapshot.memory.used <= snapshot.memory.total);
        assert!(snapshot.uptime > 0);
        assert_eq!(snapshot.version, env!("CARGO_PKG_VERSION"));
        assert!(matches!(snapshot.update_info, UpdateInfo::Unavailable { .. }));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["cpuLoad"]["usagePercent"].is_number());
        assert!(json["memory"]["free"].is_number());
        assert_eq!(json["updateInfo"]["status"], "unavailable");
    }

    #[tokio::test]
    async fn update_available_from_tag_name() {
        let (_stop, url) = start_manifest_server(r#"{"tag_name": "v1.21.0"}"#);
        let publisher = MetricsPublisher::new(&config(Some(url), Some("1.20.4")));

        let info = publisher.refresh_updates().await;
        assert_eq!(
            info,
            UpdateInfo::Available {
                current: "1.20.4".into(),
                latest: "v1.21.0".into()
            }
        );
        assert_eq!(publisher.snapshot().await.update_info, info);
    }

    #[tokio::test]
    async fn up_to_date_from_version_field() {
        let (_stop, url) = start_manifest_server(r#"{"version": "1.20.4"}"#);
        let publisher = MetricsPublisher::new(&config(Some(url), Some("v1.20.4")));
        assert_eq!(
            publisher.refresh_updates().await,
            UpdateInfo::UpToDate {
                current: "v1.20.4".into()
            }
        );
    }

    #[tokio::test]
    async fn failed_check_degrades_to_unavailable() {
        let (_stop, url) = start_manifest_server("not json");
        let publisher = MetricsPublisher::new(&config(Some(url), Some("1.0")));
        let info = publisher.refresh_updates().await;
        assert!(
            matches!(&info, UpdateInfo::Unavailable { reason } if reason.contains("invalid manifest")),
            "got {info:?}"
        );

        // Unreachable host; the closed port refuses immediately.
        let publisher = MetricsPublisher::new(&config(
            Some("http://127.0.0.1:9/manifest.json".into()),
            Some("1.0"),
        ));
        assert!(matches!(
            publisher.refresh_updates().await,
            UpdateInfo::Unavailable { .. }
        ));
    }

    #[tokio::test]
    async fn cached_result_is_reused_within_interval() {
        let (stop, url) = start_manifest_server(r#"{"version": "2.0"}"#);
        let publisher = MetricsPublisher::new(&config(Some(url), Some("1.0")));
        let first = publisher.refresh_updates().await;
        drop(stop);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(publisher.refresh_updates().await, first);
    }

    #[tokio::test]
    async fn timer_pushes_until_dropped() {
        let publisher = Arc::new(MetricsPublisher::new(&config(None, None)));
        let (tx, mut rx) = mpsc::channel::<MetricsSnapshot>(8);
        let timer = MetricsTimer::spawn(publisher, tx);

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("no metrics pushed")
                .expect("channel closed");
        }
        assert!(timer.is_active());
        timer.cancel();
        let drained = tokio::time::timeout(Duration::from_secs(2), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
    }

    #[tokio::test]
    async fn hung_manifest_fetch_does_not_delay_metrics() {
        // Accepts requests and never answers them.
        let server = tiny_http::Server::http("127.0.0.1:0").expect("Failed to start test server");
        let port = server.server_addr().to_ip().unwrap().port();
        let url = format!("http://127.0.0.1:{}/manifest.json", port);
        thread::spawn(move || {
            let mut held = Vec::new();
            while let Ok(request) = server.recv() {
                held.push(request);
            }
        });

        let mut config = config(Some(url), Some("1.0"));
        config.timings.metrics_interval_ms = 100;
        let publisher = Arc::new(MetricsPublisher::new(&config));
        publisher.start_update_checks();
        let (tx, mut rx) = mpsc::channel::<MetricsSnapshot>(64);
        let _timer = MetricsTimer::spawn(Arc::clone(&publisher), tx);

        let mut last = Instant::now();
        let mut worst = Duration::ZERO;
        for _ in 0..10 {
            let snapshot = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("metrics stalled")
                .expect("channel closed");
            worst = worst.max(last.elapsed());
            last = Instant::now();
            assert!(matches!(snapshot.update_info, UpdateInfo::Unavailable { .. }));
        }
        assert!(worst < Duration::from_millis(500), "worst gap {worst:?}");
    }

    #[tokio::test]
    async fn background_check_fills_the_cache() {
        let (_stop, url) = start_manifest_server(r#"{"version": "2.0"}"#);
        let publisher = Arc::new(MetricsPublisher::new(&config(Some(url), Some("1.0"))));
        publisher.start_update_checks();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let info = publisher.snapshot().await.update_info;
            if matches!(info, UpdateInfo::Available { .. }) {
                break;
            }
            assert!(Instant::now() < deadline, "cache never updated: {info:?}");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[test]
    fn version_comparison_ignores_v_prefix() {
        assert!(matches!(compare_versions(Some("v2"), "2"), UpdateInfo::UpToDate { .. }));
        assert!(matches!(compare_versions(Some("2"), "3"), UpdateInfo::Available { .. }));
        assert!(matches!(compare_versions(None, "3"), UpdateInfo::Unavailable { .. }));
    }
}
