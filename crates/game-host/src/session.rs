//! Per-connection bookkeeping.
//!
//! A `ConnectionContext` owns everything a connection started: its log
//! subscription, its metrics timer and any command correlations in flight.
//! Tearing the context down releases all of it at once.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::debug;

use crate::metrics::MetricsTimer;
use crate::protocol::Outbound;
use crate::tailer::{LogSubscription, SubscriberId};

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: AtomicU64,
    live: Mutex<HashSet<SubscriberId>>,
}

impl RegistryInner {
    fn remove(&self, id: SubscriberId) -> bool {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).remove(&id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

/// What a disconnect released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub subscriber: SubscriberId,
    pub closed_subscription: bool,
    pub cancelled_metrics: bool,
    pub aborted_commands: usize,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection. Only the context itself is allocated.
    pub fn on_connect(&self, outbound: mpsc::Sender<Outbound>) -> ConnectionContext {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.inner
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
        debug!(subscriber = %id, "connection registered");
        ConnectionContext {
            id,
            outbound,
            subscription: None,
            metrics: None,
            commands: JoinSet::new(),
            registry: Arc::clone(&self.inner),
        }
    }

    /// Release everything `ctx` owns.
    pub fn on_disconnect(&self, mut ctx: ConnectionContext) -> TeardownReport {
        let report = ctx.release();
        debug!(subscriber = %ctx.id, ?report, "connection torn down");
        report
    }

    pub fn live_connections(&self) -> usize {
        self.inner.live.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_live(&self, id: SubscriberId) -> bool {
        self.inner
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }
}

pub struct ConnectionContext {
    id: SubscriberId,
    outbound: mpsc::Sender<Outbound>,
    subscription: Option<LogSubscription>,
    metrics: Option<MetricsTimer>,
    commands: JoinSet<()>,
    registry: Arc<RegistryInner>,
}

impl ConnectionContext {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn outbound(&self) -> &mpsc::Sender<Outbound> {
        &self.outbound
    }

    pub fn has_subscription(&self) -> bool {
        self.subscription.is_some()
    }

    /// Stop the current log subscription, if any.
    pub fn close_subscription(&mut self) -> bool {
        match self.subscription.take() {
            Some(sub) => {
                sub.close();
                true
            }
            None => false,
        }
    }

    /// Install `sub`, closing any previous one.
    pub fn set_subscription(&mut self, sub: LogSubscription) {
        self.close_subscription();
        self.subscription = Some(sub);
    }

    pub fn has_metrics_timer(&self) -> bool {
        self.metrics.is_some()
    }

    pub fn set_metrics_timer(&mut self, timer: MetricsTimer) {
        if let Some(old) = self.metrics.replace(timer) {
            old.cancel();
        }
    }

    /// Run request work owned by this connection.
    pub fn spawn_command<F>(&mut self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        while self.commands.try_join_next().is_some() {}
        self.commands.spawn(work);
    }

    /// Commands still running.
    pub fn commands_in_flight(&mut self) -> usize {
        while self.commands.try_join_next().is_some() {}
        self.commands.len()
    }

    fn release(&mut self) -> TeardownReport {
        let closed_subscription = self.close_subscription();
        let cancelled_metrics = match self.metrics.take() {
            Some(timer) => {
                timer.cancel();
                true
            }
            None => false,
        };
        let aborted_commands = self.commands_in_flight();
        self.commands.abort_all();
        self.registry.remove(self.id);
        TeardownReport {
            subscriber: self.id,
            closed_subscription,
            cancelled_metrics,
            aborted_commands,
        }
    }
}

impl Drop for ConnectionContext {
    fn drop(&mut self) {
        if self.registry.remove(self.id) {
            self.release();
        }
    }
}
