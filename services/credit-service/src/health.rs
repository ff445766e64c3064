//! Database connection health monitor.
//!
//! Periodically samples the driver's open-connection count and, once the
//! count reaches `pressure_ratio` of the hard ceiling, terminates backends
//! that have been idle for longer than `idle_after`. The latest sample is
//! kept for `GET /health`.

use crate::metrics::Metrics;
use crate::store::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

#[async_trait]
pub trait ConnectionProbe: Send + Sync {
    async fn active_connections(&self) -> StoreResult<u32>;
    /// Returns how many connections were terminated.
    async fn terminate_idle(&self, idle_for: Duration) -> StoreResult<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthMonitorConfig {
    pub connection_ceiling: u32,
    pub pressure_ratio: f64,
    pub idle_after: Duration,
    pub interval: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            connection_ceiling: 20,
            pressure_ratio: 0.8,
            idle_after: Duration::from_secs(300),
            interval: Duration::from_secs(60),
        }
    }
}

impl HealthMonitorConfig {
    /// Connection count at which idle connections start being reclaimed.
    pub fn pressure_threshold(&self) -> u32 {
        let threshold = (f64::from(self.connection_ceiling) * self.pressure_ratio).ceil();
        (threshold as u32).clamp(1, self.connection_ceiling.max(1))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub active_connections: u32,
    pub connection_ceiling: u32,
    pub under_pressure: bool,
    pub terminated_last_sample: u64,
    pub terminated_total: u64,
    pub last_error: Option<String>,
    pub sampled_at: Option<DateTime<Utc>>,
}

pub struct ConnectionHealthMonitor {
    probe: Arc<dyn ConnectionProbe>,
    config: HealthMonitorConfig,
    metrics: Option<Metrics>,
    snapshot: RwLock<HealthSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHealthMonitor {
    pub fn new(
        probe: Arc<dyn ConnectionProbe>,
        config: HealthMonitorConfig,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            probe,
            config,
            metrics,
            snapshot: RwLock::new(HealthSnapshot {
                active_connections: 0,
                connection_ceiling: config.connection_ceiling,
                under_pressure: false,
                terminated_last_sample: 0,
                terminated_total: 0,
                last_error: None,
                sampled_at: None,
            }),
            task: Mutex::new(None),
        }
    }

    /// Take one sample, reclaiming idle connections if needed.
    pub async fn sample_once(&self) -> HealthSnapshot {
        let mut snapshot = self.snapshot();
        snapshot.sampled_at = Some(Utc::now());
        snapshot.terminated_last_sample = 0;

        match self.probe.active_connections().await {
            Ok(active) => {
                snapshot.active_connections = active;
                snapshot.under_pressure = active >= self.config.pressure_threshold();
                snapshot.last_error = None;
                if let Some(metrics) = &self.metrics {
                    metrics.db_connections.set(i64::from(active));
                }
            }
            Err(err) => {
                error!("[db-health] connection sample failed: {err}");
                snapshot.last_error = Some(err.to_string());
                self.store(snapshot.clone());
                return snapshot;
            }
        }

        if snapshot.under_pressure {
            warn!(
                "[db-health] {} of {} connections open; reclaiming idle ones",
                snapshot.active_connections, self.config.connection_ceiling
            );
            match self.probe.terminate_idle(self.config.idle_after).await {
                Ok(terminated) => {
                    snapshot.terminated_last_sample = terminated;
                    snapshot.terminated_total += terminated;
                    if let Some(metrics) = &self.metrics {
                        metrics.db_idle_terminated.inc_by(terminated);
                    }
                }
                Err(err) => {
                    error!("[db-health] idle termination failed: {err}");
                    snapshot.last_error = Some(err.to_string());
                }
            }
        }

        self.store(snapshot.clone());
        snapshot
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn store(&self, snapshot: HealthSnapshot) {
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    /// Start periodic sampling. Calling twice restarts the loop.
    pub fn spawn(self: &Arc<Self>) {
        let monitor = Arc::downgrade(self);
        let interval = self.config.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.sample_once().await;
            }
        });
        if let Ok(mut slot) = self.task.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
        info!(
            "[db-health] sampling every {}s (ceiling {}, reclaim at {})",
            interval.as_secs(),
            self.config.connection_ceiling,
            self.config.pressure_threshold()
        );
    }

    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for ConnectionHealthMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
