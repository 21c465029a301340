//! Global atomic counters for Shipline.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single `tracing::info!`
//! event, e.g. when a pipeline finishes.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    pipelines_started: AtomicU64,
    stages_executed: AtomicU64,
    deployments_executed: AtomicU64,
    rollbacks_performed: AtomicU64,
    health_alerts: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            pipelines_started: AtomicU64::new(0),
            stages_executed: AtomicU64::new(0),
            deployments_executed: AtomicU64::new(0),
            rollbacks_performed: AtomicU64::new(0),
            health_alerts: AtomicU64::new(0),
        }
    }

    pub fn inc_pipelines_started(&self) {
        self.pipelines_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "pipelines_started", "counter incremented");
    }

    pub fn inc_stages_executed(&self) {
        self.stages_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "stages_executed", "counter incremented");
    }

    pub fn inc_deployments_executed(&self) {
        self.deployments_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deployments_executed", "counter incremented");
    }

    pub fn inc_rollbacks(&self) {
        self.rollbacks_performed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rollbacks_performed", "counter incremented");
    }

    pub fn inc_health_alerts(&self) {
        self.health_alerts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "health_alerts", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            pipelines_started = self.pipelines_started(),
            stages_executed = self.stages_executed(),
            deployments_executed = self.deployments_executed(),
            rollbacks_performed = self.rollbacks_performed(),
            health_alerts = self.health_alerts(),
        );
    }

    pub fn pipelines_started(&self) -> u64 {
        self.pipelines_started.load(Ordering::Relaxed)
    }

    pub fn stages_executed(&self) -> u64 {
        self.stages_executed.load(Ordering::Relaxed)
    }

    pub fn deployments_executed(&self) -> u64 {
        self.deployments_executed.load(Ordering::Relaxed)
    }

    pub fn rollbacks_performed(&self) -> u64 {
        self.rollbacks_performed.load(Ordering::Relaxed)
    }

    pub fn health_alerts(&self) -> u64 {
        self.health_alerts.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.pipelines_started.store(0, Ordering::Relaxed);
        self.stages_executed.store(0, Ordering::Relaxed);
        self.deployments_executed.store(0, Ordering::Relaxed);
        self.rollbacks_performed.store(0, Ordering::Relaxed);
        self.health_alerts.store(0, Ordering::Relaxed);
    }
}
