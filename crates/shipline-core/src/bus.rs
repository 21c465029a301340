//! Default event bus and audit recorder.

use tokio::sync::broadcast;

use crate::domain::{AuditEntry, PipelineEvent};
use crate::ports::{AuditRecorder, EventBus};

/// Fan-out event bus over a `tokio::sync::broadcast` channel.
///
/// Slow subscribers lag and lose events; publishing never blocks.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for BroadcastEventBus {
    fn broadcast(&self, event: PipelineEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

/// Audit recorder that writes each entry as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditRecorder;

impl AuditRecorder for TracingAuditRecorder {
    fn record(&self, entry: AuditEntry) {
        tracing::info!(
            event = "audit",
            action = ?entry.action,
            actor = entry.actor.as_deref().unwrap_or("-"),
            project_id = entry.project_id.as_deref().unwrap_or("-"),
            subject_id = ?entry.subject_id,
            context = %entry.context,
            "{}",
            entry.description
        );
    }
}
