//! Observability event stream.
//!
//! Each run owns a broadcast channel; every stage transition publishes a
//! `PipelineEvent` before proceeding. Publishing is fire-and-continue: a
//! send never blocks, and a subscriber that lags past the buffer drops
//! events rather than stalling the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::Phase;

/// One observability event. Event type strings are dotted
/// `subsystem.happening` names (`execution.failed`, `debug.diagnosed`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub event_type: String,
    pub phase: Phase,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// Per-run event publisher. Cloneable; all clones feed the same stream.
#[derive(Debug, Clone)]
pub struct EventBus {
    run_id: Uuid,
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(run_id: Uuid, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { run_id, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Never blocks; having no live subscribers is fine.
    pub fn publish(&self, event_type: &str, phase: Phase, message: impl Into<String>, data: Value) {
        let event = PipelineEvent {
            event_type: event_type.to_string(),
            phase,
            message: message.into(),
            data,
            run_id: self.run_id,
            timestamp: Utc::now(),
        };
        tracing::debug!(
            run_id = %self.run_id,
            event = %event.event_type,
            phase = %event.phase,
            "{}",
            event.message
        );
        let _ = self.tx.send(event);
    }
}
