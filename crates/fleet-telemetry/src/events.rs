//! Observability sink for lifecycle and bus events.
//!
//! The core never formats or stores logs itself; it calls
//! [`EventSink::record_event`] and lets the sink decide. Two sinks ship here:
//!
//! - [`TracingSink`]: emits a structured `tracing` event per record (default)
//! - [`MemorySink`]: keeps records in memory, for tests and diagnostics

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Category of an observability event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A node changed lifecycle state.
    StateTransition,
    /// A node is being relaunched.
    Restart,
    /// A health probe failed or timed out.
    HealthCheckFailed,
    /// A node was aborted after missing its shutdown timeout.
    ShutdownForced,
    /// A subscription was dropped or degraded during init.
    InitWarning,
    /// A subscriber's QoS expectation is not met by the publisher.
    QosMismatch,
    /// A `keep_all` queue refused a message on a reliable subscription.
    QueueOverflow,
    /// A best-effort subscription lost a message.
    BestEffortDrop,
    /// A `keep_last` queue evicted its oldest entry.
    KeepLastReplaced,
    /// The bus refused a publish.
    PublishRejected,
    /// A subscriber callback returned an error or panicked.
    CallbackFailed,
    /// The fleet configuration was rejected at boot.
    ConfigRejected,
    /// `wait_for_healthy` gave up.
    ReadinessTimeout,
}

impl EventKind {
    /// Whether operators should be alerted on this kind.
    pub fn is_warning(self) -> bool {
        !matches!(
            self,
            Self::StateTransition | Self::KeepLastReplaced | Self::BestEffortDrop
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StateTransition => "state_transition",
            Self::Restart => "restart",
            Self::HealthCheckFailed => "health_check_failed",
            Self::ShutdownForced => "shutdown_forced",
            Self::InitWarning => "init_warning",
            Self::QosMismatch => "qos_mismatch",
            Self::QueueOverflow => "queue_overflow",
            Self::BestEffortDrop => "best_effort_drop",
            Self::KeepLastReplaced => "keep_last_replaced",
            Self::PublishRejected => "publish_rejected",
            Self::CallbackFailed => "callback_failed",
            Self::ConfigRejected => "config_rejected",
            Self::ReadinessTimeout => "readiness_timeout",
        };
        f.write_str(name)
    }
}

/// External logging collaborator.
pub trait EventSink: Send + Sync {
    /// Record one event. Must not block.
    fn record_event(&self, kind: EventKind, node: &str, detail: &str);
}

/// Shared sink handle.
pub type DynEventSink = Arc<dyn EventSink>;

/// Sink that forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record_event(&self, kind: EventKind, node: &str, detail: &str) {
        match kind {
            EventKind::StateTransition | EventKind::Restart => {
                tracing::info!(event = %kind, node = %node, "{}", detail)
            }
            EventKind::KeepLastReplaced | EventKind::BestEffortDrop => {
                tracing::debug!(event = %kind, node = %node, "{}", detail)
            }
            EventKind::ConfigRejected | EventKind::ReadinessTimeout | EventKind::ShutdownForced => {
                tracing::error!(event = %kind, node = %node, "{}", detail)
            }
            _ => tracing::warn!(event = %kind, node = %node, "{}", detail),
        }
    }
}

/// One event captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedEvent {
    pub kind: EventKind,
    pub node: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// In-memory sink. Cheap to clone; clones share storage.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Events of one kind.
    pub fn of_kind(&self, kind: EventKind) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of events of one kind.
    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    /// Render the captured events as JSON lines.
    pub fn to_json_lines(&self) -> String {
        self.events
            .lock()
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn record_event(&self, kind: EventKind, node: &str, detail: &str) {
        self.events.lock().push(RecordedEvent {
            kind,
            node: node.to_string(),
            detail: detail.to_string(),
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_and_filters() {
        let sink = MemorySink::new();
        sink.record_event(EventKind::Restart, "speech", "attempt 1");
        sink.record_event(EventKind::QueueOverflow, "listener", "topic audio");
        sink.record_event(EventKind::Restart, "speech", "attempt 2");

        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.count(EventKind::Restart), 2);
        assert_eq!(sink.of_kind(EventKind::QueueOverflow)[0].node, "listener");
    }

    #[test]
    fn test_memory_sink_clones_share_storage() {
        let sink = MemorySink::new();
        let clone = sink.clone();
        clone.record_event(EventKind::InitWarning, "a", "missing callback");
        assert_eq!(sink.count(EventKind::InitWarning), 1);
        sink.clear();
        assert!(clone.events().is_empty());
    }

    #[test]
    fn test_json_lines() {
        let sink = MemorySink::new();
        sink.record_event(EventKind::StateTransition, "a", "Pending -> Starting");
        let lines = sink.to_json_lines();
        assert!(lines.contains("\"kind\":\"state_transition\""));
    }

    #[test]
    fn test_tracing_sink_does_not_panic_without_subscriber() {
        TracingSink.record_event(EventKind::ConfigRejected, "-", "cycle");
    }

    #[test]
    fn test_warning_classification() {
        assert!(EventKind::QueueOverflow.is_warning());
        assert!(!EventKind::StateTransition.is_warning());
    }
}
