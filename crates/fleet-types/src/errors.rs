//! # Error Types
//!
//! The error taxonomy shared by the bus and the supervisor.
//!
//! | Family | Examples | Handling |
//! |--------|----------|----------|
//! | [`ConfigError`] | unresolved dependency, conflict, cycle | fatal to startup |
//! | [`BusError`] | undeclared topic, schema violation | returned to caller |
//! | [`LifecycleError`] | startup/readiness timeout, budget exhausted | reported, node marked `Failed` |
//! | [`DeliveryWarning`] | queue overflow, best-effort drop | logged only |

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why a payload did not satisfy its topic schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("field '{field}': {reason}")]
pub struct SchemaViolation {
    pub field: String,
    pub reason: String,
}

impl SchemaViolation {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Configuration problems. All of these abort the supervised launch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Node '{node}' requires '{dependency}', which no enabled node provides")]
    UnresolvedDependency { node: String, dependency: String },

    #[error("Nodes '{node}' and '{other}' conflict and are both enabled")]
    ConflictViolation { node: String, other: String },

    #[error("Dependency cycle among nodes: {}", .members.join(" -> "))]
    DependencyCycle { members: Vec<String> },

    #[error("Node '{0}' admitted twice")]
    DuplicateNode(String),

    #[error("Override targets unknown node '{0}'")]
    UnknownNode(String),

    #[error("Overrides can only be merged once, before launch")]
    OverridesAfterLaunch,

    #[error("Invalid descriptor for '{node}': {reason}")]
    InvalidDescriptor { node: String, reason: String },

    #[error("Invalid runtime configuration: {0}")]
    InvalidRuntime(String),
}

/// Per-call bus failures. Recoverable; reported as a failure result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("Node '{node}' did not declare '{topic}' as a published topic")]
    UndeclaredTopic { node: String, topic: String },

    #[error("Payload on '{topic}' violates schema: {violation}")]
    SchemaViolation {
        topic: String,
        violation: SchemaViolation,
    },

    #[error("Topic '{topic}' already declared by '{owner}' with a different QoS or schema")]
    SchemaConflict { topic: String, owner: String },

    #[error("Node '{node}' has no callback '{callback}' for topic '{topic}'")]
    UnknownCallback {
        node: String,
        topic: String,
        callback: String,
    },

    #[error("Node '{node}' already subscribes to '{topic}' with callback '{existing}'")]
    DuplicateSubscription {
        node: String,
        topic: String,
        existing: String,
    },
}

/// Lifecycle failures. Reported by the Supervisor, never thrown across nodes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("Node '{node}' did not finish init within {timeout:?}")]
    StartupTimeout { node: String, timeout: Duration },

    #[error("Fleet not ready: nodes still unhealthy: {}", .pending.join(", "))]
    ReadinessTimeout { pending: Vec<String> },

    #[error("Node '{node}' exhausted its restart budget after {restarts} restarts")]
    RestartBudgetExhausted { node: String, restarts: u32 },

    #[error("Node '{node}': illegal transition {from} -> {to}")]
    InvalidTransition { node: String, from: String, to: String },

    #[error("Node '{node}' failed to initialise: {reason}")]
    InitFailed { node: String, reason: String },

    #[error("Node '{node}' did not stop within {timeout:?}; task aborted")]
    ShutdownTimeout { node: String, timeout: Duration },

    #[error("Node '{node}' cannot start: dependency '{dependency}' failed")]
    DependencyFailed { node: String, dependency: String },
}

/// Drop and overflow conditions. Never raised to the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryWarning {
    /// A `keep_all` queue was full and the incoming message was refused.
    QueueOverflow {
        topic: String,
        subscriber: String,
        reliable: bool,
    },
    /// A `keep_last` queue evicted its oldest entry.
    Replaced { topic: String, subscriber: String },
}

impl fmt::Display for DeliveryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueOverflow {
                topic,
                subscriber,
                reliable,
            } => {
                let kind = if *reliable { "reliable" } else { "best_effort" };
                write!(f, "queue overflow on '{topic}' for '{subscriber}' ({kind}), newest dropped")
            }
            Self::Replaced { topic, subscriber } => {
                write!(f, "keep_last queue on '{topic}' for '{subscriber}' replaced oldest entry")
            }
        }
    }
}

/// Umbrella error for the public fleet API.
#[derive(Debug, Clone, Error)]
pub enum FleetError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_lists_members() {
        let err = ConfigError::DependencyCycle {
            members: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle among nodes: a -> b -> a");
    }

    #[test]
    fn test_readiness_display_lists_pending() {
        let err = LifecycleError::ReadinessTimeout {
            pending: vec!["speech".into(), "listener".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("speech"));
        assert!(msg.contains("listener"));
    }

    #[test]
    fn test_schema_violation_display() {
        let err = BusError::SchemaViolation {
            topic: "speech.say".into(),
            violation: SchemaViolation::new("text", "required field missing"),
        };
        assert!(err.to_string().contains("'text'"));
    }

    #[test]
    fn test_fleet_error_from() {
        let err: FleetError = ConfigError::DuplicateNode("a".into()).into();
        assert!(matches!(err, FleetError::Config(_)));
    }

    #[test]
    fn test_delivery_warning_display() {
        let warning = DeliveryWarning::QueueOverflow {
            topic: "t".into(),
            subscriber: "s".into(),
            reliable: true,
        };
        assert!(warning.to_string().contains("reliable"));
    }
}
