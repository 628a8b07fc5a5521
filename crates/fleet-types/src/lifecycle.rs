//! # Node Lifecycle States
//!
//! Owned exclusively by the Supervisor. Every state change goes through
//! [`NodeLifecycleState::can_transition_to`].
//!
//! ```text
//! Pending ──launch──→ Starting ──init ok──→ Running ──first pass──→ Healthy
//!                        │                     │                      │
//!                        │ startup timeout     └──────┐   threshold   │
//!                        ↓                            ↓   reached     │
//!                      Failed ←──budget gone── Unhealthy ←────────────┘
//!                                                     │
//!                                                     ↓ policy allows
//!                                                Restarting ──relaunch──→ Starting
//!
//! Running/Healthy ──shutdown──→ Stopping ──clean exit or timeout──→ Stopped
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one supervised node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeLifecycleState {
    Pending,
    Starting,
    Running,
    Healthy,
    Unhealthy,
    Restarting,
    Stopping,
    Stopped,
    Failed,
}

impl NodeLifecycleState {
    /// Whether the state machine allows `self → next`.
    pub fn can_transition_to(self, next: NodeLifecycleState) -> bool {
        use NodeLifecycleState::*;

        matches!(
            (self, next),
            (Pending, Starting)
                // A required dependency failed permanently.
                | (Pending, Failed)
                | (Pending, Stopped)
                | (Starting, Running)
                | (Starting, Failed)
                // Init returned an error or the node crashed during startup.
                | (Starting, Unhealthy)
                | (Starting, Stopping)
                | (Running, Healthy)
                | (Running, Unhealthy)
                | (Running, Stopping)
                | (Healthy, Unhealthy)
                | (Healthy, Stopping)
                | (Unhealthy, Restarting)
                | (Unhealthy, Failed)
                | (Unhealthy, Stopping)
                | (Restarting, Starting)
                | (Restarting, Stopped)
                | (Stopping, Stopped)
        )
    }

    /// No further transitions happen from here.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// The node's runtime is registered with the bus in this state.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Running | Self::Healthy)
    }

    /// Stable numeric code, used for the lifecycle gauge.
    pub fn as_code(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Healthy => 3,
            Self::Unhealthy => 4,
            Self::Restarting => 5,
            Self::Stopping => 6,
            Self::Stopped => 7,
            Self::Failed => 8,
        }
    }
}

impl fmt::Display for NodeLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Mutable bookkeeping the Supervisor keeps per admitted node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub state: NodeLifecycleState,
    /// Relaunches performed so far. Only reset by restarting the Supervisor.
    pub restart_count: u32,
    pub consecutive_failures: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_transition: DateTime<Utc>,
    /// Why the node last left a healthy state, if it did.
    pub last_error: Option<String>,
}

impl LifecycleRecord {
    /// Fresh record for a newly admitted node.
    pub fn new() -> Self {
        Self {
            state: NodeLifecycleState::Pending,
            restart_count: 0,
            consecutive_failures: 0,
            last_health_check: None,
            last_transition: Utc::now(),
            last_error: None,
        }
    }

    /// Move to `next` if the edge exists. Returns the previous state.
    pub fn transition(&mut self, next: NodeLifecycleState) -> Result<NodeLifecycleState, NodeLifecycleState> {
        if !self.state.can_transition_to(next) {
            return Err(self.state);
        }
        let previous = self.state;
        self.state = next;
        self.last_transition = Utc::now();
        Ok(previous)
    }
}

impl Default for LifecycleRecord {
    fn default() -> Self {
        Self::new()
    }
}
