//! # Node Descriptors
//!
//! Static description of every node in the fleet, handed over by the
//! configuration collaborator as already-validated data.
//!
//! ## Ownership
//!
//! - Loaded once at startup and owned by the Supervisor.
//! - Never mutated after load, except for a single [`NodeDescriptor::merge_overrides`]
//!   performed before launch.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};

use crate::errors::ConfigError;

/// Node name, unique within a fleet.
pub type NodeName = String;

/// Default number of restarts allowed under `on_failure`.
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Default delay before a relaunch.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Default bound on `Node::init`.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on `Node::shutdown` before the task is aborted.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// POLICY ENUMS
// =============================================================================

/// Launch priority class. Used to break ties in the startup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

/// Rule governing whether and how often a crashed node is relaunched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Restart unconditionally. `max_restarts` is advisory and only logged.
    Always,
    /// Restart until the counter reaches `max_restarts`, then fail.
    OnFailure,
    /// Any crash is permanent.
    Never,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::OnFailure
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::OnFailure => write!(f, "on_failure"),
            Self::Never => write!(f, "never"),
        }
    }
}

// =============================================================================
// HEALTH CHECK SPEC
// =============================================================================

/// Periodic health probing parameters.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckSpec {
    /// When false the node is considered healthy as soon as it is running.
    pub enabled: bool,
    /// Time between two probes.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub interval: Duration,
    /// A probe that takes longer than this counts as a failure.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub timeout: Duration,
    /// Consecutive failures required to mark the node unhealthy.
    pub failure_threshold: u32,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            failure_threshold: 3,
        }
    }
}

impl HealthCheckSpec {
    /// A spec with probing turned off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

// =============================================================================
// NODE DESCRIPTOR
// =============================================================================

/// Immutable description of one node.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique key.
    pub name: NodeName,
    /// Disabled nodes are never admitted.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "default_restart_delay")]
    pub restart_delay: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
    /// Names or capabilities that must be running before this node starts.
    #[serde(default)]
    pub requires: BTreeSet<String>,
    /// Capabilities this node satisfies for others' `requires`.
    #[serde(default)]
    pub provides: BTreeSet<String>,
    /// Soft ordering hints; never block startup when absent.
    #[serde(default)]
    pub optional: BTreeSet<String>,
    /// Nodes that must not be enabled alongside this one.
    #[serde(default)]
    pub conflicts: BTreeSet<String>,
    #[serde(default)]
    pub health_check: HealthCheckSpec,
    /// Run the node's main loop on a dedicated worker instead of the shared pool.
    #[serde(default)]
    pub isolated: bool,
    /// Environment handed to the node at init.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    DEFAULT_MAX_RESTARTS
}

fn default_restart_delay() -> Duration {
    DEFAULT_RESTART_DELAY
}

fn default_startup_timeout() -> Duration {
    DEFAULT_STARTUP_TIMEOUT
}

fn default_shutdown_timeout() -> Duration {
    DEFAULT_SHUTDOWN_TIMEOUT
}

impl NodeDescriptor {
    /// Create a descriptor with defaults for everything but the name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            priority: Priority::default(),
            restart_policy: RestartPolicy::default(),
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_delay: DEFAULT_RESTART_DELAY,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            requires: BTreeSet::new(),
            provides: BTreeSet::new(),
            optional: BTreeSet::new(),
            conflicts: BTreeSet::new(),
            health_check: HealthCheckSpec::default(),
            isolated: false,
            environment: BTreeMap::new(),
        }
    }

    /// Set the priority class.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the restart policy and budget.
    pub fn with_restart(mut self, policy: RestartPolicy, max_restarts: u32) -> Self {
        self.restart_policy = policy;
        self.max_restarts = max_restarts;
        self
    }

    /// Set the delay applied before each relaunch.
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Set startup and shutdown bounds.
    pub fn with_timeouts(mut self, startup: Duration, shutdown: Duration) -> Self {
        self.startup_timeout = startup;
        self.shutdown_timeout = shutdown;
        self
    }

    /// Add hard dependencies.
    pub fn requires<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Add provided capabilities.
    pub fn provides<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provides.extend(caps.into_iter().map(Into::into));
        self
    }

    /// Add soft ordering hints.
    pub fn optional<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Add conflicting nodes.
    pub fn conflicts_with<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conflicts.extend(names.into_iter().map(Into::into));
        self
    }

    /// Replace the health-check spec.
    pub fn with_health_check(mut self, spec: HealthCheckSpec) -> Self {
        self.health_check = spec;
        self
    }

    /// Add one environment entry.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Mark the node as disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Reject descriptors the Supervisor cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidDescriptor {
                node: self.name.clone(),
                reason: "name must not be empty".to_string(),
            });
        }
        if self.health_check.enabled && self.health_check.failure_threshold == 0 {
            return Err(ConfigError::InvalidDescriptor {
                node: self.name.clone(),
                reason: "health_check.failure_threshold must be at least 1".to_string(),
            });
        }
        if self.health_check.enabled && self.health_check.interval.is_zero() {
            return Err(ConfigError::InvalidDescriptor {
                node: self.name.clone(),
                reason: "health_check.interval must be positive".to_string(),
            });
        }
        if self.requires.contains(&self.name) {
            return Err(ConfigError::InvalidDescriptor {
                node: self.name.clone(),
                reason: "a node cannot require itself".to_string(),
            });
        }
        Ok(())
    }

    /// Apply operator overrides. The Supervisor calls this once, before launch.
    pub fn merge_overrides(&mut self, overrides: &NodeOverrides) {
        if let Some(enabled) = overrides.enabled {
            self.enabled = enabled;
        }
        if let Some(priority) = overrides.priority {
            self.priority = priority;
        }
        if let Some(policy) = overrides.restart_policy {
            self.restart_policy = policy;
        }
        if let Some(max) = overrides.max_restarts {
            self.max_restarts = max;
        }
        if let Some(delay) = overrides.restart_delay {
            self.restart_delay = delay;
        }
        if let Some(timeout) = overrides.startup_timeout {
            self.startup_timeout = timeout;
        }
        if let Some(timeout) = overrides.shutdown_timeout {
            self.shutdown_timeout = timeout;
        }
        if let Some(spec) = &overrides.health_check {
            self.health_check = spec.clone();
        }
        self.environment.extend(
            overrides
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }
}

/// Per-node override layer merged into a descriptor before launch.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeOverrides {
    pub enabled: Option<bool>,
    pub priority: Option<Priority>,
    pub restart_policy: Option<RestartPolicy>,
    pub max_restarts: Option<u32>,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub restart_delay: Option<Duration>,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub startup_timeout: Option<Duration>,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub shutdown_timeout: Option<Duration>,
    pub health_check: Option<HealthCheckSpec>,
    pub environment: BTreeMap<String, String>,
}
