//! # Supervisor Configuration
//!
//! Process-wide runtime parameters. Per-node parameters live on
//! `NodeDescriptor`; this covers what applies to the whole fleet.
//!
//! All values have sane defaults with environment override capability.

use std::env;
use std::time::Duration;

use fleet_types::ConfigError;

/// Complete supervisor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Start every node whose dependencies are healthy at once instead of
    /// one at a time.
    pub parallel_launch: bool,
    /// How long `wait_for_healthy` waits for the whole fleet.
    pub ready_timeout: Duration,
    /// A subscription naming an unknown callback aborts the node's init
    /// instead of being dropped with a warning.
    pub strict_callbacks: bool,
    /// Do not deliver a node's own publications to its own subscriptions.
    pub suppress_self_delivery: bool,
    /// Upper bound for a dispatch task to notice shutdown.
    pub dispatch_poll_interval: Duration,
    /// Growth factor applied to `restart_delay` per attempt (>= 1.0).
    pub backoff_factor: f64,
    /// Cap for the grown restart delay.
    pub max_restart_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            parallel_launch: false,
            ready_timeout: Duration::from_secs(30),
            strict_callbacks: false,
            suppress_self_delivery: false,
            dispatch_poll_interval: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_restart_delay: Duration::from_secs(30),
        }
    }
}

impl SupervisorConfig {
    /// Load from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FLEET_PARALLEL_LAUNCH`: bool
    /// - `FLEET_READY_TIMEOUT`: seconds (fractional)
    /// - `FLEET_STRICT_CALLBACKS`: bool
    /// - `FLEET_SUPPRESS_SELF_DELIVERY`: bool
    /// - `FLEET_DISPATCH_POLL_MS`: milliseconds
    /// - `FLEET_BACKOFF_FACTOR`: float
    /// - `FLEET_MAX_RESTART_DELAY`: seconds (fractional)
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("FLEET_PARALLEL_LAUNCH") {
            config.parallel_launch = parse_flag(&val);
        }
        if let Some(secs) = env_f64("FLEET_READY_TIMEOUT") {
            config.ready_timeout = secs_to_duration(secs, config.ready_timeout);
        }
        if let Ok(val) = env::var("FLEET_STRICT_CALLBACKS") {
            config.strict_callbacks = parse_flag(&val);
        }
        if let Ok(val) = env::var("FLEET_SUPPRESS_SELF_DELIVERY") {
            config.suppress_self_delivery = parse_flag(&val);
        }
        if let Ok(ms) = env::var("FLEET_DISPATCH_POLL_MS") {
            if let Ok(ms) = ms.trim().parse::<u64>() {
                config.dispatch_poll_interval = Duration::from_millis(ms);
            }
        }
        if let Some(factor) = env_f64("FLEET_BACKOFF_FACTOR") {
            config.backoff_factor = factor;
        }
        if let Some(secs) = env_f64("FLEET_MAX_RESTART_DELAY") {
            config.max_restart_delay = secs_to_duration(secs, config.max_restart_delay);
        }

        config
    }

    /// Reject values the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::InvalidRuntime(format!(
                "backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if self.dispatch_poll_interval.is_zero() {
            return Err(ConfigError::InvalidRuntime(
                "dispatch_poll_interval must be positive".to_string(),
            ));
        }
        if self.ready_timeout.is_zero() {
            return Err(ConfigError::InvalidRuntime(
                "ready_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_f64(key: &str) -> Option<f64> {
    env::var(key).ok().and_then(|v| v.trim().parse::<f64>().ok())
}

fn secs_to_duration(secs: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SupervisorConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.strict_callbacks);
        assert!(!config.suppress_self_delivery);
        assert!(!config.parallel_launch);
    }

    #[test]
    fn test_shrinking_backoff_rejected() {
        let config = SupervisorConfig {
            backoff_factor: 0.5,
            ..SupervisorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRuntime(_))
        ));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = SupervisorConfig {
            dispatch_poll_interval: Duration::ZERO,
            ..SupervisorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_seconds_fall_back() {
        assert_eq!(
            secs_to_duration(-1.0, Duration::from_secs(3)),
            Duration::from_secs(3)
        );
        assert_eq!(
            secs_to_duration(0.25, Duration::from_secs(3)),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("yes"));
        assert!(!parse_flag("no"));
    }
}
