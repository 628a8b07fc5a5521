//! # Fleet Telemetry
//!
//! Observability for the fleet runtime.
//!
//! ## Components
//!
//! - **Logs**: `tracing-subscriber` with env filter, pretty or JSON output
//! - **Metrics**: Prometheus counters and gauges for the bus and the supervisor
//! - **Events**: the [`EventSink`] interface the core reports lifecycle and
//!   delivery events through
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fleet_telemetry::{TelemetryConfig, init_telemetry};
//!
//! let config = TelemetryConfig::from_env();
//! let _guard = init_telemetry(config).expect("Failed to init telemetry");
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FLEET_SERVICE_NAME` | `fleet-runtime` | Service name in logs |
//! | `FLEET_LOG_LEVEL` | `info` | Log level filter |
//! | `FLEET_JSON_LOGS` | `false` | JSON formatted output |
//! | `FLEET_CONSOLE_OUTPUT` | `true` | Write logs to stdout |
//! | `FLEET_METRICS` | `true` | Register Prometheus collectors |

mod config;
mod events;
mod metrics;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use events::{DynEventSink, EventKind, EventSink, MemorySink, RecordedEvent, TracingSink};
pub use metrics::{
    encode_metrics, register_metrics, HistogramTimer, MetricsHandle, BUS_DROPS_BEST_EFFORT,
    BUS_DROPS_RELIABLE, BUS_KEEP_LAST_REPLACED, BUS_MESSAGES_DELIVERED, BUS_MESSAGES_PUBLISHED,
    BUS_PUBLISH_REJECTED, CALLBACK_DURATION, CALLBACK_FAILURES, HEALTH_CHECK_FAILURES,
    NODE_LIFECYCLE_STATE, NODE_RESTARTS,
};
pub use tracing_setup::init_tracing;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracerInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and metrics.
///
/// Returns a guard that must be held for the lifetime of the application.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    if config.service_name.trim().is_empty() {
        return Err(TelemetryError::Config("service name is empty".to_string()));
    }

    // Initialize metrics first (synchronous)
    let metrics = if config.metrics_enabled {
        Some(register_metrics()?)
    } else {
        None
    };

    tracing_setup::init_tracing(&config)?;

    Ok(TelemetryGuard {
        service_name: config.service_name,
        _metrics: metrics,
    })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    service_name: String,
    _metrics: Option<MetricsHandle>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!(service = %self.service_name, "Shutting down telemetry...");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_service_name_rejected() {
        let config = TelemetryConfig {
            service_name: " ".to_string(),
            ..TelemetryConfig::default()
        };
        assert!(matches!(init_telemetry(config), Err(TelemetryError::Config(_))));
    }
}
