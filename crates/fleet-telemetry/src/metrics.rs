//! Prometheus metrics for the fleet runtime.
//!
//! All metrics follow the naming convention: `fleet_<component>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., bus_messages_published_total)
//! - **Gauge**: Value that can go up or down (e.g., node_lifecycle_state)
//! - **Histogram**: Distribution of values (e.g., callback_duration_seconds)
//!
//! Reliable and best-effort drops are separate series.

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // MESSAGE BUS METRICS
    // =========================================================================

    /// Messages accepted by the bus
    pub static ref BUS_MESSAGES_PUBLISHED: IntCounterVec = IntCounterVec::new(
        Opts::new("fleet_bus_messages_published_total", "Messages accepted by the bus"),
        &["topic"]
    ).expect("metric creation failed");

    /// Messages enqueued into a subscriber queue
    pub static ref BUS_MESSAGES_DELIVERED: IntCounterVec = IntCounterVec::new(
        Opts::new("fleet_bus_messages_delivered_total", "Messages enqueued for a subscriber"),
        &["topic", "subscriber"]
    ).expect("metric creation failed");

    /// Publishes refused by the bus
    pub static ref BUS_PUBLISH_REJECTED: IntCounterVec = IntCounterVec::new(
        Opts::new("fleet_bus_publish_rejected_total", "Publishes refused by the bus"),
        &["topic", "reason"]  // reason: undeclared/schema
    ).expect("metric creation failed");

    /// Messages dropped on best-effort subscriptions
    pub static ref BUS_DROPS_BEST_EFFORT: IntCounterVec = IntCounterVec::new(
        Opts::new("fleet_bus_best_effort_drops_total", "Messages dropped on best-effort queues"),
        &["topic", "subscriber"]
    ).expect("metric creation failed");

    /// Messages dropped on reliable subscriptions (hard queue-full)
    pub static ref BUS_DROPS_RELIABLE: IntCounterVec = IntCounterVec::new(
        Opts::new("fleet_bus_reliable_drops_total", "Messages dropped on full reliable queues"),
        &["topic", "subscriber"]
    ).expect("metric creation failed");

    /// keep_last evictions
    pub static ref BUS_KEEP_LAST_REPLACED: IntCounterVec = IntCounterVec::new(
        Opts::new("fleet_bus_keep_last_replaced_total", "Oldest entries evicted from keep_last queues"),
        &["topic", "subscriber"]
    ).expect("metric creation failed");

    // =========================================================================
    // NODE RUNTIME METRICS
    // =========================================================================

    /// Callback errors and panics caught by dispatch loops
    pub static ref CALLBACK_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("fleet_runtime_callback_failures_total", "Callback errors and panics"),
        &["node", "topic"]
    ).expect("metric creation failed");

    /// Callback execution time
    pub static ref CALLBACK_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "fleet_runtime_callback_duration_seconds",
            "Time spent inside subscriber callbacks"
        ).buckets(exponential_buckets(0.00001, 2.0, 18).expect("valid buckets"))
    ).expect("metric creation failed");

    // =========================================================================
    // SUPERVISOR METRICS
    // =========================================================================

    /// Relaunches performed
    pub static ref NODE_RESTARTS: IntCounterVec = IntCounterVec::new(
        Opts::new("fleet_supervisor_node_restarts_total", "Node relaunches"),
        &["node"]
    ).expect("metric creation failed");

    /// Failed health probes (including timeouts)
    pub static ref HEALTH_CHECK_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("fleet_supervisor_health_check_failures_total", "Failed health probes"),
        &["node"]
    ).expect("metric creation failed");

    /// Current lifecycle state code per node
    pub static ref NODE_LIFECYCLE_STATE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("fleet_supervisor_node_lifecycle_state", "Lifecycle state code (0=Pending .. 8=Failed)"),
        &["node"]
    ).expect("metric creation failed");
}

/// Handle for the registered collectors
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register all metrics with the global registry.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Bus
        Box::new(BUS_MESSAGES_PUBLISHED.clone()),
        Box::new(BUS_MESSAGES_DELIVERED.clone()),
        Box::new(BUS_PUBLISH_REJECTED.clone()),
        Box::new(BUS_DROPS_BEST_EFFORT.clone()),
        Box::new(BUS_DROPS_RELIABLE.clone()),
        Box::new(BUS_KEEP_LAST_REPLACED.clone()),
        // Runtime
        Box::new(CALLBACK_FAILURES.clone()),
        Box::new(CALLBACK_DURATION.clone()),
        // Supervisor
        Box::new(NODE_RESTARTS.clone()),
        Box::new(HEALTH_CHECK_FAILURES.clone()),
        Box::new(NODE_LIFECYCLE_STATE.clone()),
    ];

    for metric in metrics {
        REGISTRY
            .register(metric)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics() {
        // May fail if already registered by another test, which is fine
        let _ = register_metrics();
    }

    #[test]
    fn test_reliable_and_best_effort_are_separate() {
        let before = BUS_DROPS_BEST_EFFORT
            .with_label_values(&["metrics.test", "sub"])
            .get();
        BUS_DROPS_RELIABLE
            .with_label_values(&["metrics.test", "sub"])
            .inc();
        let after = BUS_DROPS_BEST_EFFORT
            .with_label_values(&["metrics.test", "sub"])
            .get();
        assert_eq!(before, after);
        assert!(
            BUS_DROPS_RELIABLE
                .with_label_values(&["metrics.test", "sub"])
                .get()
                >= 1
        );
    }

    #[test]
    fn test_gauge_set() {
        NODE_LIFECYCLE_STATE.with_label_values(&["gauge-test"]).set(3);
        assert_eq!(NODE_LIFECYCLE_STATE.with_label_values(&["gauge-test"]).get(), 3);
    }

    #[test]
    fn test_histogram_timer() {
        let _timer = HistogramTimer::new(&CALLBACK_DURATION);
        std::thread::sleep(std::time::Duration::from_millis(1));
        // Timer observes on drop
    }
}
