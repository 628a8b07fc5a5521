//! # Fleet Runtime
//!
//! Runs the demo voice pipeline under the node supervisor.
//!
//! ## Startup Sequence
//!
//! 1. Initialise telemetry (`FLEET_LOG_LEVEL`, `FLEET_JSON_LOGS`, ...)
//! 2. Load and validate `SupervisorConfig` from `FLEET_*` variables
//! 3. Admit the demo fleet, merge overrides from `FLEET_OVERRIDES_FILE`
//! 4. Launch in dependency order and wait for readiness
//! 5. Run until Ctrl+C, then stop in reverse order

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use fleet_runtime::{demo, NodeSupervisor, SupervisorConfig};
use fleet_telemetry::{encode_metrics, init_telemetry, TelemetryConfig};
use fleet_types::NodeOverrides;

/// Read a JSON map of node name to overrides.
fn load_overrides(path: &Path) -> Result<BTreeMap<String, NodeOverrides>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading overrides from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing overrides in {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry =
        init_telemetry(TelemetryConfig::from_env()).context("initialising telemetry")?;

    let config = SupervisorConfig::from_env();
    config.validate().context("invalid supervisor configuration")?;
    info!(?config, "Fleet runtime starting");

    let supervisor = NodeSupervisor::new(config);
    for spec in demo::fleet() {
        let name = spec.name().to_string();
        supervisor
            .admit(spec)
            .with_context(|| format!("admitting node '{name}'"))?;
    }

    if let Ok(path) = std::env::var("FLEET_OVERRIDES_FILE") {
        let overrides = load_overrides(Path::new(&path))?;
        supervisor
            .apply_overrides(&overrides)
            .context("applying node overrides")?;
        info!(nodes = overrides.len(), "Overrides applied");
    }

    supervisor.launch_all().await.context("launching fleet")?;

    match supervisor.wait_for_healthy().await {
        Ok(()) => info!("Fleet is running. Press Ctrl+C to stop."),
        Err(e) => {
            warn!(error = %e, "Fleet started degraded");
            for (node, reason) in supervisor.failed_nodes() {
                error!(node = %node, reason = reason.as_deref().unwrap_or("unknown"), "Node failed");
            }
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;

    supervisor.shutdown().await;

    for status in supervisor.snapshot() {
        info!(
            node = %status.name,
            state = %status.state,
            restarts = status.restart_count,
            "Final node state"
        );
    }
    match encode_metrics() {
        Ok(text) => info!(bytes = text.len(), "Metrics snapshot encoded"),
        Err(e) => warn!(error = %e, "Metrics unavailable"),
    }
    Ok(())
}
