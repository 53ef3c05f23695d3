//! Metrics initialization for Prometheus exporter.

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;
use crate::error::{Error, Result};

/// Bypasses granted, labelled by `kind` (`timed` or `emergency`).
pub const BYPASSES_GRANTED: &str = "focusgate_bypasses_granted_total";

/// Timed bypasses that ran out, by wake-up or on a status check.
pub const BYPASSES_EXPIRED: &str = "focusgate_bypasses_expired_total";

/// Bypasses ended early by an explicit cancel.
pub const BYPASSES_CANCELLED: &str = "focusgate_bypasses_cancelled_total";

/// Initialize the metrics system based on configuration.
///
/// When metrics are enabled, this starts an HTTP server that exposes
/// a `/metrics` endpoint for Prometheus to scrape.
///
/// When metrics are disabled, this is a no-op. The `metrics` crate
/// handles unregistered metrics gracefully (they become no-ops).
pub fn init(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|err| Error::Metrics(err.to_string()))?;

    ::metrics::describe_counter!(BYPASSES_GRANTED, "Bypasses granted");
    ::metrics::describe_counter!(BYPASSES_EXPIRED, "Timed bypasses expired");
    ::metrics::describe_counter!(BYPASSES_CANCELLED, "Bypasses cancelled");

    Ok(())
}
