//! Prometheus metrics for the forward-auth service.
//!
//! Provides metrics for:
//! - Authorization decisions by outcome
//! - Session store operations and the cluster session cache
//! - Session garbage collection
//! - Access review latency

#[cfg(feature = "prometheus")]
use std::sync::OnceLock;

#[cfg(feature = "prometheus")]
use metrics::{counter, gauge, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::MetricsConfig;

/// Global Prometheus handle for the metrics endpoint.
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the metrics system with the given configuration.
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
            &seconds_from_ms(&config.latency_buckets_ms),
        )
        .map_err(|e| MetricsError::Setup(e.to_string()))?
        .install_recorder()
        .map_err(MetricsError::Install)?;

    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::Setup("Metrics already initialized".to_string()))?;

    Ok(())
}

/// Initialize the metrics system (no-op without prometheus feature).
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(_config: &MetricsConfig) -> Result<(), MetricsError> {
    Ok(())
}

#[cfg(feature = "prometheus")]
fn seconds_from_ms(ms_buckets: &[f64]) -> Vec<f64> {
    ms_buckets.iter().map(|ms| ms / 1000.0).collect()
}

/// Get the Prometheus handle for rendering metrics.
#[cfg(feature = "prometheus")]
pub fn get_prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render the current metrics in Prometheus text format, if initialized.
pub fn render() -> Option<String> {
    #[cfg(feature = "prometheus")]
    {
        get_prometheus_handle().map(|handle| handle.render())
    }
    #[cfg(not(feature = "prometheus"))]
    {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric Recording Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Record an authorization decision (`bypass`, `allowed`, `begin_auth`,
/// `forbidden`, `unavailable`).
pub fn record_decision(outcome: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("forward_auth_decisions_total", "outcome" => outcome.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = outcome;
    }
}

/// Record a session store operation and its result label.
pub fn record_session_operation(backend: &str, operation: &str, result: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!(
            "forward_auth_session_operations_total",
            "backend" => backend.to_string(),
            "operation" => operation.to_string(),
            "result" => result.to_string()
        )
        .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (backend, operation, result);
    }
}

/// Record a cluster session cache lookup (`hit`, `stale`, `miss`).
pub fn record_session_cache_lookup(result: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("forward_auth_session_cache_total", "result" => result.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = result;
    }
}

/// Record a completed garbage collection cycle.
pub fn record_gc_cycle(scanned: usize, deleted: usize, failed: usize, malformed: usize) {
    #[cfg(feature = "prometheus")]
    {
        gauge!("forward_auth_gc_scanned_objects").set(scanned as f64);
        counter!("forward_auth_gc_deleted_total").increment(deleted as u64);
        if failed > 0 {
            counter!("forward_auth_gc_errors_total", "stage" => "delete").increment(failed as u64);
        }
        if malformed > 0 {
            counter!("forward_auth_gc_errors_total", "stage" => "decode")
                .increment(malformed as u64);
        }
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (scanned, deleted, failed, malformed);
    }
}

/// Record a garbage collection cycle that could not list objects.
pub fn record_gc_error() {
    #[cfg(feature = "prometheus")]
    {
        counter!("forward_auth_gc_errors_total", "stage" => "list").increment(1);
    }
}

/// Record an access review call (`allowed`, `forbidden`, `error`).
pub fn record_access_review(result: &str, duration_secs: f64) {
    #[cfg(feature = "prometheus")]
    {
        histogram!(
            "forward_auth_access_review_duration_seconds",
            "result" => result.to_string()
        )
        .record(duration_secs);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (result, duration_secs);
    }
}

/// Metrics initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to set up metrics: {0}")]
    Setup(String),

    #[cfg(feature = "prometheus")]
    #[error("Failed to install metrics recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}
