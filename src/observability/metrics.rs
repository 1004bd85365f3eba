//! # Metrics Collection
//!
//! Prometheus metrics for keystash. Until [`init_metrics`] installs the
//! exporter the `metrics` facade discards every sample, so recording is
//! always safe.

use crate::config::ObservabilityConfig;
use crate::errors::{KeystashError, Result};
use ::tracing::{info, warn};
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;

static EXPORTER_INSTALLED: OnceCell<SocketAddr> = OnceCell::new();

/// Records keystash metrics through the global `metrics` recorder
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    pub fn new() -> Self {
        Self
    }

    /// Record an HTTP request
    pub fn record_http_request(&self, method: &str, route: &str, status: u16, duration: f64) {
        let labels = [
            ("method", method.to_string()),
            ("route", route.to_string()),
            ("status", status.to_string()),
        ];
        counter!("keystash_http_requests_total", &labels).increment(1);
        histogram!("keystash_http_request_duration_seconds", &labels[..2]).record(duration);
    }

    /// Record a call into a secret store plugin
    pub fn record_store_operation(&self, plugin: &str, operation: &str, success: bool) {
        let status = if success { "success" } else { "error" };
        let labels = [
            ("plugin", plugin.to_string()),
            ("operation", operation.to_string()),
            ("status", status.to_string()),
        ];
        counter!("keystash_store_operations_total", &labels).increment(1);
    }

    /// Record a call into a crypto plugin
    pub fn record_crypto_operation(&self, plugin: &str, operation: &str, duration: f64) {
        let labels = [("plugin", plugin.to_string()), ("operation", operation.to_string())];
        counter!("keystash_crypto_operations_total", &labels).increment(1);
        histogram!("keystash_crypto_operation_duration_seconds", &labels).record(duration);
    }

    pub fn record_kek_cache_hit(&self) {
        counter!("keystash_pkek_cache_hits_total").increment(1);
    }

    pub fn record_kek_cache_miss(&self) {
        counter!("keystash_pkek_cache_misses_total").increment(1);
    }

    /// `reason` is `expired`, `capacity`, `invalidated` or `cleared`
    pub fn record_kek_cache_eviction(&self, reason: &'static str, count: usize) {
        counter!("keystash_pkek_cache_evictions_total", "reason" => reason).increment(count as u64);
    }

    pub fn set_kek_cache_size(&self, size: usize) {
        gauge!("keystash_pkek_cache_entries").set(size as f64);
    }

    /// Record a project KEK bound by a crypto plugin
    pub fn record_kek_bound(&self, plugin: &str) {
        let labels = [("plugin", plugin.to_string())];
        counter!("keystash_project_keks_bound_total", &labels).increment(1);
    }

    /// Record a request/response exchange with an external key manager
    pub fn record_backend_request(&self, backend: &str, operation: &str, duration: f64, ok: bool) {
        let status = if ok { "success" } else { "error" };
        let labels = [
            ("backend", backend.to_string()),
            ("operation", operation.to_string()),
            ("status", status.to_string()),
        ];
        counter!("keystash_backend_requests_total", &labels).increment(1);
        histogram!("keystash_backend_request_duration_seconds", &labels[..2]).record(duration);
    }

    /// Update database connection gauge
    pub fn update_db_connections(&self, active: u32) {
        gauge!("keystash_db_connections_active").set(active as f64);
    }

    /// Describe metrics so Prometheus exports them before the first event.
    pub fn register_descriptions(&self) {
        describe_counter!("keystash_http_requests_total", Unit::Count, "HTTP requests served");
        describe_histogram!(
            "keystash_http_request_duration_seconds",
            Unit::Seconds,
            "HTTP request latency"
        );
        describe_counter!(
            "keystash_store_operations_total",
            Unit::Count,
            "Secret store plugin operations by outcome"
        );
        describe_counter!(
            "keystash_crypto_operations_total",
            Unit::Count,
            "Crypto plugin operations"
        );
        describe_histogram!(
            "keystash_crypto_operation_duration_seconds",
            Unit::Seconds,
            "Crypto plugin operation latency"
        );
        describe_counter!(
            "keystash_pkek_cache_hits_total",
            Unit::Count,
            "Project KEK cache hits"
        );
        describe_counter!(
            "keystash_pkek_cache_misses_total",
            Unit::Count,
            "Project KEK cache misses"
        );
        describe_counter!(
            "keystash_pkek_cache_evictions_total",
            Unit::Count,
            "Project KEKs evicted by TTL or capacity"
        );
        describe_gauge!(
            "keystash_pkek_cache_entries",
            Unit::Count,
            "Unwrapped project KEKs currently cached"
        );
        describe_counter!(
            "keystash_project_keks_bound_total",
            Unit::Count,
            "Project KEKs generated and bound"
        );
        describe_counter!(
            "keystash_backend_requests_total",
            Unit::Count,
            "Requests to KMIP devices and Dogtag KRAs"
        );
        describe_histogram!(
            "keystash_backend_request_duration_seconds",
            Unit::Seconds,
            "External key manager latency"
        );
        describe_gauge!(
            "keystash_db_connections_active",
            Unit::Count,
            "Active database connections"
        );
    }
}

/// Install the Prometheus exporter with its own HTTP listener.
pub async fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let metrics_addr = match config.metrics_bind_address() {
        Some(addr) => addr,
        None => {
            warn!("Metrics disabled: no bind address configured");
            return Ok(());
        }
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        KeystashError::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    if let Some(existing) = EXPORTER_INSTALLED.get() {
        warn!(%existing, "Metrics exporter already installed");
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| {
            KeystashError::config(format!("Failed to initialize metrics exporter: {}", e))
        })?;
    let _ = EXPORTER_INSTALLED.set(socket_addr);

    MetricsRecorder::new().register_descriptions();

    info!(
        metrics_addr = %metrics_addr,
        service_name = %config.service_name,
        "Metrics collection initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_exporter_is_a_no_op() {
        let recorder = MetricsRecorder::new();
        recorder.record_http_request("POST", "/v1/secrets", 201, 0.012);
        recorder.record_store_operation("store_crypto", "store_secret", true);
        recorder.record_crypto_operation("simple_crypto", "encrypt", 0.0004);
        recorder.record_kek_cache_hit();
        recorder.record_kek_cache_miss();
        recorder.record_kek_cache_eviction("expired", 2);
        recorder.set_kek_cache_size(3);
        recorder.record_kek_bound("p11_crypto");
        recorder.record_backend_request("kmip", "Get", 0.2, false);
        recorder.update_db_connections(4);
        recorder.register_descriptions();
    }

    #[tokio::test]
    async fn disabled_metrics_do_not_install() {
        let config = ObservabilityConfig { enable_metrics: false, ..Default::default() };
        assert!(init_metrics(&config).await.is_ok());
        assert!(EXPORTER_INSTALLED.get().is_none());
    }
}
