//! # Observability Infrastructure
//!
//! Structured logging and Prometheus metrics for keystash.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, log_config_info, LoggingGuard};
pub use metrics::{init_metrics, MetricsRecorder};

use crate::config::ObservabilityConfig;
use crate::errors::Result;
use ::tracing::info;

/// Initialize logging and, when enabled, the metrics exporter.
///
/// The returned guard flushes the file appender and must live until exit.
pub async fn init_observability(config: &ObservabilityConfig) -> Result<LoggingGuard> {
    let guard = init_logging(config)?;

    if config.enable_metrics {
        init_metrics(config).await?;
    }

    info!(
        service_name = %config.service_name,
        log_level = %config.log_level,
        json_logging = config.json_logging,
        metrics_enabled = config.enable_metrics,
        "Observability initialized"
    );

    Ok(guard)
}
