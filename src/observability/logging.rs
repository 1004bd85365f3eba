//! # Structured Logging
//!
//! Subscriber setup plus a span macro for plugin operations. `RUST_LOG`
//! overrides the configured level when set.

use crate::config::ObservabilityConfig;
use crate::errors::{KeystashError, Result};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Create a tracing span around a call into a store or crypto plugin.
#[macro_export]
macro_rules! plugin_span {
    ($plugin:expr, $operation:expr) => {
        tracing::info_span!("plugin_operation", plugin = %$plugin, operation = %$operation)
    };
    ($plugin:expr, $operation:expr, $($field:tt)*) => {
        tracing::info_span!(
            "plugin_operation",
            plugin = %$plugin,
            operation = %$operation,
            $($field)*
        )
    };
}

/// Keeps the non-blocking file writer alive; dropping it flushes the log.
#[derive(Debug, Default)]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Build the subscriber described by `config` without installing it.
pub fn build_subscriber(
    config: &ObservabilityConfig,
) -> Result<(impl Subscriber + Send + Sync + 'static, LoggingGuard)> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| {
            KeystashError::config_with_source(
                format!("Invalid log level '{}'", config.log_level),
                Box::new(e),
            )
        })?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(if config.json_logging {
        fmt::layer().json().with_current_span(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    });

    let mut guard = LoggingGuard::default();
    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir).map_err(|e| {
            KeystashError::io(e, format!("Failed to create log directory {}", dir.display()))
        })?;
        let appender =
            tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt::layer().json().with_ansi(false).with_writer(writer).boxed());
        guard._file = Some(file_guard);
    }

    Ok((tracing_subscriber::registry().with(layers).with(filter), guard))
}

/// Install the global subscriber.
///
/// A second call (tests, embedded use) keeps the existing subscriber.
pub fn init_logging(config: &ObservabilityConfig) -> Result<LoggingGuard> {
    let (subscriber, guard) = build_subscriber(config)?;
    if subscriber.try_init().is_err() {
        tracing::debug!("Global subscriber already installed; keeping it");
    }
    Ok(guard)
}

/// Log configuration at startup
pub fn log_config_info(config: &crate::config::AppConfig) {
    tracing::info!(
        server_address = %config.server.bind_address(),
        database_url = %crate::storage::sanitize_url(&config.database.url),
        store_plugins = ?config.enabled_store_plugins(),
        crypto_plugins = ?config.enabled_crypto_plugins(),
        multiple_secret_stores = config.secretstore.enable_multiple_secret_stores,
        metrics_enabled = config.observability.enable_metrics,
        "keystash configuration"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_span_accepts_extra_fields() {
        let _span = plugin_span!("store_crypto", "store_secret");
        let _span = plugin_span!("kmip_plugin", "get_secret", key_uuid = "abc");
    }

    #[test]
    fn test_log_config_info() {
        log_config_info(&crate::config::AppConfig::default());
    }

    #[test]
    fn file_logging_writes_into_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let config = ObservabilityConfig { log_dir: Some(log_dir.clone()), ..Default::default() };

        let (subscriber, guard) = build_subscriber(&config).unwrap();
        assert!(log_dir.is_dir());
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "keystash", "file logging check");
        });
        drop(guard);

        let written: String = std::fs::read_dir(&log_dir)
            .unwrap()
            .map(|entry| std::fs::read_to_string(entry.unwrap().path()).unwrap())
            .collect();
        assert!(written.contains("file logging check"));
    }

    #[test]
    fn invalid_level_is_a_config_error() {
        let config = ObservabilityConfig {
            log_level: "keystash=notalevel".into(),
            ..Default::default()
        };
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(build_subscriber(&config).is_err());
        }
    }
}
