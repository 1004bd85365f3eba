//! # Configuration Settings
//!
//! Defines the configuration structure for keystash. Plugin sections live in
//! [`super::plugins`]; this module holds the top-level document plus the
//! server, database and observability sections.

use super::plugins::{
    CryptoConfig, DogtagConfig, KmipConfig, NamedStoreConfig, P11CryptoConfig,
    SecretStoreConfig, SimpleCryptoConfig,
};
use crate::errors::{KeystashError, Result};
use crate::plugin::{P11_CRYPTO, SIMPLE_CRYPTO};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub database: DatabaseConfig,

    #[validate(nested)]
    pub observability: ObservabilityConfig,

    /// `[secretstore]`: which store plugins are enabled
    #[validate(nested)]
    pub secretstore: SecretStoreConfig,

    /// `[crypto]`: which crypto plugins back the `store_crypto` adapter
    #[validate(nested)]
    pub crypto: CryptoConfig,

    #[validate(nested)]
    pub simple_crypto_plugin: SimpleCryptoConfig,

    #[validate(nested)]
    pub p11_crypto_plugin: P11CryptoConfig,

    #[validate(nested)]
    pub kmip_plugin: KmipConfig,

    #[validate(nested)]
    pub dogtag_plugin: DogtagConfig,

    /// `[secretstore:<suffix>]` sections, resolved by the loader.
    #[serde(skip)]
    pub secret_stores: Vec<NamedStoreConfig>,
}

impl AppConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(KeystashError::from)?;
        self.validate_custom()?;
        Ok(())
    }

    /// Cross-section checks the derive rules cannot express
    fn validate_custom(&self) -> Result<()> {
        if !self.database.url.starts_with("sqlite:") {
            return Err(KeystashError::validation_field(
                "Database URL must start with 'sqlite:'",
                "database.url",
            ));
        }

        if self.observability.enable_metrics && self.observability.metrics_port == self.server.port
        {
            return Err(KeystashError::validation(
                "Server and metrics ports cannot be the same",
            ));
        }

        let crypto_plugins = self.enabled_crypto_plugins();
        if crypto_plugins.iter().any(|name| name == SIMPLE_CRYPTO) {
            self.simple_crypto_plugin.decoded_kek()?;
        }
        if crypto_plugins.iter().any(|name| name == P11_CRYPTO) {
            self.p11_crypto_plugin.require_labels()?;
        }

        self.secretstore.validate_sections(&self.secret_stores)?;

        Ok(())
    }

    /// Crypto plugins that must be loaded: the `[crypto]` list plus any
    /// named by a `[secretstore:<suffix>]` section.
    pub fn enabled_crypto_plugins(&self) -> Vec<String> {
        let mut names = self.crypto.enabled_crypto_plugins.clone();
        if self.secretstore.enable_multiple_secret_stores {
            for store in &self.secret_stores {
                if let Some(crypto) = &store.section.crypto_plugin {
                    if !names.contains(crypto) {
                        names.push(crypto.clone());
                    }
                }
            }
        }
        names
    }

    /// Secret store plugins that must be loaded, in configured order.
    pub fn enabled_store_plugins(&self) -> Vec<String> {
        if self.secretstore.enable_multiple_secret_stores {
            let mut names: Vec<String> = Vec::new();
            for store in &self.secret_stores {
                if !names.contains(&store.section.secret_store_plugin) {
                    names.push(store.section.secret_store_plugin.clone());
                }
            }
            names
        } else {
            self.secretstore.enabled_secretstore_plugins.clone()
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    #[validate(length(min = 1, message = "Host cannot be empty"))]
    pub host: String,

    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    #[validate(range(min = 1, max = 300, message = "Timeout must be between 1 and 300 seconds"))]
    pub request_timeout_seconds: u64,

    /// Maximum request body size in bytes
    #[validate(range(min = 1024, message = "Max body size must be at least 1KB"))]
    pub max_body_size: usize,

    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9311,
            request_timeout_seconds: 30,
            max_body_size: 64 * 1024,
            enable_cors: false,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DatabaseConfig {
    #[validate(length(min = 1, message = "Database URL cannot be empty"))]
    pub url: String,

    #[validate(range(min = 1, max = 100, message = "Max connections must be between 1 and 100"))]
    pub max_connections: u32,

    #[validate(range(max = 50, message = "Min connections must be between 0 and 50"))]
    pub min_connections: u32,

    #[validate(range(
        min = 1,
        max = 60,
        message = "Connect timeout must be between 1 and 60 seconds"
    ))]
    pub connect_timeout_seconds: u64,

    /// Idle timeout in seconds (0 = no timeout)
    pub idle_timeout_seconds: u64,

    /// Run pending migrations on startup
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/keystash.db".to_string(),
            max_connections: 10,
            min_connections: 0,
            connect_timeout_seconds: 10,
            idle_timeout_seconds: 600,
            auto_migrate: true,
        }
    }
}

impl DatabaseConfig {
    /// In-memory database on a single shared connection, for tests.
    pub fn in_memory() -> Self {
        Self { url: "sqlite::memory:".to_string(), max_connections: 1, ..Self::default() }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Idle timeout as Duration (None if 0)
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_seconds))
        }
    }

    /// Every connection to `:memory:` is its own database
    pub fn is_memory(&self) -> bool {
        self.url.contains(":memory:")
    }
}

/// Logging and metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level or `EnvFilter` directive; `RUST_LOG` wins when set
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    pub json_logging: bool,

    /// Directory for a daily-rolling JSON log file
    pub log_dir: Option<PathBuf>,

    pub enable_metrics: bool,

    #[validate(range(min = 1, max = 65535, message = "Metrics port must be between 1 and 65535"))]
    pub metrics_port: u16,

    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: false,
            log_dir: None,
            enable_metrics: false,
            metrics_port: 9464,
            service_name: "keystash".to_string(),
        }
    }
}

impl ObservabilityConfig {
    /// Metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.enable_metrics {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::plugins::StoreSectionConfig;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.enabled_store_plugins(), vec!["store_crypto".to_string()]);
        assert_eq!(config.enabled_crypto_plugins(), vec!["simple_crypto".to_string()]);
    }

    #[test]
    fn rejects_non_sqlite_database() {
        let mut config = AppConfig::default();
        config.database.url = "postgresql://localhost/keystash".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sqlite"));
    }

    #[test]
    fn rejects_port_clash_with_metrics() {
        let mut config = AppConfig::default();
        config.observability.enable_metrics = true;
        config.observability.metrics_port = config.server.port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_host() {
        let mut config = AppConfig::default();
        config.server.host.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("server.host"));
    }

    #[test]
    fn p11_requires_labels_only_when_enabled() {
        let mut config = AppConfig::default();
        config.crypto.enabled_crypto_plugins = vec!["p11_crypto".to_string()];
        assert!(config.validate().is_err());

        config.p11_crypto_plugin.mkek_label = Some("mkek".to_string());
        config.p11_crypto_plugin.hmac_label = Some("hmac".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn multiple_stores_drive_plugin_lists() {
        let mut config = AppConfig::default();
        config.secretstore.enable_multiple_secret_stores = true;
        config.secretstore.stores_lookup_suffix = vec!["software".into(), "hsm".into()];
        config.p11_crypto_plugin.mkek_label = Some("mkek".to_string());
        config.p11_crypto_plugin.hmac_label = Some("hmac".to_string());
        config.secret_stores = vec![
            NamedStoreConfig {
                name: "software".into(),
                section: StoreSectionConfig {
                    secret_store_plugin: "store_crypto".into(),
                    crypto_plugin: Some("simple_crypto".into()),
                    global_default: true,
                },
            },
            NamedStoreConfig {
                name: "hsm".into(),
                section: StoreSectionConfig {
                    secret_store_plugin: "store_crypto".into(),
                    crypto_plugin: Some("p11_crypto".into()),
                    global_default: false,
                },
            },
        ];

        assert!(config.validate().is_ok());
        assert_eq!(config.enabled_store_plugins(), vec!["store_crypto".to_string()]);
        assert_eq!(
            config.enabled_crypto_plugins(),
            vec!["simple_crypto".to_string(), "p11_crypto".to_string()]
        );
    }
}
