//! # Configuration Management
//!
//! Configuration is layered with the `config` crate:
//!
//! 1. built-in defaults ([`AppConfig::default`])
//! 2. an optional file (TOML, INI or YAML, chosen by extension)
//! 3. `KEYSTASH__<SECTION>__<KEY>` environment variables
//!
//! `[secretstore:<suffix>]` sections cannot be addressed as config paths, so
//! they are read from the merged root table after the typed pass.

pub mod plugins;
pub mod secret_string;
pub mod settings;

pub use plugins::{
    CryptoConfig, DogtagConfig, KmipConfig, NamedStoreConfig, P11CryptoConfig,
    SecretStoreConfig, SimpleCryptoConfig, StoreSectionConfig,
};
pub use secret_string::SecretString;
pub use settings::{AppConfig, DatabaseConfig, ObservabilityConfig, ServerConfig};

use crate::errors::{KeystashError, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "KEYSTASH";

impl AppConfig {
    /// Load, resolve store sections and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(KeystashError::config(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let merged = builder.build()?;
        let mut app: AppConfig = merged.clone().try_deserialize()?;
        app.secret_stores = load_store_sections(&merged, &app.secretstore)?;
        app.validate()?;

        debug!(
            store_plugins = ?app.enabled_store_plugins(),
            crypto_plugins = ?app.enabled_crypto_plugins(),
            "Configuration loaded"
        );

        Ok(app)
    }

    /// Effective configuration as TOML with credentials redacted.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut rendered = toml::to_string_pretty(self).map_err(|e| {
            KeystashError::internal_with_source("Failed to render configuration", Box::new(e))
        })?;

        for store in &self.secret_stores {
            let section = toml::to_string_pretty(&store.section).map_err(|e| {
                KeystashError::internal_with_source("Failed to render store section", Box::new(e))
            })?;
            rendered.push_str(&format!("\n[\"secretstore:{}\"]\n{}", store.name, section));
        }

        Ok(rendered)
    }
}

fn load_store_sections(
    merged: &config::Config,
    secretstore: &SecretStoreConfig,
) -> Result<Vec<NamedStoreConfig>> {
    if !secretstore.enable_multiple_secret_stores {
        return Ok(Vec::new());
    }

    let root: HashMap<String, config::Value> = merged.clone().try_deserialize()?;
    let mut sections = Vec::with_capacity(secretstore.stores_lookup_suffix.len());

    for suffix in &secretstore.stores_lookup_suffix {
        let key = format!("secretstore:{}", suffix);
        let Some(value) = root.get(&key) else {
            // reported by validate_sections with the suffix name
            continue;
        };
        let section: StoreSectionConfig = value.clone().try_deserialize().map_err(|e| {
            KeystashError::config_with_source(format!("Invalid [{}] section", key), Box::new(e))
        })?;
        sections.push(NamedStoreConfig { name: suffix.clone(), section });
    }

    Ok(sections)
}
