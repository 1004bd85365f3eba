//! Application bootstrap
//!
//! Builds the shared state the HTTP layer runs on: the database pool, the
//! optional multiple-backend registry and both plugin managers, loaded from
//! the enabled plugin lists in configuration.

use crate::config::AppConfig;
use crate::errors::{KeystashError, Result};
use crate::plugin::crypto::{CryptoPluginManager, P11CryptoPlugin, SimpleCryptoPlugin};
use crate::plugin::dogtag::DogtagKraStore;
use crate::plugin::kmip::KmipSecretStore;
use crate::plugin::{
    MultipleBackends, SecretStorePluginManager, StoreCryptoAdapter, DOGTAG_PLUGIN, KMIP_PLUGIN,
    P11_CRYPTO, SIMPLE_CRYPTO, STORE_CRYPTO,
};
use crate::storage::{create_pool, DbPool};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pool: DbPool,
    pub stores: Arc<SecretStorePluginManager>,
    pub crypto: Arc<CryptoPluginManager>,
    pub multiple_backends: Option<Arc<MultipleBackends>>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let pool = create_pool(&config.database).await?;
        Self::with_pool(config, pool).await
    }

    /// Wire plugins over an existing pool with migrations applied.
    pub async fn with_pool(config: AppConfig, pool: DbPool) -> Result<Self> {
        let multiple_backends = if config.secretstore.enable_multiple_secret_stores {
            let backends = MultipleBackends::new(pool.clone(), config.secret_stores.clone());
            let synced = backends.sync_secret_stores().await?;
            info!(stores = synced.len(), "Multiple secret stores enabled");
            Some(Arc::new(backends))
        } else {
            None
        };

        let crypto = Arc::new(load_crypto_plugins(&config, multiple_backends.clone())?);
        let stores =
            Arc::new(load_store_plugins(&config, &pool, &crypto, multiple_backends.clone())?);

        Ok(Self { config: Arc::new(config), pool, stores, crypto, multiple_backends })
    }
}

fn load_crypto_plugins(
    config: &AppConfig,
    backends: Option<Arc<MultipleBackends>>,
) -> Result<CryptoPluginManager> {
    let mut manager = CryptoPluginManager::new();
    for name in config.enabled_crypto_plugins() {
        match name.as_str() {
            SIMPLE_CRYPTO => {
                manager.register(Arc::new(SimpleCryptoPlugin::new(&config.simple_crypto_plugin)?));
            }
            P11_CRYPTO => {
                manager.register(Arc::new(P11CryptoPlugin::new(&config.p11_crypto_plugin)?));
            }
            other => {
                return Err(KeystashError::config(format!("Unknown crypto plugin '{}'", other)));
            }
        }
    }

    if let Some(backends) = backends {
        manager = manager.with_multiple_backends(backends);
    }
    Ok(manager)
}

fn load_store_plugins(
    config: &AppConfig,
    pool: &DbPool,
    crypto: &Arc<CryptoPluginManager>,
    backends: Option<Arc<MultipleBackends>>,
) -> Result<SecretStorePluginManager> {
    let mut manager = SecretStorePluginManager::new();
    for name in config.enabled_store_plugins() {
        match name.as_str() {
            STORE_CRYPTO => {
                if crypto.is_empty() {
                    return Err(KeystashError::config(
                        "store_crypto is enabled but no crypto plugins are configured",
                    ));
                }
                manager.register(Arc::new(StoreCryptoAdapter::new(pool.clone(), crypto.clone())));
            }
            KMIP_PLUGIN => manager.register(Arc::new(KmipSecretStore::new(&config.kmip_plugin)?)),
            DOGTAG_PLUGIN => {
                manager.register(Arc::new(DogtagKraStore::new(&config.dogtag_plugin)?))
            }
            other => {
                return Err(KeystashError::config(format!(
                    "Unknown secret store plugin '{}'",
                    other
                )));
            }
        }
    }

    if let Some(backends) = backends {
        manager = manager.with_multiple_backends(backends);
    }

    info!(plugins = ?manager.registered_plugins(), "Secret store plugins loaded");
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::TestDatabase;

    #[tokio::test]
    async fn default_config_loads_store_crypto() {
        let db = TestDatabase::new().await;
        let state = AppState::with_pool(AppConfig::default(), db.pool.clone()).await.unwrap();
        assert!(state.stores.has_plugin(STORE_CRYPTO));
        assert_eq!(state.crypto.registered_plugins(), vec![SIMPLE_CRYPTO.to_string()]);
        assert!(state.multiple_backends.is_none());
    }

    #[tokio::test]
    async fn unknown_store_plugin_is_a_config_error() {
        let db = TestDatabase::new().await;
        let mut config = AppConfig::default();
        config.secretstore.enabled_secretstore_plugins = vec!["vault_plugin".to_string()];
        let err = AppState::with_pool(config, db.pool.clone()).await.unwrap_err();
        assert!(err.to_string().contains("vault_plugin"));
    }

    #[tokio::test]
    async fn store_crypto_requires_a_crypto_plugin() {
        let db = TestDatabase::new().await;
        let mut config = AppConfig::default();
        config.crypto.enabled_crypto_plugins.clear();
        assert!(AppState::with_pool(config, db.pool.clone()).await.is_err());
    }
}
