//! Multiple secret store backends.
//!
//! With `enable_multiple_secret_stores` each `[secretstore:<suffix>]` section
//! becomes a row in `secret_stores`. A project may pick a preferred store;
//! otherwise the single global default applies. Plugin selection for new
//! secrets is narrowed to the plugin named by that store.

use crate::config::NamedStoreConfig;
use crate::errors::{KeystashError, Result};
use crate::plugin::PluginError;
use crate::storage::{DbPool, SecretStoreData, SecretStoreRepository};
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

/// Which plugin field of a store row applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    Store,
    Crypto,
}

#[derive(Debug)]
pub struct MultipleBackends {
    repo: SecretStoreRepository,
    stores: Vec<NamedStoreConfig>,
    global_default: OnceCell<SecretStoreData>,
}

impl MultipleBackends {
    pub fn new(pool: DbPool, stores: Vec<NamedStoreConfig>) -> Self {
        Self { repo: SecretStoreRepository::new(pool), stores, global_default: OnceCell::new() }
    }

    pub fn repository(&self) -> &SecretStoreRepository {
        &self.repo
    }

    /// Reconcile `secret_stores` with configuration: configured stores are
    /// upserted by name, stores no longer configured are deactivated.
    #[instrument(skip(self), name = "sync_secret_stores")]
    pub async fn sync_secret_stores(&self) -> Result<Vec<SecretStoreData>> {
        let mut synced = Vec::with_capacity(self.stores.len());
        for store in &self.stores {
            let row = self
                .repo
                .upsert(
                    &store.name,
                    &store.section.secret_store_plugin,
                    store.section.crypto_plugin.as_deref(),
                    store.section.global_default,
                )
                .await?;
            synced.push(row);
        }

        let names: Vec<String> = self.stores.iter().map(|s| s.name.clone()).collect();
        let deactivated = self.repo.deactivate_except(&names).await?;
        if deactivated > 0 {
            warn!(count = deactivated, "Deactivated secret stores removed from configuration");
        }

        info!(stores = synced.len(), "Secret stores synchronized");
        Ok(synced)
    }

    /// The global default store, read once per process.
    pub async fn global_default(&self) -> Result<SecretStoreData> {
        self.global_default
            .get_or_try_init(|| async {
                self.repo.get_global_default().await?.ok_or_else(|| {
                    KeystashError::config("No global default secret store has been synchronized")
                })
            })
            .await
            .cloned()
    }

    /// Project's preferred store, falling back to the global default.
    pub async fn preferred_or_default(&self, project_id: &str) -> Result<SecretStoreData> {
        match self.repo.get_preferred(project_id).await? {
            Some(store) => Ok(store),
            None => self.global_default().await,
        }
    }

    /// Name of the only plugin of `kind` applicable to a new secret in this
    /// project. `None` means every configured plugin applies: either the
    /// caller already knows the plugin, or the store names no crypto plugin.
    pub async fn applicable_plugin_name(
        &self,
        project_id: Option<&str>,
        existing_plugin_name: Option<&str>,
        kind: PluginKind,
    ) -> Result<Option<String>> {
        if existing_plugin_name.is_some() {
            return Ok(None);
        }

        let store = match project_id {
            Some(project_id) => self.preferred_or_default(project_id).await?,
            None => self.global_default().await?,
        };

        Ok(match kind {
            PluginKind::Store => Some(store.store_plugin),
            PluginKind::Crypto => store.crypto_plugin,
        })
    }
}

/// Restrict `plugins` to the one named, failing if it is not configured.
pub fn narrow_to<T, F>(plugins: Vec<T>, wanted: Option<String>, name_of: F) -> Result<Vec<T>>
where
    F: Fn(&T) -> &str,
{
    let Some(wanted) = wanted else {
        return Ok(plugins);
    };
    let narrowed: Vec<T> = plugins.into_iter().filter(|p| name_of(p) == wanted).collect();
    if narrowed.is_empty() {
        return Err(PluginError::StorePluginNotAvailable { name: wanted }.into());
    }
    Ok(narrowed)
}
