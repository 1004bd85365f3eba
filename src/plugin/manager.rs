//! Secret store plugin registry
//!
//! Maps the names in `[secretstore] enabled_secretstore_plugins` to plugin
//! instances and picks the plugin for each store, generate, retrieve and
//! delete request. Registration order is selection order.

use super::multiple_backends::{narrow_to, MultipleBackends, PluginKind};
use super::store::SecretStorePlugin;
use super::PluginError;
use crate::domain::KeySpec;
use crate::errors::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
pub struct SecretStorePluginManager {
    plugins: Vec<Arc<dyn SecretStorePlugin>>,
    multiple_backends: Option<Arc<MultipleBackends>>,
}

impl std::fmt::Debug for SecretStorePluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStorePluginManager")
            .field("plugins", &self.registered_plugins())
            .field("multiple_backends", &self.multiple_backends.is_some())
            .finish()
    }
}

impl SecretStorePluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Narrow selection of new secrets by project store preference.
    pub fn with_multiple_backends(mut self, backends: Arc<MultipleBackends>) -> Self {
        self.multiple_backends = Some(backends);
        self
    }

    /// Register a secret store plugin; a second plugin with the same name replaces the first.
    pub fn register(&mut self, plugin: Arc<dyn SecretStorePlugin>) {
        info!(plugin = plugin.name(), "Registering secret store plugin");
        if let Some(existing) = self.plugins.iter_mut().find(|p| p.name() == plugin.name()) {
            warn!(plugin = plugin.name(), "Replacing already registered secret store plugin");
            *existing = plugin;
        } else {
            self.plugins.push(plugin);
        }
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p.name() == name)
    }

    pub fn registered_plugins(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    fn ensure_configured(&self) -> Result<()> {
        if self.plugins.is_empty() {
            return Err(PluginError::StorePluginsNotConfigured.into());
        }
        Ok(())
    }

    async fn applicable_plugins(
        &self,
        project_id: Option<&str>,
        existing_plugin_name: Option<&str>,
    ) -> Result<Vec<Arc<dyn SecretStorePlugin>>> {
        let plugins = self.plugins.clone();
        let Some(backends) = &self.multiple_backends else {
            return Ok(plugins);
        };
        let wanted = backends
            .applicable_plugin_name(project_id, existing_plugin_name, PluginKind::Store)
            .await?;
        narrow_to(plugins, wanted, |p| p.name())
    }

    /// Plugin to store a secret with `key_spec`.
    ///
    /// An explicit `plugin_name` wins. Otherwise the first applicable plugin
    /// that supports the key spec (and has a transport key, if one is needed).
    pub async fn get_plugin_store(
        &self,
        key_spec: &KeySpec,
        plugin_name: Option<&str>,
        transport_key_needed: bool,
        project_id: Option<&str>,
    ) -> Result<Arc<dyn SecretStorePlugin>> {
        self.ensure_configured()?;
        let active = self.applicable_plugins(project_id, plugin_name).await?;

        if let Some(name) = plugin_name {
            return active
                .into_iter()
                .find(|p| p.name() == name)
                .ok_or_else(|| PluginError::PluginNotFound { name: name.to_string() }.into());
        }

        for plugin in active {
            if !plugin.store_secret_supports(key_spec) {
                continue;
            }
            if transport_key_needed && plugin.get_transport_key().await?.is_none() {
                continue;
            }
            debug!(plugin = plugin.name(), "Selected secret store plugin for store");
            return Ok(plugin);
        }

        let reason = if transport_key_needed {
            "no plugin with a transport key supports this secret"
        } else {
            "no plugin supports this secret"
        };
        Err(PluginError::StoreSupportedPluginNotFound { reason: reason.to_string() }.into())
    }

    /// Plugin recorded in a stored secret's metadata.
    ///
    /// Missing here means the server configuration changed since the
    /// secret was stored.
    pub fn get_plugin_retrieve_delete(
        &self,
        plugin_name: &str,
    ) -> Result<Arc<dyn SecretStorePlugin>> {
        self.ensure_configured()?;
        self.plugins.iter().find(|p| p.name() == plugin_name).cloned().ok_or_else(|| {
            PluginError::StorePluginNotAvailable { name: plugin_name.to_string() }.into()
        })
    }

    /// First applicable plugin able to generate keys for `key_spec`.
    pub async fn get_plugin_generate(
        &self,
        key_spec: &KeySpec,
        project_id: Option<&str>,
    ) -> Result<Arc<dyn SecretStorePlugin>> {
        self.ensure_configured()?;
        self.applicable_plugins(project_id, None)
            .await?
            .into_iter()
            .find(|p| p.generate_supports(key_spec))
            .ok_or_else(|| {
                PluginError::GenerateSupportedPluginNotFound {
                    algorithm: key_spec.alg.clone().unwrap_or_default(),
                }
                .into()
            })
    }

    /// Health of every plugin, in registration order.
    pub async fn health_check_all(&self) -> Vec<(String, Result<()>)> {
        let checks = self.plugins.iter().map(|p| async move {
            (p.name().to_string(), p.health_check().await)
        });
        futures::future::join_all(checks).await
    }
}
