//! Crypto plugin registry, configured by `[crypto] enabled_crypto_plugins`.

use super::{CryptoPlugin, PluginSupportType};
use crate::errors::Result;
use crate::plugin::multiple_backends::{narrow_to, MultipleBackends, PluginKind};
use crate::plugin::PluginError;
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
pub struct CryptoPluginManager {
    plugins: Vec<Arc<dyn CryptoPlugin>>,
    multiple_backends: Option<Arc<MultipleBackends>>,
}

impl std::fmt::Debug for CryptoPluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoPluginManager")
            .field("plugins", &self.registered_plugins())
            .finish()
    }
}

impl CryptoPluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_multiple_backends(mut self, backends: Arc<MultipleBackends>) -> Self {
        self.multiple_backends = Some(backends);
        self
    }

    pub fn register(&mut self, plugin: Arc<dyn CryptoPlugin>) {
        info!(plugin = plugin.name(), "Registering crypto plugin");
        self.plugins.retain(|p| p.name() != plugin.name());
        self.plugins.push(plugin);
    }

    pub fn registered_plugins(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// First applicable plugin supporting the operation.
    pub async fn get_plugin_store_generate(
        &self,
        support_type: PluginSupportType,
        algorithm: Option<&str>,
        bit_length: Option<u32>,
        mode: Option<&str>,
        project_id: Option<&str>,
    ) -> Result<Arc<dyn CryptoPlugin>> {
        if self.plugins.is_empty() {
            return Err(PluginError::CryptoPluginsNotConfigured.into());
        }

        let mut applicable = self.plugins.clone();
        if let Some(backends) = &self.multiple_backends {
            let wanted =
                backends.applicable_plugin_name(project_id, None, PluginKind::Crypto).await?;
            applicable = narrow_to(applicable, wanted, |p| p.name())?;
        }

        applicable
            .into_iter()
            .find(|p| p.supports(support_type, algorithm, bit_length, mode))
            .ok_or_else(|| {
                PluginError::CryptoUnsupportedOperation {
                    operation: format!(
                        "{} ({} {})",
                        support_type,
                        algorithm.unwrap_or("-"),
                        bit_length.map(|b| b.to_string()).unwrap_or_else(|| "-".into())
                    ),
                }
                .into()
            })
    }

    /// Plugin that bound an existing project KEK.
    pub fn get_plugin_retrieve(&self, plugin_name: &str) -> Result<Arc<dyn CryptoPlugin>> {
        self.plugins
            .iter()
            .find(|p| p.name() == plugin_name)
            .cloned()
            .ok_or_else(|| {
                PluginError::CryptoPluginNotFound { name: plugin_name.to_string() }.into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimpleCryptoConfig;
    use crate::plugin::crypto::SimpleCryptoPlugin;

    fn simple() -> Arc<dyn CryptoPlugin> {
        Arc::new(SimpleCryptoPlugin::new(&SimpleCryptoConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn empty_manager_reports_not_configured() {
        let manager = CryptoPluginManager::new();
        let err = manager
            .get_plugin_store_generate(PluginSupportType::EncryptDecrypt, None, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err.as_plugin(), Some(PluginError::CryptoPluginsNotConfigured)));
    }

    #[tokio::test]
    async fn unsupported_generation_is_reported() {
        let mut manager = CryptoPluginManager::new();
        manager.register(simple());

        let plugin = manager
            .get_plugin_store_generate(PluginSupportType::EncryptDecrypt, None, None, None, None)
            .await
            .unwrap();
        assert_eq!(plugin.name(), "simple_crypto");

        let err = manager
            .get_plugin_store_generate(
                PluginSupportType::AsymmetricKeyGeneration,
                Some("ec"),
                Some(256),
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err.as_plugin(), Some(PluginError::CryptoUnsupportedOperation { .. })));
    }

    #[test]
    fn retrieve_by_name() {
        let mut manager = CryptoPluginManager::new();
        manager.register(simple());
        manager.register(simple());
        assert_eq!(manager.registered_plugins(), vec!["simple_crypto"]);
        assert!(manager.get_plugin_retrieve("simple_crypto").is_ok());
        let err = manager.get_plugin_retrieve("p11_crypto").unwrap_err();
        assert!(matches!(err.as_plugin(), Some(PluginError::CryptoPluginNotFound { .. })));
    }
}
