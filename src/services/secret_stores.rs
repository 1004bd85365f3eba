//! Secret store administration
//!
//! Read the stores synchronized from `[secretstore:<suffix>]` sections and
//! manage each project's preferred store. Only available when multiple
//! secret store backends are enabled.

use crate::errors::{KeystashError, Result};
use crate::plugin::{MultipleBackends, PluginError};
use crate::storage::{
    DbPool, ProjectData, ProjectRepository, SecretStoreData, SecretStoreRepository,
};
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Clone)]
pub struct SecretStoreService {
    backends: Option<Arc<MultipleBackends>>,
    projects: ProjectRepository,
}

impl SecretStoreService {
    pub fn new(pool: DbPool, backends: Option<Arc<MultipleBackends>>) -> Self {
        Self { backends, projects: ProjectRepository::new(pool) }
    }

    fn backends(&self) -> Result<&MultipleBackends> {
        self.backends.as_deref().ok_or_else(|| PluginError::MultipleStoresNotEnabled.into())
    }

    fn repository(&self) -> Result<&SecretStoreRepository> {
        Ok(self.backends()?.repository())
    }

    async fn project(&self, external_id: &str) -> Result<ProjectData> {
        self.projects.find_or_create(external_id).await
    }

    #[instrument(skip(self), name = "list_secret_stores")]
    pub async fn list_stores(&self) -> Result<Vec<SecretStoreData>> {
        self.repository()?.list_active().await
    }

    #[instrument(skip(self), name = "get_secret_store")]
    pub async fn get_store(&self, store_id: &str) -> Result<SecretStoreData> {
        self.repository()?
            .get(store_id)
            .await?
            .ok_or_else(|| KeystashError::not_found("secret_store", store_id))
    }

    pub async fn get_global_default(&self) -> Result<SecretStoreData> {
        self.backends()?.global_default().await
    }

    #[instrument(skip(self), name = "get_preferred_secret_store")]
    pub async fn get_preferred(&self, project_id: &str) -> Result<SecretStoreData> {
        let repo = self.repository()?;
        let project = self.project(project_id).await?;
        repo.get_preferred(&project.id)
            .await?
            .ok_or_else(|| KeystashError::not_found("preferred_secret_store", project_id))
    }

    /// Make an active store the project's preferred store.
    #[instrument(skip(self), name = "set_preferred_secret_store")]
    pub async fn set_preferred(&self, project_id: &str, store_id: &str) -> Result<SecretStoreData> {
        let store = self.get_store(store_id).await?;
        if !store.is_active() {
            return Err(KeystashError::validation(format!(
                "Secret store '{}' is not active",
                store.name
            )));
        }

        let project = self.project(project_id).await?;
        self.repository()?.set_preferred(&project.id, &store.id).await?;
        info!(store = %store.name, "Set preferred secret store");
        Ok(store)
    }

    /// Clear the project's preference if it names `store_id`.
    #[instrument(skip(self), name = "unset_preferred_secret_store")]
    pub async fn unset_preferred(&self, project_id: &str, store_id: &str) -> Result<()> {
        let repo = self.repository()?;
        let project = self.project(project_id).await?;
        match repo.get_preferred(&project.id).await? {
            Some(preferred) if preferred.id == store_id => {
                repo.unset_preferred(&project.id).await?;
                info!(store = %preferred.name, "Removed preferred secret store");
                Ok(())
            }
            _ => Err(KeystashError::not_found("preferred_secret_store", store_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NamedStoreConfig, StoreSectionConfig};
    use crate::storage::test_helpers::{TestDatabase, TEST_PROJECT};

    fn section(name: &str, plugin: &str, default: bool) -> NamedStoreConfig {
        NamedStoreConfig {
            name: name.into(),
            section: StoreSectionConfig {
                secret_store_plugin: plugin.into(),
                crypto_plugin: None,
                global_default: default,
            },
        }
    }

    async fn enabled() -> (TestDatabase, SecretStoreService) {
        let db = TestDatabase::new().await;
        let backends = MultipleBackends::new(
            db.pool.clone(),
            vec![section("software", "store_crypto", true), section("kmip", "kmip_plugin", false)],
        );
        backends.sync_secret_stores().await.unwrap();
        let service = SecretStoreService::new(db.pool.clone(), Some(Arc::new(backends)));
        (db, service)
    }

    #[tokio::test]
    async fn disabled_feature_is_reported() {
        let db = TestDatabase::new().await;
        let service = SecretStoreService::new(db.pool.clone(), None);
        let err = service.list_stores().await.unwrap_err();
        assert!(matches!(err.as_plugin(), Some(PluginError::MultipleStoresNotEnabled)));
        assert_eq!(err.status_code(), 404);
        assert!(service.get_preferred(TEST_PROJECT).await.is_err());
    }

    #[tokio::test]
    async fn preferred_store_lifecycle() {
        let (_db, service) = enabled().await;
        let stores = service.list_stores().await.unwrap();
        assert_eq!(stores.len(), 2);
        assert_eq!(service.get_global_default().await.unwrap().name, "software");

        let kmip = stores.iter().find(|s| s.name == "kmip").unwrap();
        assert_eq!(service.get_preferred(TEST_PROJECT).await.unwrap_err().status_code(), 404);

        service.set_preferred(TEST_PROJECT, &kmip.id).await.unwrap();
        assert_eq!(service.get_preferred(TEST_PROJECT).await.unwrap().id, kmip.id);

        let software = service.get_global_default().await.unwrap();
        assert!(service.unset_preferred(TEST_PROJECT, &software.id).await.is_err());
        service.unset_preferred(TEST_PROJECT, &kmip.id).await.unwrap();
        assert!(service.get_preferred(TEST_PROJECT).await.is_err());
    }

    #[tokio::test]
    async fn unknown_store_is_not_found() {
        let (_db, service) = enabled().await;
        let err = service.set_preferred(TEST_PROJECT, "missing").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }
}
