//! # Storage and Persistence
//!
//! Database connectivity and the repositories for secrets, their plugin
//! metadata, project KEKs, containers and registered secret stores.

pub mod migrations;
pub mod pool;
pub mod repositories;

#[cfg(test)]
pub mod test_helpers;

pub use crate::config::DatabaseConfig;

pub use migrations::{
    embedded_versions, get_migration_version, list_applied_migrations,
    run_migrations as run_db_migrations, validate_migrations, MigrationInfo,
};
pub use pool::{create_pool, get_pool_stats, sanitize_url, DbPool, PoolStats};
pub use repositories::{
    ContainerData, ContainerMember, ContainerRepository, EncryptedDatum, EncryptedDatumRepository,
    KekDatum, KekDatumRepository, NewContainer, NewEncryptedDatum, NewSecret, ProjectData,
    ProjectRepository, SecretData, SecretListQuery, SecretMetadataRepository, SecretRepository,
    SecretStoreData, SecretStoreRepository,
};

use crate::errors::{KeystashError, Result};

/// Run database migrations
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    migrations::run_migrations(pool).await
}

/// Check database connectivity
pub async fn check_connection(pool: &DbPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(|e| KeystashError::database(e, "Database connectivity check failed"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_pool_is_reachable() {
        let config = DatabaseConfig { auto_migrate: false, ..DatabaseConfig::in_memory() };
        let pool = create_pool(&config).await.unwrap();
        check_connection(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_database_url_is_rejected() {
        let config = DatabaseConfig { url: "invalid://url".to_string(), ..Default::default() };
        assert!(create_pool(&config).await.is_err());
    }
}
