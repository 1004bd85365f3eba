//! Registered secret stores and per-project store preferences, used when
//! multiple secret store backends are enabled.

use crate::errors::{KeystashError, Result};
use crate::storage::DbPool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SecretStoreData {
    pub id: String,
    pub name: String,
    pub store_plugin: String,
    pub crypto_plugin: Option<String>,
    pub global_default: bool,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl SecretStoreData {
    pub fn is_active(&self) -> bool {
        self.status == "ACTIVE"
    }
}

const STORE_COLUMNS: &str =
    "id, name, store_plugin, crypto_plugin, global_default, status, created_at";

#[derive(Debug, Clone)]
pub struct SecretStoreRepository {
    pool: DbPool,
}

impl SecretStoreRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert or refresh a configured store and mark it active.
    #[instrument(skip(self), name = "db_upsert_secret_store")]
    pub async fn upsert(
        &self,
        name: &str,
        store_plugin: &str,
        crypto_plugin: Option<&str>,
        global_default: bool,
    ) -> Result<SecretStoreData> {
        sqlx::query(
            "INSERT INTO secret_stores \
             (id, name, store_plugin, crypto_plugin, global_default, status, created_at) \
             VALUES (?, ?, ?, ?, ?, 'ACTIVE', ?) \
             ON CONFLICT(name) DO UPDATE SET store_plugin = excluded.store_plugin, \
             crypto_plugin = excluded.crypto_plugin, global_default = excluded.global_default, \
             status = 'ACTIVE'",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(name)
        .bind(store_plugin)
        .bind(crypto_plugin)
        .bind(global_default)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            KeystashError::database(e, format!("Failed to upsert secret store '{}'", name))
        })?;

        self.get_by_name(name)
            .await?
            .ok_or_else(|| KeystashError::not_found("secret_store", name))
    }

    /// Mark every store whose name is not in `names` inactive; returns how many changed.
    #[instrument(skip(self, names), name = "db_deactivate_secret_stores")]
    pub async fn deactivate_except(&self, names: &[String]) -> Result<u64> {
        let active = self.list_active().await?;
        let mut changed = 0;
        for store in active.iter().filter(|s| !names.contains(&s.name)) {
            let result = sqlx::query(
                "UPDATE secret_stores SET status = 'INACTIVE', global_default = 0 WHERE id = ?",
            )
            .bind(&store.id)
            .execute(&self.pool)
            .await
            .map_err(|e| KeystashError::database(e, "Failed to deactivate secret store"))?;
            changed += result.rows_affected();
        }
        Ok(changed)
    }

    pub async fn list_active(&self) -> Result<Vec<SecretStoreData>> {
        sqlx::query_as::<_, SecretStoreData>(&format!(
            "SELECT {} FROM secret_stores WHERE status = 'ACTIVE' ORDER BY created_at, name",
            STORE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KeystashError::database(e, "Failed to list secret stores"))
    }

    pub async fn get(&self, id: &str) -> Result<Option<SecretStoreData>> {
        sqlx::query_as::<_, SecretStoreData>(&format!(
            "SELECT {} FROM secret_stores WHERE id = ?",
            STORE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KeystashError::database(e, format!("Failed to get secret store '{}'", id)))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<SecretStoreData>> {
        sqlx::query_as::<_, SecretStoreData>(&format!(
            "SELECT {} FROM secret_stores WHERE name = ?",
            STORE_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KeystashError::database(e, format!("Failed to get secret store '{}'", name)))
    }

    pub async fn get_global_default(&self) -> Result<Option<SecretStoreData>> {
        sqlx::query_as::<_, SecretStoreData>(&format!(
            "SELECT {} FROM secret_stores WHERE global_default = 1 AND status = 'ACTIVE' LIMIT 1",
            STORE_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KeystashError::database(e, "Failed to get global default secret store"))
    }

    /// The project's preferred store, if one is set and still active.
    #[instrument(skip(self), name = "db_get_preferred_store")]
    pub async fn get_preferred(&self, project_id: &str) -> Result<Option<SecretStoreData>> {
        let columns = STORE_COLUMNS
            .split(", ")
            .map(|c| format!("s.{}", c))
            .collect::<Vec<_>>()
            .join(", ");
        sqlx::query_as::<_, SecretStoreData>(&format!(
            "SELECT {} FROM secret_stores s \
             JOIN project_secret_store p ON p.secret_store_id = s.id \
             WHERE p.project_id = ? AND s.status = 'ACTIVE'",
            columns
        ))
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KeystashError::database(e, "Failed to get preferred secret store"))
    }

    #[instrument(skip(self), name = "db_set_preferred_store")]
    pub async fn set_preferred(&self, project_id: &str, store_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO project_secret_store (project_id, secret_store_id, created_at) \
             VALUES (?, ?, ?) \
             ON CONFLICT(project_id) DO UPDATE SET secret_store_id = excluded.secret_store_id, \
             created_at = excluded.created_at",
        )
        .bind(project_id)
        .bind(store_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| KeystashError::database(e, "Failed to set preferred secret store"))?;
        Ok(())
    }

    /// Returns false when the project had no preference.
    #[instrument(skip(self), name = "db_unset_preferred_store")]
    pub async fn unset_preferred(&self, project_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM project_secret_store WHERE project_id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await
            .map_err(|e| KeystashError::database(e, "Failed to unset preferred secret store"))?;
        Ok(result.rows_affected() > 0)
    }
}
