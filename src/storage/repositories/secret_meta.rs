//! Plugin metadata attached to a secret (`secret_store_metadata`).
//!
//! Every store plugin records at least `plugin_name` here; the rest of the
//! keys are opaque to everything but the plugin that wrote them.

use crate::errors::{KeystashError, Result};
use crate::storage::DbPool;
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::instrument;

#[derive(Debug, Clone)]
pub struct SecretMetadataRepository {
    pool: DbPool,
}

impl SecretMetadataRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Upsert every entry of `metadata` for the secret in one transaction.
    #[instrument(
        skip(self, metadata),
        fields(entries = metadata.len()),
        name = "db_save_secret_meta"
    )]
    pub async fn save(&self, secret_id: &str, metadata: &BTreeMap<String, String>) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| KeystashError::database(e, "Failed to begin metadata transaction"))?;

        for (key, value) in metadata {
            sqlx::query(
                "INSERT INTO secret_store_metadata (secret_id, meta_key, meta_value) \
                 VALUES (?, ?, ?) \
                 ON CONFLICT(secret_id, meta_key) DO UPDATE SET meta_value = excluded.meta_value",
            )
            .bind(secret_id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                KeystashError::database(e, format!("Failed to save metadata key '{}'", key))
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| KeystashError::database(e, "Failed to commit secret metadata"))?;
        Ok(())
    }

    #[instrument(skip(self), name = "db_get_secret_meta")]
    pub async fn get(&self, secret_id: &str) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query(
            "SELECT meta_key, meta_value FROM secret_store_metadata WHERE secret_id = ?",
        )
        .bind(secret_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            KeystashError::database(
                e,
                format!("Failed to get metadata for secret '{}'", secret_id),
            )
        })?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("meta_key"), row.get::<String, _>("meta_value")))
            .collect())
    }
}
