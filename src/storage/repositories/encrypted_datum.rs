//! Ciphertext rows written by the `store_crypto` adapter.
//!
//! `cypher_text` is stored base64-encoded; it is only ever the output of a
//! crypto plugin's encrypt, never the caller's payload.

use crate::errors::{KeystashError, Result};
use crate::storage::DbPool;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct EncryptedDatum {
    pub id: String,
    pub secret_id: String,
    pub kek_id: String,
    pub content_type: Option<String>,
    pub cypher_text: String,
    pub kek_meta_extended: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEncryptedDatum {
    pub secret_id: String,
    pub kek_id: String,
    pub content_type: Option<String>,
    pub cypher_text: String,
    pub kek_meta_extended: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EncryptedDatumRepository {
    pool: DbPool,
}

impl EncryptedDatumRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[instrument(
        skip(self, datum),
        fields(secret_id = %datum.secret_id),
        name = "db_create_encrypted_datum"
    )]
    pub async fn create(&self, datum: NewEncryptedDatum) -> Result<EncryptedDatum> {
        let row = EncryptedDatum {
            id: uuid::Uuid::new_v4().to_string(),
            secret_id: datum.secret_id,
            kek_id: datum.kek_id,
            content_type: datum.content_type,
            cypher_text: datum.cypher_text,
            kek_meta_extended: datum.kek_meta_extended,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO encrypted_data (id, secret_id, kek_id, content_type, cypher_text, \
             kek_meta_extended, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.secret_id)
        .bind(&row.kek_id)
        .bind(&row.content_type)
        .bind(&row.cypher_text)
        .bind(&row.kek_meta_extended)
        .bind(row.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| KeystashError::database(e, "Failed to create encrypted datum"))?;

        Ok(row)
    }

    /// Most recent datum for a secret.
    #[instrument(skip(self), name = "db_find_encrypted_datum")]
    pub async fn find_by_secret(&self, secret_id: &str) -> Result<Option<EncryptedDatum>> {
        sqlx::query_as::<_, EncryptedDatum>(
            "SELECT id, secret_id, kek_id, content_type, cypher_text, kek_meta_extended, \
             created_at \
             FROM encrypted_data WHERE secret_id = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(secret_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            KeystashError::database(
                e,
                format!("Failed to get encrypted datum for secret '{}'", secret_id),
            )
        })
    }

    pub async fn exists_for_secret(&self, secret_id: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM encrypted_data WHERE secret_id = ?")
                .bind(secret_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| KeystashError::database(e, "Failed to count encrypted data"))?;
        Ok(count > 0)
    }
}
