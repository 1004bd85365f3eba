//! Secret rows: attributes only. Payloads live with the store plugin, either
//! as `encrypted_data` rows or as a reference in `secret_store_metadata`.

use crate::domain::{SecretStatus, SecretType};
use crate::errors::{KeystashError, Result};
use crate::storage::DbPool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::instrument;

#[derive(Debug, Clone, FromRow)]
struct SecretRow {
    id: String,
    project_id: String,
    name: Option<String>,
    secret_type: String,
    algorithm: Option<String>,
    bit_length: Option<i64>,
    mode: Option<String>,
    status: String,
    expiration: Option<DateTime<Utc>>,
    creator_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

const SECRET_COLUMNS: &str = "id, project_id, name, secret_type, algorithm, bit_length, mode, \
     status, expiration, creator_id, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretData {
    pub id: String,
    pub project_id: String,
    pub name: Option<String>,
    pub secret_type: SecretType,
    pub algorithm: Option<String>,
    pub bit_length: Option<u32>,
    pub mode: Option<String>,
    pub status: SecretStatus,
    pub expiration: Option<DateTime<Utc>>,
    pub creator_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SecretData {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|expiration| expiration <= now)
    }
}

impl TryFrom<SecretRow> for SecretData {
    type Error = KeystashError;

    fn try_from(row: SecretRow) -> Result<Self> {
        Ok(Self {
            secret_type: row.secret_type.parse().map_err(KeystashError::internal)?,
            status: row.status.parse().map_err(KeystashError::internal)?,
            bit_length: row.bit_length.map(|b| b as u32),
            id: row.id,
            project_id: row.project_id,
            name: row.name,
            algorithm: row.algorithm,
            mode: row.mode,
            expiration: row.expiration,
            creator_id: row.creator_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Attributes for a new secret row
#[derive(Debug, Clone, Default)]
pub struct NewSecret {
    pub project_id: String,
    pub name: Option<String>,
    pub secret_type: SecretType,
    pub algorithm: Option<String>,
    pub bit_length: Option<u32>,
    pub mode: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    pub creator_id: Option<String>,
}

/// Paging and filtering for [`SecretRepository::list`]
#[derive(Debug, Clone)]
pub struct SecretListQuery {
    pub offset: i64,
    pub limit: i64,
    pub name: Option<String>,
}

impl Default for SecretListQuery {
    fn default() -> Self {
        Self { offset: 0, limit: 10, name: None }
    }
}

#[derive(Debug, Clone)]
pub struct SecretRepository {
    pool: DbPool,
}

impl SecretRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[instrument(
        skip(self, request),
        fields(project_id = %request.project_id),
        name = "db_create_secret"
    )]
    pub async fn create(&self, request: NewSecret) -> Result<SecretData> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO secrets (id, project_id, name, secret_type, algorithm, bit_length, mode, \
             status, expiration, creator_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&request.project_id)
        .bind(&request.name)
        .bind(request.secret_type.as_str())
        .bind(&request.algorithm)
        .bind(request.bit_length.map(i64::from))
        .bind(&request.mode)
        .bind(SecretStatus::Active.as_str())
        .bind(request.expiration)
        .bind(&request.creator_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to create secret");
            KeystashError::database(e, "Failed to create secret")
        })?;

        tracing::debug!(secret_id = %id, secret_type = %request.secret_type, "Created secret row");

        self.get(&request.project_id, &id)
            .await?
            .ok_or_else(|| KeystashError::not_found("secret", id))
    }

    /// Fetch a secret scoped to its project.
    #[instrument(skip(self), name = "db_get_secret")]
    pub async fn get(&self, project_id: &str, secret_id: &str) -> Result<Option<SecretData>> {
        let row = sqlx::query_as::<_, SecretRow>(&format!(
            "SELECT {} FROM secrets WHERE id = ? AND project_id = ?",
            SECRET_COLUMNS
        ))
        .bind(secret_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            KeystashError::database(e, format!("Failed to get secret with ID '{}'", secret_id))
        })?;

        row.map(SecretData::try_from).transpose()
    }

    /// List unexpired secrets, newest first, with the total matching count.
    #[instrument(
        skip(self, query),
        fields(offset = query.offset, limit = query.limit),
        name = "db_list_secrets"
    )]
    pub async fn list(
        &self,
        project_id: &str,
        query: &SecretListQuery,
    ) -> Result<(Vec<SecretData>, i64)> {
        let now = Utc::now();
        let filter = "project_id = ? AND (expiration IS NULL OR expiration > ?) \
                      AND (? IS NULL OR name = ?)";

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM secrets WHERE {}", filter))
                .bind(project_id)
                .bind(now)
                .bind(&query.name)
                .bind(&query.name)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| KeystashError::database(e, "Failed to count secrets"))?;

        let rows = sqlx::query_as::<_, SecretRow>(&format!(
            "SELECT {} FROM secrets WHERE {} ORDER BY created_at DESC, id LIMIT ? OFFSET ?",
            SECRET_COLUMNS, filter
        ))
        .bind(project_id)
        .bind(now)
        .bind(&query.name)
        .bind(&query.name)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KeystashError::database(e, "Failed to list secrets"))?;

        let secrets = rows.into_iter().map(SecretData::try_from).collect::<Result<Vec<_>>>()?;
        Ok((secrets, total))
    }

    /// Delete a secret; metadata and encrypted data cascade.
    #[instrument(skip(self), name = "db_delete_secret")]
    pub async fn delete(&self, project_id: &str, secret_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM secrets WHERE id = ? AND project_id = ?")
            .bind(secret_id)
            .bind(project_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                KeystashError::database(
                    e,
                    format!("Failed to delete secret with ID '{}'", secret_id),
                )
            })?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::{TestDatabase, TEST_PROJECT};

    fn new_secret(project_id: &str, name: &str) -> NewSecret {
        NewSecret {
            project_id: project_id.to_string(),
            name: Some(name.to_string()),
            secret_type: SecretType::Symmetric,
            algorithm: Some("aes".to_string()),
            bit_length: Some(256),
            mode: Some("cbc".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_and_get_round_trips_attributes() {
        let db = TestDatabase::new().await;
        let project = db.project(TEST_PROJECT).await;
        let repo = SecretRepository::new(db.pool.clone());

        let created = repo.create(new_secret(&project.id, "db-password")).await.unwrap();
        assert_eq!(created.secret_type, SecretType::Symmetric);
        assert_eq!(created.bit_length, Some(256));
        assert_eq!(created.status, SecretStatus::Active);

        let fetched = repo.get(&project.id, &created.id).await.unwrap().unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn get_is_scoped_to_project() {
        let db = TestDatabase::new().await;
        let owner = db.project("owner").await;
        let other = db.project("other").await;
        let repo = SecretRepository::new(db.pool.clone());

        let created = repo.create(new_secret(&owner.id, "x")).await.unwrap();
        assert!(repo.get(&other.id, &created.id).await.unwrap().is_none());
        assert!(!repo.delete(&other.id, &created.id).await.unwrap());
        assert!(repo.delete(&owner.id, &created.id).await.unwrap());
        assert!(repo.get(&owner.id, &created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_pages_and_hides_expired() {
        let db = TestDatabase::new().await;
        let project = db.project(TEST_PROJECT).await;
        let repo = SecretRepository::new(db.pool.clone());

        for name in ["a", "b", "c"] {
            repo.create(new_secret(&project.id, name)).await.unwrap();
        }
        let mut expired = new_secret(&project.id, "old");
        expired.expiration = Some(Utc::now() - chrono::Duration::hours(1));
        repo.create(expired).await.unwrap();

        let (page, total) = repo
            .list(&project.id, &SecretListQuery { offset: 0, limit: 2, name: None })
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);

        let (named, total) = repo
            .list(&project.id, &SecretListQuery { name: Some("b".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(named[0].name.as_deref(), Some("b"));
    }

    #[test]
    fn expiry_check() {
        let now = Utc::now();
        let secret = SecretData {
            id: "s".into(),
            project_id: "p".into(),
            name: None,
            secret_type: SecretType::Opaque,
            algorithm: None,
            bit_length: None,
            mode: None,
            status: SecretStatus::Active,
            expiration: Some(now - chrono::Duration::seconds(1)),
            creator_id: None,
            created_at: now,
            updated_at: now,
        };
        assert!(secret.is_expired(now));
        assert!(!SecretData { expiration: None, ..secret }.is_expired(now));
    }
}
