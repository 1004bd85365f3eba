//! Project KEK rows (`kek_data`).
//!
//! A project has at most one active KEK per crypto plugin, enforced by a
//! partial unique index. Creation and binding both tolerate concurrent
//! requests for the same project.

use crate::errors::{KeystashError, Result};
use crate::storage::DbPool;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::instrument;

/// Prefix of generated KEK labels
pub const KEK_LABEL_PREFIX: &str = "project-KEK-";

#[derive(Debug, Clone, FromRow)]
struct KekDatumRow {
    id: String,
    project_id: String,
    plugin_name: String,
    kek_label: String,
    algorithm: Option<String>,
    bit_length: Option<i64>,
    mode: Option<String>,
    plugin_meta: Option<String>,
    bind_completed: bool,
    active: bool,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KekDatum {
    pub id: String,
    pub project_id: String,
    pub plugin_name: String,
    pub kek_label: String,
    pub algorithm: Option<String>,
    pub bit_length: Option<u32>,
    pub mode: Option<String>,
    pub plugin_meta: Option<String>,
    pub bind_completed: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<KekDatumRow> for KekDatum {
    fn from(row: KekDatumRow) -> Self {
        Self {
            id: row.id,
            project_id: row.project_id,
            plugin_name: row.plugin_name,
            kek_label: row.kek_label,
            algorithm: row.algorithm,
            bit_length: row.bit_length.map(|b| b as u32),
            mode: row.mode,
            plugin_meta: row.plugin_meta,
            bind_completed: row.bind_completed,
            active: row.active,
            created_at: row.created_at,
        }
    }
}

const KEK_COLUMNS: &str = "id, project_id, plugin_name, kek_label, algorithm, bit_length, mode, \
     plugin_meta, bind_completed, active, created_at";

#[derive(Debug, Clone)]
pub struct KekDatumRepository {
    pool: DbPool,
}

impl KekDatumRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Active KEK for (project, plugin), created unbound if absent.
    #[instrument(skip(self), name = "db_find_or_create_kek")]
    pub async fn find_or_create_active(
        &self,
        project_id: &str,
        plugin_name: &str,
    ) -> Result<KekDatum> {
        if let Some(existing) = self.find_active(project_id, plugin_name).await? {
            return Ok(existing);
        }

        let label = format!("{}{}", KEK_LABEL_PREFIX, uuid::Uuid::new_v4());
        let inserted = sqlx::query(
            "INSERT INTO kek_data \
             (id, project_id, plugin_name, kek_label, bind_completed, active, created_at) \
             VALUES (?, ?, ?, ?, 0, 1, ?) \
             ON CONFLICT(project_id, plugin_name) WHERE active = 1 DO NOTHING",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(project_id)
        .bind(plugin_name)
        .bind(&label)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| KeystashError::database(e, "Failed to create project KEK"))?;

        if inserted.rows_affected() > 0 {
            tracing::info!(project_id, plugin_name, kek_label = %label, "Created project KEK");
        }

        self.find_active(project_id, plugin_name)
            .await?
            .ok_or_else(|| KeystashError::not_found("kek_datum", project_id))
    }

    async fn find_active(&self, project_id: &str, plugin_name: &str) -> Result<Option<KekDatum>> {
        let row = sqlx::query_as::<_, KekDatumRow>(&format!(
            "SELECT {} FROM kek_data WHERE project_id = ? AND plugin_name = ? AND active = 1",
            KEK_COLUMNS
        ))
        .bind(project_id)
        .bind(plugin_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KeystashError::database(e, "Failed to get active project KEK"))?;

        Ok(row.map(KekDatum::from))
    }

    #[instrument(skip(self), name = "db_get_kek")]
    pub async fn get(&self, id: &str) -> Result<Option<KekDatum>> {
        let row = sqlx::query_as::<_, KekDatumRow>(&format!(
            "SELECT {} FROM kek_data WHERE id = ?",
            KEK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KeystashError::database(e, format!("Failed to get KEK '{}'", id)))?;

        Ok(row.map(KekDatum::from))
    }

    /// Record the result of a plugin bind. Returns false if another request
    /// completed the binding first; callers must then re-read the row.
    #[instrument(
        skip(self, datum),
        fields(kek_label = %datum.kek_label),
        name = "db_complete_kek_binding"
    )]
    pub async fn complete_binding(&self, datum: &KekDatum) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE kek_data SET algorithm = ?, bit_length = ?, mode = ?, plugin_meta = ?, \
             bind_completed = 1 WHERE id = ? AND bind_completed = 0",
        )
        .bind(&datum.algorithm)
        .bind(datum.bit_length.map(i64::from))
        .bind(&datum.mode)
        .bind(&datum.plugin_meta)
        .bind(&datum.id)
        .execute(&self.pool)
        .await
        .map_err(|e| KeystashError::database(e, "Failed to complete KEK binding"))?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::{TestDatabase, TEST_PROJECT};

    #[tokio::test]
    async fn one_active_kek_per_project_and_plugin() {
        let db = TestDatabase::new().await;
        let project = db.project(TEST_PROJECT).await;
        let repo = KekDatumRepository::new(db.pool.clone());

        let first = repo.find_or_create_active(&project.id, "simple_crypto").await.unwrap();
        let again = repo.find_or_create_active(&project.id, "simple_crypto").await.unwrap();
        assert_eq!(first, again);
        assert!(first.kek_label.starts_with(KEK_LABEL_PREFIX));
        assert!(!first.bind_completed);

        let other_plugin = repo.find_or_create_active(&project.id, "p11_crypto").await.unwrap();
        assert_ne!(first.id, other_plugin.id);
    }

    #[tokio::test]
    async fn concurrent_creation_converges_on_one_row() {
        let db = TestDatabase::new().await;
        let project = db.project(TEST_PROJECT).await;
        let repo = KekDatumRepository::new(db.pool.clone());

        let (a, b) = tokio::join!(
            repo.find_or_create_active(&project.id, "simple_crypto"),
            repo.find_or_create_active(&project.id, "simple_crypto")
        );
        assert_eq!(a.unwrap().id, b.unwrap().id);
    }

    #[tokio::test]
    async fn binding_completes_once() {
        let db = TestDatabase::new().await;
        let project = db.project(TEST_PROJECT).await;
        let repo = KekDatumRepository::new(db.pool.clone());

        let mut kek = repo.find_or_create_active(&project.id, "simple_crypto").await.unwrap();
        kek.algorithm = Some("aes".into());
        kek.bit_length = Some(256);
        kek.mode = Some("gcm".into());
        kek.plugin_meta = Some("first".into());
        assert!(repo.complete_binding(&kek).await.unwrap());

        kek.plugin_meta = Some("second".into());
        assert!(!repo.complete_binding(&kek).await.unwrap());

        let stored = repo.get(&kek.id).await.unwrap().unwrap();
        assert!(stored.bind_completed);
        assert_eq!(stored.plugin_meta.as_deref(), Some("first"));
        assert_eq!(stored.bit_length, Some(256));
    }
}
