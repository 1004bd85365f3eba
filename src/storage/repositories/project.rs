//! Projects (tenants), created on first use from the external project id.

use crate::errors::{KeystashError, Result};
use crate::storage::DbPool;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ProjectData {
    pub id: String,
    pub external_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct ProjectRepository {
    pool: DbPool,
}

impl ProjectRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Return the project for `external_id`, inserting it if needed.
    #[instrument(skip(self), name = "db_find_or_create_project")]
    pub async fn find_or_create(&self, external_id: &str) -> Result<ProjectData> {
        sqlx::query(
            "INSERT INTO projects (id, external_id, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(external_id) DO NOTHING",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(external_id)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            KeystashError::database(e, format!("Failed to create project '{}'", external_id))
        })?;

        self.get_by_external_id(external_id)
            .await?
            .ok_or_else(|| KeystashError::not_found("project", external_id))
    }

    #[instrument(skip(self), name = "db_get_project_by_external_id")]
    pub async fn get_by_external_id(&self, external_id: &str) -> Result<Option<ProjectData>> {
        sqlx::query_as::<_, ProjectData>(
            "SELECT id, external_id, created_at FROM projects WHERE external_id = ?",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            KeystashError::database(e, format!("Failed to get project '{}'", external_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::TestDatabase;

    #[tokio::test]
    async fn find_or_create_is_stable() {
        let db = TestDatabase::new().await;
        let repo = ProjectRepository::new(db.pool.clone());

        let first = repo.find_or_create("tenant-a").await.unwrap();
        let second = repo.find_or_create("tenant-a").await.unwrap();
        assert_eq!(first, second);

        let other = repo.find_or_create("tenant-b").await.unwrap();
        assert_ne!(first.id, other.id);
        assert!(repo.get_by_external_id("missing").await.unwrap().is_none());
    }
}
