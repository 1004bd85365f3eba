//! Containers group the secrets produced by an asymmetric generation.

use crate::domain::SecretStatus;
use crate::errors::{KeystashError, Result};
use crate::storage::DbPool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::instrument;

const CONTAINER_COLUMNS: &str =
    "id, project_id, name, container_type, status, creator_id, created_at";

#[derive(Debug, Clone, FromRow)]
struct ContainerRow {
    id: String,
    project_id: String,
    name: Option<String>,
    container_type: String,
    status: String,
    creator_id: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ContainerMember {
    pub name: String,
    pub secret_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerData {
    pub id: String,
    pub project_id: String,
    pub name: Option<String>,
    pub container_type: String,
    pub status: SecretStatus,
    pub creator_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub members: Vec<ContainerMember>,
}

#[derive(Debug, Clone)]
pub struct NewContainer {
    pub project_id: String,
    pub name: Option<String>,
    pub container_type: String,
    pub creator_id: Option<String>,
    pub members: Vec<ContainerMember>,
}

#[derive(Debug, Clone)]
pub struct ContainerRepository {
    pool: DbPool,
}

impl ContainerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert the container and its members atomically.
    #[instrument(
        skip(self, request),
        fields(container_type = %request.container_type),
        name = "db_create_container"
    )]
    pub async fn create(&self, request: NewContainer) -> Result<ContainerData> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| KeystashError::database(e, "Failed to begin container transaction"))?;

        sqlx::query(
            "INSERT INTO containers \
             (id, project_id, name, container_type, status, creator_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&request.project_id)
        .bind(&request.name)
        .bind(&request.container_type)
        .bind(SecretStatus::Active.as_str())
        .bind(&request.creator_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| KeystashError::database(e, "Failed to create container"))?;

        for member in &request.members {
            sqlx::query(
                "INSERT INTO container_secrets (container_id, secret_id, name) VALUES (?, ?, ?)",
            )
            .bind(&id)
            .bind(&member.secret_id)
            .bind(&member.name)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                let context = format!("Failed to add container member '{}'", member.name);
                KeystashError::database(e, context)
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| KeystashError::database(e, "Failed to commit container"))?;

        Ok(ContainerData {
            id,
            project_id: request.project_id,
            name: request.name,
            container_type: request.container_type,
            status: SecretStatus::Active,
            creator_id: request.creator_id,
            created_at: now,
            members: request.members,
        })
    }

    #[instrument(skip(self), name = "db_get_container")]
    pub async fn get(&self, project_id: &str, container_id: &str) -> Result<Option<ContainerData>> {
        let row = sqlx::query_as::<_, ContainerRow>(&format!(
            "SELECT {} FROM containers WHERE id = ? AND project_id = ?",
            CONTAINER_COLUMNS
        ))
        .bind(container_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            KeystashError::database(e, format!("Failed to get container '{}'", container_id))
        })?;

        match row {
            Some(row) => Ok(Some(self.with_members(row).await?)),
            None => Ok(None),
        }
    }

    /// A page of the project's containers, newest first, plus the total count.
    #[instrument(skip(self), name = "db_list_containers")]
    pub async fn list(
        &self,
        project_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<ContainerData>, i64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM containers WHERE project_id = ?")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| KeystashError::database(e, "Failed to count containers"))?;

        let rows = sqlx::query_as::<_, ContainerRow>(&format!(
            "SELECT {} FROM containers WHERE project_id = ? \
             ORDER BY created_at DESC, id LIMIT ? OFFSET ?",
            CONTAINER_COLUMNS
        ))
        .bind(project_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KeystashError::database(e, "Failed to list containers"))?;

        let mut containers = Vec::with_capacity(rows.len());
        for row in rows {
            containers.push(self.with_members(row).await?);
        }
        Ok((containers, total))
    }

    /// Delete a container; member links cascade, the secrets stay.
    #[instrument(skip(self), name = "db_delete_container")]
    pub async fn delete(&self, project_id: &str, container_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM containers WHERE id = ? AND project_id = ?")
            .bind(container_id)
            .bind(project_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                KeystashError::database(
                    e,
                    format!("Failed to delete container with ID '{}'", container_id),
                )
            })?;

        Ok(result.rows_affected() > 0)
    }

    async fn with_members(&self, row: ContainerRow) -> Result<ContainerData> {
        let members = sqlx::query_as::<_, ContainerMember>(
            "SELECT name, secret_id FROM container_secrets WHERE container_id = ? ORDER BY name",
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KeystashError::database(e, "Failed to get container members"))?;

        Ok(ContainerData {
            status: row.status.parse().map_err(KeystashError::internal)?,
            id: row.id,
            project_id: row.project_id,
            name: row.name,
            container_type: row.container_type,
            creator_id: row.creator_id,
            created_at: row.created_at,
            members,
        })
    }
}
