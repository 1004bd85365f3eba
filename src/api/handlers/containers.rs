//! Container HTTP handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::secrets::secret_ref;
use super::secrets::types::{DEFAULT_LIMIT, MAX_LIMIT};
use crate::{
    api::{error::ApiError, middleware::ProjectContext, routes::ApiState},
    domain::SecretStatus,
    storage::ContainerData,
};

pub fn container_ref(id: &str) -> String {
    format!("/v1/containers/{}", id)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSecretRef {
    pub name: String,
    pub secret_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerResponse {
    pub container_ref: String,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub container_type: String,
    pub status: SecretStatus,
    pub created: DateTime<Utc>,
    pub secret_refs: Vec<ContainerSecretRef>,
}

impl From<ContainerData> for ContainerResponse {
    fn from(container: ContainerData) -> Self {
        Self {
            container_ref: container_ref(&container.id),
            name: container.name,
            container_type: container.container_type,
            status: container.status,
            created: container.created_at,
            secret_refs: container
                .members
                .into_iter()
                .map(|member| ContainerSecretRef {
                    secret_ref: secret_ref(&member.secret_id),
                    name: member.name,
                })
                .collect(),
        }
    }
}

#[instrument(skip(state), fields(project_id = %project.id()))]
pub async fn get_container_handler(
    State(state): State<ApiState>,
    Extension(project): Extension<ProjectContext>,
    Path(id): Path<String>,
) -> Result<Json<ContainerResponse>, ApiError> {
    let container = state.secrets.get_container(project.id(), &id).await?;
    Ok(Json(ContainerResponse::from(container)))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListContainersQuery {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl ListContainersQuery {
    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerListResponse {
    pub containers: Vec<ContainerResponse>,
    pub total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
}

impl ContainerListResponse {
    pub fn page(containers: Vec<ContainerData>, total: i64, offset: i64, limit: i64) -> Self {
        let link = |offset: i64| format!("/v1/containers?offset={}&limit={}", offset, limit);
        Self {
            containers: containers.into_iter().map(ContainerResponse::from).collect(),
            total,
            next: (offset + limit < total).then(|| link(offset + limit)),
            previous: (offset > 0).then(|| link((offset - limit).max(0))),
        }
    }
}

#[instrument(skip(state), fields(project_id = %project.id()))]
pub async fn list_containers_handler(
    State(state): State<ApiState>,
    Extension(project): Extension<ProjectContext>,
    Query(query): Query<ListContainersQuery>,
) -> Result<Json<ContainerListResponse>, ApiError> {
    let (offset, limit) = (query.offset(), query.limit());
    let (containers, total) = state.secrets.list_containers(project.id(), offset, limit).await?;
    Ok(Json(ContainerListResponse::page(containers, total, offset, limit)))
}

#[instrument(skip(state), fields(project_id = %project.id()))]
pub async fn delete_container_handler(
    State(state): State<ApiState>,
    Extension(project): Extension<ProjectContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.secrets.delete_container(project.id(), &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_links_page_through_containers() {
        let page = ContainerListResponse::page(Vec::new(), 5, 2, 2);
        assert_eq!(page.next.as_deref(), Some("/v1/containers?offset=4&limit=2"));
        assert_eq!(page.previous.as_deref(), Some("/v1/containers?offset=0&limit=2"));
        assert_eq!(ListContainersQuery { offset: None, limit: Some(0) }.limit(), 1);
    }
}
