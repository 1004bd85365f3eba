//! Secret store administration handlers
//!
//! Every route answers 404 unless multiple secret store backends are enabled.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    api::{error::ApiError, middleware::ProjectContext, routes::ApiState},
    storage::SecretStoreData,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretStoreResponse {
    pub secret_store_ref: String,
    pub secret_store_id: String,
    pub name: String,
    pub secret_store_plugin: String,
    pub crypto_plugin: Option<String>,
    pub global_default: bool,
    pub status: String,
    pub created: DateTime<Utc>,
}

impl From<SecretStoreData> for SecretStoreResponse {
    fn from(store: SecretStoreData) -> Self {
        Self {
            secret_store_ref: format!("/v1/secret-stores/{}", store.id),
            secret_store_id: store.id,
            name: store.name,
            secret_store_plugin: store.store_plugin,
            crypto_plugin: store.crypto_plugin,
            global_default: store.global_default,
            status: store.status,
            created: store.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretStoreListResponse {
    pub secret_stores: Vec<SecretStoreResponse>,
    pub total: usize,
}

#[instrument(skip(state))]
pub async fn list_secret_stores_handler(
    State(state): State<ApiState>,
) -> Result<Json<SecretStoreListResponse>, ApiError> {
    let stores = state.secret_stores.list_stores().await?;
    Ok(Json(SecretStoreListResponse {
        total: stores.len(),
        secret_stores: stores.into_iter().map(SecretStoreResponse::from).collect(),
    }))
}

#[instrument(skip(state))]
pub async fn get_secret_store_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SecretStoreResponse>, ApiError> {
    Ok(Json(state.secret_stores.get_store(&id).await?.into()))
}

#[instrument(skip(state))]
pub async fn get_global_default_handler(
    State(state): State<ApiState>,
) -> Result<Json<SecretStoreResponse>, ApiError> {
    Ok(Json(state.secret_stores.get_global_default().await?.into()))
}

#[instrument(skip(state), fields(project_id = %project.id()))]
pub async fn get_preferred_handler(
    State(state): State<ApiState>,
    Extension(project): Extension<ProjectContext>,
) -> Result<Json<SecretStoreResponse>, ApiError> {
    Ok(Json(state.secret_stores.get_preferred(project.id()).await?.into()))
}

#[instrument(skip(state), fields(project_id = %project.id()))]
pub async fn set_preferred_handler(
    State(state): State<ApiState>,
    Extension(project): Extension<ProjectContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.secret_stores.set_preferred(project.id(), &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state), fields(project_id = %project.id()))]
pub async fn unset_preferred_handler(
    State(state): State<ApiState>,
    Extension(project): Extension<ProjectContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.secret_stores.unset_preferred(project.id(), &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
