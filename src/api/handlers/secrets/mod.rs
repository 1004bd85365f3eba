//! Secret HTTP handlers
//!
//! Metadata responses never include the payload. The payload is served raw
//! from its own endpoint, rendered as the `Accept` type.

pub mod types;

pub use types::{
    secret_ref, CreateSecretRequest, ListSecretsQuery, SecretListResponse, SecretRefResponse,
    SecretResponse,
};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use tracing::instrument;
use validator::Validate;
use zeroize::Zeroizing;

use crate::{
    api::{error::ApiError, middleware::ProjectContext, routes::ApiState},
    errors::Error,
    services::CreateSecret,
    storage::SecretListQuery,
};

fn header_value<'a>(
    headers: &'a HeaderMap,
    name: header::HeaderName,
) -> Result<Option<&'a str>, ApiError> {
    headers
        .get(&name)
        .map(|value| {
            value.to_str().map_err(|_| ApiError::bad_request(format!("Invalid {} header", name)))
        })
        .transpose()
}

#[instrument(skip(state, payload), fields(project_id = %project.id()))]
pub async fn create_secret_handler(
    State(state): State<ApiState>,
    Extension(project): Extension<ProjectContext>,
    Json(payload): Json<CreateSecretRequest>,
) -> Result<(StatusCode, Json<SecretRefResponse>), ApiError> {
    payload.validate().map_err(|err| ApiError::from(Error::from(err)))?;

    let request = CreateSecret {
        name: payload.name,
        secret_type: payload.secret_type,
        algorithm: payload.algorithm,
        bit_length: payload.bit_length,
        mode: payload.mode,
        expiration: payload.expiration,
        payload: payload.payload.map(|p| Zeroizing::new(p.into_bytes())),
        payload_content_type: payload.payload_content_type,
        payload_content_encoding: payload.payload_content_encoding,
    };

    let secret = state.secrets.store_secret(project.id(), request).await?;
    Ok((StatusCode::CREATED, Json(SecretRefResponse { secret_ref: secret_ref(&secret.id) })))
}

#[instrument(skip(state), fields(project_id = %project.id()))]
pub async fn list_secrets_handler(
    State(state): State<ApiState>,
    Extension(project): Extension<ProjectContext>,
    Query(query): Query<ListSecretsQuery>,
) -> Result<Json<SecretListResponse>, ApiError> {
    let (offset, limit) = (query.offset(), query.limit());
    let (secrets, total) = state
        .secrets
        .list_secrets(project.id(), &SecretListQuery { offset, limit, name: query.name })
        .await?;
    Ok(Json(SecretListResponse::page(secrets, total, offset, limit)))
}

#[instrument(skip(state), fields(project_id = %project.id()))]
pub async fn get_secret_handler(
    State(state): State<ApiState>,
    Extension(project): Extension<ProjectContext>,
    Path(id): Path<String>,
) -> Result<Json<SecretResponse>, ApiError> {
    let view = state.secrets.get_secret(project.id(), &id).await?;
    Ok(Json(SecretResponse::from(view)))
}

#[instrument(skip(state, headers), fields(project_id = %project.id()))]
pub async fn get_secret_payload_handler(
    State(state): State<ApiState>,
    Extension(project): Extension<ProjectContext>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let accept = header_value(&headers, header::ACCEPT)?;
    let payload = state.secrets.get_secret_payload(project.id(), &id, accept).await?;

    let body = payload.data.to_vec();
    Ok(([(header::CONTENT_TYPE, payload.content_type)], body).into_response())
}

#[instrument(skip(state, headers, body), fields(project_id = %project.id(), size = body.len()))]
pub async fn put_secret_payload_handler(
    State(state): State<ApiState>,
    Extension(project): Extension<ProjectContext>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let content_type = header_value(&headers, header::CONTENT_TYPE)?
        .ok_or_else(|| ApiError::bad_request("Content-Type header is required"))?;
    let content_encoding = header_value(&headers, header::CONTENT_ENCODING)?;

    state
        .secrets
        .put_payload(project.id(), &id, &body, content_type, content_encoding)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state), fields(project_id = %project.id()))]
pub async fn delete_secret_handler(
    State(state): State<ApiState>,
    Extension(project): Extension<ProjectContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.secrets.delete_secret(project.id(), &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
