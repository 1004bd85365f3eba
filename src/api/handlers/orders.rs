//! Key generation orders
//!
//! Orders complete synchronously: the response already names the generated
//! secret (`key`) or key pair container (`asymmetric`).

use axum::{extract::State, http::StatusCode, Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use validator::Validate;

use super::containers::container_ref;
use super::secrets::secret_ref;
use crate::{
    api::{error::ApiError, middleware::ProjectContext, routes::ApiState},
    config::SecretString,
    domain::SecretStatus,
    errors::Error,
    services::GenerateKey,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Key,
    Asymmetric,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct OrderMeta {
    #[validate(length(max = 255))]
    pub name: Option<String>,

    #[validate(length(min = 1, max = 255))]
    pub algorithm: Option<String>,

    #[validate(range(min = 1))]
    pub bit_length: Option<u32>,

    pub mode: Option<String>,

    pub expiration: Option<DateTime<Utc>>,

    /// Only `application/octet-stream` is produced for generated keys
    pub payload_content_type: Option<String>,

    /// Protects a generated private key
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[serde(rename = "type")]
    pub order_type: OrderType,

    #[validate(nested)]
    pub meta: OrderMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub status: SecretStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_ref: Option<String>,
}

#[instrument(
    skip(state, payload),
    fields(project_id = %project.id(), order_type = ?payload.order_type)
)]
pub async fn create_order_handler(
    State(state): State<ApiState>,
    Extension(project): Extension<ProjectContext>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderResponse>), ApiError> {
    payload.validate().map_err(|err| ApiError::from(Error::from(err)))?;

    let meta = payload.meta;
    if let Some(content_type) = meta.payload_content_type.as_deref() {
        if crate::plugin::mime_types::normalize_content_type(content_type)
            != crate::plugin::mime_types::OCTET_STREAM
        {
            return Err(ApiError::bad_request(format!(
                "Generated keys are only available as application/octet-stream, not '{}'",
                content_type
            )));
        }
    }
    if meta.algorithm.is_none() {
        return Err(ApiError::bad_request("meta.algorithm is required"));
    }

    let request = GenerateKey {
        name: meta.name,
        algorithm: meta.algorithm,
        bit_length: meta.bit_length,
        mode: meta.mode,
        expiration: meta.expiration,
        passphrase: meta.passphrase.map(SecretString::new),
    };

    let response = match payload.order_type {
        OrderType::Key => {
            if request.passphrase.is_some() {
                return Err(ApiError::bad_request("passphrase only applies to asymmetric orders"));
            }
            let secret = state.secrets.generate_symmetric(project.id(), request).await?;
            OrderResponse {
                order_type: OrderType::Key,
                status: SecretStatus::Active,
                secret_ref: Some(secret_ref(&secret.id)),
                container_ref: None,
            }
        }
        OrderType::Asymmetric => {
            let container = state.secrets.generate_asymmetric(project.id(), request).await?;
            OrderResponse {
                order_type: OrderType::Asymmetric,
                status: SecretStatus::Active,
                secret_ref: None,
                container_ref: Some(container_ref(&container.id)),
            }
        }
    };

    Ok((StatusCode::ACCEPTED, Json(response)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_request_parses() {
        let request: CreateOrderRequest = serde_json::from_value(serde_json::json!({
            "type": "asymmetric",
            "meta": { "algorithm": "rsa", "bit_length": 2048, "passphrase": "pw" }
        }))
        .unwrap();
        assert_eq!(request.order_type, OrderType::Asymmetric);
        assert_eq!(request.meta.bit_length, Some(2048));
        assert!(request.validate().is_ok());

        let zero: CreateOrderRequest = serde_json::from_value(serde_json::json!({
            "type": "key",
            "meta": { "algorithm": "aes", "bit_length": 0 }
        }))
        .unwrap();
        assert!(zero.validate().is_err());
    }
}
