//! Request and response types for the secrets API

use crate::domain::{SecretStatus, SecretType};
use crate::services::SecretView;
use crate::storage::SecretData;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

pub const DEFAULT_LIMIT: i64 = 10;
pub const MAX_LIMIT: i64 = 100;

/// Reference to a secret resource
pub fn secret_ref(id: &str) -> String {
    format!("/v1/secrets/{}", id)
}

/// Request to create a secret, with or without its payload
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct CreateSecretRequest {
    #[validate(length(max = 255))]
    pub name: Option<String>,

    #[serde(default)]
    pub secret_type: SecretType,

    #[validate(length(min = 1, max = 255))]
    pub algorithm: Option<String>,

    #[validate(range(min = 1))]
    pub bit_length: Option<u32>,

    #[validate(length(min = 1, max = 255))]
    pub mode: Option<String>,

    pub expiration: Option<DateTime<Utc>>,

    /// Text payload, or base64 when `payload_content_encoding` is `base64`
    #[validate(length(min = 1))]
    pub payload: Option<String>,

    pub payload_content_type: Option<String>,

    pub payload_content_encoding: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRefResponse {
    pub secret_ref: String,
}

/// Secret metadata; payloads are only served by the payload endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretResponse {
    pub secret_ref: String,
    pub name: Option<String>,
    pub secret_type: SecretType,
    pub algorithm: Option<String>,
    pub bit_length: Option<u32>,
    pub mode: Option<String>,
    pub status: SecretStatus,
    pub expiration: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_types: Option<BTreeMap<String, String>>,
}

impl SecretResponse {
    pub fn from_data(secret: &SecretData) -> Self {
        Self {
            secret_ref: secret_ref(&secret.id),
            name: secret.name.clone(),
            secret_type: secret.secret_type,
            algorithm: secret.algorithm.clone(),
            bit_length: secret.bit_length,
            mode: secret.mode.clone(),
            status: secret.status,
            expiration: secret.expiration,
            created: secret.created_at,
            updated: secret.updated_at,
            content_types: None,
        }
    }
}

impl From<SecretView> for SecretResponse {
    fn from(view: SecretView) -> Self {
        Self { content_types: view.content_types, ..Self::from_data(&view.secret) }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListSecretsQuery {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
    pub name: Option<String>,
}

impl ListSecretsQuery {
    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretListResponse {
    pub secrets: Vec<SecretResponse>,
    pub total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
}

impl SecretListResponse {
    pub fn page(secrets: Vec<SecretData>, total: i64, offset: i64, limit: i64) -> Self {
        let link = |offset: i64| format!("/v1/secrets?offset={}&limit={}", offset, limit);
        Self {
            secrets: secrets.iter().map(SecretResponse::from_data).collect(),
            total,
            next: (offset + limit < total).then(|| link(offset + limit)),
            previous: (offset > 0).then(|| link((offset - limit).max(0))),
        }
    }
}
