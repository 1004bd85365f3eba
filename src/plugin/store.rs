//! The secret store plugin interface.

use crate::domain::{GenerationType, KeyAlgorithm, KeySpec, SecretType};
use crate::errors::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use zeroize::Zeroize;

/// Plugin-specific key/value metadata persisted with a secret
pub type SecretMetadata = BTreeMap<String, String>;

/// Ids of the secrets created for one asymmetric generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsymmetricSecretIds {
    pub private_key: String,
    pub public_key: String,
    pub passphrase: Option<String>,
}

/// Request context handed to every store operation
#[derive(Debug, Clone, Default)]
pub struct StoreContext {
    /// Internal project id
    pub project_id: String,
    /// Secret being stored or read. Set by the gateway once the row exists.
    pub secret_id: Option<String>,
    /// Normalized content type of the payload
    pub content_type: Option<String>,
    /// Secrets receiving the parts of an asymmetric generation
    pub asymmetric_ids: Option<AsymmetricSecretIds>,
}

impl StoreContext {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self { project_id: project_id.into(), ..Default::default() }
    }

    pub fn with_secret(mut self, secret_id: impl Into<String>) -> Self {
        self.secret_id = Some(secret_id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }
}

/// A secret crossing the plugin boundary.
///
/// `secret` is the base64 form of the payload; it is wiped when the DTO is
/// dropped.
#[derive(Clone)]
pub struct SecretDto {
    pub secret_type: SecretType,
    pub secret: String,
    pub key_spec: KeySpec,
    pub content_type: Option<String>,
    pub transport_key: Option<String>,
}

impl SecretDto {
    pub fn new(secret_type: SecretType, secret: String, key_spec: KeySpec) -> Self {
        Self { secret_type, secret, key_spec, content_type: None, transport_key: None }
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }
}

impl std::fmt::Debug for SecretDto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretDto")
            .field("secret_type", &self.secret_type)
            .field("secret", &"[REDACTED]")
            .field("key_spec", &self.key_spec)
            .field("content_type", &self.content_type)
            .finish()
    }
}

impl Drop for SecretDto {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Metadata for each secret produced by an asymmetric generation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsymmetricKeyMetadataDto {
    pub private_key_meta: SecretMetadata,
    pub public_key_meta: SecretMetadata,
    pub passphrase_meta: Option<SecretMetadata>,
}

/// A backend that can keep secrets.
///
/// Implementations return metadata that is persisted next to the secret and
/// handed back on retrieval and deletion.
#[async_trait]
pub trait SecretStorePlugin: Send + Sync + std::fmt::Debug {
    /// Name used in configuration and in stored metadata
    fn name(&self) -> &str;

    async fn generate_symmetric_key(
        &self,
        key_spec: &KeySpec,
        ctx: &StoreContext,
    ) -> Result<SecretMetadata>;

    async fn generate_asymmetric_key(
        &self,
        key_spec: &KeySpec,
        ctx: &StoreContext,
    ) -> Result<AsymmetricKeyMetadataDto>;

    async fn store_secret(&self, secret: &SecretDto, ctx: &StoreContext) -> Result<SecretMetadata>;

    async fn get_secret(
        &self,
        secret_type: SecretType,
        metadata: &SecretMetadata,
        ctx: &StoreContext,
    ) -> Result<SecretDto>;

    async fn delete_secret(&self, metadata: &SecretMetadata) -> Result<()>;

    fn generate_supports(&self, key_spec: &KeySpec) -> bool;

    fn store_secret_supports(&self, key_spec: &KeySpec) -> bool;

    /// PEM transport key for client-side wrapping, if the backend has one
    async fn get_transport_key(&self) -> Result<Option<String>> {
        Ok(None)
    }

    async fn is_transport_key_current(&self, _transport_key: &str) -> Result<bool> {
        Ok(false)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Generation kind for stores that accept the common algorithm families.
pub fn generation_type_supported(key_spec: &KeySpec) -> Option<GenerationType> {
    match key_spec.algorithm()? {
        KeyAlgorithm::Aes
        | KeyAlgorithm::Des
        | KeyAlgorithm::Desede
        | KeyAlgorithm::HmacSha1
        | KeyAlgorithm::HmacSha256
        | KeyAlgorithm::HmacSha384
        | KeyAlgorithm::HmacSha512 => Some(GenerationType::Symmetric),
        KeyAlgorithm::Rsa | KeyAlgorithm::Dsa | KeyAlgorithm::DiffieHellman | KeyAlgorithm::Ec => {
            Some(GenerationType::Asymmetric)
        }
    }
}
