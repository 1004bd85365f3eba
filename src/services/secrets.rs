//! Secret gateway service
//!
//! Stores, retrieves, deletes and generates secrets, dispatching payload work
//! to the secret store plugin chosen by the plugin registry. The secret row
//! always exists before the plugin is called so plugins can key their own
//! records by secret id; a failed plugin call removes it again.

use crate::domain::{KeySpec, SecretType};
use crate::errors::{KeystashError, Result};
use crate::plugin::{
    mime_types, translations, AsymmetricSecretIds, PluginError, SecretDto, SecretMetadata,
    SecretStorePlugin, SecretStorePluginManager, StoreContext, META_CONTENT_TYPE,
    META_PLUGIN_NAME,
};
use crate::storage::{
    ContainerData, ContainerMember, ContainerRepository, DbPool, NewContainer, NewSecret,
    ProjectData, ProjectRepository, SecretData, SecretListQuery, SecretMetadataRepository,
    SecretRepository,
};
use crate::config::SecretString;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn, Instrument};
use zeroize::Zeroizing;

/// Content type recorded for generated keys
const GENERATED_CONTENT_TYPE: &str = mime_types::OCTET_STREAM;

/// Accept value meaning "whatever was stored"
const ACCEPT_ANY: &str = "*/*";

pub const PRIVATE_KEY_MEMBER: &str = "private_key";
pub const PUBLIC_KEY_MEMBER: &str = "public_key";
pub const PASSPHRASE_MEMBER: &str = "private_key_passphrase";

/// A secret to create, optionally with its payload
#[derive(Debug, Clone, Default)]
pub struct CreateSecret {
    pub name: Option<String>,
    pub secret_type: SecretType,
    pub algorithm: Option<String>,
    pub bit_length: Option<u32>,
    pub mode: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    pub payload: Option<Zeroizing<Vec<u8>>>,
    pub payload_content_type: Option<String>,
    pub payload_content_encoding: Option<String>,
}

/// Key generation request
#[derive(Debug, Clone, Default)]
pub struct GenerateKey {
    pub name: Option<String>,
    pub algorithm: Option<String>,
    pub bit_length: Option<u32>,
    pub mode: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    pub passphrase: Option<SecretString>,
}

impl GenerateKey {
    fn key_spec(&self) -> KeySpec {
        KeySpec::new(self.algorithm.as_deref(), self.bit_length, self.mode.as_deref())
            .with_passphrase(self.passphrase.clone())
    }

    fn new_secret(
        &self,
        project_id: &str,
        secret_type: SecretType,
        name: Option<String>,
    ) -> NewSecret {
        NewSecret {
            project_id: project_id.to_string(),
            name,
            secret_type,
            algorithm: self.algorithm.as_ref().map(|a| a.to_ascii_lowercase()),
            bit_length: self.bit_length,
            mode: self.mode.clone(),
            expiration: self.expiration,
            creator_id: None,
        }
    }
}

/// Secret attributes plus the content types its payload can be read as
#[derive(Debug, Clone)]
pub struct SecretView {
    pub secret: SecretData,
    pub content_types: Option<BTreeMap<String, String>>,
}

/// Decrypted payload and the type it was rendered as
pub struct SecretPayload {
    pub content_type: String,
    pub data: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for SecretPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretPayload")
            .field("content_type", &self.content_type)
            .field("data", &"[REDACTED]")
            .finish()
    }
}

fn key_spec_of(secret: &SecretData) -> KeySpec {
    KeySpec::new(secret.algorithm.as_deref(), secret.bit_length, secret.mode.as_deref())
}

fn check_expiration(expiration: Option<DateTime<Utc>>) -> Result<()> {
    match expiration {
        Some(expiration) if expiration <= Utc::now() => Err(KeystashError::validation_field(
            "Expiration must be in the future",
            "expiration",
        )),
        _ => Ok(()),
    }
}

/// One-step payloads must name an encoding their content type accepts:
/// none for text, one of `base64`/`binary` for binary types. Unsupported
/// content types are left to the payload translation.
fn check_content_encoding(content_type: &str, content_encoding: Option<&str>) -> Result<()> {
    if !mime_types::is_supported(content_type)
        || mime_types::is_content_type_with_encoding_supported(content_type, content_encoding)
    {
        return Ok(());
    }
    let message = match mime_types::supported_encodings(content_type) {
        [] => format!("payload_content_encoding must be omitted for {}", content_type),
        encodings => format!("payload_content_encoding must be one of {}", encodings.join(", ")),
    };
    Err(KeystashError::validation_field(message, "payload_content_encoding"))
}

/// Service for the secret lifecycle
#[derive(Debug, Clone)]
pub struct SecretService {
    projects: ProjectRepository,
    secrets: SecretRepository,
    metadata: SecretMetadataRepository,
    containers: ContainerRepository,
    stores: Arc<SecretStorePluginManager>,
}

impl SecretService {
    pub fn new(pool: DbPool, stores: Arc<SecretStorePluginManager>) -> Self {
        Self {
            projects: ProjectRepository::new(pool.clone()),
            secrets: SecretRepository::new(pool.clone()),
            metadata: SecretMetadataRepository::new(pool.clone()),
            containers: ContainerRepository::new(pool),
            stores,
        }
    }

    async fn project(&self, external_id: &str) -> Result<ProjectData> {
        self.projects.find_or_create(external_id).await
    }

    /// A secret of the project that has not expired.
    async fn active_secret(&self, project: &ProjectData, secret_id: &str) -> Result<SecretData> {
        self.secrets
            .get(&project.id, secret_id)
            .await?
            .filter(|secret| !secret.is_expired(Utc::now()))
            .ok_or_else(|| KeystashError::not_found("secret", secret_id))
    }

    /// Remove rows created for a request whose plugin call failed.
    async fn discard(&self, project_id: &str, secret_ids: &[&str]) {
        for secret_id in secret_ids {
            if let Err(e) = self.secrets.delete(project_id, secret_id).await {
                warn!(secret_id, error = %e, "Failed to remove secret after plugin failure");
            }
        }
    }

    /// Create a secret; with a payload, also store it through a plugin.
    #[instrument(
        skip(self, request),
        fields(secret_type = %request.secret_type),
        name = "store_secret"
    )]
    pub async fn store_secret(
        &self,
        project_id: &str,
        request: CreateSecret,
    ) -> Result<SecretData> {
        check_expiration(request.expiration)?;
        if request.payload.is_some() && request.payload_content_type.is_none() {
            return Err(KeystashError::validation_field(
                "payload_content_type is required when payload is given",
                "payload_content_type",
            ));
        }
        if request.payload.is_none() && request.payload_content_type.is_some() {
            return Err(PluginError::NoPayloadProvided.into());
        }
        if let Some(content_type) = request.payload_content_type.as_deref() {
            check_content_encoding(content_type, request.payload_content_encoding.as_deref())?;
        }

        let project = self.project(project_id).await?;
        let secret = self
            .secrets
            .create(NewSecret {
                project_id: project.id.clone(),
                name: request.name.clone(),
                secret_type: request.secret_type,
                algorithm: request.algorithm.as_ref().map(|a| a.to_ascii_lowercase()),
                bit_length: request.bit_length,
                mode: request.mode.clone(),
                expiration: request.expiration,
                creator_id: None,
            })
            .await?;

        let (Some(payload), Some(content_type)) = (&request.payload, &request.payload_content_type)
        else {
            info!(secret_id = %secret.id, "Created secret without payload");
            return Ok(secret);
        };

        if let Err(e) = self
            .store_payload(
                &project,
                &secret,
                payload,
                content_type,
                request.payload_content_encoding.as_deref(),
                true,
            )
            .await
        {
            self.discard(&project.id, &[&secret.id]).await;
            return Err(e);
        }

        info!(secret_id = %secret.id, "Stored secret");
        Ok(secret)
    }

    /// Upload the payload of a secret created without one.
    #[instrument(skip(self, payload), name = "put_secret_payload")]
    pub async fn put_payload(
        &self,
        project_id: &str,
        secret_id: &str,
        payload: &[u8],
        content_type: &str,
        content_encoding: Option<&str>,
    ) -> Result<()> {
        let project = self.project(project_id).await?;
        let secret = self.active_secret(&project, secret_id).await?;
        if !self.metadata.get(&secret.id).await?.is_empty() {
            return Err(KeystashError::conflict("Secret already has data", "secret"));
        }

        self.store_payload(&project, &secret, payload, content_type, content_encoding, false)
            .await?;
        info!(secret_id = %secret.id, "Stored secret payload");
        Ok(())
    }

    async fn store_payload(
        &self,
        project: &ProjectData,
        secret: &SecretData,
        payload: &[u8],
        content_type: &str,
        content_encoding: Option<&str>,
        enforce_text_only: bool,
    ) -> Result<()> {
        let normalized = translations::normalize_before_encryption(
            payload,
            content_type,
            content_encoding,
            secret.secret_type,
            enforce_text_only,
        )?;

        let key_spec = key_spec_of(secret);
        let plugin = self.stores.get_plugin_store(&key_spec, None, false, Some(&project.id)).await?;

        let ctx = StoreContext::new(&project.id)
            .with_secret(&secret.id)
            .with_content_type(Some(normalized.content_type.clone()));
        let dto = SecretDto::new(secret.secret_type, normalized.payload.clone(), key_spec)
            .with_content_type(Some(normalized.content_type.clone()));

        let metadata = plugin
            .store_secret(&dto, &ctx)
            .instrument(crate::plugin_span!(plugin.name(), "store_secret"))
            .await?;
        self.save_metadata(&secret.id, metadata, plugin.as_ref(), &normalized.content_type).await
    }

    async fn save_metadata(
        &self,
        secret_id: &str,
        mut metadata: SecretMetadata,
        plugin: &dyn SecretStorePlugin,
        content_type: &str,
    ) -> Result<()> {
        metadata.insert(META_PLUGIN_NAME.to_string(), plugin.name().to_string());
        metadata.insert(META_CONTENT_TYPE.to_string(), content_type.to_string());
        self.metadata.save(secret_id, &metadata).await
    }

    /// Secret attributes and the content types its payload is available as.
    #[instrument(skip(self), name = "get_secret")]
    pub async fn get_secret(&self, project_id: &str, secret_id: &str) -> Result<SecretView> {
        let project = self.project(project_id).await?;
        let secret = self.active_secret(&project, secret_id).await?;
        let metadata = self.metadata.get(&secret.id).await?;
        let content_types =
            metadata.get(META_CONTENT_TYPE).and_then(|ct| mime_types::content_types_for(ct));
        Ok(SecretView { secret, content_types })
    }

    #[instrument(skip(self, query), name = "list_secrets")]
    pub async fn list_secrets(
        &self,
        project_id: &str,
        query: &SecretListQuery,
    ) -> Result<(Vec<SecretData>, i64)> {
        let project = self.project(project_id).await?;
        self.secrets.list(&project.id, query).await
    }

    /// Decrypted payload rendered as `accept` (`*/*` or none for the stored type).
    #[instrument(skip(self), name = "get_secret_payload")]
    pub async fn get_secret_payload(
        &self,
        project_id: &str,
        secret_id: &str,
        accept: Option<&str>,
    ) -> Result<SecretPayload> {
        let project = self.project(project_id).await?;
        let secret = self.active_secret(&project, secret_id).await?;
        let metadata = self.metadata.get(&secret.id).await?;
        let plugin_name = metadata.get(META_PLUGIN_NAME).ok_or(PluginError::SecretNotFound)?;
        let stored_type = metadata
            .get(META_CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| mime_types::OCTET_STREAM.to_string());

        let accept = match accept.map(str::trim) {
            None | Some("") | Some(ACCEPT_ANY) => stored_type.clone(),
            Some(accept) => mime_types::normalize_content_type(accept),
        };
        translations::analyze_before_decryption(&accept)?;

        let plugin = self.stores.get_plugin_retrieve_delete(plugin_name)?;
        let ctx = StoreContext::new(&project.id)
            .with_secret(&secret.id)
            .with_content_type(Some(stored_type));
        let dto = plugin
            .get_secret(secret.secret_type, &metadata, &ctx)
            .instrument(crate::plugin_span!(plugin.name(), "get_secret"))
            .await?;

        let data = translations::denormalize_after_decryption(&dto.secret, &accept)?;
        Ok(SecretPayload { content_type: accept, data: Zeroizing::new(data) })
    }

    /// Delete a secret, telling its plugin first if a payload was stored.
    #[instrument(skip(self), name = "delete_secret")]
    pub async fn delete_secret(&self, project_id: &str, secret_id: &str) -> Result<()> {
        let project = self.project(project_id).await?;
        let secret = self.active_secret(&project, secret_id).await?;
        let metadata = self.metadata.get(&secret.id).await?;

        if let Some(plugin_name) = metadata.get(META_PLUGIN_NAME) {
            let plugin = self.stores.get_plugin_retrieve_delete(plugin_name)?;
            plugin
                .delete_secret(&metadata)
                .instrument(crate::plugin_span!(plugin.name(), "delete_secret"))
                .await?;
        }

        self.secrets.delete(&project.id, &secret.id).await?;
        info!(secret_id = %secret.id, "Deleted secret");
        Ok(())
    }

    /// Generate a symmetric key into a new secret.
    #[instrument(
        skip(self, request),
        fields(algorithm = ?request.algorithm),
        name = "generate_symmetric"
    )]
    pub async fn generate_symmetric(
        &self,
        project_id: &str,
        request: GenerateKey,
    ) -> Result<SecretData> {
        check_expiration(request.expiration)?;
        let project = self.project(project_id).await?;
        let key_spec = request.key_spec();
        let plugin = self.stores.get_plugin_generate(&key_spec, Some(&project.id)).await?;

        let secret = self
            .secrets
            .create(request.new_secret(&project.id, SecretType::Symmetric, request.name.clone()))
            .await?;
        let ctx = StoreContext::new(&project.id)
            .with_secret(&secret.id)
            .with_content_type(Some(GENERATED_CONTENT_TYPE.to_string()));

        let result: Result<()> = async {
            let metadata = plugin
                .generate_symmetric_key(&key_spec, &ctx)
                .instrument(crate::plugin_span!(plugin.name(), "generate_symmetric_key"))
                .await?;
            self.save_metadata(&secret.id, metadata, plugin.as_ref(), GENERATED_CONTENT_TYPE).await
        }
        .await;
        if let Err(e) = result {
            self.discard(&project.id, &[&secret.id]).await;
            return Err(e);
        }

        info!(secret_id = %secret.id, plugin = plugin.name(), "Generated symmetric key");
        Ok(secret)
    }

    /// Generate a key pair; the secrets are grouped in a new container.
    #[instrument(
        skip(self, request),
        fields(algorithm = ?request.algorithm),
        name = "generate_asymmetric"
    )]
    pub async fn generate_asymmetric(
        &self,
        project_id: &str,
        request: GenerateKey,
    ) -> Result<ContainerData> {
        check_expiration(request.expiration)?;
        let project = self.project(project_id).await?;
        let key_spec = request.key_spec();
        let plugin = self.stores.get_plugin_generate(&key_spec, Some(&project.id)).await?;

        let member_name = |suffix: &str| request.name.as_ref().map(|n| format!("{n} {suffix}"));
        let private_key = self
            .secrets
            .create(request.new_secret(
                &project.id,
                SecretType::Private,
                member_name("private key"),
            ))
            .await?;
        let public_key = self
            .secrets
            .create(request.new_secret(
                &project.id,
                SecretType::Public,
                member_name("public key"),
            ))
            .await?;
        let passphrase = match &key_spec.passphrase {
            Some(_) => Some(
                self.secrets
                    .create(NewSecret {
                        algorithm: None,
                        bit_length: None,
                        mode: None,
                        ..request.new_secret(
                            &project.id,
                            SecretType::Passphrase,
                            member_name("passphrase"),
                        )
                    })
                    .await?,
            ),
            None => None,
        };

        let mut ctx = StoreContext::new(&project.id)
            .with_content_type(Some(GENERATED_CONTENT_TYPE.to_string()));
        ctx.asymmetric_ids = Some(AsymmetricSecretIds {
            private_key: private_key.id.clone(),
            public_key: public_key.id.clone(),
            passphrase: passphrase.as_ref().map(|p| p.id.clone()),
        });

        let result: Result<ContainerData> = async {
            let generated = plugin
                .generate_asymmetric_key(&key_spec, &ctx)
                .instrument(crate::plugin_span!(plugin.name(), "generate_asymmetric_key"))
                .await?;
            self.save_metadata(
                &private_key.id,
                generated.private_key_meta,
                plugin.as_ref(),
                GENERATED_CONTENT_TYPE,
            )
            .await?;
            self.save_metadata(
                &public_key.id,
                generated.public_key_meta,
                plugin.as_ref(),
                GENERATED_CONTENT_TYPE,
            )
            .await?;
            if let Some(passphrase) = &passphrase {
                let metadata = generated.passphrase_meta.unwrap_or_default();
                self.save_metadata(
                    &passphrase.id,
                    metadata,
                    plugin.as_ref(),
                    mime_types::TEXT_PLAIN,
                )
                .await?;
            }

            let mut members = vec![
                ContainerMember {
                    name: PRIVATE_KEY_MEMBER.to_string(),
                    secret_id: private_key.id.clone(),
                },
                ContainerMember {
                    name: PUBLIC_KEY_MEMBER.to_string(),
                    secret_id: public_key.id.clone(),
                },
            ];
            if let Some(passphrase) = &passphrase {
                members.push(ContainerMember {
                    name: PASSPHRASE_MEMBER.to_string(),
                    secret_id: passphrase.id.clone(),
                });
            }
            self.containers
                .create(NewContainer {
                    project_id: project.id.clone(),
                    name: request.name.clone(),
                    container_type: key_spec.alg.clone().unwrap_or_default(),
                    creator_id: None,
                    members,
                })
                .await
        }
        .await;

        match result {
            Ok(container) => {
                info!(container_id = %container.id, plugin = plugin.name(), "Generated key pair");
                Ok(container)
            }
            Err(e) => {
                let mut ids = vec![private_key.id.as_str(), public_key.id.as_str()];
                if let Some(passphrase) = &passphrase {
                    ids.push(passphrase.id.as_str());
                }
                self.discard(&project.id, &ids).await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self), name = "get_container")]
    pub async fn get_container(
        &self,
        project_id: &str,
        container_id: &str,
    ) -> Result<ContainerData> {
        let project = self.project(project_id).await?;
        self.containers
            .get(&project.id, container_id)
            .await?
            .ok_or_else(|| KeystashError::not_found("container", container_id))
    }

    #[instrument(skip(self), name = "list_containers")]
    pub async fn list_containers(
        &self,
        project_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<ContainerData>, i64)> {
        let project = self.project(project_id).await?;
        self.containers.list(&project.id, offset, limit).await
    }

    /// Delete a container. Its member secrets are left in place.
    #[instrument(skip(self), name = "delete_container")]
    pub async fn delete_container(&self, project_id: &str, container_id: &str) -> Result<()> {
        let project = self.project(project_id).await?;
        if !self.containers.delete(&project.id, container_id).await? {
            return Err(KeystashError::not_found("container", container_id));
        }
        info!(container_id, "Deleted container");
        Ok(())
    }
}
