//! `store_crypto` secret store.
//!
//! Crypto plugins encrypt but keep nothing, so this store supplies the
//! persistence: each project gets a KEK row per crypto plugin, bound on first
//! use, and every secret gets an `encrypted_data` row holding the base64
//! ciphertext. The store returns no metadata of its own.

use super::crypto::{
    CryptoPlugin, CryptoPluginManager, DecryptDto, EncryptDto, GenerateDto, KekMetaDto,
    PluginSupportType, ResponseDto,
};
use super::store::{
    generation_type_supported, AsymmetricKeyMetadataDto, SecretDto, SecretMetadata,
    SecretStorePlugin, StoreContext,
};
use super::{PluginError, STORE_CRYPTO};
use crate::domain::{GenerationType, KeySpec, SecretType};
use crate::errors::{KeystashError, Result};
use crate::observability::MetricsRecorder;
use crate::storage::{
    DbPool, EncryptedDatumRepository, KekDatum, KekDatumRepository, NewEncryptedDatum,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone)]
pub struct StoreCryptoAdapter {
    crypto: Arc<CryptoPluginManager>,
    keks: KekDatumRepository,
    data: EncryptedDatumRepository,
    metrics: MetricsRecorder,
}

impl StoreCryptoAdapter {
    pub fn new(pool: DbPool, crypto: Arc<CryptoPluginManager>) -> Self {
        Self {
            crypto,
            keks: KekDatumRepository::new(pool.clone()),
            data: EncryptedDatumRepository::new(pool),
            metrics: MetricsRecorder::new(),
        }
    }

    /// The project's KEK for `plugin`, bound if this is its first use.
    #[instrument(skip(self, plugin), fields(plugin = plugin.name()))]
    async fn find_or_create_kek(
        &self,
        plugin: &dyn CryptoPlugin,
        project_id: &str,
    ) -> Result<(KekDatum, KekMetaDto)> {
        let datum = self.keks.find_or_create_active(project_id, plugin.name()).await?;
        if datum.bind_completed {
            let meta = KekMetaDto::from(&datum);
            return Ok((datum, meta));
        }

        let bound = plugin
            .bind_kek_metadata(KekMetaDto::from(&datum))
            .await?
            .ok_or_else(|| PluginError::KekBindingFailed { plugin: plugin.name().to_string() })?;

        let completed = KekDatum {
            algorithm: bound.algorithm.clone(),
            bit_length: bound.bit_length,
            mode: bound.mode.clone(),
            plugin_meta: bound.plugin_meta.clone(),
            bind_completed: true,
            ..datum
        };

        if self.keks.complete_binding(&completed).await? {
            info!(kek_label = %completed.kek_label, "Bound project KEK");
            return Ok((completed, bound));
        }

        // a concurrent request bound first; use its key
        debug!(kek_label = %completed.kek_label, "Project KEK bound concurrently");
        let winner = self
            .keks
            .get(&completed.id)
            .await?
            .ok_or_else(|| KeystashError::not_found("kek_datum", completed.id.clone()))?;
        let meta = KekMetaDto::from(&winner);
        Ok((winner, meta))
    }

    async fn save_datum(
        &self,
        secret_id: &str,
        kek: &KekDatum,
        content_type: Option<String>,
        response: ResponseDto,
    ) -> Result<()> {
        self.data
            .create(NewEncryptedDatum {
                secret_id: secret_id.to_string(),
                kek_id: kek.id.clone(),
                content_type,
                cypher_text: BASE64.encode(&response.cypher_text),
                kek_meta_extended: response.kek_meta_extended,
            })
            .await?;
        Ok(())
    }

    fn require_secret_id(ctx: &StoreContext) -> Result<&str> {
        ctx.secret_id
            .as_deref()
            .ok_or_else(|| KeystashError::internal("store_crypto requires a secret id in context"))
    }

    fn generate_dto(key_spec: &KeySpec, generation_type: GenerationType) -> Result<GenerateDto> {
        let (Some(algorithm), Some(bit_length)) = (key_spec.alg.clone(), key_spec.bit_length)
        else {
            return Err(PluginError::AlgorithmNotSupported {
                algorithm: key_spec.alg.clone().unwrap_or_default(),
            }
            .into());
        };
        Ok(GenerateDto {
            generation_type,
            algorithm,
            bit_length,
            mode: key_spec.mode.clone(),
            passphrase: key_spec.passphrase.clone(),
        })
    }

    /// Check the algorithm belongs to `expected` and find a plugin for it.
    async fn generating_plugin(
        &self,
        key_spec: &KeySpec,
        expected: GenerationType,
        project_id: &str,
    ) -> Result<Arc<dyn CryptoPlugin>> {
        if generation_type_supported(key_spec) != Some(expected) {
            return Err(PluginError::AlgorithmNotSupported {
                algorithm: key_spec.alg.clone().unwrap_or_default(),
            }
            .into());
        }
        let mode = match expected {
            GenerationType::Symmetric => key_spec.mode.as_deref(),
            GenerationType::Asymmetric => None,
        };
        self.crypto
            .get_plugin_store_generate(
                expected.into(),
                key_spec.alg.as_deref(),
                key_spec.bit_length,
                mode,
                Some(project_id),
            )
            .await
    }
}

#[async_trait]
impl SecretStorePlugin for StoreCryptoAdapter {
    fn name(&self) -> &str {
        STORE_CRYPTO
    }

    #[instrument(skip_all, fields(project_id = %ctx.project_id))]
    async fn store_secret(&self, secret: &SecretDto, ctx: &StoreContext) -> Result<SecretMetadata> {
        let secret_id = Self::require_secret_id(ctx)?;
        let plugin = self
            .crypto
            .get_plugin_store_generate(
                PluginSupportType::EncryptDecrypt,
                None,
                None,
                None,
                Some(&ctx.project_id),
            )
            .await?;
        let (kek, kek_meta) = self.find_or_create_kek(plugin.as_ref(), &ctx.project_id).await?;

        let plaintext = BASE64.decode(&secret.secret).map_err(|_| PluginError::PayloadDecoding)?;
        let response = plugin.encrypt(EncryptDto::new(plaintext), &kek_meta, &ctx.project_id).await;
        self.metrics.record_store_operation(STORE_CRYPTO, "store_secret", response.is_ok());

        let content_type = ctx.content_type.clone().or_else(|| secret.content_type.clone());
        self.save_datum(secret_id, &kek, content_type, response?).await?;
        Ok(SecretMetadata::new())
    }

    #[instrument(skip_all, fields(project_id = %ctx.project_id))]
    async fn get_secret(
        &self,
        secret_type: SecretType,
        _metadata: &SecretMetadata,
        ctx: &StoreContext,
    ) -> Result<SecretDto> {
        let secret_id = Self::require_secret_id(ctx)?;
        let datum = self.data.find_by_secret(secret_id).await?.ok_or(PluginError::SecretNotFound)?;
        let kek = self
            .keks
            .get(&datum.kek_id)
            .await?
            .ok_or_else(|| KeystashError::not_found("kek_datum", datum.kek_id.clone()))?;

        let plugin = self.crypto.get_plugin_retrieve(&kek.plugin_name)?;
        let encrypted = BASE64
            .decode(&datum.cypher_text)
            .map_err(|_| KeystashError::internal("Stored cypher text is not valid base64"))?;
        let plaintext = plugin
            .decrypt(
                DecryptDto { encrypted },
                &KekMetaDto::from(&kek),
                datum.kek_meta_extended.as_deref(),
                &ctx.project_id,
            )
            .await;
        self.metrics.record_store_operation(STORE_CRYPTO, "get_secret", plaintext.is_ok());

        Ok(SecretDto::new(secret_type, BASE64.encode(&plaintext?[..]), KeySpec::default())
            .with_content_type(datum.content_type))
    }

    async fn delete_secret(&self, _metadata: &SecretMetadata) -> Result<()> {
        // encrypted data is removed with the secret row
        Ok(())
    }

    #[instrument(skip_all, fields(project_id = %ctx.project_id))]
    async fn generate_symmetric_key(
        &self,
        key_spec: &KeySpec,
        ctx: &StoreContext,
    ) -> Result<SecretMetadata> {
        let secret_id = Self::require_secret_id(ctx)?;
        let plugin =
            self.generating_plugin(key_spec, GenerationType::Symmetric, &ctx.project_id).await?;
        let (kek, kek_meta) = self.find_or_create_kek(plugin.as_ref(), &ctx.project_id).await?;

        let dto = Self::generate_dto(key_spec, GenerationType::Symmetric)?;
        let response = plugin.generate_symmetric(dto, &kek_meta, &ctx.project_id).await;
        self.metrics.record_store_operation(STORE_CRYPTO, "generate_symmetric", response.is_ok());

        self.save_datum(secret_id, &kek, ctx.content_type.clone(), response?).await?;
        Ok(SecretMetadata::new())
    }

    #[instrument(skip_all, fields(project_id = %ctx.project_id))]
    async fn generate_asymmetric_key(
        &self,
        key_spec: &KeySpec,
        ctx: &StoreContext,
    ) -> Result<AsymmetricKeyMetadataDto> {
        let ids = ctx.asymmetric_ids.as_ref().ok_or_else(|| {
            KeystashError::internal("store_crypto requires key pair secret ids in context")
        })?;
        let plugin =
            self.generating_plugin(key_spec, GenerationType::Asymmetric, &ctx.project_id).await?;
        let (kek, kek_meta) = self.find_or_create_kek(plugin.as_ref(), &ctx.project_id).await?;

        let dto = Self::generate_dto(key_spec, GenerationType::Asymmetric)?;
        let pair = plugin.generate_asymmetric(dto, &kek_meta, &ctx.project_id).await;
        self.metrics.record_store_operation(STORE_CRYPTO, "generate_asymmetric", pair.is_ok());
        let pair = pair?;

        let content_type = ctx.content_type.clone();
        self.save_datum(&ids.private_key, &kek, content_type.clone(), pair.private_key).await?;
        self.save_datum(&ids.public_key, &kek, content_type.clone(), pair.public_key).await?;
        if let (Some(passphrase_id), Some(_), Some(passphrase)) =
            (&ids.passphrase, &key_spec.passphrase, pair.passphrase)
        {
            self.save_datum(passphrase_id, &kek, Some("text/plain".to_string()), passphrase)
                .await?;
        }

        Ok(AsymmetricKeyMetadataDto::default())
    }

    fn generate_supports(&self, key_spec: &KeySpec) -> bool {
        generation_type_supported(key_spec).is_some()
    }

    fn store_secret_supports(&self, _key_spec: &KeySpec) -> bool {
        true
    }
}
