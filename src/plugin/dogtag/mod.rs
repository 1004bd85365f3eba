//! Dogtag KRA secret store.
//!
//! Secrets are archived in the Key Recovery Authority as `passPhrase` data
//! and keys can be generated there. The KRA cannot delete keys, so deletion
//! only forgets the reference.

pub mod client;

pub use client::KraClient;

use self::client::{
    AES_ALGORITHM, DECRYPT_USAGE, DES3_ALGORITHM, DES_ALGORITHM, DSA_ALGORITHM, ENCRYPT_USAGE,
    PASS_PHRASE_TYPE, RSA_ALGORITHM,
};
use super::store::{
    AsymmetricKeyMetadataDto, SecretDto, SecretMetadata, SecretStorePlugin, StoreContext,
};
use super::translations;
use super::{PluginError, DOGTAG_PLUGIN};
use crate::config::DogtagConfig;
use crate::domain::{KeyAlgorithm, KeySpec, SecretType};
use crate::errors::{KeystashError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::{debug, instrument};
use zeroize::Zeroizing;

pub const KEY_ID: &str = "key_id";
pub const ALG: &str = "alg";
pub const BIT_LENGTH: &str = "bit_length";
pub const SECRET_MODE: &str = "mode";
pub const GENERATED: &str = "generated";
pub const PASSPHRASE_KEY_ID: &str = "passphrase_key_id";
/// Set on generated key pairs, which the KRA returns as DER
pub const CONVERT_TO_PEM: &str = "convert_to_pem";

/// KRA algorithm name for a keystash algorithm
fn kra_algorithm(alg: Option<&str>) -> Option<&'static str> {
    match alg?.parse::<KeyAlgorithm>().ok()? {
        KeyAlgorithm::Aes => Some(AES_ALGORITHM),
        KeyAlgorithm::Des => Some(DES_ALGORITHM),
        KeyAlgorithm::Desede => Some(DES3_ALGORITHM),
        KeyAlgorithm::Dsa => Some(DSA_ALGORITHM),
        KeyAlgorithm::Rsa => Some(RSA_ALGORITHM),
        _ => None,
    }
}

fn client_key_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn pem_error(what: &str, e: impl std::fmt::Display) -> PluginError {
    PluginError::general(format!("Could not convert {what} to PEM: {e}"))
}

fn unsupported_algorithm(algorithm: &str) -> KeystashError {
    PluginError::AlgorithmNotSupported { algorithm: algorithm.to_string() }.into()
}

#[derive(Debug, Clone)]
pub struct DogtagKraStore {
    client: KraClient,
}

impl DogtagKraStore {
    pub fn new(config: &DogtagConfig) -> Result<Self> {
        if config.nss_db_path.is_some() && config.nss_password.is_none() {
            return Err(PluginError::config("dogtag_plugin.nss_password is required").into());
        }
        if let Some(nss_db_path) = &config.nss_db_path {
            debug!(
                path = %nss_db_path.display(),
                "NSS database configured; TLS uses the PEM identity"
            );
        }
        Ok(Self::with_client(KraClient::new(config)?))
    }

    pub fn with_client(client: KraClient) -> Self {
        Self { client }
    }

    fn key_spec_from(metadata: &SecretMetadata) -> KeySpec {
        KeySpec::new(
            metadata.get(ALG).map(String::as_str),
            metadata.get(BIT_LENGTH).and_then(|b| b.parse().ok()),
            metadata.get(SECRET_MODE).map(String::as_str),
        )
    }

    /// Passphrase archived alongside a generated private key, if any.
    async fn private_key_passphrase(
        &self,
        metadata: &SecretMetadata,
        key_spec: &KeySpec,
        secret_type: SecretType,
    ) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let Some(passphrase_key_id) = metadata.get(PASSPHRASE_KEY_ID) else {
            return Ok(None);
        };
        match kra_algorithm(key_spec.alg.as_deref()) {
            Some(RSA_ALGORITHM) => Ok(Some(self.client.retrieve_key(passphrase_key_id).await?)),
            Some(DSA_ALGORITHM) => Err(PluginError::general(
                "DSA keys should not have a passphrase in the database, \
                 for being used during retrieval.",
            )
            .into()),
            _ => Err(PluginError::general(format!(
                "Secrets of type {secret_type} should not have a passphrase in the database, \
                 for being used during retrieval."
            ))
            .into()),
        }
    }

    /// PEM form of a KRA-generated key pair half.
    async fn generated_key_pem(
        &self,
        key_id: &str,
        secret_type: SecretType,
        key_spec: &KeySpec,
        metadata: &SecretMetadata,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let algorithm = kra_algorithm(key_spec.alg.as_deref()).ok_or_else(|| {
            PluginError::AlgorithmNotSupported {
                algorithm: key_spec.alg.clone().unwrap_or_else(|| "None".to_string()),
            }
        })?;

        if secret_type == SecretType::Public {
            let info = self.client.get_key_info(key_id).await?;
            let der = info
                .public_key
                .as_deref()
                .map(|k| BASE64.decode(k))
                .transpose()
                .map_err(|_| PluginError::PayloadDecoding)?
                .ok_or_else(|| {
                    PluginError::general(format!("KRA key {key_id} has no public key"))
                })?;
            return match algorithm {
                RSA_ALGORITHM => {
                    let key = RsaPublicKey::from_public_key_der(&der)
                        .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
                        .map_err(|e| pem_error("public key", e))?;
                    let pem = key
                        .to_public_key_pem(LineEnding::LF)
                        .map_err(|e| pem_error("public key", e))?;
                    Ok(Zeroizing::new(pem.into_bytes()))
                }
                DSA_ALGORITHM => Ok(Zeroizing::new(translations::convert_der_to_pem(
                    &der,
                    SecretType::Public,
                )?)),
                other => Err(unsupported_algorithm(other)),
            };
        }

        let passphrase = self.private_key_passphrase(metadata, key_spec, secret_type).await?;
        let der = self.client.retrieve_key(key_id).await?;
        match algorithm {
            RSA_ALGORITHM => {
                let key = RsaPrivateKey::from_pkcs8_der(&der)
                    .or_else(|_| RsaPrivateKey::from_pkcs1_der(&der))
                    .map_err(|e| pem_error("private key", e))?;
                let pem = match passphrase {
                    Some(passphrase) => key.to_pkcs8_encrypted_pem(
                        &mut rand::rngs::OsRng,
                        passphrase.as_slice(),
                        LineEnding::LF,
                    ),
                    None => key.to_pkcs8_pem(LineEnding::LF),
                }
                .map_err(|e| pem_error("private key", e))?;
                Ok(Zeroizing::new(pem.as_bytes().to_vec()))
            }
            DSA_ALGORITHM => Ok(Zeroizing::new(translations::convert_der_to_pem(
                &der,
                SecretType::Private,
            )?)),
            other => Err(unsupported_algorithm(other)),
        }
    }
}

#[async_trait]
impl SecretStorePlugin for DogtagKraStore {
    fn name(&self) -> &str {
        DOGTAG_PLUGIN
    }

    #[instrument(
        skip(self, secret, _ctx),
        fields(secret_type = %secret.secret_type),
        name = "dogtag_store_secret"
    )]
    async fn store_secret(
        &self,
        secret: &SecretDto,
        _ctx: &StoreContext,
    ) -> Result<SecretMetadata> {
        let data = Zeroizing::new(
            BASE64.decode(secret.secret.as_bytes()).map_err(|_| PluginError::PayloadDecoding)?,
        );
        let key_id = self.client.archive_key(&client_key_id(), PASS_PHRASE_TYPE, &data).await?;

        let mut metadata = SecretMetadata::from([(KEY_ID.to_string(), key_id)]);
        let spec = &secret.key_spec;
        if let Some(alg) = &spec.alg {
            metadata.insert(ALG.to_string(), alg.clone());
        }
        if let Some(bit_length) = spec.bit_length {
            metadata.insert(BIT_LENGTH.to_string(), bit_length.to_string());
        }
        if let Some(mode) = &spec.mode {
            metadata.insert(SECRET_MODE.to_string(), mode.clone());
        }
        Ok(metadata)
    }

    #[instrument(skip(self, metadata, _ctx), name = "dogtag_get_secret")]
    async fn get_secret(
        &self,
        secret_type: SecretType,
        metadata: &SecretMetadata,
        _ctx: &StoreContext,
    ) -> Result<SecretDto> {
        let key_id = metadata
            .get(KEY_ID)
            .ok_or_else(|| PluginError::general("Secret metadata has no key_id"))?;
        let key_spec = Self::key_spec_from(metadata);

        let pem_pair_half = metadata.contains_key(CONVERT_TO_PEM)
            && matches!(secret_type, SecretType::Public | SecretType::Private);
        let recovered = if pem_pair_half {
            self.generated_key_pem(key_id, secret_type, &key_spec, metadata).await?
        } else {
            self.client.retrieve_key(key_id).await?
        };

        Ok(SecretDto::new(secret_type, BASE64.encode(recovered.as_slice()), key_spec))
    }

    /// The KRA offers no deletion.
    async fn delete_secret(&self, _metadata: &SecretMetadata) -> Result<()> {
        Ok(())
    }

    #[instrument(skip(self, _ctx), name = "dogtag_generate_symmetric")]
    async fn generate_symmetric_key(
        &self,
        key_spec: &KeySpec,
        _ctx: &StoreContext,
    ) -> Result<SecretMetadata> {
        let algorithm = kra_algorithm(key_spec.alg.as_deref())
            .ok_or_else(|| unsupported_algorithm(key_spec.alg.as_deref().unwrap_or_default()))?;
        if key_spec.passphrase.is_some() {
            return Err(PluginError::GenerateNotSupported {
                reason: "Passphrase encryption is not supported for symmetric key \
                         generating algorithms."
                    .to_string(),
            }
            .into());
        }

        let key_id = self
            .client
            .generate_symmetric_key(
                &client_key_id(),
                algorithm,
                key_spec.bit_length,
                &[DECRYPT_USAGE, ENCRYPT_USAGE],
            )
            .await?;

        let mut metadata = SecretMetadata::from([
            (KEY_ID.to_string(), key_id),
            (GENERATED.to_string(), "true".to_string()),
        ]);
        if let Some(alg) = &key_spec.alg {
            metadata.insert(ALG.to_string(), alg.clone());
        }
        if let Some(bit_length) = key_spec.bit_length {
            metadata.insert(BIT_LENGTH.to_string(), bit_length.to_string());
        }
        if let Some(mode) = &key_spec.mode {
            metadata.insert(SECRET_MODE.to_string(), mode.clone());
        }
        Ok(metadata)
    }

    #[instrument(skip(self, _ctx), name = "dogtag_generate_asymmetric")]
    async fn generate_asymmetric_key(
        &self,
        key_spec: &KeySpec,
        _ctx: &StoreContext,
    ) -> Result<AsymmetricKeyMetadataDto> {
        let algorithm = kra_algorithm(key_spec.alg.as_deref())
            .ok_or_else(|| unsupported_algorithm(key_spec.alg.as_deref().unwrap_or_default()))?;

        let mut passphrase_meta = None;
        if let Some(passphrase) = &key_spec.passphrase {
            if algorithm == DSA_ALGORITHM {
                return Err(PluginError::GenerateNotSupported {
                    reason: "Passphrase encryption is not supported for DSA algorithm".to_string(),
                }
                .into());
            }
            let key_id = self
                .client
                .archive_key(
                    &client_key_id(),
                    PASS_PHRASE_TYPE,
                    passphrase.expose_secret().as_bytes(),
                )
                .await?;
            passphrase_meta = Some(SecretMetadata::from([(KEY_ID.to_string(), key_id)]));
        }

        let key_id = self
            .client
            .generate_asymmetric_key(
                &client_key_id(),
                algorithm,
                key_spec.bit_length,
                &[DECRYPT_USAGE, ENCRYPT_USAGE],
            )
            .await?;

        let mut public_key_meta = SecretMetadata::from([
            (KEY_ID.to_string(), key_id),
            (CONVERT_TO_PEM.to_string(), "true".to_string()),
            (GENERATED.to_string(), "true".to_string()),
        ]);
        if let Some(alg) = &key_spec.alg {
            public_key_meta.insert(ALG.to_string(), alg.clone());
        }
        if let Some(bit_length) = key_spec.bit_length {
            public_key_meta.insert(BIT_LENGTH.to_string(), bit_length.to_string());
        }

        let mut private_key_meta = public_key_meta.clone();
        if let Some(passphrase_meta) = &passphrase_meta {
            private_key_meta.insert(PASSPHRASE_KEY_ID.to_string(), passphrase_meta[KEY_ID].clone());
        }

        Ok(AsymmetricKeyMetadataDto { private_key_meta, public_key_meta, passphrase_meta })
    }

    fn generate_supports(&self, key_spec: &KeySpec) -> bool {
        kra_algorithm(key_spec.alg.as_deref()).is_some()
    }

    fn store_secret_supports(&self, _key_spec: &KeySpec) -> bool {
        true
    }
}
