//! Crypto plugins for the `store_crypto` secret store
//!
//! A crypto plugin encrypts secrets under a per-project key-encryption key.
//! Keystash persists whatever the plugin writes into [`KekMetaDto`] when the
//! project KEK is bound, and hands it back on every later call, together with
//! the per-secret `kek_meta_extended` from [`ResponseDto`].

pub mod aead;
pub mod kek_cache;
pub mod manager;
pub mod p11;
pub mod simple;

pub use kek_cache::ProjectKekCache;
pub use manager::CryptoPluginManager;
pub use p11::P11CryptoPlugin;
pub use simple::SimpleCryptoPlugin;

use crate::config::SecretString;
use crate::domain::GenerationType;
use crate::errors::Result;
use crate::storage::KekDatum;
use async_trait::async_trait;
use std::fmt;
use zeroize::Zeroizing;

/// Operation families a crypto plugin may support
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginSupportType {
    EncryptDecrypt,
    SymmetricKeyGeneration,
    AsymmetricKeyGeneration,
}

impl From<GenerationType> for PluginSupportType {
    fn from(generation_type: GenerationType) -> Self {
        match generation_type {
            GenerationType::Symmetric => Self::SymmetricKeyGeneration,
            GenerationType::Asymmetric => Self::AsymmetricKeyGeneration,
        }
    }
}

impl fmt::Display for PluginSupportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::EncryptDecrypt => "encrypt_decrypt",
            Self::SymmetricKeyGeneration => "symmetric_key_generation",
            Self::AsymmetricKeyGeneration => "asymmetric_key_generation",
        })
    }
}

pub const SYMMETRIC_ALGORITHMS: &[&str] =
    &["aes", "des", "3des", "desede", "hmacsha1", "hmacsha256", "hmacsha384", "hmacsha512"];
pub const SYMMETRIC_KEY_LENGTHS: &[u32] = &[64, 128, 192, 256];
pub const ASYMMETRIC_ALGORITHMS: &[&str] = &["rsa", "dsa"];
pub const ASYMMETRIC_KEY_LENGTHS: &[u32] = &[1024, 2048, 4096];

pub fn is_symmetric_supported(algorithm: Option<&str>, bit_length: Option<u32>) -> bool {
    matches!(
        (algorithm, bit_length),
        (Some(alg), Some(bits)) if SYMMETRIC_ALGORITHMS.contains(&alg.to_ascii_lowercase().as_str())
            && SYMMETRIC_KEY_LENGTHS.contains(&bits)
    )
}

pub fn is_asymmetric_supported(algorithm: Option<&str>, bit_length: Option<u32>) -> bool {
    matches!(
        (algorithm, bit_length),
        (Some(alg), Some(bits))
            if ASYMMETRIC_ALGORITHMS.contains(&alg.to_ascii_lowercase().as_str())
                && ASYMMETRIC_KEY_LENGTHS.contains(&bits)
    )
}

/// Project KEK description exchanged with a crypto plugin.
///
/// `kek_label` and `plugin_name` are set by keystash; the remaining fields
/// belong to the plugin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KekMetaDto {
    pub kek_label: String,
    pub plugin_name: String,
    pub algorithm: Option<String>,
    pub bit_length: Option<u32>,
    pub mode: Option<String>,
    pub plugin_meta: Option<String>,
}

impl From<&KekDatum> for KekMetaDto {
    fn from(datum: &KekDatum) -> Self {
        Self {
            kek_label: datum.kek_label.clone(),
            plugin_name: datum.plugin_name.clone(),
            algorithm: datum.algorithm.clone(),
            bit_length: datum.bit_length,
            mode: datum.mode.clone(),
            plugin_meta: datum.plugin_meta.clone(),
        }
    }
}

impl KekMetaDto {
    /// `plugin_meta` if bound and non-empty
    pub fn plugin_meta(&self) -> Option<&str> {
        self.plugin_meta.as_deref().filter(|m| !m.is_empty())
    }
}

pub struct EncryptDto {
    pub unencrypted: Zeroizing<Vec<u8>>,
}

impl EncryptDto {
    pub fn new(unencrypted: impl Into<Vec<u8>>) -> Self {
        Self { unencrypted: Zeroizing::new(unencrypted.into()) }
    }
}

#[derive(Debug, Clone)]
pub struct DecryptDto {
    pub encrypted: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct GenerateDto {
    pub generation_type: GenerationType,
    pub algorithm: String,
    pub bit_length: u32,
    pub mode: Option<String>,
    pub passphrase: Option<SecretString>,
}

/// Ciphertext produced by a plugin plus optional per-secret KEK metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseDto {
    pub cypher_text: Vec<u8>,
    pub kek_meta_extended: Option<String>,
}

/// Encrypted parts of a generated key pair
#[derive(Debug, Clone)]
pub struct AsymmetricResponse {
    pub private_key: ResponseDto,
    pub public_key: ResponseDto,
    pub passphrase: Option<ResponseDto>,
}

#[async_trait]
pub trait CryptoPlugin: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn encrypt(
        &self,
        dto: EncryptDto,
        kek_meta: &KekMetaDto,
        project_id: &str,
    ) -> Result<ResponseDto>;

    async fn decrypt(
        &self,
        dto: DecryptDto,
        kek_meta: &KekMetaDto,
        kek_meta_extended: Option<&str>,
        project_id: &str,
    ) -> Result<Zeroizing<Vec<u8>>>;

    /// Complete the binding of a new project KEK. Returning `None` fails the
    /// store request.
    async fn bind_kek_metadata(&self, kek_meta: KekMetaDto) -> Result<Option<KekMetaDto>>;

    async fn generate_symmetric(
        &self,
        dto: GenerateDto,
        kek_meta: &KekMetaDto,
        project_id: &str,
    ) -> Result<ResponseDto>;

    async fn generate_asymmetric(
        &self,
        dto: GenerateDto,
        kek_meta: &KekMetaDto,
        project_id: &str,
    ) -> Result<AsymmetricResponse>;

    fn supports(
        &self,
        support_type: PluginSupportType,
        algorithm: Option<&str>,
        bit_length: Option<u32>,
        mode: Option<&str>,
    ) -> bool;
}
