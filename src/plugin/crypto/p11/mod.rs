//! PKCS#11 crypto plugin.
//!
//! Project KEKs are generated inside the token, wrapped under the master KEK
//! (MKEK) and authenticated with an HMAC key, and the wrapped form is stored
//! as the KEK's `plugin_meta`. Plaintext key material never leaves the
//! token. Unwrapped project KEKs stay in the token as session objects while
//! they sit in the [`ProjectKekCache`]; eviction destroys them.

pub mod softtoken;
pub mod token;

pub use softtoken::SoftwareToken;
pub use token::{Ckr, KeyTemplate, KeyUsage, ObjectHandle, Pkcs11Token, SessionHandle, WrappedKey};

use super::kek_cache::ProjectKekCache;
use super::{
    is_symmetric_supported, AsymmetricResponse, CryptoPlugin, DecryptDto, EncryptDto,
    GenerateDto, KekMetaDto, PluginSupportType, ResponseDto,
};
use crate::config::P11CryptoConfig;
use crate::errors::{KeystashError, Result};
use crate::observability::MetricsRecorder;
use crate::plugin::{PluginError, P11_CRYPTO};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

const SOFTTOKEN: &str = "softtoken";
const RNG_SELF_TEST_BYTES: usize = 100;
const GCM_IV_BYTES: usize = 12;

/// `plugin_meta` of a bound project KEK
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct WrappedKekMeta {
    iv: String,
    wrapped_key: String,
    hmac: String,
    mkek_label: String,
    hmac_label: String,
}

/// Per-secret `kek_meta_extended`
#[derive(Debug, Serialize, Deserialize)]
struct ExtendedMeta {
    iv: String,
}

fn ck_error(rv: Ckr) -> KeystashError {
    PluginError::p11(rv.to_string()).into()
}

fn decode_field(value: &str, field: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|_| {
            PluginError::general(format!("Invalid base64 in KEK metadata field '{}'", field)).into()
        })
}

/// Open the token named by `library_path`.
pub fn open_token(config: &P11CryptoConfig) -> Result<Arc<dyn Pkcs11Token>> {
    let library_path = config.library_path.trim();
    if library_path == SOFTTOKEN {
        return Ok(Arc::new(SoftwareToken::in_memory(config.slot_id)));
    }
    if let Some(path) = library_path.strip_prefix("softtoken:") {
        if path.is_empty() {
            return Err(PluginError::config("softtoken: requires a state file path").into());
        }
        return Ok(Arc::new(SoftwareToken::with_state_file(config.slot_id, path)));
    }
    Err(PluginError::config(format!(
        "PKCS#11 library '{}' cannot be loaded; only the built-in softtoken is available",
        library_path
    ))
    .into())
}

pub struct P11CryptoPlugin {
    token: Arc<dyn Pkcs11Token>,
    session: SessionHandle,
    mkek_label: String,
    hmac_label: String,
    /// Master key handles by label, so KEKs wrapped under an older MKEK
    /// still resolve
    key_handles: DashMap<String, ObjectHandle>,
    pkek_length: usize,
    cache: ProjectKekCache<ObjectHandle>,
    metrics: MetricsRecorder,
}

impl std::fmt::Debug for P11CryptoPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P11CryptoPlugin")
            .field("token", &self.token)
            .field("mkek_label", &self.mkek_label)
            .field("hmac_label", &self.hmac_label)
            .field("cache", &self.cache)
            .finish()
    }
}

impl P11CryptoPlugin {
    pub fn new(config: &P11CryptoConfig) -> Result<Self> {
        Self::with_token(config, open_token(config)?)
    }

    /// Initialize against an already opened token.
    pub fn with_token(config: &P11CryptoConfig, token: Arc<dyn Pkcs11Token>) -> Result<Self> {
        let (mkek_label, hmac_label) = config.require_labels()?;

        let session = token.open_session(config.slot_id, config.rw_session).map_err(ck_error)?;
        match &config.login {
            Some(pin) => token.login(session, pin.expose_secret()).map_err(ck_error)?,
            None => warn!("No PKCS#11 login configured; private keys will be unavailable"),
        }

        if let Some(seed) = &config.seed_random_buffer {
            token.seed_random(session, seed.as_bytes()).map_err(ck_error)?;
        }
        let sample = token.generate_random(session, RNG_SELF_TEST_BYTES).map_err(ck_error)?;
        if sample.iter().all(|b| *b == 0) {
            return Err(PluginError::RngSelfTest.into());
        }

        let evict_token = Arc::clone(&token);
        let cache = ProjectKekCache::new(config.pkek_cache_ttl(), config.pkek_cache_limit)
            .with_evict_hook(move |handle: ObjectHandle| {
                if let Err(rv) = evict_token.destroy_object(session, handle) {
                    debug!(handle = handle.0, error = %rv, "Evicted project KEK already gone");
                }
            });

        let plugin = Self {
            token,
            session,
            mkek_label: mkek_label.to_string(),
            hmac_label: hmac_label.to_string(),
            key_handles: DashMap::new(),
            pkek_length: config.pkek_length,
            cache,
            metrics: MetricsRecorder::new(),
        };

        let mkek_template =
            KeyTemplate::master(mkek_label, config.mkek_length, KeyUsage::Encryption);
        let hmac_template = KeyTemplate::master(hmac_label, 32, KeyUsage::Signing);
        if config.generate_master_keys {
            plugin.get_or_generate_key(&mkek_template)?;
            plugin.get_or_generate_key(&hmac_template)?;
        } else {
            plugin.key_handle(mkek_label)?;
            plugin.key_handle(hmac_label)?;
        }

        info!(
            slot_id = config.slot_id,
            mkek_label,
            hmac_label,
            cache_ttl_secs = config.pkek_cache_ttl,
            cache_limit = config.pkek_cache_limit,
            "PKCS#11 crypto plugin initialized"
        );
        Ok(plugin)
    }

    fn find_key(&self, label: &str) -> Result<Option<ObjectHandle>> {
        if let Some(handle) = self.key_handles.get(label) {
            return Ok(Some(*handle));
        }
        let found = self.token.find_keys(self.session, label).map_err(ck_error)?;
        match found.as_slice() {
            [] => Ok(None),
            [handle] => {
                self.key_handles.insert(label.to_string(), *handle);
                Ok(Some(*handle))
            }
            _ => Err(PluginError::P11DuplicateKeys { label: label.to_string() }.into()),
        }
    }

    fn key_handle(&self, label: &str) -> Result<ObjectHandle> {
        self.find_key(label)?
            .ok_or_else(|| PluginError::P11KeyNotFound { label: label.to_string() }.into())
    }

    fn get_or_generate_key(&self, template: &KeyTemplate) -> Result<ObjectHandle> {
        let label = template.label.as_deref().unwrap_or_default();
        if let Some(handle) = self.find_key(label)? {
            return Ok(handle);
        }
        let handle = self.token.generate_key(self.session, template).map_err(ck_error)?;
        self.key_handles.insert(label.to_string(), handle);
        info!(label, "Generated master key in token");
        Ok(handle)
    }

    fn wrap_project_kek(&self, kek_label: &str) -> Result<WrappedKekMeta> {
        let mkek = self.key_handle(&self.mkek_label)?;
        let hmac_key = self.key_handle(&self.hmac_label)?;

        let kek = self
            .token
            .generate_key(self.session, &KeyTemplate::project_kek(kek_label, self.pkek_length))
            .map_err(ck_error)?;
        let wrapped = self.token.wrap_key(self.session, mkek, kek);
        // the plaintext session key is not needed once wrapped
        let _ = self.token.destroy_object(self.session, kek);
        let wrapped = wrapped.map_err(ck_error)?;

        let signature = self
            .token
            .sign(self.session, hmac_key, &authenticated_bytes(&wrapped))
            .map_err(ck_error)?;

        Ok(WrappedKekMeta {
            iv: BASE64.encode(&wrapped.iv),
            wrapped_key: BASE64.encode(&wrapped.wrapped),
            hmac: BASE64.encode(signature),
            mkek_label: self.mkek_label.clone(),
            hmac_label: self.hmac_label.clone(),
        })
    }

    /// Verify and unwrap `plugin_meta` into a session key in the token.
    fn unwrap_project_kek(&self, kek_meta: &KekMetaDto) -> Result<ObjectHandle> {
        let plugin_meta = kek_meta.plugin_meta().ok_or(PluginError::KekNotCreated)?;
        let meta: WrappedKekMeta = serde_json::from_str(plugin_meta)
            .map_err(|_| PluginError::general("Project KEK metadata is not valid JSON"))?;

        let wrapped = WrappedKey {
            iv: decode_field(&meta.iv, "iv")?,
            wrapped: decode_field(&meta.wrapped_key, "wrapped_key")?,
        };
        let signature = decode_field(&meta.hmac, "hmac")?;
        let mkek = self.key_handle(&meta.mkek_label)?;
        let hmac_key = self.key_handle(&meta.hmac_label)?;

        debug!(
            mkek_label = %meta.mkek_label,
            hmac_label = %meta.hmac_label,
            "Unwrapping project KEK"
        );
        self.token
            .verify(self.session, hmac_key, &authenticated_bytes(&wrapped), &signature)
            .map_err(|rv| match rv {
                Ckr::SignatureInvalid => PluginError::P11HmacVerification.into(),
                other => ck_error(other),
            })?;

        let template = KeyTemplate::project_kek(&kek_meta.kek_label, self.pkek_length);
        self.token.unwrap_key(self.session, mkek, &wrapped, &template).map_err(ck_error)
    }

    /// Run `op` with the project KEK, from the cache or freshly unwrapped.
    /// A cached handle destroyed by a concurrent eviction is unwrapped again.
    fn with_project_kek<T>(
        &self,
        kek_meta: &KekMetaDto,
        op: impl Fn(ObjectHandle) -> std::result::Result<T, Ckr>,
    ) -> Result<T> {
        if let Some(handle) = self.cache.get(&kek_meta.kek_label) {
            match op(handle) {
                Err(Ckr::KeyHandleInvalid) => self.cache.invalidate(&kek_meta.kek_label),
                result => return result.map_err(ck_error),
            }
        }

        let handle = self.unwrap_project_kek(kek_meta)?;
        let result = op(handle);
        // caches the handle, or destroys it when caching is disabled
        self.cache.insert(kek_meta.kek_label.clone(), handle);
        result.map_err(ck_error)
    }

    fn encrypt_bytes(&self, plaintext: &[u8], kek_meta: &KekMetaDto) -> Result<ResponseDto> {
        let started = Instant::now();
        let iv = self.token.generate_random(self.session, GCM_IV_BYTES).map_err(ck_error)?;
        let cypher_text = self.with_project_kek(kek_meta, |key| {
            self.token.encrypt(self.session, key, &iv, plaintext)
        })?;

        let extended = serde_json::to_string(&ExtendedMeta { iv: BASE64.encode(&iv[..]) })?;
        self.metrics
            .record_crypto_operation(P11_CRYPTO, "encrypt", started.elapsed().as_secs_f64());
        Ok(ResponseDto { cypher_text, kek_meta_extended: Some(extended) })
    }
}

/// `iv || wrapped_key`, the bytes covered by the KEK HMAC
fn authenticated_bytes(wrapped: &WrappedKey) -> Vec<u8> {
    let mut data = Vec::with_capacity(wrapped.iv.len() + wrapped.wrapped.len());
    data.extend_from_slice(&wrapped.iv);
    data.extend_from_slice(&wrapped.wrapped);
    data
}

impl Drop for P11CryptoPlugin {
    fn drop(&mut self) {
        self.cache.clear();
        let _ = self.token.close_session(self.session);
    }
}

#[async_trait]
impl CryptoPlugin for P11CryptoPlugin {
    fn name(&self) -> &str {
        P11_CRYPTO
    }

    #[instrument(skip_all, fields(kek_label = %kek_meta.kek_label))]
    async fn encrypt(
        &self,
        dto: EncryptDto,
        kek_meta: &KekMetaDto,
        _project_id: &str,
    ) -> Result<ResponseDto> {
        self.encrypt_bytes(&dto.unencrypted, kek_meta)
    }

    #[instrument(skip_all, fields(kek_label = %kek_meta.kek_label))]
    async fn decrypt(
        &self,
        dto: DecryptDto,
        kek_meta: &KekMetaDto,
        kek_meta_extended: Option<&str>,
        _project_id: &str,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let started = Instant::now();
        let extended = kek_meta_extended
            .ok_or_else(|| PluginError::general("Missing kek_meta_extended for PKCS#11 secret"))?;
        let extended: ExtendedMeta = serde_json::from_str(extended)
            .map_err(|_| PluginError::general("kek_meta_extended is not valid JSON"))?;
        let iv = decode_field(&extended.iv, "iv")?;

        let plaintext = self.with_project_kek(kek_meta, |key| {
            self.token.decrypt(self.session, key, &iv, &dto.encrypted)
        })?;
        self.metrics
            .record_crypto_operation(P11_CRYPTO, "decrypt", started.elapsed().as_secs_f64());
        Ok(plaintext)
    }

    async fn bind_kek_metadata(&self, mut kek_meta: KekMetaDto) -> Result<Option<KekMetaDto>> {
        if kek_meta.plugin_meta().is_none() {
            let wrapped = self.wrap_project_kek(&kek_meta.kek_label)?;
            kek_meta.plugin_meta = Some(serde_json::to_string(&wrapped)?);
            kek_meta.algorithm = Some("aes".to_string());
            kek_meta.bit_length = Some((self.pkek_length * 8) as u32);
            kek_meta.mode = Some("gcm".to_string());
            self.metrics.record_kek_bound(P11_CRYPTO);
            debug!(kek_label = %kek_meta.kek_label, "Generated and wrapped project KEK");
        }
        Ok(Some(kek_meta))
    }

    async fn generate_symmetric(
        &self,
        dto: GenerateDto,
        kek_meta: &KekMetaDto,
        _project_id: &str,
    ) -> Result<ResponseDto> {
        let byte_length = (dto.bit_length / 8) as usize;
        let key = self.token.generate_random(self.session, byte_length).map_err(ck_error)?;
        self.encrypt_bytes(&key, kek_meta)
    }

    async fn generate_asymmetric(
        &self,
        _dto: GenerateDto,
        _kek_meta: &KekMetaDto,
        _project_id: &str,
    ) -> Result<AsymmetricResponse> {
        Err(PluginError::not_implemented(P11_CRYPTO, "asymmetric key generation").into())
    }

    fn supports(
        &self,
        support_type: PluginSupportType,
        algorithm: Option<&str>,
        bit_length: Option<u32>,
        _mode: Option<&str>,
    ) -> bool {
        match support_type {
            PluginSupportType::EncryptDecrypt => true,
            PluginSupportType::SymmetricKeyGeneration => {
                is_symmetric_supported(algorithm, bit_length)
            }
            PluginSupportType::AsymmetricKeyGeneration => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecretString;
    use crate::domain::GenerationType;

    fn config() -> P11CryptoConfig {
        P11CryptoConfig {
            login: Some(SecretString::new("1234")),
            mkek_label: Some("test-mkek".into()),
            hmac_label: Some("test-hmac".into()),
            generate_master_keys: true,
            ..P11CryptoConfig::default()
        }
    }

    fn plugin_with(config: &P11CryptoConfig) -> (P11CryptoPlugin, Arc<SoftwareToken>) {
        let token = Arc::new(SoftwareToken::in_memory(config.slot_id));
        let plugin = P11CryptoPlugin::with_token(config, token.clone()).unwrap();
        (plugin, token)
    }

    async fn bound(plugin: &P11CryptoPlugin, label: &str) -> KekMetaDto {
        let meta = KekMetaDto {
            kek_label: label.into(),
            plugin_name: P11_CRYPTO.into(),
            ..Default::default()
        };
        plugin.bind_kek_metadata(meta).await.unwrap().unwrap()
    }

    #[test]
    fn only_softtoken_libraries_open() {
        assert!(open_token(&P11CryptoConfig::default()).is_ok());
        let config = P11CryptoConfig {
            library_path: "/usr/lib/libCryptoki2_64.so".into(),
            ..P11CryptoConfig::default()
        };
        let err = open_token(&config).unwrap_err();
        assert!(matches!(err.as_plugin(), Some(PluginError::Config { .. })));
    }

    #[test]
    fn missing_master_keys_are_reported() {
        let config = P11CryptoConfig { generate_master_keys: false, ..config() };
        let token = Arc::new(SoftwareToken::in_memory(1));
        let err = P11CryptoPlugin::with_token(&config, token).unwrap_err();
        assert!(matches!(
            err.as_plugin(),
            Some(PluginError::P11KeyNotFound { label }) if label == "test-mkek"
        ));
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let config = config();
        let token = Arc::new(SoftwareToken::in_memory(1));
        let session = token.open_session(1, true).unwrap();
        token.login(session, "1234").unwrap();
        let template = KeyTemplate::master("test-mkek", 32, KeyUsage::Encryption);
        token.generate_key(session, &template).unwrap();
        token.generate_key(session, &template).unwrap();

        let err = P11CryptoPlugin::with_token(&config, token).unwrap_err();
        assert!(matches!(err.as_plugin(), Some(PluginError::P11DuplicateKeys { .. })));
    }

    #[test]
    fn labels_are_required() {
        let config = P11CryptoConfig { mkek_label: None, ..config() };
        let token = Arc::new(SoftwareToken::in_memory(1));
        assert!(P11CryptoPlugin::with_token(&config, token).is_err());
    }

    #[tokio::test]
    async fn bind_is_idempotent_and_records_wrapping() {
        let (plugin, _) = plugin_with(&config());
        let meta = bound(&plugin, "project-KEK-1").await;
        assert_eq!(meta.algorithm.as_deref(), Some("aes"));
        assert_eq!(meta.bit_length, Some(256));
        assert_eq!(meta.mode.as_deref(), Some("gcm"));

        let wrapped: WrappedKekMeta = serde_json::from_str(meta.plugin_meta().unwrap()).unwrap();
        assert_eq!(wrapped.mkek_label, "test-mkek");
        assert_eq!(wrapped.hmac_label, "test-hmac");

        let rebound = plugin.bind_kek_metadata(meta.clone()).await.unwrap().unwrap();
        assert_eq!(rebound, meta);
    }

    #[tokio::test]
    async fn encrypt_decrypt_round_trip_with_iv_in_extended_meta() {
        let (plugin, _) = plugin_with(&config());
        let meta = bound(&plugin, "project-KEK-1").await;

        let response =
            plugin.encrypt(EncryptDto::new(b"sensitive".to_vec()), &meta, "p").await.unwrap();
        let extended = response.kek_meta_extended.clone().unwrap();
        assert!(extended.contains("\"iv\""));

        let plaintext = plugin
            .decrypt(DecryptDto { encrypted: response.cypher_text }, &meta, Some(&extended), "p")
            .await
            .unwrap();
        assert_eq!(&plaintext[..], b"sensitive");
    }

    #[tokio::test]
    async fn tampered_wrapped_key_fails_hmac_check() {
        let (plugin, _) = plugin_with(&config());
        let mut meta = bound(&plugin, "project-KEK-1").await;
        let mut wrapped: WrappedKekMeta =
            serde_json::from_str(meta.plugin_meta().unwrap()).unwrap();
        let mut bytes = BASE64.decode(&wrapped.wrapped_key).unwrap();
        bytes[0] ^= 0x01;
        wrapped.wrapped_key = BASE64.encode(bytes);
        meta.plugin_meta = Some(serde_json::to_string(&wrapped).unwrap());
        meta.kek_label = "project-KEK-tampered".into();

        let err = plugin.encrypt(EncryptDto::new(vec![1]), &meta, "p").await.unwrap_err();
        assert!(matches!(err.as_plugin(), Some(PluginError::P11HmacVerification)));
    }

    #[tokio::test]
    async fn unwrapped_keys_are_cached_and_evicted() {
        let config = P11CryptoConfig { pkek_cache_limit: 1, ..config() };
        let (plugin, token) = plugin_with(&config);
        let first = bound(&plugin, "project-KEK-1").await;
        let second = bound(&plugin, "project-KEK-2").await;
        let masters = token.object_count();

        plugin.encrypt(EncryptDto::new(vec![1]), &first, "p").await.unwrap();
        assert_eq!(plugin.cache.len(), 1);
        assert_eq!(token.object_count(), masters + 1);

        plugin.encrypt(EncryptDto::new(vec![2]), &second, "p").await.unwrap();
        assert_eq!(plugin.cache.len(), 1);
        assert_eq!(token.object_count(), masters + 1);
    }

    #[tokio::test]
    async fn disabled_cache_leaves_no_session_keys() {
        let config = P11CryptoConfig { pkek_cache_limit: 0, ..config() };
        let (plugin, token) = plugin_with(&config);
        let meta = bound(&plugin, "project-KEK-1").await;
        let before = token.object_count();

        let response = plugin.encrypt(EncryptDto::new(vec![9]), &meta, "p").await.unwrap();
        plugin
            .decrypt(
                DecryptDto { encrypted: response.cypher_text },
                &meta,
                response.kek_meta_extended.as_deref(),
                "p",
            )
            .await
            .unwrap();
        assert!(plugin.cache.is_empty());
        assert_eq!(token.object_count(), before);
    }

    #[tokio::test]
    async fn stale_cached_handle_is_unwrapped_again() {
        let (plugin, token) = plugin_with(&config());
        let meta = bound(&plugin, "project-KEK-1").await;
        plugin.encrypt(EncryptDto::new(vec![1]), &meta, "p").await.unwrap();

        let cached = plugin.cache.get("project-KEK-1").unwrap();
        token.destroy_object(plugin.session, cached).unwrap();

        plugin.encrypt(EncryptDto::new(vec![2]), &meta, "p").await.unwrap();
        assert_ne!(plugin.cache.get("project-KEK-1").unwrap(), cached);
    }

    #[tokio::test]
    async fn generation_support() {
        let (plugin, _) = plugin_with(&config());
        let meta = bound(&plugin, "project-KEK-1").await;

        let dto = GenerateDto {
            generation_type: GenerationType::Symmetric,
            algorithm: "aes".into(),
            bit_length: 128,
            mode: Some("cbc".into()),
            passphrase: None,
        };
        let response = plugin.generate_symmetric(dto.clone(), &meta, "p").await.unwrap();
        let key = plugin
            .decrypt(
                DecryptDto { encrypted: response.cypher_text },
                &meta,
                response.kek_meta_extended.as_deref(),
                "p",
            )
            .await
            .unwrap();
        assert_eq!(key.len(), 16);

        let err = plugin.generate_asymmetric(dto, &meta, "p").await.unwrap_err();
        assert!(matches!(err.as_plugin(), Some(PluginError::NotImplemented { .. })));
        assert!(plugin.supports(PluginSupportType::EncryptDecrypt, None, None, None));
        assert!(!plugin.supports(
            PluginSupportType::AsymmetricKeyGeneration,
            Some("rsa"),
            Some(2048),
            None
        ));
    }

    #[tokio::test]
    async fn master_keys_persist_in_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("softtoken.json");
        let config = P11CryptoConfig {
            library_path: format!("softtoken:{}", path.display()),
            ..config()
        };

        let meta = {
            let plugin = P11CryptoPlugin::new(&config).unwrap();
            bound(&plugin, "project-KEK-1").await
        };
        assert!(path.exists());

        let restarted = P11CryptoPlugin::new(&P11CryptoConfig {
            generate_master_keys: false,
            ..config
        })
        .unwrap();
        let response =
            restarted.encrypt(EncryptDto::new(b"after restart".to_vec()), &meta, "p").await;
        assert!(response.is_ok());
    }
}
