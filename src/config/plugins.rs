//! Configuration sections for the secret store and crypto plugins.

use super::secret_string::SecretString;
use crate::errors::{KeystashError, Result};
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Development master KEK (`thirty_two_byte_keyblahblahblahh`).
pub const DEFAULT_SIMPLE_KEK: &str = "dGhpcnR5X3R3b19ieXRlX2tleWJsYWhibGFoYmxhaGg=";

/// Accepts `["a", "b"]` or the INI-friendly `"a, b"`.
fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        One(String),
        Many(Vec<String>),
    }

    let items = match StringOrList::deserialize(deserializer)? {
        StringOrList::One(joined) => joined.split(',').map(str::to_string).collect(),
        StringOrList::Many(items) => items,
    };
    Ok(items.into_iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
}

/// AES-GCM keys in the token are AES-128 or AES-256.
fn validate_key_length(length: usize) -> std::result::Result<(), ValidationError> {
    if length == 16 || length == 32 {
        Ok(())
    } else {
        let mut err = ValidationError::new("aes_key_length");
        err.message = Some("must be 16 or 32 bytes".into());
        Err(err)
    }
}

/// `[secretstore]`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SecretStoreConfig {
    #[serde(deserialize_with = "string_or_list")]
    pub enabled_secretstore_plugins: Vec<String>,

    pub enable_multiple_secret_stores: bool,

    /// Suffixes naming the `[secretstore:<suffix>]` sections
    #[serde(deserialize_with = "string_or_list")]
    pub stores_lookup_suffix: Vec<String>,
}

impl Default for SecretStoreConfig {
    fn default() -> Self {
        Self {
            enabled_secretstore_plugins: vec![crate::plugin::STORE_CRYPTO.to_string()],
            enable_multiple_secret_stores: false,
            stores_lookup_suffix: Vec::new(),
        }
    }
}

impl SecretStoreConfig {
    /// Multiple-backend rules: a suffix list, one section per suffix and
    /// exactly one global default.
    pub fn validate_sections(&self, sections: &[NamedStoreConfig]) -> Result<()> {
        if !self.enable_multiple_secret_stores {
            return Ok(());
        }

        if self.stores_lookup_suffix.is_empty() {
            return Err(KeystashError::validation_field(
                "stores_lookup_suffix is required when multiple secret stores are enabled",
                "secretstore.stores_lookup_suffix",
            ));
        }

        let mut seen = HashSet::new();
        for suffix in &self.stores_lookup_suffix {
            if !seen.insert(suffix.as_str()) {
                return Err(KeystashError::validation(format!(
                    "Duplicate secret store suffix '{}'",
                    suffix
                )));
            }
            let section = sections.iter().find(|s| &s.name == suffix).ok_or_else(|| {
                KeystashError::validation(format!(
                    "Missing [secretstore:{}] section for configured suffix",
                    suffix
                ))
            })?;
            if section.section.secret_store_plugin.trim().is_empty() {
                return Err(KeystashError::validation(format!(
                    "[secretstore:{}] must set secret_store_plugin",
                    suffix
                )));
            }
        }

        let defaults = sections.iter().filter(|s| s.section.global_default).count();
        if defaults != 1 {
            return Err(KeystashError::validation(format!(
                "Exactly one secret store must be the global default, found {}",
                defaults
            )));
        }

        Ok(())
    }
}

/// One `[secretstore:<suffix>]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreSectionConfig {
    pub secret_store_plugin: String,
    #[serde(default)]
    pub crypto_plugin: Option<String>,
    #[serde(default)]
    pub global_default: bool,
}

/// A store section together with the suffix that named it
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NamedStoreConfig {
    pub name: String,
    #[serde(flatten)]
    pub section: StoreSectionConfig,
}

/// `[crypto]`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CryptoConfig {
    #[serde(deserialize_with = "string_or_list")]
    pub enabled_crypto_plugins: Vec<String>,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self { enabled_crypto_plugins: vec![crate::plugin::SIMPLE_CRYPTO.to_string()] }
    }
}

/// `[simple_crypto_plugin]`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SimpleCryptoConfig {
    /// Base64-encoded 32-byte master KEK
    pub kek: SecretString,
}

impl Default for SimpleCryptoConfig {
    fn default() -> Self {
        Self { kek: SecretString::new(DEFAULT_SIMPLE_KEK) }
    }
}

impl SimpleCryptoConfig {
    pub fn is_default_kek(&self) -> bool {
        self.kek.expose_secret() == DEFAULT_SIMPLE_KEK
    }

    /// Decode the master KEK, checking it is exactly 32 bytes.
    pub fn decoded_kek(&self) -> Result<zeroize::Zeroizing<Vec<u8>>> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(self.kek.expose_secret().trim())
            .map(zeroize::Zeroizing::new)
            .map_err(|e| {
                KeystashError::validation_field(
                    format!("simple_crypto_plugin.kek is not valid base64: {}", e),
                    "simple_crypto_plugin.kek",
                )
            })?;
        if bytes.len() != 32 {
            return Err(KeystashError::validation_field(
                format!("simple_crypto_plugin.kek must decode to 32 bytes, got {}", bytes.len()),
                "simple_crypto_plugin.kek",
            ));
        }
        Ok(bytes)
    }
}

/// `[p11_crypto_plugin]`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct P11CryptoConfig {
    /// `softtoken` or `softtoken:<state file>`
    #[validate(length(min = 1, message = "library_path cannot be empty"))]
    pub library_path: String,

    /// User PIN for the token
    pub login: Option<SecretString>,

    pub mkek_label: Option<String>,

    #[validate(custom(function = "validate_key_length"))]
    pub mkek_length: usize,

    pub hmac_label: Option<String>,

    pub slot_id: u64,

    pub rw_session: bool,

    /// Project KEK length in bytes
    #[validate(custom(function = "validate_key_length"))]
    pub pkek_length: usize,

    /// Seconds an unwrapped project KEK stays cached (0 disables caching)
    pub pkek_cache_ttl: u64,

    /// Maximum cached project KEKs (0 disables caching)
    pub pkek_cache_limit: usize,

    /// Extra entropy fed to the token RNG at startup
    pub seed_random_buffer: Option<String>,

    /// Create missing master keys instead of failing
    pub generate_master_keys: bool,
}

impl Default for P11CryptoConfig {
    fn default() -> Self {
        Self {
            library_path: "softtoken".to_string(),
            login: None,
            mkek_label: None,
            mkek_length: 32,
            hmac_label: None,
            slot_id: 1,
            rw_session: true,
            pkek_length: 32,
            pkek_cache_ttl: 900,
            pkek_cache_limit: 100,
            seed_random_buffer: None,
            generate_master_keys: false,
        }
    }
}

impl P11CryptoConfig {
    pub fn pkek_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.pkek_cache_ttl)
    }

    /// Master key labels, which have no usable default
    pub fn require_labels(&self) -> Result<(&str, &str)> {
        let mkek = self.mkek_label.as_deref().filter(|l| !l.is_empty()).ok_or_else(|| {
            KeystashError::validation_field(
                "p11_crypto_plugin.mkek_label is required",
                "p11_crypto_plugin.mkek_label",
            )
        })?;
        let hmac = self.hmac_label.as_deref().filter(|l| !l.is_empty()).ok_or_else(|| {
            KeystashError::validation_field(
                "p11_crypto_plugin.hmac_label is required",
                "p11_crypto_plugin.hmac_label",
            )
        })?;
        Ok((mkek, hmac))
    }
}

/// `[kmip_plugin]`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct KmipConfig {
    pub username: Option<String>,
    pub password: Option<SecretString>,

    #[validate(length(min = 1, message = "KMIP host cannot be empty"))]
    pub host: String,

    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Client private key (PEM)
    pub keyfile: Option<PathBuf>,
    /// Client certificate chain (PEM)
    pub certfile: Option<PathBuf>,
    /// Trusted CA bundle (PEM)
    pub ca_certs: Option<PathBuf>,

    #[validate(range(min = 1, max = 120))]
    pub connect_timeout_seconds: u64,

    /// Bound on a whole KMIP round trip, handshake included
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_seconds: u64,
}

impl Default for KmipConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            host: "localhost".to_string(),
            port: 5696,
            keyfile: None,
            certfile: None,
            ca_certs: None,
            connect_timeout_seconds: 10,
            request_timeout_seconds: 30,
        }
    }
}

impl KmipConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// `[dogtag_plugin]`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DogtagConfig {
    /// Agent certificate and key (PEM) used as the TLS client identity
    pub pem_path: Option<PathBuf>,

    #[validate(length(min = 1, message = "Dogtag host cannot be empty"))]
    pub dogtag_host: String,

    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub dogtag_port: u16,

    /// Accepted for compatibility; TLS is handled by rustls
    pub nss_db_path: Option<PathBuf>,
    pub nss_password: Option<SecretString>,

    #[validate(range(min = 1, max = 300))]
    pub request_timeout_seconds: u64,
}

impl Default for DogtagConfig {
    fn default() -> Self {
        Self {
            pem_path: None,
            dogtag_host: "localhost".to_string(),
            dogtag_port: 8443,
            nss_db_path: None,
            nss_password: None,
            request_timeout_seconds: 30,
        }
    }
}

impl DogtagConfig {
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.dogtag_host, self.dogtag_port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        secretstore: SecretStoreConfig,
    }

    #[test]
    fn plugin_list_accepts_comma_separated_string() {
        let parsed: Wrapper = toml::from_str(
            r#"
            [secretstore]
            enabled_secretstore_plugins = "store_crypto, kmip_plugin"
            "#,
        )
        .unwrap();
        assert_eq!(
            parsed.secretstore.enabled_secretstore_plugins,
            vec!["store_crypto".to_string(), "kmip_plugin".to_string()]
        );
    }

    #[test]
    fn plugin_list_accepts_array() {
        let parsed: Wrapper = toml::from_str(
            r#"
            [secretstore]
            enabled_secretstore_plugins = ["dogtag_plugin"]
            "#,
        )
        .unwrap();
        assert_eq!(parsed.secretstore.enabled_secretstore_plugins, vec!["dogtag_plugin"]);
        assert!(!parsed.secretstore.enable_multiple_secret_stores);
    }

    #[test]
    fn default_kek_decodes_to_32_bytes() {
        let config = SimpleCryptoConfig::default();
        assert!(config.is_default_kek());
        assert_eq!(config.decoded_kek().unwrap().len(), 32);
    }

    #[test]
    fn short_kek_is_rejected() {
        let config = SimpleCryptoConfig { kek: SecretString::new("c2hvcnQ=") };
        let err = config.decoded_kek().unwrap_err();
        assert!(err.to_string().contains("32 bytes"));
    }

    #[test]
    fn p11_defaults() {
        let config = P11CryptoConfig::default();
        assert_eq!(config.library_path, "softtoken");
        assert_eq!(config.slot_id, 1);
        assert_eq!(config.pkek_length, 32);
        assert_eq!(config.pkek_cache_ttl(), Duration::from_secs(900));
        assert_eq!(config.pkek_cache_limit, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn p11_rejects_unsupported_key_lengths() {
        let config = P11CryptoConfig { pkek_length: 24, ..P11CryptoConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn kmip_and_dogtag_defaults() {
        let kmip = KmipConfig::default();
        assert_eq!((kmip.host.as_str(), kmip.port), ("localhost", 5696));
        assert_eq!(kmip.request_timeout(), Duration::from_secs(30));
        assert!(KmipConfig { request_timeout_seconds: 0, ..kmip }.validate().is_err());

        let dogtag = DogtagConfig::default();
        assert_eq!(dogtag.base_url(), "https://localhost:8443");
    }

    fn store(name: &str, default: bool) -> NamedStoreConfig {
        NamedStoreConfig {
            name: name.to_string(),
            section: StoreSectionConfig {
                secret_store_plugin: "store_crypto".to_string(),
                crypto_plugin: Some("simple_crypto".to_string()),
                global_default: default,
            },
        }
    }

    #[test]
    fn multiple_stores_need_exactly_one_default() {
        let config = SecretStoreConfig {
            enable_multiple_secret_stores: true,
            stores_lookup_suffix: vec!["a".into(), "b".into()],
            ..SecretStoreConfig::default()
        };

        assert!(config.validate_sections(&[store("a", true), store("b", false)]).is_ok());
        assert!(config.validate_sections(&[store("a", true), store("b", true)]).is_err());
        assert!(config.validate_sections(&[store("a", false), store("b", false)]).is_err());
        assert!(config.validate_sections(&[store("a", true)]).is_err());
    }

    #[test]
    fn multiple_stores_need_suffixes() {
        let config =
            SecretStoreConfig { enable_multiple_secret_stores: true, ..Default::default() };
        assert!(config.validate_sections(&[]).is_err());
    }
}
