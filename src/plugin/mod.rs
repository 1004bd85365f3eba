//! Secret store and crypto plugins
//!
//! Secrets are handed to a [`SecretStorePlugin`] chosen by the
//! [`SecretStorePluginManager`]. The `store_crypto` store encrypts locally
//! through a [`crypto::CryptoPlugin`]; the KMIP and Dogtag stores delegate to
//! an external key manager and keep only a reference.
//!
//! ## Built-in plugins
//!
//! - **store_crypto**: local encryption with per-project KEKs
//! - **simple_crypto**: software AES-GCM under a configured master KEK
//! - **p11_crypto**: project KEKs wrapped by an HSM master key
//! - **kmip_plugin**: secrets kept on a KMIP 1.1 device
//! - **dogtag_plugin**: secrets archived in a Dogtag KRA

pub mod crypto;
pub mod dogtag;
pub mod error;
pub mod kmip;
pub mod manager;
pub mod mime_types;
pub mod multiple_backends;
pub mod store;
pub mod store_crypto;
pub mod translations;

pub use error::PluginError;
pub use manager::SecretStorePluginManager;
pub use multiple_backends::MultipleBackends;
pub use store::{
    AsymmetricKeyMetadataDto, AsymmetricSecretIds, SecretDto, SecretMetadata, SecretStorePlugin,
    StoreContext,
};
pub use store_crypto::StoreCryptoAdapter;

/// Secret store plugin names
pub const STORE_CRYPTO: &str = "store_crypto";
pub const KMIP_PLUGIN: &str = "kmip_plugin";
pub const DOGTAG_PLUGIN: &str = "dogtag_plugin";

/// Crypto plugin names
pub const SIMPLE_CRYPTO: &str = "simple_crypto";
pub const P11_CRYPTO: &str = "p11_crypto";

/// Metadata key every stored secret carries
pub const META_PLUGIN_NAME: &str = "plugin_name";
/// Metadata key for the normalized payload content type
pub const META_CONTENT_TYPE: &str = "content_type";
