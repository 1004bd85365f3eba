//! # keystash
//!
//! A multi-tenant key management service. Secrets belong to a project (named
//! by the `X-Project-Id` header) and are handed to a pluggable secret store:
//!
//! ```text
//! REST API → SecretService → SecretStorePluginManager
//!                                   ├─ store_crypto  → CryptoPlugin (simple / PKCS#11)
//!                                   ├─ kmip_plugin   → KMIP 1.1 device
//!                                   └─ dogtag_plugin → Dogtag KRA
//! ```
//!
//! Only `store_crypto` keeps ciphertext in the local database; the external
//! stores return a reference that is persisted as secret metadata.

pub mod api;
pub mod cli;
pub mod config;
pub mod domain;
pub mod errors;
pub mod observability;
pub mod plugin;
pub mod services;
pub mod startup;
pub mod storage;

pub use config::AppConfig;
pub use errors::{Error, Result};
pub use startup::AppState;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
