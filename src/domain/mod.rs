//! Domain layer
//!
//! Types with no infrastructure dependencies: the secret vocabulary used by
//! the gateway, the plugins and the repositories.

pub mod secret;

pub use secret::{GenerationType, KeyAlgorithm, KeySpec, SecretStatus, SecretType};
