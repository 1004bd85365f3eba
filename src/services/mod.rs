//! Business logic services
//!
//! This module contains service layer components that encapsulate
//! business logic, separated from HTTP concerns.

pub mod secret_stores;
pub mod secrets;

pub use secret_stores::SecretStoreService;
pub use secrets::{CreateSecret, GenerateKey, SecretPayload, SecretService, SecretView};
