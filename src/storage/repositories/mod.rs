//! Repository modules for data access
//!
//! One repository per table group. Each wraps the shared pool and maps
//! sqlx failures into `KeystashError::Database` with context.

pub mod container;
pub mod encrypted_datum;
pub mod kek_datum;
pub mod project;
pub mod secret;
pub mod secret_meta;
pub mod secret_store;

pub use container::{ContainerData, ContainerMember, ContainerRepository, NewContainer};
pub use encrypted_datum::{EncryptedDatum, EncryptedDatumRepository, NewEncryptedDatum};
pub use kek_datum::{KekDatum, KekDatumRepository};
pub use project::{ProjectData, ProjectRepository};
pub use secret::{NewSecret, SecretData, SecretListQuery, SecretRepository};
pub use secret_meta::SecretMetadataRepository;
pub use secret_store::{SecretStoreData, SecretStoreRepository};
