//! # Error Handling
//!
//! Error types for keystash. [`KeystashError`] is the application-wide error;
//! backend plugins raise [`crate::plugin::PluginError`] which converts into it.

pub mod types;

pub use types::{KeystashError, Result};

/// Shorthand used across modules that only need the error type.
pub type Error = KeystashError;
