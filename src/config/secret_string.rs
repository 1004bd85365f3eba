//! Redacting string type for credentials read from configuration.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A credential loaded from configuration (`kek`, `login`, `password`,
/// `nss_password`).
///
/// - `Debug` prints `SecretString([REDACTED])` and `Display` prints `[REDACTED]`
/// - serializing writes `"[REDACTED]"`, so `config check` output never leaks it
/// - deserializing accepts the real value
/// - the buffer is zeroed when dropped
///
/// Call [`SecretString::expose_secret`] at the point of use.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Borrow the underlying credential. Never log the result.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for SecretString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecretString)
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString([REDACTED])")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SecretString {}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_and_display_are_redacted() {
        let login = SecretString::new("hsm-user-pin");
        assert_eq!(format!("{:?}", login), "SecretString([REDACTED])");
        assert_eq!(format!("{}", login), "[REDACTED]");
    }

    #[test]
    fn serialization_never_writes_the_value() {
        #[derive(Serialize)]
        struct Section {
            host: String,
            password: SecretString,
        }

        let section =
            Section { host: "kmip.local".to_string(), password: SecretString::new("hunter2") };
        let toml = toml::to_string(&section).unwrap();
        assert!(toml.contains("kmip.local"));
        assert!(toml.contains("[REDACTED]"));
        assert!(!toml.contains("hunter2"));
    }

    #[test]
    fn deserialization_accepts_the_value() {
        let secret: SecretString = serde_json::from_str("\"my-actual-secret\"").unwrap();
        assert_eq!(secret.expose_secret(), "my-actual-secret");
        assert_eq!(secret.len(), 16);
    }

    #[test]
    fn equality_compares_contents() {
        assert_eq!(SecretString::from("same"), SecretString::from("same".to_string()));
        assert_ne!(SecretString::from("same"), SecretString::from("other"));
        assert!(SecretString::default().is_empty());
    }
}
