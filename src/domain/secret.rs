//! Secret vocabulary shared by the gateway, the plugins and storage.

use crate::config::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of secret material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecretType {
    Symmetric,
    Public,
    Private,
    Passphrase,
    Certificate,
    #[default]
    Opaque,
}

impl SecretType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Symmetric => "symmetric",
            Self::Public => "public",
            Self::Private => "private",
            Self::Passphrase => "passphrase",
            Self::Certificate => "certificate",
            Self::Opaque => "opaque",
        }
    }

    /// Types whose payload is PEM text at the API and DER on KMIP devices
    pub fn is_pem_encoded(&self) -> bool {
        matches!(self, Self::Public | Self::Private | Self::Certificate)
    }
}

impl FromStr for SecretType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "symmetric" => Ok(Self::Symmetric),
            "public" => Ok(Self::Public),
            "private" => Ok(Self::Private),
            "passphrase" => Ok(Self::Passphrase),
            "certificate" => Ok(Self::Certificate),
            "opaque" => Ok(Self::Opaque),
            _ => Err(format!("Unknown secret type: {}", s)),
        }
    }
}

impl fmt::Display for SecretType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a secret or container row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecretStatus {
    #[default]
    Active,
    Error,
}

impl SecretStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for SecretStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "ERROR" => Ok(Self::Error),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// Whether generating a key produces one secret or a key pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationType {
    Symmetric,
    Asymmetric,
}

/// Algorithms understood by the store layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    Aes,
    Des,
    Desede,
    HmacSha1,
    HmacSha256,
    HmacSha384,
    HmacSha512,
    DiffieHellman,
    Dsa,
    Rsa,
    Ec,
}

impl KeyAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aes => "aes",
            Self::Des => "des",
            Self::Desede => "desede",
            Self::HmacSha1 => "hmacsha1",
            Self::HmacSha256 => "hmacsha256",
            Self::HmacSha384 => "hmacsha384",
            Self::HmacSha512 => "hmacsha512",
            Self::DiffieHellman => "diffie_hellman",
            Self::Dsa => "dsa",
            Self::Rsa => "rsa",
            Self::Ec => "ec",
        }
    }

    pub fn generation_type(&self) -> GenerationType {
        match self {
            Self::DiffieHellman | Self::Dsa | Self::Rsa | Self::Ec => GenerationType::Asymmetric,
            _ => GenerationType::Symmetric,
        }
    }
}

impl FromStr for KeyAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes" => Ok(Self::Aes),
            "des" => Ok(Self::Des),
            "desede" | "3des" => Ok(Self::Desede),
            "hmacsha1" => Ok(Self::HmacSha1),
            "hmacsha256" => Ok(Self::HmacSha256),
            "hmacsha384" => Ok(Self::HmacSha384),
            "hmacsha512" => Ok(Self::HmacSha512),
            "diffie_hellman" => Ok(Self::DiffieHellman),
            "dsa" => Ok(Self::Dsa),
            "rsa" => Ok(Self::Rsa),
            "ec" => Ok(Self::Ec),
            _ => Err(format!("Unknown key algorithm: {}", s)),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested or recorded key attributes.
///
/// `alg` stays a lowercase string so plugins can decide for themselves about
/// algorithms the store layer has no variant for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeySpec {
    pub alg: Option<String>,
    pub bit_length: Option<u32>,
    pub mode: Option<String>,
    pub passphrase: Option<SecretString>,
}

impl KeySpec {
    pub fn new(alg: Option<&str>, bit_length: Option<u32>, mode: Option<&str>) -> Self {
        Self {
            alg: alg.map(|a| a.trim().to_ascii_lowercase()).filter(|a| !a.is_empty()),
            bit_length,
            mode: mode.map(|m| m.trim().to_ascii_lowercase()).filter(|m| !m.is_empty()),
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: Option<SecretString>) -> Self {
        self.passphrase = passphrase.filter(|p| !p.is_empty());
        self
    }

    pub fn algorithm(&self) -> Option<KeyAlgorithm> {
        self.alg.as_deref().and_then(|a| a.parse().ok())
    }

    pub fn generation_type(&self) -> Option<GenerationType> {
        self.algorithm().map(|a| a.generation_type())
    }
}
