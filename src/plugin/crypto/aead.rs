//! AES-GCM sealing shared by the crypto plugins and the software token.
//!
//! Keys are 16 or 32 bytes (AES-128-GCM or AES-256-GCM). The combined form
//! used for stored blobs is `nonce || ciphertext || tag`.

use crate::errors::{KeystashError, Result};
use ring::aead::{
    self, Aad, Algorithm, BoundKey, Nonce, NonceSequence, UnboundKey, AES_128_GCM, AES_256_GCM,
};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::error;
use zeroize::Zeroizing;

/// Size of the AES-GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of the AES-GCM tag in bytes
pub const TAG_SIZE: usize = 16;

/// Single-use nonce sequence for AES-GCM
struct SingleNonce {
    nonce: Option<[u8; NONCE_SIZE]>,
}

impl SingleNonce {
    fn new(nonce_bytes: [u8; NONCE_SIZE]) -> Self {
        Self { nonce: Some(nonce_bytes) }
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.nonce.take().map(Nonce::assume_unique_for_key).ok_or(ring::error::Unspecified)
    }
}

/// An AES-GCM key whose bytes are wiped on drop
#[derive(Clone)]
pub struct AeadKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadKey").field("bits", &(self.bytes.len() * 8)).finish()
    }
}

impl AeadKey {
    pub fn new(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            16 | 32 => Ok(Self { bytes: Zeroizing::new(bytes.to_vec()) }),
            other => Err(KeystashError::internal(format!(
                "AES-GCM keys must be 16 or 32 bytes, got {} bytes",
                other
            ))),
        }
    }

    /// Fresh random key of `len` bytes.
    pub fn generate(rng: &SystemRandom, len: usize) -> Result<Self> {
        Self::new(&random_bytes(rng, len)?)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn algorithm(&self) -> &'static Algorithm {
        if self.bytes.len() == 16 {
            &AES_128_GCM
        } else {
            &AES_256_GCM
        }
    }

    fn unbound(&self) -> Result<UnboundKey> {
        UnboundKey::new(self.algorithm(), &self.bytes).map_err(|_| {
            error!("Failed to create AES-GCM key");
            KeystashError::internal("Failed to create AES-GCM key")
        })
    }

    /// Encrypt under `nonce`; returns `ciphertext || tag`.
    pub fn seal(&self, nonce: [u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut sealing_key = aead::SealingKey::new(self.unbound()?, SingleNonce::new(nonce));

        let mut buffer = Vec::with_capacity(plaintext.len() + TAG_SIZE);
        buffer.extend_from_slice(plaintext);
        sealing_key.seal_in_place_append_tag(Aad::empty(), &mut buffer).map_err(|_| {
            error!("AES-GCM encryption failed");
            KeystashError::internal("Failed to encrypt data")
        })?;
        Ok(buffer)
    }

    /// Decrypt `ciphertext || tag` sealed under `nonce`.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let nonce: [u8; NONCE_SIZE] = nonce.try_into().map_err(|_| {
            KeystashError::internal(format!(
                "Invalid nonce length: expected {} bytes, got {} bytes",
                NONCE_SIZE,
                nonce.len()
            ))
        })?;
        if ciphertext.len() < TAG_SIZE {
            return Err(KeystashError::internal(
                "Ciphertext too short (missing authentication tag)",
            ));
        }

        let mut opening_key = aead::OpeningKey::new(self.unbound()?, SingleNonce::new(nonce));
        let mut buffer = Zeroizing::new(ciphertext.to_vec());
        let plaintext_len = opening_key
            .open_in_place(Aad::empty(), &mut buffer)
            .map_err(|_| {
                error!("AES-GCM decryption failed - possible tampering or wrong key");
                KeystashError::internal("Failed to decrypt data - authentication failed")
            })?
            .len();
        buffer.truncate(plaintext_len);
        Ok(buffer)
    }

    /// Encrypt under a random nonce; returns `nonce || ciphertext || tag`.
    pub fn seal_combined(&self, rng: &SystemRandom, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = random_nonce(rng)?;
        let sealed = self.seal(nonce, plaintext)?;
        let mut combined = Vec::with_capacity(NONCE_SIZE + sealed.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&sealed);
        Ok(combined)
    }

    pub fn open_combined(&self, combined: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if combined.len() < NONCE_SIZE + TAG_SIZE {
            return Err(KeystashError::internal("Encrypted blob too short"));
        }
        let (nonce, ciphertext) = combined.split_at(NONCE_SIZE);
        self.open(nonce, ciphertext)
    }
}

pub fn random_bytes(rng: &SystemRandom, len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let mut bytes = Zeroizing::new(vec![0u8; len]);
    rng.fill(&mut bytes).map_err(|_| {
        error!("System RNG failure");
        KeystashError::internal("Failed to generate random bytes")
    })?;
    Ok(bytes)
}

pub fn random_nonce(rng: &SystemRandom) -> Result<[u8; NONCE_SIZE]> {
    let mut nonce = [0u8; NONCE_SIZE];
    rng.fill(&mut nonce)
        .map_err(|_| KeystashError::internal("Failed to generate random nonce"))?;
    Ok(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_round_trip_both_key_sizes() {
        let rng = SystemRandom::new();
        for len in [16, 32] {
            let key = AeadKey::generate(&rng, len).unwrap();
            let sealed = key.seal_combined(&rng, b"my-secret-oauth-token").unwrap();
            assert_eq!(sealed.len(), NONCE_SIZE + 21 + TAG_SIZE);
            assert_eq!(&key.open_combined(&sealed).unwrap()[..], b"my-secret-oauth-token");
        }
    }

    #[test]
    fn rejects_unsupported_key_lengths() {
        assert!(AeadKey::new(&[0u8; 24]).is_err());
        assert!(AeadKey::new(&[]).is_err());
    }

    #[test]
    fn nonces_differ_between_seals() {
        let rng = SystemRandom::new();
        let key = AeadKey::generate(&rng, 32).unwrap();
        let a = key.seal_combined(&rng, b"same").unwrap();
        let b = key.seal_combined(&rng, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampering_and_wrong_key_fail() {
        let rng = SystemRandom::new();
        let key = AeadKey::generate(&rng, 32).unwrap();
        let mut sealed = key.seal_combined(&rng, b"payload").unwrap();

        let other = AeadKey::generate(&rng, 32).unwrap();
        assert!(other.open_combined(&sealed).is_err());

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(key.open_combined(&sealed).is_err());
        assert!(key.open_combined(&sealed[..NONCE_SIZE]).is_err());
    }
}
