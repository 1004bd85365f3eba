//! Built-in software token.
//!
//! Implements [`Pkcs11Token`] with `ring`: AES-GCM for encryption and key
//! wrapping, HMAC-SHA256 for signatures. Key objects are held in memory and
//! zeroized on drop. When opened with a state file, persistent (`CKA_TOKEN`)
//! objects are sealed into that file under a key derived from the user PIN
//! with PBKDF2-HMAC-SHA256, so master keys survive restarts.

use super::token::{
    CkResult, Ckr, KeyTemplate, KeyUsage, ObjectHandle, Pkcs11Token, SessionHandle, WrappedKey,
};
use crate::plugin::crypto::aead::{random_bytes, random_nonce, AeadKey, NONCE_SIZE};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use ring::rand::SystemRandom;
use ring::{hmac, pbkdf2};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

const STATE_VERSION: u32 = 1;
const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const HMAC_KEY_LEN: usize = 32;

struct SoftObject {
    label: Option<String>,
    value: Zeroizing<Vec<u8>>,
    usage: KeyUsage,
    extractable: bool,
    /// Owning session for session objects; `None` for token objects
    session: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct StoredObject {
    handle: u64,
    label: Option<String>,
    value: String,
    signing: bool,
    extractable: bool,
}

#[derive(Serialize, Deserialize)]
struct SealedState {
    version: u32,
    iterations: u32,
    salt: String,
    sealed: String,
}

struct StateKey {
    key: AeadKey,
    salt: Vec<u8>,
}

pub struct SoftwareToken {
    slot_id: u64,
    objects: DashMap<u64, SoftObject>,
    /// Open sessions and whether they are read-write
    sessions: DashMap<u64, bool>,
    next_handle: AtomicU64,
    logged_in: AtomicBool,
    pin_digest: Mutex<Option<[u8; 32]>>,
    state_file: Option<PathBuf>,
    state_key: Mutex<Option<StateKey>>,
    rng: SystemRandom,
}

impl std::fmt::Debug for SoftwareToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareToken")
            .field("slot_id", &self.slot_id)
            .field("objects", &self.objects.len())
            .field("sessions", &self.sessions.len())
            .field("state_file", &self.state_file)
            .finish()
    }
}

impl SoftwareToken {
    /// Token whose objects vanish with the process.
    pub fn in_memory(slot_id: u64) -> Self {
        Self {
            slot_id,
            objects: DashMap::new(),
            sessions: DashMap::new(),
            next_handle: AtomicU64::new(1),
            logged_in: AtomicBool::new(false),
            pin_digest: Mutex::new(None),
            state_file: None,
            state_key: Mutex::new(None),
            rng: SystemRandom::new(),
        }
    }

    /// Token whose persistent objects are sealed into `path`. The file is
    /// read at login, when the PIN needed to open it is known.
    pub fn with_state_file(slot_id: u64, path: impl Into<PathBuf>) -> Self {
        Self { state_file: Some(path.into()), ..Self::in_memory(slot_id) }
    }

    /// Number of live key objects, session objects included
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn check_session(&self, session: SessionHandle) -> CkResult<bool> {
        self.sessions.get(&session.0).map(|rw| *rw).ok_or(Ckr::SessionHandleInvalid)
    }

    fn require_login(&self) -> CkResult<()> {
        if self.logged_in.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Ckr::UserNotLoggedIn)
        }
    }

    fn key_value(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        usage: KeyUsage,
    ) -> CkResult<Zeroizing<Vec<u8>>> {
        self.check_session(session)?;
        self.require_login()?;
        let object = self.objects.get(&key.0).ok_or(Ckr::KeyHandleInvalid)?;
        if object.usage != usage {
            return Err(Ckr::KeyFunctionNotPermitted);
        }
        Ok(object.value.clone())
    }

    fn aead_key(&self, session: SessionHandle, key: ObjectHandle) -> CkResult<AeadKey> {
        let value = self.key_value(session, key, KeyUsage::Encryption)?;
        AeadKey::new(&value).map_err(|_| Ckr::KeyFunctionNotPermitted)
    }

    fn nonce(iv: &[u8]) -> CkResult<[u8; NONCE_SIZE]> {
        iv.try_into().map_err(|_| Ckr::ArgumentsBad)
    }

    fn insert_object(&self, object: SoftObject) -> ObjectHandle {
        let handle = self.next_handle();
        self.objects.insert(handle, object);
        ObjectHandle(handle)
    }

    fn derive_state_key(pin: &str, salt: &[u8], iterations: u32) -> CkResult<AeadKey> {
        let iterations = NonZeroU32::new(iterations).ok_or(Ckr::DeviceError)?;
        let mut derived = Zeroizing::new([0u8; 32]);
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt,
            pin.as_bytes(),
            &mut derived[..],
        );
        AeadKey::new(&derived[..]).map_err(|_| Ckr::DeviceError)
    }

    /// Open the state file with `pin`, or start a new one.
    fn load_state(&self, path: &Path, pin: &str) -> CkResult<()> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Initializing software token state");
                let salt = random_bytes(&self.rng, SALT_LEN).map_err(|_| Ckr::DeviceError)?;
                let key = Self::derive_state_key(pin, &salt, PBKDF2_ITERATIONS)?;
                *lock(&self.state_key) = Some(StateKey { key, salt: salt.to_vec() });
                return self.save_state();
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read software token state");
                return Err(Ckr::DeviceError);
            }
        };

        let state: SealedState = serde_json::from_str(&contents).map_err(|e| {
            error!(path = %path.display(), error = %e, "Software token state is corrupt");
            Ckr::DeviceError
        })?;
        if state.version != STATE_VERSION {
            error!(version = state.version, "Unsupported software token state version");
            return Err(Ckr::DeviceError);
        }
        let salt = BASE64.decode(&state.salt).map_err(|_| Ckr::DeviceError)?;
        let sealed = BASE64.decode(&state.sealed).map_err(|_| Ckr::DeviceError)?;

        let key = Self::derive_state_key(pin, &salt, state.iterations)?;
        // a wrong PIN derives a key that fails authentication
        let plaintext = key.open_combined(&sealed).map_err(|_| Ckr::PinIncorrect)?;
        let stored: Vec<StoredObject> =
            serde_json::from_slice(&plaintext).map_err(|_| Ckr::DeviceError)?;

        let count = stored.len();
        let mut max_handle = 0;
        for object in stored {
            let value = BASE64.decode(&object.value).map_err(|_| Ckr::DeviceError)?;
            max_handle = max_handle.max(object.handle);
            self.objects.insert(
                object.handle,
                SoftObject {
                    label: object.label,
                    value: Zeroizing::new(value),
                    usage: if object.signing { KeyUsage::Signing } else { KeyUsage::Encryption },
                    extractable: object.extractable,
                    session: None,
                },
            );
        }
        self.next_handle.fetch_max(max_handle + 1, Ordering::Relaxed);
        *lock(&self.state_key) = Some(StateKey { key, salt });

        debug!(path = %path.display(), objects = count, "Loaded software token state");
        Ok(())
    }

    fn save_state(&self) -> CkResult<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let guard = lock(&self.state_key);
        let Some(state_key) = guard.as_ref() else {
            return Err(Ckr::UserNotLoggedIn);
        };

        let stored: Vec<StoredObject> = self
            .objects
            .iter()
            .filter(|entry| entry.session.is_none())
            .map(|entry| StoredObject {
                handle: *entry.key(),
                label: entry.label.clone(),
                value: BASE64.encode(entry.value.as_slice()),
                signing: entry.usage == KeyUsage::Signing,
                extractable: entry.extractable,
            })
            .collect();
        let plaintext =
            Zeroizing::new(serde_json::to_vec(&stored).map_err(|_| Ckr::DeviceError)?);
        let sealed =
            state_key.key.seal_combined(&self.rng, &plaintext).map_err(|_| Ckr::DeviceError)?;
        let state = SealedState {
            version: STATE_VERSION,
            iterations: PBKDF2_ITERATIONS,
            salt: BASE64.encode(&state_key.salt),
            sealed: BASE64.encode(sealed),
        };
        let json = serde_json::to_vec_pretty(&state).map_err(|_| Ckr::DeviceError)?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, path)).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to write software token state");
            Ckr::DeviceError
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Pkcs11Token for SoftwareToken {
    fn open_session(&self, slot_id: u64, read_write: bool) -> CkResult<SessionHandle> {
        if slot_id != self.slot_id {
            return Err(Ckr::SlotIdInvalid);
        }
        let handle = self.next_handle();
        self.sessions.insert(handle, read_write);
        Ok(SessionHandle(handle))
    }

    fn close_session(&self, session: SessionHandle) -> CkResult<()> {
        self.sessions.remove(&session.0).ok_or(Ckr::SessionHandleInvalid)?;
        self.objects.retain(|_, object| object.session != Some(session.0));
        Ok(())
    }

    fn login(&self, session: SessionHandle, pin: &str) -> CkResult<()> {
        self.check_session(session)?;
        let digest: [u8; 32] = Sha256::digest(pin.as_bytes()).into();

        {
            let known = lock(&self.pin_digest);
            if let Some(expected) = *known {
                if expected != digest {
                    warn!("Software token login rejected");
                    return Err(Ckr::PinIncorrect);
                }
                self.logged_in.store(true, Ordering::Release);
                return Ok(());
            }
        }

        if let Some(path) = &self.state_file {
            self.load_state(path, pin)?;
        }
        *lock(&self.pin_digest) = Some(digest);
        self.logged_in.store(true, Ordering::Release);
        Ok(())
    }

    fn seed_random(&self, session: SessionHandle, seed: &[u8]) -> CkResult<()> {
        self.check_session(session)?;
        // the system RNG cannot be reseeded; the seed is accepted and dropped
        debug!(len = seed.len(), "Ignoring RNG seed for software token");
        Ok(())
    }

    fn generate_random(&self, session: SessionHandle, len: usize) -> CkResult<Zeroizing<Vec<u8>>> {
        self.check_session(session)?;
        random_bytes(&self.rng, len).map_err(|_| Ckr::DeviceError)
    }

    fn find_keys(&self, session: SessionHandle, label: &str) -> CkResult<Vec<ObjectHandle>> {
        self.check_session(session)?;
        if self.require_login().is_err() {
            // private objects are invisible before login
            return Ok(Vec::new());
        }
        let mut found: Vec<ObjectHandle> = self
            .objects
            .iter()
            .filter(|entry| entry.label.as_deref() == Some(label))
            .map(|entry| ObjectHandle(*entry.key()))
            .collect();
        found.sort_by_key(|h| h.0);
        Ok(found)
    }

    fn generate_key(
        &self,
        session: SessionHandle,
        template: &KeyTemplate,
    ) -> CkResult<ObjectHandle> {
        let read_write = self.check_session(session)?;
        self.require_login()?;
        if template.token && !read_write {
            return Err(Ckr::SessionReadOnly);
        }
        let valid_length = match template.usage {
            KeyUsage::Encryption => matches!(template.length, 16 | 32),
            KeyUsage::Signing => template.length >= HMAC_KEY_LEN,
        };
        if !valid_length {
            return Err(Ckr::ArgumentsBad);
        }

        let value = random_bytes(&self.rng, template.length).map_err(|_| Ckr::DeviceError)?;
        let handle = self.insert_object(SoftObject {
            label: template.label.clone(),
            value,
            usage: template.usage,
            extractable: template.extractable,
            session: (!template.token).then_some(session.0),
        });

        if template.token {
            if let Err(e) = self.save_state() {
                self.objects.remove(&handle.0);
                return Err(e);
            }
        }
        Ok(handle)
    }

    fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> CkResult<()> {
        self.check_session(session)?;
        let (_, removed) = self.objects.remove(&object.0).ok_or(Ckr::KeyHandleInvalid)?;
        if removed.session.is_none() {
            self.save_state()?;
        }
        Ok(())
    }

    fn wrap_key(
        &self,
        session: SessionHandle,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> CkResult<WrappedKey> {
        let wrapper = self.aead_key(session, wrapping_key)?;
        let value = {
            let object = self.objects.get(&key.0).ok_or(Ckr::KeyHandleInvalid)?;
            if !object.extractable {
                return Err(Ckr::KeyUnextractable);
            }
            object.value.clone()
        };
        let iv = random_nonce(&self.rng).map_err(|_| Ckr::DeviceError)?;
        let wrapped = wrapper.seal(iv, &value).map_err(|_| Ckr::GeneralError)?;
        Ok(WrappedKey { iv: iv.to_vec(), wrapped })
    }

    fn unwrap_key(
        &self,
        session: SessionHandle,
        wrapping_key: ObjectHandle,
        wrapped: &WrappedKey,
        template: &KeyTemplate,
    ) -> CkResult<ObjectHandle> {
        let wrapper = self.aead_key(session, wrapping_key)?;
        let value = wrapper
            .open(&Self::nonce(&wrapped.iv)?, &wrapped.wrapped)
            .map_err(|_| Ckr::EncryptedDataInvalid)?;
        if template.token {
            return Err(Ckr::ArgumentsBad);
        }
        Ok(self.insert_object(SoftObject {
            label: template.label.clone(),
            value,
            usage: template.usage,
            extractable: template.extractable,
            session: Some(session.0),
        }))
    }

    fn sign(&self, session: SessionHandle, key: ObjectHandle, data: &[u8]) -> CkResult<Vec<u8>> {
        let value = self.key_value(session, key, KeyUsage::Signing)?;
        let key = hmac::Key::new(hmac::HMAC_SHA256, &value);
        Ok(hmac::sign(&key, data).as_ref().to_vec())
    }

    fn verify(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> CkResult<()> {
        let value = self.key_value(session, key, KeyUsage::Signing)?;
        let key = hmac::Key::new(hmac::HMAC_SHA256, &value);
        hmac::verify(&key, data, signature).map_err(|_| Ckr::SignatureInvalid)
    }

    fn encrypt(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        iv: &[u8],
        plaintext: &[u8],
    ) -> CkResult<Vec<u8>> {
        let key = self.aead_key(session, key)?;
        key.seal(Self::nonce(iv)?, plaintext).map_err(|_| Ckr::GeneralError)
    }

    fn decrypt(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        iv: &[u8],
        ciphertext: &[u8],
    ) -> CkResult<Zeroizing<Vec<u8>>> {
        let key = self.aead_key(session, key)?;
        key.open(&Self::nonce(iv)?, ciphertext).map_err(|_| Ckr::EncryptedDataInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logged_in(token: &SoftwareToken) -> SessionHandle {
        let session = token.open_session(1, true).unwrap();
        token.login(session, "1234").unwrap();
        session
    }

    #[test]
    fn sessions_are_bound_to_the_slot() {
        let token = SoftwareToken::in_memory(1);
        assert_eq!(token.open_session(2, true).unwrap_err(), Ckr::SlotIdInvalid);
        let session = token.open_session(1, false).unwrap();
        token.close_session(session).unwrap();
        assert_eq!(token.close_session(session).unwrap_err(), Ckr::SessionHandleInvalid);
    }

    #[test]
    fn keys_require_login_and_matching_pin() {
        let token = SoftwareToken::in_memory(1);
        let session = token.open_session(1, true).unwrap();
        let template = KeyTemplate::master("mkek", 32, KeyUsage::Encryption);
        assert_eq!(token.generate_key(session, &template).unwrap_err(), Ckr::UserNotLoggedIn);

        token.login(session, "1234").unwrap();
        assert_eq!(token.login(session, "4321").unwrap_err(), Ckr::PinIncorrect);
        token.generate_key(session, &template).unwrap();
    }

    #[test]
    fn read_only_sessions_cannot_create_token_objects() {
        let token = SoftwareToken::in_memory(1);
        logged_in(&token);
        let ro = token.open_session(1, false).unwrap();
        let err = token
            .generate_key(ro, &KeyTemplate::master("mkek", 32, KeyUsage::Encryption))
            .unwrap_err();
        assert_eq!(err, Ckr::SessionReadOnly);
    }

    #[test]
    fn wrap_unwrap_and_encrypt() {
        let token = SoftwareToken::in_memory(1);
        let session = logged_in(&token);
        let mkek = token
            .generate_key(session, &KeyTemplate::master("mkek", 32, KeyUsage::Encryption))
            .unwrap();
        let pkek = token.generate_key(session, &KeyTemplate::project_kek("pkek", 32)).unwrap();

        assert_eq!(token.wrap_key(session, pkek, mkek).unwrap_err(), Ckr::KeyUnextractable);
        let wrapped = token.wrap_key(session, mkek, pkek).unwrap();
        let unwrapped = token
            .unwrap_key(session, mkek, &wrapped, &KeyTemplate::project_kek("pkek", 32))
            .unwrap();

        let iv = token.generate_random(session, NONCE_SIZE).unwrap();
        let ct = token.encrypt(session, pkek, &iv, b"payload").unwrap();
        let pt = token.decrypt(session, unwrapped, &iv, &ct).unwrap();
        assert_eq!(&pt[..], b"payload");

        let mut tampered = wrapped.clone();
        tampered.wrapped[0] ^= 0xff;
        let err = token
            .unwrap_key(session, mkek, &tampered, &KeyTemplate::project_kek("pkek", 32))
            .unwrap_err();
        assert_eq!(err, Ckr::EncryptedDataInvalid);
    }

    #[test]
    fn hmac_keys_only_sign() {
        let token = SoftwareToken::in_memory(1);
        let session = logged_in(&token);
        let hmac_key = token
            .generate_key(session, &KeyTemplate::master("hmac", 32, KeyUsage::Signing))
            .unwrap();

        let sig = token.sign(session, hmac_key, b"data").unwrap();
        token.verify(session, hmac_key, b"data", &sig).unwrap();
        assert_eq!(
            token.verify(session, hmac_key, b"other", &sig).unwrap_err(),
            Ckr::SignatureInvalid
        );
        assert_eq!(
            token.encrypt(session, hmac_key, &[0u8; NONCE_SIZE], b"x").unwrap_err(),
            Ckr::KeyFunctionNotPermitted
        );
    }

    #[test]
    fn closing_a_session_destroys_its_session_objects() {
        let token = SoftwareToken::in_memory(1);
        let session = logged_in(&token);
        token
            .generate_key(session, &KeyTemplate::master("mkek", 32, KeyUsage::Encryption))
            .unwrap();
        token.generate_key(session, &KeyTemplate::project_kek("pkek", 32)).unwrap();
        assert_eq!(token.object_count(), 2);

        token.close_session(session).unwrap();
        assert_eq!(token.object_count(), 1);
    }

    #[test]
    fn find_keys_by_label() {
        let token = SoftwareToken::in_memory(1);
        let session = token.open_session(1, true).unwrap();
        assert!(token.find_keys(session, "mkek").unwrap().is_empty());

        token.login(session, "1234").unwrap();
        let template = KeyTemplate::master("mkek", 32, KeyUsage::Encryption);
        let first = token.generate_key(session, &template).unwrap();
        assert_eq!(token.find_keys(session, "mkek").unwrap(), vec![first]);
        token.generate_key(session, &template).unwrap();
        assert_eq!(token.find_keys(session, "mkek").unwrap().len(), 2);
    }

    #[test]
    fn persistent_objects_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");

        let mkek = {
            let token = SoftwareToken::with_state_file(1, &path);
            let session = logged_in(&token);
            token
                .generate_key(session, &KeyTemplate::master("mkek", 32, KeyUsage::Encryption))
                .unwrap();
            token.generate_key(session, &KeyTemplate::project_kek("pkek", 32)).unwrap();
            token.find_keys(session, "mkek").unwrap()[0]
        };

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("mkek"));

        let reopened = SoftwareToken::with_state_file(1, &path);
        let session = logged_in(&reopened);
        assert_eq!(reopened.find_keys(session, "mkek").unwrap(), vec![mkek]);
        assert!(reopened.find_keys(session, "pkek").unwrap().is_empty());

        let wrong = SoftwareToken::with_state_file(1, &path);
        let session = wrong.open_session(1, true).unwrap();
        assert_eq!(wrong.login(session, "0000").unwrap_err(), Ckr::PinIncorrect);
    }
}
