//! The slice of the PKCS#11 API the `p11_crypto` plugin relies on.
//!
//! Calls mirror `C_*` functions but take typed handles and return [`Ckr`]
//! codes instead of `CK_RV`. Implementations must be usable from several
//! threads at once; sessions are the caller's to open and close.

use std::fmt;
use zeroize::Zeroizing;

/// `CK_OBJECT_HANDLE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub u64);

/// `CK_SESSION_HANDLE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

/// Return values the plugin distinguishes. Everything else from a vendor
/// module maps to [`Ckr::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ckr {
    GeneralError,
    ArgumentsBad,
    DeviceError,
    EncryptedDataInvalid,
    KeyFunctionNotPermitted,
    KeyHandleInvalid,
    KeyUnextractable,
    PinIncorrect,
    SessionHandleInvalid,
    SessionReadOnly,
    SignatureInvalid,
    SlotIdInvalid,
    UserNotLoggedIn,
    Other(u64),
}

impl Ckr {
    pub fn code(&self) -> u64 {
        match self {
            Ckr::GeneralError => 0x05,
            Ckr::ArgumentsBad => 0x07,
            Ckr::DeviceError => 0x30,
            Ckr::EncryptedDataInvalid => 0x40,
            Ckr::KeyFunctionNotPermitted => 0x68,
            Ckr::KeyHandleInvalid => 0x60,
            Ckr::KeyUnextractable => 0x6a,
            Ckr::PinIncorrect => 0xa0,
            Ckr::SessionHandleInvalid => 0xb3,
            Ckr::SessionReadOnly => 0xb5,
            Ckr::SignatureInvalid => 0xc0,
            Ckr::SlotIdInvalid => 0x03,
            Ckr::UserNotLoggedIn => 0x101,
            Ckr::Other(code) => *code,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Ckr::GeneralError => "CKR_GENERAL_ERROR",
            Ckr::ArgumentsBad => "CKR_ARGUMENTS_BAD",
            Ckr::DeviceError => "CKR_DEVICE_ERROR",
            Ckr::EncryptedDataInvalid => "CKR_ENCRYPTED_DATA_INVALID",
            Ckr::KeyFunctionNotPermitted => "CKR_KEY_FUNCTION_NOT_PERMITTED",
            Ckr::KeyHandleInvalid => "CKR_KEY_HANDLE_INVALID",
            Ckr::KeyUnextractable => "CKR_KEY_UNEXTRACTABLE",
            Ckr::PinIncorrect => "CKR_PIN_INCORRECT",
            Ckr::SessionHandleInvalid => "CKR_SESSION_HANDLE_INVALID",
            Ckr::SessionReadOnly => "CKR_SESSION_READ_ONLY",
            Ckr::SignatureInvalid => "CKR_SIGNATURE_INVALID",
            Ckr::SlotIdInvalid => "CKR_SLOT_ID_INVALID",
            Ckr::UserNotLoggedIn => "CKR_USER_NOT_LOGGED_IN",
            Ckr::Other(_) => "CKR_VENDOR_DEFINED",
        }
    }
}

impl fmt::Display for Ckr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.code())
    }
}

pub type CkResult<T> = std::result::Result<T, Ckr>;

/// What a key may be used for (`CKA_ENCRYPT`, `CKA_WRAP`, `CKA_SIGN`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    /// Encrypt, decrypt, wrap and unwrap
    Encryption,
    /// HMAC sign and verify
    Signing,
}

/// Attribute template for AES secret keys (`CKO_SECRET_KEY`, `CKK_AES`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    pub label: Option<String>,
    /// `CKA_VALUE_LEN` in bytes
    pub length: usize,
    pub usage: KeyUsage,
    /// `CKA_TOKEN`: persistent rather than session object
    pub token: bool,
    pub extractable: bool,
}

impl KeyTemplate {
    /// Non-extractable persistent master key
    pub fn master(label: &str, length: usize, usage: KeyUsage) -> Self {
        Self { label: Some(label.to_string()), length, usage, token: true, extractable: false }
    }

    /// Extractable session key that will be wrapped out of the token
    pub fn project_kek(label: &str, length: usize) -> Self {
        Self {
            label: Some(label.to_string()),
            length,
            usage: KeyUsage::Encryption,
            token: false,
            extractable: true,
        }
    }
}

/// Output of `C_WrapKey` together with the IV it was wrapped under
#[derive(Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub iv: Vec<u8>,
    pub wrapped: Vec<u8>,
}

impl fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedKey")
            .field("iv_len", &self.iv.len())
            .field("wrapped_len", &self.wrapped.len())
            .finish()
    }
}

/// A PKCS#11 token. Methods block; the plugin keeps calls short.
pub trait Pkcs11Token: Send + Sync + fmt::Debug {
    fn open_session(&self, slot_id: u64, read_write: bool) -> CkResult<SessionHandle>;

    /// Closing a session destroys the session objects created in it.
    fn close_session(&self, session: SessionHandle) -> CkResult<()>;

    fn login(&self, session: SessionHandle, pin: &str) -> CkResult<()>;

    fn seed_random(&self, session: SessionHandle, seed: &[u8]) -> CkResult<()>;

    fn generate_random(&self, session: SessionHandle, len: usize) -> CkResult<Zeroizing<Vec<u8>>>;

    /// `C_FindObjects` over secret keys with `label`
    fn find_keys(&self, session: SessionHandle, label: &str) -> CkResult<Vec<ObjectHandle>>;

    fn generate_key(&self, session: SessionHandle, template: &KeyTemplate)
        -> CkResult<ObjectHandle>;

    fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> CkResult<()>;

    fn wrap_key(
        &self,
        session: SessionHandle,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> CkResult<WrappedKey>;

    fn unwrap_key(
        &self,
        session: SessionHandle,
        wrapping_key: ObjectHandle,
        wrapped: &WrappedKey,
        template: &KeyTemplate,
    ) -> CkResult<ObjectHandle>;

    /// `CKM_SHA256_HMAC` signature
    fn sign(&self, session: SessionHandle, key: ObjectHandle, data: &[u8]) -> CkResult<Vec<u8>>;

    /// Fails with [`Ckr::SignatureInvalid`] on mismatch.
    fn verify(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> CkResult<()>;

    /// `CKM_AES_GCM`; returns `ciphertext || tag`.
    fn encrypt(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        iv: &[u8],
        plaintext: &[u8],
    ) -> CkResult<Vec<u8>>;

    fn decrypt(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        iv: &[u8],
        ciphertext: &[u8],
    ) -> CkResult<Zeroizing<Vec<u8>>>;
}
