//! Errors raised by secret store and crypto plugins.

use thiserror::Error;

/// Failures from plugin selection, content translation and the backends.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Secret store plugin \"{name}\" not found")]
    PluginNotFound { name: String },

    #[error("No secret store plugins have been configured")]
    StorePluginsNotConfigured,

    #[error("Secret store plugin \"{name}\" is not available or is misconfigured")]
    StorePluginNotAvailable { name: String },

    #[error("No secret store plugin supports storing secrets: {reason}")]
    StoreSupportedPluginNotFound { reason: String },

    #[error("No secret store plugin supports generating secrets with algorithm '{algorithm}'")]
    GenerateSupportedPluginNotFound { algorithm: String },

    #[error("Crypto plugin \"{name}\" not found")]
    CryptoPluginNotFound { name: String },

    #[error("No crypto plugins have been configured")]
    CryptoPluginsNotConfigured,

    #[error("Crypto plugin does not support the requested operation: {operation}")]
    CryptoUnsupportedOperation { operation: String },

    #[error("Failed to bind kek metadata for plugin: {plugin}")]
    KekBindingFailed { plugin: String },

    #[error("Project KEK has not been created for this plugin")]
    KekNotCreated,

    #[error("Content-Type of '{content_type}' is not supported")]
    ContentTypeNotSupported { content_type: String },

    #[error("Content-Encoding of '{encoding}' is not supported")]
    ContentEncodingNotSupported { encoding: String },

    #[error("Content-Encoding must be base64 for this content type")]
    ContentEncodingMustBeBase64,

    #[error("No secret information provided to encrypt")]
    NoPayloadProvided,

    #[error("Problem decoding payload")]
    PayloadDecoding,

    #[error("Accept of '{accept}' is not supported")]
    AcceptNotSupported { accept: String },

    #[error("Secret algorithm of '{algorithm}' is not supported")]
    AlgorithmNotSupported { algorithm: String },

    #[error("Secret generation is not supported: {reason}")]
    GenerateNotSupported { reason: String },

    #[error("{plugin} does not implement {operation}")]
    NotImplemented { plugin: String, operation: String },

    #[error("No secret information found")]
    SecretNotFound,

    #[error("HSM returned response code: {code}")]
    P11 { code: String },

    #[error("Key with label '{label}' not found in the HSM")]
    P11KeyNotFound { label: String },

    #[error("More than one key found for label '{label}'")]
    P11DuplicateKeys { label: String },

    #[error("HMAC verification of the wrapped project KEK failed")]
    P11HmacVerification,

    #[error("Apparent RNG self-test failure")]
    RngSelfTest,

    #[error("KMIP operation failed. Status: {status}, Reason: {reason}, Message: {message}")]
    Kmip { status: String, reason: String, message: String },

    #[error("Dogtag KRA request failed: {message}")]
    Dogtag { message: String },

    #[error("Secret store backend error: {message}")]
    General { message: String },

    #[error("Multiple secret stores support is not enabled")]
    MultipleStoresNotEnabled,

    #[error("Invalid plugin configuration: {message}")]
    Config { message: String },
}

impl PluginError {
    pub fn general<S: Into<String>>(message: S) -> Self {
        Self::General { message: message.into() }
    }

    pub fn p11<S: Into<String>>(code: S) -> Self {
        Self::P11 { code: code.into() }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn not_implemented<P: Into<String>, O: Into<String>>(plugin: P, operation: O) -> Self {
        Self::NotImplemented { plugin: plugin.into(), operation: operation.into() }
    }

    /// Machine-readable kind used in API error bodies and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            PluginError::PluginNotFound { .. } => "plugin_not_found",
            PluginError::StorePluginsNotConfigured => "store_plugins_not_configured",
            PluginError::StorePluginNotAvailable { .. } => "store_plugin_not_available",
            PluginError::StoreSupportedPluginNotFound { .. } => "store_supported_plugin_not_found",
            PluginError::GenerateSupportedPluginNotFound { .. } => {
                "generate_supported_plugin_not_found"
            }
            PluginError::CryptoPluginNotFound { .. } => "crypto_plugin_not_found",
            PluginError::CryptoPluginsNotConfigured => "crypto_plugins_not_configured",
            PluginError::CryptoUnsupportedOperation { .. } => "crypto_unsupported_operation",
            PluginError::KekBindingFailed { .. } => "kek_binding_failed",
            PluginError::KekNotCreated => "kek_not_created",
            PluginError::ContentTypeNotSupported { .. } => "content_type_not_supported",
            PluginError::ContentEncodingNotSupported { .. } => "content_encoding_not_supported",
            PluginError::ContentEncodingMustBeBase64 => "content_encoding_must_be_base64",
            PluginError::NoPayloadProvided => "no_payload_provided",
            PluginError::PayloadDecoding => "payload_decoding",
            PluginError::AcceptNotSupported { .. } => "accept_not_supported",
            PluginError::AlgorithmNotSupported { .. } => "algorithm_not_supported",
            PluginError::GenerateNotSupported { .. } => "generate_not_supported",
            PluginError::NotImplemented { .. } => "not_implemented",
            PluginError::SecretNotFound => "secret_not_found",
            PluginError::P11 { .. } => "p11_error",
            PluginError::P11KeyNotFound { .. } => "p11_key_not_found",
            PluginError::P11DuplicateKeys { .. } => "p11_duplicate_keys",
            PluginError::P11HmacVerification => "p11_hmac_verification",
            PluginError::RngSelfTest => "rng_self_test",
            PluginError::Kmip { .. } => "kmip_error",
            PluginError::Dogtag { .. } => "dogtag_error",
            PluginError::General { .. } => "secret_store_error",
            PluginError::MultipleStoresNotEnabled => "multiple_stores_not_enabled",
            PluginError::Config { .. } => "plugin_config",
        }
    }

    /// HTTP status code for this failure
    pub fn status_code(&self) -> u16 {
        match self {
            PluginError::PluginNotFound { .. }
            | PluginError::StoreSupportedPluginNotFound { .. }
            | PluginError::GenerateSupportedPluginNotFound { .. }
            | PluginError::CryptoUnsupportedOperation { .. }
            | PluginError::ContentTypeNotSupported { .. }
            | PluginError::ContentEncodingNotSupported { .. }
            | PluginError::ContentEncodingMustBeBase64
            | PluginError::NoPayloadProvided
            | PluginError::PayloadDecoding
            | PluginError::AlgorithmNotSupported { .. }
            | PluginError::GenerateNotSupported { .. }
            | PluginError::NotImplemented { .. } => 400,
            PluginError::SecretNotFound | PluginError::MultipleStoresNotEnabled => 404,
            PluginError::AcceptNotSupported { .. } => 406,
            PluginError::StorePluginNotAvailable { .. } => 503,
            _ => 500,
        }
    }

    /// Transport-level backend failures may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PluginError::Dogtag { .. } | PluginError::General { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_400() {
        assert_eq!(PluginError::NoPayloadProvided.status_code(), 400);
        assert_eq!(
            PluginError::ContentTypeNotSupported { content_type: "x/y".into() }.status_code(),
            400
        );
        assert_eq!(PluginError::PluginNotFound { name: "nope".into() }.status_code(), 400);
    }

    #[test]
    fn backend_errors_map_to_500() {
        assert_eq!(PluginError::P11HmacVerification.status_code(), 500);
        assert_eq!(PluginError::RngSelfTest.status_code(), 500);
        assert_eq!(PluginError::KekNotCreated.status_code(), 500);
    }

    #[test]
    fn kmip_message_carries_status_reason_and_message() {
        let err = PluginError::Kmip {
            status: "OperationFailed".into(),
            reason: "ItemNotFound".into(),
            message: "no such object".into(),
        };
        assert_eq!(
            err.to_string(),
            "KMIP operation failed. Status: OperationFailed, Reason: ItemNotFound, \
             Message: no such object"
        );
        assert_eq!(err.kind(), "kmip_error");
    }
}
