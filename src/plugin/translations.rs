//! Payload normalization around encryption.
//!
//! Store plugins only ever see base64. Text payloads are utf-8 encoded then
//! base64 encoded; binary payloads are base64 encoded unless the client
//! already sent them that way.

use super::mime_types::{self, BINARY, TEXT_PLAIN};
use super::PluginError;
use crate::domain::SecretType;
use crate::errors::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, SubjectPublicKeyInfoDer};

/// Base64 payload ready for a store plugin, with its normalized type
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPayload {
    pub payload: String,
    pub content_type: String,
}

fn normalize_supported(content_type: &str) -> Result<String> {
    let normalized = mime_types::normalize_content_type(content_type);
    if !mime_types::is_supported(&normalized) {
        return Err(PluginError::ContentTypeNotSupported { content_type: content_type.to_string() }
            .into());
    }
    Ok(normalized)
}

/// Validate and base64-normalize a raw client payload.
pub fn normalize_before_encryption(
    payload: &[u8],
    content_type: &str,
    content_encoding: Option<&str>,
    secret_type: SecretType,
    enforce_text_only: bool,
) -> Result<NormalizedPayload> {
    if payload.is_empty() {
        return Err(PluginError::NoPayloadProvided.into());
    }
    let normalized = normalize_supported(content_type)?;

    let encoded = if normalized == TEXT_PLAIN {
        let text = std::str::from_utf8(payload).map_err(|_| PluginError::PayloadDecoding)?;
        STANDARD.encode(text.as_bytes())
    } else {
        match content_encoding.map(str::to_ascii_lowercase).as_deref() {
            None => STANDARD.encode(payload),
            Some(mime_types::BASE64) => {
                let trimmed = trim_ascii(payload);
                STANDARD.decode(trimmed).map_err(|_| PluginError::PayloadDecoding)?;
                String::from_utf8(trimmed.to_vec()).map_err(|_| PluginError::PayloadDecoding)?
            }
            Some(_) if enforce_text_only => {
                return Err(PluginError::ContentEncodingMustBeBase64.into());
            }
            Some(other) => {
                return Err(
                    PluginError::ContentEncodingNotSupported { encoding: other.to_string() }.into()
                )
            }
        }
    };

    tracing::trace!(secret_type = %secret_type, content_type = %normalized, "Normalized payload");
    Ok(NormalizedPayload { payload: encoded, content_type: normalized })
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Reject an `Accept` type before any backend work is done.
pub fn analyze_before_decryption(accept: &str) -> Result<()> {
    if mime_types::is_supported(accept) {
        Ok(())
    } else {
        Err(PluginError::AcceptNotSupported { accept: accept.to_string() }.into())
    }
}

/// Turn a base64 payload from a store plugin back into raw bytes.
pub fn denormalize_after_decryption(b64_payload: &str, accept: &str) -> Result<Vec<u8>> {
    let normalized = mime_types::normalize_content_type(accept);
    let decoded = || STANDARD.decode(b64_payload.trim()).map_err(|_| PluginError::PayloadDecoding);

    if normalized == TEXT_PLAIN {
        let bytes = decoded()?;
        String::from_utf8(bytes)
            .map(String::into_bytes)
            .map_err(|_| PluginError::AcceptNotSupported { accept: accept.to_string() }.into())
    } else if BINARY.contains(&normalized.as_str()) {
        Ok(decoded()?)
    } else {
        Err(PluginError::ContentTypeNotSupported { content_type: accept.to_string() }.into())
    }
}

fn pem_label(secret_type: SecretType) -> Result<&'static str> {
    match secret_type {
        SecretType::Private => Ok("PRIVATE KEY"),
        SecretType::Public => Ok("PUBLIC KEY"),
        SecretType::Certificate => Ok("CERTIFICATE"),
        other => Err(PluginError::general(format!("No PEM form for {other} secrets")).into()),
    }
}

/// DER body of a PEM key or certificate. Private keys come back as PKCS#8.
pub fn convert_pem_to_der(pem: &[u8], secret_type: SecretType) -> Result<Vec<u8>> {
    pem_label(secret_type)?;
    let der = match secret_type {
        SecretType::Private => match PrivateKeyDer::from_pem_slice(pem) {
            Ok(PrivateKeyDer::Pkcs8(key)) => key.secret_pkcs8_der().to_vec(),
            Ok(PrivateKeyDer::Pkcs1(key)) => {
                use rsa::pkcs1::DecodeRsaPrivateKey;
                use rsa::pkcs8::EncodePrivateKey;

                let key = rsa::RsaPrivateKey::from_pkcs1_der(key.secret_pkcs1_der())
                    .map_err(|_| PluginError::PayloadDecoding)?;
                key.to_pkcs8_der().map_err(|_| PluginError::PayloadDecoding)?.as_bytes().to_vec()
            }
            _ => return Err(PluginError::PayloadDecoding.into()),
        },
        SecretType::Public => SubjectPublicKeyInfoDer::from_pem_slice(pem)
            .map_err(|_| PluginError::PayloadDecoding)?
            .as_ref()
            .to_vec(),
        _ => CertificateDer::from_pem_slice(pem)
            .map_err(|_| PluginError::PayloadDecoding)?
            .as_ref()
            .to_vec(),
    };
    Ok(der)
}

/// PEM armour around a DER key or certificate.
pub fn convert_der_to_pem(der: &[u8], secret_type: SecretType) -> Result<Vec<u8>> {
    let label = pem_label(secret_type)?;
    let body = STANDARD.encode(der);
    let mut pem = format!("-----BEGIN {label}-----\n");
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {label}-----\n"));
    Ok(pem.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(payload: &[u8], ct: &str, enc: Option<&str>) -> Result<NormalizedPayload> {
        normalize_before_encryption(payload, ct, enc, SecretType::Opaque, false)
    }

    #[test]
    fn text_round_trip() {
        let normalized =
            normalize("pässword".as_bytes(), "text/plain; charset=utf-8", None).unwrap();
        assert_eq!(normalized.content_type, "text/plain");
        assert_eq!(
            denormalize_after_decryption(&normalized.payload, "text/plain").unwrap(),
            "pässword".as_bytes()
        );
    }

    #[test]
    fn binary_round_trip() {
        let raw = [0u8, 159, 146, 150, 255];
        let normalized = normalize(&raw, "application/octet-stream", None).unwrap();
        assert_eq!(normalized.payload, STANDARD.encode(raw));
        assert_eq!(
            denormalize_after_decryption(&normalized.payload, "application/octet-stream").unwrap(),
            raw
        );
    }

    #[test]
    fn base64_encoded_binary_passes_through() {
        let normalized =
            normalize(b"AAECAw==\n", "application/octet-stream", Some("BASE64")).unwrap();
        assert_eq!(normalized.payload, "AAECAw==");
        assert!(normalize(b"not base64!", "application/octet-stream", Some("base64")).is_err());
    }

    #[test]
    fn rejects_bad_input() {
        let err = normalize(b"", "text/plain", None).unwrap_err();
        assert!(matches!(err.as_plugin(), Some(PluginError::NoPayloadProvided)));

        let err = normalize(b"x", "application/json", None).unwrap_err();
        assert!(matches!(err.as_plugin(), Some(PluginError::ContentTypeNotSupported { .. })));

        for encoding in ["gzip", "binary"] {
            let err = normalize(b"x", "application/octet-stream", Some(encoding)).unwrap_err();
            assert!(matches!(
                err.as_plugin(),
                Some(PluginError::ContentEncodingNotSupported { .. })
            ));
        }

        let err = normalize_before_encryption(
            b"x",
            "application/octet-stream",
            Some("gzip"),
            SecretType::Opaque,
            true,
        )
        .unwrap_err();
        assert!(matches!(err.as_plugin(), Some(PluginError::ContentEncodingMustBeBase64)));
    }

    #[test]
    fn pem_der_conversion() {
        let der = vec![0x30, 0x82, 0x01, 0x0a, 0x02, 0x82, 0x01, 0x01, 0x00];
        for secret_type in [SecretType::Certificate, SecretType::Public, SecretType::Private] {
            let pem = convert_der_to_pem(&der, secret_type).unwrap();
            assert!(String::from_utf8_lossy(&pem).starts_with("-----BEGIN "));
            assert_eq!(convert_pem_to_der(&pem, secret_type).unwrap(), der);
        }

        let long = convert_der_to_pem(&[7u8; 100], SecretType::Certificate).unwrap();
        assert!(String::from_utf8(long).unwrap().lines().all(|l| l.len() <= 64));

        assert!(convert_der_to_pem(&der, SecretType::Symmetric).is_err());
        assert!(convert_pem_to_der(b"not pem", SecretType::Public).is_err());
    }

    #[test]
    fn accept_checks() {
        assert!(analyze_before_decryption("application/pkcs8").is_ok());
        let err = analyze_before_decryption("application/json").unwrap_err();
        assert!(matches!(err.as_plugin(), Some(PluginError::AcceptNotSupported { .. })));

        let binary = STANDARD.encode([0xffu8, 0xfe]);
        let err = denormalize_after_decryption(&binary, "text/plain").unwrap_err();
        assert!(matches!(err.as_plugin(), Some(PluginError::AcceptNotSupported { .. })));
    }
}
