//! Payload content types keystash accepts and the encodings each allows.

use std::collections::BTreeMap;

pub const TEXT_PLAIN: &str = "text/plain";
pub const OCTET_STREAM: &str = "application/octet-stream";
pub const PKCS8: &str = "application/pkcs8";
pub const PKIX_CERT: &str = "application/pkix-cert";

pub const PLAIN_TEXT: &[&str] =
    &[TEXT_PLAIN, "text/plain;charset=utf-8", "text/plain; charset=utf-8"];
pub const BINARY: &[&str] = &[OCTET_STREAM, PKCS8, PKIX_CERT];

const PLAIN_TEXT_CHARSETS: &[&str] = &["utf-8"];

pub const BASE64: &str = "base64";
pub const BINARY_ENCODING: &str = "binary";

/// Map a content type to its internal form: parameters stripped and
/// utf-8 text collapsed to `text/plain`. Unknown charsets and malformed
/// parameters leave the input unchanged.
pub fn normalize_content_type(content_type: &str) -> String {
    let mut parts = content_type.split(';').map(str::trim);
    let mime = parts.next().unwrap_or_default().to_ascii_lowercase();

    if let Some(parameter) = parts.next() {
        let Some((_, charset)) = parameter.split_once('=') else {
            return content_type.to_string();
        };
        if !PLAIN_TEXT_CHARSETS.contains(&charset.trim().to_ascii_lowercase().as_str()) {
            return content_type.to_string();
        }
    }

    if mime == TEXT_PLAIN || BINARY.contains(&mime.as_str()) {
        mime
    } else {
        content_type.to_string()
    }
}

pub fn is_supported(content_type: &str) -> bool {
    let normalized = normalize_content_type(content_type);
    PLAIN_TEXT.contains(&normalized.as_str()) || BINARY.contains(&normalized.as_str())
}

pub fn is_binary(content_type: &str) -> bool {
    BINARY.contains(&normalize_content_type(content_type).as_str())
}

/// Transfer encodings accepted with `content_type`; text takes none.
pub fn supported_encodings(content_type: &str) -> &'static [&'static str] {
    if is_binary(content_type) {
        &[BASE64, BINARY_ENCODING]
    } else {
        &[]
    }
}

pub fn is_content_type_with_encoding_supported(
    content_type: &str,
    content_encoding: Option<&str>,
) -> bool {
    if !is_supported(content_type) {
        return false;
    }
    let encodings = supported_encodings(content_type);
    match content_encoding {
        Some(encoding) => encodings.contains(&encoding.to_ascii_lowercase().as_str()),
        None => encodings.is_empty(),
    }
}

/// `content_types` advertised for a secret stored as `content_type`.
pub fn content_types_for(content_type: &str) -> Option<BTreeMap<String, String>> {
    let normalized = normalize_content_type(content_type);
    (normalized == TEXT_PLAIN || BINARY.contains(&normalized.as_str()))
        .then(|| BTreeMap::from([("default".to_string(), normalized)]))
}
