//! REST client for the Dogtag Key Recovery Authority.
//!
//! Requests are Dogtag resource messages: a Java class name plus a list of
//! name/value attributes. Key request responses point at the new key through
//! `keyURL`, whose last path segment is the key id.

use crate::config::DogtagConfig;
use crate::errors::{KeystashError, Result};
use crate::observability::MetricsRecorder;
use crate::plugin::{PluginError, DOGTAG_PLUGIN};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, instrument};
use url::Url;
use zeroize::Zeroizing;

const KEY_REQUESTS_PATH: &str = "kra/rest/agent/keyrequests";
const KEYS_PATH: &str = "kra/rest/agent/keys";
const KEY_RETRIEVE_PATH: &str = "kra/rest/agent/keys/retrieve";

const ARCHIVAL_REQUEST: &str = "com.netscape.certsrv.key.KeyArchivalRequest";
const SYM_KEY_GENERATION_REQUEST: &str = "com.netscape.certsrv.key.SymKeyGenerationRequest";
const ASYM_KEY_GENERATION_REQUEST: &str = "com.netscape.certsrv.key.AsymKeyGenerationRequest";
const KEY_RECOVERY_REQUEST: &str = "com.netscape.certsrv.key.KeyRecoveryRequest";

/// Data type used for every archived secret
pub const PASS_PHRASE_TYPE: &str = "passPhrase";

pub const AES_ALGORITHM: &str = "AES";
pub const DES_ALGORITHM: &str = "DES";
pub const DES3_ALGORITHM: &str = "DES3";
pub const DSA_ALGORITHM: &str = "DSA";
pub const RSA_ALGORITHM: &str = "RSA";

pub const ENCRYPT_USAGE: &str = "encrypt";
pub const DECRYPT_USAGE: &str = "decrypt";

const REQUEST_COMPLETE: &str = "complete";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceMessage {
    pub class_name: String,
    pub attributes: Attributes,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(rename = "Attribute", default)]
    pub attribute: Vec<Attribute>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

impl ResourceMessage {
    fn new(class_name: &str, attributes: Vec<(&str, String)>) -> Self {
        Self {
            class_name: class_name.to_string(),
            attributes: Attributes {
                attribute: attributes
                    .into_iter()
                    .map(|(name, value)| Attribute { name: name.to_string(), value })
                    .collect(),
            },
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.attribute.iter().find(|a| a.name == name).map(|a| a.value.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInfo {
    #[serde(rename = "requestURL", default)]
    pub request_url: Option<String>,
    #[serde(rename = "requestType", default)]
    pub request_type: Option<String>,
    #[serde(rename = "requestStatus")]
    pub request_status: String,
    #[serde(rename = "keyURL", default)]
    pub key_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyRequestResponse {
    request_info: RequestInfo,
}

impl RequestInfo {
    pub fn key_id(&self) -> Option<&str> {
        let url = self.key_url.as_deref()?.trim_end_matches('/');
        url.rsplit('/').next().filter(|id| !id.is_empty())
    }
}

#[derive(Deserialize)]
struct KeyData {
    data: String,
}

/// Key record as reported by the KRA
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    #[serde(rename = "keyURL", default)]
    pub key_url: Option<String>,
    #[serde(rename = "clientKeyID", default)]
    pub client_key_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub size: Option<u32>,
    /// Base64 DER public key of an asymmetric key pair
    #[serde(default)]
    pub public_key: Option<String>,
}

fn dogtag_error(message: impl Into<String>) -> KeystashError {
    PluginError::Dogtag { message: message.into() }.into()
}

/// Client for the KRA key and key request resources
#[derive(Debug, Clone)]
pub struct KraClient {
    http: Client,
    base_url: Url,
    metrics: MetricsRecorder,
}

impl KraClient {
    /// Client authenticating with the agent certificate in `pem_path`.
    pub fn new(config: &DogtagConfig) -> Result<Self> {
        let pem_path = config
            .pem_path
            .as_deref()
            .ok_or_else(|| PluginError::config("dogtag_plugin.pem_path is required"))?;
        let pem = Zeroizing::new(std::fs::read(pem_path).map_err(|e| {
            KeystashError::io(e, format!("Failed to read Dogtag PEM {}", pem_path.display()))
        })?);
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| PluginError::config(format!("Invalid Dogtag client PEM: {e}")))?;

        let http = Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| KeystashError::internal(format!("Failed to create HTTP client: {e}")))?;

        Self::with_http(http, &config.base_url())
    }

    pub fn with_http(http: Client, base_url: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| PluginError::config(format!("Invalid Dogtag URL '{base_url}': {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http, base_url, metrics: MetricsRecorder::new() })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| dogtag_error(format!("Invalid KRA path {path}: {e}")))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let started = Instant::now();
        let result = async {
            let response = request
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await
                .map_err(|e| dogtag_error(format!("{operation} request failed: {e}")))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(dogtag_error(format!("{operation} returned {status}: {body}")));
            }
            response
                .json::<T>()
                .await
                .map_err(|e| dogtag_error(format!("{operation} returned an unreadable body: {e}")))
        }
        .await;

        self.metrics.record_backend_request(
            DOGTAG_PLUGIN,
            operation,
            started.elapsed().as_secs_f64(),
            result.is_ok(),
        );
        result
    }

    async fn submit_key_request(
        &self,
        operation: &'static str,
        message: ResourceMessage,
    ) -> Result<String> {
        let url = self.url(KEY_REQUESTS_PATH)?;
        let response: KeyRequestResponse =
            self.send(operation, self.http.post(url).json(&message)).await?;
        let info = response.request_info;
        if !info.request_status.eq_ignore_ascii_case(REQUEST_COMPLETE) {
            return Err(dogtag_error(format!(
                "{operation} request is {} rather than complete",
                info.request_status
            )));
        }
        let key_id = info
            .key_id()
            .ok_or_else(|| dogtag_error(format!("{operation} response carried no key URL")))?;
        debug!(operation, key_id, "KRA key request completed");
        Ok(key_id.to_string())
    }

    /// Archive `data` and return the new key id.
    #[instrument(skip(self, data), name = "kra_archive_key")]
    pub async fn archive_key(
        &self,
        client_key_id: &str,
        data_type: &str,
        data: &[u8],
    ) -> Result<String> {
        let message = ResourceMessage::new(
            ARCHIVAL_REQUEST,
            vec![
                ("clientKeyID", client_key_id.to_string()),
                ("dataType", data_type.to_string()),
                ("data", BASE64.encode(data)),
            ],
        );
        self.submit_key_request("archive_key", message).await
    }

    #[instrument(skip(self), name = "kra_generate_symmetric_key")]
    pub async fn generate_symmetric_key(
        &self,
        client_key_id: &str,
        algorithm: &str,
        size: Option<u32>,
        usages: &[&str],
    ) -> Result<String> {
        let message = Self::generation_request(
            SYM_KEY_GENERATION_REQUEST,
            client_key_id,
            algorithm,
            size,
            usages,
        );
        self.submit_key_request("generate_symmetric_key", message).await
    }

    #[instrument(skip(self), name = "kra_generate_asymmetric_key")]
    pub async fn generate_asymmetric_key(
        &self,
        client_key_id: &str,
        algorithm: &str,
        size: Option<u32>,
        usages: &[&str],
    ) -> Result<String> {
        let message = Self::generation_request(
            ASYM_KEY_GENERATION_REQUEST,
            client_key_id,
            algorithm,
            size,
            usages,
        );
        self.submit_key_request("generate_asymmetric_key", message).await
    }

    fn generation_request(
        class_name: &str,
        client_key_id: &str,
        algorithm: &str,
        size: Option<u32>,
        usages: &[&str],
    ) -> ResourceMessage {
        let mut attributes = vec![
            ("clientKeyID", client_key_id.to_string()),
            ("keyAlgorithm", algorithm.to_string()),
            ("keyUsage", usages.join(",")),
        ];
        if let Some(size) = size {
            attributes.push(("keySize", size.to_string()));
        }
        ResourceMessage::new(class_name, attributes)
    }

    /// Recover the plaintext of a stored key.
    #[instrument(skip(self), name = "kra_retrieve_key")]
    pub async fn retrieve_key(&self, key_id: &str) -> Result<Zeroizing<Vec<u8>>> {
        let message =
            ResourceMessage::new(KEY_RECOVERY_REQUEST, vec![("keyId", key_id.to_string())]);
        let url = self.url(KEY_RETRIEVE_PATH)?;
        let data: KeyData = self.send("retrieve_key", self.http.post(url).json(&message)).await?;
        let decoded = BASE64
            .decode(data.data.as_bytes())
            .map_err(|_| dogtag_error("retrieve_key returned data that is not base64"))?;
        Ok(Zeroizing::new(decoded))
    }

    #[instrument(skip(self), name = "kra_get_key_info")]
    pub async fn get_key_info(&self, key_id: &str) -> Result<KeyInfo> {
        let url = self.url(&format!("{KEYS_PATH}/{key_id}"))?;
        self.send("get_key_info", self.http.get(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> KraClient {
        KraClient::with_http(Client::new(), &server.uri()).unwrap()
    }

    fn complete(key_url: &str) -> serde_json::Value {
        json!({
            "RequestInfo": {
                "requestURL": "https://kra/kra/rest/agent/keyrequests/12",
                "requestType": "securityDataEnrollment",
                "requestStatus": "complete",
                "keyURL": key_url,
            }
        })
    }

    #[tokio::test]
    async fn archive_returns_key_id_from_key_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/kra/rest/agent/keyrequests"))
            .and(body_partial_json(json!({
                "ClassName": ARCHIVAL_REQUEST,
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(complete("https://kra/kra/rest/agent/keys/0x1f")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let key_id = client(&server)
            .await
            .archive_key("abc", PASS_PHRASE_TYPE, b"secret")
            .await
            .unwrap();
        assert_eq!(key_id, "0x1f");
    }

    #[tokio::test]
    async fn incomplete_request_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/kra/rest/agent/keyrequests"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "RequestInfo": { "requestStatus": "rejected" }
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .generate_symmetric_key(
                "abc",
                AES_ALGORITHM,
                Some(128),
                &[DECRYPT_USAGE, ENCRYPT_USAGE],
            )
            .await
            .unwrap_err();
        assert!(matches!(err.as_plugin(), Some(PluginError::Dogtag { .. })));
        assert!(err.to_string().contains("rejected"));
    }

    #[tokio::test]
    async fn retrieve_decodes_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/kra/rest/agent/keys/retrieve"))
            .and(body_partial_json(json!({
                "Attributes": { "Attribute": [{ "name": "keyId", "value": "0x2" }] }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": BASE64.encode(b"recovered"),
                "algorithm": "AES",
                "size": 128,
            })))
            .mount(&server)
            .await;

        let data = client(&server).await.retrieve_key("0x2").await.unwrap();
        assert_eq!(data.as_slice(), b"recovered");
    }

    #[tokio::test]
    async fn http_errors_surface_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/kra/rest/agent/keys/0x9"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Key not found"))
            .mount(&server)
            .await;

        let err = client(&server).await.get_key_info("0x9").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("404"));
        assert!(message.contains("Key not found"));
        assert!(err.is_retryable());
    }

    #[test]
    fn key_id_parsing() {
        let info = RequestInfo {
            request_url: None,
            request_type: None,
            request_status: "complete".into(),
            key_url: Some("https://kra:8443/kra/rest/agent/keys/0x5/".into()),
        };
        assert_eq!(info.key_id(), Some("0x5"));
        assert_eq!(RequestInfo { key_url: None, ..info }.key_id(), None);
    }

    #[test]
    fn pem_path_is_required() {
        let err = KraClient::new(&DogtagConfig::default()).unwrap_err();
        assert!(matches!(err.as_plugin(), Some(PluginError::Config { .. })));
    }
}
