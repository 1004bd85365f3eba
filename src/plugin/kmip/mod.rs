//! KMIP secret store.
//!
//! Secrets live on a KMIP 1.1 device; keystash keeps only the device's
//! unique identifier as `key_uuid` metadata. Private keys travel as PKCS#8
//! DER and public keys as X.509 SubjectPublicKeyInfo DER.

pub mod client;
pub mod protocol;
pub mod ttlv;

pub use client::{KmipClient, TlsKmipClient};

use self::protocol::{
    CryptographicAlgorithm, KeyBlock, KeyFormatType, ObjectType, Operation, ResultStatus,
};
use self::ttlv::Ttlv;
use super::store::{
    AsymmetricKeyMetadataDto, SecretDto, SecretMetadata, SecretStorePlugin, StoreContext,
};
use super::translations;
use super::{PluginError, KMIP_PLUGIN};
use crate::config::KmipConfig;
use crate::domain::{GenerationType, KeyAlgorithm, KeySpec, SecretType};
use crate::errors::Result;
use crate::observability::MetricsRecorder;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

/// Metadata key holding the device's identifier for the object
pub const KEY_UUID: &str = "key_uuid";

/// KMIP algorithm and accepted bit lengths for a keystash algorithm
fn kmip_algorithm(algorithm: KeyAlgorithm) -> Option<(CryptographicAlgorithm, &'static [u32])> {
    match algorithm {
        KeyAlgorithm::Aes => Some((CryptographicAlgorithm::Aes, &[128, 192, 256])),
        KeyAlgorithm::Des => Some((CryptographicAlgorithm::Des, &[56])),
        KeyAlgorithm::Desede => {
            Some((CryptographicAlgorithm::TripleDes, &[56, 64, 112, 128, 168, 192]))
        }
        KeyAlgorithm::Dsa => Some((CryptographicAlgorithm::Dsa, &[1024, 2048, 3072])),
        KeyAlgorithm::Rsa => Some((CryptographicAlgorithm::Rsa, &[1024, 2048, 3072, 4096])),
        _ => None,
    }
}

fn keystash_algorithm(algorithm: CryptographicAlgorithm) -> KeyAlgorithm {
    match algorithm {
        CryptographicAlgorithm::Aes => KeyAlgorithm::Aes,
        CryptographicAlgorithm::Des => KeyAlgorithm::Des,
        CryptographicAlgorithm::TripleDes => KeyAlgorithm::Desede,
        CryptographicAlgorithm::Dsa => KeyAlgorithm::Dsa,
        CryptographicAlgorithm::Rsa => KeyAlgorithm::Rsa,
    }
}

fn object_type_for(secret_type: SecretType) -> Option<(ObjectType, KeyFormatType)> {
    match secret_type {
        SecretType::Symmetric => Some((ObjectType::SymmetricKey, KeyFormatType::Raw)),
        SecretType::Private => Some((ObjectType::PrivateKey, KeyFormatType::Pkcs8)),
        SecretType::Public => Some((ObjectType::PublicKey, KeyFormatType::X509)),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct KmipSecretStore {
    client: Arc<dyn KmipClient>,
    metrics: MetricsRecorder,
}

impl KmipSecretStore {
    /// Store talking to the device described by `config` over TLS
    pub fn new(config: &KmipConfig) -> Result<Self> {
        Ok(Self::with_client(Arc::new(TlsKmipClient::new(config)?)))
    }

    pub fn with_client(client: Arc<dyn KmipClient>) -> Self {
        Self { client, metrics: MetricsRecorder::new() }
    }

    /// Run one operation and return its response payload, mapping any
    /// non-success result to [`PluginError::Kmip`].
    async fn call(&self, operation: Operation, payload: Ttlv) -> Result<Ttlv> {
        let started = Instant::now();
        let result = self.client.call(operation, payload).await;
        let ok = matches!(&result, Ok(r) if r.status == ResultStatus::Success);
        self.metrics.record_backend_request(
            KMIP_PLUGIN,
            operation.as_str(),
            started.elapsed().as_secs_f64(),
            ok,
        );

        let result = result?;
        if result.status != ResultStatus::Success {
            let error = PluginError::Kmip {
                status: result.status.as_str().to_string(),
                reason: result.reason.unwrap_or_default(),
                message: result.message.unwrap_or_default(),
            };
            debug!(operation = operation.as_str(), error = %error, "ERROR from KMIP device");
            return Err(error.into());
        }
        result
            .payload
            .ok_or_else(|| PluginError::general("KMIP response carried no payload").into())
    }

    fn supported_algorithm(
        &self,
        key_spec: &KeySpec,
    ) -> Result<(KeyAlgorithm, CryptographicAlgorithm)> {
        let algorithm = key_spec.algorithm().filter(|_| self.generate_supports(key_spec));
        let algorithm = algorithm.ok_or_else(|| PluginError::AlgorithmNotSupported {
            algorithm: key_spec.alg.clone().unwrap_or_default(),
        })?;
        let (kmip, _) = kmip_algorithm(algorithm).ok_or_else(|| PluginError::AlgorithmNotSupported {
            algorithm: algorithm.to_string(),
        })?;
        Ok((algorithm, kmip))
    }

    fn key_uuid(metadata: &SecretMetadata) -> Result<&str> {
        metadata
            .get(KEY_UUID)
            .map(String::as_str)
            .ok_or_else(|| PluginError::general("Secret metadata has no key_uuid").into())
    }

    fn bit_length(key_spec: &KeySpec) -> Option<i32> {
        key_spec.bit_length.and_then(|b| i32::try_from(b).ok())
    }
}

fn ttlv_error(e: ttlv::TtlvError) -> PluginError {
    PluginError::general(format!("Unexpected KMIP payload: {e}"))
}

#[async_trait]
impl SecretStorePlugin for KmipSecretStore {
    fn name(&self) -> &str {
        KMIP_PLUGIN
    }

    #[instrument(skip(self, _ctx), name = "kmip_generate_symmetric")]
    async fn generate_symmetric_key(
        &self,
        key_spec: &KeySpec,
        _ctx: &StoreContext,
    ) -> Result<SecretMetadata> {
        debug!("Starting symmetric key generation with KMIP plugin");
        let (algorithm, kmip) = self.supported_algorithm(key_spec)?;
        if algorithm.generation_type() != GenerationType::Symmetric {
            return Err(PluginError::general(format!(
                "An unsupported algorithm {algorithm} was passed to symmetric key generation"
            ))
            .into());
        }

        let attributes = protocol::key_attributes(Some(kmip), Self::bit_length(key_spec));
        let payload = self
            .call(Operation::Create, protocol::create_payload(ObjectType::SymmetricKey, attributes))
            .await?;
        let uuid = protocol::unique_identifier(&payload).map_err(ttlv_error)?;
        debug!(%uuid, "SUCCESS: Symmetric key generated");
        Ok(SecretMetadata::from([(KEY_UUID.to_string(), uuid)]))
    }

    #[instrument(skip(self, _ctx), name = "kmip_generate_asymmetric")]
    async fn generate_asymmetric_key(
        &self,
        key_spec: &KeySpec,
        _ctx: &StoreContext,
    ) -> Result<AsymmetricKeyMetadataDto> {
        debug!("Starting asymmetric key generation with KMIP plugin");
        let (algorithm, kmip) = self.supported_algorithm(key_spec)?;
        if algorithm.generation_type() != GenerationType::Asymmetric {
            return Err(PluginError::general(format!(
                "An unsupported algorithm {algorithm} was passed to asymmetric key generation"
            ))
            .into());
        }
        if key_spec.passphrase.is_some() {
            return Err(PluginError::general(
                "KMIP plugin does not currently support protecting the private key \
                 with a passphrase",
            )
            .into());
        }

        let attributes = protocol::key_attributes(Some(kmip), Self::bit_length(key_spec));
        let payload = self
            .call(Operation::CreateKeyPair, protocol::create_key_pair_payload(attributes))
            .await?;
        let (private_uuid, public_uuid) =
            protocol::key_pair_identifiers(&payload).map_err(ttlv_error)?;
        debug!(%private_uuid, %public_uuid, "SUCCESS: Asymmetric key pair generated");

        Ok(AsymmetricKeyMetadataDto {
            private_key_meta: SecretMetadata::from([(KEY_UUID.to_string(), private_uuid)]),
            public_key_meta: SecretMetadata::from([(KEY_UUID.to_string(), public_uuid)]),
            passphrase_meta: None,
        })
    }

    #[instrument(
        skip(self, secret, _ctx),
        fields(secret_type = %secret.secret_type),
        name = "kmip_store_secret"
    )]
    async fn store_secret(
        &self,
        secret: &SecretDto,
        _ctx: &StoreContext,
    ) -> Result<SecretMetadata> {
        let (_, kmip) = self.supported_algorithm(&secret.key_spec)?;
        let (object_type, format) = object_type_for(secret.secret_type).ok_or_else(|| {
            PluginError::general(format!(
                "Secret object type {} is not supported",
                secret.secret_type
            ))
        })?;

        let mut material = Zeroizing::new(
            BASE64.decode(secret.secret.as_bytes()).map_err(|_| PluginError::PayloadDecoding)?,
        );
        if secret.secret_type.is_pem_encoded() {
            material =
                Zeroizing::new(translations::convert_pem_to_der(&material, secret.secret_type)?);
        }

        let block = KeyBlock {
            format,
            material: material.to_vec(),
            algorithm: Some(kmip),
            length: Self::bit_length(&secret.key_spec),
        };
        let payload =
            protocol::register_payload(object_type, protocol::key_attributes(None, None), &block);
        let response = self.call(Operation::Register, payload).await?;
        let uuid = protocol::unique_identifier(&response).map_err(ttlv_error)?;
        debug!(%uuid, "SUCCESS: Key stored");
        Ok(SecretMetadata::from([(KEY_UUID.to_string(), uuid)]))
    }

    #[instrument(skip(self, metadata, _ctx), name = "kmip_get_secret")]
    async fn get_secret(
        &self,
        secret_type: SecretType,
        metadata: &SecretMetadata,
        _ctx: &StoreContext,
    ) -> Result<SecretDto> {
        let uuid = Self::key_uuid(metadata)?;
        let format = object_type_for(secret_type).map(|(_, format)| format);
        let payload = self.call(Operation::Get, protocol::get_payload(uuid, format)).await?;
        let (_, block) = protocol::managed_object(&payload).map_err(ttlv_error)?;

        let material = Zeroizing::new(block.material.clone());
        let material = if secret_type.is_pem_encoded() {
            Zeroizing::new(translations::convert_der_to_pem(&material, secret_type)?)
        } else {
            material
        };

        let algorithm = block.algorithm.map(keystash_algorithm);
        if algorithm.is_none() {
            warn!(%uuid, "KMIP object has no cryptographic algorithm");
        }
        let key_spec = KeySpec::new(
            algorithm.map(|a| a.as_str()),
            block.length.and_then(|l| u32::try_from(l).ok()),
            None,
        );
        debug!(%uuid, "SUCCESS: Key retrieved");
        Ok(SecretDto::new(secret_type, BASE64.encode(material.as_slice()), key_spec))
    }

    #[instrument(skip(self, metadata), name = "kmip_delete_secret")]
    async fn delete_secret(&self, metadata: &SecretMetadata) -> Result<()> {
        let uuid = Self::key_uuid(metadata)?;
        self.call(Operation::Destroy, protocol::destroy_payload(uuid)).await?;
        debug!(%uuid, "SUCCESS: Key deleted");
        Ok(())
    }

    fn generate_supports(&self, key_spec: &KeySpec) -> bool {
        let Some((_, lengths)) = key_spec.algorithm().and_then(kmip_algorithm) else {
            return false;
        };
        key_spec.bit_length.is_some_and(|bits| lengths.contains(&bits))
    }

    fn store_secret_supports(&self, key_spec: &KeySpec) -> bool {
        self.generate_supports(key_spec)
    }
}

#[cfg(test)]
mod tests {
    use super::protocol::{tag, OperationResult};
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// In-process KMIP device. Requests and responses go through the TTLV
    /// codec so the wire format is exercised.
    #[derive(Debug, Default)]
    pub(crate) struct FakeDevice {
        objects: Mutex<HashMap<String, (ObjectType, KeyBlock)>>,
        next_id: AtomicU64,
        pub(crate) operations: Mutex<Vec<Operation>>,
    }

    impl FakeDevice {
        fn next_uid(&self) -> String {
            (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string()
        }

        fn template_params(template: &Ttlv) -> (Option<CryptographicAlgorithm>, Option<i32>) {
            let algorithm =
                protocol::template_attribute(template, protocol::ATTR_CRYPTOGRAPHIC_ALGORITHM)
                    .and_then(|v| v.as_enum().ok())
                    .and_then(CryptographicAlgorithm::from_code);
            let length = protocol::template_attribute(template, protocol::ATTR_CRYPTOGRAPHIC_LENGTH)
                .and_then(|v| v.as_int().ok());
            (algorithm, length)
        }

        fn handle(&self, operation: Operation, payload: &Ttlv) -> OperationResult {
            let uid_payload = |uid: String| {
                OperationResult::success(Ttlv::structure(
                    tag::RESPONSE_PAYLOAD,
                    vec![Ttlv::text(tag::UNIQUE_IDENTIFIER, uid)],
                ))
            };
            let mut objects = self.objects.lock().unwrap();

            match operation {
                Operation::Create => {
                    let template = payload.child(tag::TEMPLATE_ATTRIBUTE).unwrap();
                    let (algorithm, length) = Self::template_params(template);
                    let bytes = length.unwrap_or(128) as usize / 8;
                    let uid = self.next_uid();
                    let block = KeyBlock {
                        format: KeyFormatType::Raw,
                        material: vec![0xA5; bytes],
                        algorithm,
                        length,
                    };
                    objects.insert(uid.clone(), (ObjectType::SymmetricKey, block));
                    uid_payload(uid)
                }
                Operation::CreateKeyPair => {
                    let template = payload.child(tag::COMMON_TEMPLATE_ATTRIBUTE).unwrap();
                    let (algorithm, length) = Self::template_params(template);
                    let private_uid = self.next_uid();
                    let public_uid = self.next_uid();
                    for (uid, object_type, format) in [
                        (&private_uid, ObjectType::PrivateKey, KeyFormatType::Pkcs8),
                        (&public_uid, ObjectType::PublicKey, KeyFormatType::X509),
                    ] {
                        let material = vec![0x30, 0x03, 1, 2, 3];
                        let block = KeyBlock { format, material, algorithm, length };
                        objects.insert(uid.clone(), (object_type, block));
                    }
                    OperationResult::success(Ttlv::structure(
                        tag::RESPONSE_PAYLOAD,
                        vec![
                            Ttlv::text(tag::PRIVATE_KEY_UNIQUE_IDENTIFIER, private_uid),
                            Ttlv::text(tag::PUBLIC_KEY_UNIQUE_IDENTIFIER, public_uid),
                        ],
                    ))
                }
                Operation::Register => {
                    let (object_type, block) = protocol::managed_object(payload).unwrap();
                    let uid = self.next_uid();
                    objects.insert(uid.clone(), (object_type, block));
                    uid_payload(uid)
                }
                Operation::Get => {
                    let uid = protocol::unique_identifier(payload).unwrap();
                    match objects.get(&uid) {
                        Some((object_type, block)) => OperationResult::success(Ttlv::structure(
                            tag::RESPONSE_PAYLOAD,
                            vec![
                                Ttlv::enumeration(tag::OBJECT_TYPE, *object_type as u32),
                                Ttlv::text(tag::UNIQUE_IDENTIFIER, uid.clone()),
                                Ttlv::structure(object_type.object_tag(), vec![block.to_ttlv()]),
                            ],
                        )),
                        None => OperationResult::failure(0x01, format!("object {uid} not found")),
                    }
                }
                Operation::Destroy => {
                    let uid = protocol::unique_identifier(payload).unwrap();
                    match objects.remove(&uid) {
                        Some(_) => uid_payload(uid),
                        None => OperationResult::failure(0x01, format!("object {uid} not found")),
                    }
                }
            }
        }

        pub(crate) fn contains(&self, uid: &str) -> bool {
            self.objects.lock().unwrap().contains_key(uid)
        }
    }

    #[async_trait]
    impl KmipClient for FakeDevice {
        async fn call(&self, operation: Operation, payload: Ttlv) -> Result<OperationResult> {
            self.operations.lock().unwrap().push(operation);

            let request = protocol::request_message(operation, payload, None).encode();
            let (request, _) = Ttlv::decode(&request).unwrap();
            let item = request.child(tag::BATCH_ITEM).unwrap();
            let code = item.child(tag::OPERATION).unwrap().as_enum().unwrap();
            let decoded_op = Operation::from_code(code).unwrap();
            let result = self.handle(decoded_op, item.child(tag::REQUEST_PAYLOAD).unwrap());

            let response = protocol::response_message(decoded_op, &result).encode();
            Ok(protocol::parse_response(&Ttlv::decode(&response).unwrap().0).unwrap())
        }
    }

    fn store() -> (Arc<FakeDevice>, KmipSecretStore) {
        let device = Arc::new(FakeDevice::default());
        (device.clone(), KmipSecretStore::with_client(device))
    }

    fn ctx() -> StoreContext {
        StoreContext::new("project-1")
    }

    #[test]
    fn support_table() {
        let (_, store) = store();
        let supports = |alg: &str, bits: u32| {
            store.generate_supports(&KeySpec::new(Some(alg), Some(bits), None))
        };
        assert!(supports("aes", 128));
        assert!(supports("AES", 256));
        assert!(!supports("aes", 64));
        assert!(supports("des", 56));
        assert!(supports("desede", 168));
        assert!(supports("dsa", 2048));
        assert!(supports("rsa", 4096));
        assert!(!supports("rsa", 512));
        assert!(!supports("hmacsha256", 256));
        assert!(!store.generate_supports(&KeySpec::new(Some("aes"), None, None)));
        assert!(store.store_secret_supports(&KeySpec::new(Some("aes"), Some(192), None)));
    }

    #[tokio::test]
    async fn store_get_delete_symmetric() {
        let (device, store) = store();
        let key = [0x11u8; 32];
        let dto = SecretDto::new(
            SecretType::Symmetric,
            BASE64.encode(key),
            KeySpec::new(Some("aes"), Some(256), Some("cbc")),
        );

        let metadata = store.store_secret(&dto, &ctx()).await.unwrap();
        let uuid = metadata.get(KEY_UUID).cloned().unwrap();
        assert!(device.contains(&uuid));

        let fetched = store.get_secret(SecretType::Symmetric, &metadata, &ctx()).await.unwrap();
        assert_eq!(BASE64.decode(&fetched.secret).unwrap(), key);
        assert_eq!(fetched.key_spec.alg.as_deref(), Some("aes"));
        assert_eq!(fetched.key_spec.bit_length, Some(256));

        store.delete_secret(&metadata).await.unwrap();
        assert!(!device.contains(&uuid));
        assert_eq!(
            *device.operations.lock().unwrap(),
            vec![Operation::Register, Operation::Get, Operation::Destroy]
        );
    }

    #[tokio::test]
    async fn public_keys_round_trip_through_der() {
        let (_, store) = store();
        let der = [0x30u8, 0x05, 0x02, 0x01, 0x01, 0x02, 0x00];
        let pem = translations::convert_der_to_pem(&der, SecretType::Public).unwrap();
        let spec = KeySpec::new(Some("rsa"), Some(2048), None);
        let dto = SecretDto::new(SecretType::Public, BASE64.encode(&pem), spec);

        let metadata = store.store_secret(&dto, &ctx()).await.unwrap();
        let fetched = store.get_secret(SecretType::Public, &metadata, &ctx()).await.unwrap();
        assert_eq!(BASE64.decode(&fetched.secret).unwrap(), pem);
    }

    #[tokio::test]
    async fn unsupported_secrets_are_rejected() {
        let (_, store) = store();
        let aes = KeySpec::new(Some("aes"), Some(128), None);
        let opaque = SecretDto::new(SecretType::Opaque, BASE64.encode(b"x"), aes);
        let err = store.store_secret(&opaque, &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("not supported"));

        let spec = KeySpec::new(Some("blowfish"), Some(128), None);
        let blowfish = SecretDto::new(SecretType::Symmetric, BASE64.encode(b"x"), spec);
        let err = store.store_secret(&blowfish, &ctx()).await.unwrap_err();
        assert!(matches!(err.as_plugin(), Some(PluginError::AlgorithmNotSupported { .. })));
    }

    #[tokio::test]
    async fn generation() {
        let (device, store) = store();
        let metadata = store
            .generate_symmetric_key(&KeySpec::new(Some("aes"), Some(128), None), &ctx())
            .await
            .unwrap();
        let key = store.get_secret(SecretType::Symmetric, &metadata, &ctx()).await.unwrap();
        assert_eq!(BASE64.decode(&key.secret).unwrap().len(), 16);

        let pair = store
            .generate_asymmetric_key(&KeySpec::new(Some("rsa"), Some(2048), None), &ctx())
            .await
            .unwrap();
        assert!(device.contains(&pair.private_key_meta[KEY_UUID]));
        assert!(device.contains(&pair.public_key_meta[KEY_UUID]));
        assert!(pair.passphrase_meta.is_none());

        let err = store
            .generate_symmetric_key(&KeySpec::new(Some("rsa"), Some(2048), None), &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported algorithm"));

        let with_passphrase =
            KeySpec::new(Some("rsa"), Some(2048), None).with_passphrase(Some("pw".into()));
        assert!(store.generate_asymmetric_key(&with_passphrase, &ctx()).await.is_err());
    }

    #[tokio::test]
    async fn device_failures_carry_reason_and_message() {
        let (_, store) = store();
        let metadata = SecretMetadata::from([(KEY_UUID.to_string(), "999".to_string())]);
        let err = store.get_secret(SecretType::Symmetric, &metadata, &ctx()).await.unwrap_err();
        match err.as_plugin() {
            Some(PluginError::Kmip { status, reason, message }) => {
                assert_eq!(status, "OperationFailed");
                assert_eq!(reason, "ItemNotFound");
                assert!(message.contains("999"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(store.delete_secret(&SecretMetadata::new()).await.is_err());
    }
}
