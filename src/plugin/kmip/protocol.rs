//! KMIP 1.1 messages used by the KMIP secret store.

use super::ttlv::{Ttlv, TtlvError, TtlvResult, Value};
use crate::config::SecretString;

pub mod tag {
    pub const ATTRIBUTE: u32 = 0x420008;
    pub const ATTRIBUTE_NAME: u32 = 0x42000A;
    pub const ATTRIBUTE_VALUE: u32 = 0x42000B;
    pub const AUTHENTICATION: u32 = 0x42000C;
    pub const BATCH_COUNT: u32 = 0x42000D;
    pub const BATCH_ITEM: u32 = 0x42000F;
    pub const COMMON_TEMPLATE_ATTRIBUTE: u32 = 0x42001F;
    pub const CREDENTIAL: u32 = 0x420023;
    pub const CREDENTIAL_TYPE: u32 = 0x420024;
    pub const CREDENTIAL_VALUE: u32 = 0x420025;
    pub const CRYPTOGRAPHIC_ALGORITHM: u32 = 0x420028;
    pub const CRYPTOGRAPHIC_LENGTH: u32 = 0x42002A;
    pub const KEY_BLOCK: u32 = 0x420040;
    pub const KEY_FORMAT_TYPE: u32 = 0x420042;
    pub const KEY_MATERIAL: u32 = 0x420043;
    pub const KEY_VALUE: u32 = 0x420045;
    pub const OBJECT_TYPE: u32 = 0x420057;
    pub const OPERATION: u32 = 0x42005C;
    pub const PRIVATE_KEY: u32 = 0x420064;
    pub const PRIVATE_KEY_UNIQUE_IDENTIFIER: u32 = 0x420066;
    pub const PROTOCOL_VERSION: u32 = 0x420069;
    pub const PROTOCOL_VERSION_MAJOR: u32 = 0x42006A;
    pub const PROTOCOL_VERSION_MINOR: u32 = 0x42006B;
    pub const PUBLIC_KEY: u32 = 0x42006D;
    pub const PUBLIC_KEY_UNIQUE_IDENTIFIER: u32 = 0x42006F;
    pub const REQUEST_HEADER: u32 = 0x420077;
    pub const REQUEST_MESSAGE: u32 = 0x420078;
    pub const REQUEST_PAYLOAD: u32 = 0x420079;
    pub const RESPONSE_HEADER: u32 = 0x42007A;
    pub const RESPONSE_MESSAGE: u32 = 0x42007B;
    pub const RESPONSE_PAYLOAD: u32 = 0x42007C;
    pub const RESULT_MESSAGE: u32 = 0x42007D;
    pub const RESULT_REASON: u32 = 0x42007E;
    pub const RESULT_STATUS: u32 = 0x42007F;
    pub const SYMMETRIC_KEY: u32 = 0x42008F;
    pub const TEMPLATE_ATTRIBUTE: u32 = 0x420091;
    pub const UNIQUE_IDENTIFIER: u32 = 0x420094;
    pub const USERNAME: u32 = 0x420099;
    pub const PASSWORD: u32 = 0x4200A1;
}

pub const ATTR_CRYPTOGRAPHIC_ALGORITHM: &str = "Cryptographic Algorithm";
pub const ATTR_CRYPTOGRAPHIC_LENGTH: &str = "Cryptographic Length";
pub const ATTR_CRYPTOGRAPHIC_USAGE_MASK: &str = "Cryptographic Usage Mask";

const USAGE_ENCRYPT: i32 = 0x04;
const USAGE_DECRYPT: i32 = 0x08;
const CREDENTIAL_USERNAME_AND_PASSWORD: u32 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create = 0x01,
    CreateKeyPair = 0x02,
    Register = 0x03,
    Get = 0x0A,
    Destroy = 0x14,
}

impl Operation {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0x01 => Self::Create,
            0x02 => Self::CreateKeyPair,
            0x03 => Self::Register,
            0x0A => Self::Get,
            0x14 => Self::Destroy,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::CreateKeyPair => "create_key_pair",
            Self::Register => "register",
            Self::Get => "get",
            Self::Destroy => "destroy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    SymmetricKey = 0x02,
    PublicKey = 0x03,
    PrivateKey = 0x04,
}

impl ObjectType {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0x02 => Self::SymmetricKey,
            0x03 => Self::PublicKey,
            0x04 => Self::PrivateKey,
            _ => return None,
        })
    }

    /// Tag of the managed object structure carrying this type
    pub fn object_tag(&self) -> u32 {
        match self {
            Self::SymmetricKey => tag::SYMMETRIC_KEY,
            Self::PublicKey => tag::PUBLIC_KEY,
            Self::PrivateKey => tag::PRIVATE_KEY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormatType {
    Raw = 0x01,
    Pkcs8 = 0x04,
    X509 = 0x05,
}

impl KeyFormatType {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0x01 => Self::Raw,
            0x04 => Self::Pkcs8,
            0x05 => Self::X509,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptographicAlgorithm {
    Des = 0x01,
    TripleDes = 0x02,
    Aes = 0x03,
    Rsa = 0x04,
    Dsa = 0x05,
}

impl CryptographicAlgorithm {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0x01 => Self::Des,
            0x02 => Self::TripleDes,
            0x03 => Self::Aes,
            0x04 => Self::Rsa,
            0x05 => Self::Dsa,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Success = 0x00,
    OperationFailed = 0x01,
    OperationPending = 0x02,
    OperationUndone = 0x03,
}

impl ResultStatus {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0x00 => Self::Success,
            0x01 => Self::OperationFailed,
            0x02 => Self::OperationPending,
            0x03 => Self::OperationUndone,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::OperationFailed => "OperationFailed",
            Self::OperationPending => "OperationPending",
            Self::OperationUndone => "OperationUndone",
        }
    }
}

/// Name of a KMIP result reason code
pub fn result_reason_name(code: u32) -> String {
    match code {
        0x01 => "ItemNotFound".into(),
        0x02 => "ResponseTooLarge".into(),
        0x03 => "AuthenticationNotSuccessful".into(),
        0x04 => "InvalidMessage".into(),
        0x05 => "OperationNotSupported".into(),
        0x06 => "MissingData".into(),
        0x07 => "InvalidField".into(),
        0x08 => "FeatureNotSupported".into(),
        0x09 => "OperationCanceledByRequester".into(),
        0x0A => "CryptographicFailure".into(),
        0x0B => "IllegalOperation".into(),
        0x0C => "PermissionDenied".into(),
        0x0D => "ObjectArchived".into(),
        0x0E => "IndexOutOfBounds".into(),
        0x0100 => "GeneralFailure".into(),
        other => format!("0x{other:04x}"),
    }
}

/// Username/password credential sent in the request header
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: SecretString,
}

/// Key block of a managed object
#[derive(Clone, PartialEq, Eq)]
pub struct KeyBlock {
    pub format: KeyFormatType,
    pub material: Vec<u8>,
    pub algorithm: Option<CryptographicAlgorithm>,
    pub length: Option<i32>,
}

impl std::fmt::Debug for KeyBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBlock")
            .field("format", &self.format)
            .field("material", &format_args!("[{} bytes]", self.material.len()))
            .field("algorithm", &self.algorithm)
            .field("length", &self.length)
            .finish()
    }
}

impl KeyBlock {
    pub fn to_ttlv(&self) -> Ttlv {
        let mut items = vec![
            Ttlv::enumeration(tag::KEY_FORMAT_TYPE, self.format as u32),
            Ttlv::structure(
                tag::KEY_VALUE,
                vec![Ttlv::bytes(tag::KEY_MATERIAL, self.material.clone())],
            ),
        ];
        if let Some(algorithm) = self.algorithm {
            items.push(Ttlv::enumeration(tag::CRYPTOGRAPHIC_ALGORITHM, algorithm as u32));
        }
        if let Some(length) = self.length {
            items.push(Ttlv::integer(tag::CRYPTOGRAPHIC_LENGTH, length));
        }
        Ttlv::structure(tag::KEY_BLOCK, items)
    }

    pub fn from_ttlv(block: &Ttlv) -> TtlvResult<Self> {
        block.expect_tag(tag::KEY_BLOCK)?;
        let format_code = block.child(tag::KEY_FORMAT_TYPE)?.as_enum()?;
        let format = KeyFormatType::from_code(format_code).ok_or(TtlvError::UnexpectedType {
            tag: tag::KEY_FORMAT_TYPE,
            expected: "supported key format type",
        })?;
        let key_value = block.child(tag::KEY_VALUE)?;
        // Key Value is either a structure around Key Material or the raw material.
        let material = match &key_value.value {
            Value::Structure(_) => key_value.child(tag::KEY_MATERIAL)?.as_bytes()?.to_vec(),
            _ => key_value.as_bytes()?.to_vec(),
        };
        let algorithm = block
            .find(tag::CRYPTOGRAPHIC_ALGORITHM)
            .map(Ttlv::as_enum)
            .transpose()?
            .and_then(CryptographicAlgorithm::from_code);
        let length = block.find(tag::CRYPTOGRAPHIC_LENGTH).map(Ttlv::as_int).transpose()?;
        Ok(Self { format, material, algorithm, length })
    }
}

fn attribute(name: &str, value: Ttlv) -> Ttlv {
    Ttlv::structure(tag::ATTRIBUTE, vec![Ttlv::text(tag::ATTRIBUTE_NAME, name), value])
}

/// Attributes describing a key to create or register
pub fn key_attributes(algorithm: Option<CryptographicAlgorithm>, length: Option<i32>) -> Vec<Ttlv> {
    let mut attributes = Vec::with_capacity(3);
    if let Some(algorithm) = algorithm {
        attributes.push(attribute(
            ATTR_CRYPTOGRAPHIC_ALGORITHM,
            Ttlv::enumeration(tag::ATTRIBUTE_VALUE, algorithm as u32),
        ));
    }
    attributes.push(attribute(
        ATTR_CRYPTOGRAPHIC_USAGE_MASK,
        Ttlv::integer(tag::ATTRIBUTE_VALUE, USAGE_ENCRYPT | USAGE_DECRYPT),
    ));
    if let Some(length) = length {
        attributes.push(attribute(
            ATTR_CRYPTOGRAPHIC_LENGTH,
            Ttlv::integer(tag::ATTRIBUTE_VALUE, length),
        ));
    }
    attributes
}

/// Look up a named attribute inside a (Common) Template Attribute structure
pub fn template_attribute<'a>(template: &'a Ttlv, name: &str) -> Option<&'a Ttlv> {
    template.items().ok()?.iter().find_map(|item| {
        let matches = item.find(tag::ATTRIBUTE_NAME)?.as_text().ok()? == name;
        matches.then(|| item.find(tag::ATTRIBUTE_VALUE)).flatten()
    })
}

pub fn create_payload(object_type: ObjectType, attributes: Vec<Ttlv>) -> Ttlv {
    Ttlv::structure(
        tag::REQUEST_PAYLOAD,
        vec![
            Ttlv::enumeration(tag::OBJECT_TYPE, object_type as u32),
            Ttlv::structure(tag::TEMPLATE_ATTRIBUTE, attributes),
        ],
    )
}

pub fn create_key_pair_payload(attributes: Vec<Ttlv>) -> Ttlv {
    Ttlv::structure(
        tag::REQUEST_PAYLOAD,
        vec![Ttlv::structure(tag::COMMON_TEMPLATE_ATTRIBUTE, attributes)],
    )
}

pub fn register_payload(object_type: ObjectType, attributes: Vec<Ttlv>, block: &KeyBlock) -> Ttlv {
    Ttlv::structure(
        tag::REQUEST_PAYLOAD,
        vec![
            Ttlv::enumeration(tag::OBJECT_TYPE, object_type as u32),
            Ttlv::structure(tag::TEMPLATE_ATTRIBUTE, attributes),
            Ttlv::structure(object_type.object_tag(), vec![block.to_ttlv()]),
        ],
    )
}

pub fn get_payload(uid: &str, format: Option<KeyFormatType>) -> Ttlv {
    let mut items = vec![Ttlv::text(tag::UNIQUE_IDENTIFIER, uid)];
    if let Some(format) = format {
        items.push(Ttlv::enumeration(tag::KEY_FORMAT_TYPE, format as u32));
    }
    Ttlv::structure(tag::REQUEST_PAYLOAD, items)
}

pub fn destroy_payload(uid: &str) -> Ttlv {
    Ttlv::structure(tag::REQUEST_PAYLOAD, vec![Ttlv::text(tag::UNIQUE_IDENTIFIER, uid)])
}

/// Wrap one operation in a single-item KMIP 1.1 request message
pub fn request_message(
    operation: Operation,
    payload: Ttlv,
    credential: Option<&Credential>,
) -> Ttlv {
    let mut header = vec![Ttlv::structure(
        tag::PROTOCOL_VERSION,
        vec![
            Ttlv::integer(tag::PROTOCOL_VERSION_MAJOR, 1),
            Ttlv::integer(tag::PROTOCOL_VERSION_MINOR, 1),
        ],
    )];
    if let Some(credential) = credential {
        header.push(Ttlv::structure(
            tag::AUTHENTICATION,
            vec![Ttlv::structure(
                tag::CREDENTIAL,
                vec![
                    Ttlv::enumeration(tag::CREDENTIAL_TYPE, CREDENTIAL_USERNAME_AND_PASSWORD),
                    Ttlv::structure(
                        tag::CREDENTIAL_VALUE,
                        vec![
                            Ttlv::text(tag::USERNAME, credential.username.clone()),
                            Ttlv::text(tag::PASSWORD, credential.password.expose_secret()),
                        ],
                    ),
                ],
            )],
        ));
    }
    header.push(Ttlv::integer(tag::BATCH_COUNT, 1));

    Ttlv::structure(
        tag::REQUEST_MESSAGE,
        vec![
            Ttlv::structure(tag::REQUEST_HEADER, header),
            Ttlv::structure(
                tag::BATCH_ITEM,
                vec![Ttlv::enumeration(tag::OPERATION, operation as u32), payload],
            ),
        ],
    )
}

/// Outcome of one batch item
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub status: ResultStatus,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub payload: Option<Ttlv>,
}

impl OperationResult {
    pub fn success(payload: Ttlv) -> Self {
        Self { status: ResultStatus::Success, reason: None, message: None, payload: Some(payload) }
    }

    pub fn failure(reason: u32, message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::OperationFailed,
            reason: Some(result_reason_name(reason)),
            message: Some(message.into()),
            payload: None,
        }
    }
}

/// Extract the first batch item of a response message
pub fn parse_response(message: &Ttlv) -> TtlvResult<OperationResult> {
    message.expect_tag(tag::RESPONSE_MESSAGE)?;
    let item = message.child(tag::BATCH_ITEM)?;
    let status_code = item.child(tag::RESULT_STATUS)?.as_enum()?;
    let status = ResultStatus::from_code(status_code).ok_or(TtlvError::UnexpectedType {
        tag: tag::RESULT_STATUS,
        expected: "known result status",
    })?;
    let reason = item
        .find(tag::RESULT_REASON)
        .map(Ttlv::as_enum)
        .transpose()?
        .map(result_reason_name);
    let message = item
        .find(tag::RESULT_MESSAGE)
        .map(|m| m.as_text().map(str::to_string))
        .transpose()?;
    let payload = item.find(tag::RESPONSE_PAYLOAD).cloned();
    Ok(OperationResult { status, reason, message, payload })
}

/// Build a response message; used by the device side of tests
pub fn response_message(operation: Operation, result: &OperationResult) -> Ttlv {
    let mut item = vec![
        Ttlv::enumeration(tag::OPERATION, operation as u32),
        Ttlv::enumeration(tag::RESULT_STATUS, result.status as u32),
    ];
    if let Some(reason) = &result.reason {
        let code = (0x01..=0x0E).chain([0x0100]).find(|c| &result_reason_name(*c) == reason);
        item.push(Ttlv::enumeration(tag::RESULT_REASON, code.unwrap_or(0x0100)));
    }
    if let Some(message) = &result.message {
        item.push(Ttlv::text(tag::RESULT_MESSAGE, message.clone()));
    }
    if let Some(payload) = &result.payload {
        let items = payload.items().map(<[Ttlv]>::to_vec).unwrap_or_default();
        item.push(Ttlv::structure(tag::RESPONSE_PAYLOAD, items));
    }
    Ttlv::structure(
        tag::RESPONSE_MESSAGE,
        vec![
            Ttlv::structure(
                tag::RESPONSE_HEADER,
                vec![
                    Ttlv::structure(
                        tag::PROTOCOL_VERSION,
                        vec![
                            Ttlv::integer(tag::PROTOCOL_VERSION_MAJOR, 1),
                            Ttlv::integer(tag::PROTOCOL_VERSION_MINOR, 1),
                        ],
                    ),
                    Ttlv::integer(tag::BATCH_COUNT, 1),
                ],
            ),
            Ttlv::structure(tag::BATCH_ITEM, item),
        ],
    )
}

pub fn unique_identifier(payload: &Ttlv) -> TtlvResult<String> {
    Ok(payload.child(tag::UNIQUE_IDENTIFIER)?.as_text()?.to_string())
}

/// Private and public key ids from a CreateKeyPair response
pub fn key_pair_identifiers(payload: &Ttlv) -> TtlvResult<(String, String)> {
    Ok((
        payload.child(tag::PRIVATE_KEY_UNIQUE_IDENTIFIER)?.as_text()?.to_string(),
        payload.child(tag::PUBLIC_KEY_UNIQUE_IDENTIFIER)?.as_text()?.to_string(),
    ))
}

/// Object type and key block from a Get response or Register request
pub fn managed_object(payload: &Ttlv) -> TtlvResult<(ObjectType, KeyBlock)> {
    let code = payload.child(tag::OBJECT_TYPE)?.as_enum()?;
    let object_type = ObjectType::from_code(code).ok_or(TtlvError::UnexpectedType {
        tag: tag::OBJECT_TYPE,
        expected: "key object type",
    })?;
    let object = payload.child(object_type.object_tag())?;
    Ok((object_type, KeyBlock::from_ttlv(object.child(tag::KEY_BLOCK)?)?))
}
