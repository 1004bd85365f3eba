//! KMIP Tag-Type-Length-Value encoding.
//!
//! Every item is a 3-byte tag, a 1-byte type, a 4-byte big-endian length
//! and the value, padded with zeros to a multiple of 8 bytes. Structures
//! contain a sequence of items.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TtlvError {
    #[error("TTLV buffer truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown TTLV item type 0x{0:02x}")]
    UnknownType(u8),

    #[error("Invalid length {length} for TTLV {item_type}")]
    InvalidLength { item_type: &'static str, length: usize },

    #[error("TTLV text string is not valid UTF-8")]
    InvalidUtf8,

    #[error("Expected TTLV item {expected:#08x}, found {found:#08x}")]
    UnexpectedTag { expected: u32, found: u32 },

    #[error("Missing TTLV item {0:#08x}")]
    Missing(u32),

    #[error("TTLV item {tag:#08x} is not a {expected}")]
    UnexpectedType { tag: u32, expected: &'static str },
}

pub type TtlvResult<T> = std::result::Result<T, TtlvError>;

const HEADER_LEN: usize = 8;

/// Typed value of a TTLV item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Structure(Vec<Ttlv>),
    Integer(i32),
    LongInteger(i64),
    BigInteger(Vec<u8>),
    Enumeration(u32),
    Boolean(bool),
    TextString(String),
    ByteString(Vec<u8>),
    DateTime(i64),
    Interval(u32),
}

impl Value {
    fn type_code(&self) -> u8 {
        match self {
            Value::Structure(_) => 0x01,
            Value::Integer(_) => 0x02,
            Value::LongInteger(_) => 0x03,
            Value::BigInteger(_) => 0x04,
            Value::Enumeration(_) => 0x05,
            Value::Boolean(_) => 0x06,
            Value::TextString(_) => 0x07,
            Value::ByteString(_) => 0x08,
            Value::DateTime(_) => 0x09,
            Value::Interval(_) => 0x0A,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Structure(_) => "structure",
            Value::Integer(_) => "integer",
            Value::LongInteger(_) => "long integer",
            Value::BigInteger(_) => "big integer",
            Value::Enumeration(_) => "enumeration",
            Value::Boolean(_) => "boolean",
            Value::TextString(_) => "text string",
            Value::ByteString(_) => "byte string",
            Value::DateTime(_) => "date-time",
            Value::Interval(_) => "interval",
        }
    }
}

/// One tagged TTLV item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ttlv {
    pub tag: u32,
    pub value: Value,
}

fn padded(len: usize) -> usize {
    len.div_ceil(8) * 8
}

impl Ttlv {
    pub fn new(tag: u32, value: Value) -> Self {
        Self { tag, value }
    }

    pub fn structure(tag: u32, items: Vec<Ttlv>) -> Self {
        Self::new(tag, Value::Structure(items))
    }

    pub fn integer(tag: u32, value: i32) -> Self {
        Self::new(tag, Value::Integer(value))
    }

    pub fn enumeration(tag: u32, value: u32) -> Self {
        Self::new(tag, Value::Enumeration(value))
    }

    pub fn text(tag: u32, value: impl Into<String>) -> Self {
        Self::new(tag, Value::TextString(value.into()))
    }

    pub fn bytes(tag: u32, value: impl Into<Vec<u8>>) -> Self {
        Self::new(tag, Value::ByteString(value.into()))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.tag.to_be_bytes()[1..]);
        out.push(self.value.type_code());

        let length_at = out.len();
        out.extend_from_slice(&[0; 4]);
        let body_at = out.len();

        match &self.value {
            Value::Structure(items) => items.iter().for_each(|item| item.encode_into(out)),
            Value::Integer(v) => out.extend_from_slice(&v.to_be_bytes()),
            Value::Enumeration(v) | Value::Interval(v) => out.extend_from_slice(&v.to_be_bytes()),
            Value::LongInteger(v) | Value::DateTime(v) => out.extend_from_slice(&v.to_be_bytes()),
            Value::Boolean(v) => out.extend_from_slice(&u64::from(*v).to_be_bytes()),
            Value::TextString(s) => out.extend_from_slice(s.as_bytes()),
            Value::ByteString(b) | Value::BigInteger(b) => out.extend_from_slice(b),
        }

        let length = out.len() - body_at;
        out[length_at..body_at].copy_from_slice(&(length as u32).to_be_bytes());
        out.resize(body_at + padded(length), 0);
    }

    /// Decode one item from the front of `buf`, returning it and the bytes consumed.
    pub fn decode(buf: &[u8]) -> TtlvResult<(Ttlv, usize)> {
        let header = take(buf, 0, HEADER_LEN)?;
        let tag = u32::from_be_bytes([0, header[0], header[1], header[2]]);
        let type_code = header[3];
        let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let value_len = if type_code == 0x01 { length } else { padded(length) };
        let body = take(buf, HEADER_LEN, value_len)?;
        let fixed = |item_type: &'static str, expected: usize| {
            if length == expected {
                Ok(&body[..expected])
            } else {
                Err(TtlvError::InvalidLength { item_type, length })
            }
        };

        let value = match type_code {
            0x01 => {
                let mut items = Vec::new();
                let mut offset = 0;
                while offset < body.len() {
                    let (item, used) = Ttlv::decode(&body[offset..])?;
                    items.push(item);
                    offset += used;
                }
                Value::Structure(items)
            }
            0x02 => Value::Integer(i32::from_be_bytes(to_array(fixed("integer", 4)?))),
            0x03 => Value::LongInteger(i64::from_be_bytes(to_array(fixed("long integer", 8)?))),
            0x04 => Value::BigInteger(body[..length].to_vec()),
            0x05 => Value::Enumeration(u32::from_be_bytes(to_array(fixed("enumeration", 4)?))),
            0x06 => Value::Boolean(u64::from_be_bytes(to_array(fixed("boolean", 8)?)) != 0),
            0x07 => Value::TextString(
                String::from_utf8(body[..length].to_vec()).map_err(|_| TtlvError::InvalidUtf8)?,
            ),
            0x08 => Value::ByteString(body[..length].to_vec()),
            0x09 => Value::DateTime(i64::from_be_bytes(to_array(fixed("date-time", 8)?))),
            0x0A => Value::Interval(u32::from_be_bytes(to_array(fixed("interval", 4)?))),
            other => return Err(TtlvError::UnknownType(other)),
        };

        Ok((Ttlv { tag, value }, HEADER_LEN + value_len))
    }

    /// Total encoded length announced by an 8-byte item header.
    pub fn frame_len(header: &[u8; HEADER_LEN]) -> usize {
        let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        HEADER_LEN + if header[3] == 0x01 { length } else { padded(length) }
    }

    pub fn expect_tag(&self, tag: u32) -> TtlvResult<&Ttlv> {
        if self.tag == tag {
            Ok(self)
        } else {
            Err(TtlvError::UnexpectedTag { expected: tag, found: self.tag })
        }
    }

    pub fn items(&self) -> TtlvResult<&[Ttlv]> {
        match &self.value {
            Value::Structure(items) => Ok(items),
            _ => Err(self.wrong_type("structure")),
        }
    }

    pub fn find(&self, tag: u32) -> Option<&Ttlv> {
        self.items().ok()?.iter().find(|item| item.tag == tag)
    }

    pub fn child(&self, tag: u32) -> TtlvResult<&Ttlv> {
        self.find(tag).ok_or(TtlvError::Missing(tag))
    }

    pub fn as_text(&self) -> TtlvResult<&str> {
        match &self.value {
            Value::TextString(s) => Ok(s),
            _ => Err(self.wrong_type("text string")),
        }
    }

    pub fn as_bytes(&self) -> TtlvResult<&[u8]> {
        match &self.value {
            Value::ByteString(b) => Ok(b),
            _ => Err(self.wrong_type("byte string")),
        }
    }

    pub fn as_enum(&self) -> TtlvResult<u32> {
        match self.value {
            Value::Enumeration(v) => Ok(v),
            _ => Err(self.wrong_type("enumeration")),
        }
    }

    pub fn as_int(&self) -> TtlvResult<i32> {
        match self.value {
            Value::Integer(v) => Ok(v),
            _ => Err(self.wrong_type("integer")),
        }
    }

    fn wrong_type(&self, expected: &'static str) -> TtlvError {
        tracing::trace!(
            tag = self.tag,
            found = self.value.type_name(),
            expected,
            "TTLV type mismatch"
        );
        TtlvError::UnexpectedType { tag: self.tag, expected }
    }
}

fn take(buf: &[u8], offset: usize, len: usize) -> TtlvResult<&[u8]> {
    let end = offset + len;
    buf.get(offset..end).ok_or(TtlvError::Truncated { needed: end, available: buf.len() })
}

fn to_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        hex::decode(s.replace(' ', "")).unwrap()
    }

    // Encoding examples from the KMIP 1.1 standard, section 9.1.2
    #[test]
    fn integer_vector() {
        let item = Ttlv::integer(0x420020, 8);
        assert_eq!(item.encode(), hex("420020 02 00000004 00000008 00000000"));
    }

    #[test]
    fn enumeration_and_boolean_vectors() {
        assert_eq!(
            Ttlv::enumeration(0x420020, 255).encode(),
            hex("420020 05 00000004 000000FF 00000000")
        );
        assert_eq!(
            Ttlv::new(0x420020, Value::Boolean(true)).encode(),
            hex("420020 06 00000008 0000000000000001")
        );
    }

    #[test]
    fn text_string_is_padded() {
        assert_eq!(
            Ttlv::text(0x420020, "Hello World").encode(),
            hex("420020 07 0000000B 48656C6C6F20576F726C64 0000000000")
        );
        assert_eq!(
            Ttlv::bytes(0x420020, vec![1, 2, 3]).encode(),
            hex("420020 08 00000003 010203 0000000000")
        );
    }

    #[test]
    fn structure_vector_decodes() {
        let wire = hex(
            "420020 01 00000020 \
             420004 05 00000004 000000FE 00000000 \
             420005 02 00000004 000000FF 00000000",
        );
        let (item, used) = Ttlv::decode(&wire).unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(
            item,
            Ttlv::structure(
                0x420020,
                vec![Ttlv::enumeration(0x420004, 254), Ttlv::integer(0x420005, 255)]
            )
        );
        assert_eq!(item.encode(), wire);
        assert_eq!(item.child(0x420005).unwrap().as_int().unwrap(), 255);
        assert_eq!(item.child(0x420009), Err(TtlvError::Missing(0x420009)));
    }

    #[test]
    fn nested_structures_survive_decoding() {
        let item = Ttlv::structure(
            0x420078,
            vec![
                Ttlv::text(0x420094, "a0b1"),
                Ttlv::structure(0x420040, vec![Ttlv::bytes(0x420043, vec![9; 17])]),
                Ttlv::new(0x420092, Value::DateTime(1_700_000_000)),
            ],
        );
        let wire = item.encode();
        let header: [u8; 8] = wire[..8].try_into().unwrap();
        assert_eq!(Ttlv::frame_len(&header), wire.len());
        assert_eq!(Ttlv::decode(&wire).unwrap().0, item);
    }

    #[test]
    fn malformed_input() {
        assert!(matches!(Ttlv::decode(&[0x42, 0x00]), Err(TtlvError::Truncated { .. })));
        assert_eq!(
            Ttlv::decode(&hex("420020 0F 00000000")).unwrap_err(),
            TtlvError::UnknownType(0x0F)
        );
        assert!(matches!(
            Ttlv::decode(&hex("420020 02 00000008 0000000000000000")),
            Err(TtlvError::InvalidLength { .. })
        ));
        assert!(matches!(
            Ttlv::decode(&hex("420020 07 00000010 4142")),
            Err(TtlvError::Truncated { .. })
        ));
    }
}
