//! Record message layout: the 22-byte message header, key fields, and bins.
//!
//! A `Message` frame carries one or more concatenated record messages. Each
//! starts with a fixed 22-byte header followed by `n_fields` key fields and
//! `n_ops` bin operations. Scan responses stream these until a message with
//! the LAST flag (or a NOT_FOUND result code) closes the stream.

use bytes::{Buf, BufMut};

use crate::digest::{Digest, DIGEST_LEN};
use crate::WireError;

/// Size of the fixed message header in bytes.
pub const MSG_HEADER_SIZE: usize = 22;

// info1 flags
pub const INFO1_READ: u8 = 0x01;
pub const INFO1_GET_ALL: u8 = 0x02;
pub const INFO1_NOBINDATA: u8 = 0x20;

// info2 flags
pub const INFO2_WRITE: u8 = 0x01;

// info3 flags
/// Marks the final message of a streamed response.
pub const INFO3_LAST: u8 = 0x01;

// ---------------------------------------------------------------------------
// Result codes
// ---------------------------------------------------------------------------

/// Server result codes observed by the routing and scan subsystems.
pub mod result_code {
    pub const OK: u8 = 0;
    pub const SERVER_ERROR: u8 = 1;
    /// Also used by scans to mean "no more records from this node".
    pub const NOT_FOUND: u8 = 2;
}

// ---------------------------------------------------------------------------
// Field and particle tags
// ---------------------------------------------------------------------------

/// Key-field type tags.
pub mod field_type {
    pub const NAMESPACE: u8 = 0;
    pub const SETNAME: u8 = 1;
    pub const KEY: u8 = 2;
    pub const DIGEST: u8 = 4;
    pub const TASK_ID: u8 = 7;
    pub const SCAN_OPTIONS: u8 = 8;
    pub const UDF_PACKAGE_NAME: u8 = 30;
    pub const UDF_FUNCTION: u8 = 31;
    pub const UDF_ARGLIST: u8 = 32;
    pub const UDF_OP: u8 = 33;
}

/// Bin particle type tags.
pub mod particle_type {
    pub const NULL: u8 = 0;
    pub const INTEGER: u8 = 1;
    pub const STRING: u8 = 3;
    pub const BLOB: u8 = 4;
}

/// Operation type tags carried in bin operations.
pub mod op_type {
    pub const READ: u8 = 1;
}

// ---------------------------------------------------------------------------
// MsgHeader
// ---------------------------------------------------------------------------

/// The fixed 22-byte message header.
///
/// Wire layout: `header_sz(1) info1(1) info2(1) info3(1) unused(1)
/// result_code(1) generation(4) ttl(4) transaction_ttl(4) n_fields(2)
/// n_ops(2)`, all integers big-endian.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgHeader {
    pub info1: u8,
    pub info2: u8,
    pub info3: u8,
    pub result_code: u8,
    pub generation: u32,
    pub ttl: u32,
    pub transaction_ttl: u32,
    pub n_fields: u16,
    pub n_ops: u16,
}

impl MsgHeader {
    /// Returns `true` if this message closes a streamed response.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.info3 & INFO3_LAST != 0
    }

    /// Appends the 22-byte wire form to `buf`.
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u8(MSG_HEADER_SIZE as u8);
        buf.put_u8(self.info1);
        buf.put_u8(self.info2);
        buf.put_u8(self.info3);
        buf.put_u8(0);
        buf.put_u8(self.result_code);
        buf.put_u32(self.generation);
        buf.put_u32(self.ttl);
        buf.put_u32(self.transaction_ttl);
        buf.put_u16(self.n_fields);
        buf.put_u16(self.n_ops);
    }

    /// Decodes a header from the front of `buf`, consuming 22 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] if fewer than 22 bytes remain, or
    /// [`WireError::BadHeaderSize`] if the declared header size disagrees.
    pub fn decode_from(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < MSG_HEADER_SIZE {
            return Err(WireError::Truncated("message header"));
        }
        let header_sz = buf.get_u8();
        if usize::from(header_sz) != MSG_HEADER_SIZE {
            return Err(WireError::BadHeaderSize(header_sz));
        }
        let info1 = buf.get_u8();
        let info2 = buf.get_u8();
        let info3 = buf.get_u8();
        let _unused = buf.get_u8();
        let result_code = buf.get_u8();
        Ok(Self {
            info1,
            info2,
            info3,
            result_code,
            generation: buf.get_u32(),
            ttl: buf.get_u32(),
            transaction_ttl: buf.get_u32(),
            n_fields: buf.get_u16(),
            n_ops: buf.get_u16(),
        })
    }
}

// ---------------------------------------------------------------------------
// Record values
// ---------------------------------------------------------------------------

/// A decoded bin value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Int(i64),
    Str(String),
    Blob(Vec<u8>),
}

/// A named bin within a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bin {
    pub name: String,
    pub value: Value,
}

/// The key fields a server attaches to a streamed record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordKey {
    pub namespace: Option<String>,
    pub set: Option<String>,
    pub digest: Option<Digest>,
    pub user_key: Option<Value>,
}

/// One record decoded from a scan response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub key: RecordKey,
    pub generation: u32,
    pub ttl: u32,
    pub bins: Vec<Bin>,
}

// ---------------------------------------------------------------------------
// Record parsing
// ---------------------------------------------------------------------------

fn take_bytes(buf: &mut impl Buf, len: usize, what: &'static str) -> Result<Vec<u8>, WireError> {
    if buf.remaining() < len {
        return Err(WireError::Truncated(what));
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn take_string(buf: &mut impl Buf, len: usize, what: &'static str) -> Result<String, WireError> {
    let bytes = take_bytes(buf, len, what)?;
    String::from_utf8(bytes).map_err(|_| WireError::BadUtf8(what))
}

fn decode_particle(
    particle: u8,
    buf: &mut impl Buf,
    len: usize,
) -> Result<Value, WireError> {
    match particle {
        particle_type::NULL => {
            let _ = take_bytes(buf, len, "null particle")?;
            Ok(Value::Null)
        }
        particle_type::INTEGER => {
            if len != 8 {
                return Err(WireError::BadParticle(particle));
            }
            if buf.remaining() < 8 {
                return Err(WireError::Truncated("integer particle"));
            }
            Ok(Value::Int(buf.get_i64()))
        }
        particle_type::STRING => Ok(Value::Str(take_string(buf, len, "string particle")?)),
        particle_type::BLOB => Ok(Value::Blob(take_bytes(buf, len, "blob particle")?)),
        other => Err(WireError::BadParticle(other)),
    }
}

/// Parses the key fields of a record (`n_fields` entries).
///
/// Each field is `size(u32) type(u8) payload(size-1)`. Unknown field types
/// are skipped, per the protocol's forward-compatibility rule.
///
/// # Errors
///
/// Returns [`WireError`] on truncated or malformed input.
pub fn parse_key_fields(buf: &mut impl Buf, n_fields: u16) -> Result<RecordKey, WireError> {
    let mut key = RecordKey::default();
    for _ in 0..n_fields {
        if buf.remaining() < 5 {
            return Err(WireError::Truncated("key field header"));
        }
        let size = buf.get_u32() as usize;
        if size == 0 {
            return Err(WireError::Truncated("key field size"));
        }
        let ftype = buf.get_u8();
        let payload_len = size - 1;
        match ftype {
            field_type::NAMESPACE => {
                key.namespace = Some(take_string(buf, payload_len, "namespace field")?);
            }
            field_type::SETNAME => {
                key.set = Some(take_string(buf, payload_len, "set field")?);
            }
            field_type::DIGEST => {
                let bytes = take_bytes(buf, payload_len, "digest field")?;
                let digest: [u8; DIGEST_LEN] = bytes
                    .try_into()
                    .map_err(|_| WireError::Truncated("digest field"))?;
                key.digest = Some(Digest::new(digest));
            }
            field_type::KEY => {
                if payload_len == 0 {
                    return Err(WireError::Truncated("user key field"));
                }
                let particle = buf.get_u8();
                key.user_key = Some(decode_particle(particle, buf, payload_len - 1)?);
            }
            _ => {
                let _ = take_bytes(buf, payload_len, "unknown key field")?;
            }
        }
    }
    Ok(key)
}

/// Parses the bin operations of a record (`n_ops` entries).
///
/// Each operation is `size(u32) op(u8) particle(u8) version(u8)
/// name_len(u8) name value`.
///
/// # Errors
///
/// Returns [`WireError`] on truncated or malformed input.
pub fn parse_bins(buf: &mut impl Buf, n_ops: u16) -> Result<Vec<Bin>, WireError> {
    let mut bins = Vec::with_capacity(usize::from(n_ops));
    for _ in 0..n_ops {
        if buf.remaining() < 8 {
            return Err(WireError::Truncated("bin op header"));
        }
        let size = buf.get_u32() as usize;
        let _op = buf.get_u8();
        let particle = buf.get_u8();
        let _version = buf.get_u8();
        let name_len = usize::from(buf.get_u8());
        if size < 4 + name_len {
            return Err(WireError::Truncated("bin op size"));
        }
        let name = take_string(buf, name_len, "bin name")?;
        let value_len = size - 4 - name_len;
        let value = decode_particle(particle, buf, value_len)?;
        bins.push(Bin { name, value });
    }
    Ok(bins)
}

/// Parses the body of a record message (fields then bins) into a [`Record`].
///
/// # Errors
///
/// Returns [`WireError`] on truncated or malformed input.
pub fn parse_record(buf: &mut impl Buf, header: &MsgHeader) -> Result<Record, WireError> {
    let key = parse_key_fields(buf, header.n_fields)?;
    let bins = parse_bins(buf, header.n_ops)?;
    Ok(Record {
        key,
        generation: header.generation,
        ttl: header.ttl,
        bins,
    })
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    fn encode_field(buf: &mut BytesMut, ftype: u8, payload: &[u8]) {
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(payload.len() as u32 + 1);
        buf.put_u8(ftype);
        buf.put_slice(payload);
    }

    fn encode_bin(buf: &mut BytesMut, name: &str, particle: u8, value: &[u8]) {
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(4 + name.len() as u32 + value.len() as u32);
        buf.put_u8(op_type::READ);
        buf.put_u8(particle);
        buf.put_u8(0);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u8(name.len() as u8);
        buf.put_slice(name.as_bytes());
        buf.put_slice(value);
    }

    // -- header --

    #[test]
    fn header_round_trip() {
        let header = MsgHeader {
            info1: INFO1_READ,
            info3: INFO3_LAST,
            result_code: result_code::OK,
            generation: 3,
            ttl: 1000,
            transaction_ttl: 5000,
            n_fields: 2,
            n_ops: 1,
            ..MsgHeader::default()
        };
        let mut buf = BytesMut::new();
        header.encode_into(&mut buf);
        assert_eq!(buf.len(), MSG_HEADER_SIZE);

        let decoded = MsgHeader::decode_from(&mut buf).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_last());
    }

    #[test]
    fn header_rejects_wrong_declared_size() {
        let mut buf = BytesMut::new();
        MsgHeader::default().encode_into(&mut buf);
        buf[0] = 30;
        assert!(matches!(
            MsgHeader::decode_from(&mut buf),
            Err(WireError::BadHeaderSize(30))
        ));
    }

    #[test]
    fn header_truncated() {
        let mut buf = &[22u8, 0, 0][..];
        assert!(matches!(
            MsgHeader::decode_from(&mut buf),
            Err(WireError::Truncated(_))
        ));
    }

    // -- fields --

    #[test]
    fn parses_namespace_set_and_digest() {
        let mut buf = BytesMut::new();
        encode_field(&mut buf, field_type::NAMESPACE, b"ns1");
        encode_field(&mut buf, field_type::SETNAME, b"users");
        encode_field(&mut buf, field_type::DIGEST, &[7u8; DIGEST_LEN]);

        let key = parse_key_fields(&mut buf, 3).unwrap();
        assert_eq!(key.namespace.as_deref(), Some("ns1"));
        assert_eq!(key.set.as_deref(), Some("users"));
        assert_eq!(key.digest, Some(Digest::new([7u8; DIGEST_LEN])));
        assert_eq!(key.user_key, None);
    }

    #[test]
    fn parses_user_key_particle() {
        let mut buf = BytesMut::new();
        let mut payload = vec![particle_type::STRING];
        payload.extend_from_slice(b"alice");
        encode_field(&mut buf, field_type::KEY, &payload);

        let key = parse_key_fields(&mut buf, 1).unwrap();
        assert_eq!(key.user_key, Some(Value::Str("alice".to_string())));
    }

    #[test]
    fn skips_unknown_field_types() {
        let mut buf = BytesMut::new();
        encode_field(&mut buf, 99, b"whatever");
        encode_field(&mut buf, field_type::NAMESPACE, b"ns1");

        let key = parse_key_fields(&mut buf, 2).unwrap();
        assert_eq!(key.namespace.as_deref(), Some("ns1"));
    }

    #[test]
    fn truncated_field_errors() {
        let mut buf = BytesMut::new();
        buf.put_u32(100);
        buf.put_u8(field_type::NAMESPACE);
        buf.put_slice(b"short");
        assert!(parse_key_fields(&mut buf, 1).is_err());
    }

    // -- bins --

    #[test]
    fn parses_string_int_and_blob_bins() {
        let mut buf = BytesMut::new();
        encode_bin(&mut buf, "name", particle_type::STRING, b"bob");
        encode_bin(&mut buf, "age", particle_type::INTEGER, &42i64.to_be_bytes());
        encode_bin(&mut buf, "raw", particle_type::BLOB, &[1, 2, 3]);

        let bins = parse_bins(&mut buf, 3).unwrap();
        assert_eq!(bins[0].value, Value::Str("bob".to_string()));
        assert_eq!(bins[1].value, Value::Int(42));
        assert_eq!(bins[2].value, Value::Blob(vec![1, 2, 3]));
    }

    #[test]
    fn rejects_bad_integer_width() {
        let mut buf = BytesMut::new();
        encode_bin(&mut buf, "age", particle_type::INTEGER, &[0u8; 4]);
        assert!(matches!(
            parse_bins(&mut buf, 1),
            Err(WireError::BadParticle(_))
        ));
    }

    #[test]
    fn rejects_unknown_particle() {
        let mut buf = BytesMut::new();
        encode_bin(&mut buf, "x", 200, &[0u8; 2]);
        assert!(matches!(
            parse_bins(&mut buf, 1),
            Err(WireError::BadParticle(200))
        ));
    }

    // -- full record --

    #[test]
    fn parses_full_record() {
        let header = MsgHeader {
            generation: 9,
            ttl: 60,
            n_fields: 1,
            n_ops: 1,
            ..MsgHeader::default()
        };
        let mut buf = BytesMut::new();
        encode_field(&mut buf, field_type::DIGEST, &[1u8; DIGEST_LEN]);
        encode_bin(&mut buf, "v", particle_type::INTEGER, &7i64.to_be_bytes());

        let record = parse_record(&mut buf, &header).unwrap();
        assert_eq!(record.generation, 9);
        assert_eq!(record.ttl, 60);
        assert_eq!(record.bins.len(), 1);
        assert_eq!(record.bins[0].name, "v");
        assert!(buf.is_empty());
    }

    mod properties {
        use proptest::prelude::*;

        use super::super::*;

        proptest! {
            // Arbitrary bytes must never panic the parsers, only error.
            #[test]
            fn header_parse_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
                let mut buf = &data[..];
                let _ = MsgHeader::decode_from(&mut buf);
            }

            #[test]
            fn field_parse_never_panics(
                data in proptest::collection::vec(any::<u8>(), 0..256),
                n in 0u16..8,
            ) {
                let mut buf = &data[..];
                let _ = parse_key_fields(&mut buf, n);
            }

            #[test]
            fn bin_parse_never_panics(
                data in proptest::collection::vec(any::<u8>(), 0..256),
                n in 0u16..8,
            ) {
                let mut buf = &data[..];
                let _ = parse_bins(&mut buf, n);
            }
        }
    }
}
