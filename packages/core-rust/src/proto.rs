//! Wire frame header shared by every Strata TCP exchange.
//!
//! Every request and response group travels inside an 8-byte frame header:
//! one version byte, one frame-type byte, and a 48-bit big-endian payload
//! size. Info exchanges and record messages use the same framing.

use bytes::{Buf, BufMut};

use crate::WireError;

/// Protocol version carried in every frame header.
pub const PROTO_VERSION: u8 = 2;

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum payload size expressible in the 48-bit length field.
pub const MAX_FRAME_SIZE: u64 = (1 << 48) - 1;

// ---------------------------------------------------------------------------
// FrameType
// ---------------------------------------------------------------------------

/// Discriminates the payload carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Text info exchange: newline-delimited names out, `name\tvalue\n` back.
    Info = 1,
    /// Binary record message(s): command requests and record responses.
    Message = 3,
}

impl FrameType {
    fn from_wire(raw: u8) -> Result<Self, WireError> {
        match raw {
            1 => Ok(Self::Info),
            3 => Ok(Self::Message),
            other => Err(WireError::UnknownFrameType(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// FrameHeader
// ---------------------------------------------------------------------------

/// Decoded 8-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    /// Payload size in bytes (48-bit on the wire).
    pub size: u64,
}

impl FrameHeader {
    /// Creates a header, validating that `size` fits the 48-bit length field.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::FrameTooLarge`] if `size` exceeds
    /// [`MAX_FRAME_SIZE`].
    pub fn new(frame_type: FrameType, size: u64) -> Result<Self, WireError> {
        if size > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(size));
        }
        Ok(Self { frame_type, size })
    }

    /// Encodes the header into its 8-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let word = (u64::from(PROTO_VERSION) << 56)
            | (u64::from(self.frame_type as u8) << 48)
            | self.size;
        word.to_be_bytes()
    }

    /// Appends the 8-byte wire form to `buf`.
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.encode());
    }

    /// Decodes a header from exactly 8 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::BadVersion`] or [`WireError::UnknownFrameType`]
    /// if the leading bytes are not a valid Strata frame.
    pub fn decode(bytes: [u8; FRAME_HEADER_SIZE]) -> Result<Self, WireError> {
        let word = u64::from_be_bytes(bytes);
        let version = (word >> 56) as u8;
        if version != PROTO_VERSION {
            return Err(WireError::BadVersion(version));
        }
        let frame_type = FrameType::from_wire((word >> 48) as u8)?;
        Ok(Self {
            frame_type,
            size: word & MAX_FRAME_SIZE,
        })
    }

    /// Decodes a header from the front of `buf`, consuming 8 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] if fewer than 8 bytes remain, or the
    /// errors of [`FrameHeader::decode`].
    pub fn decode_from(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < FRAME_HEADER_SIZE {
            return Err(WireError::Truncated("frame header"));
        }
        let mut bytes = [0u8; FRAME_HEADER_SIZE];
        buf.copy_to_slice(&mut bytes);
        Self::decode(bytes)
    }
}
