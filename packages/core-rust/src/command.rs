//! Command buffer assembly.
//!
//! Builds the single immutable byte buffer a command sends over the wire:
//! an 8-byte frame header, the 22-byte message header, length-prefixed key
//! fields, and bin-name operations. The scan executor shares one buffer
//! across all of its workers, so the builder finishes into a frozen
//! [`Bytes`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::msg::{field_type, op_type, MsgHeader, MSG_HEADER_SIZE};
use crate::proto::{FrameHeader, FrameType, FRAME_HEADER_SIZE};
use crate::WireError;

// ---------------------------------------------------------------------------
// Scan options
// ---------------------------------------------------------------------------

/// Scan priority, encoded into the high nibble of the scan-options field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ScanPriority {
    /// Let the server choose.
    #[default]
    Auto = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

/// Bit set in the scan-options field when the scan must fail on a cluster
/// topology change.
pub const SCAN_FAIL_ON_CLUSTER_CHANGE: u8 = 0x08;

/// Encodes the two-byte scan-options field payload.
#[must_use]
pub fn encode_scan_options(
    priority: ScanPriority,
    fail_on_cluster_change: bool,
    percent: u8,
) -> [u8; 2] {
    let mut first = (priority as u8) << 4;
    if fail_on_cluster_change {
        first |= SCAN_FAIL_ON_CLUSTER_CHANGE;
    }
    [first, percent]
}

// ---------------------------------------------------------------------------
// UDF arglist
// ---------------------------------------------------------------------------

/// Serializes a UDF argument list to its msgpack wire form.
///
/// # Errors
///
/// Returns [`WireError::Msgpack`] if a value cannot be encoded (not
/// reachable for the value kinds the builder accepts).
pub fn encode_arglist(args: &[rmpv::Value]) -> Result<Vec<u8>, WireError> {
    let list = rmpv::Value::Array(args.to_vec());
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, &list).map_err(|e| WireError::Msgpack(e.to_string()))?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

/// Incremental builder for a framed command buffer.
///
/// The frame header is reserved up front and backfilled by [`finish`], once
/// the payload size is known.
///
/// [`finish`]: CommandBuffer::finish
#[derive(Debug)]
pub struct CommandBuffer {
    buf: BytesMut,
}

impl CommandBuffer {
    /// Starts a command with the given message header.
    #[must_use]
    pub fn new(header: &MsgHeader) -> Self {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + MSG_HEADER_SIZE + 64);
        buf.put_bytes(0, FRAME_HEADER_SIZE);
        header.encode_into(&mut buf);
        Self { buf }
    }

    /// Appends a string key field.
    pub fn field_str(&mut self, ftype: u8, value: &str) {
        self.field_bytes(ftype, value.as_bytes());
    }

    /// Appends a raw key field.
    pub fn field_bytes(&mut self, ftype: u8, payload: &[u8]) {
        #[allow(clippy::cast_possible_truncation)]
        self.buf.put_u32(payload.len() as u32 + 1);
        self.buf.put_u8(ftype);
        self.buf.put_slice(payload);
    }

    /// Appends an 8-byte big-endian integer field (task ids).
    pub fn field_u64(&mut self, ftype: u8, value: u64) {
        self.field_bytes(ftype, &value.to_be_bytes());
    }

    /// Appends the two-byte scan-options field.
    pub fn scan_options(
        &mut self,
        priority: ScanPriority,
        fail_on_cluster_change: bool,
        percent: u8,
    ) {
        let payload = encode_scan_options(priority, fail_on_cluster_change, percent);
        self.field_bytes(field_type::SCAN_OPTIONS, &payload);
    }

    /// Appends a bin-name selector as a read operation with no value.
    pub fn bin_name(&mut self, name: &str) {
        #[allow(clippy::cast_possible_truncation)]
        self.buf.put_u32(4 + name.len() as u32);
        self.buf.put_u8(op_type::READ);
        self.buf.put_u8(0); // particle
        self.buf.put_u8(0); // version
        #[allow(clippy::cast_possible_truncation)]
        self.buf.put_u8(name.len() as u8);
        self.buf.put_slice(name.as_bytes());
    }

    /// Backfills the frame header and freezes the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::FrameTooLarge`] if the payload exceeds the 48-bit
    /// length field (not reachable for realistic commands).
    pub fn finish(mut self) -> Result<Bytes, WireError> {
        let payload_size = (self.buf.len() - FRAME_HEADER_SIZE) as u64;
        let frame = FrameHeader::new(FrameType::Message, payload_size)?;
        self.buf[..FRAME_HEADER_SIZE].copy_from_slice(&frame.encode());
        Ok(self.buf.freeze())
    }
}
