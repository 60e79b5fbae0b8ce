//! Strata Core -- the wire contract shared by every Strata client component.
//!
//! This crate provides the protocol layer with no I/O of its own:
//!
//! - **Proto** ([`proto`]): the 8-byte frame header wrapping every exchange
//! - **Info** ([`info`]): the text info codec (`name\tvalue\n` properties)
//! - **Msg** ([`msg`]): record message headers, key fields, and bin parsing
//! - **Command** ([`command`]): framed command buffer assembly
//! - **Digest** ([`digest`]): key digests and digest-to-partition mapping

pub mod command;
pub mod digest;
pub mod info;
pub mod msg;
pub mod proto;

// Digest
pub use digest::{
    digest_to_partition, Digest, DIGEST_LEN, MAX_NAMESPACE_LEN, MAX_PARTITION_COUNT,
};

// Proto
pub use proto::{FrameHeader, FrameType, FRAME_HEADER_SIZE, PROTO_VERSION};

// Info
pub use info::{encode_request, parse_replicas, parse_services, InfoResponse};

// Msg
pub use msg::{
    parse_record, Bin, MsgHeader, Record, RecordKey, Value, INFO3_LAST, MSG_HEADER_SIZE,
};

// Command
pub use command::{encode_arglist, CommandBuffer, ScanPriority};

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("truncated input while reading {0}")]
    Truncated(&'static str),
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),
    #[error("frame payload of {0} bytes exceeds the 48-bit length field")]
    FrameTooLarge(u64),
    #[error("message header declares size {0}")]
    BadHeaderSize(u8),
    #[error("invalid particle type {0}")]
    BadParticle(u8),
    #[error("invalid UTF-8 in {0}")]
    BadUtf8(&'static str),
    #[error("msgpack encoding failed: {0}")]
    Msgpack(String),
}
