//! Key digests and digest-to-partition mapping.
//!
//! Every record operation arrives with a precomputed 20-byte key digest; the
//! digest is the unit of routing. Partition selection is the shared contract
//! between every Strata client and the server: the first two digest bytes,
//! read big-endian, modulo the cluster's partition count.

use std::fmt;

/// Length of a key digest in bytes.
pub const DIGEST_LEN: usize = 20;

/// Upper bound on the cluster partition count a client will accept.
pub const MAX_PARTITION_COUNT: u32 = 4096;

/// Maximum namespace name length in bytes.
///
/// Namespaces longer than this are rejected when they arrive over the wire;
/// partition data referencing them is dropped with a warning.
pub const MAX_NAMESPACE_LEN: usize = 31;

/// A 20-byte key digest, as produced by the operation-construction layer.
///
/// Digests are opaque to the routing subsystem: only the first two bytes
/// participate in partition selection.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    /// Builds a digest from raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only the routing prefix is interesting in logs.
        write!(f, "Digest({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// Maps a digest to its partition ID in `[0, partition_count)`.
///
/// The first two digest bytes are interpreted as a big-endian integer and
/// reduced modulo the partition count.
///
/// # Panics
///
/// Panics if `partition_count` is zero; callers must not route before the
/// partition count is known.
#[must_use]
pub fn digest_to_partition(digest: &Digest, partition_count: u32) -> u32 {
    assert!(partition_count > 0, "partition count must be non-zero");
    u32::from(u16::from_be_bytes([digest.0[0], digest.0[1]])) % partition_count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_with_prefix(b0: u8, b1: u8) -> Digest {
        let mut bytes = [0u8; DIGEST_LEN];
        bytes[0] = b0;
        bytes[1] = b1;
        Digest::new(bytes)
    }

    #[test]
    fn partition_uses_first_two_bytes_big_endian() {
        assert_eq!(digest_to_partition(&digest_with_prefix(0x00, 0x00), 4096), 0);
        assert_eq!(digest_to_partition(&digest_with_prefix(0x00, 0x02), 4096), 2);
        // 0x1234 = 4660; 4660 % 4096 = 564
        assert_eq!(
            digest_to_partition(&digest_with_prefix(0x12, 0x34), 4096),
            564
        );
    }

    #[test]
    fn trailing_digest_bytes_do_not_affect_partition() {
        let mut bytes = [0xABu8; DIGEST_LEN];
        bytes[0] = 0x00;
        bytes[1] = 0x07;
        assert_eq!(digest_to_partition(&Digest::new(bytes), 4096), 7);
    }

    #[test]
    fn small_partition_counts_wrap() {
        assert_eq!(digest_to_partition(&digest_with_prefix(0x00, 0x05), 4), 1);
    }

    #[test]
    #[should_panic(expected = "partition count must be non-zero")]
    fn zero_partition_count_panics() {
        let _ = digest_to_partition(&digest_with_prefix(0, 0), 0);
    }

    #[test]
    fn debug_shows_routing_prefix() {
        let d = digest_with_prefix(0xDE, 0xAD);
        assert_eq!(format!("{d:?}"), "Digest(dead..)");
    }
}
