//! Info exchange codec.
//!
//! An info request is a newline-delimited list of property names; the reply
//! is a sequence of `name<TAB>value<LF>` records. A server that declines to
//! answer a name simply omits it. The parser is deliberately tolerant:
//! trailing junk, a missing final LF, and lines without a TAB are skipped
//! rather than treated as errors; info data is advisory, never load-bearing
//! enough to fail a connection over.

use std::net::SocketAddr;

use tracing::debug;

/// Property names consumed by the cluster subsystem.
pub mod names {
    /// The server's stable identity string.
    pub const NODE: &str = "node";
    /// Total partition count for the cluster.
    pub const PARTITIONS: &str = "partitions";
    /// Monotonic integer bumped on every rebalance.
    pub const PARTITION_GENERATION: &str = "partition-generation";
    /// Partitions this node owns for reads, `ns:id;…`.
    pub const REPLICAS_READ: &str = "replicas-read";
    /// Partitions this node owns for writes, `ns:id;…`.
    pub const REPLICAS_WRITE: &str = "replicas-write";
    /// Peer nodes, `host:port;…`.
    pub const SERVICES: &str = "services";
}

// ---------------------------------------------------------------------------
// Request encoding
// ---------------------------------------------------------------------------

/// Encodes an info request body: names joined and terminated by `\n`.
#[must_use]
pub fn encode_request(request_names: &[&str]) -> Vec<u8> {
    let mut body = Vec::with_capacity(
        request_names.iter().map(|n| n.len() + 1).sum::<usize>(),
    );
    for name in request_names {
        body.extend_from_slice(name.as_bytes());
        body.push(b'\n');
    }
    body
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// A parsed info response: ordered `(name, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoResponse {
    fields: Vec<(String, String)>,
}

impl InfoResponse {
    /// Parses a response body.
    ///
    /// Lines without a TAB separator are skipped; unknown names are kept so
    /// callers can ignore them. Never fails.
    #[must_use]
    pub fn parse(body: &str) -> Self {
        let mut fields = Vec::new();
        for line in body.split('\n') {
            if line.is_empty() {
                continue;
            }
            match line.split_once('\t') {
                Some((name, value)) => {
                    fields.push((name.to_string(), value.to_string()));
                }
                None => {
                    debug!(line, "info response line without separator, skipping");
                }
            }
        }
        Self { fields }
    }

    /// Returns the value for `name`, if the server answered it.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the value for `name` parsed as `u32`.
    #[must_use]
    pub fn get_u32(&self, name: &str) -> Option<u32> {
        self.get(name).and_then(|v| v.parse().ok())
    }

    /// The server's identity string, if present.
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        self.get(names::NODE)
    }

    /// Iterates over all parsed `(name, value)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Value-list parsing
// ---------------------------------------------------------------------------

/// Parses a `services` value (`host:port;host:port;…`) into socket addresses.
///
/// Only address literals are accepted; entries carrying DNS names are
/// silently discarded, so a hostile or misconfigured peer list cannot force
/// the client into resolver traffic.
#[must_use]
pub fn parse_services(value: &str) -> Vec<SocketAddr> {
    let mut peers = Vec::new();
    for entry in value.split(';') {
        if entry.is_empty() {
            continue;
        }
        let Some((host, port)) = entry.rsplit_once(':') else {
            debug!(entry, "services entry without port, skipping");
            continue;
        };
        let (Ok(ip), Ok(port)) = (host.parse(), port.parse::<u16>()) else {
            debug!(entry, "services entry is not an address literal, skipping");
            continue;
        };
        peers.push(SocketAddr::new(ip, port));
    }
    peers
}

/// Parses a replicas value (`namespace:partition-id;…`) into
/// `(namespace, partition_id)` pairs. Malformed entries are skipped.
#[must_use]
pub fn parse_replicas(value: &str) -> Vec<(&str, u32)> {
    let mut out = Vec::new();
    for entry in value.split(';') {
        if entry.is_empty() {
            continue;
        }
        let Some((namespace, id)) = entry.split_once(':') else {
            debug!(entry, "replicas entry without separator, skipping");
            continue;
        };
        match id.parse::<u32>() {
            Ok(partition_id) => out.push((namespace, partition_id)),
            Err(_) => debug!(entry, "replicas entry with bad partition id, skipping"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- request encoding --

    #[test]
    fn encode_request_joins_with_newlines() {
        let body = encode_request(&["node", "partition-generation", "services"]);
        assert_eq!(body, b"node\npartition-generation\nservices\n");
    }

    #[test]
    fn encode_request_empty_is_empty() {
        assert!(encode_request(&[]).is_empty());
    }

    // -- response parsing --

    #[test]
    fn parse_basic_response() {
        let resp = InfoResponse::parse("node\tA\npartitions\t4096\n");
        assert_eq!(resp.node(), Some("A"));
        assert_eq!(resp.get_u32(names::PARTITIONS), Some(4096));
    }

    #[test]
    fn parse_tolerates_missing_trailing_newline() {
        let resp = InfoResponse::parse("node\tA\npartition-generation\t7");
        assert_eq!(resp.node(), Some("A"));
        assert_eq!(resp.get_u32(names::PARTITION_GENERATION), Some(7));
    }

    #[test]
    fn parse_skips_lines_without_tab() {
        let resp = InfoResponse::parse("garbage line\nnode\tA\n");
        assert_eq!(resp.node(), Some("A"));
        assert_eq!(resp.iter().count(), 1);
    }

    #[test]
    fn absent_field_is_none() {
        let resp = InfoResponse::parse("node\tA\n");
        assert_eq!(resp.get(names::SERVICES), None);
        assert_eq!(resp.get_u32(names::PARTITIONS), None);
    }

    #[test]
    fn empty_value_is_kept() {
        // A server may answer `services` with an empty peer list.
        let resp = InfoResponse::parse("services\t\n");
        assert_eq!(resp.get(names::SERVICES), Some(""));
    }

    #[test]
    fn non_numeric_value_parses_as_none() {
        let resp = InfoResponse::parse("partitions\tmany\n");
        assert_eq!(resp.get_u32(names::PARTITIONS), None);
    }

    // -- services parsing --

    #[test]
    fn services_parses_address_literals() {
        let peers = parse_services("10.0.0.2:3000;10.0.0.3:3100");
        assert_eq!(
            peers,
            vec![
                "10.0.0.2:3000".parse().unwrap(),
                "10.0.0.3:3100".parse().unwrap()
            ]
        );
    }

    #[test]
    fn services_discards_hostnames() {
        let peers = parse_services("db1.internal:3000;10.0.0.2:3000");
        assert_eq!(peers, vec!["10.0.0.2:3000".parse().unwrap()]);
    }

    #[test]
    fn services_discards_malformed_entries() {
        assert!(parse_services("nonsense").is_empty());
        assert!(parse_services("10.0.0.2:notaport").is_empty());
        assert!(parse_services("").is_empty());
    }

    // -- replicas parsing --

    #[test]
    fn replicas_parses_pairs() {
        let entries = parse_replicas("ns1:0;ns1:1;other:4095");
        assert_eq!(entries, vec![("ns1", 0), ("ns1", 1), ("other", 4095)]);
    }

    #[test]
    fn replicas_skips_malformed_entries() {
        let entries = parse_replicas("ns1:0;;broken;ns1:x;ns2:2");
        assert_eq!(entries, vec![("ns1", 0), ("ns2", 2)]);
    }

    // -- robustness --

    mod properties {
        use proptest::prelude::*;

        use super::super::*;

        proptest! {
            #[test]
            fn parse_never_panics(body in ".*") {
                let _ = InfoResponse::parse(&body);
            }

            #[test]
            fn services_never_panics(value in ".*") {
                let _ = parse_services(&value);
            }

            #[test]
            fn encoded_request_round_trips_names(
                names in proptest::collection::vec("[a-z-]{1,20}", 0..8)
            ) {
                let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                let body = encode_request(&refs);
                let text = String::from_utf8(body).unwrap();
                let parsed: Vec<&str> =
                    text.split('\n').filter(|s| !s.is_empty()).collect();
                prop_assert_eq!(parsed, refs);
            }
        }
    }
}
