//! Client error taxonomy.
//!
//! Every component reports failures to its caller; a node is dunned only for
//! reasons attributable to that node's health (see `cluster::node`), never
//! for user cancellation or scan-level protocol disagreements.

use strata_core::WireError;

/// Errors surfaced by the cluster, routing, and scan subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transient I/O failure on a leased connection. The connection is
    /// discarded and the node dunned with the network-error weight.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent bytes that do not decode as the Strata protocol.
    #[error("wire protocol violation: {0}")]
    Wire(#[from] WireError),

    /// An info exchange failed or returned an unusable response.
    #[error("info exchange with {addr} failed: {detail}")]
    InfoFailed { addr: std::net::SocketAddr, detail: String },

    /// The per-request deadline expired.
    #[error("operation timed out")]
    Timeout,

    /// A node has no address to dial.
    #[error("node has no usable address")]
    NoUsableAddress,

    /// The router found no live node; the caller should park the request.
    #[error("no live node available")]
    NoNode,

    /// A scan was issued against a cluster with no known nodes.
    #[error("scan failed because the cluster is empty")]
    ClusterEmpty,

    /// The server answered with a non-OK result code.
    #[error("server returned result code {0}")]
    Server(u8),

    /// A peer worker latched a failure; this worker stopped cooperatively.
    #[error("scan aborted after peer failure")]
    ScanAborted,

    /// The record callback asked to stop. Collapsed to success at the scan
    /// executor boundary.
    #[error("scan aborted by caller")]
    ClientAbort,

    /// The cluster is shutting down.
    #[error("client is shutting down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: ClientError = io.into();
        assert!(matches!(err, ClientError::Io(_)));
    }

    #[test]
    fn wire_errors_convert() {
        let err: ClientError = WireError::Truncated("frame header").into();
        assert!(matches!(err, ClientError::Wire(_)));
    }

    #[test]
    fn display_is_human_readable() {
        assert_eq!(ClientError::Timeout.to_string(), "operation timed out");
        assert_eq!(
            ClientError::Server(1).to_string(),
            "server returned result code 1"
        );
    }
}
