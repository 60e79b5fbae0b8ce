//! Cluster nodes: identity, addresses, health scoring, and connections.
//!
//! A node accumulates a weighted failure score (`dun_count`). Crossing the
//! threshold latches the `dunned` flag; a latched node takes no new work and
//! is removed from the cluster list and partition table on its next tend
//! tick. A single success resets the score, so only sustained failure
//! removes a node.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use metrics::counter;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::ClusterConfig;
use crate::error::ClientError;
use crate::pool::{CheckoutError, ConnectionPool};

/// Sentinel for "no partition generation seen yet".
pub const GENERATION_UNKNOWN: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// Dun reasons
// ---------------------------------------------------------------------------

/// Why a node's failure score is being bumped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DunReason {
    /// A user-visible operation timed out.
    UserTimeout,
    /// An info probe failed.
    InfoFail,
    /// A replicas fetch failed.
    ReplicasFetch,
    /// The node has no address to dial.
    NoAddress,
    /// Network error on a running operation.
    NetworkError,
    /// A pooled connection broke unexpectedly on checkout.
    RestartFd,
    /// The server at this address reports a different node name; the node
    /// has been replaced and must go.
    BadName,
}

/// The dun weight table. Weights are data, tuned as a set: one failed
/// replicas fetch or an address-less node is immediately past the default
/// threshold, info failures need three in a row, and user timeouts need a
/// sustained storm.
pub const DUN_WEIGHTS: [(DunReason, u32); 7] = [
    (DunReason::UserTimeout, 1),
    (DunReason::InfoFail, 300),
    (DunReason::ReplicasFetch, 1000),
    (DunReason::NoAddress, 1000),
    (DunReason::NetworkError, 50),
    (DunReason::RestartFd, 50),
    (DunReason::BadName, 1000),
];

impl DunReason {
    /// Weight added to the failure accumulator for this reason.
    #[must_use]
    pub fn weight(self) -> u32 {
        DUN_WEIGHTS
            .iter()
            .find(|(reason, _)| *reason == self)
            .map_or(1, |(_, weight)| *weight)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserTimeout => "user timeout",
            Self::InfoFail => "info fail",
            Self::ReplicasFetch => "replicas fetch",
            Self::NoAddress => "no address",
            Self::NetworkError => "network error",
            Self::RestartFd => "restart fd",
            Self::BadName => "bad name",
        }
    }
}

// ---------------------------------------------------------------------------
// Tend state
// ---------------------------------------------------------------------------

/// Observable per-node tend state.
///
/// `Healthy -> Probing` when the tend tick launches an info probe;
/// `Probing -> Healthy` on a good response; `Probing -> Failed` on a
/// transient failure; any state latches to `Dunned` when the failure score
/// crosses the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TendState {
    Healthy = 0,
    Probing = 1,
    Failed = 2,
    Dunned = 3,
}

impl TendState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Probing,
            2 => Self::Failed,
            3 => Self::Dunned,
            _ => Self::Healthy,
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One addressable server in the cluster.
pub struct Node {
    name: String,
    addresses: RwLock<Vec<SocketAddr>>,
    pool: ConnectionPool,
    dun_count: AtomicU32,
    dunned: AtomicBool,
    tend_state: AtomicU8,
    partition_generation: AtomicU32,
    partition_last_req_ms: AtomicU64,
    config: Arc<ClusterConfig>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("addresses", &*self.addresses.read())
            .field("dun_count", &self.dun_count.load(Ordering::Relaxed))
            .field("dunned", &self.is_dunned())
            .finish()
    }
}

impl Node {
    /// Creates a node. The name is the server's reported identity and never
    /// changes; a server answering with a different name is a replaced
    /// server, handled by dunning.
    pub fn new(name: impl Into<String>, config: Arc<ClusterConfig>) -> Self {
        let name = name.into();
        info!(node = %name, "creating node");
        counter!("strata_client_nodes_created").increment(1);
        Self {
            name,
            addresses: RwLock::new(Vec::new()),
            pool: ConnectionPool::new(config.connect_timeout),
            dun_count: AtomicU32::new(0),
            dunned: AtomicBool::new(false),
            tend_state: AtomicU8::new(TendState::Healthy as u8),
            partition_generation: AtomicU32::new(GENERATION_UNKNOWN),
            partition_last_req_ms: AtomicU64::new(0),
            config,
        }
    }

    /// The server-reported identity.
    pub fn name(&self) -> &str {
        &self.name
    }

    // -- addresses --

    /// Appends an address if not already present. Returns whether it was new.
    pub fn add_address(&self, addr: SocketAddr) -> bool {
        let mut addresses = self.addresses.write();
        if addresses.contains(&addr) {
            return false;
        }
        addresses.push(addr);
        true
    }

    /// The first known address: the one tend probes use.
    pub fn address_sample(&self) -> Option<SocketAddr> {
        self.addresses.read().first().copied()
    }

    /// Whether `addr` is one of this node's addresses.
    pub fn has_address(&self, addr: SocketAddr) -> bool {
        self.addresses.read().contains(&addr)
    }

    /// Snapshot of all known addresses.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.addresses.read().clone()
    }

    // -- health --

    /// Bumps the failure score by the reason's weight; latches `dunned`
    /// when the score exceeds the configured threshold.
    pub fn dun(&self, reason: DunReason) {
        let count = self
            .dun_count
            .fetch_add(reason.weight(), Ordering::Relaxed)
            + reason.weight();
        debug!(node = %self.name, reason = reason.as_str(), count, "dun");

        if count > self.config.dun_threshold && !self.dunned.swap(true, Ordering::Relaxed) {
            info!(node = %self.name, count, "node fully dunned");
            self.set_tend_state(TendState::Dunned);
        }
    }

    /// Resets the failure score and the latched flag.
    pub fn ok(&self) {
        self.dun_count.store(0, Ordering::Relaxed);
        self.dunned.store(false, Ordering::Relaxed);
    }

    pub fn is_dunned(&self) -> bool {
        self.dunned.load(Ordering::Relaxed)
    }

    pub fn dun_count(&self) -> u32 {
        self.dun_count.load(Ordering::Relaxed)
    }

    /// A node is active once it is named, un-dunned, and addressable.
    pub fn is_active(&self) -> bool {
        !self.is_dunned() && !self.addresses.read().is_empty()
    }

    pub fn tend_state(&self) -> TendState {
        if self.is_dunned() {
            return TendState::Dunned;
        }
        TendState::from_u8(self.tend_state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_tend_state(&self, state: TendState) {
        self.tend_state.store(state as u8, Ordering::Relaxed);
    }

    // -- partition bookkeeping --

    pub fn partition_generation(&self) -> u32 {
        self.partition_generation.load(Ordering::Relaxed)
    }

    pub(crate) fn set_partition_generation(&self, generation: u32) {
        self.partition_generation
            .store(generation, Ordering::Relaxed);
    }

    pub fn partition_last_req_ms(&self) -> u64 {
        self.partition_last_req_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn set_partition_last_req_ms(&self, now_ms: u64) {
        self.partition_last_req_ms.store(now_ms, Ordering::Relaxed);
    }

    // -- connections --

    /// Leases a connection from the pool, dialing if none are idle.
    ///
    /// # Errors
    ///
    /// [`ClientError::Io`] for a broken pooled stream (node dunned with the
    /// restart weight) or when every dial fails (network-error weight);
    /// [`ClientError::NoUsableAddress`] when there is nothing to dial.
    pub async fn checkout(&self) -> Result<TcpStream, ClientError> {
        let addrs = self.addresses();
        if addrs.is_empty() {
            self.dun(DunReason::NoAddress);
            return Err(ClientError::NoUsableAddress);
        }
        match self.pool.checkout(&addrs).await {
            Ok(stream) => Ok(stream),
            Err(CheckoutError::RemoteBroken) => {
                self.dun(DunReason::RestartFd);
                Err(ClientError::Io(std::io::ErrorKind::ConnectionReset.into()))
            }
            Err(CheckoutError::Unreachable(last)) => {
                self.dun(DunReason::NetworkError);
                Err(ClientError::Io(last.unwrap_or_else(|| {
                    std::io::ErrorKind::ConnectionRefused.into()
                })))
            }
        }
    }

    /// Returns a connection to the pool.
    pub fn checkin(&self, stream: TcpStream) {
        self.pool.checkin(stream);
    }

    /// Drains the connection pool. Called when the node leaves the cluster.
    pub fn drain_pool(&self) {
        self.pool.drain();
    }

    /// Idle pooled connections (diagnostics and tests).
    pub fn pooled_connections(&self) -> usize {
        self.pool.idle_count()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        info!(node = %self.name, "destroying node");
        counter!("strata_client_nodes_destroyed").increment(1);
    }
}
