//! Cluster membership and tending.
//!
//! The cluster owns the live node set, the partition table, and the seed
//! host list. A tender task re-seeds the cluster when the node list
//! collapses to empty; per-node tend tasks drive health probes, partition
//! refreshes, and peer discovery. All membership and partition mutation
//! happens under one mutex; counters and flags are atomics read lock-free.

pub mod handle;
pub mod node;
pub mod partition;
mod router;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use metrics::counter;
use parking_lot::Mutex;
use strata_core::info::names as info_names;
use strata_core::{parse_replicas, parse_services, InfoResponse, MAX_PARTITION_COUNT};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::info;
use crate::resolver::NameResolver;

pub use handle::{Reservation, Shared};
pub use node::{DunReason, Node, TendState, DUN_WEIGHTS, GENERATION_UNKNOWN};
pub use partition::{PartitionSlot, PartitionTable};

/// A parked request: a restart hook invoked once a node is known.
pub type RestartFn = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// In-flight tracking
// ---------------------------------------------------------------------------

/// Atomic counter with RAII guards, for requests and info exchanges.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: Arc<AtomicU64>,
}

impl InFlight {
    pub(crate) fn guard(&self) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            count: Arc::clone(&self.count),
        }
    }

    pub(crate) fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Decrements the owning counter when dropped, panic-safe.
#[derive(Debug)]
pub struct InFlightGuard {
    count: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Cluster internals
// ---------------------------------------------------------------------------

struct NodeEntry {
    /// The cluster list's own hold on the node ("C").
    node: Reservation<Node>,
    /// The node's tend task; aborted when the cluster is destroyed.
    tend: JoinHandle<()>,
}

struct ClusterShared {
    nodes: Vec<NodeEntry>,
    partitions: PartitionTable,
    /// Seed `(host, port)` pairs. Never removed: they are the fallback when
    /// the live node list collapses to empty.
    seeds: Vec<(String, u16)>,
    parked: VecDeque<RestartFn>,
}

pub(crate) struct ClusterInner {
    config: Arc<ClusterConfig>,
    resolver: Box<dyn NameResolver>,
    shared: Mutex<ClusterShared>,
    /// Mirror of the table's partition count for lock-free router reads.
    n_partitions: AtomicU32,
    /// Round-robin cursor for the random-node fallback.
    cursor: AtomicUsize,
    follow: AtomicBool,
    shutdown: AtomicBool,
    requests: InFlight,
    infos: InFlight,
    /// Wakes the tender outside its regular interval (host added, destroy).
    tend_now: Notify,
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

/// A connected Strata cluster: node set, partition routing, and tending.
pub struct Cluster {
    inner: Arc<ClusterInner>,
    tender: Mutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    /// Creates a cluster and starts its tender task.
    ///
    /// The cluster knows no nodes until seeds are added via
    /// [`add_host`](Self::add_host) and the tender resolves them.
    #[must_use]
    pub fn new(config: ClusterConfig, resolver: impl NameResolver) -> Self {
        let inner = Arc::new(ClusterInner {
            follow: AtomicBool::new(config.follow),
            config: Arc::new(config),
            resolver: Box::new(resolver),
            shared: Mutex::new(ClusterShared {
                nodes: Vec::new(),
                partitions: PartitionTable::new(),
                seeds: Vec::new(),
                parked: VecDeque::new(),
            }),
            n_partitions: AtomicU32::new(0),
            cursor: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            requests: InFlight::default(),
            infos: InFlight::default(),
            tend_now: Notify::new(),
        });
        let tender = tokio::spawn(run_tender(Arc::clone(&inner)));
        Self {
            inner,
            tender: Mutex::new(Some(tender)),
        }
    }

    /// Registers a seed host. Duplicate `(host, port)` pairs collapse to one
    /// entry. Fires a tend pass so resolution starts promptly.
    pub fn add_host(&self, host: &str, port: u16) {
        debug!(host, port, "adding host");
        {
            let mut shared = self.inner.shared.lock();
            if shared.seeds.iter().any(|(h, p)| h == host && *p == port) {
                return;
            }
            shared.seeds.push((host.to_string(), port));
        }
        self.inner.tend_now.notify_one();
    }

    /// Number of nodes that are named, un-dunned, and addressable.
    #[must_use]
    pub fn active_node_count(&self) -> usize {
        self.inner
            .shared
            .lock()
            .nodes
            .iter()
            .filter(|entry| entry.node.is_active())
            .count()
    }

    /// Total nodes in the list, active or not.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.inner.shared.lock().nodes.len()
    }

    /// Seed host entries registered so far.
    #[must_use]
    pub fn seed_count(&self) -> usize {
        self.inner.shared.lock().seeds.len()
    }

    /// User requests currently in flight.
    #[must_use]
    pub fn requests_in_progress(&self) -> u64 {
        self.inner.requests.count()
    }

    /// Info exchanges currently in flight.
    #[must_use]
    pub fn infos_in_progress(&self) -> u64 {
        self.inner.infos.count()
    }

    /// Takes an in-flight guard for a user request.
    #[must_use]
    pub fn request_guard(&self) -> InFlightGuard {
        self.inner.requests.guard()
    }

    /// Controls whether `services` peer lists are followed. Only address
    /// literals in a services reply are honored either way.
    pub fn set_follow(&self, follow: bool) {
        self.inner.follow.store(follow, Ordering::Relaxed);
    }

    /// The cluster partition count, or zero until first learned.
    #[must_use]
    pub fn partition_count(&self) -> u32 {
        self.inner.n_partitions.load(Ordering::Acquire)
    }

    /// Whether destroy has begun.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Relaxed)
    }

    /// Takes a transaction lease on the node with the given name.
    #[must_use]
    pub fn node_by_name(&self, name: &str) -> Option<Reservation<Node>> {
        let shared = self.inner.shared.lock();
        shared
            .nodes
            .iter()
            .find(|entry| entry.node.name() == name)
            .map(|entry| entry.node.shared().reserve("T"))
    }

    /// Takes a transaction lease on every node in the list (scan fan-out).
    #[must_use]
    pub fn reserve_all_nodes(&self) -> Vec<Reservation<Node>> {
        let shared = self.inner.shared.lock();
        shared
            .nodes
            .iter()
            .map(|entry| entry.node.shared().reserve("T"))
            .collect()
    }

    /// Parks a request to be restarted when the first node is learned.
    /// Requests parked after shutdown begins are reported and dropped.
    pub fn park_request(&self, restart: RestartFn) {
        if self.is_shutdown() {
            warn!("request parked during shutdown, dropping");
            return;
        }
        self.inner.shared.lock().parked.push_back(restart);
    }

    /// Parked requests currently queued.
    #[must_use]
    pub fn parked_requests(&self) -> usize {
        self.inner.shared.lock().parked.len()
    }

    /// Destroys the cluster.
    ///
    /// Sets the shutdown flag, sleeps `delay_ms` (clamped to one minute),
    /// joins the tender, waits out outstanding info exchanges (bounded by
    /// the configured drain timeout), cancels every node tend task, and
    /// releases the cluster's node and partition references. Still-parked
    /// requests are reported and dropped.
    pub async fn close(&self, delay_ms: u64) {
        let delay = delay_ms.min(60_000);
        info!(delay_ms = delay, "cluster destroy");
        self.inner.shutdown.store(true, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(delay)).await;

        self.inner.tend_now.notify_one();
        let tender = self.tender.lock().take();
        if let Some(handle) = tender {
            let _ = handle.await;
        }

        let deadline = Instant::now() + self.inner.config.drain_timeout;
        while self.inner.infos.count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let outstanding = self.inner.infos.count();
        if outstanding > 0 {
            warn!(outstanding, "info exchanges still outstanding at destroy");
        }
        if self.inner.requests.count() > 0 {
            warn!(
                requests = self.inner.requests.count(),
                "cluster destroy with requests in progress"
            );
        }

        let entries: Vec<NodeEntry> = {
            let mut shared = self.inner.shared.lock();
            shared.nodes.drain(..).collect()
        };
        for entry in entries {
            let NodeEntry { node, tend } = entry;
            tend.abort();
            let _ = tend.await;
            node.drain_pool();
            // dropping `node` releases the "C" reservation
        }

        let mut shared = self.inner.shared.lock();
        shared.partitions.clear();
        let leaked = shared.parked.len();
        if leaked > 0 {
            warn!(leaked, "parked requests leaked at destroy");
        }
        shared.parked.clear();
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("nodes", &self.node_count())
            .field("partition_count", &self.partition_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tender
// ---------------------------------------------------------------------------

fn epoch_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    let ms = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    ms
}

async fn run_tender(inner: Arc<ClusterInner>) {
    let mut ticker = tokio::time::interval(inner.config.tend_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_stats = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = inner.tend_now.notified() => {}
        }
        if inner.shutdown.load(Ordering::Relaxed) {
            break;
        }

        tend(&inner).await;

        if last_stats.elapsed() >= inner.config.stats_interval {
            last_stats = Instant::now();
            let (nodes, active) = {
                let shared = inner.shared.lock();
                let active = shared.nodes.iter().filter(|e| e.node.is_active()).count();
                (shared.nodes.len(), active)
            };
            info!(
                nodes,
                active,
                requests_in_progress = inner.requests.count(),
                infos_in_progress = inner.infos.count(),
                "cluster stats"
            );
        }
    }
    debug!("tender stopped");
}

/// One tender pass. Per-node work is driven by the node tend tasks; the
/// tender's only job is re-seeding when the node list is empty.
async fn tend(inner: &Arc<ClusterInner>) {
    let empty = inner.shared.lock().nodes.is_empty();
    if !empty {
        return;
    }

    let seeds: Vec<(String, u16)> = inner.shared.lock().seeds.clone();
    if !seeds.is_empty() {
        debug!(seeds = seeds.len(), "no nodes remaining, resolving seed hosts");
    }
    for (host, port) in seeds {
        if let Some(addr) = inner.resolver.resolve_immediate(&host, port) {
            new_sockaddr(inner, addr);
        } else {
            match inner.resolver.resolve(&host, port).await {
                Ok(addrs) => {
                    for addr in addrs {
                        new_sockaddr(inner, addr);
                    }
                }
                Err(e) => debug!(host = %host, port, error = %e, "seed resolution failed"),
            }
        }
    }
}

/// The new-address path: feed every discovered sockaddr through here.
/// Known addresses are debounced; new ones get an async identity probe
/// whose response creates or extends a node.
pub(crate) fn new_sockaddr(inner: &Arc<ClusterInner>, addr: SocketAddr) {
    if inner.shutdown.load(Ordering::Relaxed) {
        return;
    }
    {
        let shared = inner.shared.lock();
        if shared.nodes.iter().any(|e| e.node.has_address(addr)) {
            return;
        }
    }
    info!(%addr, "new address found, probing for identity");

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let _guard = inner.infos.guard();
        let names: &[&str] = if inner.n_partitions.load(Ordering::Acquire) == 0 {
            &[info_names::NODE, info_names::PARTITIONS]
        } else {
            &[info_names::NODE]
        };
        match info::request(addr, names, inner.config.info_timeout).await {
            Ok(resp) => {
                // Shutdown observed here means: drop the state, touch nothing.
                if inner.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                handle_ping_response(&inner, addr, &resp);
            }
            Err(e) => info!(%addr, error = %e, "identity probe failed"),
        }
    });
}

/// Identity probe response: learn the partition count (first time only),
/// create or extend the node owning this address, then restart any parked
/// requests now that a node exists.
fn handle_ping_response(inner: &Arc<ClusterInner>, addr: SocketAddr, resp: &InfoResponse) {
    if let Some(count) = resp.get_u32(info_names::PARTITIONS) {
        set_partition_count(inner, count);
    }

    let Some(name) = resp.node() else {
        debug!(%addr, "identity probe response without a node name");
        return;
    };

    {
        let mut shared = inner.shared.lock();
        if let Some(entry) = shared.nodes.iter().find(|e| e.node.name() == name) {
            if entry.node.add_address(addr) {
                debug!(node = name, %addr, "attached address to existing node");
            }
        } else {
            let node = Shared::new(Node::new(name, Arc::clone(&inner.config)));
            node.add_address(addr);
            let lease = node.reserve("L");
            let tend = tokio::spawn(run_node_tend(Arc::clone(inner), lease));
            shared.nodes.push(NodeEntry {
                node: node.reserve("C"),
                tend,
            });
        }
    }

    drain_parked(inner);
}

fn set_partition_count(inner: &Arc<ClusterInner>, count: u32) {
    if count == 0 || count > MAX_PARTITION_COUNT {
        warn!(count, "ignoring implausible partition count");
        return;
    }
    let mut shared = inner.shared.lock();
    shared.partitions.set_partition_count(count);
    inner
        .n_partitions
        .store(shared.partitions.partition_count(), Ordering::Release);
}

fn drain_parked(inner: &Arc<ClusterInner>) {
    let thunks: Vec<RestartFn> = {
        let mut shared = inner.shared.lock();
        if shared.nodes.is_empty() {
            return;
        }
        shared.parked.drain(..).collect()
    };
    for restart in thunks {
        debug!("node available, restarting parked request");
        restart();
    }
}

// ---------------------------------------------------------------------------
// Per-node tending
// ---------------------------------------------------------------------------

/// The per-node tend loop. Owns the node's "L" reservation; when the node
/// latches dunned, removes it from the cluster and exits, releasing the
/// lease.
async fn run_node_tend(inner: Arc<ClusterInner>, lease: Reservation<Node>) {
    let mut ticker = tokio::time::interval(inner.config.node_tend_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first interval tick completes immediately, but the node was just
    // probed by the identity exchange that created it; swallow the tick so
    // health probes start one interval later.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if inner.shutdown.load(Ordering::Relaxed) {
            break;
        }
        if lease.is_dunned() {
            remove_node(&inner, lease.shared());
            break;
        }
        tend_node(&inner, &lease).await;
    }
}

/// Removes a dunned node from the cluster list and the partition table and
/// drains its connection pool. The final reservation release destroys it.
fn remove_node(inner: &Arc<ClusterInner>, node: &Shared<Node>) {
    info!(node = %node.name(), "node fully dunned, removing from cluster");
    let entry = {
        let mut shared = inner.shared.lock();
        shared.partitions.remove_node(node);
        shared
            .nodes
            .iter()
            .position(|e| e.node.shared().ptr_eq(node))
            .map(|i| shared.nodes.remove(i))
    };
    node.drain_pool();
    // Dropping the entry releases "C". The tend task's own handle is inside
    // the entry; dropping a JoinHandle merely detaches it.
    drop(entry);
}

/// One per-node tend tick: probe identity and generation, refetch the
/// partition map when it moved, follow the services peer list.
async fn tend_node(inner: &Arc<ClusterInner>, node: &Reservation<Node>) {
    let Some(addr) = node.address_sample() else {
        node.dun(DunReason::NoAddress);
        return;
    };

    node.set_tend_state(TendState::Probing);
    let resp = {
        let _probe = node.shared().reserve("I");
        let _guard = inner.infos.guard();
        info::request(
            addr,
            &[
                info_names::NODE,
                info_names::PARTITION_GENERATION,
                info_names::SERVICES,
            ],
            inner.config.info_timeout,
        )
        .await
    };

    if node.is_dunned() || inner.shutdown.load(Ordering::Relaxed) {
        return;
    }

    let resp = match resp {
        Ok(resp) => resp,
        Err(e) => {
            debug!(node = %node.name(), error = %e, "health probe failed");
            node.dun(DunReason::InfoFail);
            node.set_tend_state(TendState::Failed);
            return;
        }
    };
    node.ok();
    node.set_tend_state(TendState::Healthy);

    if let Some(reported) = resp.node() {
        if reported != node.name() {
            warn!(
                node = %node.name(),
                reported,
                "node name changed, server was replaced"
            );
            node.dun(DunReason::BadName);
            node.set_tend_state(TendState::Failed);
            return;
        }
    }

    if let Some(generation) = resp.get_u32(info_names::PARTITION_GENERATION) {
        maybe_fetch_replicas(inner, node, addr, generation).await;
    }

    if inner.follow.load(Ordering::Relaxed) {
        if let Some(services) = resp.get(info_names::SERVICES) {
            process_services(inner, services);
        }
    }
}

/// Launches a replicas fetch when the generation moved and the per-node
/// fetch interval has elapsed. Better to run slightly stale than to hammer
/// the server on every generation bump.
async fn maybe_fetch_replicas(
    inner: &Arc<ClusterInner>,
    node: &Reservation<Node>,
    addr: SocketAddr,
    generation: u32,
) {
    if generation == node.partition_generation() {
        return;
    }
    let now = epoch_ms();
    let interval_ms =
        u64::try_from(inner.config.partition_max_interval.as_millis()).unwrap_or(u64::MAX);
    if node.partition_last_req_ms() + interval_ms > now {
        return;
    }
    info!(node = %node.name(), generation, "partition generation moved, fetching replicas");
    node.set_partition_last_req_ms(now);

    let resp = {
        let _fetch = node.shared().reserve("R");
        let _guard = inner.infos.guard();
        info::request(
            addr,
            &[
                info_names::REPLICAS_READ,
                info_names::REPLICAS_WRITE,
                info_names::PARTITION_GENERATION,
            ],
            inner.config.info_timeout,
        )
        .await
    };

    if node.is_dunned() || inner.shutdown.load(Ordering::Relaxed) {
        return;
    }

    match resp {
        Ok(resp) => {
            node.ok();
            apply_replicas(inner, node.shared(), &resp);
        }
        Err(e) => {
            debug!(node = %node.name(), error = %e, "replicas fetch failed");
            node.dun(DunReason::ReplicasFetch);
            node.set_tend_state(TendState::Failed);
        }
    }
}

/// Rebuilds the node's partition-table entries wholesale: drop everything
/// the node owned, then install the reported set.
fn apply_replicas(inner: &Arc<ClusterInner>, node: &Shared<Node>, resp: &InfoResponse) {
    counter!("strata_client_partition_rebuilds").increment(1);
    node.set_partition_last_req_ms(epoch_ms());

    let mut shared = inner.shared.lock();
    shared.partitions.remove_node(node);
    if let Some(value) = resp.get(info_names::REPLICAS_READ) {
        for (namespace, partition_id) in parse_replicas(value) {
            shared.partitions.set(namespace, partition_id, node, false);
        }
    }
    if let Some(value) = resp.get(info_names::REPLICAS_WRITE) {
        for (namespace, partition_id) in parse_replicas(value) {
            shared.partitions.set(namespace, partition_id, node, true);
        }
    }
    if let Some(generation) = resp.get_u32(info_names::PARTITION_GENERATION) {
        node.set_partition_generation(generation);
        debug!(node = %node.name(), generation, "partition table rebuilt");
    }
}

/// Feeds each services peer through the new-address path and records it as
/// a seed, so a cluster that later collapses to zero nodes can find the
/// peer again.
fn process_services(inner: &Arc<ClusterInner>, services: &str) {
    for peer in parse_services(services) {
        {
            let mut shared = inner.shared.lock();
            let host = peer.ip().to_string();
            if !shared
                .seeds
                .iter()
                .any(|(h, p)| *h == host && *p == peer.port())
            {
                shared.seeds.push((host, peer.port()));
            }
        }
        new_sockaddr(inner, peer);
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Injects a ready-made node into the cluster list, bypassing discovery.
    pub(crate) fn inject_node(cluster: &Cluster, node: &Shared<Node>) {
        let lease = node.reserve("L");
        let tend = tokio::spawn(run_node_tend(Arc::clone(&cluster.inner), lease));
        cluster.inner.shared.lock().nodes.push(NodeEntry {
            node: node.reserve("C"),
            tend,
        });
    }

    /// Installs a partition owner directly.
    pub(crate) fn set_partition(
        cluster: &Cluster,
        namespace: &str,
        partition_id: u32,
        node: &Shared<Node>,
        write: bool,
    ) {
        cluster
            .inner
            .shared
            .lock()
            .partitions
            .set(namespace, partition_id, node, write);
    }

    /// Installs the partition count, as a discovery response would.
    pub(crate) fn force_partition_count(cluster: &Cluster, count: u32) {
        set_partition_count(&cluster.inner, count);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
