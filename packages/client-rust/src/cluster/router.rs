//! Per-key routing.
//!
//! The routing primitive: `(namespace, digest, direction)` to a transaction
//! lease on the node that owns the key's partition, falling back to a
//! round-robin walk of the live node list when ownership is unknown or the
//! owner is unhealthy. Stale routing is tolerated; it self-heals on the
//! next partition-table rebuild.

use std::sync::atomic::Ordering;

use strata_core::{digest_to_partition, Digest};
use tracing::debug;

use super::handle::Reservation;
use super::node::Node;
use super::Cluster;

impl Cluster {
    /// Returns a node on which an operation for `(namespace, digest)` may
    /// be issued, or `None` when no live node exists (the caller should
    /// park the request).
    ///
    /// Prefers the partition-table owner in the requested direction; a
    /// dunned owner is released and the round-robin fallback used instead.
    #[must_use]
    pub fn get_node_for(
        &self,
        namespace: &str,
        digest: &Digest,
        write: bool,
    ) -> Option<Reservation<Node>> {
        let partition_count = self.inner.n_partitions.load(Ordering::Acquire);
        if partition_count > 0 {
            let partition_id = digest_to_partition(digest, partition_count);
            let owner = self
                .inner
                .shared
                .lock()
                .partitions
                .get(namespace, partition_id, write);
            if let Some(owner) = owner {
                if owner.is_dunned() {
                    debug!(node = %owner.name(), "partition owner is dunned, falling back");
                    // dropping the lease releases it
                } else {
                    return Some(owner);
                }
            }
        }
        self.random_node()
    }

    /// Walks the node list from the round-robin cursor and leases the first
    /// node that is not dunned.
    #[must_use]
    pub fn random_node(&self) -> Option<Reservation<Node>> {
        let shared = self.inner.shared.lock();
        let len = shared.nodes.len();
        if len == 0 {
            debug!("no nodes in cluster");
            return None;
        }
        let start = self.inner.cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..len {
            let entry = &shared.nodes[(start + i) % len];
            if !entry.node.is_dunned() {
                return Some(entry.node.shared().reserve("T"));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::test_support::{force_partition_count, inject_node, set_partition};
    use super::super::{DunReason, Shared};
    use super::*;
    use crate::config::ClusterConfig;
    use crate::resolver::SystemResolver;

    fn idle_config() -> ClusterConfig {
        // Long intervals so background tending stays out of the way.
        ClusterConfig {
            tend_interval: std::time::Duration::from_secs(3600),
            node_tend_interval: std::time::Duration::from_secs(3600),
            ..ClusterConfig::default()
        }
    }

    fn make_node(name: &str) -> Shared<Node> {
        let node = Shared::new(Node::new(name, Arc::new(idle_config())));
        node.add_address(std::net::SocketAddr::from(([127, 0, 0, 1], 1)));
        node
    }

    fn digest_with_prefix(b0: u8, b1: u8) -> Digest {
        let mut bytes = [0u8; strata_core::DIGEST_LEN];
        bytes[0] = b0;
        bytes[1] = b1;
        Digest::new(bytes)
    }

    #[tokio::test]
    async fn empty_cluster_routes_to_none() {
        let cluster = Cluster::new(idle_config(), SystemResolver);
        assert!(cluster
            .get_node_for("ns1", &digest_with_prefix(0, 0), false)
            .is_none());
        assert!(cluster.random_node().is_none());
        cluster.close(0).await;
    }

    #[tokio::test]
    async fn partition_owner_preferred() {
        let cluster = Cluster::new(idle_config(), SystemResolver);
        let a = make_node("A");
        let b = make_node("B");
        inject_node(&cluster, &a);
        inject_node(&cluster, &b);
        force_partition_count(&cluster, 4096);
        set_partition(&cluster, "ns1", 0, &a, true);
        set_partition(&cluster, "ns1", 0, &b, false);

        // Digest prefix 0x0000 -> partition 0.
        let writer = cluster
            .get_node_for("ns1", &digest_with_prefix(0, 0), true)
            .unwrap();
        assert_eq!(writer.name(), "A");
        let reader = cluster
            .get_node_for("ns1", &digest_with_prefix(0, 0), false)
            .unwrap();
        assert_eq!(reader.name(), "B");
        cluster.close(0).await;
    }

    #[tokio::test]
    async fn unmapped_partition_falls_back_to_live_node() {
        let cluster = Cluster::new(idle_config(), SystemResolver);
        let a = make_node("A");
        inject_node(&cluster, &a);
        force_partition_count(&cluster, 4096);
        set_partition(&cluster, "ns1", 0, &a, true);

        // Partition 2 has no owner; fallback still lands on A.
        let node = cluster
            .get_node_for("ns1", &digest_with_prefix(0, 2), true)
            .unwrap();
        assert_eq!(node.name(), "A");
        cluster.close(0).await;
    }

    #[tokio::test]
    async fn dunned_owner_released_and_fallback_used() {
        let cluster = Cluster::new(idle_config(), SystemResolver);
        let a = make_node("A");
        let b = make_node("B");
        inject_node(&cluster, &a);
        inject_node(&cluster, &b);
        force_partition_count(&cluster, 4096);
        set_partition(&cluster, "ns1", 0, &a, true);

        a.dun(DunReason::NoAddress);
        let live_before = a.live();

        let node = cluster
            .get_node_for("ns1", &digest_with_prefix(0, 0), true)
            .unwrap();
        assert_eq!(node.name(), "B", "dunned owner skipped");
        assert_eq!(a.live(), live_before, "owner lease released on fallback");
        cluster.close(0).await;
    }

    #[tokio::test]
    async fn round_robin_cycles_live_nodes() {
        let cluster = Cluster::new(idle_config(), SystemResolver);
        let a = make_node("A");
        let b = make_node("B");
        let c = make_node("C");
        inject_node(&cluster, &a);
        inject_node(&cluster, &b);
        inject_node(&cluster, &c);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            seen.insert(cluster.random_node().unwrap().name().to_string());
        }
        assert_eq!(seen.len(), 3, "cursor visits every node in one cycle");
        cluster.close(0).await;
    }

    #[tokio::test]
    async fn all_dunned_routes_to_none() {
        let cluster = Cluster::new(idle_config(), SystemResolver);
        let a = make_node("A");
        inject_node(&cluster, &a);
        a.dun(DunReason::NoAddress);
        assert!(cluster.random_node().is_none());
        cluster.close(0).await;
    }
}
