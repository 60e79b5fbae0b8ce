//! Cluster configuration tunables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration recognized at cluster creation.
///
/// The defaults match the server deployment the client was tuned against;
/// `tend_interval` is deliberately longer than `connect_timeout` so a slow
/// dial cannot pile up tender passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    /// Follow `services` peer lists to discover the rest of the cluster.
    pub follow: bool,
    /// Interval between cluster tender passes.
    pub tend_interval: Duration,
    /// Interval between per-node health probes.
    pub node_tend_interval: Duration,
    /// Minimum spacing between partition-table fetches from one node.
    /// Better for clients to run slightly stale than to hammer the server.
    pub partition_max_interval: Duration,
    /// Dun accumulator value above which a node is latched unhealthy.
    pub dun_threshold: u32,
    /// Deadline for a single info exchange.
    pub info_timeout: Duration,
    /// Deadline for one TCP dial attempt.
    pub connect_timeout: Duration,
    /// Interval between periodic statistics log lines.
    pub stats_interval: Duration,
    /// Bounded wait for outstanding info exchanges during destroy.
    pub drain_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            follow: true,
            tend_interval: Duration::from_millis(1200),
            node_tend_interval: Duration::from_millis(1000),
            partition_max_interval: Duration::from_millis(5000),
            dun_threshold: 800,
            info_timeout: Duration::from_millis(3000),
            connect_timeout: Duration::from_millis(1000),
            stats_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClusterConfig::default();
        assert!(config.follow);
        assert_eq!(config.tend_interval, Duration::from_millis(1200));
        assert_eq!(config.node_tend_interval, Duration::from_millis(1000));
        assert_eq!(config.partition_max_interval, Duration::from_millis(5000));
        assert_eq!(config.dun_threshold, 800);
    }

    #[test]
    fn tend_interval_exceeds_connect_timeout() {
        let config = ClusterConfig::default();
        assert!(config.tend_interval > config.connect_timeout);
    }
}
