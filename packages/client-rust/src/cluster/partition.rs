//! The partition ownership table.
//!
//! Maps (namespace, partition id) to its current read owner and write owner.
//! Namespaces appear lazily; each namespace owns a fixed-size slot array of
//! the cluster's partition count. The table is best-effort wire data:
//! invalid entries are dropped with a warning rather than propagated as
//! errors, because stale or partial routing self-heals on the next tend
//! pass.

use std::collections::HashMap;

use strata_core::MAX_NAMESPACE_LEN;
use tracing::warn;

use super::handle::{Reservation, Shared};
use super::node::Node;

/// One partition's owners, one per direction.
#[derive(Debug, Default)]
pub struct PartitionSlot {
    read: Option<Reservation<Node>>,
    write: Option<Reservation<Node>>,
}

impl PartitionSlot {
    fn cell(&self, write: bool) -> &Option<Reservation<Node>> {
        if write {
            &self.write
        } else {
            &self.read
        }
    }

    fn cell_mut(&mut self, write: bool) -> &mut Option<Reservation<Node>> {
        if write {
            &mut self.write
        } else {
            &mut self.read
        }
    }
}

/// Namespace × partition-id → owning node, for reads and writes.
#[derive(Debug, Default)]
pub struct PartitionTable {
    namespaces: HashMap<String, Vec<PartitionSlot>>,
    partition_count: u32,
}

impl PartitionTable {
    /// Creates an empty table. The partition count is zero (unknown) until
    /// [`set_partition_count`](Self::set_partition_count) learns it.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The cluster partition count, or zero if not yet learned.
    #[must_use]
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Fixes the partition count. Set once; later calls with a different
    /// value are rejected with a warning.
    pub fn set_partition_count(&mut self, count: u32) {
        if self.partition_count != 0 {
            if self.partition_count != count {
                warn!(
                    current = self.partition_count,
                    proposed = count,
                    "refusing to change partition count"
                );
            }
            return;
        }
        self.partition_count = count;
    }

    /// Installs `node` as the owner of `(namespace, partition_id)` in the
    /// given direction, replacing (and releasing) any prior owner.
    ///
    /// Out-of-range partition ids and over-long namespaces are dropped with
    /// a warning; partition data is best-effort.
    pub fn set(&mut self, namespace: &str, partition_id: u32, node: &Shared<Node>, write: bool) {
        if namespace.len() > MAX_NAMESPACE_LEN {
            warn!(
                namespace_len = namespace.len(),
                "dropping partition entry: namespace too long"
            );
            return;
        }
        if self.partition_count == 0 || partition_id >= self.partition_count {
            warn!(
                partition_id,
                partition_count = self.partition_count,
                "dropping partition entry: partition id out of range"
            );
            return;
        }

        let count = self.partition_count as usize;
        let slots = self
            .namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| {
                let mut slots = Vec::with_capacity(count);
                slots.resize_with(count, PartitionSlot::default);
                slots
            });

        let tag = if write { "PW" } else { "PR" };
        slots[partition_id as usize]
            .cell_mut(write)
            .replace(node.reserve(tag));
    }

    /// Returns a fresh transaction lease on the current owner, or `None`.
    #[must_use]
    pub fn get(
        &self,
        namespace: &str,
        partition_id: u32,
        write: bool,
    ) -> Option<Reservation<Node>> {
        self.namespaces
            .get(namespace)?
            .get(partition_id as usize)?
            .cell(write)
            .as_ref()
            .map(|owner| owner.shared().reserve("T"))
    }

    /// Clears every cell owned by `node`, releasing each reservation.
    /// Called when a node is dunned out of the cluster and before a node's
    /// ownerships are rebuilt from a fresh replicas response.
    pub fn remove_node(&mut self, node: &Shared<Node>) {
        for slots in self.namespaces.values_mut() {
            for slot in slots.iter_mut() {
                for write in [false, true] {
                    let cell = slot.cell_mut(write);
                    if cell
                        .as_ref()
                        .is_some_and(|owner| owner.shared().ptr_eq(node))
                    {
                        *cell = None;
                    }
                }
            }
        }
    }

    /// Drops every entry. The partition count is kept.
    pub fn clear(&mut self) {
        self.namespaces.clear();
    }

    /// Number of cells currently owned by `node` (diagnostics and tests).
    #[must_use]
    pub fn owned_cells(&self, node: &Shared<Node>) -> usize {
        self.namespaces
            .values()
            .flatten()
            .flat_map(|slot| [slot.cell(false), slot.cell(true)])
            .filter(|cell| {
                cell.as_ref()
                    .is_some_and(|owner| owner.shared().ptr_eq(node))
            })
            .count()
    }
}
