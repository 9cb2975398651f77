//! C5: the cluster's current topology, shared as an atomically-swapped
//! immutable snapshot (spec §3 "Cluster map", §9 "Atomically-swapped
//! immutable snapshot").

use std::sync::Arc;

use arc_swap::ArcSwap;
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ServerCapabilities: u32 {
        const ENHANCED_ERRORS    = 0x0001;
        const DURABLE_WRITE      = 0x0002;
        const MUTATION_TOKENS    = 0x0004;
        const CREATE_AS_DELETED  = 0x0008;
    }
}

/// One data or query node, as addressed by every service it may expose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub host: String,
    pub kv_port: u16,
    pub query_port: Option<u16>,
    pub search_port: Option<u16>,
    pub analytics_port: Option<u16>,
    pub views_port: Option<u16>,
}

/// `[owner, replica1, replica2, ...]`, indices into `ClusterMap::nodes`.
pub type PartitionOwners = Vec<usize>;

/// An immutable view of the cluster at one revision. A new snapshot replaces
/// the old one wholesale; there is no in-place mutation (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMap {
    pub revision: u64,
    pub bucket: String,
    pub nodes: Vec<Node>,
    pub partition_count: u16,
    pub partitions: Vec<PartitionOwners>,
    pub capabilities: ServerCapabilities,
}

impl ClusterMap {
    pub fn empty(bucket: impl Into<String>) -> Self {
        Self {
            revision: 0,
            bucket: bucket.into(),
            nodes: Vec::new(),
            partition_count: 0,
            partitions: Vec::new(),
            capabilities: ServerCapabilities::empty(),
        }
    }

    /// Node index owning (or holding a replica of) `partition`, or `None`
    /// if the partition or replica index is out of range.
    pub fn node_for(&self, partition: u16, replica_index: usize) -> Option<usize> {
        self.partitions
            .get(partition as usize)
            .and_then(|owners| owners.get(replica_index))
            .copied()
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }
}

/// Shared, lock-free handle to the current `ClusterMap` (spec §4.5, §5
/// "Cluster map: read-mostly, single atomic pointer").
#[derive(Clone)]
pub struct SharedClusterMap {
    inner: Arc<ArcSwap<ClusterMap>>,
}

impl SharedClusterMap {
    pub fn new(initial: ClusterMap) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    pub fn load(&self) -> Arc<ClusterMap> {
        self.inner.load_full()
    }

    /// Replaces the snapshot only if `new.revision` is strictly newer,
    /// compare-and-swap keyed on revision (spec §4.5, §5). Returns whether
    /// the swap happened.
    pub fn apply(&self, new: ClusterMap) -> bool {
        loop {
            let current = self.inner.load_full();
            if new.revision <= current.revision {
                return false;
            }
            let new_arc = Arc::new(new.clone());
            let previous = self.inner.compare_and_swap(&current, Arc::clone(&new_arc));
            if Arc::ptr_eq(&*previous, &current) {
                return true;
            }
            // Lost the race to a concurrent writer; retry against whatever
            // is current now.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with_revision(rev: u64) -> ClusterMap {
        ClusterMap {
            revision: rev,
            bucket: "default".into(),
            nodes: vec![Node {
                host: "127.0.0.1".into(),
                kv_port: 11210,
                query_port: None,
                search_port: None,
                analytics_port: None,
                views_port: None,
            }],
            partition_count: 1,
            partitions: vec![vec![0]],
            capabilities: ServerCapabilities::empty(),
        }
    }

    #[test]
    fn apply_rejects_non_increasing_revision() {
        let shared = SharedClusterMap::new(map_with_revision(5));
        assert!(!shared.apply(map_with_revision(5)));
        assert!(!shared.apply(map_with_revision(3)));
        assert_eq!(shared.load().revision, 5);
    }

    #[test]
    fn apply_accepts_newer_revision() {
        let shared = SharedClusterMap::new(map_with_revision(5));
        assert!(shared.apply(map_with_revision(6)));
        assert_eq!(shared.load().revision, 6);
    }

    #[test]
    fn node_for_resolves_replica_index() {
        let map = ClusterMap {
            partitions: vec![vec![0, 1]],
            ..map_with_revision(1)
        };
        assert_eq!(map.node_for(0, 0), Some(0));
        assert_eq!(map.node_for(0, 1), Some(1));
        assert_eq!(map.node_for(0, 2), None);
        assert_eq!(map.node_for(1, 0), None);
    }
}
