//! Lock-step digest tree comparison and repair
//!
//! The walk starts at the root: a digest match prunes the subtree, a
//! mismatch descends into both children, and a mismatched leaf marks
//! its bucket for repair. Repairs reapply the authoritative value
//! through the map's normal mutation path, so they are idempotent and
//! flow through events and persistence like any other write.

use crate::peer::SyncPeer;
use keygrid_common::{PartitionId, entry_digest};
use keygrid_store::{GridMap, LeafEntry};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Errors of an anti-entropy run
///
/// An errored run leaves repairs already applied in place; they are
/// idempotent and the next run picks up where this one stopped.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("digest tree depth mismatch: local {local}, peer {peer}")]
    DepthMismatch { local: u32, peer: u32 },

    #[error("sync aborted: {0}")]
    Aborted(String),

    #[error("no such tree node: {0}")]
    UnknownNode(usize),
}

/// Which side wins when a leaf entry differs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RepairPolicy {
    /// The higher per-key version wins; ties break on the entry digest
    /// so both replicas pick the same winner
    #[default]
    HigherVersionWins,
    /// Local entries stand; divergent peer entries are left for the
    /// peer's own run to resolve
    LocalWins,
    /// The peer's entries replace local ones, and local-only keys are
    /// removed
    RemoteWins,
}

/// Outcome of one anti-entropy run
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// True when the root digests matched or every divergence was repaired
    pub consistent: bool,
    /// Tree nodes compared against the peer
    pub nodes_compared: u64,
    /// Leaf buckets found divergent
    pub leaves_diverged: u64,
    /// Entries repaired locally
    pub entries_repaired: u64,
    /// Peer exchanges performed
    pub round_trips: u64,
}

/// Anti-entropy driver for one map
pub struct Synchronizer {
    map: Arc<GridMap>,
    policy: RepairPolicy,
}

impl Synchronizer {
    /// Create a synchronizer with the given repair policy
    #[must_use]
    pub fn new(map: Arc<GridMap>, policy: RepairPolicy) -> Self {
        Self { map, policy }
    }

    /// Compare one partition against a peer and repair divergence
    pub async fn run(
        &self,
        partition: PartitionId,
        peer: &dyn SyncPeer,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();

        let peer_depth = peer.tree_depth().await?;
        report.round_trips += 1;
        let local_depth = self.map.tree_depth();
        if peer_depth != local_depth {
            return Err(SyncError::DepthMismatch {
                local: local_depth,
                peer: peer_depth,
            });
        }

        let leaf_count: usize = 1 << (local_depth - 1);
        let first_leaf = leaf_count - 1;

        // Top-down lock-step walk; only mismatched branches survive.
        let mut stack = vec![0usize];
        let mut diverged: Vec<usize> = Vec::new();
        while let Some(node) = stack.pop() {
            let local = self
                .map
                .digest_node(partition, node)
                .map_err(|e| SyncError::Aborted(e.to_string()))?
                .ok_or(SyncError::UnknownNode(node))?;
            let remote = peer.node_digest(partition, node).await?;
            report.round_trips += 1;
            report.nodes_compared += 1;

            if local == remote {
                continue;
            }
            if node >= first_leaf {
                diverged.push(node - first_leaf);
            } else {
                stack.push(2 * node + 1);
                stack.push(2 * node + 2);
            }
        }

        report.leaves_diverged = diverged.len() as u64;
        if diverged.is_empty() {
            report.consistent = true;
            debug!("Partition {} consistent with peer", partition);
            return Ok(report);
        }

        for bucket in diverged {
            let repaired = self.repair_leaf(partition, bucket, peer).await?;
            report.round_trips += 1;
            report.entries_repaired += repaired;
        }

        report.consistent = true;
        info!(
            "Repaired partition {}: {} leaves diverged, {} entries applied",
            partition, report.leaves_diverged, report.entries_repaired
        );
        Ok(report)
    }

    async fn repair_leaf(
        &self,
        partition: PartitionId,
        bucket: usize,
        peer: &dyn SyncPeer,
    ) -> Result<u64, SyncError> {
        let remote = peer.leaf_entries(partition, bucket).await?;
        let local = self
            .map
            .leaf_entries(partition, bucket)
            .map_err(|e| SyncError::Aborted(e.to_string()))?;
        let local_by_key: HashMap<_, _> = local
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();

        let mut repaired = 0u64;
        match self.policy {
            RepairPolicy::LocalWins => {}
            RepairPolicy::HigherVersionWins => {
                for entry in remote {
                    if remote_wins_tie_broken(local_by_key.get(&entry.key), &entry) {
                        self.apply(entry).await?;
                        repaired += 1;
                    }
                }
                // Local-only keys stand; the peer's own run pulls them.
            }
            RepairPolicy::RemoteWins => {
                let mut remote_keys = HashMap::new();
                for entry in remote {
                    let _ = remote_keys.insert(entry.key.clone(), ());
                    let differs = local_by_key
                        .get(&entry.key)
                        .is_none_or(|local| local.value != entry.value);
                    if differs {
                        self.apply(entry).await?;
                        repaired += 1;
                    }
                }
                for key in local_by_key.into_keys() {
                    if !remote_keys.contains_key(&key) {
                        self.map
                            .apply_repair_remove(key)
                            .await
                            .map_err(|e| SyncError::Aborted(e.to_string()))?;
                        repaired += 1;
                    }
                }
            }
        }
        Ok(repaired)
    }

    async fn apply(&self, entry: LeafEntry) -> Result<(), SyncError> {
        self.map
            .apply_repair(entry.key, entry.value, entry.expires_at)
            .await
            .map_err(|e| SyncError::Aborted(e.to_string()))
    }
}

/// Decide whether a remote entry beats the local one
///
/// Versions are assigned per replica, so a pure version comparison can
/// tie with different values; the digest tie-break makes both replicas
/// pick the same winner and converge.
fn remote_wins_tie_broken(local: Option<&LeafEntry>, remote: &LeafEntry) -> bool {
    let Some(local) = local else {
        return true;
    };
    if local.value == remote.value {
        return false;
    }
    if remote.version != local.version {
        return remote.version > local.version;
    }
    entry_digest(&remote.key, &remote.value) > entry_digest(&local.key, &local.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::LocalPeer;
    use async_trait::async_trait;
    use keygrid_common::{DigestTreeConfig, GridMapConfig, MapName, Value};
    use parking_lot::Mutex;

    fn map() -> Arc<GridMap> {
        let config = GridMapConfig {
            partition_count: 1,
            digest_tree: DigestTreeConfig { depth: 5 },
            expiry_sweep_interval_ms: 60_000,
            ..GridMapConfig::default()
        };
        Arc::new(GridMap::new(MapName::new_unchecked("replica"), config).unwrap())
    }

    const P: PartitionId = PartitionId(0);

    async fn seed(map: &GridMap, n: usize) {
        for i in 0..n {
            map.set(format!("key-{i}"), format!("value-{i}")).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_identical_replicas_stop_at_root() {
        let a = map();
        let b = map();
        seed(&a, 32).await;
        seed(&b, 32).await;

        let sync = Synchronizer::new(a, RepairPolicy::HigherVersionWins);
        let report = sync.run(P, &LocalPeer::new(b)).await.unwrap();

        assert!(report.consistent);
        assert_eq!(report.nodes_compared, 1);
        assert_eq!(report.leaves_diverged, 0);
        assert_eq!(report.entries_repaired, 0);
    }

    #[tokio::test]
    async fn test_empty_replica_pulls_everything() {
        let source = map();
        let target = map();
        seed(&source, 24).await;

        let sync = Synchronizer::new(Arc::clone(&target), RepairPolicy::HigherVersionWins);
        let report = sync.run(P, &LocalPeer::new(Arc::clone(&source))).await.unwrap();

        assert!(report.consistent);
        assert_eq!(report.entries_repaired, 24);
        assert_eq!(target.len(), 24);
        assert_eq!(
            target.get("key-7").await.unwrap(),
            Some(Value::from("value-7"))
        );

        // A second run finds nothing left to do.
        let report = sync.run(P, &LocalPeer::new(source)).await.unwrap();
        assert_eq!(report.nodes_compared, 1);
        assert!(report.consistent);
    }

    #[tokio::test]
    async fn test_single_divergence_narrows_to_one_leaf() {
        let a = map();
        let b = map();
        seed(&a, 64).await;
        seed(&b, 64).await;

        // One extra mutation on the peer; its version is now ahead.
        b.set("key-13", "value-13-updated").await.unwrap();

        let sync = Synchronizer::new(Arc::clone(&a), RepairPolicy::HigherVersionWins);
        let report = sync.run(P, &LocalPeer::new(b)).await.unwrap();

        assert!(report.consistent);
        assert_eq!(report.leaves_diverged, 1);
        assert_eq!(report.entries_repaired, 1);
        // depth 5: root + 2 per inner level + 2 leaves at most
        assert!(report.nodes_compared <= 9);
        assert_eq!(
            a.get("key-13").await.unwrap(),
            Some(Value::from("value-13-updated"))
        );
    }

    #[tokio::test]
    async fn test_local_wins_leaves_divergence_alone() {
        let a = map();
        let b = map();
        seed(&a, 8).await;
        seed(&b, 8).await;
        b.set("key-3", "changed").await.unwrap();

        let sync = Synchronizer::new(Arc::clone(&a), RepairPolicy::LocalWins);
        let report = sync.run(P, &LocalPeer::new(b)).await.unwrap();

        assert_eq!(report.entries_repaired, 0);
        assert_eq!(a.get("key-3").await.unwrap(), Some(Value::from("value-3")));
    }

    #[tokio::test]
    async fn test_remote_wins_removes_local_only_keys() {
        let a = map();
        let b = map();
        seed(&a, 8).await;
        seed(&b, 8).await;
        a.set("local-extra", "x").await.unwrap();
        b.set("key-2", "authoritative").await.unwrap();

        let sync = Synchronizer::new(Arc::clone(&a), RepairPolicy::RemoteWins);
        let report = sync.run(P, &LocalPeer::new(Arc::clone(&b))).await.unwrap();

        assert!(report.entries_repaired >= 2);
        assert_eq!(a.get("local-extra").await.unwrap(), None);
        assert_eq!(
            a.get("key-2").await.unwrap(),
            Some(Value::from("authoritative"))
        );
        assert_eq!(a.digest_root(P).unwrap(), b.digest_root(P).unwrap());
    }

    #[tokio::test]
    async fn test_depth_mismatch_rejected() {
        let a = map();
        let deep = Arc::new(
            GridMap::new(
                MapName::new_unchecked("replica"),
                GridMapConfig {
                    partition_count: 1,
                    digest_tree: DigestTreeConfig { depth: 7 },
                    ..GridMapConfig::default()
                },
            )
            .unwrap(),
        );

        let sync = Synchronizer::new(a, RepairPolicy::HigherVersionWins);
        let err = sync.run(P, &LocalPeer::new(deep)).await.unwrap_err();
        assert!(matches!(err, SyncError::DepthMismatch { local: 5, peer: 7 }));
    }

    /// Fails every call after the first `budget` leaf fetches.
    struct FlakyPeer {
        inner: LocalPeer,
        leaf_budget: Mutex<u32>,
    }

    #[async_trait]
    impl SyncPeer for FlakyPeer {
        async fn tree_depth(&self) -> Result<u32, SyncError> {
            self.inner.tree_depth().await
        }

        async fn node_digest(&self, partition: PartitionId, node: usize) -> Result<u64, SyncError> {
            self.inner.node_digest(partition, node).await
        }

        async fn leaf_entries(
            &self,
            partition: PartitionId,
            bucket: usize,
        ) -> Result<Vec<LeafEntry>, SyncError> {
            {
                let mut budget = self.leaf_budget.lock();
                if *budget == 0 {
                    return Err(SyncError::PeerUnreachable("connection reset".into()));
                }
                *budget -= 1;
            }
            self.inner.leaf_entries(partition, bucket).await
        }
    }

    #[tokio::test]
    async fn test_peer_failure_mid_walk_keeps_partial_repairs() {
        let source = map();
        let target = map();
        // Enough entries to spread over several leaves.
        seed(&source, 64).await;

        let peer = FlakyPeer {
            inner: LocalPeer::new(Arc::clone(&source)),
            leaf_budget: Mutex::new(1),
        };
        let sync = Synchronizer::new(Arc::clone(&target), RepairPolicy::HigherVersionWins);
        let err = sync.run(P, &peer).await.unwrap_err();
        assert!(matches!(err, SyncError::PeerUnreachable(_)));

        // The leaf repaired before the failure stands.
        let repaired = target.len();
        assert!(repaired > 0);
        assert!(repaired < 64);

        // A healthy retry finishes the job.
        let report = sync
            .run(P, &LocalPeer::new(source))
            .await
            .unwrap();
        assert!(report.consistent);
        assert_eq!(target.len(), 64);
    }

    #[tokio::test]
    async fn test_destroyed_map_aborts_run() {
        let a = map();
        let b = map();
        seed(&b, 4).await;
        a.destroy().await;

        let sync = Synchronizer::new(a, RepairPolicy::HigherVersionWins);
        let err = sync.run(P, &LocalPeer::new(b)).await.unwrap_err();
        assert!(matches!(err, SyncError::Aborted(_)));
    }
}
