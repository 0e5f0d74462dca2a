//! Remote side of the anti-entropy walk
//!
//! The synchronizer talks to a replica through [`SyncPeer`]; transport
//! is a collaborator concern. [`LocalPeer`] adapts an in-process map,
//! which serves in-process replica pairs and the test suite.

use crate::synchronizer::SyncError;
use async_trait::async_trait;
use keygrid_common::PartitionId;
use keygrid_store::{GridMap, LeafEntry};
use std::sync::Arc;

/// A replica's view of one partition's digest tree
#[async_trait]
pub trait SyncPeer: Send + Sync {
    /// Digest tree depth on the peer; both sides must agree
    async fn tree_depth(&self) -> Result<u32, SyncError>;

    /// Digest of one tree node (heap index)
    async fn node_digest(&self, partition: PartitionId, node: usize) -> Result<u64, SyncError>;

    /// Entries of one leaf bucket
    async fn leaf_entries(
        &self,
        partition: PartitionId,
        bucket: usize,
    ) -> Result<Vec<LeafEntry>, SyncError>;
}

/// Peer adapter over an in-process map
pub struct LocalPeer {
    map: Arc<GridMap>,
}

impl LocalPeer {
    /// Wrap a map as the remote side of a walk
    #[must_use]
    pub fn new(map: Arc<GridMap>) -> Self {
        Self { map }
    }
}

#[async_trait]
impl SyncPeer for LocalPeer {
    async fn tree_depth(&self) -> Result<u32, SyncError> {
        Ok(self.map.tree_depth())
    }

    async fn node_digest(&self, partition: PartitionId, node: usize) -> Result<u64, SyncError> {
        self.map
            .digest_node(partition, node)
            .map_err(|e| SyncError::PeerUnreachable(e.to_string()))?
            .ok_or(SyncError::UnknownNode(node))
    }

    async fn leaf_entries(
        &self,
        partition: PartitionId,
        bucket: usize,
    ) -> Result<Vec<LeafEntry>, SyncError> {
        self.map
            .leaf_entries(partition, bucket)
            .map_err(|e| SyncError::PeerUnreachable(e.to_string()))
    }
}
