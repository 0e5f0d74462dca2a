//! Order-independent digest tree over partition contents
//!
//! The tree is a perfect binary tree of configurable depth, stored as a
//! heap array. Leaves cover key-hash buckets; a leaf digest is the XOR of
//! the digests of the entries hashed into its bucket, so bucket contents
//! alone determine it and insertion order never does. Internal digests
//! are derived from their children, recomputed lazily: mutations mark
//! the ancestor path stale and reads refresh it.
//!
//! Two partitions holding identical entry sets produce identical digests
//! at every node of equally-parameterized trees.

use crate::config::DigestTreeConfig;
use crate::types::{Key, Value};
use xxhash_rust::xxh64::xxh64;

/// Seed for hashing keys into leaf buckets, distinct from the partition
/// router's seed so the two placements stay uncorrelated.
const BUCKET_SEED: u64 = 0x6b67_6275_636b_6574; // "kgbucket"

/// Digest of one entry, folded into its leaf bucket by XOR.
///
/// The material is length-prefixed so that `(key, value)` pairs never
/// alias across different splits of the same byte stream. Versions are
/// deliberately excluded: replicas assign them independently, and two
/// replicas holding the same data must digest identically.
#[must_use]
pub fn entry_digest(key: &Key, value: &Value) -> u64 {
    let mut material = Vec::with_capacity(8 + key.len() + 8 + value.len());
    material.extend_from_slice(&(key.len() as u64).to_le_bytes());
    material.extend_from_slice(key.as_bytes());
    material.extend_from_slice(&(value.len() as u64).to_le_bytes());
    material.extend_from_slice(value.as_bytes());
    xxh64(&material, 0)
}

/// Combine two child digests into their parent digest
fn combine(left: u64, right: u64) -> u64 {
    let mut material = [0u8; 16];
    material[..8].copy_from_slice(&left.to_le_bytes());
    material[8..].copy_from_slice(&right.to_le_bytes());
    xxh64(&material, 0)
}

/// Order-independent digest tree for one map partition
///
/// Node indices follow heap layout: the root is node 0, the children of
/// node `i` are `2i + 1` and `2i + 2`, and the `2^(depth-1)` leaves
/// occupy the last level. Peers comparing trees must use identical
/// parameters.
#[derive(Clone, Debug)]
pub struct DigestTree {
    depth: u32,
    /// Leaf digests, indexed by bucket
    leaves: Vec<u64>,
    /// Internal node digests, heap indices `0..leaf_count - 1`
    nodes: Vec<u64>,
    /// Staleness flags for internal nodes
    stale: Vec<bool>,
}

impl DigestTree {
    /// Create an empty tree with the given parameters
    #[must_use]
    pub fn new(config: DigestTreeConfig) -> Self {
        let leaf_count = config.leaf_count();
        Self {
            depth: config.depth,
            leaves: vec![0; leaf_count],
            nodes: vec![0; leaf_count - 1],
            stale: vec![false; leaf_count - 1],
        }
    }

    /// Tree depth, root included
    #[must_use]
    pub const fn depth(&self) -> u32 {
        self.depth
    }

    /// Number of leaf buckets
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Total number of nodes in heap layout
    #[must_use]
    pub fn node_count(&self) -> usize {
        2 * self.leaves.len() - 1
    }

    /// Leaf bucket a key hashes into
    #[must_use]
    pub fn bucket_of(&self, key: &Key) -> usize {
        (xxh64(key.as_bytes(), BUCKET_SEED) % self.leaves.len() as u64) as usize
    }

    /// Fold an entry-digest transition into a leaf bucket
    ///
    /// Pass `0` for `old` when the entry is being created and `0` for
    /// `new` when it is being removed. Ancestors of the leaf are marked
    /// stale and recomputed on the next read.
    pub fn update(&mut self, bucket: usize, old: u64, new: u64) {
        if old == new {
            return;
        }
        self.leaves[bucket] ^= old ^ new;

        let mut node = self.node_index_of_leaf(bucket);
        while node != 0 {
            node = (node - 1) / 2;
            if self.stale[node] {
                // The rest of the path is already marked.
                break;
            }
            self.stale[node] = true;
        }
    }

    /// Heap index of a leaf bucket
    #[must_use]
    pub fn node_index_of_leaf(&self, bucket: usize) -> usize {
        self.leaves.len() - 1 + bucket
    }

    /// Leaf bucket of a heap index, if it addresses a leaf
    #[must_use]
    pub fn leaf_bucket(&self, node: usize) -> Option<usize> {
        let first_leaf = self.leaves.len() - 1;
        (node >= first_leaf && node < self.node_count()).then(|| node - first_leaf)
    }

    /// Check whether a heap index addresses a leaf
    #[must_use]
    pub fn is_leaf(&self, node: usize) -> bool {
        self.leaf_bucket(node).is_some()
    }

    /// Children of an internal node
    #[must_use]
    pub fn children(&self, node: usize) -> Option<(usize, usize)> {
        (node < self.leaves.len() - 1).then(|| (2 * node + 1, 2 * node + 2))
    }

    /// Digest of the node at the given heap index
    pub fn node(&mut self, node: usize) -> Option<u64> {
        if node >= self.node_count() {
            return None;
        }
        Some(self.refresh(node))
    }

    /// Root digest of the tree
    pub fn root(&mut self) -> u64 {
        self.refresh(0)
    }

    /// Clear all digests
    pub fn reset(&mut self) {
        self.leaves.fill(0);
        self.nodes.fill(0);
        self.stale.fill(false);
    }

    /// Rebuild leaf digests from scratch
    pub fn rebuild(&mut self, entries: impl IntoIterator<Item = (usize, u64)>) {
        self.reset();
        for (bucket, digest) in entries {
            self.update(bucket, 0, digest);
        }
    }

    fn refresh(&mut self, node: usize) -> u64 {
        if let Some(bucket) = self.leaf_bucket(node) {
            return self.leaves[bucket];
        }
        if self.stale[node] {
            let left = self.refresh(2 * node + 1);
            let right = self.refresh(2 * node + 2);
            self.nodes[node] = combine(left, right);
            self.stale[node] = false;
        }
        self.nodes[node]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(depth: u32) -> DigestTree {
        DigestTree::new(DigestTreeConfig { depth })
    }

    fn digests(entries: &[(&str, &str)]) -> Vec<(Key, u64)> {
        entries
            .iter()
            .map(|(k, v)| {
                let key = Key::from(*k);
                let digest = entry_digest(&key, &Value::from(*v));
                (key, digest)
            })
            .collect()
    }

    #[test]
    fn test_digest_order_independent() {
        let entries = digests(&[("A", "1"), ("B", "2"), ("C", "3")]);

        let mut forward = tree(4);
        for (key, digest) in &entries {
            let bucket = forward.bucket_of(key);
            forward.update(bucket, 0, *digest);
        }

        let mut reverse = tree(4);
        for (key, digest) in entries.iter().rev() {
            let bucket = reverse.bucket_of(key);
            reverse.update(bucket, 0, *digest);
        }

        assert_eq!(forward.root(), reverse.root());
        for node in 0..forward.node_count() {
            assert_eq!(forward.node(node), reverse.node(node));
        }
    }

    #[test]
    fn test_identical_contents_identical_digests() {
        let entries = digests(&[("France", "Paris"), ("Germany", "Berlin")]);

        let mut a = tree(6);
        let mut b = tree(6);
        for (key, digest) in &entries {
            a.update(a.bucket_of(key), 0, *digest);
            b.update(b.bucket_of(key), 0, *digest);
        }
        assert_eq!(a.root(), b.root());
    }

    #[test]
    fn test_single_difference_flips_only_one_path() {
        let entries = digests(&[("A", "1"), ("B", "2"), ("C", "3"), ("D", "4")]);

        let mut a = tree(5);
        let mut b = tree(5);
        for (key, digest) in &entries {
            a.update(a.bucket_of(key), 0, *digest);
            b.update(b.bucket_of(key), 0, *digest);
        }

        // Mutate one entry in b only.
        let key = Key::from("C");
        let old = entry_digest(&key, &Value::from("3"));
        let new = entry_digest(&key, &Value::from("3-changed"));
        let bucket = b.bucket_of(&key);
        b.update(bucket, old, new);

        assert_ne!(a.root(), b.root());

        // Exactly one leaf differs, and every differing internal node is
        // an ancestor of it.
        let mut changed_leaf = None;
        for leaf in 0..a.leaf_count() {
            let idx = a.node_index_of_leaf(leaf);
            if a.node(idx) != b.node(idx) {
                assert!(changed_leaf.is_none(), "more than one leaf changed");
                changed_leaf = Some(idx);
            }
        }
        let changed_leaf = changed_leaf.expect("one leaf must differ");

        let mut path = vec![changed_leaf];
        let mut node = changed_leaf;
        while node != 0 {
            node = (node - 1) / 2;
            path.push(node);
        }
        for node in 0..a.node_count() {
            let differs = a.node(node) != b.node(node);
            assert_eq!(differs, path.contains(&node), "node {node}");
        }
    }

    #[test]
    fn test_remove_restores_empty_digest() {
        let mut t = tree(4);
        let empty_root = t.root();

        let key = Key::from("K");
        let digest = entry_digest(&key, &Value::from("V"));
        let bucket = t.bucket_of(&key);
        t.update(bucket, 0, digest);
        assert_ne!(t.root(), empty_root);

        t.update(bucket, digest, 0);
        assert_eq!(t.root(), empty_root);
    }

    #[test]
    fn test_rebuild_matches_incremental() {
        let entries = digests(&[("A", "1"), ("B", "2"), ("C", "3")]);

        let mut incremental = tree(4);
        for (key, digest) in &entries {
            incremental.update(incremental.bucket_of(key), 0, *digest);
        }

        let mut rebuilt = tree(4);
        let buckets: Vec<(usize, u64)> = entries
            .iter()
            .map(|(key, digest)| (rebuilt.bucket_of(key), *digest))
            .collect();
        rebuilt.rebuild(buckets);

        assert_eq!(incremental.root(), rebuilt.root());
    }

    #[test]
    fn test_random_insertion_orders_converge() {
        use rand::seq::SliceRandom;

        let mut entries: Vec<(Key, u64)> = (0..200)
            .map(|i| {
                let key = Key::from(format!("key-{i}"));
                let digest = entry_digest(&key, &Value::from(format!("value-{i}")));
                (key, digest)
            })
            .collect();

        let mut reference = tree(8);
        for (key, digest) in &entries {
            let bucket = reference.bucket_of(key);
            reference.update(bucket, 0, *digest);
        }
        let expected = reference.root();

        let mut rng = rand::thread_rng();
        for _ in 0..5 {
            entries.shuffle(&mut rng);
            let mut shuffled = tree(8);
            for (key, digest) in &entries {
                let bucket = shuffled.bucket_of(key);
                shuffled.update(bucket, 0, *digest);
            }
            assert_eq!(shuffled.root(), expected);
        }
    }

    #[test]
    fn test_heap_layout_helpers() {
        let t = tree(3); // 4 leaves, 7 nodes
        assert_eq!(t.leaf_count(), 4);
        assert_eq!(t.node_count(), 7);
        assert_eq!(t.children(0), Some((1, 2)));
        assert_eq!(t.children(3), None);
        assert!(t.is_leaf(3));
        assert!(!t.is_leaf(2));
        assert_eq!(t.leaf_bucket(3), Some(0));
        assert_eq!(t.leaf_bucket(6), Some(3));
    }
}
