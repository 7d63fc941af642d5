//! Bucketed Kademlia routing table.
//!
//! Nodes are filed by the length of the identifier prefix they share with
//! the local node. Insertion is reserved for peers that have proven
//! themselves by answering a query; unverified endpoints go through
//! [`crate::local::LocalNode::add_candidate`], which pings first.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::RwLock;

use crate::node::{Node, NodeId};

/// Bucket capacity, and the default answer size for `find_node`.
pub const K: usize = 8;

const BUCKET_COUNT: usize = 160;

/// A bucket whose freshest node is older than this wants a refresh lookup.
const REFRESH_AFTER: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Default)]
struct Bucket {
    live: VecDeque<Node>,
    spare: VecDeque<Node>,
}

impl Bucket {
    fn insert(&mut self, node: Node) {
        if let Some(pos) = self.live.iter().position(|n| n.id == node.id) {
            // already known: refresh and move to the tail (most recent)
            if let Some(mut existing) = self.live.remove(pos) {
                existing.touch();
                self.live.push_back(existing);
            }
            return;
        }

        if let Some(pos) = self.live.iter().position(|n| n.is_bad()) {
            self.live.remove(pos);
            self.live.push_back(node);
            return;
        }

        if self.live.len() < K {
            self.live.push_back(node);
            return;
        }

        if self.spare.len() == K {
            self.spare.pop_front();
        }
        self.spare.push_back(node);
    }

    fn remove(&mut self, id: &NodeId) {
        if let Some(pos) = self.live.iter().position(|n| &n.id == id) {
            self.live.remove(pos);
            if let Some(promoted) = self.spare.pop_front() {
                self.live.push_back(promoted);
            }
        }
    }

    fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.live.iter_mut().find(|n| &n.id == id)
    }
}

pub struct RoutingTable {
    home: RwLock<NodeId>,
    buckets: Vec<RwLock<Bucket>>,
}

impl RoutingTable {
    pub fn new(home: NodeId) -> Self {
        Self {
            home: RwLock::new(home),
            buckets: (0..BUCKET_COUNT).map(|_| RwLock::new(Bucket::default())).collect(),
        }
    }

    /// The local node's identifier as it is right now.
    pub fn home(&self) -> NodeId {
        *self.home.read()
    }

    /// Replaces the local identifier and discards all buckets; prefix
    /// placement is meaningless relative to a new id.
    pub fn reset(&self, home: NodeId) {
        *self.home.write() = home;
        for bucket in &self.buckets {
            *bucket.write() = Bucket::default();
        }
    }

    fn bucket_for(&self, id: &NodeId) -> Option<&RwLock<Bucket>> {
        let home = self.home();
        if id == &home {
            return None;
        }
        Some(&self.buckets[home.bucket_index(id)])
    }

    /// Files a verified node. Callers are expected to have observed a reply
    /// from this endpoint; the table does not verify on its own.
    pub fn insert(&self, node: Node) {
        if let Some(bucket) = self.bucket_for(&node.id) {
            bucket.write().insert(node);
        }
    }

    /// Refreshes the liveness clock of an already-filed node. Unknown ids
    /// are ignored rather than inserted.
    pub fn note_seen(&self, id: &NodeId) {
        if let Some(bucket) = self.bucket_for(id) {
            if let Some(node) = bucket.write().get_mut(id) {
                node.touch();
            }
        }
    }

    /// Records a failed query against a node, dropping it once it crosses
    /// the failure threshold.
    pub fn note_failure(&self, id: &NodeId) {
        if let Some(bucket) = self.bucket_for(id) {
            let mut bucket = bucket.write();
            if let Some(node) = bucket.get_mut(id) {
                node.fail();
                if node.is_bad() {
                    bucket.remove(id);
                }
            }
        }
    }

    /// The `count` good nodes closest to `target` by XOR distance.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Node> {
        let mut found: Vec<(Node, [u8; 20])> = Vec::new();
        for bucket in &self.buckets {
            for node in bucket.read().live.iter().filter(|n| n.is_good()) {
                found.push((node.clone(), node.id.distance(target)));
            }
        }
        found.sort_by(|a, b| a.1.cmp(&b.1));
        found.truncate(count);
        found.into_iter().map(|(n, _)| n).collect()
    }

    /// Every filed node, regardless of liveness. Used to seed lookups.
    pub fn all_nodes(&self) -> Vec<Node> {
        let mut nodes = Vec::new();
        for bucket in &self.buckets {
            nodes.extend(bucket.read().live.iter().cloned());
        }
        nodes
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().live.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices of non-empty buckets that have gone quiet.
    pub fn stale_buckets(&self) -> Vec<usize> {
        let mut stale = Vec::new();
        for (index, bucket) in self.buckets.iter().enumerate() {
            let bucket = bucket.read();
            let freshest = bucket.live.iter().map(|n| n.last_seen.elapsed()).min();
            if matches!(freshest, Some(age) if age > REFRESH_AFTER) {
                stale.push(index);
            }
        }
        stale
    }

    /// A random identifier that would land in the given bucket: shares
    /// exactly `bucket` leading bits with the local id.
    pub fn random_id_in_bucket(&self, bucket: usize) -> NodeId {
        if bucket >= BUCKET_COUNT {
            return NodeId::generate();
        }

        let home = self.home();
        let mut id = NodeId::generate().0;

        let byte = bucket / 8;
        let offset = bucket % 8;
        let flip = 1u8 << (7 - offset);
        let prefix_mask = !(0xffu8 >> offset);

        id[..byte].copy_from_slice(&home.0[..byte]);
        id[byte] = (home.0[byte] & prefix_mask) | (!home.0[byte] & flip) | (id[byte] & (flip - 1));

        NodeId(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr(n: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, (n >> 8) as u8, n as u8)), 6881)
    }

    fn id_with_first(byte: u8) -> NodeId {
        let mut id = [0u8; 20];
        id[0] = byte;
        NodeId(id)
    }

    #[test]
    fn insert_and_count() {
        let table = RoutingTable::new(NodeId([0u8; 20]));
        for n in 1..=10u16 {
            table.insert(Node::new(NodeId::generate(), addr(n)));
        }
        assert!(table.len() > 0);
        assert!(!table.is_empty());
    }

    #[test]
    fn insert_ignores_home_id() {
        let home = NodeId([5u8; 20]);
        let table = RoutingTable::new(home);
        table.insert(Node::new(home, addr(1)));
        assert!(table.is_empty());
    }

    #[test]
    fn reinsert_touches_instead_of_duplicating() {
        let table = RoutingTable::new(NodeId([0u8; 20]));
        let id = id_with_first(0x80);
        table.insert(Node::new(id, addr(1)));
        table.insert(Node::new(id, addr(1)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn bucket_overflow_goes_to_spare() {
        let table = RoutingTable::new(NodeId([0u8; 20]));
        // all of these share zero prefix bits: one bucket
        for n in 0..(K as u16 + 4) {
            let mut id = [0u8; 20];
            id[0] = 0x80;
            id[19] = n as u8 + 1;
            table.insert(Node::new(NodeId(id), addr(n + 1)));
        }
        assert_eq!(table.len(), K);
    }

    #[test]
    fn failures_evict_and_promote_spare() {
        let table = RoutingTable::new(NodeId([0u8; 20]));
        let mut ids = Vec::new();
        for n in 0..=(K as u16) {
            let mut id = [0u8; 20];
            id[0] = 0x80;
            id[19] = n as u8 + 1;
            ids.push(NodeId(id));
            table.insert(Node::new(NodeId(id), addr(n + 1)));
        }
        assert_eq!(table.len(), K);

        // three strikes on the first node frees a slot; the spare moves in
        for _ in 0..3 {
            table.note_failure(&ids[0]);
        }
        assert_eq!(table.len(), K);
        assert!(table.all_nodes().iter().all(|n| n.id != ids[0]));
        assert!(table.all_nodes().iter().any(|n| n.id == ids[K]));
    }

    #[test]
    fn closest_sorts_by_distance() {
        let home = NodeId([0u8; 20]);
        let table = RoutingTable::new(home);
        for byte in [0x01u8, 0x80, 0x40, 0x08] {
            table.insert(Node::new(id_with_first(byte), addr(byte as u16)));
        }

        let closest = table.closest(&home, 3);
        assert_eq!(closest.len(), 3);
        assert_eq!(closest[0].id, id_with_first(0x01));
        assert_eq!(closest[1].id, id_with_first(0x08));
        assert_eq!(closest[2].id, id_with_first(0x40));
    }

    #[test]
    fn note_seen_does_not_insert_unknown() {
        let table = RoutingTable::new(NodeId([0u8; 20]));
        table.note_seen(&id_with_first(0x80));
        assert!(table.is_empty());
    }

    #[test]
    fn random_id_lands_in_requested_bucket() {
        let home = NodeId([0xa5u8; 20]);
        let table = RoutingTable::new(home);
        for bucket in [0usize, 1, 7, 8, 19, 63, 159] {
            let id = table.random_id_in_bucket(bucket);
            assert_eq!(home.bucket_index(&id), bucket, "bucket {}", bucket);
        }
    }

    #[test]
    fn reset_clears_table_and_swaps_home() {
        let table = RoutingTable::new(NodeId([0u8; 20]));
        table.insert(Node::new(id_with_first(0x80), addr(1)));
        assert_eq!(table.len(), 1);

        let new_home = NodeId([9u8; 20]);
        table.reset(new_home);
        assert!(table.is_empty());
        assert_eq!(table.home(), new_home);
    }
}
