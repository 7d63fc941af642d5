use crate::error::DhtError;
use rand::Rng as _;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

/// Consecutive failed queries before a node is dropped from its bucket.
const MAX_FAILURES: u8 = 3;

/// A node stops counting as good if it has been silent this long.
const GOOD_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Leading bytes of the local id preserved by [`NodeId::obscured`].
///
/// The high bits decide which buckets (and therefore which peers) a lookup
/// touches; everything below them carries no routing information at the
/// scales a bootstrap walk cares about.
pub(crate) const ID_PREFIX_KEEP: usize = 4;

/// A 160-bit DHT node identifier.
///
/// Identifiers are only ever related to each other through the XOR metric
/// ([`NodeId::distance`]); they have no meaningful lexicographic order.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    /// Generates a uniformly random identifier.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != 20 {
            return Err(DhtError::InvalidNodeId);
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// XOR distance to `other`, comparable as a big-endian unsigned integer.
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut dist = [0u8; 20];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Index of the routing bucket `other` falls into, as seen from `self`:
    /// the number of leading bits the two identifiers share.
    pub fn bucket_index(&self, other: &NodeId) -> usize {
        let dist = self.distance(other);

        for (i, &byte) in dist.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }

        159
    }

    /// Returns a copy of this identifier with everything below the bucket
    /// prefix replaced by fresh random bits.
    ///
    /// Outbound bootstrap queries carry an obscured copy of the local id as
    /// their target, so the sequence of queries one peer observes cannot be
    /// correlated back to a single stable identity. Distance-based peer
    /// selection is unaffected: the preserved prefix dominates the metric.
    pub fn obscured(&self) -> NodeId {
        let mut id = self.0;
        rand::rng().fill(&mut id[ID_PREFIX_KEEP..]);
        NodeId(id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A peer known to the routing layer: claimed identifier plus endpoint,
/// with enough bookkeeping to judge liveness.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub failures: u8,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            failures: 0,
        }
    }

    /// Records a confirmed sign of life.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failures = 0;
    }

    pub fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn is_good(&self) -> bool {
        self.failures == 0 && self.last_seen.elapsed() < GOOD_WINDOW
    }

    pub fn is_bad(&self) -> bool {
        self.failures >= MAX_FAILURES
    }

    /// Parses the 26-byte compact form: 20-byte id, 4-byte IPv4, 2-byte port.
    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != 26 {
            return None;
        }

        let id = NodeId::from_bytes(&data[..20]).ok()?;
        let ip = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let port = u16::from_be_bytes([data[24], data[25]]);

        Some(Self::new(id, SocketAddr::new(IpAddr::V4(ip), port)))
    }

    /// Encodes the compact form. IPv6 peers have no compact encoding in the
    /// v4 node list and yield `None`.
    pub fn to_compact(&self) -> Option<[u8; 26]> {
        let SocketAddr::V4(v4) = self.addr else {
            return None;
        };

        let mut out = [0u8; 26];
        out[..20].copy_from_slice(&self.id.0);
        out[20..24].copy_from_slice(&v4.ip().octets());
        out[24..26].copy_from_slice(&v4.port().to_be_bytes());
        Some(out)
    }
}
