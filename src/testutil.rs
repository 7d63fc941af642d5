//! Shared fixtures for unit tests: a capturing transport and a few
//! deterministic builders.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::local::LocalNode;
use crate::message::Message;
use crate::node::NodeId;
use crate::rpc::{RpcManager, Transport};

/// A transport that records every datagram instead of sending it.
/// Addresses registered via [`MockTransport::fail_sends_to`] refuse sends,
/// modeling local dispatch failure.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    failing: Mutex<HashSet<SocketAddr>>,
}

impl MockTransport {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_sends_to(&self, addr: SocketAddr) {
        self.failing.lock().insert(addr);
    }

    pub fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.lock().clone()
    }

    /// Every successfully "sent" datagram, parsed.
    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .map(|(data, _)| Message::parse(data).expect("mock captured unparseable message"))
            .collect()
    }

    /// Parsed datagrams sent to one destination.
    pub fn sent_to(&self, addr: SocketAddr) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .filter(|(_, to)| *to == addr)
            .map(|(data, _)| Message::parse(data).expect("mock captured unparseable message"))
            .collect()
    }
}

impl Transport for MockTransport {
    fn send(&self, data: &[u8], addr: SocketAddr) -> bool {
        if self.failing.lock().contains(&addr) {
            return false;
        }
        self.sent.lock().push((data.to_vec(), addr));
        true
    }
}

/// A local node wired to a mock transport.
pub fn test_node(id: NodeId) -> (Arc<LocalNode>, Arc<MockTransport>) {
    let net = MockTransport::shared();
    let rpc = Arc::new(RpcManager::new(net.clone()));
    (Arc::new(LocalNode::new(id, rpc)), net)
}

/// Deterministic test endpoint; distinct inputs give distinct addresses.
pub fn addr(n: u16) -> SocketAddr {
    SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(10, 0, (n >> 8) as u8, n as u8)),
        6881,
    )
}

/// An id equal to `n` when read as a big-endian integer: its distance to
/// the zero id is exactly `n`.
pub fn id_with_last(n: u8) -> NodeId {
    let mut id = [0u8; 20];
    id[19] = n;
    NodeId(id)
}
