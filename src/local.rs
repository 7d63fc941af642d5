//! Local node state: the stable identifier, the routing table, the RPC
//! handle, and the counters every lookup reports into.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::bootstrap::Bootstrap;
use crate::message::{Message, Query, Reply};
use crate::node::{Node, NodeId};
use crate::routing::RoutingTable;
use crate::rpc::{Observer, ResponseHandler, RpcManager};
use crate::traversal::{DoneCallback, NodeLookup, Traversal};

/// Outbound/inbound query counters. Observability only; nothing reads
/// these to make decisions.
#[derive(Debug, Default)]
pub struct Stats {
    pings_out: AtomicU64,
    find_nodes_out: AtomicU64,
    get_peers_out: AtomicU64,
    replies_in: AtomicU64,
    timeouts: AtomicU64,
}

impl Stats {
    pub(crate) fn note_ping_out(&self) {
        self.pings_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_find_node_out(&self) {
        self.find_nodes_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_get_peers_out(&self) {
        self.get_peers_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_reply(&self) {
        self.replies_in.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pings_out(&self) -> u64 {
        self.pings_out.load(Ordering::Relaxed)
    }

    pub fn find_nodes_out(&self) -> u64 {
        self.find_nodes_out.load(Ordering::Relaxed)
    }

    pub fn get_peers_out(&self) -> u64 {
        self.get_peers_out.load(Ordering::Relaxed)
    }

    pub fn replies_in(&self) -> u64 {
        self.replies_in.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

/// The state shared by every lookup a node runs.
///
/// The identifier lives inside the routing table so both always agree; it
/// is read fresh wherever it matters (most notably per dispatched
/// bootstrap query) rather than cached at lookup creation.
pub struct LocalNode {
    routing: RoutingTable,
    rpc: Arc<RpcManager>,
    stats: Stats,
}

impl LocalNode {
    pub fn new(id: NodeId, rpc: Arc<RpcManager>) -> Self {
        Self {
            routing: RoutingTable::new(id),
            rpc,
            stats: Stats::default(),
        }
    }

    /// The node's identifier as of right now.
    pub fn current_id(&self) -> NodeId {
        self.routing.home()
    }

    /// Adopts a new identifier, discarding the routing table (bucket
    /// placement is relative to the id). In-flight lookups pick the new id
    /// up at their next dispatch.
    pub fn set_id(&self, id: NodeId) {
        debug!(%id, "adopting new node id");
        self.routing.reset(id);
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn rpc(&self) -> &Arc<RpcManager> {
        &self.rpc
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Asks the routing table to consider an endpoint, fire-and-forget.
    ///
    /// The endpoint is pinged; only a reply inserts it (see
    /// [`VerifyPing`]). Nothing enters the table on hearsay alone.
    pub fn add_candidate(self: &Arc<Self>, addr: SocketAddr) {
        let handler: Arc<dyn ResponseHandler> = Arc::new(VerifyPing {
            node: Arc::downgrade(self),
        });
        let Some(observer) = self.rpc.allocate_observer(handler, addr, None) else {
            debug!(%addr, "no observer for verification ping");
            return;
        };

        let msg = Message::query(self.current_id(), Query::Ping);
        self.stats.note_ping_out();
        if !self.rpc.invoke(msg, addr, observer) {
            debug!(%addr, "verification ping failed to send");
        }
    }

    /// Starts the join-time bootstrap walk, seeded with everything the
    /// routing table already knows plus the given router endpoints.
    ///
    /// Routers advertise no identifier; they are filed under the zero id,
    /// which only affects where they sort in the shortlist.
    pub fn start_bootstrap(
        self: &Arc<Self>,
        routers: &[SocketAddr],
        on_done: DoneCallback,
    ) -> Arc<Traversal> {
        let target = self.current_id();
        let run = Traversal::new(self.clone(), target, Box::new(Bootstrap), on_done);

        for node in self.routing.all_nodes() {
            run.add_candidate(node.id, node.addr);
        }
        for &addr in routers {
            run.add_candidate(NodeId([0u8; 20]), addr);
        }

        run.start();
        run
    }

    /// Starts a plain `find_node` walk toward `target`, seeded with the
    /// closest nodes on file. Used for bucket refreshes.
    pub fn start_lookup(
        self: &Arc<Self>,
        target: NodeId,
        on_done: DoneCallback,
    ) -> Arc<Traversal> {
        let run = Traversal::new(self.clone(), target, Box::new(NodeLookup), on_done);

        for node in self.routing.closest(&target, crate::routing::K * 2) {
            run.add_candidate(node.id, node.addr);
        }

        run.start();
        run
    }
}

/// Handler behind [`LocalNode::add_candidate`]: the endpoint becomes a
/// routing-table entry only if the verification ping comes back.
struct VerifyPing {
    node: Weak<LocalNode>,
}

impl ResponseHandler for VerifyPing {
    fn on_reply(&self, observer: &Observer, reply: &Reply) {
        if let Some(node) = self.node.upgrade() {
            node.stats().note_reply();
            node.routing().insert(Node::new(reply.id, observer.addr()));
        }
    }

    fn on_timeout(&self, _observer: &Observer) {
        // never made it in; nothing to clean up
    }
}
