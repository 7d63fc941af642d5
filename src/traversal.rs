//! The iterative lookup engine.
//!
//! A [`Traversal`] walks the identifier space toward a target: it keeps a
//! candidate shortlist sorted by XOR distance, dispatches queries to the
//! best unqueried candidates up to a branch factor, folds newly learned
//! peers back into the shortlist as replies arrive, and stops once the
//! closest candidates have all answered or nothing dispatchable remains.
//!
//! What a traversal actually *asks* is pluggable. A [`LookupKind`] supplies
//! the observer construction, the query built per candidate, an optional
//! seed-trimming step, and the completion hook; [`NodeLookup`] is the plain
//! `find_node` walk used for bucket refreshes, and
//! [`crate::bootstrap::Bootstrap`] is the join-time specialization.
//!
//! Every outstanding observer holds the run alive through an `Arc`, so a
//! reply that arrives after [`Traversal::abort`] finds an invalidated run
//! and falls through harmlessly.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::local::LocalNode;
use crate::message::{Message, Query, Reply};
use crate::node::{Node, NodeId};
use crate::rpc::{Observer, ResponseHandler};

/// Maximum simultaneously in-flight queries per traversal.
pub const DEFAULT_BRANCH_FACTOR: usize = 3;

/// A traversal converges once this many of its closest candidates have
/// replied.
const DEFAULT_RESULTS_TARGET: usize = 8;

/// Shortlist ceiling; the farthest overflow is dropped on merge.
const MAX_RESULTS: usize = 100;

/// One peer on the shortlist.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// Set the moment a dispatch is attempted, successful or not.
    pub queried: bool,
    pub responded: bool,
    pub failed: bool,
}

/// The engine-owned working state of a run.
pub struct TraversalState {
    pub target: NodeId,
    /// Sorted ascending by distance to `target`, unique by endpoint.
    pub results: Vec<Candidate>,
    pub(crate) in_flight: usize,
    pub(crate) branch_factor: usize,
    pub(crate) results_target: usize,
    pub(crate) done_invoked: bool,
    pub(crate) finished: bool,
}

impl TraversalState {
    /// The next candidate worth dispatching to, or `None` when the walk has
    /// converged (enough of the closest candidates answered) or nothing
    /// dispatchable remains.
    fn next_candidate(&self) -> Option<(NodeId, SocketAddr)> {
        let mut remaining = self.results_target;
        for candidate in &self.results {
            if candidate.responded {
                remaining -= 1;
                if remaining == 0 {
                    return None;
                }
                continue;
            }
            if candidate.queried || candidate.failed {
                continue;
            }
            return Some((candidate.id, candidate.addr));
        }
        None
    }
}

/// Callback invoked once when a run completes, with the peers that replied.
pub type DoneCallback = Box<dyn FnOnce(Vec<Node>) + Send>;

/// The extension points a lookup flavor supplies to the engine.
pub trait LookupKind: Send + Sync {
    /// Fixed label for log and counter correlation.
    fn name(&self) -> &'static str;

    /// Binds an observer for a query to `addr`. `None` means the RPC layer
    /// is out of capacity; the engine drops the candidate for this run.
    fn new_observer(
        &self,
        run: &Arc<Traversal>,
        addr: SocketAddr,
        id: NodeId,
    ) -> Option<Arc<Observer>>;

    /// Builds and dispatches the query for one observer. Returns whether
    /// the datagram was handed to the transport.
    fn invoke(&self, run: &Arc<Traversal>, observer: &Arc<Observer>) -> bool;

    /// One-time chance to prune the seed set before the first dispatch.
    fn trim_seed_nodes(&self, _state: &mut TraversalState) {}

    /// Invoked exactly once when the engine decides the walk is over. The
    /// default completes immediately; specializations may do work first but
    /// must end by delegating to [`Traversal::finish`].
    fn done(&self, run: &Arc<Traversal>) {
        run.finish();
    }
}

/// One iterative lookup run.
pub struct Traversal {
    node: Arc<LocalNode>,
    kind: Box<dyn LookupKind>,
    state: Mutex<TraversalState>,
    invalidated: AtomicBool,
    on_done: Mutex<Option<DoneCallback>>,
    self_ref: Weak<Traversal>,
}

impl Traversal {
    pub fn new(
        node: Arc<LocalNode>,
        target: NodeId,
        kind: Box<dyn LookupKind>,
        on_done: DoneCallback,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            node,
            kind,
            state: Mutex::new(TraversalState {
                target,
                results: Vec::new(),
                in_flight: 0,
                branch_factor: DEFAULT_BRANCH_FACTOR,
                results_target: DEFAULT_RESULTS_TARGET,
                done_invoked: false,
                finished: false,
            }),
            invalidated: AtomicBool::new(false),
            on_done: Mutex::new(Some(on_done)),
            self_ref: me.clone(),
        })
    }

    pub fn node(&self) -> &Arc<LocalNode> {
        &self.node
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Direct access to the working state. Held briefly; never call back
    /// into the engine while holding the guard.
    pub fn state(&self) -> MutexGuard<'_, TraversalState> {
        self.state.lock()
    }

    /// Merges a peer into the shortlist, keeping it sorted by distance and
    /// unique by endpoint. Re-learning a known endpoint is a no-op: flags
    /// are never reset by a merge.
    pub fn add_candidate(&self, id: NodeId, addr: SocketAddr) {
        if id == self.node.current_id() {
            return;
        }

        let mut state = self.state.lock();
        if state.results.iter().any(|c| c.addr == addr) {
            return;
        }

        let target = state.target;
        let distance = id.distance(&target);
        let position = state
            .results
            .partition_point(|c| c.id.distance(&target) <= distance);
        state.results.insert(
            position,
            Candidate {
                id,
                addr,
                queried: false,
                responded: false,
                failed: false,
            },
        );
        if state.results.len() > MAX_RESULTS {
            state.results.truncate(MAX_RESULTS);
        }
    }

    /// Trims the seed set, then starts dispatching. An empty seed completes
    /// immediately.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            self.kind.trim_seed_nodes(&mut state);
        }
        debug!(
            lookup = self.kind.name(),
            seeds = self.state.lock().results.len(),
            "traversal started"
        );
        self.add_requests();
    }

    /// Tears the run down early. Outstanding observers stay registered in
    /// the RPC layer; their late callbacks see the invalidated flag and do
    /// nothing. The done-callback is dropped unfired.
    pub fn abort(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
        self.on_done.lock().take();
        debug!(lookup = self.kind.name(), "traversal aborted");
    }

    /// Base completion: flips the terminal flag and fires the caller's
    /// callback with every candidate that replied. Safe to call once per
    /// run; later calls are no-ops.
    pub fn finish(&self) {
        let alive: Vec<Node> = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            state
                .results
                .iter()
                .filter(|c| c.responded)
                .map(|c| Node::new(c.id, c.addr))
                .collect()
        };

        debug!(lookup = self.kind.name(), alive = alive.len(), "traversal finished");
        if let Some(on_done) = self.on_done.lock().take() {
            on_done(alive);
        }
    }

    /// Dispatch loop: fills the branch factor with queries to the best
    /// dispatchable candidates, then checks for completion.
    pub(crate) fn add_requests(self: &Arc<Self>) {
        if self.invalidated.load(Ordering::SeqCst) {
            return;
        }

        loop {
            let picked = {
                let mut state = self.state.lock();
                if state.finished || state.done_invoked {
                    return;
                }
                if state.in_flight >= state.branch_factor {
                    break;
                }
                match state.next_candidate() {
                    Some((id, addr)) => {
                        // flag under the same lock so a racing reply path
                        // cannot pick the same candidate twice
                        if let Some(c) = state.results.iter_mut().find(|c| c.addr == addr) {
                            c.queried = true;
                        }
                        state.in_flight += 1;
                        Some((id, addr))
                    }
                    None => None,
                }
            };

            let Some((id, addr)) = picked else { break };

            let Some(observer) = self.kind.new_observer(self, addr, id) else {
                // out of observers: forget the candidate entirely and stop
                // dispatching this round
                debug!(lookup = self.kind.name(), %addr, "observer allocation failed");
                let mut state = self.state.lock();
                state.in_flight -= 1;
                state.results.retain(|c| c.addr != addr);
                break;
            };

            if !self.kind.invoke(self, &observer) {
                debug!(lookup = self.kind.name(), %addr, "dispatch failed");
                let mut state = self.state.lock();
                state.in_flight -= 1;
                if let Some(c) = state.results.iter_mut().find(|c| c.addr == addr) {
                    c.failed = true;
                }
            }
        }

        self.check_done();
    }

    fn check_done(self: &Arc<Self>) {
        let ready = {
            let mut state = self.state.lock();
            if state.done_invoked || state.finished || state.in_flight > 0 {
                false
            } else if state.next_candidate().is_none() {
                state.done_invoked = true;
                true
            } else {
                false
            }
        };

        if ready {
            self.kind.done(self);
        }
    }
}

impl ResponseHandler for Traversal {
    fn on_reply(&self, observer: &Observer, reply: &Reply) {
        if self.invalidated.load(Ordering::SeqCst) {
            return;
        }
        let Some(run) = self.self_ref.upgrade() else {
            return;
        };

        {
            let mut state = run.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            if let Some(c) = state.results.iter_mut().find(|c| c.addr == observer.addr()) {
                c.responded = true;
            }
        }

        // a reply is the verification the routing table wants
        run.node.routing().insert(Node::new(reply.id, observer.addr()));
        run.node.stats().note_reply();

        for node in &reply.nodes {
            run.add_candidate(node.id, node.addr);
        }

        run.add_requests();
    }

    fn on_timeout(&self, observer: &Observer) {
        if self.invalidated.load(Ordering::SeqCst) {
            return;
        }
        let Some(run) = self.self_ref.upgrade() else {
            return;
        };

        {
            let mut state = run.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            if let Some(c) = state.results.iter_mut().find(|c| c.addr == observer.addr()) {
                c.failed = true;
            }
        }

        if let Some(id) = observer.id() {
            run.node.routing().note_failure(&id);
        }
        run.node.stats().note_timeout();

        run.add_requests();
    }
}

/// The plain `find_node` walk: asks each candidate for nodes near a fixed
/// target. Used for routing-table bucket refreshes.
pub struct NodeLookup;

impl LookupKind for NodeLookup {
    fn name(&self) -> &'static str {
        "node_lookup"
    }

    fn new_observer(
        &self,
        run: &Arc<Traversal>,
        addr: SocketAddr,
        id: NodeId,
    ) -> Option<Arc<Observer>> {
        run.node()
            .rpc()
            .allocate_observer(run.clone(), addr, Some(id))
    }

    fn invoke(&self, run: &Arc<Traversal>, observer: &Arc<Observer>) -> bool {
        let target = run.state().target;
        let msg = Message::query(run.node().current_id(), Query::FindNode { target });
        run.node().stats().note_find_node_out();
        run.node()
            .rpc()
            .invoke(msg, observer.addr(), observer.clone())
    }
}
