//! The bootstrap specialization of the iterative lookup.
//!
//! Joining the network inverts the usual lookup posture. A normal walk
//! wants the handful of nodes closest to a point; a joining node wants a
//! routing table that spans the whole identifier space on a fixed query
//! budget. Three choices follow from that:
//!
//! - the seed set is trimmed to the *farthest* known nodes, not the
//!   closest, so queries explore regions the table knows nothing about;
//! - each query asks `get_peers` rather than `find_node`, since peers that
//!   rate-limit discovery traffic from strangers answer it like any other
//!   request, and every answered query widens the walk;
//! - the target sent on the wire is the local id with its low bits
//!   re-randomized per query, so no peer can correlate the query sequence
//!   back to one stable identity.
//!
//! When the walk settles, every node that was discovered but never
//! directly queried — usually the majority, given the branch factor — is
//! handed to the routing table for verification instead of being thrown
//! away.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::message::{Message, Query};
use crate::node::NodeId;
use crate::rpc::{Observer, ResponseHandler};
use crate::traversal::{LookupKind, Traversal, TraversalState};

/// Seed candidates kept when the routing table offers more.
pub(crate) const SEED_RETAIN: usize = 32;

/// See the module docs; construct with [`crate::local::LocalNode::start_bootstrap`].
pub struct Bootstrap;

impl LookupKind for Bootstrap {
    fn name(&self) -> &'static str {
        "bootstrap"
    }

    fn new_observer(
        &self,
        run: &Arc<Traversal>,
        addr: SocketAddr,
        id: NodeId,
    ) -> Option<Arc<Observer>> {
        let handler: Arc<dyn ResponseHandler> = run.clone();
        run.node().rpc().allocate_observer(handler, addr, Some(id))
    }

    fn invoke(&self, run: &Arc<Traversal>, observer: &Arc<Observer>) -> bool {
        // the node id may change while the walk is in flight; always build
        // the target from the id as it is at dispatch time
        let target = run.node().current_id().obscured();
        let msg = Message::query(
            run.node().current_id(),
            Query::GetPeers { info_hash: target },
        );
        run.node().stats().note_get_peers_out();
        run.node()
            .rpc()
            .invoke(msg, observer.addr(), observer.clone())
    }

    fn trim_seed_nodes(&self, state: &mut TraversalState) {
        // start as far from our own id as possible; the near neighbors are
        // exactly the nodes a populated table re-confirms for free
        if state.results.len() > SEED_RETAIN {
            let cut = state.results.len() - SEED_RETAIN;
            state.results.drain(..cut);
        }
    }

    fn done(&self, run: &Arc<Traversal>) {
        let stragglers: Vec<SocketAddr> = run
            .state()
            .results
            .iter()
            .filter(|c| !c.queried)
            .map(|c| c.addr)
            .collect();

        debug!(
            lookup = self.name(),
            stragglers = stragglers.len(),
            "bootstrap done, pinging remaining nodes"
        );

        for addr in stragglers {
            run.node().add_candidate(addr);
        }

        run.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalNode;
    use crate::message::{Body, Query, Reply};
    use crate::node::{Node, ID_PREFIX_KEEP};
    use crate::testutil::{addr, id_with_last, test_node, MockTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bootstrap_run(node: &Arc<LocalNode>) -> (Arc<Traversal>, Arc<AtomicUsize>) {
        let done = Arc::new(AtomicUsize::new(0));
        let probe = done.clone();
        let run = Traversal::new(
            node.clone(),
            node.current_id(),
            Box::new(Bootstrap),
            Box::new(move |_| {
                probe.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (run, done)
    }

    fn get_peers_targets(net: &MockTransport) -> Vec<NodeId> {
        net.sent_messages()
            .iter()
            .filter_map(|m| match &m.body {
                Body::Query {
                    query: Query::GetPeers { info_hash },
                    ..
                } => Some(*info_hash),
                _ => None,
            })
            .collect()
    }

    fn ping_destinations(net: &MockTransport) -> Vec<std::net::SocketAddr> {
        net.sent()
            .iter()
            .filter_map(|(data, to)| {
                let msg = Message::parse(data).unwrap();
                matches!(
                    msg.body,
                    Body::Query {
                        query: Query::Ping,
                        ..
                    }
                )
                .then_some(*to)
            })
            .collect()
    }

    #[test]
    fn trim_keeps_the_32_farthest() {
        // distances 1..=40 from the zero home id
        let (node, _net) = test_node(NodeId([0u8; 20]));
        let (run, _done) = bootstrap_run(&node);
        for n in 1..=40u8 {
            run.add_candidate(id_with_last(n), addr(n as u16));
        }

        Bootstrap.trim_seed_nodes(&mut run.state());

        let state = run.state();
        assert_eq!(state.results.len(), SEED_RETAIN);
        let distances: Vec<u8> = state.results.iter().map(|c| c.id.0[19]).collect();
        assert_eq!(distances, (9..=40).collect::<Vec<u8>>());
    }

    #[test]
    fn trim_is_a_noop_at_or_below_32() {
        let (node, _net) = test_node(NodeId([0u8; 20]));
        let (run, _done) = bootstrap_run(&node);
        for n in 1..=32u8 {
            run.add_candidate(id_with_last(n), addr(n as u16));
        }

        Bootstrap.trim_seed_nodes(&mut run.state());

        let state = run.state();
        let distances: Vec<u8> = state.results.iter().map(|c| c.id.0[19]).collect();
        assert_eq!(distances, (1..=32).collect::<Vec<u8>>());
    }

    #[test]
    fn queries_carry_an_obscured_target() {
        let home = NodeId([0xab; 20]);
        let (node, net) = test_node(home);
        let (run, _done) = bootstrap_run(&node);

        run.add_candidate(id_with_last(1), addr(1));
        run.add_candidate(id_with_last(2), addr(2));
        run.start();

        let targets = get_peers_targets(&net);
        assert_eq!(targets.len(), 2);
        for target in &targets {
            assert_eq!(&target.0[..ID_PREFIX_KEEP], &home.0[..ID_PREFIX_KEEP]);
        }
        // fresh randomness per dispatch, even within one run
        assert_ne!(targets[0].0, targets[1].0);
    }

    #[test]
    fn target_follows_a_mid_run_id_change() {
        let first = NodeId([0x11; 20]);
        let second = NodeId([0x77; 20]);
        let (node, net) = test_node(first);
        let (run, _done) = bootstrap_run(&node);
        run.state().branch_factor = 1;

        run.add_candidate(id_with_last(1), addr(1));
        run.add_candidate(id_with_last(2), addr(2));
        run.start();

        node.set_id(second);

        // first candidate answers; the engine moves on to the second
        let tid = net.sent_messages()[0].transaction_id.clone();
        node.rpc().handle_reply(
            &tid,
            addr(1),
            &Reply {
                id: id_with_last(1),
                nodes: Vec::new(),
                token: None,
            },
        );

        let targets = get_peers_targets(&net);
        assert_eq!(targets.len(), 2);
        assert_eq!(&targets[0].0[..ID_PREFIX_KEEP], &first.0[..ID_PREFIX_KEEP]);
        assert_eq!(&targets[1].0[..ID_PREFIX_KEEP], &second.0[..ID_PREFIX_KEEP]);
    }

    #[test]
    fn dispatch_failure_marks_queried_and_skips_seeding() {
        let (node, net) = test_node(NodeId([0u8; 20]));
        net.fail_sends_to(addr(1));
        let (run, done) = bootstrap_run(&node);

        run.add_candidate(id_with_last(1), addr(1));
        run.start();

        let state = run.state();
        assert!(state.results[0].queried);
        assert!(state.results[0].failed);
        drop(state);

        // the run is over, and the failed candidate was not pinged
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(ping_destinations(&net).is_empty());
    }

    #[test]
    fn stragglers_are_pinged_exactly_once() {
        let (node, net) = test_node(NodeId([0u8; 20]));
        let (run, done) = bootstrap_run(&node);
        {
            let mut state = run.state();
            state.branch_factor = 1;
            state.results_target = 1;
        }

        run.add_candidate(id_with_last(1), addr(1));
        run.start();

        // X answers with Y and Z; Y appears twice across the listing
        let tid = net.sent_messages()[0].transaction_id.clone();
        node.rpc().handle_reply(
            &tid,
            addr(1),
            &Reply {
                id: id_with_last(1),
                nodes: vec![
                    Node::new(id_with_last(2), addr(2)),
                    Node::new(id_with_last(3), addr(3)),
                    Node::new(id_with_last(2), addr(2)),
                ],
                token: None,
            },
        );

        assert_eq!(done.load(Ordering::SeqCst), 1);

        let mut pinged = ping_destinations(&net);
        pinged.sort();
        assert_eq!(pinged, vec![addr(2), addr(3)]);

        // the directly-queried node is seeded by its own reply, not a ping
        assert_eq!(node.routing().all_nodes().len(), 1);
        assert_eq!(node.routing().all_nodes()[0].addr, addr(1));
    }

    #[test]
    fn observer_exhaustion_drops_the_candidate() {
        struct Nop;
        impl ResponseHandler for Nop {
            fn on_reply(&self, _: &Observer, _: &Reply) {}
            fn on_timeout(&self, _: &Observer) {}
        }

        let (node, net) = test_node(NodeId([0u8; 20]));

        // exhaust the observer budget with unrelated pings
        let nop: Arc<dyn ResponseHandler> = Arc::new(Nop);
        for n in 0..crate::rpc::MAX_PENDING_QUERIES {
            let observer = node
                .rpc()
                .allocate_observer(nop.clone(), addr(1000 + n as u16), None)
                .unwrap();
            assert!(node.rpc().invoke(
                Message::query(node.current_id(), Query::Ping),
                addr(1000 + n as u16),
                observer,
            ));
        }

        let (run, done) = bootstrap_run(&node);
        run.add_candidate(id_with_last(1), addr(1));
        run.start();

        // never dispatched, never part of the results, never seeded
        assert!(run.state().results.is_empty());
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(get_peers_targets(&net).is_empty());
        assert!(!ping_destinations(&net).contains(&addr(1)));
    }

    #[test]
    fn full_walk_from_routing_table_and_routers() {
        let home = NodeId([0x42; 20]);
        let (node, net) = test_node(home);
        node.routing().insert(Node::new(id_with_last(1), addr(1)));
        node.routing().insert(Node::new(id_with_last(2), addr(2)));

        let done = Arc::new(AtomicUsize::new(0));
        let probe = done.clone();
        let run = node.start_bootstrap(
            &[addr(50)],
            Box::new(move |_| {
                probe.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(run.state().results.len(), 3);
        assert_eq!(node.stats().get_peers_out(), 3);

        // nobody answers; the walk still terminates
        node.rpc().expire_older_than(std::time::Duration::ZERO);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(node.stats().timeouts(), 3);
        assert!(ping_destinations(&net).is_empty());
    }
}
