//! The DHT node facade: a UDP socket, the event loop that feeds the RPC
//! layer, a responder for inbound queries, and periodic maintenance.
//!
//! All lookup bookkeeping is callback-driven; the loop here only moves
//! datagrams, sweeps timeouts, and kicks off refresh walks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::DhtError;
use crate::local::LocalNode;
use crate::message::{Body, Message, Query, Reply, TransactionId};
use crate::node::NodeId;
use crate::routing::K;
use crate::rpc::{RpcManager, UdpTransport};

/// Well-known routers that answer bootstrap queries from strangers.
pub const BOOTSTRAP_ROUTERS: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Resolves router host:port strings, keeping the first IPv4 address of
/// each. Unresolvable routers are skipped with a warning.
pub async fn resolve_routers(routers: &[&str]) -> Vec<SocketAddr> {
    let mut resolved = Vec::with_capacity(routers.len());
    for router in routers {
        match lookup_host(router).await {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.find(|a| a.is_ipv4()) {
                    resolved.push(addr);
                }
            }
            Err(err) => warn!(router = %router, %err, "failed to resolve router"),
        }
    }
    resolved
}

/// A running DHT node.
///
/// # Examples
///
/// ```no_run
/// use rdht::{resolve_routers, DhtNode, BOOTSTRAP_ROUTERS};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), rdht::DhtError> {
/// let node = Arc::new(DhtNode::bind(6881).await?);
///
/// // the run loop must be live for any lookup to make progress
/// let runner = node.clone();
/// tokio::spawn(async move { runner.run().await });
///
/// let routers = resolve_routers(BOOTSTRAP_ROUTERS).await;
/// node.bootstrap(&routers).await;
/// # Ok(())
/// # }
/// ```
pub struct DhtNode {
    socket: Arc<UdpSocket>,
    local: Arc<LocalNode>,
    port: u16,
}

impl DhtNode {
    pub async fn bind(port: u16) -> Result<Self, DhtError> {
        let socket = Arc::new(UdpSocket::bind(format!("0.0.0.0:{}", port)).await?);
        let local_addr = socket.local_addr()?;
        let id = NodeId::generate();

        info!(%local_addr, %id, "dht node bound");

        let transport = Arc::new(UdpTransport::new(socket.clone()));
        let local = Arc::new(LocalNode::new(id, Arc::new(RpcManager::new(transport))));

        Ok(Self {
            socket,
            local,
            port: local_addr.port(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local(&self) -> &Arc<LocalNode> {
        &self.local
    }

    /// Runs one bootstrap walk against the given routers and waits for it
    /// to complete. Requires [`DhtNode::run`] to be driving the socket.
    pub async fn bootstrap(&self, routers: &[SocketAddr]) {
        info!(routers = routers.len(), "starting bootstrap");

        let (tx, rx) = oneshot::channel();
        self.local.start_bootstrap(
            routers,
            Box::new(move |_| {
                let _ = tx.send(());
            }),
        );
        let _ = rx.await;

        info!(nodes = self.local.routing().len(), "bootstrap complete");
    }

    /// The event loop: receives datagrams, sweeps query timeouts, and
    /// refreshes quiet buckets. Runs until the socket errors.
    pub async fn run(&self) -> Result<(), DhtError> {
        let mut buf = vec![0u8; 65535];
        let mut sweep = interval(TIMEOUT_SWEEP_INTERVAL);
        let mut refresh = interval(REFRESH_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
        sweep.tick().await;
        refresh.tick().await;

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    match Message::parse(&buf[..len]) {
                        Ok(msg) => self.handle_message(msg, from).await,
                        Err(err) => debug!(%from, %err, "dropping unparseable datagram"),
                    }
                }
                _ = sweep.tick() => self.local.rpc().check_timeouts(),
                _ = refresh.tick() => self.refresh(),
            }
        }
    }

    async fn handle_message(&self, msg: Message, from: SocketAddr) {
        match msg.body {
            Body::Reply(reply) => {
                self.local
                    .rpc()
                    .handle_reply(&msg.transaction_id, from, &reply);
            }
            Body::Error { code, message } => {
                self.local
                    .rpc()
                    .handle_error(&msg.transaction_id, from, code, &message);
            }
            Body::Query { id, query } => {
                // a query is not proof of liveness at that address, so it
                // refreshes known nodes but never inserts new ones
                self.local.routing().note_seen(&id);

                let answer = answer_query(&self.local, msg.transaction_id, &query);
                if let Err(err) = self.socket.send_to(&answer.encode(), from).await {
                    debug!(%from, %err, "failed to answer query");
                }
            }
        }
    }

    /// Periodic maintenance: a thin table re-runs the bootstrap walk off
    /// its own contents; otherwise quiet buckets each get a lookup toward
    /// a random id in their range.
    fn refresh(&self) {
        if self.local.routing().len() < K {
            debug!("routing table thin, re-running bootstrap");
            self.local.start_bootstrap(&[], Box::new(|_| {}));
            return;
        }

        for bucket in self.local.routing().stale_buckets() {
            let target = self.local.routing().random_id_in_bucket(bucket);
            self.local.start_lookup(target, Box::new(|_| {}));
        }
    }
}

/// Builds the reply to an inbound query.
///
/// `get_peers` is answered like `find_node` against the info-hash: this
/// node stores no peers and accepts no announces, so there are never
/// values to return and no token is issued.
fn answer_query(local: &LocalNode, tid: TransactionId, query: &Query) -> Message {
    let nodes = match query {
        Query::Ping => Vec::new(),
        Query::FindNode { target } => local.routing().closest(target, K),
        Query::GetPeers { info_hash } => local.routing().closest(info_hash, K),
    };

    Message::reply(
        tid,
        Reply {
            id: local.current_id(),
            nodes,
            token: None,
        },
    )
}
