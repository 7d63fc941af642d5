//! Outbound RPC plumbing.
//!
//! Every dispatched query is tracked by an [`Observer`]: the object that
//! correlates the in-flight transaction with whoever is waiting on it. The
//! [`RpcManager`] owns the pending-transaction table, stamps transaction
//! ids, hands datagrams to the [`Transport`], and routes replies, errors,
//! and timeouts back through the observer's handler.
//!
//! A run that has been torn down simply ignores late deliveries: observers
//! hold shared ownership of their handler, so nothing dangles.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::message::{Message, Reply, TransactionId};
use crate::node::NodeId;

/// Ceiling on simultaneously outstanding queries across all lookups.
pub(crate) const MAX_PENDING_QUERIES: usize = 100;

/// How long a query may wait for its reply.
const QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Where a datagram goes once it is built.
///
/// `send` returns whether the payload was handed to the network; `false`
/// means local dispatch failure and the caller should give up on the query
/// immediately rather than wait out a timeout.
pub trait Transport: Send + Sync {
    fn send(&self, data: &[u8], addr: SocketAddr) -> bool;
}

/// The production transport: a shared UDP socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl Transport for UdpTransport {
    fn send(&self, data: &[u8], addr: SocketAddr) -> bool {
        match self.socket.try_send_to(data, addr) {
            Ok(sent) => sent == data.len(),
            Err(err) => {
                debug!(%addr, %err, "udp send failed");
                false
            }
        }
    }
}

/// Receives the outcome of one tracked query.
pub trait ResponseHandler: Send + Sync {
    fn on_reply(&self, observer: &Observer, reply: &Reply);
    fn on_timeout(&self, observer: &Observer);
}

/// Per-query state binding an in-flight transaction to its endpoint, the
/// claimed id of the queried peer (when known), and the handler that owns
/// the outcome.
pub struct Observer {
    handler: Arc<dyn ResponseHandler>,
    addr: SocketAddr,
    id: Option<NodeId>,
}

impl Observer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn id(&self) -> Option<NodeId> {
        self.id
    }

    fn handler(&self) -> &Arc<dyn ResponseHandler> {
        &self.handler
    }
}

struct Pending {
    observer: Arc<Observer>,
    sent_at: Instant,
}

pub struct RpcManager {
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<TransactionId, Pending>>,
}

impl RpcManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates an observer for a query about to be dispatched.
    ///
    /// Returns `None` when the pending table is full; the caller is
    /// expected to skip the query, not retry.
    pub fn allocate_observer(
        &self,
        handler: Arc<dyn ResponseHandler>,
        addr: SocketAddr,
        id: Option<NodeId>,
    ) -> Option<Arc<Observer>> {
        if self.pending.lock().len() >= MAX_PENDING_QUERIES {
            warn!(%addr, "observer limit reached, skipping query");
            return None;
        }
        Some(Arc::new(Observer { handler, addr, id }))
    }

    /// Stamps a fresh transaction id onto `msg`, registers the observer,
    /// and hands the datagram to the transport.
    ///
    /// On transport failure the registration is rolled back and `false` is
    /// returned; no callback will ever fire for this attempt.
    pub fn invoke(&self, mut msg: Message, addr: SocketAddr, observer: Arc<Observer>) -> bool {
        let tid = {
            let mut pending = self.pending.lock();
            let tid = loop {
                let raw: [u8; 2] = rand::random();
                let candidate = Bytes::copy_from_slice(&raw);
                if !pending.contains_key(&candidate) {
                    break candidate;
                }
            };
            pending.insert(
                tid.clone(),
                Pending {
                    observer,
                    sent_at: Instant::now(),
                },
            );
            tid
        };

        msg.transaction_id = tid.clone();
        if self.transport.send(&msg.encode(), addr) {
            true
        } else {
            self.pending.lock().remove(&tid);
            false
        }
    }

    /// Routes a reply to the observer registered under its transaction id.
    ///
    /// Replies from an address other than the one queried are left pending;
    /// a UDP source is trivial to forge and the real reply may still come.
    pub fn handle_reply(&self, tid: &TransactionId, from: SocketAddr, reply: &Reply) {
        let entry = self.pending.lock().remove(tid);
        let Some(entry) = entry else {
            debug!(%from, "reply with unknown transaction id");
            return;
        };

        if entry.observer.addr() != from {
            debug!(%from, expected = %entry.observer.addr(), "reply source mismatch");
            self.pending.lock().insert(tid.clone(), entry);
            return;
        }

        entry.observer.handler().on_reply(&entry.observer, reply);
    }

    /// An error reply settles the transaction the same way a timeout does.
    pub fn handle_error(&self, tid: &TransactionId, from: SocketAddr, code: i64, message: &str) {
        let entry = self.pending.lock().remove(tid);
        let Some(entry) = entry else {
            return;
        };

        if entry.observer.addr() != from {
            self.pending.lock().insert(tid.clone(), entry);
            return;
        }

        debug!(%from, code, message, "error reply");
        entry.observer.handler().on_timeout(&entry.observer);
    }

    /// Expires queries that have waited out their time budget. Driven
    /// periodically by the server loop.
    pub fn check_timeouts(&self) {
        self.expire_older_than(QUERY_TIMEOUT);
    }

    pub(crate) fn expire_older_than(&self, age: Duration) {
        let expired: Vec<Pending> = {
            let mut pending = self.pending.lock();
            let now = Instant::now();
            let stale: Vec<TransactionId> = pending
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.sent_at) >= age)
                .map(|(tid, _)| tid.clone())
                .collect();
            stale.into_iter().filter_map(|tid| pending.remove(&tid)).collect()
        };

        // deliver outside the lock: handlers will re-enter to dispatch more
        for entry in expired {
            entry.observer.handler().on_timeout(&entry.observer);
        }
    }

    /// Number of queries currently awaiting a reply.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }
}
