//! rdht - A BitTorrent mainline DHT node library
//!
//! This library implements the node side of the Kademlia-based DHT used by
//! BitTorrent ([BEP-5]), with a focus on the part that matters most in
//! practice: joining the network. A fresh node knows almost nobody, so it
//! runs an iterative *bootstrap* walk that queries progressively discovered
//! peers until it has seeded its routing table across the identifier space.
//!
//! # Modules
//!
//! - [`bencode`] - KRPC wire value encoding/decoding
//! - [`node`] - 160-bit node identifiers, XOR distance, peer entries
//! - [`message`] - KRPC query/response envelopes
//! - [`routing`] - bucketed routing table with verified insertion
//! - [`rpc`] - observer allocation, dispatch, and response/timeout delivery
//! - [`traversal`] - the generic iterative lookup engine
//! - [`bootstrap`] - the bootstrap specialization of the engine
//! - [`server`] - the [`DhtNode`] facade: socket, run loop, responder
//!
//! # Getting started
//!
//! ```no_run
//! use rdht::{resolve_routers, DhtNode, BOOTSTRAP_ROUTERS};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), rdht::DhtError> {
//! let node = Arc::new(DhtNode::bind(6881).await?);
//!
//! let runner = node.clone();
//! tokio::spawn(async move { runner.run().await });
//!
//! let routers = resolve_routers(BOOTSTRAP_ROUTERS).await;
//! node.bootstrap(&routers).await;
//! # Ok(())
//! # }
//! ```
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

pub mod bencode;
pub mod bootstrap;
pub mod error;
pub mod local;
pub mod message;
pub mod node;
pub mod routing;
pub mod rpc;
pub mod server;
pub mod traversal;

pub use bencode::{decode, encode, BencodeError, Value};
pub use bootstrap::Bootstrap;
pub use error::DhtError;
pub use local::{LocalNode, Stats};
pub use message::{Body, Message, Query, Reply, TransactionId};
pub use node::{Node, NodeId};
pub use routing::RoutingTable;
pub use rpc::{Observer, ResponseHandler, RpcManager, Transport, UdpTransport};
pub use server::{resolve_routers, DhtNode, BOOTSTRAP_ROUTERS};
pub use traversal::{Candidate, DoneCallback, LookupKind, NodeLookup, Traversal, TraversalState};

#[cfg(test)]
pub(crate) mod testutil;
