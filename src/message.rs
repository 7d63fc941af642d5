//! KRPC message envelopes ([BEP-5]).
//!
//! Every DHT datagram is a single bencoded dictionary with a transaction id
//! (`t`) and a type tag (`y`): `q` for queries, `r` for replies, `e` for
//! errors. This module covers the subset a discovery-only node speaks:
//! `ping`, `find_node`, and `get_peers`.
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

use crate::bencode::{decode, encode, Value};
use crate::error::DhtError;
use crate::node::{Node, NodeId};
use bytes::Bytes;
use std::collections::BTreeMap;

pub type TransactionId = Bytes;

/// An outbound or inbound query body.
#[derive(Debug, Clone)]
pub enum Query {
    Ping,
    FindNode { target: NodeId },
    GetPeers { info_hash: NodeId },
}

impl Query {
    /// The KRPC method name carried in the `q` field.
    pub fn method(&self) -> &'static str {
        match self {
            Query::Ping => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
        }
    }
}

/// A successful reply.
///
/// Replies to all three query kinds share one shape: the responder's id,
/// an optional compact node list, and an optional opaque write token
/// (`get_peers` only; this crate never redeems tokens, it just parses them).
#[derive(Debug, Clone)]
pub struct Reply {
    pub id: NodeId,
    pub nodes: Vec<Node>,
    pub token: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub enum Body {
    Query { id: NodeId, query: Query },
    Reply(Reply),
    Error { code: i64, message: String },
}

#[derive(Debug, Clone)]
pub struct Message {
    pub transaction_id: TransactionId,
    pub body: Body,
}

impl Message {
    /// Builds a query message. The transaction id is left empty; the RPC
    /// layer stamps a fresh one at dispatch time.
    pub fn query(sender: NodeId, query: Query) -> Self {
        Self {
            transaction_id: Bytes::new(),
            body: Body::Query { id: sender, query },
        }
    }

    /// Builds a reply to a received query, echoing its transaction id.
    pub fn reply(transaction_id: TransactionId, reply: Reply) -> Self {
        Self {
            transaction_id,
            body: Body::Reply(reply),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut root = BTreeMap::new();
        root.insert(
            Bytes::from_static(b"t"),
            Value::Bytes(self.transaction_id.clone()),
        );

        match &self.body {
            Body::Query { id, query } => {
                root.insert(Bytes::from_static(b"y"), Value::string("q"));
                root.insert(Bytes::from_static(b"q"), Value::string(query.method()));

                let mut args = BTreeMap::new();
                args.insert(Bytes::from_static(b"id"), id_value(id));
                match query {
                    Query::Ping => {}
                    Query::FindNode { target } => {
                        args.insert(Bytes::from_static(b"target"), id_value(target));
                    }
                    Query::GetPeers { info_hash } => {
                        args.insert(Bytes::from_static(b"info_hash"), id_value(info_hash));
                    }
                }
                root.insert(Bytes::from_static(b"a"), Value::Dict(args));
            }
            Body::Reply(reply) => {
                root.insert(Bytes::from_static(b"y"), Value::string("r"));

                let mut fields = BTreeMap::new();
                fields.insert(Bytes::from_static(b"id"), id_value(&reply.id));
                if !reply.nodes.is_empty() {
                    fields.insert(
                        Bytes::from_static(b"nodes"),
                        Value::Bytes(pack_nodes(&reply.nodes)),
                    );
                }
                if let Some(token) = &reply.token {
                    fields.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
                }
                root.insert(Bytes::from_static(b"r"), Value::Dict(fields));
            }
            Body::Error { code, message } => {
                root.insert(Bytes::from_static(b"y"), Value::string("e"));
                root.insert(
                    Bytes::from_static(b"e"),
                    Value::List(vec![Value::Integer(*code), Value::string(message)]),
                );
            }
        }

        encode(&Value::Dict(root))
    }

    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = decode(data)?;

        let transaction_id = value
            .get(b"t")
            .and_then(|v| v.as_bytes())
            .cloned()
            .ok_or_else(|| DhtError::InvalidMessage("missing transaction id".into()))?;

        let body = match value.get(b"y").and_then(|v| v.as_str()) {
            Some("q") => parse_query(&value)?,
            Some("r") => parse_reply(&value)?,
            Some("e") => parse_error(&value)?,
            Some(other) => {
                return Err(DhtError::InvalidMessage(format!(
                    "unknown message type: {}",
                    other
                )))
            }
            None => return Err(DhtError::InvalidMessage("missing message type".into())),
        };

        Ok(Self {
            transaction_id,
            body,
        })
    }
}

fn id_value(id: &NodeId) -> Value {
    Value::Bytes(Bytes::copy_from_slice(id.as_bytes()))
}

fn parse_id(value: Option<&Value>) -> Result<NodeId, DhtError> {
    value
        .and_then(|v| v.as_bytes())
        .and_then(|b| NodeId::from_bytes(b).ok())
        .ok_or_else(|| DhtError::InvalidMessage("missing or malformed id".into()))
}

fn parse_query(value: &Value) -> Result<Body, DhtError> {
    let args = value
        .get(b"a")
        .and_then(|v| v.as_dict())
        .ok_or_else(|| DhtError::InvalidMessage("missing query args".into()))?;

    let id = parse_id(args.get(b"id".as_slice()))?;

    let query = match value.get(b"q").and_then(|v| v.as_str()) {
        Some("ping") => Query::Ping,
        Some("find_node") => Query::FindNode {
            target: parse_id(args.get(b"target".as_slice()))?,
        },
        Some("get_peers") => Query::GetPeers {
            info_hash: parse_id(args.get(b"info_hash".as_slice()))?,
        },
        Some(other) => {
            return Err(DhtError::InvalidMessage(format!("unknown query: {}", other)))
        }
        None => return Err(DhtError::InvalidMessage("missing query name".into())),
    };

    Ok(Body::Query { id, query })
}

fn parse_reply(value: &Value) -> Result<Body, DhtError> {
    let fields = value
        .get(b"r")
        .and_then(|v| v.as_dict())
        .ok_or_else(|| DhtError::InvalidMessage("missing reply dict".into()))?;

    let id = parse_id(fields.get(b"id".as_slice()))?;

    let nodes = fields
        .get(b"nodes".as_slice())
        .and_then(|v| v.as_bytes())
        .map(|data| unpack_nodes(data))
        .unwrap_or_default();

    let token = fields
        .get(b"token".as_slice())
        .and_then(|v| v.as_bytes())
        .cloned();

    Ok(Body::Reply(Reply { id, nodes, token }))
}

fn parse_error(value: &Value) -> Result<Body, DhtError> {
    let list = value
        .get(b"e")
        .and_then(|v| v.as_list())
        .ok_or_else(|| DhtError::InvalidMessage("missing error list".into()))?;

    let code = list.first().and_then(|v| v.as_integer()).unwrap_or(0);
    let message = list
        .get(1)
        .and_then(|v| v.as_str())
        .unwrap_or("unknown error")
        .to_string();

    Ok(Body::Error { code, message })
}

/// Concatenates nodes into the compact `nodes` byte string, skipping
/// entries with no compact form (IPv6).
pub fn pack_nodes(nodes: &[Node]) -> Bytes {
    let mut out = Vec::with_capacity(nodes.len() * 26);
    for node in nodes {
        if let Some(compact) = node.to_compact() {
            out.extend_from_slice(&compact);
        }
    }
    Bytes::from(out)
}

/// Splits a compact `nodes` byte string back into nodes. A trailing partial
/// chunk is ignored, matching what the wild sends.
pub fn unpack_nodes(data: &[u8]) -> Vec<Node> {
    data.chunks_exact(26).filter_map(Node::from_compact).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{}:6881", last).parse().unwrap()
    }

    #[test]
    fn ping_roundtrip() {
        let sender = NodeId([1u8; 20]);
        let mut msg = Message::query(sender, Query::Ping);
        msg.transaction_id = Bytes::from_static(b"aa");

        let parsed = Message::parse(&msg.encode()).unwrap();
        assert_eq!(parsed.transaction_id, Bytes::from_static(b"aa"));
        match parsed.body {
            Body::Query { id, query: Query::Ping } => assert_eq!(id, sender),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn get_peers_roundtrip_carries_target() {
        let sender = NodeId([1u8; 20]);
        let target = NodeId([9u8; 20]);
        let mut msg = Message::query(sender, Query::GetPeers { info_hash: target });
        msg.transaction_id = Bytes::from_static(b"bb");

        let parsed = Message::parse(&msg.encode()).unwrap();
        match parsed.body {
            Body::Query {
                query: Query::GetPeers { info_hash },
                ..
            } => assert_eq!(info_hash, target),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn find_node_roundtrip() {
        let target = NodeId([4u8; 20]);
        let mut msg = Message::query(NodeId([1u8; 20]), Query::FindNode { target });
        msg.transaction_id = Bytes::from_static(b"cc");

        let parsed = Message::parse(&msg.encode()).unwrap();
        match parsed.body {
            Body::Query {
                query: Query::FindNode { target: t },
                ..
            } => assert_eq!(t, target),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn reply_roundtrip_with_nodes() {
        let responder = NodeId([2u8; 20]);
        let nodes = vec![
            Node::new(NodeId([3u8; 20]), addr(3)),
            Node::new(NodeId([4u8; 20]), addr(4)),
        ];
        let msg = Message::reply(
            Bytes::from_static(b"dd"),
            Reply {
                id: responder,
                nodes,
                token: Some(Bytes::from_static(b"tok")),
            },
        );

        let parsed = Message::parse(&msg.encode()).unwrap();
        match parsed.body {
            Body::Reply(reply) => {
                assert_eq!(reply.id, responder);
                assert_eq!(reply.nodes.len(), 2);
                assert_eq!(reply.nodes[1].addr, addr(4));
                assert_eq!(reply.token, Some(Bytes::from_static(b"tok")));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn reply_without_nodes_parses_empty() {
        let msg = Message::reply(
            Bytes::from_static(b"ee"),
            Reply {
                id: NodeId([2u8; 20]),
                nodes: Vec::new(),
                token: None,
            },
        );

        let parsed = Message::parse(&msg.encode()).unwrap();
        match parsed.body {
            Body::Reply(reply) => {
                assert!(reply.nodes.is_empty());
                assert!(reply.token.is_none());
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn error_parses() {
        let data = b"d1:eli201e12:server errore1:t2:ff1:y1:ee";
        let parsed = Message::parse(data).unwrap();
        match parsed.body {
            Body::Error { code, message } => {
                assert_eq!(code, 201);
                assert_eq!(message, "server error");
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn parse_rejects_missing_transaction_id() {
        let data = b"d1:y1:qe";
        assert!(Message::parse(data).is_err());
    }

    #[test]
    fn unpack_nodes_ignores_trailing_partial_chunk() {
        let node = Node::new(NodeId([5u8; 20]), addr(5));
        let mut data = pack_nodes(&[node]).to_vec();
        data.extend_from_slice(&[0u8; 10]);
        assert_eq!(unpack_nodes(&data).len(), 1);
    }
}
