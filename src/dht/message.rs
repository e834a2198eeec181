//! Wire messages: typed queries, replies and errors.
//!
//! Every datagram is a bencoded dictionary with a transaction id (`t`), a
//! type tag (`y` = q/r/e) and a body. Parsing validates each message once,
//! against a [`KeyDesc`] schema, so the handlers downstream only ever see
//! typed fields. Encoders are the mirror image and always attach the client
//! version tag.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;

use crate::bencode::{
    decode, encode, verify_message, KeyDesc, Kind, Value, FLAG_OPTIONAL,
};
use crate::constants::{CLIENT_VERSION, MAX_ITEM_SIZE, MAX_SALT_SIZE};

use super::bloom::{BloomFilter, BLOOM_SIZE};
use super::node::{
    decode_endpoint, encode_compact_nodes, encode_endpoint, parse_compact_nodes, Family, Node,
    NodeId,
};
use super::sign::{PublicKey, Signature};

pub type TransactionId = Bytes;

// error codes of the `e` message taxonomy
pub const ERR_GENERIC: i64 = 201;
pub const ERR_SERVER: i64 = 202;
pub const ERR_PROTOCOL: i64 = 203;
pub const ERR_METHOD_UNKNOWN: i64 = 204;
pub const ERR_REFUSED: i64 = 205;
pub const ERR_INVALID_SIGNATURE: i64 = 206;
pub const ERR_CAS_MISMATCH: i64 = 301;
pub const ERR_SEQ_TOO_LOW: i64 = 302;

/// Address families requested via the `want` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Want {
    pub v4: bool,
    pub v6: bool,
}

impl Want {
    /// Parses a `want` list. Unknown tags are ignored.
    fn from_slot(slot: Option<&Value>) -> Self {
        let mut want = Want {
            v4: false,
            v6: false,
        };
        if let Some(list) = slot.and_then(|v| v.as_list()) {
            for entry in list {
                match entry.as_str() {
                    Some("n4") => want.v4 = true,
                    Some("n6") => want.v6 = true,
                    _ => {}
                }
            }
        }
        want
    }

    /// When neither known tag was present, fall back to the family of the
    /// requester.
    pub fn resolve(self, family: Family) -> Want {
        if self.v4 || self.v6 {
            return self;
        }
        match family {
            Family::V4 => Want {
                v4: true,
                v6: false,
            },
            Family::V6 => Want {
                v4: false,
                v6: true,
            },
        }
    }
}

/// A parsed inbound query.
#[derive(Debug, Clone)]
pub struct Query {
    pub id: NodeId,
    pub read_only: bool,
    pub body: QueryBody,
}

#[derive(Debug, Clone)]
pub enum QueryBody {
    Ping,
    FindNode {
        target: NodeId,
        want: Want,
    },
    GetPeers {
        info_hash: NodeId,
        scrape: bool,
        no_seed: bool,
        want: Want,
    },
    AnnouncePeer {
        info_hash: NodeId,
        port: u16,
        implied_port: bool,
        token: Bytes,
        seed: bool,
        name: Option<Bytes>,
    },
    Get {
        target: NodeId,
        seq: Option<i64>,
        want: Want,
    },
    Put(Box<PutArgs>),
}

impl QueryBody {
    pub fn method(&self) -> &'static str {
        match self {
            QueryBody::Ping => "ping",
            QueryBody::FindNode { .. } => "find_node",
            QueryBody::GetPeers { .. } => "get_peers",
            QueryBody::AnnouncePeer { .. } => "announce_peer",
            QueryBody::Get { .. } => "get",
            QueryBody::Put(_) => "put",
        }
    }

    /// Lookup queries may be retransmitted on timeout; mutating queries may
    /// not.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            QueryBody::FindNode { .. } | QueryBody::GetPeers { .. } | QueryBody::Get { .. }
        )
    }
}

/// Arguments of a `put` query.
#[derive(Debug, Clone)]
pub struct PutArgs {
    pub token: Bytes,
    /// The parsed value payload.
    pub value: Value,
    /// Canonical bencoding of the payload; input to signatures and targets.
    pub value_bytes: Bytes,
    pub mutable: Option<MutablePut>,
}

#[derive(Debug, Clone)]
pub struct MutablePut {
    pub public_key: PublicKey,
    pub signature: Signature,
    pub seq: i64,
    pub cas: Option<i64>,
    pub salt: Bytes,
}

/// A BEP-44 item carried in a `get` reply.
#[derive(Debug, Clone)]
pub struct ReplyItem {
    pub value: Value,
    pub value_bytes: Bytes,
    /// `(k, sig, seq)` when the item is mutable.
    pub mutable: Option<(PublicKey, Signature, i64)>,
}

/// A parsed reply body. Fields the responder omitted are empty/`None`.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub id: NodeId,
    pub nodes: Vec<Node>,
    pub nodes6: Vec<Node>,
    pub values: Vec<SocketAddr>,
    pub token: Option<Bytes>,
    pub item: Option<ReplyItem>,
    /// `(seeds, downloaders)` scrape filters.
    pub scrape: Option<(BloomFilter, BloomFilter)>,
    /// Our address as the responder observed it (BEP-42 `ip` field).
    pub external_ip: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub enum Message {
    Query {
        transaction_id: TransactionId,
        query: Query,
    },
    Reply {
        transaction_id: TransactionId,
        reply: Reply,
    },
    Error {
        transaction_id: TransactionId,
        code: i64,
        message: String,
    },
}

/// A message that failed validation.
///
/// When `respond` is set and the transaction id survived parsing, the node
/// answers with an error message carrying `code` and `message`; otherwise
/// the datagram is dropped.
#[derive(Debug)]
pub struct ParseError {
    pub transaction_id: Option<TransactionId>,
    pub code: i64,
    pub message: String,
    /// Malformed queries get an error reply; malformed responses do not.
    pub respond: bool,
}

impl ParseError {
    fn protocol(tid: Option<TransactionId>, message: impl Into<String>) -> Self {
        Self {
            transaction_id: tid,
            code: ERR_PROTOCOL,
            message: message.into(),
            respond: true,
        }
    }
}

const ENVELOPE_DESC: &[KeyDesc] = &[
    KeyDesc::new("t", Kind::String, 0, 0),
    KeyDesc::new("y", Kind::String, 1, 0),
    KeyDesc::new("q", Kind::String, 0, FLAG_OPTIONAL),
    KeyDesc::new("a", Kind::Dict, 0, FLAG_OPTIONAL),
    KeyDesc::new("r", Kind::Dict, 0, FLAG_OPTIONAL),
    KeyDesc::new("e", Kind::List, 2, FLAG_OPTIONAL),
    KeyDesc::new("ro", Kind::Integer, 0, FLAG_OPTIONAL),
    KeyDesc::new("ip", Kind::String, 0, FLAG_OPTIONAL),
];

const PING_DESC: &[KeyDesc] = &[KeyDesc::new("id", Kind::String, 20, 0)];

const FIND_NODE_DESC: &[KeyDesc] = &[
    KeyDesc::new("id", Kind::String, 20, 0),
    KeyDesc::new("target", Kind::String, 20, 0),
    KeyDesc::new("want", Kind::List, 0, FLAG_OPTIONAL),
];

const GET_PEERS_DESC: &[KeyDesc] = &[
    KeyDesc::new("id", Kind::String, 20, 0),
    KeyDesc::new("info_hash", Kind::String, 20, 0),
    KeyDesc::new("scrape", Kind::Integer, 0, FLAG_OPTIONAL),
    KeyDesc::new("noseed", Kind::Integer, 0, FLAG_OPTIONAL),
    KeyDesc::new("want", Kind::List, 0, FLAG_OPTIONAL),
];

const ANNOUNCE_DESC: &[KeyDesc] = &[
    KeyDesc::new("id", Kind::String, 20, 0),
    KeyDesc::new("info_hash", Kind::String, 20, 0),
    KeyDesc::new("port", Kind::Integer, 0, 0),
    KeyDesc::new("token", Kind::String, 0, 0),
    KeyDesc::new("implied_port", Kind::Integer, 0, FLAG_OPTIONAL),
    KeyDesc::new("seed", Kind::Integer, 0, FLAG_OPTIONAL),
    KeyDesc::new("name", Kind::String, 0, FLAG_OPTIONAL),
];

const GET_DESC: &[KeyDesc] = &[
    KeyDesc::new("id", Kind::String, 20, 0),
    KeyDesc::new("target", Kind::String, 20, 0),
    KeyDesc::new("seq", Kind::Integer, 0, FLAG_OPTIONAL),
    KeyDesc::new("want", Kind::List, 0, FLAG_OPTIONAL),
];

const PUT_DESC: &[KeyDesc] = &[
    KeyDesc::new("id", Kind::String, 20, 0),
    KeyDesc::new("token", Kind::String, 0, 0),
    KeyDesc::new("v", Kind::Any, 0, 0),
    KeyDesc::new("k", Kind::String, 32, FLAG_OPTIONAL),
    KeyDesc::new("sig", Kind::String, 64, FLAG_OPTIONAL),
    KeyDesc::new("seq", Kind::Integer, 0, FLAG_OPTIONAL),
    KeyDesc::new("cas", Kind::Integer, 0, FLAG_OPTIONAL),
    KeyDesc::new("salt", Kind::String, 0, FLAG_OPTIONAL),
];

const REPLY_DESC: &[KeyDesc] = &[
    KeyDesc::new("id", Kind::String, 20, 0),
    KeyDesc::new("nodes", Kind::String, 0, FLAG_OPTIONAL),
    KeyDesc::new("nodes6", Kind::String, 0, FLAG_OPTIONAL),
    KeyDesc::new("values", Kind::List, 0, FLAG_OPTIONAL),
    KeyDesc::new("token", Kind::String, 0, FLAG_OPTIONAL),
    KeyDesc::new("v", Kind::Any, 0, FLAG_OPTIONAL),
    KeyDesc::new("k", Kind::String, 32, FLAG_OPTIONAL),
    KeyDesc::new("sig", Kind::String, 64, FLAG_OPTIONAL),
    KeyDesc::new("seq", Kind::Integer, 0, FLAG_OPTIONAL),
    KeyDesc::new("BFsd", Kind::String, BLOOM_SIZE, FLAG_OPTIONAL),
    KeyDesc::new("BFpe", Kind::String, BLOOM_SIZE, FLAG_OPTIONAL),
];

fn slot_node_id(slot: Option<&Value>) -> NodeId {
    // size 20 was enforced by the schema
    slot.and_then(|v| v.as_bytes())
        .and_then(|b| NodeId::from_bytes(b).ok())
        .unwrap_or(NodeId::ZERO)
}

fn slot_bytes(slot: Option<&Value>) -> Bytes {
    slot.and_then(|v| v.as_bytes()).cloned().unwrap_or_default()
}

fn slot_flag(slot: Option<&Value>) -> bool {
    slot.and_then(|v| v.as_integer()) == Some(1)
}

impl Message {
    /// Parses and validates one datagram.
    pub fn parse(data: &[u8]) -> Result<Message, ParseError> {
        let value = decode(data).map_err(|e| ParseError::protocol(None, e.to_string()))?;

        let slots = verify_message(&value, ENVELOPE_DESC)
            .map_err(|e| ParseError::protocol(None, e))?;

        let transaction_id = slot_bytes(slots[0]);
        let tid = Some(transaction_id.clone());

        match slots[1].and_then(|v| v.as_str()) {
            Some("q") => {
                let method = slots[2]
                    .ok_or_else(|| ParseError::protocol(tid.clone(), "missing 'q' key"))?;
                let args = slots[3]
                    .ok_or_else(|| ParseError::protocol(tid.clone(), "missing 'a' key"))?;
                let read_only = slot_flag(slots[6]);

                let query = parse_query(method, args, read_only).map_err(|(code, message)| {
                    ParseError {
                        transaction_id: tid.clone(),
                        code,
                        message,
                        respond: true,
                    }
                })?;

                Ok(Message::Query {
                    transaction_id,
                    query,
                })
            }
            Some("r") => {
                let body = slots[4]
                    .ok_or_else(|| ParseError::protocol(tid.clone(), "missing 'r' key"))?;

                let mut reply = parse_reply(body).map_err(|e| ParseError {
                    transaction_id: tid.clone(),
                    code: ERR_PROTOCOL,
                    message: e,
                    respond: false,
                })?;
                reply.external_ip = slots[7]
                    .and_then(|v| v.as_bytes())
                    .and_then(|b| decode_endpoint(b))
                    .map(|(ip, port)| SocketAddr::new(ip, port));

                Ok(Message::Reply {
                    transaction_id,
                    reply,
                })
            }
            Some("e") => {
                let list = slots[5]
                    .and_then(|v| v.as_list())
                    .ok_or_else(|| ParseError::protocol(tid.clone(), "missing 'e' key"))?;

                let code = list
                    .first()
                    .and_then(|v| v.as_integer())
                    .ok_or_else(|| ParseError::protocol(tid.clone(), "invalid 'e' entry"))?;
                let message = list
                    .get(1)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();

                Ok(Message::Error {
                    transaction_id,
                    code,
                    message,
                })
            }
            _ => Err(ParseError::protocol(tid, "invalid 'y' entry")),
        }
    }
}

fn parse_query(method: &Value, args: &Value, read_only: bool) -> Result<Query, (i64, String)> {
    let method = method.as_str().unwrap_or_default();

    let (desc, build): (&[KeyDesc], fn(&[Option<&Value>]) -> Result<QueryBody, String>) =
        match method {
            "ping" => (PING_DESC, |_| Ok(QueryBody::Ping)),
            "find_node" => (FIND_NODE_DESC, |slots| {
                Ok(QueryBody::FindNode {
                    target: slot_node_id(slots[1]),
                    want: Want::from_slot(slots[2]),
                })
            }),
            "get_peers" => (GET_PEERS_DESC, |slots| {
                Ok(QueryBody::GetPeers {
                    info_hash: slot_node_id(slots[1]),
                    scrape: slot_flag(slots[2]),
                    no_seed: slot_flag(slots[3]),
                    want: Want::from_slot(slots[4]),
                })
            }),
            "announce_peer" => (ANNOUNCE_DESC, |slots| {
                let port = slots[2].and_then(|v| v.as_integer()).unwrap_or(0);
                if !(0..=u16::MAX as i64).contains(&port) {
                    return Err("invalid 'port' entry".into());
                }
                Ok(QueryBody::AnnouncePeer {
                    info_hash: slot_node_id(slots[1]),
                    port: port as u16,
                    token: slot_bytes(slots[3]),
                    implied_port: slot_flag(slots[4]),
                    seed: slot_flag(slots[5]),
                    name: slots[6].and_then(|v| v.as_bytes()).cloned(),
                })
            }),
            "get" => (GET_DESC, |slots| {
                Ok(QueryBody::Get {
                    target: slot_node_id(slots[1]),
                    seq: slots[2].and_then(|v| v.as_integer()),
                    want: Want::from_slot(slots[3]),
                })
            }),
            "put" => (PUT_DESC, |slots| {
                let value = slots[2].cloned().ok_or("missing 'v' key")?;
                let value_bytes = Bytes::from(encode(&value));
                if value_bytes.len() > MAX_ITEM_SIZE {
                    return Err("message too big".into());
                }

                let mutable = match (slots[3], slots[4], slots[5]) {
                    (None, None, None) => None,
                    (Some(k), sig, seq) => {
                        let sig = sig.ok_or("missing 'sig' key")?;
                        let seq = seq.and_then(|v| v.as_integer()).ok_or("missing 'seq' key")?;
                        let salt = slot_bytes(slots[7]);
                        if salt.len() > MAX_SALT_SIZE {
                            return Err("salt too big".into());
                        }
                        Some(MutablePut {
                            public_key: PublicKey::from_bytes(
                                k.as_bytes().map(|b| b.as_ref()).unwrap_or_default(),
                            )
                            .map_err(|_| "invalid 'k' entry")?,
                            signature: Signature::from_bytes(
                                sig.as_bytes().map(|b| b.as_ref()).unwrap_or_default(),
                            )
                            .map_err(|_| "invalid 'sig' entry")?,
                            seq,
                            cas: slots[6].and_then(|v| v.as_integer()),
                            salt,
                        })
                    }
                    _ => return Err("missing 'k' key".into()),
                };

                Ok(QueryBody::Put(Box::new(PutArgs {
                    token: slot_bytes(slots[1]),
                    value,
                    value_bytes,
                    mutable,
                })))
            }),
            _ => {
                return Err((ERR_METHOD_UNKNOWN, "method unknown".into()));
            }
        };

    let slots = verify_message(args, desc).map_err(|e| (ERR_PROTOCOL, e))?;
    let id = slot_node_id(slots[0]);
    let body = build(&slots).map_err(|e| (ERR_PROTOCOL, e))?;

    Ok(Query {
        id,
        read_only,
        body,
    })
}

fn parse_reply(body: &Value) -> Result<Reply, String> {
    let slots = verify_message(body, REPLY_DESC)?;

    let nodes = slots[1]
        .and_then(|v| v.as_bytes())
        .map(|b| parse_compact_nodes(b, Family::V4))
        .unwrap_or_default();
    let nodes6 = slots[2]
        .and_then(|v| v.as_bytes())
        .map(|b| parse_compact_nodes(b, Family::V6))
        .unwrap_or_default();

    let values = slots[3]
        .and_then(|v| v.as_list())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_bytes())
                .filter_map(|b| decode_endpoint(b))
                .map(|(ip, port)| SocketAddr::new(ip, port))
                .collect()
        })
        .unwrap_or_default();

    let item = slots[5].map(|v| {
        let value_bytes = Bytes::from(encode(v));
        let mutable = match (slots[6], slots[7], slots[8]) {
            (Some(k), Some(sig), Some(seq)) => {
                let pk = PublicKey::from_bytes(k.as_bytes().map(|b| b.as_ref()).unwrap_or_default());
                let sig =
                    Signature::from_bytes(sig.as_bytes().map(|b| b.as_ref()).unwrap_or_default());
                match (pk, sig, seq.as_integer()) {
                    (Ok(pk), Ok(sig), Some(seq)) => Some((pk, sig, seq)),
                    _ => None,
                }
            }
            _ => None,
        };
        ReplyItem {
            value: v.clone(),
            value_bytes,
            mutable,
        }
    });

    let scrape = match (slots[9], slots[10]) {
        (Some(sd), Some(pe)) => {
            let seeds = sd.as_bytes().and_then(|b| BloomFilter::from_bytes(b));
            let downloaders = pe.as_bytes().and_then(|b| BloomFilter::from_bytes(b));
            match (seeds, downloaders) {
                (Some(s), Some(d)) => Some((s, d)),
                _ => None,
            }
        }
        _ => None,
    };

    Ok(Reply {
        id: slot_node_id(slots[0]),
        nodes,
        nodes6,
        values,
        token: slots[4].and_then(|v| v.as_bytes()).cloned(),
        item,
        scrape,
        external_ip: None,
    })
}

// ---------------------------------------------------------------------------
// encoding
// ---------------------------------------------------------------------------

fn key(name: &'static str) -> Bytes {
    Bytes::from_static(name.as_bytes())
}

fn id_value(id: &NodeId) -> Value {
    Value::Bytes(Bytes::copy_from_slice(id.as_bytes()))
}

fn want_value(want: Want) -> Option<Value> {
    if !want.v4 && !want.v6 {
        return None;
    }
    let mut list = Vec::new();
    if want.v4 {
        list.push(Value::string("n4"));
    }
    if want.v6 {
        list.push(Value::string("n6"));
    }
    Some(Value::List(list))
}

/// Encodes a query datagram.
pub fn encode_query(
    transaction_id: &TransactionId,
    our_id: &NodeId,
    read_only: bool,
    body: &QueryBody,
) -> Vec<u8> {
    let mut args = BTreeMap::new();
    args.insert(key("id"), id_value(our_id));

    match body {
        QueryBody::Ping => {}
        QueryBody::FindNode { target, want } => {
            args.insert(key("target"), id_value(target));
            if let Some(w) = want_value(*want) {
                args.insert(key("want"), w);
            }
        }
        QueryBody::GetPeers {
            info_hash,
            scrape,
            no_seed,
            want,
        } => {
            args.insert(key("info_hash"), id_value(info_hash));
            if *scrape {
                args.insert(key("scrape"), Value::Integer(1));
            }
            if *no_seed {
                args.insert(key("noseed"), Value::Integer(1));
            }
            if let Some(w) = want_value(*want) {
                args.insert(key("want"), w);
            }
        }
        QueryBody::AnnouncePeer {
            info_hash,
            port,
            implied_port,
            token,
            seed,
            name,
        } => {
            args.insert(key("info_hash"), id_value(info_hash));
            args.insert(key("port"), Value::Integer(*port as i64));
            args.insert(key("token"), Value::Bytes(token.clone()));
            if *implied_port {
                args.insert(key("implied_port"), Value::Integer(1));
            }
            if *seed {
                args.insert(key("seed"), Value::Integer(1));
            }
            if let Some(name) = name {
                args.insert(key("name"), Value::Bytes(name.clone()));
            }
        }
        QueryBody::Get { target, seq, want } => {
            args.insert(key("target"), id_value(target));
            if let Some(seq) = seq {
                args.insert(key("seq"), Value::Integer(*seq));
            }
            if let Some(w) = want_value(*want) {
                args.insert(key("want"), w);
            }
        }
        QueryBody::Put(put) => {
            args.insert(key("token"), Value::Bytes(put.token.clone()));
            args.insert(key("v"), put.value.clone());
            if let Some(m) = &put.mutable {
                args.insert(key("k"), Value::bytes(&m.public_key.0));
                args.insert(key("sig"), Value::bytes(&m.signature.0));
                args.insert(key("seq"), Value::Integer(m.seq));
                if let Some(cas) = m.cas {
                    args.insert(key("cas"), Value::Integer(cas));
                }
                if !m.salt.is_empty() {
                    args.insert(key("salt"), Value::Bytes(m.salt.clone()));
                }
            }
        }
    }

    let mut dict = BTreeMap::new();
    dict.insert(key("t"), Value::Bytes(transaction_id.clone()));
    dict.insert(key("y"), Value::string("q"));
    dict.insert(key("q"), Value::string(body.method()));
    dict.insert(key("a"), Value::Dict(args));
    dict.insert(key("v"), Value::bytes(&CLIENT_VERSION));
    if read_only {
        dict.insert(key("ro"), Value::Integer(1));
    }

    encode(&Value::Dict(dict))
}

/// Encodes a reply datagram, echoing the requester's observed address in
/// the top-level `ip` field (BEP-42).
pub fn encode_reply(
    transaction_id: &TransactionId,
    reply: &Reply,
    requester: Option<&SocketAddr>,
) -> Vec<u8> {
    let mut body = BTreeMap::new();
    body.insert(key("id"), id_value(&reply.id));

    if !reply.nodes.is_empty() {
        body.insert(
            key("nodes"),
            Value::bytes(&encode_compact_nodes(&reply.nodes, Family::V4)),
        );
    }
    if !reply.nodes6.is_empty() {
        body.insert(
            key("nodes6"),
            Value::bytes(&encode_compact_nodes(&reply.nodes6, Family::V6)),
        );
    }
    if !reply.values.is_empty() {
        let values: Vec<Value> = reply
            .values
            .iter()
            .map(|addr| Value::bytes(&encode_endpoint(addr)))
            .collect();
        body.insert(key("values"), Value::List(values));
    }
    if let Some(token) = &reply.token {
        body.insert(key("token"), Value::Bytes(token.clone()));
    }
    if let Some(item) = &reply.item {
        body.insert(key("v"), item.value.clone());
        if let Some((pk, sig, seq)) = &item.mutable {
            body.insert(key("k"), Value::bytes(&pk.0));
            body.insert(key("sig"), Value::bytes(&sig.0));
            body.insert(key("seq"), Value::Integer(*seq));
        }
    }
    if let Some((seeds, downloaders)) = &reply.scrape {
        body.insert(key("BFsd"), Value::bytes(seeds.as_bytes()));
        body.insert(key("BFpe"), Value::bytes(downloaders.as_bytes()));
    }

    let mut dict = BTreeMap::new();
    dict.insert(key("t"), Value::Bytes(transaction_id.clone()));
    dict.insert(key("y"), Value::string("r"));
    dict.insert(key("r"), Value::Dict(body));
    dict.insert(key("v"), Value::bytes(&CLIENT_VERSION));
    if let Some(addr) = requester {
        dict.insert(key("ip"), Value::bytes(&encode_endpoint(addr)));
    }

    encode(&Value::Dict(dict))
}

/// Encodes an error datagram.
pub fn encode_error(transaction_id: &TransactionId, code: i64, message: &str) -> Vec<u8> {
    let mut dict = BTreeMap::new();
    dict.insert(key("t"), Value::Bytes(transaction_id.clone()));
    dict.insert(key("y"), Value::string("e"));
    dict.insert(
        key("e"),
        Value::List(vec![Value::Integer(code), Value::string(message)]),
    );
    dict.insert(key("v"), Value::bytes(&CLIENT_VERSION));

    encode(&Value::Dict(dict))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn tid() -> TransactionId {
        Bytes::from_static(b"aa")
    }

    #[test]
    fn test_ping_roundtrip() {
        let our_id = NodeId::generate();
        let encoded = encode_query(&tid(), &our_id, false, &QueryBody::Ping);

        match Message::parse(&encoded).unwrap() {
            Message::Query {
                transaction_id,
                query,
            } => {
                assert_eq!(transaction_id, tid());
                assert_eq!(query.id, our_id);
                assert!(!query.read_only);
                assert!(matches!(query.body, QueryBody::Ping));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_read_only_flag() {
        let encoded = encode_query(&tid(), &NodeId::generate(), true, &QueryBody::Ping);
        match Message::parse(&encoded).unwrap() {
            Message::Query { query, .. } => assert!(query.read_only),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_find_node_roundtrip() {
        let target = NodeId::generate();
        let encoded = encode_query(
            &tid(),
            &NodeId::generate(),
            false,
            &QueryBody::FindNode {
                target,
                want: Want {
                    v4: true,
                    v6: true,
                },
            },
        );

        match Message::parse(&encoded).unwrap() {
            Message::Query { query, .. } => match query.body {
                QueryBody::FindNode { target: t, want } => {
                    assert_eq!(t, target);
                    assert!(want.v4 && want.v6);
                }
                other => panic!("unexpected body: {:?}", other),
            },
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_want_unknown_tags_ignored() {
        let raw = b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaa6:target20:bbbbbbbbbbbbbbbbbbbb4:wantl2:n72:n6ee1:q9:find_node1:t2:aa1:y1:qe";
        match Message::parse(raw).unwrap() {
            Message::Query { query, .. } => match query.body {
                QueryBody::FindNode { want, .. } => {
                    assert!(!want.v4);
                    assert!(want.v6);
                }
                other => panic!("unexpected body: {:?}", other),
            },
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_want_resolve_falls_back_to_requester_family() {
        let none = Want {
            v4: false,
            v6: false,
        };
        assert_eq!(
            none.resolve(Family::V4),
            Want {
                v4: true,
                v6: false
            }
        );
        assert_eq!(
            none.resolve(Family::V6),
            Want {
                v4: false,
                v6: true
            }
        );

        let explicit = Want {
            v4: false,
            v6: true,
        };
        assert_eq!(explicit.resolve(Family::V4), explicit);
    }

    #[test]
    fn test_missing_key_is_reported() {
        // announce_peer without a token
        let raw =
            b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaa9:info_hash20:bbbbbbbbbbbbbbbbbbbb4:porti1234ee1:q13:announce_peer1:t2:aa1:y1:qe";
        let err = Message::parse(raw).unwrap_err();
        assert_eq!(err.code, ERR_PROTOCOL);
        assert_eq!(err.message, "missing 'token' key");
        assert_eq!(err.transaction_id.as_deref(), Some(b"aa".as_slice()));
    }

    #[test]
    fn test_unknown_method() {
        let raw = b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:nope1:t2:aa1:y1:qe";
        let err = Message::parse(raw).unwrap_err();
        assert_eq!(err.code, ERR_METHOD_UNKNOWN);
        assert_eq!(err.message, "method unknown");
    }

    #[test]
    fn test_put_mutable_roundtrip() {
        let put = PutArgs {
            token: Bytes::from_static(b"tok"),
            value: Value::string("Hello World!"),
            value_bytes: Bytes::from_static(b"12:Hello World!"),
            mutable: Some(MutablePut {
                public_key: PublicKey([7u8; 32]),
                signature: Signature([9u8; 64]),
                seq: 4,
                cas: Some(3),
                salt: Bytes::from_static(b"foobar"),
            }),
        };
        let encoded = encode_query(
            &tid(),
            &NodeId::generate(),
            false,
            &QueryBody::Put(Box::new(put)),
        );

        match Message::parse(&encoded).unwrap() {
            Message::Query { query, .. } => match query.body {
                QueryBody::Put(put) => {
                    assert_eq!(put.token.as_ref(), b"tok");
                    assert_eq!(put.value_bytes.as_ref(), b"12:Hello World!");
                    let m = put.mutable.unwrap();
                    assert_eq!(m.seq, 4);
                    assert_eq!(m.cas, Some(3));
                    assert_eq!(m.salt.as_ref(), b"foobar");
                    assert_eq!(m.public_key.0, [7u8; 32]);
                }
                other => panic!("unexpected body: {:?}", other),
            },
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_put_mutable_requires_sig_and_seq() {
        let raw = b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaa1:k32:cccccccccccccccccccccccccccccccc5:token3:tok1:v5:helloe1:q3:put1:t2:aa1:y1:qe";
        let err = Message::parse(raw).unwrap_err();
        assert_eq!(err.message, "missing 'sig' key");
    }

    #[test]
    fn test_reply_roundtrip_with_nodes_and_peers() {
        let node = Node::new(
            NodeId([3u8; 20]),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(4, 4, 4, 4)), 4440),
        );
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), 999);
        let requester = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2)), 2222);

        let reply = Reply {
            id: NodeId([1u8; 20]),
            nodes: vec![node.clone()],
            values: vec![peer],
            token: Some(Bytes::from_static(b"tk")),
            ..Default::default()
        };
        let encoded = encode_reply(&tid(), &reply, Some(&requester));

        match Message::parse(&encoded).unwrap() {
            Message::Reply { reply, .. } => {
                assert_eq!(reply.id, NodeId([1u8; 20]));
                assert_eq!(reply.nodes.len(), 1);
                assert_eq!(reply.nodes[0].id, node.id);
                assert_eq!(reply.nodes[0].addr, node.addr);
                assert_eq!(reply.values, vec![peer]);
                assert_eq!(reply.token.as_deref(), Some(b"tk".as_slice()));
                assert_eq!(reply.external_ip, Some(requester));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_error_roundtrip() {
        let encoded = encode_error(&tid(), ERR_PROTOCOL, "invalid token");
        match Message::parse(&encoded).unwrap() {
            Message::Error { code, message, .. } => {
                assert_eq!(code, 203);
                assert_eq!(message, "invalid token");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
