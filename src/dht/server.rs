//! The protocol core: message demultiplexer, query handlers, and the
//! public operations.
//!
//! [`DhtNode`] is a synchronous state machine. Datagrams come in through
//! [`DhtNode::incoming`], time passes through [`DhtNode::tick`], and
//! packets leave through the [`Transport`] the node was constructed with.
//! The tokio shell in [`super::service`] wires this to a real socket; the
//! tests wire it to a mock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::bencode::{encode, Value};
use crate::constants::{
    DEFAULT_BUCKET_SIZE, DEFAULT_MAX_DHT_ITEMS, DEFAULT_MAX_FAIL_COUNT, DEFAULT_MAX_TORRENTS,
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_SEARCH_BRANCHING, MAX_ITEM_SIZE, MAX_PACKET_SIZE,
};

use super::error::DhtError;
use super::message::{
    encode_error, encode_reply, Message, MutablePut, ParseError, PutArgs, Query, QueryBody, Reply,
    ReplyItem, TransactionId, Want, ERR_INVALID_SIGNATURE, ERR_CAS_MISMATCH, ERR_PROTOCOL,
    ERR_SEQ_TOO_LOW,
};
use super::node::{Family, Node, NodeId};
use super::routing::RoutingTable;
use super::rpc::{Cookie, RpcManager};
use super::security::{generate_node_id, verify_node_id};
use super::sign::{immutable_item_target_id, item_target_id, sign_mutable_item, Keypair};
use super::storage::{ItemStorage, MutableItem, StoreError, TokenManager};
use super::traversal::{LookupKind, Traversal};

/// Packet egress. The node never touches a socket directly.
pub trait Transport: Send + Sync {
    fn send(&self, data: &[u8], to: SocketAddr);
}

/// Hooks for events the embedding application may care about.
pub trait DhtObserver: Send {
    /// A new externally-visible address won the vote.
    fn external_address(&self, addr: SocketAddr) {
        let _ = addr;
    }
}

struct NullObserver;

impl DhtObserver for NullObserver {}

/// Node configuration.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Bucket size and closeness-set size.
    pub k: usize,
    /// Lookup concurrency factor.
    pub search_branching: usize,
    pub max_dht_items: usize,
    pub max_torrents: usize,
    pub max_fail_count: u8,
    /// Enforce BEP-42 node-ID/IP binding.
    pub enforce_node_id: bool,
    /// Enforce per-bucket IP diversity.
    pub restrict_routing_ips: bool,
    /// Enlarge the farthest buckets.
    pub extended_routing_table: bool,
    /// Answer no queries and stay out of other nodes' routing tables.
    pub read_only: bool,
    pub request_timeout: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_BUCKET_SIZE,
            search_branching: DEFAULT_SEARCH_BRANCHING,
            max_dht_items: DEFAULT_MAX_DHT_ITEMS,
            max_torrents: DEFAULT_MAX_TORRENTS,
            max_fail_count: DEFAULT_MAX_FAIL_COUNT,
            enforce_node_id: true,
            restrict_routing_ips: true,
            extended_routing_table: true,
            read_only: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Plain counters of protocol activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub packets_in: u64,
    pub packets_out: u64,
    pub queries_in: u64,
    pub queries_out: u64,
    pub replies_in: u64,
    pub errors_in: u64,
    pub timeouts: u64,
    pub invalid_messages: u64,
}

/// A data item delivered by [`DhtNode::get_item`].
#[derive(Debug, Clone)]
pub enum Item {
    Immutable { value: Value },
    Mutable(MutableItem),
}

type BootstrapCb = Box<dyn FnOnce(usize) + Send>;
type PeersCb = Box<dyn FnMut(&[SocketAddr]) + Send>;
type AnnounceCb = Box<dyn FnOnce(Vec<SocketAddr>) + Send>;
type ItemCb = Box<dyn FnOnce(Option<Item>) + Send>;
type PutCb = Box<dyn FnOnce(usize) + Send>;
/// Produces the value and sequence number to publish, given the freshest
/// item observed during the lookup.
type PutDataCb = Box<dyn FnOnce(Option<&MutableItem>) -> (Value, i64) + Send>;

enum PutSource {
    Immutable {
        value: Value,
        value_bytes: Bytes,
    },
    Mutable {
        keypair: Keypair,
        salt: Bytes,
        data_cb: Option<PutDataCb>,
    },
}

enum Action {
    Bootstrap {
        done: Option<BootstrapCb>,
    },
    Announce {
        info_hash: NodeId,
        port: u16,
        seed: bool,
        peers_cb: Option<PeersCb>,
        done: Option<AnnounceCb>,
    },
    GetItem {
        done: Option<ItemCb>,
    },
    PutItem {
        source: PutSource,
        done: Option<PutCb>,
    },
}

struct Operation {
    traversal: Traversal,
    action: Action,
    /// Outstanding probes to seed addresses whose node id we do not know
    /// yet (bootstrap); they hold completion open without being
    /// candidates.
    seed_probes: usize,
    write_phase: bool,
    writes_outstanding: usize,
    write_acks: usize,
}

/// The DHT node core.
pub struct DhtNode {
    config: DhtConfig,
    transport: Arc<dyn Transport>,
    observer: Box<dyn DhtObserver>,
    table_v4: RoutingTable,
    table_v6: RoutingTable,
    storage: ItemStorage,
    tokens: TokenManager,
    rpc: RpcManager,
    operations: HashMap<u64, Operation>,
    next_operation: u64,
    counters: Counters,
    last_expire: Instant,
}

impl DhtNode {
    pub fn new(config: DhtConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_observer(config, transport, Box::new(NullObserver))
    }

    pub fn with_observer(
        config: DhtConfig,
        transport: Arc<dyn Transport>,
        observer: Box<dyn DhtObserver>,
    ) -> Self {
        let table = |family| {
            RoutingTable::new(
                NodeId::generate(),
                family,
                config.k,
                config.max_fail_count,
                config.enforce_node_id,
                config.restrict_routing_ips,
                config.extended_routing_table,
            )
        };
        Self {
            table_v4: table(Family::V4),
            table_v6: table(Family::V6),
            storage: ItemStorage::new(config.max_torrents, config.max_dht_items),
            tokens: TokenManager::new(),
            rpc: RpcManager::new(config.request_timeout),
            operations: HashMap::new(),
            next_operation: 1,
            counters: Counters::default(),
            last_expire: Instant::now(),
            transport,
            observer,
            config,
        }
    }

    pub fn our_id(&self, family: Family) -> &NodeId {
        self.table(family).our_id()
    }

    pub fn routing_table(&self, family: Family) -> &RoutingTable {
        self.table(family)
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// The peer and item tables, for introspection.
    pub fn storage(&self) -> &ItemStorage {
        &self.storage
    }

    /// Number of requests currently awaiting a response.
    pub fn outstanding_requests(&self) -> usize {
        self.rpc.outstanding()
    }

    fn table(&self, family: Family) -> &RoutingTable {
        match family {
            Family::V4 => &self.table_v4,
            Family::V6 => &self.table_v6,
        }
    }

    fn table_mut(&mut self, family: Family) -> &mut RoutingTable {
        match family {
            Family::V4 => &mut self.table_v4,
            Family::V6 => &mut self.table_v6,
        }
    }

    fn send(&mut self, data: &[u8], to: SocketAddr) {
        if data.len() > MAX_PACKET_SIZE {
            debug!(len = data.len(), %to, "dropping oversized datagram");
            return;
        }
        self.counters.packets_out += 1;
        self.transport.send(data, to);
    }

    // ------------------------------------------------------------------
    // ingress
    // ------------------------------------------------------------------

    /// Feeds one received datagram into the node.
    pub fn incoming(&mut self, data: &[u8], from: SocketAddr) {
        self.counters.packets_in += 1;

        match Message::parse(data) {
            Ok(Message::Query {
                transaction_id,
                query,
            }) => {
                self.counters.queries_in += 1;
                self.handle_query(transaction_id, query, from);
            }
            Ok(Message::Reply {
                transaction_id,
                reply,
            }) => {
                self.counters.replies_in += 1;
                self.handle_reply(&transaction_id, reply, from);
            }
            Ok(Message::Error {
                transaction_id,
                code,
                message,
            }) => {
                self.counters.errors_in += 1;
                self.handle_remote_error(&transaction_id, code, &message, from);
            }
            Err(err) => self.handle_parse_error(err, from),
        }
    }

    fn handle_parse_error(&mut self, err: ParseError, from: SocketAddr) {
        self.counters.invalid_messages += 1;
        debug!(%from, error = %err.message, "dropped invalid message");

        if !err.respond || self.config.read_only {
            return;
        }
        if let Some(tid) = err.transaction_id {
            let packet = encode_error(&tid, err.code, &err.message);
            self.send(&packet, from);
        }
    }

    // ------------------------------------------------------------------
    // server side
    // ------------------------------------------------------------------

    fn handle_query(&mut self, tid: TransactionId, query: Query, from: SocketAddr) {
        let family = Family::of(&from);

        if self.config.enforce_node_id && !verify_node_id(&query.id, from.ip()) {
            trace!(%from, "query with non-compliant node id");
            if !self.config.read_only {
                let packet = encode_error(&tid, ERR_PROTOCOL, "invalid node ID");
                self.send(&packet, from);
            }
            return;
        }

        if self.config.read_only {
            return;
        }

        // read-only senders stay out of the routing table (BEP-43)
        if !query.read_only {
            self.table_mut(family).node_seen(query.id, from, None);
        }

        let our_id = *self.our_id(family);
        let reply = match query.body {
            QueryBody::Ping => Reply {
                id: our_id,
                ..Default::default()
            },
            QueryBody::FindNode { target, want } => {
                let want = want.resolve(family);
                Reply {
                    id: our_id,
                    nodes: self.closest_if(want.v4, Family::V4, &target),
                    nodes6: self.closest_if(want.v6, Family::V6, &target),
                    ..Default::default()
                }
            }
            QueryBody::GetPeers {
                info_hash,
                scrape,
                no_seed,
                want,
            } => {
                let want = want.resolve(family);
                let mut reply = Reply {
                    id: our_id,
                    nodes: self.closest_if(want.v4, Family::V4, &info_hash),
                    nodes6: self.closest_if(want.v6, Family::V6, &info_hash),
                    token: Some(self.tokens.issue(&from)),
                    ..Default::default()
                };
                if scrape {
                    reply.scrape = Some(self.storage.scrape(&info_hash));
                } else {
                    reply.values = self.storage.peers_for(&info_hash, family, no_seed);
                }
                reply
            }
            QueryBody::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
                seed,
                name,
            } => {
                if !self.tokens.verify(&from, &token) {
                    debug!(%from, "announce_peer with invalid token");
                    let packet = encode_error(&tid, ERR_PROTOCOL, "invalid token");
                    self.send(&packet, from);
                    return;
                }
                let peer_port = if implied_port { from.port() } else { port };
                self.storage.announce_peer(
                    info_hash,
                    SocketAddr::new(from.ip(), peer_port),
                    seed,
                    name.as_ref(),
                );
                Reply {
                    id: our_id,
                    ..Default::default()
                }
            }
            QueryBody::Get { target, seq, want } => {
                let want = want.resolve(family);
                let mut reply = Reply {
                    id: our_id,
                    nodes: self.closest_if(want.v4, Family::V4, &target),
                    nodes6: self.closest_if(want.v6, Family::V6, &target),
                    token: Some(self.tokens.issue(&from)),
                    ..Default::default()
                };
                if let Some(item) = self.storage.get_mutable(&target) {
                    // conditional get: the requester may already have this seq
                    if seq.map_or(true, |have| item.seq > have) {
                        reply.item = Some(ReplyItem {
                            value: item.value.clone(),
                            value_bytes: item.value_bytes.clone(),
                            mutable: Some((item.public_key, item.signature, item.seq)),
                        });
                    }
                } else if let Some((value, value_bytes)) = self.storage.get_immutable(&target) {
                    reply.item = Some(ReplyItem {
                        value: value.clone(),
                        value_bytes: value_bytes.clone(),
                        mutable: None,
                    });
                }
                reply
            }
            QueryBody::Put(put) => {
                if !self.tokens.verify(&from, &put.token) {
                    debug!(%from, "put with invalid token");
                    let packet = encode_error(&tid, ERR_PROTOCOL, "invalid token");
                    self.send(&packet, from);
                    return;
                }
                if let Err((code, message)) = self.store_put(*put) {
                    let packet = encode_error(&tid, code, message);
                    self.send(&packet, from);
                    return;
                }
                Reply {
                    id: our_id,
                    ..Default::default()
                }
            }
        };

        let packet = encode_reply(&tid, &reply, Some(&from));
        self.send(&packet, from);
    }

    fn closest_if(&self, wanted: bool, family: Family, target: &NodeId) -> Vec<Node> {
        if wanted {
            self.table(family).closest_nodes(target, self.config.k)
        } else {
            Vec::new()
        }
    }

    fn store_put(&mut self, put: PutArgs) -> Result<(), (i64, &'static str)> {
        match put.mutable {
            Some(MutablePut {
                public_key,
                signature,
                seq,
                cas,
                salt,
            }) => {
                if !super::sign::verify_mutable_item(
                    &put.value_bytes,
                    &salt,
                    seq,
                    &public_key,
                    &signature,
                ) {
                    return Err((ERR_INVALID_SIGNATURE, "invalid signature"));
                }
                let target = item_target_id(&salt, &public_key);
                let item = MutableItem {
                    value: put.value,
                    value_bytes: put.value_bytes,
                    public_key,
                    signature,
                    seq,
                    salt,
                };
                self.storage.put_mutable(target, item, cas).map_err(|e| match e {
                    StoreError::LowerSeq => (ERR_SEQ_TOO_LOW, "sequence number less than current"),
                    StoreError::CasMismatch => (ERR_CAS_MISMATCH, "CAS mismatch"),
                })
            }
            None => {
                let target = immutable_item_target_id(&put.value_bytes);
                self.storage.put_immutable(target, put.value, put.value_bytes);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // client side
    // ------------------------------------------------------------------

    fn handle_reply(&mut self, tid: &TransactionId, reply: Reply, from: SocketAddr) {
        let Some(pending) = self.rpc.on_reply(tid, &from, &reply.id) else {
            trace!(%from, "reply without matching transaction");
            return;
        };

        let family = Family::of(&from);
        let rtt = pending.sent_at.elapsed().as_millis().min(u16::MAX as u128) as u16;
        self.table_mut(family).node_seen(reply.id, from, Some(rtt));

        if let Some(external) = reply.external_ip {
            self.external_address_vote(external, from);
        }

        match pending.cookie {
            Cookie::Ping => {}
            Cookie::Traversal(op_id) => {
                if let Some(op) = self.operations.get_mut(&op_id) {
                    let new_peers = op.traversal.on_response(&from, &reply);
                    if pending.node_id.is_none() && op.seed_probes > 0 {
                        // a bootstrap seed answered
                        op.seed_probes -= 1;
                    }
                    if !new_peers.is_empty() {
                        if let Action::Announce {
                            peers_cb: Some(cb), ..
                        } = &mut op.action
                        {
                            cb(&new_peers);
                        }
                    }
                }
                self.pump_operation(op_id);
            }
            Cookie::Write(op_id) => self.write_settled(op_id, true),
        }
    }

    fn handle_remote_error(
        &mut self,
        tid: &TransactionId,
        code: i64,
        message: &str,
        from: SocketAddr,
    ) {
        let Some(pending) = self.rpc.on_error(tid, &from) else {
            trace!(%from, "error reply without matching transaction");
            return;
        };

        debug!(%from, code, message, "remote error");
        match pending.cookie {
            Cookie::Ping => {}
            Cookie::Traversal(op_id) => {
                if let Some(op) = self.operations.get_mut(&op_id) {
                    op.traversal.on_failure(&from);
                    if pending.node_id.is_none() && op.seed_probes > 0 {
                        op.seed_probes -= 1;
                    }
                }
                self.pump_operation(op_id);
            }
            Cookie::Write(op_id) => self.write_settled(op_id, false),
        }
    }

    fn external_address_vote(&mut self, observed: SocketAddr, voter: SocketAddr) {
        let family = Family::of(&observed);
        let Some(won) = self
            .table_mut(family)
            .vote_external_address(observed.ip(), voter.ip())
        else {
            return;
        };

        info!(address = %won, "external address confirmed");
        self.observer
            .external_address(SocketAddr::new(won, observed.port()));

        if self.config.enforce_node_id && !verify_node_id(self.our_id(family), won) {
            let new_id = generate_node_id(won);
            info!(id = %new_id, "adopting ip-bound node id");
            self.table_mut(family).update_node_id(new_id);
        }
    }

    // ------------------------------------------------------------------
    // time
    // ------------------------------------------------------------------

    /// Drives timers: request timeouts and retries, token rotation,
    /// storage expiry, bucket refresh pings. Call about once a second.
    pub fn tick(&mut self) {
        let (retries, timeouts) = self.rpc.tick();
        for retry in retries {
            trace!(to = %retry.addr, "retransmitting query");
            self.send(&retry.packet, retry.addr);
        }

        for pending in timeouts {
            self.counters.timeouts += 1;
            debug!(tid = pending.tid, to = %pending.addr, "request timed out");
            let family = Family::of(&pending.addr);
            if let Some(id) = pending.node_id {
                self.table_mut(family).node_failed(&id, &pending.addr);
            }
            match pending.cookie {
                Cookie::Ping => {}
                Cookie::Traversal(op_id) => {
                    if let Some(op) = self.operations.get_mut(&op_id) {
                        op.traversal.on_failure(&pending.addr);
                        if pending.node_id.is_none() && op.seed_probes > 0 {
                            op.seed_probes -= 1;
                        }
                    }
                    self.pump_operation(op_id);
                }
                Cookie::Write(op_id) => self.write_settled(op_id, false),
            }
        }

        self.tokens.maybe_rotate();

        if self.last_expire.elapsed() >= Duration::from_secs(60) {
            self.last_expire = Instant::now();
            self.storage.expire();
        }

        self.refresh_buckets();
    }

    fn refresh_buckets(&mut self) {
        for family in [Family::V4, Family::V6] {
            let Some(node) = self.table_mut(family).next_refresh_target() else {
                continue;
            };
            let our_id = *self.our_id(family);
            if let Ok((_tid, packet)) = self.rpc.invoke(
                QueryBody::Ping,
                node.addr,
                Some(node.id),
                Cookie::Ping,
                &our_id,
                self.config.read_only,
            ) {
                trace!(to = %node.addr, "refresh ping");
                self.counters.queries_out += 1;
                self.send(&packet, node.addr);
            }
        }
    }

    // ------------------------------------------------------------------
    // public operations
    // ------------------------------------------------------------------

    /// Sends a fire-and-forget ping.
    pub fn ping(&mut self, addr: SocketAddr) -> Result<(), DhtError> {
        let our_id = *self.our_id(Family::of(&addr));
        let (_tid, packet) = self.rpc.invoke(
            QueryBody::Ping,
            addr,
            None,
            Cookie::Ping,
            &our_id,
            self.config.read_only,
        )?;
        self.counters.queries_out += 1;
        self.send(&packet, addr);
        Ok(())
    }

    /// Populates the routing table from `seeds`, running a lookup for the
    /// local id. `done` receives the resulting routing-table size.
    pub fn bootstrap(
        &mut self,
        seeds: &[SocketAddr],
        done: impl FnOnce(usize) + Send + 'static,
    ) -> u64 {
        let target = *self.our_id(Family::V4);
        let mut traversal_seeds = self.table_v4.closest_nodes(&target, self.config.k);
        traversal_seeds.extend(self.table_v6.closest_nodes(&target, self.config.k));

        let op_id = self.insert_operation(Operation {
            traversal: Traversal::new(
                target,
                LookupKind::FindNode,
                self.config.search_branching,
                self.config.k,
                traversal_seeds,
            ),
            action: Action::Bootstrap {
                done: Some(Box::new(done)),
            },
            seed_probes: 0,
            write_phase: false,
            writes_outstanding: 0,
            write_acks: 0,
        });

        for addr in seeds {
            let our_id = *self.our_id(Family::of(addr));
            let body = QueryBody::FindNode {
                target: our_id,
                want: Want { v4: true, v6: true },
            };
            match self.rpc.invoke(
                body,
                *addr,
                None,
                Cookie::Traversal(op_id),
                &our_id,
                self.config.read_only,
            ) {
                Ok((_tid, packet)) => {
                    self.counters.queries_out += 1;
                    self.send(&packet, *addr);
                    if let Some(op) = self.operations.get_mut(&op_id) {
                        op.seed_probes += 1;
                    }
                }
                Err(err) => debug!(%addr, %err, "bootstrap probe failed"),
            }
        }

        info!(seeds = seeds.len(), "bootstrap started");
        self.pump_operation(op_id);
        op_id
    }

    /// Finds peers for `info_hash` and announces our `port` on the closest
    /// nodes. Newly discovered peers stream through `peers_cb`; `done`
    /// receives every peer found.
    pub fn announce(
        &mut self,
        info_hash: NodeId,
        port: u16,
        seed: bool,
        peers_cb: Option<PeersCb>,
        done: impl FnOnce(Vec<SocketAddr>) + Send + 'static,
    ) -> u64 {
        let seeds = self.lookup_seeds(&info_hash);
        let op_id = self.insert_operation(Operation {
            // write traversals run at full width
            traversal: Traversal::new(
                info_hash,
                LookupKind::GetPeers,
                self.config.k,
                self.config.k,
                seeds,
            ),
            action: Action::Announce {
                info_hash,
                port,
                seed,
                peers_cb,
                done: Some(Box::new(done)),
            },
            seed_probes: 0,
            write_phase: false,
            writes_outstanding: 0,
            write_acks: 0,
        });
        self.pump_operation(op_id);
        op_id
    }

    /// Retrieves the immutable item stored under `target`.
    pub fn get_item(&mut self, target: NodeId, done: impl FnOnce(Option<Item>) + Send + 'static) -> u64 {
        self.start_get(target, Bytes::new(), Box::new(done))
    }

    /// Retrieves the mutable item published under `public_key` and `salt`,
    /// delivering the highest-sequence copy whose signature verifies.
    pub fn get_mutable_item(
        &mut self,
        public_key: super::sign::PublicKey,
        salt: Bytes,
        done: impl FnOnce(Option<Item>) + Send + 'static,
    ) -> u64 {
        let target = item_target_id(&salt, &public_key);
        self.start_get(target, salt, Box::new(done))
    }

    fn start_get(&mut self, target: NodeId, salt: Bytes, done: ItemCb) -> u64 {
        let seeds = self.lookup_seeds(&target);
        let op_id = self.insert_operation(Operation {
            traversal: Traversal::new(
                target,
                LookupKind::Get { salt },
                self.config.search_branching,
                self.config.k,
                seeds,
            ),
            action: Action::GetItem { done: Some(done) },
            seed_probes: 0,
            write_phase: false,
            writes_outstanding: 0,
            write_acks: 0,
        });
        self.pump_operation(op_id);
        op_id
    }

    /// Stores an immutable item on the K nodes closest to its target.
    /// Returns the target id along with the operation id; `done` receives
    /// the number of nodes that acknowledged the store.
    pub fn put_item(
        &mut self,
        value: Value,
        done: impl FnOnce(usize) + Send + 'static,
    ) -> Result<(NodeId, u64), DhtError> {
        let value_bytes = Bytes::from(encode(&value));
        if value_bytes.len() > MAX_ITEM_SIZE {
            return Err(DhtError::ItemTooLarge(value_bytes.len()));
        }
        let target = immutable_item_target_id(&value_bytes);

        let op_id = self.start_put(
            target,
            Bytes::new(),
            PutSource::Immutable { value, value_bytes },
            Box::new(done),
        );
        Ok((target, op_id))
    }

    /// Publishes a mutable item. The lookup first collects write tokens and
    /// the freshest stored copy; `data_cb` then produces the value and
    /// sequence number to publish (read-modify-write), and the store is
    /// sent with a compare-and-swap on the observed sequence number.
    pub fn put_mutable_item(
        &mut self,
        keypair: Keypair,
        salt: Bytes,
        data_cb: impl FnOnce(Option<&MutableItem>) -> (Value, i64) + Send + 'static,
        done: impl FnOnce(usize) + Send + 'static,
    ) -> (NodeId, u64) {
        let target = item_target_id(&salt, &keypair.public);
        let op_id = self.start_put(
            target,
            salt.clone(),
            PutSource::Mutable {
                keypair,
                salt,
                data_cb: Some(Box::new(data_cb)),
            },
            Box::new(done),
        );
        (target, op_id)
    }

    fn start_put(&mut self, target: NodeId, salt: Bytes, source: PutSource, done: PutCb) -> u64 {
        let seeds = self.lookup_seeds(&target);
        let op_id = self.insert_operation(Operation {
            // write traversals run at full width
            traversal: Traversal::new(
                target,
                LookupKind::Get { salt },
                self.config.k,
                self.config.k,
                seeds,
            ),
            action: Action::PutItem {
                source,
                done: Some(done),
            },
            seed_probes: 0,
            write_phase: false,
            writes_outstanding: 0,
            write_acks: 0,
        });
        self.pump_operation(op_id);
        op_id
    }

    /// Abandons an operation. Its callbacks are dropped without firing;
    /// in-flight requests expire on their own schedule.
    pub fn cancel(&mut self, op_id: u64) {
        if self.operations.remove(&op_id).is_some() {
            debug!(op_id, "operation cancelled");
        }
    }

    fn lookup_seeds(&self, target: &NodeId) -> Vec<Node> {
        let mut seeds = self.table_v4.closest_nodes(target, self.config.k);
        seeds.extend(self.table_v6.closest_nodes(target, self.config.k));
        seeds
    }

    fn insert_operation(&mut self, op: Operation) -> u64 {
        let op_id = self.next_operation;
        self.next_operation += 1;
        self.operations.insert(op_id, op);
        op_id
    }

    // ------------------------------------------------------------------
    // traversal driving
    // ------------------------------------------------------------------

    fn pump_operation(&mut self, op_id: u64) {
        loop {
            let Some(op) = self.operations.get_mut(&op_id) else {
                return;
            };
            if op.write_phase {
                return;
            }
            let batch = op.traversal.next_batch();
            if batch.is_empty() {
                break;
            }

            let want = Want { v4: true, v6: true };
            for node in batch {
                let body = match self.operations.get(&op_id) {
                    Some(op) => op.traversal.query_body(want),
                    None => return,
                };
                let our_id = *self.our_id(Family::of(&node.addr));
                match self.rpc.invoke(
                    body,
                    node.addr,
                    Some(node.id),
                    Cookie::Traversal(op_id),
                    &our_id,
                    self.config.read_only,
                ) {
                    Ok((_tid, packet)) => {
                        self.counters.queries_out += 1;
                        self.send(&packet, node.addr);
                    }
                    Err(_) => {
                        if let Some(op) = self.operations.get_mut(&op_id) {
                            op.traversal.on_failure(&node.addr);
                        }
                    }
                }
            }
        }

        let lookup_done = {
            let Some(op) = self.operations.get_mut(&op_id) else {
                return;
            };
            op.seed_probes == 0 && !op.write_phase && op.traversal.poll_done()
        };
        if lookup_done {
            self.start_write_phase(op_id);
        }
    }

    fn start_write_phase(&mut self, op_id: u64) {
        let Some(op) = self.operations.get_mut(&op_id) else {
            return;
        };
        op.write_phase = true;

        enum WriteKind {
            None,
            Announce {
                info_hash: NodeId,
                port: u16,
                seed: bool,
            },
            Put(PutArgs),
        }

        let targets = op.traversal.write_targets();
        let kind = match &mut op.action {
            Action::Bootstrap { .. } | Action::GetItem { .. } => WriteKind::None,
            Action::Announce {
                info_hash,
                port,
                seed,
                ..
            } => WriteKind::Announce {
                info_hash: *info_hash,
                port: *port,
                seed: *seed,
            },
            Action::PutItem { source, .. } => match source {
                PutSource::Immutable { value, value_bytes } => WriteKind::Put(PutArgs {
                    token: Bytes::new(),
                    value: value.clone(),
                    value_bytes: value_bytes.clone(),
                    mutable: None,
                }),
                PutSource::Mutable {
                    keypair,
                    salt,
                    data_cb,
                } => {
                    let observed = op.traversal.best_mutable().cloned();
                    let cas = observed.as_ref().map(|item| item.seq);
                    let keypair = keypair.clone();
                    let salt = salt.clone();
                    let Some(data_cb) = data_cb.take() else {
                        return;
                    };
                    let (value, seq) = data_cb(observed.as_ref());
                    let value_bytes = Bytes::from(encode(&value));
                    match sign_mutable_item(
                        &value_bytes,
                        &salt,
                        seq,
                        &keypair.public,
                        &keypair.secret,
                    ) {
                        Ok(signature) => WriteKind::Put(PutArgs {
                            token: Bytes::new(),
                            value,
                            value_bytes,
                            mutable: Some(MutablePut {
                                public_key: keypair.public,
                                signature,
                                seq,
                                cas,
                                salt,
                            }),
                        }),
                        Err(err) => {
                            debug!(%err, "mutable put signing failed");
                            WriteKind::None
                        }
                    }
                }
            },
        };

        let mut writes = Vec::new();
        match kind {
            WriteKind::None => {}
            WriteKind::Announce {
                info_hash,
                port,
                seed,
            } => {
                for (node, token) in targets {
                    writes.push((
                        node,
                        QueryBody::AnnouncePeer {
                            info_hash,
                            port,
                            implied_port: false,
                            token,
                            seed,
                            name: None,
                        },
                    ));
                }
            }
            WriteKind::Put(put) => {
                for (node, token) in targets {
                    let mut put = put.clone();
                    put.token = token;
                    writes.push((node, QueryBody::Put(Box::new(put))));
                }
            }
        }

        let mut dispatched = 0;
        for (node, body) in writes {
            let our_id = *self.our_id(Family::of(&node.addr));
            match self.rpc.invoke(
                body,
                node.addr,
                Some(node.id),
                Cookie::Write(op_id),
                &our_id,
                self.config.read_only,
            ) {
                Ok((_tid, packet)) => {
                    self.counters.queries_out += 1;
                    self.send(&packet, node.addr);
                    dispatched += 1;
                }
                Err(err) => debug!(%err, "write dispatch failed"),
            }
        }

        if let Some(op) = self.operations.get_mut(&op_id) {
            op.writes_outstanding = dispatched;
            if dispatched == 0 {
                self.finish_operation(op_id);
            }
        }
    }

    fn write_settled(&mut self, op_id: u64, acked: bool) {
        let finished = {
            let Some(op) = self.operations.get_mut(&op_id) else {
                return;
            };
            if acked {
                op.write_acks += 1;
            }
            op.writes_outstanding = op.writes_outstanding.saturating_sub(1);
            op.writes_outstanding == 0
        };
        if finished {
            self.finish_operation(op_id);
        }
    }

    fn finish_operation(&mut self, op_id: u64) {
        let Some(mut op) = self.operations.remove(&op_id) else {
            return;
        };

        match &mut op.action {
            Action::Bootstrap { done } => {
                let nodes = self.table_v4.node_count() + self.table_v6.node_count();
                info!(nodes, "bootstrap finished");
                if let Some(done) = done.take() {
                    done(nodes);
                }
            }
            Action::Announce { done, .. } => {
                if let Some(done) = done.take() {
                    done(op.traversal.peers().to_vec());
                }
            }
            Action::GetItem { done } => {
                let item = op
                    .traversal
                    .best_mutable()
                    .cloned()
                    .map(Item::Mutable)
                    .or_else(|| {
                        op.traversal
                            .immutable()
                            .map(|(value, _)| Item::Immutable {
                                value: value.clone(),
                            })
                    });
                if let Some(done) = done.take() {
                    done(item);
                }
            }
            Action::PutItem { done, .. } => {
                if let Some(done) = done.take() {
                    done(op.write_acks);
                }
            }
        }
    }
}

#[cfg(test)]
impl DhtNode {
    /// Test hook: plants a (verified) routing entry.
    pub(crate) fn seed_routing_node(
        &mut self,
        id: NodeId,
        addr: SocketAddr,
    ) -> super::routing::NodeStatus {
        self.table_mut(Family::of(&addr)).node_seen(id, addr, Some(50))
    }

    pub(crate) fn storage_mut(&mut self) -> &mut ItemStorage {
        &mut self.storage
    }

    pub(crate) fn issue_token(&self, addr: &SocketAddr) -> Bytes {
        self.tokens.issue(addr)
    }
}
