//! Outstanding-request bookkeeping: transaction ids, retries, timeouts.
//!
//! Transaction ids are 2-byte big-endian counters with wrap-around; a slot
//! is only reused after its request has completed or timed out. Lookup
//! queries are retransmitted with exponential backoff, mutating queries are
//! not.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::trace;

use crate::constants::{MAX_OUTSTANDING_GLOBAL, MAX_OUTSTANDING_PER_NODE, MAX_RETRIES};

use super::error::DhtError;
use super::message::{encode_query, QueryBody, TransactionId};
use super::node::NodeId;

/// Links a pending request back to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cookie {
    /// Stand-alone ping (bootstrap probe or bucket refresh).
    Ping,
    /// Lookup phase of the operation with this id.
    Traversal(u64),
    /// Write follow-up (announce_peer/put) of the operation with this id.
    Write(u64),
}

/// One outstanding request.
pub struct Pending {
    pub tid: u16,
    pub addr: SocketAddr,
    /// Expected responder id, when known ahead of time.
    pub node_id: Option<NodeId>,
    pub body: QueryBody,
    pub cookie: Cookie,
    pub sent_at: Instant,
    pub retries: u8,
    packet: Vec<u8>,
}

impl Pending {
    fn deadline(&self, base: Duration) -> Instant {
        self.sent_at + base * (1u32 << self.retries.min(4))
    }
}

/// A retransmission due this tick.
pub struct Retry {
    pub addr: SocketAddr,
    pub packet: Vec<u8>,
}

pub struct RpcManager {
    next_tid: u16,
    timeout: Duration,
    pending: HashMap<u16, Pending>,
    per_node: HashMap<SocketAddr, u8>,
}

impl RpcManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_tid: 0,
            timeout,
            pending: HashMap::new(),
            per_node: HashMap::new(),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Whether a new request to `addr` would be within the back-pressure
    /// caps.
    pub fn has_capacity(&self, addr: &SocketAddr) -> bool {
        self.pending.len() < MAX_OUTSTANDING_GLOBAL
            && self.per_node.get(addr).copied().unwrap_or(0) < MAX_OUTSTANDING_PER_NODE
    }

    /// Registers a query and returns the encoded datagram to send.
    pub fn invoke(
        &mut self,
        body: QueryBody,
        addr: SocketAddr,
        node_id: Option<NodeId>,
        cookie: Cookie,
        our_id: &NodeId,
        read_only: bool,
    ) -> Result<(u16, Vec<u8>), DhtError> {
        if !self.has_capacity(&addr) {
            return Err(DhtError::Congestion);
        }

        // skip slots still owned by a live request
        while self.pending.contains_key(&self.next_tid) {
            self.next_tid = self.next_tid.wrapping_add(1);
        }
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);

        let tid_bytes: TransactionId = Bytes::copy_from_slice(&tid.to_be_bytes());
        let packet = encode_query(&tid_bytes, our_id, read_only, &body);

        self.pending.insert(
            tid,
            Pending {
                tid,
                addr,
                node_id,
                body,
                cookie,
                sent_at: Instant::now(),
                retries: 0,
                packet: packet.clone(),
            },
        );
        *self.per_node.entry(addr).or_insert(0) += 1;

        trace!(tid, %addr, "registered outstanding request");
        Ok((tid, packet))
    }

    fn complete(&mut self, tid: u16) -> Option<Pending> {
        let pending = self.pending.remove(&tid)?;
        if let Some(count) = self.per_node.get_mut(&pending.addr) {
            *count -= 1;
            if *count == 0 {
                self.per_node.remove(&pending.addr);
            }
        }
        Some(pending)
    }

    /// Matches an inbound reply against the table.
    ///
    /// The responder must answer from the address the query went to, and
    /// with the expected node id when one was recorded; otherwise the reply
    /// is dropped and the transaction stays armed.
    pub fn on_reply(
        &mut self,
        transaction_id: &[u8],
        from: &SocketAddr,
        responder: &NodeId,
    ) -> Option<Pending> {
        let tid = parse_tid(transaction_id)?;
        let pending = self.pending.get(&tid)?;

        if pending.addr.ip() != from.ip() {
            trace!(tid, "reply from unexpected address, dropping");
            return None;
        }
        if let Some(expected) = &pending.node_id {
            if expected != responder {
                trace!(tid, "reply with unexpected node id, dropping");
                return None;
            }
        }
        self.complete(tid)
    }

    /// Matches an inbound error message against the table.
    pub fn on_error(&mut self, transaction_id: &[u8], from: &SocketAddr) -> Option<Pending> {
        let tid = parse_tid(transaction_id)?;
        if self.pending.get(&tid)?.addr.ip() != from.ip() {
            return None;
        }
        self.complete(tid)
    }

    /// Drives timeouts. Returns retransmissions to send and requests that
    /// have given up.
    pub fn tick(&mut self) -> (Vec<Retry>, Vec<Pending>) {
        let now = Instant::now();
        let mut retries = Vec::new();
        let mut expired = Vec::new();

        for (tid, pending) in &mut self.pending {
            if now < pending.deadline(self.timeout) {
                continue;
            }
            if pending.body.retryable() && pending.retries < MAX_RETRIES {
                pending.retries += 1;
                pending.sent_at = now;
                retries.push(Retry {
                    addr: pending.addr,
                    packet: pending.packet.clone(),
                });
            } else {
                expired.push(*tid);
            }
        }

        let timeouts = expired
            .into_iter()
            .filter_map(|tid| self.complete(tid))
            .collect();
        (retries, timeouts)
    }
}

fn parse_tid(transaction_id: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = transaction_id.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, last)), 6881)
    }

    fn manager() -> RpcManager {
        RpcManager::new(Duration::from_millis(10))
    }

    #[test]
    fn test_reply_matches_and_clears() {
        let mut rpc = manager();
        let our_id = NodeId::generate();
        let responder = NodeId::generate();

        let (tid, _packet) = rpc
            .invoke(QueryBody::Ping, addr(1), None, Cookie::Ping, &our_id, false)
            .unwrap();
        assert_eq!(rpc.outstanding(), 1);

        let pending = rpc.on_reply(&tid.to_be_bytes(), &addr(1), &responder).unwrap();
        assert_eq!(pending.tid, tid);
        assert_eq!(rpc.outstanding(), 0);

        // a second copy of the reply no longer matches anything
        assert!(rpc.on_reply(&tid.to_be_bytes(), &addr(1), &responder).is_none());
    }

    #[test]
    fn test_reply_from_wrong_address_is_dropped() {
        let mut rpc = manager();
        let our_id = NodeId::generate();

        let (tid, _) = rpc
            .invoke(QueryBody::Ping, addr(1), None, Cookie::Ping, &our_id, false)
            .unwrap();

        assert!(rpc.on_reply(&tid.to_be_bytes(), &addr(2), &NodeId::generate()).is_none());
        assert_eq!(rpc.outstanding(), 1);
    }

    #[test]
    fn test_reply_with_wrong_id_is_dropped() {
        let mut rpc = manager();
        let our_id = NodeId::generate();
        let expected = NodeId::generate();

        let (tid, _) = rpc
            .invoke(
                QueryBody::Ping,
                addr(1),
                Some(expected),
                Cookie::Ping,
                &our_id,
                false,
            )
            .unwrap();

        assert!(rpc.on_reply(&tid.to_be_bytes(), &addr(1), &NodeId::generate()).is_none());
        assert!(rpc.on_reply(&tid.to_be_bytes(), &addr(1), &expected).is_some());
    }

    #[test]
    fn test_per_node_cap() {
        let mut rpc = manager();
        let our_id = NodeId::generate();

        rpc.invoke(QueryBody::Ping, addr(1), None, Cookie::Ping, &our_id, false)
            .unwrap();
        assert!(matches!(
            rpc.invoke(QueryBody::Ping, addr(1), None, Cookie::Ping, &our_id, false),
            Err(DhtError::Congestion)
        ));
        // a different node is fine
        assert!(rpc
            .invoke(QueryBody::Ping, addr(2), None, Cookie::Ping, &our_id, false)
            .is_ok());
    }

    #[test]
    fn test_lookup_retries_then_expires() {
        let mut rpc = manager();
        let our_id = NodeId::generate();
        let target = NodeId::generate();

        rpc.invoke(
            QueryBody::FindNode {
                target,
                want: crate::dht::message::Want {
                    v4: true,
                    v6: false,
                },
            },
            addr(1),
            None,
            Cookie::Traversal(1),
            &our_id,
            false,
        )
        .unwrap();

        let mut retried = 0;
        let mut expired = Vec::new();
        for _ in 0..200 {
            std::thread::sleep(Duration::from_millis(2));
            let (retries, timeouts) = rpc.tick();
            retried += retries.len();
            expired.extend(timeouts);
            if !expired.is_empty() {
                break;
            }
        }

        assert_eq!(retried, MAX_RETRIES as usize);
        assert_eq!(expired.len(), 1);
        assert_eq!(rpc.outstanding(), 0);
    }

    #[test]
    fn test_ping_does_not_retry() {
        let mut rpc = manager();
        let our_id = NodeId::generate();

        rpc.invoke(QueryBody::Ping, addr(1), None, Cookie::Ping, &our_id, false)
            .unwrap();

        std::thread::sleep(Duration::from_millis(15));
        let (retries, timeouts) = rpc.tick();
        assert!(retries.is_empty());
        assert_eq!(timeouts.len(), 1);
    }
}
