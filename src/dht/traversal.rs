//! Iterative closest-K lookup.
//!
//! A traversal owns a candidate set sorted by XOR distance to the target.
//! Candidates move `Fresh -> InFlight -> Responded | Failed`; new probes
//! launch while fewer than the branch factor are in flight and a fresh
//! candidate is strictly closer than the K-th responded one. Completion is
//! reported exactly once, however late the stragglers answer.

use std::collections::HashSet;
use std::net::SocketAddr;

use bytes::Bytes;

use super::message::{QueryBody, Reply, Want};
use super::node::{Node, NodeId};
use super::sign::{immutable_item_target_id, item_target_id, verify_mutable_item};
use super::storage::MutableItem;
use crate::bencode::Value;

/// What the traversal asks each candidate.
#[derive(Debug, Clone)]
pub enum LookupKind {
    FindNode,
    GetPeers,
    Get {
        /// Salt of the sought mutable item; empty for unsalted or
        /// immutable lookups.
        salt: Bytes,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    Fresh,
    InFlight,
    Responded,
    Failed,
}

struct Candidate {
    node: Node,
    state: CandidateState,
    token: Option<Bytes>,
}

pub struct Traversal {
    target: NodeId,
    kind: LookupKind,
    branch: usize,
    k: usize,
    /// Sorted by distance to `target`; ties by rtt, then insertion order.
    candidates: Vec<Candidate>,
    seen_ids: HashSet<NodeId>,
    seen_addrs: HashSet<SocketAddr>,
    finished: bool,
    peers: Vec<SocketAddr>,
    peer_set: HashSet<SocketAddr>,
    best_mutable: Option<MutableItem>,
    immutable: Option<(Value, Bytes)>,
}

impl Traversal {
    pub fn new(target: NodeId, kind: LookupKind, branch: usize, k: usize, seeds: Vec<Node>) -> Self {
        let mut traversal = Self {
            target,
            kind,
            branch,
            k,
            candidates: Vec::new(),
            seen_ids: HashSet::new(),
            seen_addrs: HashSet::new(),
            finished: false,
            peers: Vec::new(),
            peer_set: HashSet::new(),
            best_mutable: None,
            immutable: None,
        };
        for node in seeds {
            traversal.add_candidate(node);
        }
        traversal
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// The query this traversal sends to each candidate.
    pub fn query_body(&self, want: Want) -> QueryBody {
        match &self.kind {
            LookupKind::FindNode => QueryBody::FindNode {
                target: self.target,
                want,
            },
            LookupKind::GetPeers => QueryBody::GetPeers {
                info_hash: self.target,
                scrape: false,
                no_seed: false,
                want,
            },
            LookupKind::Get { .. } => QueryBody::Get {
                target: self.target,
                seq: None,
                want,
            },
        }
    }

    fn add_candidate(&mut self, node: Node) {
        if !self.seen_ids.insert(node.id) || !self.seen_addrs.insert(node.addr) {
            return;
        }

        let key = (self.target.distance(&node.id), node.rtt.unwrap_or(u16::MAX));
        let pos = self
            .candidates
            .iter()
            .position(|c| {
                (self.target.distance(&c.node.id), c.node.rtt.unwrap_or(u16::MAX)) > key
            })
            .unwrap_or(self.candidates.len());
        self.candidates.insert(
            pos,
            Candidate {
                node,
                state: CandidateState::Fresh,
                token: None,
            },
        );
    }

    fn in_flight(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::InFlight)
            .count()
    }

    /// Distance of the K-th closest responded candidate, if K responded.
    fn kth_responded_distance(&self) -> Option<[u8; 20]> {
        let mut responded = 0;
        for c in &self.candidates {
            if c.state == CandidateState::Responded {
                responded += 1;
                if responded == self.k {
                    return Some(self.target.distance(&c.node.id));
                }
            }
        }
        None
    }

    /// Picks the next candidates to probe and marks them in flight.
    pub fn next_batch(&mut self) -> Vec<Node> {
        if self.finished {
            return Vec::new();
        }

        let kth = self.kth_responded_distance();
        let mut in_flight = self.in_flight();
        let mut batch = Vec::new();

        for c in &mut self.candidates {
            if in_flight >= self.branch {
                break;
            }
            if c.state != CandidateState::Fresh {
                continue;
            }
            if let Some(kth) = &kth {
                // nothing fresh is closer than the current K-best
                if &self.target.distance(&c.node.id) >= kth {
                    break;
                }
            }
            c.state = CandidateState::InFlight;
            in_flight += 1;
            batch.push(c.node.clone());
        }
        batch
    }

    /// Feeds a response from `from`. Returns the peers this response newly
    /// contributed.
    pub fn on_response(&mut self, from: &SocketAddr, reply: &Reply) -> Vec<SocketAddr> {
        if self.finished {
            return Vec::new();
        }

        if let Some(c) = self.candidates.iter_mut().find(|c| &c.node.addr == from) {
            c.state = CandidateState::Responded;
            c.token = reply.token.clone();
        }

        for node in reply.nodes.iter().chain(reply.nodes6.iter()) {
            self.add_candidate(node.clone());
        }

        let mut new_peers = Vec::new();
        for peer in &reply.values {
            if self.peer_set.insert(*peer) {
                self.peers.push(*peer);
                new_peers.push(*peer);
            }
        }

        if let LookupKind::Get { salt } = &self.kind {
            if let Some(item) = &reply.item {
                match &item.mutable {
                    Some((pk, sig, seq)) => {
                        let newer = self.best_mutable.as_ref().map_or(true, |b| *seq > b.seq);
                        if newer
                            && item_target_id(salt, pk) == self.target
                            && verify_mutable_item(&item.value_bytes, salt, *seq, pk, sig)
                        {
                            self.best_mutable = Some(MutableItem {
                                value: item.value.clone(),
                                value_bytes: item.value_bytes.clone(),
                                public_key: *pk,
                                signature: *sig,
                                seq: *seq,
                                salt: salt.clone(),
                            });
                        }
                    }
                    None => {
                        if self.immutable.is_none()
                            && immutable_item_target_id(&item.value_bytes) == self.target
                        {
                            self.immutable =
                                Some((item.value.clone(), item.value_bytes.clone()));
                        }
                    }
                }
            }
        }

        new_peers
    }

    /// Marks the probe to `from` as failed.
    pub fn on_failure(&mut self, from: &SocketAddr) {
        if let Some(c) = self.candidates.iter_mut().find(|c| &c.node.addr == from) {
            c.state = CandidateState::Failed;
        }
    }

    fn is_complete(&self) -> bool {
        let mut responded = 0;
        for c in &self.candidates {
            match c.state {
                CandidateState::Responded => {
                    responded += 1;
                    if responded >= self.k {
                        return true;
                    }
                }
                CandidateState::Failed => {}
                CandidateState::Fresh | CandidateState::InFlight => return false,
            }
        }
        true
    }

    /// True exactly once: when the K closest candidates have all settled.
    /// Later events cannot re-trigger it.
    pub fn poll_done(&mut self) -> bool {
        if self.finished || !self.is_complete() {
            return false;
        }
        self.finished = true;
        true
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// The up-to-K closest responded candidates that returned a write
    /// token, for the announce/put follow-up.
    pub fn write_targets(&self) -> Vec<(Node, Bytes)> {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .filter_map(|c| c.token.clone().map(|t| (c.node.clone(), t)))
            .take(self.k)
            .collect()
    }

    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }

    pub fn best_mutable(&self) -> Option<&MutableItem> {
        self.best_mutable.as_ref()
    }

    pub fn immutable(&self) -> Option<&(Value, Bytes)> {
        self.immutable.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn node(id: NodeId, last: u8, port: u16) -> Node {
        Node::new(
            id,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, last)), port),
        )
    }

    fn id_with_first_byte(b: u8) -> NodeId {
        let mut id = [0u8; 20];
        id[0] = b;
        NodeId(id)
    }

    fn reply_from(id: NodeId, token: Option<&'static [u8]>) -> Reply {
        Reply {
            id,
            token: token.map(Bytes::from_static),
            ..Default::default()
        }
    }

    #[test]
    fn test_closest_first_and_branch_limit() {
        let target = NodeId::ZERO;
        let seeds = vec![
            node(id_with_first_byte(0x80), 1, 1),
            node(id_with_first_byte(0x01), 2, 2),
            node(id_with_first_byte(0x40), 3, 3),
            node(id_with_first_byte(0x02), 4, 4),
            node(id_with_first_byte(0x20), 5, 5),
        ];
        let mut t = Traversal::new(target, LookupKind::FindNode, 3, 8, seeds);

        let batch = t.next_batch();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].id, id_with_first_byte(0x01));
        assert_eq!(batch[1].id, id_with_first_byte(0x02));
        assert_eq!(batch[2].id, id_with_first_byte(0x20));

        // nothing more until a probe settles
        assert!(t.next_batch().is_empty());
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let target = NodeId::ZERO;
        let a = node(id_with_first_byte(0x01), 1, 1);
        let mut t = Traversal::new(target, LookupKind::FindNode, 8, 8, vec![a.clone()]);

        let batch = t.next_batch();
        assert_eq!(batch.len(), 1);

        // the response advertises the candidate itself and a same-addr clone
        let mut reply = reply_from(a.id, None);
        reply.nodes = vec![a.clone(), node(id_with_first_byte(0x33), 1, 1)];
        t.on_response(&a.addr, &reply);

        assert_eq!(t.candidates.len(), 1);
    }

    #[test]
    fn test_done_fires_exactly_once_with_late_response() {
        // K + 1 nodes, progressively closer to the target; the farthest
        // one answers only after the K closest have completed
        let target = NodeId::ZERO;
        let k = 8;

        let mut nodes = Vec::new();
        for i in 0..=k as u8 {
            // higher i, closer node
            nodes.push(node(id_with_first_byte(0x80 >> i), i, 1000 + i as u16));
        }
        let farthest = nodes[0].clone();

        let mut t = Traversal::new(
            target,
            LookupKind::Get { salt: Bytes::new() },
            k,
            k,
            nodes[..k].to_vec(),
        );

        let batch = t.next_batch();
        assert_eq!(batch.len(), k);

        // the first responder reveals the closest node, which gets probed
        let mut reply = reply_from(nodes[1].id, Some(b"01"));
        reply.nodes = vec![nodes[k].clone()];
        t.on_response(&nodes[1].addr.clone(), &reply);
        let batch = t.next_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, nodes[k].id);
        assert!(!t.poll_done());

        // the rest of the K closest respond
        for n in nodes[2..=k].iter() {
            let reply = reply_from(n.id, Some(b"02"));
            t.on_response(&n.addr.clone(), &reply);
        }

        // K closest responded; the farthest probe is still in flight
        assert!(t.poll_done());
        assert_eq!(t.write_targets().len(), k);

        // the straggler's response must not re-trigger completion
        let reply = reply_from(farthest.id, Some(b"09"));
        t.on_response(&farthest.addr.clone(), &reply);
        assert!(!t.poll_done());
    }

    #[test]
    fn test_failures_let_farther_candidates_finish() {
        let target = NodeId::ZERO;
        let nodes = vec![
            node(id_with_first_byte(0x01), 1, 1),
            node(id_with_first_byte(0x02), 2, 2),
            node(id_with_first_byte(0x04), 3, 3),
        ];
        let mut t = Traversal::new(target, LookupKind::FindNode, 8, 2, nodes.clone());

        t.next_batch();
        t.on_failure(&nodes[0].addr);
        assert!(!t.poll_done());

        t.on_response(&nodes[1].addr, &reply_from(nodes[1].id, None));
        assert!(!t.poll_done());
        t.on_response(&nodes[2].addr, &reply_from(nodes[2].id, None));
        assert!(t.poll_done());
    }

    #[test]
    fn test_peer_accumulation_dedups() {
        let target = NodeId::ZERO;
        let a = node(id_with_first_byte(0x01), 1, 1);
        let b = node(id_with_first_byte(0x02), 2, 2);
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), 99);

        let mut t = Traversal::new(target, LookupKind::GetPeers, 8, 8, vec![a.clone(), b.clone()]);
        t.next_batch();

        let mut reply = reply_from(a.id, Some(b"t"));
        reply.values = vec![peer];
        assert_eq!(t.on_response(&a.addr, &reply).len(), 1);

        let mut reply = reply_from(b.id, Some(b"t"));
        reply.values = vec![peer];
        assert!(t.on_response(&b.addr, &reply).is_empty());

        assert_eq!(t.peers(), &[peer]);
    }
}
