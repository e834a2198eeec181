use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use tracing::debug;

use crate::constants::{BUCKET_REFRESH_INTERVAL, EXTENDED_BUCKET_MULTIPLIERS, MIN_IP_VOTES};

use super::node::{Family, Node, NodeId};
use super::security::verify_node_id;

/// Outcome of feeding observed traffic into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// A new entry was added to a bucket.
    Inserted,
    /// An existing entry was refreshed.
    Updated,
    /// The bucket was full; the node went to its replacement cache.
    Replacement,
    /// The node ID is not a valid BEP-42 derivation of the source address.
    BadId,
    /// Ignored: endpoint hijack attempt or IP-diversity violation.
    IpConflict,
    /// Ignored: bucket and replacement cache are both full.
    Full,
}

#[derive(Debug, Default)]
struct Bucket {
    live: Vec<Node>,
    replacements: Vec<Node>,
    last_refresh: Option<Instant>,
}

impl Bucket {
    fn find(&self, id: &NodeId) -> Option<usize> {
        self.live.iter().position(|n| &n.id == id)
    }

    fn contains_subnet(&self, ip: &IpAddr, except: Option<&NodeId>) -> bool {
        self.live
            .iter()
            .chain(self.replacements.iter())
            .filter(|n| Some(&n.id) != except)
            .any(|n| same_subnet(&n.addr.ip(), ip))
    }

    /// Best replacement to promote: verified first, then lowest rtt, then
    /// most recently seen.
    fn take_best_replacement(&mut self) -> Option<Node> {
        if self.replacements.is_empty() {
            return None;
        }
        let mut best = 0;
        for i in 1..self.replacements.len() {
            let a = &self.replacements[i];
            let b = &self.replacements[best];
            let better = (a.verified, b.verified) == (true, false)
                || (a.verified == b.verified
                    && (a.rtt.unwrap_or(u16::MAX), std::cmp::Reverse(a.last_seen))
                        < (b.rtt.unwrap_or(u16::MAX), std::cmp::Reverse(b.last_seen)));
            if better {
                best = i;
            }
        }
        Some(self.replacements.remove(best))
    }
}

/// Nodes within one /24 (v4) or /64 (v6) are considered the same origin.
fn same_subnet(a: &IpAddr, b: &IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..3] == b.octets()[..3],
        (IpAddr::V6(a), IpAddr::V6(b)) => a.octets()[..8] == b.octets()[..8],
        _ => false,
    }
}

/// Tally of externally-observed addresses from response `ip` fields.
///
/// Each distinct voter subnet gets one vote; a candidate wins once it has
/// enough votes and a clear margin over the runner-up.
#[derive(Debug, Default)]
pub struct IpVoter {
    votes: HashMap<IpAddr, usize>,
    voters: Vec<IpAddr>,
    current: Option<IpAddr>,
}

impl IpVoter {
    /// Records one vote. Returns the observed address when it newly wins.
    pub fn vote(&mut self, observed: IpAddr, voter: IpAddr) -> Option<IpAddr> {
        if self.voters.iter().any(|v| same_subnet(v, &voter)) {
            return None;
        }
        self.voters.push(voter);

        let count = {
            let entry = self.votes.entry(observed).or_insert(0);
            *entry += 1;
            *entry
        };

        if Some(observed) == self.current || count < MIN_IP_VOTES {
            return None;
        }

        let runner_up = self
            .votes
            .iter()
            .filter(|(ip, _)| **ip != observed)
            .map(|(_, c)| *c)
            .max()
            .unwrap_or(0);

        if count >= runner_up * 2 {
            self.current = Some(observed);
            return Some(observed);
        }
        None
    }

    pub fn external_address(&self) -> Option<IpAddr> {
        self.current
    }
}

/// Kademlia routing table.
///
/// Buckets live in a flat array indexed by the length of the prefix shared
/// with the local ID; the deepest bucket covers the local ID and is the
/// only one that splits. Each bucket carries a same-size replacement cache.
pub struct RoutingTable {
    id: NodeId,
    family: Family,
    k: usize,
    max_fail_count: u8,
    enforce_node_id: bool,
    restrict_routing_ips: bool,
    extended: bool,
    buckets: Vec<Bucket>,
    /// endpoint -> id of the live entry at that endpoint
    endpoints: HashMap<SocketAddr, NodeId>,
    ip_voter: IpVoter,
}

impl RoutingTable {
    pub fn new(
        id: NodeId,
        family: Family,
        k: usize,
        max_fail_count: u8,
        enforce_node_id: bool,
        restrict_routing_ips: bool,
        extended: bool,
    ) -> Self {
        Self {
            id,
            family,
            k,
            max_fail_count,
            enforce_node_id,
            restrict_routing_ips,
            extended,
            buckets: vec![Bucket::default()],
            endpoints: HashMap::new(),
            ip_voter: IpVoter::default(),
        }
    }

    pub fn our_id(&self) -> &NodeId {
        &self.id
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of live entries per bucket, deepest last.
    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets.iter().map(|b| b.live.len()).collect()
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.live.len()).sum()
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.id.common_prefix(id).min(self.buckets.len() - 1)
    }

    fn bucket_capacity(&self, index: usize) -> usize {
        if self.extended && index < EXTENDED_BUCKET_MULTIPLIERS.len() {
            self.k * EXTENDED_BUCKET_MULTIPLIERS[index]
        } else {
            self.k
        }
    }

    /// Feeds observed traffic from a remote node into the table.
    ///
    /// `rtt` is present when the traffic was a response to a query we
    /// originated; such nodes become verified.
    pub fn node_seen(&mut self, id: NodeId, addr: SocketAddr, rtt: Option<u16>) -> NodeStatus {
        if Family::of(&addr) != self.family || id == self.id {
            return NodeStatus::BadId;
        }

        if self.enforce_node_id && !verify_node_id(&id, addr.ip()) {
            return NodeStatus::BadId;
        }

        // same id under a different endpoint: refuse to move it (hijack)
        let index = self.bucket_index(&id);
        if let Some(pos) = self.buckets[index].find(&id) {
            let node = &mut self.buckets[index].live[pos];
            if node.addr != addr {
                return NodeStatus::IpConflict;
            }
            node.touch(rtt);
            return NodeStatus::Updated;
        }

        // same endpoint under a different id: the node changed its id
        if let Some(old_id) = self.endpoints.get(&addr).copied() {
            if old_id != id {
                self.remove(&old_id);
            }
        }

        // also refresh a matching replacement-cache entry in place
        let index = self.bucket_index(&id);
        if let Some(node) = self.buckets[index]
            .replacements
            .iter_mut()
            .find(|n| n.id == id && n.addr == addr)
        {
            node.touch(rtt);
            return NodeStatus::Updated;
        }

        let mut node = Node::new(id, addr);
        node.touch(rtt);
        self.place(node)
    }

    fn place(&mut self, node: Node) -> NodeStatus {
        loop {
            let index = self.bucket_index(&node.id);

            if self.restrict_routing_ips
                && self.buckets[index].contains_subnet(&node.addr.ip(), Some(&node.id))
            {
                return NodeStatus::IpConflict;
            }

            if self.buckets[index].live.len() < self.bucket_capacity(index) {
                self.endpoints.insert(node.addr, node.id);
                self.buckets[index].live.push(node);
                return NodeStatus::Inserted;
            }

            // only the deepest bucket covers our own id and may split
            if index == self.buckets.len() - 1 && self.buckets.len() < 159 {
                self.split();
                continue;
            }

            let bucket = &mut self.buckets[index];
            if let Some(pos) = bucket
                .replacements
                .iter()
                .position(|n| n.id == node.id || n.addr == node.addr)
            {
                bucket.replacements.remove(pos);
            }
            if bucket.replacements.len() >= self.k {
                // LRU within the cache
                bucket.replacements.remove(0);
            }
            bucket.replacements.push(node);
            return NodeStatus::Replacement;
        }
    }

    fn split(&mut self) {
        let old_last = self.buckets.len() - 1;
        self.buckets.push(Bucket::default());

        let live = std::mem::take(&mut self.buckets[old_last].live);
        let replacements = std::mem::take(&mut self.buckets[old_last].replacements);

        for node in live {
            let index = self.id.common_prefix(&node.id).min(self.buckets.len() - 1);
            self.buckets[index].live.push(node);
        }
        for node in replacements {
            let index = self.id.common_prefix(&node.id).min(self.buckets.len() - 1);
            self.buckets[index].replacements.push(node);
        }

        debug!(buckets = self.buckets.len(), "split routing bucket");
    }

    fn remove(&mut self, id: &NodeId) {
        let index = self.bucket_index(id);
        if let Some(pos) = self.buckets[index].find(id) {
            let node = self.buckets[index].live.remove(pos);
            self.endpoints.remove(&node.addr);
        }
    }

    /// Records a query timeout against an entry.
    pub fn node_failed(&mut self, id: &NodeId, addr: &SocketAddr) {
        let index = self.bucket_index(id);
        let Some(pos) = self.buckets[index].find(id) else {
            return;
        };
        if &self.buckets[index].live[pos].addr != addr {
            return;
        }

        let node = &mut self.buckets[index].live[pos];
        node.fail();
        if node.timeout_count < self.max_fail_count {
            return;
        }

        let stale = self.buckets[index].live.remove(pos);
        self.endpoints.remove(&stale.addr);
        debug!(id = %stale.id, "evicted stale routing entry");

        if let Some(promoted) = self.buckets[index].take_best_replacement() {
            self.endpoints.insert(promoted.addr, promoted.id);
            self.buckets[index].live.push(promoted);
        }
    }

    /// Up to `count` verified entries closest to `target`, walking the
    /// bucket array outward from the target's bucket.
    pub fn closest_nodes(&self, target: &NodeId, count: usize) -> Vec<Node> {
        let center = self.bucket_index(target);
        let mut collected: Vec<Node> = Vec::new();

        let mut radius = 0;
        loop {
            let mut touched = false;
            if radius == 0 {
                collected.extend(self.buckets[center].live.iter().filter(|n| n.verified).cloned());
                touched = true;
            } else {
                if center + radius < self.buckets.len() {
                    collected.extend(
                        self.buckets[center + radius]
                            .live
                            .iter()
                            .filter(|n| n.verified)
                            .cloned(),
                    );
                    touched = true;
                }
                if center >= radius {
                    collected.extend(
                        self.buckets[center - radius]
                            .live
                            .iter()
                            .filter(|n| n.verified)
                            .cloned(),
                    );
                    touched = true;
                }
            }
            if !touched || collected.len() >= count * 2 {
                break;
            }
            radius += 1;
        }

        collected.sort_by(|a, b| {
            target
                .distance(&a.id)
                .cmp(&target.distance(&b.id))
                .then(a.rtt.unwrap_or(u16::MAX).cmp(&b.rtt.unwrap_or(u16::MAX)))
                .then(a.last_seen.cmp(&b.last_seen))
        });
        collected.truncate(count);
        collected
    }

    /// Looks up a live entry by id.
    pub fn find(&self, id: &NodeId) -> Option<&Node> {
        let index = self.bucket_index(id);
        self.buckets[index].find(id).map(|pos| &self.buckets[index].live[pos])
    }

    /// Visits every live entry; order unspecified.
    pub fn for_each_node<F: FnMut(&Node)>(&self, mut f: F) {
        for bucket in &self.buckets {
            for node in &bucket.live {
                f(node);
            }
        }
    }

    /// Re-shapes the table around a new local ID. Entries are re-placed;
    /// those that no longer fit are dropped.
    pub fn update_node_id(&mut self, new_id: NodeId) {
        let mut entries = Vec::with_capacity(self.node_count());
        for bucket in &mut self.buckets {
            entries.append(&mut bucket.live);
            entries.append(&mut bucket.replacements);
        }

        self.id = new_id;
        self.buckets = vec![Bucket::default()];
        self.endpoints.clear();

        for node in entries {
            if node.id == new_id {
                continue;
            }
            self.place(node);
        }
    }

    /// The next entry to ping to keep a quiet bucket fresh, if any.
    ///
    /// Returns the least-recently-seen entry of the first bucket that has
    /// not been refreshed within [`BUCKET_REFRESH_INTERVAL`].
    pub fn next_refresh_target(&mut self) -> Option<Node> {
        let now = Instant::now();
        for bucket in &mut self.buckets {
            if bucket.live.is_empty() {
                continue;
            }
            let due = match bucket.last_refresh {
                Some(at) => now.duration_since(at) >= BUCKET_REFRESH_INTERVAL,
                None => true,
            };
            if !due {
                continue;
            }
            if let Some(node) = bucket.live.iter().min_by_key(|n| n.last_seen) {
                if now.duration_since(node.last_seen) >= BUCKET_REFRESH_INTERVAL {
                    bucket.last_refresh = Some(now);
                    return Some(node.clone());
                }
            }
        }
        None
    }

    /// Feeds an external-address observation into the voter.
    pub fn vote_external_address(&mut self, observed: IpAddr, voter: IpAddr) -> Option<IpAddr> {
        self.ip_voter.vote(observed, voter)
    }

    pub fn external_address(&self) -> Option<IpAddr> {
        self.ip_voter.external_address()
    }
}
