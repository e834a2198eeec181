use super::error::DhtError;
use rand::Rng as _;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

/// A 160-bit node or target identifier.
///
/// Distance between two IDs is the bitwise XOR interpreted as a big-endian
/// integer (the Kademlia metric).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub const ZERO: NodeId = NodeId([0u8; 20]);

    /// Generates a uniformly random ID.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != 20 {
            return Err(DhtError::InvalidNodeId);
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// XOR distance to `other`.
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut dist = [0u8; 20];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// `⌊log2(self XOR other)⌋`, or 0 when the IDs are equal.
    ///
    /// This is the bit index (from the least significant end) of the
    /// highest bit in which the two IDs differ.
    pub fn distance_exp(&self, other: &NodeId) -> usize {
        let dist = self.distance(other);
        for (i, &byte) in dist.iter().enumerate() {
            if byte != 0 {
                return (19 - i) * 8 + (7 - byte.leading_zeros() as usize);
            }
        }
        0
    }

    /// Smallest [`distance_exp`](NodeId::distance_exp) from `target` over
    /// `ids`.
    pub fn min_distance_exp<'a, I>(target: &NodeId, ids: I) -> usize
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        ids.into_iter()
            .map(|id| target.distance_exp(id))
            .min()
            .unwrap_or(160)
    }

    /// Number of leading bits shared with `other` (160 when equal).
    pub fn common_prefix(&self, other: &NodeId) -> usize {
        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let x = a ^ b;
            if x != 0 {
                return i * 8 + x.leading_zeros() as usize;
            }
        }
        160
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Transport address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() {
            Family::V4
        } else {
            Family::V6
        }
    }

    pub fn of_ip(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Compact node entry size for this family.
    pub fn compact_node_len(&self) -> usize {
        match self {
            Family::V4 => 26,
            Family::V6 => 38,
        }
    }
}

/// A known remote node.
///
/// `verified` means the node has answered at least one query we originated;
/// only verified entries count toward bucket capacity and are handed out in
/// routing responses.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// Round-trip time in milliseconds of the last response.
    pub rtt: Option<u16>,
    pub last_seen: Instant,
    pub timeout_count: u8,
    pub verified: bool,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            rtt: None,
            last_seen: Instant::now(),
            timeout_count: 0,
            verified: false,
        }
    }

    pub fn family(&self) -> Family {
        Family::of(&self.addr)
    }

    /// Records observed traffic. A round-trip time means the node answered
    /// a query of ours and becomes verified.
    pub fn touch(&mut self, rtt: Option<u16>) {
        self.last_seen = Instant::now();
        self.timeout_count = 0;
        if let Some(rtt) = rtt {
            self.rtt = Some(match self.rtt {
                // sliding average, biased toward history
                Some(old) => ((old as u32 * 2 + rtt as u32) / 3) as u16,
                None => rtt,
            });
            self.verified = true;
        }
    }

    pub fn fail(&mut self) {
        self.timeout_count = self.timeout_count.saturating_add(1);
    }

    /// Has timed out at least once since last being heard from.
    pub fn is_questionable(&self) -> bool {
        self.timeout_count > 0
    }

    /// Parses one compact node entry (26 bytes v4, 38 bytes v6).
    pub fn from_compact(data: &[u8], family: Family) -> Option<Self> {
        if data.len() != family.compact_node_len() {
            return None;
        }

        let id = NodeId::from_bytes(&data[..20]).ok()?;
        let (ip, port) = decode_endpoint(&data[20..])?;
        Some(Self::new(id, SocketAddr::new(ip, port)))
    }

    /// Appends this node's compact form to `out` if it belongs to `family`.
    pub fn write_compact(&self, family: Family, out: &mut Vec<u8>) {
        if self.family() != family {
            return;
        }
        out.extend_from_slice(&self.id.0);
        write_endpoint(&self.addr, out);
    }
}

/// Parses a `nodes`/`nodes6` blob into node entries, dropping malformed
/// trailing bytes.
pub fn parse_compact_nodes(data: &[u8], family: Family) -> Vec<Node> {
    data.chunks_exact(family.compact_node_len())
        .filter_map(|chunk| Node::from_compact(chunk, family))
        .collect()
}

/// Encodes nodes of `family` into a compact blob.
pub fn encode_compact_nodes(nodes: &[Node], family: Family) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * family.compact_node_len());
    for node in nodes {
        node.write_compact(family, &mut out);
    }
    out
}

/// Writes a compact endpoint (4+2 bytes v4, 16+2 bytes v6).
pub fn write_endpoint(addr: &SocketAddr, out: &mut Vec<u8>) {
    match addr.ip() {
        IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
}

pub fn encode_endpoint(addr: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    write_endpoint(addr, &mut out);
    out
}

/// Decodes a compact endpoint; returns `None` unless the length is exactly
/// 6 (v4) or 18 (v6).
pub fn decode_endpoint(data: &[u8]) -> Option<(IpAddr, u16)> {
    match data.len() {
        6 => {
            let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let port = u16::from_be_bytes([data[4], data[5]]);
            Some((IpAddr::V4(ip), port))
        }
        18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[..16]);
            let port = u16::from_be_bytes([data[16], data[17]]);
            Some((IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}
