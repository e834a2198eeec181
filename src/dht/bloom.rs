//! BEP-33 scrape bloom filters.
//!
//! A get_peers scrape reply carries two 2048-bit filters (seeds and
//! downloaders). Each remote address sets two bits derived from the SHA-1
//! of its IP; the cardinality can be estimated from the zero-bit count.
//!
//! [BEP-33]: http://bittorrent.org/beps/bep_0033.html

use std::net::IpAddr;

use sha1::{Digest as _, Sha1};

/// Filter size in bytes.
pub const BLOOM_SIZE: usize = 256;

const M: usize = BLOOM_SIZE * 8;

/// A fixed-size bloom filter counting distinct IP addresses.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: [u8; BLOOM_SIZE],
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl BloomFilter {
    pub fn new() -> Self {
        Self {
            bits: [0u8; BLOOM_SIZE],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bits: [u8; BLOOM_SIZE] = bytes.try_into().ok()?;
        Some(Self { bits })
    }

    pub fn as_bytes(&self) -> &[u8; BLOOM_SIZE] {
        &self.bits
    }

    /// Inserts an address. Only the high 64 bits of a v6 address are
    /// hashed, so one /64 counts once.
    pub fn insert_ip(&mut self, ip: &IpAddr) {
        let hash = match ip {
            IpAddr::V4(v4) => Sha1::digest(v4.octets()),
            IpAddr::V6(v6) => Sha1::digest(&v6.octets()[..8]),
        };

        let index1 = (hash[0] as usize | (hash[1] as usize) << 8) % M;
        let index2 = (hash[2] as usize | (hash[3] as usize) << 8) % M;
        self.bits[index1 / 8] |= 1 << (index1 % 8);
        self.bits[index2 / 8] |= 1 << (index2 % 8);
    }

    /// Estimated number of distinct addresses inserted.
    pub fn estimate_count(&self) -> f64 {
        let zeros: usize = self
            .bits
            .iter()
            .map(|b| b.count_zeros() as usize)
            .sum();
        let c = zeros.min(M - 1) as f64;
        let m = M as f64;
        (c / m).ln() / (2.0 * (1.0 - 1.0 / m).ln())
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BloomFilter(~{:.1})", self.estimate_count())
    }
}
