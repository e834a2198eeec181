//! In-memory storage: announced peers, immutable and mutable items, and
//! the write tokens that gate mutation.
//!
//! All three tables are capped and evict the least-recently-touched entry;
//! everything expires after about two hours unless re-announced.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use bytes::Bytes;
use rand::Rng as _;
use sha1::{Digest as _, Sha1};
use tracing::debug;

use crate::bencode::Value;
use crate::constants::{
    ITEM_LIFETIME, MAX_ANNOUNCE_NAME, MAX_PEERS_REPLY, TOKEN_ROTATION_INTERVAL,
};

use super::bloom::BloomFilter;
use super::node::{Family, NodeId};
use super::sign::{PublicKey, Signature};

/// Why a put was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// Sequence number lower than the stored item's.
    LowerSeq,
    /// The `cas` value does not match the stored sequence number.
    CasMismatch,
}

/// A stored BEP-44 mutable item.
#[derive(Debug, Clone)]
pub struct MutableItem {
    pub value: Value,
    pub value_bytes: Bytes,
    pub public_key: PublicKey,
    pub signature: Signature,
    pub seq: i64,
    pub salt: Bytes,
}

struct PeerRecord {
    seed: bool,
    added: Instant,
}

struct TorrentEntry {
    peers: HashMap<SocketAddr, PeerRecord>,
    name: Option<Bytes>,
    last_announce: Instant,
}

struct ImmutableEntry {
    value: Value,
    value_bytes: Bytes,
    last_seen: Instant,
}

struct MutableEntry {
    item: MutableItem,
    last_seen: Instant,
}

/// The node's data tables.
pub struct ItemStorage {
    max_torrents: usize,
    max_items: usize,
    torrents: HashMap<NodeId, TorrentEntry>,
    immutable: HashMap<NodeId, ImmutableEntry>,
    mutable: HashMap<NodeId, MutableEntry>,
}

impl ItemStorage {
    pub fn new(max_torrents: usize, max_items: usize) -> Self {
        Self {
            max_torrents,
            max_items,
            torrents: HashMap::new(),
            immutable: HashMap::new(),
            mutable: HashMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // peers
    // ------------------------------------------------------------------

    /// Records an announce. Re-announcing the same endpoint refreshes it.
    pub fn announce_peer(
        &mut self,
        info_hash: NodeId,
        addr: SocketAddr,
        seed: bool,
        name: Option<&Bytes>,
    ) {
        if !self.torrents.contains_key(&info_hash) && self.torrents.len() >= self.max_torrents {
            if let Some(lru) = self
                .torrents
                .iter()
                .min_by_key(|(_, e)| e.last_announce)
                .map(|(k, _)| *k)
            {
                self.torrents.remove(&lru);
            }
        }

        let now = Instant::now();
        let entry = self.torrents.entry(info_hash).or_insert_with(|| TorrentEntry {
            peers: HashMap::new(),
            name: None,
            last_announce: now,
        });
        entry.last_announce = now;
        if entry.name.is_none() {
            entry.name = name.map(|n| n.slice(..n.len().min(MAX_ANNOUNCE_NAME)));
        }
        entry.peers.insert(addr, PeerRecord { seed, added: now });
    }

    /// Up to [`MAX_PEERS_REPLY`] randomly-selected peers of `family`.
    pub fn peers_for(&self, info_hash: &NodeId, family: Family, no_seed: bool) -> Vec<SocketAddr> {
        let Some(entry) = self.torrents.get(info_hash) else {
            return Vec::new();
        };

        let mut rng = rand::rng();
        let mut picked: Vec<SocketAddr> = Vec::new();
        let mut eligible = 0usize;

        // reservoir sampling keeps the reply unbiased without collecting
        // the whole peer set first
        for (addr, record) in &entry.peers {
            if Family::of(addr) != family || (no_seed && record.seed) {
                continue;
            }
            eligible += 1;
            if picked.len() < MAX_PEERS_REPLY {
                picked.push(*addr);
            } else {
                let slot = rng.random_range(0..eligible);
                if slot < MAX_PEERS_REPLY {
                    picked[slot] = *addr;
                }
            }
        }
        picked
    }

    /// BEP-33 scrape filters for `info_hash`: `(seeds, downloaders)`.
    pub fn scrape(&self, info_hash: &NodeId) -> (BloomFilter, BloomFilter) {
        let mut seeds = BloomFilter::new();
        let mut downloaders = BloomFilter::new();

        if let Some(entry) = self.torrents.get(info_hash) {
            for (addr, record) in &entry.peers {
                if record.seed {
                    seeds.insert_ip(&addr.ip());
                } else {
                    downloaders.insert_ip(&addr.ip());
                }
            }
        }
        (seeds, downloaders)
    }

    pub fn has_peers(&self, info_hash: &NodeId) -> bool {
        self.torrents
            .get(info_hash)
            .is_some_and(|e| !e.peers.is_empty())
    }

    /// The torrent name from the first announce that carried one.
    pub fn torrent_name(&self, info_hash: &NodeId) -> Option<&Bytes> {
        self.torrents.get(info_hash)?.name.as_ref()
    }

    // ------------------------------------------------------------------
    // items
    // ------------------------------------------------------------------

    fn evict_item_slot(&mut self) {
        if self.immutable.len() + self.mutable.len() < self.max_items {
            return;
        }

        // least-recently-touched goes first; among mutable items keep the
        // ones with higher seq
        let immutable_lru = self
            .immutable
            .iter()
            .min_by_key(|(_, e)| e.last_seen)
            .map(|(k, e)| (*k, e.last_seen));
        let mutable_lru = self
            .mutable
            .iter()
            .min_by_key(|(_, e)| (e.last_seen, e.item.seq))
            .map(|(k, e)| (*k, e.last_seen));

        match (immutable_lru, mutable_lru) {
            (Some((k, a)), Some((_, b))) if a <= b => {
                self.immutable.remove(&k);
            }
            (_, Some((k, _))) => {
                self.mutable.remove(&k);
            }
            (Some((k, _)), None) => {
                self.immutable.remove(&k);
            }
            (None, None) => {}
        }
    }

    /// Stores an immutable item under its (already verified) target.
    pub fn put_immutable(&mut self, target: NodeId, value: Value, value_bytes: Bytes) {
        if !self.immutable.contains_key(&target) {
            self.evict_item_slot();
        }
        self.immutable.insert(
            target,
            ImmutableEntry {
                value,
                value_bytes,
                last_seen: Instant::now(),
            },
        );
    }

    pub fn get_immutable(&self, target: &NodeId) -> Option<(&Value, &Bytes)> {
        self.immutable
            .get(target)
            .map(|e| (&e.value, &e.value_bytes))
    }

    /// Stores a mutable item, enforcing sequence ordering and CAS against
    /// any existing item at the same target.
    pub fn put_mutable(
        &mut self,
        target: NodeId,
        item: MutableItem,
        cas: Option<i64>,
    ) -> Result<(), StoreError> {
        if let Some(existing) = self.mutable.get(&target) {
            if item.seq < existing.item.seq {
                return Err(StoreError::LowerSeq);
            }
            if let Some(cas) = cas {
                if cas != existing.item.seq {
                    return Err(StoreError::CasMismatch);
                }
            }
        } else {
            self.evict_item_slot();
        }

        self.mutable.insert(
            target,
            MutableEntry {
                item,
                last_seen: Instant::now(),
            },
        );
        Ok(())
    }

    pub fn get_mutable(&self, target: &NodeId) -> Option<&MutableItem> {
        self.mutable.get(target).map(|e| &e.item)
    }

    pub fn item_count(&self) -> usize {
        self.immutable.len() + self.mutable.len()
    }

    pub fn torrent_count(&self) -> usize {
        self.torrents.len()
    }

    /// Drops everything that has outlived [`ITEM_LIFETIME`].
    pub fn expire(&mut self) {
        let now = Instant::now();
        let dead = |at: Instant| now.duration_since(at) >= ITEM_LIFETIME;

        self.immutable.retain(|_, e| !dead(e.last_seen));
        self.mutable.retain(|_, e| !dead(e.last_seen));

        let before = self.torrents.len();
        for entry in self.torrents.values_mut() {
            entry.peers.retain(|_, p| !dead(p.added));
        }
        self.torrents.retain(|_, e| !e.peers.is_empty());
        if self.torrents.len() < before {
            debug!(
                dropped = before - self.torrents.len(),
                "expired torrent peer lists"
            );
        }
    }
}

/// Issues and validates write tokens.
///
/// A token is the truncated SHA-1 of a rotating secret and the requester's
/// IP. Tokens from the current and the previous epoch are accepted, so a
/// token stays valid for five to ten minutes.
pub struct TokenManager {
    current: [u8; 16],
    previous: [u8; 16],
    last_rotation: Instant,
}

impl TokenManager {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        Self {
            current: rng.random(),
            previous: rng.random(),
            last_rotation: Instant::now(),
        }
    }

    /// Rotates the secret when the epoch is over. Returns whether a
    /// rotation happened.
    pub fn maybe_rotate(&mut self) -> bool {
        if self.last_rotation.elapsed() < TOKEN_ROTATION_INTERVAL {
            return false;
        }
        self.previous = self.current;
        self.current = rand::rng().random();
        self.last_rotation = Instant::now();
        debug!("rotated write-token secret");
        true
    }

    fn token_for(secret: &[u8; 16], ip: &IpAddr) -> Bytes {
        let mut hasher = Sha1::new();
        hasher.update(secret);
        match ip {
            IpAddr::V4(v4) => hasher.update(v4.octets()),
            IpAddr::V6(v6) => hasher.update(v6.octets()),
        }
        Bytes::copy_from_slice(&hasher.finalize()[..8])
    }

    pub fn issue(&self, addr: &SocketAddr) -> Bytes {
        Self::token_for(&self.current, &addr.ip())
    }

    pub fn verify(&self, addr: &SocketAddr, token: &[u8]) -> bool {
        Self::token_for(&self.current, &addr.ip()) == token
            || Self::token_for(&self.previous, &addr.ip()) == token
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}
