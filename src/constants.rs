//! Protocol constants and tuning parameters.
//!
//! These values follow the BEP-5 family of specifications and the defaults
//! of mature DHT implementations, with a few adjustments noted inline.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client version tag sent in the `v` field of every message (BEP-20 style).
pub const CLIENT_VERSION: [u8; 4] = *b"RD\x00\x01";

// ============================================================================
// Kademlia parameters
// ============================================================================

/// Bucket capacity and closeness-set size (the Kademlia `k`).
pub const DEFAULT_BUCKET_SIZE: usize = 8;

/// Concurrency factor during iterative lookups (the Kademlia alpha).
pub const DEFAULT_SEARCH_BRANCHING: usize = 4;

/// Consecutive timeouts before an entry is evicted from the routing table.
pub const DEFAULT_MAX_FAIL_COUNT: u8 = 20;

/// Capacity multipliers for the farthest buckets when the extended routing
/// table is enabled. The near buckets keep splitting at `k`.
pub const EXTENDED_BUCKET_MULTIPLIERS: [usize; 4] = [16, 8, 4, 2];

/// A bucket is refreshed by pinging its least-recently-seen entry once it
/// has been quiet this long.
pub const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

// ============================================================================
// RPC
// ============================================================================

/// Timeout for an outstanding request before the first retry.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum retransmissions of a lookup query.
pub const MAX_RETRIES: u8 = 3;

/// Maximum outstanding requests per remote node.
pub const MAX_OUTSTANDING_PER_NODE: u8 = 1;

/// Maximum outstanding requests globally.
pub const MAX_OUTSTANDING_GLOBAL: usize = 4096;

/// Largest datagram we will emit.
pub const MAX_PACKET_SIZE: usize = 1500;

// ============================================================================
// Storage
// ============================================================================

/// Maximum number of BEP-44 items held in memory.
pub const DEFAULT_MAX_DHT_ITEMS: usize = 700;

/// Maximum number of info-hashes with announced peers held in memory.
pub const DEFAULT_MAX_TORRENTS: usize = 2000;

/// Announced peers and stored items expire after this long.
pub const ITEM_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);

/// Largest accepted BEP-44 value, in bencoded bytes.
pub const MAX_ITEM_SIZE: usize = 1000;

/// Largest accepted salt for mutable items.
pub const MAX_SALT_SIZE: usize = 64;

/// Longest stored torrent name from an announce.
pub const MAX_ANNOUNCE_NAME: usize = 50;

/// Peers returned in a single get_peers reply.
pub const MAX_PEERS_REPLY: usize = 100;

/// Write-token secrets rotate this often; the previous epoch stays valid.
pub const TOKEN_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

// ============================================================================
// External address learning
// ============================================================================

/// Minimum votes before an externally-observed address is adopted.
pub const MIN_IP_VOTES: usize = 5;

// ============================================================================
// Bootstrap
// ============================================================================

/// Well-known bootstrap nodes.
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "router.utorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "dht.libtorrent.org:25401",
];
