//! rdht - a BitTorrent Mainline DHT node
//!
//! This library implements the Kademlia-based distributed hash table used
//! by BitTorrent, following the BEP (BitTorrent Enhancement Proposal)
//! specifications.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding and message schemas
//! - [`dht`] - BEP-5 DHT node: routing table, wire protocol, iterative
//!   lookups, peer storage; BEP-33 scrapes, BEP-42 node-ID enforcement,
//!   BEP-44 immutable/mutable items
//! - [`constants`] - protocol constants and tuning parameters

pub mod bencode;
pub mod constants;
pub mod dht;

pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{
    BloomFilter, Counters, DhtConfig, DhtError, DhtNode, DhtObserver, DhtServer, Item, Keypair,
    MutableItem, Node, NodeId, PublicKey, RoutingTable, SecretKey, Signature, Transport,
};
