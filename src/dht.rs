//! BitTorrent Mainline DHT node ([BEP-5], [BEP-33], [BEP-42], [BEP-44]).
//!
//! The DHT is a Kademlia-style distributed database keyed by 160-bit IDs,
//! used for trackerless peer discovery and for storing small immutable and
//! mutable data items. This module implements a complete node: routing
//! table, wire protocol, iterative lookups, and item storage.
//!
//! # Architecture
//!
//! - [`DhtNode`] - the single-threaded protocol core. All state transitions
//!   (routing table, storage, outstanding requests, lookups) happen on one
//!   execution context; packets go out through a [`Transport`] the node is
//!   constructed with, which is how the tests capture traffic.
//! - [`DhtServer`] - a tokio shell that binds the UDP socket, drives the
//!   core, and exposes the async public API.
//! - [`RoutingTable`] - bucket storage for known nodes, with replacement
//!   caches, IP-diversity restrictions and BEP-42 ID enforcement.
//! - [`Traversal`] - the iterative closest-K lookup engine behind
//!   bootstrap, announces, and item get/put.
//!
//! # Getting started
//!
//! ```no_run
//! use rdht::dht::DhtServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dht = DhtServer::bind(6881).await?;
//! tokio::spawn({
//!     let dht = dht.clone();
//!     async move { dht.run().await }
//! });
//! dht.bootstrap().await?;
//!
//! let info_hash = [0u8; 20];
//! let peers = dht.announce(info_hash, 6881, false).await?;
//! for peer in peers {
//!     println!("found peer: {}", peer);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html
//! [BEP-33]: http://bittorrent.org/beps/bep_0033.html
//! [BEP-42]: http://bittorrent.org/beps/bep_0042.html
//! [BEP-44]: http://bittorrent.org/beps/bep_0044.html

mod bloom;
mod error;
mod message;
mod node;
mod routing;
mod rpc;
mod security;
mod server;
mod service;
mod sign;
mod storage;
mod traversal;

pub use bloom::BloomFilter;
pub use error::DhtError;
pub use message::{Message, Query, QueryBody, Reply, ReplyItem, Want};
pub use node::{Family, Node, NodeId};
pub use routing::{NodeStatus, RoutingTable};
pub use security::{generate_node_id, verify_node_id};
pub use server::{Counters, DhtConfig, DhtNode, DhtObserver, Item, Transport};
pub use service::DhtServer;
pub use sign::{
    immutable_item_target_id, item_target_id, sign_mutable_item, verify_mutable_item, Keypair,
    PublicKey, SecretKey, Signature,
};
pub use storage::{ItemStorage, MutableItem};
pub use traversal::{LookupKind, Traversal};
