//! Async shell around [`DhtNode`]: socket, timers, and the awaitable API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::bencode::Value;
use crate::constants::BOOTSTRAP_NODES;

use super::error::DhtError;
use super::node::{Family, NodeId};
use super::server::{DhtConfig, DhtNode, Item, Transport};
use super::sign::{Keypair, PublicKey};

struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl Transport for UdpTransport {
    fn send(&self, data: &[u8], to: SocketAddr) {
        // best effort; the protocol tolerates loss
        if let Err(err) = self.socket.try_send_to(data, to) {
            debug!(%to, %err, "datagram send failed");
        }
    }
}

/// A running DHT node bound to a UDP socket.
///
/// Cheap to clone; all clones share the same node. [`DhtServer::run`] must
/// be driven (usually in a spawned task) for any of the async operations to
/// make progress.
#[derive(Clone)]
pub struct DhtServer {
    inner: Arc<Inner>,
}

struct Inner {
    socket: Arc<UdpSocket>,
    node: Mutex<DhtNode>,
    port: u16,
}

impl DhtServer {
    /// Binds a dual-use UDP socket on `port` with default configuration.
    pub async fn bind(port: u16) -> Result<Self, DhtError> {
        Self::bind_with_config(port, DhtConfig::default()).await
    }

    pub async fn bind_with_config(port: u16, config: DhtConfig) -> Result<Self, DhtError> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        let local = socket.local_addr()?;

        let transport = Arc::new(UdpTransport {
            socket: socket.clone(),
        });
        let node = DhtNode::new(config, transport);

        info!(addr = %local, id = %node.our_id(Family::V4), "dht node bound");

        Ok(Self {
            inner: Arc::new(Inner {
                socket,
                node: Mutex::new(node),
                port: local.port(),
            }),
        })
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn our_id(&self) -> NodeId {
        *self.inner.node.lock().our_id(Family::V4)
    }

    /// Receive loop plus the one-second maintenance tick. Runs until the
    /// socket fails.
    pub async fn run(&self) -> Result<(), DhtError> {
        let mut buf = vec![0u8; 65536];
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = self.inner.socket.recv_from(&mut buf) => {
                    let (n, from) = result?;
                    self.inner.node.lock().incoming(&buf[..n], from);
                }
                _ = tick.tick() => {
                    self.inner.node.lock().tick();
                }
            }
        }
    }

    /// Bootstraps from the well-known router nodes.
    pub async fn bootstrap(&self) -> Result<usize, DhtError> {
        let mut seeds = Vec::new();
        for host in BOOTSTRAP_NODES {
            match tokio::net::lookup_host(host).await {
                Ok(addrs) => seeds.extend(addrs),
                Err(err) => warn!(host, %err, "bootstrap node did not resolve"),
            }
        }
        self.bootstrap_from(&seeds).await
    }

    /// Bootstraps from explicit seed addresses. Resolves to the resulting
    /// routing-table size.
    pub async fn bootstrap_from(&self, seeds: &[SocketAddr]) -> Result<usize, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.inner.node.lock().bootstrap(seeds, move |nodes| {
            let _ = tx.send(nodes);
        });
        rx.await.map_err(|_| DhtError::Cancelled)
    }

    /// Looks up peers for `info_hash` and announces our `port`.
    pub async fn announce(
        &self,
        info_hash: [u8; 20],
        port: u16,
        seed: bool,
    ) -> Result<Vec<SocketAddr>, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .node
            .lock()
            .announce(NodeId(info_hash), port, seed, None, move |peers| {
                let _ = tx.send(peers);
            });
        rx.await.map_err(|_| DhtError::Cancelled)
    }

    /// Retrieves the immutable item stored under `target`.
    pub async fn get_item(&self, target: NodeId) -> Result<Option<Item>, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.inner.node.lock().get_item(target, move |item| {
            let _ = tx.send(item);
        });
        rx.await.map_err(|_| DhtError::Cancelled)
    }

    /// Retrieves the freshest valid mutable item for `public_key`/`salt`.
    pub async fn get_mutable_item(
        &self,
        public_key: PublicKey,
        salt: impl Into<Bytes>,
    ) -> Result<Option<Item>, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .node
            .lock()
            .get_mutable_item(public_key, salt.into(), move |item| {
                let _ = tx.send(item);
            });
        rx.await.map_err(|_| DhtError::Cancelled)
    }

    /// Stores an immutable item; resolves to its target id and the number
    /// of nodes that stored it.
    pub async fn put_item(&self, value: Value) -> Result<(NodeId, usize), DhtError> {
        let (tx, rx) = oneshot::channel();
        let (target, _op) = self.inner.node.lock().put_item(value, move |stores| {
            let _ = tx.send(stores);
        })?;
        let stores = rx.await.map_err(|_| DhtError::Cancelled)?;
        Ok((target, stores))
    }

    /// Publishes `value` as a mutable item, bumping the sequence number
    /// past whatever the network already holds.
    pub async fn put_mutable_item(
        &self,
        keypair: Keypair,
        salt: impl Into<Bytes>,
        value: Value,
    ) -> Result<usize, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.inner.node.lock().put_mutable_item(
            keypair,
            salt.into(),
            move |observed| {
                let seq = observed.map_or(1, |item| item.seq + 1);
                (value, seq)
            },
            move |stores| {
                let _ = tx.send(stores);
            },
        );
        rx.await.map_err(|_| DhtError::Cancelled)
    }

    /// Snapshot of the protocol counters.
    pub fn counters(&self) -> super::server::Counters {
        *self.inner.node.lock().counters()
    }
}
