//! The cluster RPC plane.
//!
//! A small set of named nodes is read from config. Contract ownership comes
//! from a consistent hash ring over the node names: the owner of a contract
//! is the node whose ring position is the first at or above the contract's
//! hash, wrapping around. SUBSCRIBE, UNSUBSCRIBE and PUBLISH on a remote
//! contract are forwarded to the owner, which replays them through a
//! phantom connection registered in the shared cache; deliveries for the
//! phantom travel back to the origin node. Frames are length-prefixed
//! bincode messages over plain TCP between peers.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use twox_hash::XxHash64;

use super::conn::{Conn, ConnChannels};
use super::service::Service;
use crate::core::config::ClusterConfig;
use crate::message::topic::Topic;
use crate::message::Message;
use crate::protocol::Qos;
use crate::security::{ClientId, Lid};

/// Largest accepted RPC frame.
const MAX_FRAME_SIZE: u32 = 1_048_576;

/// Depth of each peer's outbound frame queue.
const PEER_QUEUE_DEPTH: usize = 256;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("node {0} is not a cluster member")]
    UnknownNode(String),
    #[error("node {0} is unreachable")]
    Unreachable(String),
    #[error("cluster config must list the local node {0}")]
    SelfMissing(String),
    #[error("cluster io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cluster frame: {0}")]
    Frame(String),
}

/// Operation replayed on the contract owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcOp {
    Subscribe,
    Unsubscribe,
    Publish,
}

/// Wire frames exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcFrame {
    /// First frame on every peer link, naming the sender.
    Hello { node: String },
    /// Replay `op` against the owner with the forwarded flag set.
    Forward {
        op: RpcOp,
        key: Vec<u8>,
        topic: Vec<u8>,
        message: Message,
        connid: Lid,
        client_id: Vec<u8>,
    },
    /// Fan-out delivery relayed from a phantom back to the origin session.
    Delivery { connid: Lid, message: Message },
    /// The session is gone; close its phantom and drop its subscriptions.
    ConnGone { connid: Lid },
}

/// A peer node: endpoint, liveness and the outbound frame queue.
pub struct ClusterNode {
    pub name: String,
    pub addr: String,
    alive: AtomicBool,
    tx: mpsc::Sender<RpcFrame>,
    rx: Mutex<Option<mpsc::Receiver<RpcFrame>>>,
}

impl ClusterNode {
    fn new(name: String, addr: String) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        Arc::new(Self {
            name,
            addr,
            alive: AtomicBool::new(false),
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Queue a frame for this peer; a full queue surfaces as unreachable.
    pub(crate) fn send(&self, frame: RpcFrame) -> Result<(), ClusterError> {
        self.tx
            .try_send(frame)
            .map_err(|_| ClusterError::Unreachable(self.name.clone()))
    }
}

struct Ring {
    points: Vec<(u64, String)>,
}

impl Ring {
    fn new(names: impl Iterator<Item = String>) -> Self {
        let mut points: Vec<(u64, String)> = names.map(|n| (hash64(n.as_bytes()), n)).collect();
        points.sort();
        Self { points }
    }

    /// The node whose ring position is the first at or above `hash`.
    fn owner(&self, hash: u64) -> &str {
        let at = self.points.partition_point(|(p, _)| *p < hash);
        let at = if at == self.points.len() { 0 } else { at };
        &self.points[at].1
    }
}

fn hash64(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    hasher.finish()
}

fn contract_hash(contract: u32) -> u64 {
    hash64(&contract.to_le_bytes())
}

/// Cluster membership and the forwarding plane.
pub struct Cluster {
    self_name: String,
    listen_addr: String,
    peers: HashMap<String, Arc<ClusterNode>>,
    ring: Ring,
}

impl Cluster {
    /// Build the plane from config; the node list must include ourselves.
    pub fn from_config(cfg: &ClusterConfig) -> Result<Arc<Self>, ClusterError> {
        let listen_addr = cfg
            .nodes
            .iter()
            .find(|n| n.name == cfg.self_name)
            .map(|n| n.addr.clone())
            .ok_or_else(|| ClusterError::SelfMissing(cfg.self_name.clone()))?;
        let peers = cfg
            .nodes
            .iter()
            .filter(|n| n.name != cfg.self_name)
            .map(|n| (n.name.clone(), ClusterNode::new(n.name.clone(), n.addr.clone())))
            .collect();
        let ring = Ring::new(cfg.nodes.iter().map(|n| n.name.clone()));
        Ok(Arc::new(Self {
            self_name: cfg.self_name.clone(),
            listen_addr,
            peers,
            ring,
        }))
    }

    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    /// The deterministic owner of a contract; identical on every node.
    pub fn owner(&self, contract: u32) -> &str {
        self.ring.owner(contract_hash(contract))
    }

    /// Whether the contract is owned by another node.
    pub fn is_remote_contract(&self, contract: u32) -> bool {
        self.owner(contract) != self.self_name
    }

    /// Start accepting peer traffic and dialing peers.
    pub async fn start(self: &Arc<Self>, service: Arc<Service>) -> Result<(), ClusterError> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!(
            context = "cluster",
            node = %self.self_name,
            "cluster listening on {}",
            self.listen_addr
        );
        let cluster = self.clone();
        let accept_service = service.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(inbound_loop(
                            cluster.clone(),
                            accept_service.clone(),
                            stream,
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(context = "cluster.accept", "accept failed: {e}");
                    }
                }
            }
        });

        for peer in self.peers.values() {
            let Some(rx) = peer.rx.lock().take() else {
                continue;
            };
            tokio::spawn(outbound_loop(self.self_name.clone(), peer.clone(), rx));
        }
        Ok(())
    }

    /// Wrap a message with the forwarded marker and send it to the owner of
    /// the connection's contract.
    pub(crate) fn route_to_contract(
        &self,
        op: RpcOp,
        topic: &Topic,
        m: &Message,
        conn: &Conn,
    ) -> Result<(), ClusterError> {
        let owner = self.owner(conn.contract()).to_owned();
        if owner == self.self_name {
            return Ok(());
        }
        let peer = self
            .peers
            .get(&owner)
            .ok_or_else(|| ClusterError::UnknownNode(owner.clone()))?;
        conn.add_node(&owner);
        peer.send(RpcFrame::Forward {
            op,
            key: topic.key.to_vec(),
            topic: topic.topic.to_vec(),
            message: m.clone(),
            connid: conn.connid(),
            client_id: conn
                .client_id()
                .map(|id| id.as_bytes().to_vec())
                .unwrap_or_default(),
        })
    }

    /// Tell every peer holding a phantom for this session to close it.
    pub(crate) fn conn_gone(&self, conn: &Conn) {
        for name in conn.take_nodes() {
            let Some(peer) = self.peers.get(&name) else {
                continue;
            };
            if let Err(e) = peer.send(RpcFrame::ConnGone {
                connid: conn.connid(),
            }) {
                tracing::warn!(context = "cluster.conn_gone", node = %name, "notify failed: {e}");
            }
        }
    }
}

async fn write_frame(stream: &mut TcpStream, frame: &RpcFrame) -> Result<(), ClusterError> {
    let body = bincode::serialize(frame).map_err(|e| ClusterError::Frame(e.to_string()))?;
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<RpcFrame, ClusterError> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME_SIZE {
        return Err(ClusterError::Frame(format!("oversized frame of {len} bytes")));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    bincode::deserialize(&body).map_err(|e| ClusterError::Frame(e.to_string()))
}

/// Drain a peer's frame queue onto its endpoint, redialing lazily. Frames
/// that cannot be delivered are dropped; the failure already surfaced to
/// the caller as a publish-scoped error.
async fn outbound_loop(
    self_name: String,
    peer: Arc<ClusterNode>,
    mut rx: mpsc::Receiver<RpcFrame>,
) {
    let mut stream: Option<TcpStream> = None;
    loop {
        let Some(frame) = rx.recv().await else { return };
        if stream.is_none() {
            match TcpStream::connect(&peer.addr).await {
                Ok(mut s) => {
                    let hello = RpcFrame::Hello {
                        node: self_name.clone(),
                    };
                    if write_frame(&mut s, &hello).await.is_ok() {
                        peer.alive.store(true, Ordering::Relaxed);
                        stream = Some(s);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        context = "cluster.dial",
                        node = %peer.name,
                        "dial failed: {e}"
                    );
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
        let Some(s) = stream.as_mut() else {
            tracing::warn!(context = "cluster.send", node = %peer.name, "frame dropped");
            continue;
        };
        if let Err(e) = write_frame(s, &frame).await {
            tracing::warn!(context = "cluster.send", node = %peer.name, "send failed: {e}");
            peer.alive.store(false, Ordering::Relaxed);
            stream = None;
        }
    }
}

/// Serve one inbound peer link: expect the Hello, then apply frames.
async fn inbound_loop(cluster: Arc<Cluster>, service: Arc<Service>, mut stream: TcpStream) {
    let from = match read_frame(&mut stream).await {
        Ok(RpcFrame::Hello { node }) => match cluster.peers.get(&node) {
            Some(peer) => peer.clone(),
            None => {
                tracing::warn!(context = "cluster.accept", node = %node, "unknown peer");
                return;
            }
        },
        Ok(_) | Err(_) => {
            tracing::warn!(context = "cluster.accept", "peer did not introduce itself");
            return;
        }
    };
    loop {
        match read_frame(&mut stream).await {
            Ok(frame) => apply_frame(&cluster, &service, &from, frame).await,
            Err(ClusterError::Io(_)) => return,
            Err(e) => {
                tracing::warn!(context = "cluster.recv", node = %from.name, "bad frame: {e}");
                return;
            }
        }
    }
}

async fn apply_frame(
    cluster: &Arc<Cluster>,
    service: &Arc<Service>,
    from: &Arc<ClusterNode>,
    frame: RpcFrame,
) {
    match frame {
        RpcFrame::Hello { .. } => {}
        RpcFrame::Forward {
            op,
            key,
            topic,
            message,
            connid,
            client_id,
        } => {
            let conn = phantom_for(service, from, connid, client_id);
            let mut parsed = Topic {
                key: Bytes::from(key),
                topic: Bytes::from(topic),
                ..Topic::default()
            };
            parsed.parse(conn.contract(), op != RpcOp::Publish);
            if !parsed.is_valid() {
                tracing::warn!(context = "cluster.forward", connid, "invalid forwarded topic");
                return;
            }
            // The replay carries the forwarded flag, so it can never route
            // back out to another node.
            let result = match op {
                RpcOp::Subscribe => conn
                    .subscribe(
                        service,
                        Qos::try_from(message.qos).unwrap_or_default(),
                        true,
                        &parsed,
                    )
                    .map_err(|e| e.to_string()),
                RpcOp::Unsubscribe => conn
                    .unsubscribe(service, true, &parsed)
                    .map_err(|e| e.to_string()),
                RpcOp::Publish => conn
                    .publish(service, true, &parsed, &message.payload, message.message_id)
                    .await
                    .map_err(|e| e.to_string()),
            };
            if let Err(e) = result {
                tracing::warn!(
                    context = "cluster.forward",
                    node = %cluster.self_name,
                    connid,
                    "replay failed: {e}"
                );
            }
        }
        RpcFrame::Delivery { connid, message } => {
            if let Some(conn) = service.cache.get(connid) {
                if !conn.send_message(&message).await {
                    tracing::warn!(context = "cluster.delivery", connid, "delivery dropped");
                }
            }
        }
        RpcFrame::ConnGone { connid } => {
            if let Some(conn) = service.cache.get(connid) {
                if conn.is_phantom() {
                    conn.unsub_all(service);
                    conn.close(service).await;
                }
            }
        }
    }
}

/// Look up the phantom standing in for the origin session, creating it on
/// first use. The phantom relays fan-out deliveries back over the peer link.
fn phantom_for(
    service: &Arc<Service>,
    from: &Arc<ClusterNode>,
    connid: Lid,
    client_id: Vec<u8>,
) -> Arc<Conn> {
    if let Some(conn) = service.cache.get(connid) {
        return conn;
    }
    let (conn, channels) = service.new_rpc_conn(
        from.clone(),
        connid,
        ClientId::new(Bytes::from(client_id)),
    );
    tokio::spawn(relay_loop(conn.clone(), from.clone(), channels));
    conn
}

/// Forward a phantom's deliveries to its origin node; control packets
/// queued at the phantom have already been acknowledged at the origin and
/// are discarded.
async fn relay_loop(conn: Arc<Conn>, origin: Arc<ClusterNode>, mut channels: ConnChannels) {
    loop {
        tokio::select! {
            _ = conn.closing.cancelled() => break,
            message = channels.pub_rx.recv() => {
                let Some(message) = message else { break };
                let frame = RpcFrame::Delivery {
                    connid: conn.connid(),
                    message,
                };
                if let Err(e) = origin.send(frame) {
                    tracing::warn!(
                        context = "cluster.relay",
                        connid = conn.connid(),
                        "relay failed: {e}"
                    );
                }
            }
            packet = channels.send_rx.recv() => {
                if packet.is_none() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::NodeConfig;

    fn config(self_name: &str, names: &[&str]) -> ClusterConfig {
        ClusterConfig {
            self_name: self_name.to_owned(),
            nodes: names
                .iter()
                .map(|n| NodeConfig {
                    name: (*n).to_owned(),
                    addr: "127.0.0.1:0".to_owned(),
                })
                .collect(),
        }
    }

    #[test]
    fn ownership_is_deterministic_across_nodes() {
        let a = Cluster::from_config(&config("a", &["a", "b", "c"])).expect("cluster");
        let b = Cluster::from_config(&config("b", &["a", "b", "c"])).expect("cluster");
        for contract in [0u32, 1, 42, 0xDEAD_BEEF, u32::MAX] {
            assert_eq!(a.owner(contract), b.owner(contract));
        }
    }

    #[test]
    fn single_node_owns_everything() {
        let solo = Cluster::from_config(&config("a", &["a"])).expect("cluster");
        for contract in [0u32, 7, u32::MAX] {
            assert!(!solo.is_remote_contract(contract));
        }
    }

    #[test]
    fn missing_self_is_rejected() {
        assert!(matches!(
            Cluster::from_config(&config("z", &["a", "b"])),
            Err(ClusterError::SelfMissing(_))
        ));
    }

    #[test]
    fn ring_covers_the_wraparound() {
        let cluster = Cluster::from_config(&config("a", &["a", "b", "c"])).expect("cluster");
        // Every contract must land on a configured node.
        for contract in 0..1000u32 {
            let owner = cluster.owner(contract);
            assert!(["a", "b", "c"].contains(&owner));
        }
    }
}
