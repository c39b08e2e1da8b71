//! Per-connection state and the routing operations that act on it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::cluster::{ClusterNode, RpcOp};
use super::service::Service;
use super::{BrokerError, ErrorReply, CLIENT_ID_TOPIC, ERROR_TOPIC};
use crate::message::topic::Topic;
use crate::message::{Message, MessageIds, Mid, Stats};
use crate::protocol::frame::Proto;
use crate::protocol::{Packet, Qos};
use crate::security::{new_lid, ClientId, Lid};
use crate::store::log_key;

/// Grace given to a peer session's queue before a message is dropped.
pub(crate) const SEND_OFFER_TIMEOUT: Duration = Duration::from_micros(50);

const SEND_QUEUE_DEPTH: usize = 128;
const PUBLISH_QUEUE_DEPTH: usize = 1;

/// Receiver halves of a connection's outbound queues, owned by the writer.
pub(crate) struct ConnChannels {
    pub send_rx: mpsc::Receiver<Packet>,
    pub pub_rx: mpsc::Receiver<Message>,
}

/// One client session, or a phantom standing in for a session on a peer
/// node. Shared state is guarded per-field; the subscription stats lock is
/// held across any stat mutation.
pub struct Conn {
    connid: Lid,
    proto: Proto,
    client_id: RwLock<Option<ClientId>>,
    username: RwLock<Option<String>>,
    insecure: AtomicBool,
    message_ids: MessageIds,
    inbound_qos2: Mutex<HashSet<u16>>,
    subs: Mutex<Stats>,
    send_tx: mpsc::Sender<Packet>,
    pub_tx: mpsc::Sender<Message>,
    /// Close signal observed by every blocking path in the session.
    pub(crate) closing: CancellationToken,
    closed: AtomicBool,
    /// Origin node of a phantom session; `None` for client sessions.
    clnode: Option<Arc<ClusterNode>>,
    /// Peers holding a phantom for this session, told on close.
    nodes: Mutex<HashSet<String>>,
}

impl Conn {
    pub(crate) fn new(proto: Proto) -> (Arc<Self>, ConnChannels) {
        Self::build(proto, new_lid(), None, None)
    }

    /// A phantom for a session accepted by `clnode`, registered under the
    /// origin's connection id so local fan-out can reach it.
    pub(crate) fn new_rpc(
        clnode: Arc<ClusterNode>,
        connid: Lid,
        client_id: ClientId,
    ) -> (Arc<Self>, ConnChannels) {
        Self::build(Proto::Cluster, connid, Some(clnode), Some(client_id))
    }

    fn build(
        proto: Proto,
        connid: Lid,
        clnode: Option<Arc<ClusterNode>>,
        client_id: Option<ClientId>,
    ) -> (Arc<Self>, ConnChannels) {
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (pub_tx, pub_rx) = mpsc::channel(PUBLISH_QUEUE_DEPTH);
        let conn = Arc::new(Self {
            connid,
            proto,
            client_id: RwLock::new(client_id),
            username: RwLock::new(None),
            insecure: AtomicBool::new(false),
            message_ids: MessageIds::default(),
            inbound_qos2: Mutex::new(HashSet::new()),
            subs: Mutex::new(Stats::new()),
            send_tx,
            pub_tx,
            closing: CancellationToken::new(),
            closed: AtomicBool::new(false),
            clnode,
            nodes: Mutex::new(HashSet::new()),
        });
        (conn, ConnChannels { send_rx, pub_rx })
    }

    pub fn connid(&self) -> Lid {
        self.connid
    }

    pub fn proto(&self) -> Proto {
        self.proto
    }

    pub fn is_phantom(&self) -> bool {
        self.clnode.is_some()
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id.read().clone()
    }

    pub(crate) fn set_client_id(&self, id: ClientId) {
        *self.client_id.write() = Some(id);
    }

    pub(crate) fn set_username(&self, username: Option<String>) {
        *self.username.write() = username;
    }

    pub fn username(&self) -> Option<String> {
        self.username.read().clone()
    }

    pub(crate) fn set_insecure(&self, insecure: bool) {
        self.insecure.store(insecure, Ordering::Relaxed);
    }

    pub(crate) fn insecure(&self) -> bool {
        self.insecure.load(Ordering::Relaxed)
    }

    /// The contract namespace of this session; zero before CONNECT.
    pub fn contract(&self) -> u32 {
        self.client_id.read().as_ref().map_or(0, ClientId::contract)
    }

    pub(crate) fn inbound_mid(&self, id: u16) -> Mid {
        self.connid.wrapping_sub(u32::from(id))
    }

    #[allow(dead_code)]
    pub(crate) fn outbound_id(&self, mid: Mid) -> u16 {
        self.connid.wrapping_sub(mid) as u16
    }

    /// Mint a wire id for an outbound QoS > 0 publish.
    pub(crate) fn next_message_id(&self) -> u16 {
        self.message_ids.next_id()
    }

    /// Release an outbound id after PUBACK or PUBCOMP.
    pub(crate) fn release_message_id(&self, id: u16) {
        self.message_ids.free_id(id);
    }

    /// Track an inbound QoS 2 publish; false means the id is already in
    /// flight and the delivery must not repeat.
    pub(crate) fn begin_exactly_once(&self, id: u16) -> bool {
        self.inbound_qos2.lock().insert(id)
    }

    /// Complete the inbound QoS 2 handshake; duplicates are idempotent.
    pub(crate) fn end_exactly_once(&self, id: u16) {
        self.inbound_qos2.lock().remove(&id);
    }

    /// Remember that `node` holds a phantom for this session.
    pub(crate) fn add_node(&self, node: &str) {
        self.nodes.lock().insert(node.to_owned());
    }

    pub(crate) fn take_nodes(&self) -> Vec<String> {
        self.nodes.lock().drain().collect()
    }

    /// Queue a control packet onto this session's writer.
    pub(crate) async fn queue_packet(&self, packet: Packet) -> bool {
        tokio::select! {
            _ = self.closing.cancelled() => false,
            sent = self.send_tx.send(packet) => sent.is_ok(),
        }
    }

    /// Offer a message to this session's publish queue. A slow consumer is
    /// given [`SEND_OFFER_TIMEOUT`] before the message is dropped.
    pub(crate) async fn send_message(&self, m: &Message) -> bool {
        self.pub_tx
            .send_timeout(m.clone(), SEND_OFFER_TIMEOUT)
            .await
            .is_ok()
    }

    /// Announce a broker-minted client id on the reserved topic.
    pub(crate) async fn send_client_id(&self, client_id: &ClientId) {
        self.send_message(&Message {
            message_id: 0,
            qos: 0,
            topic: Bytes::from_static(CLIENT_ID_TOPIC),
            payload: client_id.as_bytes().clone(),
        })
        .await;
    }

    /// Surface a per-message error back to the publisher.
    pub(crate) async fn notify_error(&self, mut reply: ErrorReply, message_id: u16) {
        reply.id = message_id;
        if let Ok(payload) = serde_json::to_vec(&reply) {
            self.send_message(&Message {
                message_id: 0,
                qos: 0,
                topic: Bytes::from_static(ERROR_TOPIC),
                payload: Bytes::from(payload),
            })
            .await;
        }
    }

    /// Subscribe this session to a topic. A repeat subscribe through a key
    /// that is already held locally, on a contract owned by another node,
    /// is routed to the owner; otherwise the stat is incremented and the
    /// first increment persists the `{qos, connid}` record.
    pub(crate) fn subscribe(
        &self,
        service: &Service,
        qos: Qos,
        forwarded: bool,
        topic: &Topic,
    ) -> Result<(), BrokerError> {
        let contract = self.contract();
        let key = String::from_utf8_lossy(&topic.key).into_owned();
        let mut subs = self.subs.lock();
        if subs.exist(&key) && !forwarded && service.is_remote_contract(contract) {
            service.route_to_contract(
                RpcOp::Subscribe,
                topic,
                &Message {
                    message_id: 0,
                    qos: qos as u8,
                    topic: topic.topic.clone(),
                    payload: Bytes::new(),
                },
                self,
            )?;
            return Ok(());
        }

        let id = service.store.subscription.new_id()?;
        if subs.increment(&topic.topic, &key, id) {
            let mut payload = [0u8; 5];
            payload[0] = qos as u8;
            payload[1..5].copy_from_slice(&self.connid.to_le_bytes());
            service.store.subscription.put(contract, id, topic, &payload)?;
            service.meters.subscriptions.inc(1);
        }
        Ok(())
    }

    /// Unsubscribe this session from a topic; the last decrement deletes
    /// the store record. Remote contracts are additionally routed to the
    /// owner so the phantom record goes away.
    pub(crate) fn unsubscribe(
        &self,
        service: &Service,
        forwarded: bool,
        topic: &Topic,
    ) -> Result<(), BrokerError> {
        let contract = self.contract();
        let key = String::from_utf8_lossy(&topic.key).into_owned();
        {
            let mut subs = self.subs.lock();
            let (last, id) = subs.decrement(&key);
            if last {
                service.store.subscription.delete(contract, id, topic)?;
                service.meters.subscriptions.dec(1);
            }
        }
        if !forwarded && service.is_remote_contract(contract) {
            service.route_to_contract(
                RpcOp::Unsubscribe,
                topic,
                &Message {
                    message_id: 0,
                    qos: 0,
                    topic: topic.topic.clone(),
                    payload: Bytes::new(),
                },
                self,
            )?;
        }
        Ok(())
    }

    /// Publish a message to every matching subscriber. Local fan-out reads
    /// the store records and offers to each subscriber's queue; when the
    /// contract lives on another node the message is also routed there.
    pub(crate) async fn publish(
        &self,
        service: &Service,
        forwarded: bool,
        topic: &Topic,
        payload: &Bytes,
        message_id: u16,
    ) -> Result<(), BrokerError> {
        service.meters.in_msgs.inc(1);
        service.meters.in_bytes.inc(payload.len() as i64);

        let contract = self.contract();
        let records = service.store.subscription.get(contract, topic)?;
        let mut m = Message {
            message_id,
            qos: 0,
            topic: topic.topic.clone(),
            payload: payload.clone(),
        };
        let mut fanout = 0i64;
        for record in &records {
            if record.len() < 5 {
                continue;
            }
            m.qos = record[0];
            let lid = Lid::from_le_bytes([record[1], record[2], record[3], record[4]]);
            let Some(sub) = service.cache.get(lid) else {
                continue;
            };
            if m.qos != 0 && m.message_id == 0 {
                m.message_id = self.next_message_id();
            }
            if !sub.send_message(&m).await {
                tracing::warn!(
                    context = "conn.publish",
                    connid = self.connid,
                    sub = lid,
                    "subscriber queue full, message dropped"
                );
            }
            fanout += 1;
        }
        service.meters.out_msgs.inc(fanout);
        service.meters.out_bytes.inc(m.size() as i64 * fanout);

        if !forwarded && service.is_remote_contract(contract) {
            service.route_to_contract(RpcOp::Publish, topic, &m, self)?;
        }
        Ok(())
    }

    /// Persist an inbound packet to the message log.
    pub(crate) fn store_inbound(&self, service: &Service, packet: &Packet) {
        if let Some(client_id) = self.client_id.read().as_ref() {
            let key = log_key(self.inbound_mid(packet.message_id()), client_id.contract());
            service.store.log.persist_inbound(key, packet);
        }
    }

    /// Persist an outbound packet to the message log.
    pub(crate) fn store_outbound(&self, service: &Service, packet: &Packet) {
        if let Some(client_id) = self.client_id.read().as_ref() {
            let key = log_key(Mid::from(packet.message_id()), client_id.contract());
            service.store.log.persist_outbound(key, packet);
        }
    }

    /// Delete every held subscription from the store directly. Never calls
    /// `unsubscribe`; re-entering it from teardown would retake the stats
    /// lock around blocking work.
    pub(crate) fn unsub_all(&self, service: &Service) {
        let contract = self.contract();
        // Snapshot the stats so the lock is not held across the store calls.
        let stats = self.subs.lock().all();
        for stat in stats {
            let topic = Topic {
                topic: stat.topic.clone(),
                ..Topic::default()
            };
            if let Err(e) = service.store.subscription.delete(contract, stat.id, &topic) {
                tracing::warn!(
                    context = "conn.close",
                    connid = self.connid,
                    "unable to remove subscription: {e}"
                );
            }
            service.meters.subscriptions.dec(1);
        }
    }

    /// Terminate the connection. Exactly one caller performs teardown; the
    /// rest observe the close signal.
    pub(crate) async fn close(&self, service: &Service) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closing.cancel();
        if self.clnode.is_none() {
            self.unsub_all(service);
        }
        service.cache.delete(self.connid);
        if let Some(cluster) = service.cluster() {
            cluster.conn_gone(self);
        }
        if self.clnode.is_none() {
            service.meters.connections.dec(1);
        }
        tracing::info!(context = "conn.close", connid = self.connid, "conn closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ClusterConfig, Config, NodeConfig};

    fn clustered_service() -> Arc<Service> {
        let cfg = Config {
            cluster: Some(ClusterConfig {
                self_name: "a".to_owned(),
                nodes: vec![
                    NodeConfig {
                        name: "a".to_owned(),
                        addr: "127.0.0.1:0".to_owned(),
                    },
                    NodeConfig {
                        name: "b".to_owned(),
                        addr: "127.0.0.1:0".to_owned(),
                    },
                ],
            }),
            ..Config::default()
        };
        Service::new(cfg).expect("service")
    }

    /// A client id whose contract is owned by the given node.
    fn client_id_owned_by(service: &Service, node: &str) -> ClientId {
        let cluster = service.cluster().expect("cluster");
        for a in b'A'..=b'Z' {
            for b in b'A'..=b'Z' {
                let id = ClientId::new(Bytes::copy_from_slice(&[a, b, b'C', b'D']));
                if cluster.owner(id.contract()) == node {
                    return id;
                }
            }
        }
        panic!("no contract owned by {node}");
    }

    fn parsed(expr: &[u8], contract: u32, wildcard: bool) -> Topic {
        let mut topic = crate::message::topic::parse_key(expr);
        topic.parse(contract, wildcard);
        topic
    }

    #[test]
    fn forwarded_requests_never_route_back_out() {
        let service = clustered_service();
        let (conn, _channels) = service.new_conn(Proto::Binary);
        conn.set_client_id(client_id_owned_by(&service, "b"));
        let contract = conn.contract();
        let topic = parsed(b"key/a.b", contract, true);

        // A forwarded subscribe is terminal here: it lands in the local
        // store instead of being routed again, even as a repeat.
        conn.subscribe(&service, Qos::AtMostOnce, true, &topic)
            .expect("subscribe");
        conn.subscribe(&service, Qos::AtMostOnce, true, &topic)
            .expect("repeat subscribe");
        let records = service
            .store
            .subscription
            .get(contract, &parsed(b"key/a.b", contract, false))
            .expect("get");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0][1..5], conn.connid().to_le_bytes());
        assert!(conn.take_nodes().is_empty());
    }

    #[test]
    fn first_remote_subscribe_is_stored_where_the_session_lives() {
        let service = clustered_service();
        let (conn, _channels) = service.new_conn(Proto::Binary);
        conn.set_client_id(client_id_owned_by(&service, "b"));
        let contract = conn.contract();
        let topic = parsed(b"key/a.b", contract, true);

        conn.subscribe(&service, Qos::AtMostOnce, false, &topic)
            .expect("subscribe");
        let records = service
            .store
            .subscription
            .get(contract, &parsed(b"key/a.b", contract, false))
            .expect("get");
        assert_eq!(records.len(), 1);
        assert!(conn.take_nodes().is_empty());
    }

    #[test]
    fn repeat_remote_subscribe_is_routed_to_the_owner() {
        let service = clustered_service();
        let (conn, _channels) = service.new_conn(Proto::Binary);
        conn.set_client_id(client_id_owned_by(&service, "b"));
        let contract = conn.contract();
        let topic = parsed(b"key/a.b", contract, true);

        conn.subscribe(&service, Qos::AtMostOnce, false, &topic)
            .expect("subscribe");
        // The key now exists locally, so the repeat is routed instead of
        // touching the stat or the store again.
        conn.subscribe(&service, Qos::AtMostOnce, false, &topic)
            .expect("repeat subscribe");
        let records = service
            .store
            .subscription
            .get(contract, &parsed(b"key/a.b", contract, false))
            .expect("get");
        assert_eq!(records.len(), 1);
        assert_eq!(conn.take_nodes(), vec!["b".to_owned()]);
    }

    #[test]
    fn id_transforms_are_inverse_under_wrapping() {
        let (conn, _channels) = Conn::new(Proto::Binary);
        for id in [1u16, 42, u16::MAX] {
            let mid = conn.inbound_mid(id);
            assert_eq!(conn.outbound_id(mid), id);
        }
        // The transforms stay inverse even when the subtraction wraps.
        let (conn, _channels) = Conn::new(Proto::Binary);
        let mid = conn.connid().wrapping_sub(u32::from(u16::MAX));
        assert_eq!(conn.outbound_id(mid), u16::MAX);
    }
}
