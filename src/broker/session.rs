//! The per-session state machine.
//!
//! Each accepted connection runs three cooperative tasks: the reader decodes
//! packets off the socket, the dispatcher executes the CONNECT handshake and
//! the per-packet switch, and the writer drains the outbound queues back
//! onto the socket. The close token is the single cancellation signal; the
//! supervisor joins all three tasks before teardown, so a panicking task is
//! downgraded to a close.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::conn::{Conn, ConnChannels};
use super::{ErrorReply, Service};
use crate::message::topic::{self, Topic};
use crate::protocol::frame::{PacketReader, PacketWriter};
use crate::protocol::{Packet, Publish, Qos, ReturnCode, Suback, Subscribe, Unsubscribe};
use crate::security::{Access, ClientId, MIN_CLIENT_ID_LEN};

const RECV_QUEUE_DEPTH: usize = 64;

enum Flow {
    Continue,
    Stop,
}

/// Drive a session to completion and tear the connection down.
pub(crate) async fn run(
    service: Arc<Service>,
    conn: Arc<Conn>,
    reader: PacketReader,
    writer: PacketWriter,
    channels: ConnChannels,
) {
    let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE_DEPTH);
    let tasks = [
        tokio::spawn(read_loop(conn.clone(), reader, recv_tx)),
        tokio::spawn(dispatch_loop(conn.clone(), service.clone(), recv_rx)),
        tokio::spawn(write_loop(conn.clone(), service.clone(), writer, channels)),
    ];
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(
                context = "session",
                connid = conn.connid(),
                "session task failed: {e}"
            );
        }
    }
    conn.close(&service).await;
}

/// Blocks on the transport and feeds decoded packets to the dispatcher.
async fn read_loop(conn: Arc<Conn>, mut reader: PacketReader, recv_tx: mpsc::Sender<Packet>) {
    loop {
        tokio::select! {
            _ = conn.closing.cancelled() => break,
            packet = reader.read_packet() => match packet {
                Ok(packet) => {
                    if recv_tx.send(packet).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        context = "session.read",
                        connid = conn.connid(),
                        "read ended: {e}"
                    );
                    break;
                }
            },
        }
    }
    conn.closing.cancel();
}

/// Drains the outbound packet and publish queues onto the transport.
async fn write_loop(
    conn: Arc<Conn>,
    service: Arc<Service>,
    mut writer: PacketWriter,
    mut channels: ConnChannels,
) {
    loop {
        // Control packets drain ahead of fan-out deliveries, so a CONNACK
        // or ack is never overtaken by a publish queued after it.
        let packet = tokio::select! {
            biased;
            _ = conn.closing.cancelled() => break,
            packet = channels.send_rx.recv() => packet,
            message = channels.pub_rx.recv() => message.map(|m| {
                Packet::Publish(Publish {
                    message_id: m.message_id,
                    qos: Qos::try_from(m.qos).unwrap_or_default(),
                    topic: m.topic,
                    payload: m.payload,
                    forwarded: false,
                })
            }),
        };
        let Some(packet) = packet else { break };
        if write_one(&conn, &service, &mut writer, packet).await.is_err() {
            break;
        }
    }
    // Flush control packets already queued so a final CONNACK or ack still
    // reaches the peer.
    while let Ok(packet) = channels.send_rx.try_recv() {
        if write_one(&conn, &service, &mut writer, packet).await.is_err() {
            break;
        }
    }
    writer.shutdown().await;
    conn.closing.cancel();
}

async fn write_one(
    conn: &Conn,
    service: &Service,
    writer: &mut PacketWriter,
    packet: Packet,
) -> Result<(), ()> {
    match packet {
        Packet::Publish(ref p) if p.qos != Qos::AtMostOnce => {
            conn.store_outbound(service, &packet);
        }
        Packet::Pubrel { .. } | Packet::Puback { .. } | Packet::Pubcomp { .. } => {
            conn.store_outbound(service, &packet);
        }
        _ => {}
    }
    writer.write_packet(&packet).await.map_err(|e| {
        tracing::debug!(
            context = "session.write",
            connid = conn.connid(),
            "write failed: {e}"
        );
    })
}

/// Executes the CONNECT handshake, then the per-packet switch.
async fn dispatch_loop(conn: Arc<Conn>, service: Arc<Service>, mut recv_rx: mpsc::Receiver<Packet>) {
    let first = tokio::select! {
        _ = conn.closing.cancelled() => None,
        packet = recv_rx.recv() => packet,
    };
    match first {
        Some(Packet::Connect(connect)) => {
            if !handshake(&conn, &service, connect).await {
                conn.closing.cancel();
                return;
            }
        }
        Some(_) => {
            // Any other first packet is rejected with a failed CONNACK.
            conn.queue_packet(Packet::Connack {
                return_code: ReturnCode::RefusedServerUnavailable,
            })
            .await;
            conn.closing.cancel();
            return;
        }
        None => {
            conn.closing.cancel();
            return;
        }
    }

    loop {
        let packet = tokio::select! {
            _ = conn.closing.cancelled() => None,
            packet = recv_rx.recv() => packet,
        };
        let Some(packet) = packet else { break };
        match dispatch(&conn, &service, packet).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => break,
            Err(e) => {
                tracing::warn!(
                    context = "session.dispatch",
                    connid = conn.connid(),
                    "closing session: {e}"
                );
                break;
            }
        }
    }
    conn.closing.cancel();
}

async fn handshake(conn: &Arc<Conn>, service: &Arc<Service>, connect: crate::protocol::Connect) -> bool {
    if !service.auth.validate_connect(&connect) {
        conn.queue_packet(Packet::Connack {
            return_code: ReturnCode::RefusedNotAuthorized,
        })
        .await;
        return false;
    }

    conn.set_insecure(connect.insecure);
    conn.set_username(connect.username.clone());

    let minted = connect.client_id.len() < MIN_CLIENT_ID_LEN;
    let client_id = if minted {
        ClientId::mint()
    } else {
        ClientId::new(connect.client_id.clone())
    };
    conn.set_client_id(client_id.clone());

    if !conn
        .queue_packet(Packet::Connack {
            return_code: ReturnCode::Accepted,
        })
        .await
    {
        return false;
    }
    if minted {
        conn.send_client_id(&client_id).await;
    }
    tracing::info!(
        context = "session.connect",
        connid = conn.connid(),
        client_id = %client_id,
        "session connected"
    );
    true
}

async fn dispatch(conn: &Arc<Conn>, service: &Arc<Service>, packet: Packet) -> Result<Flow, super::BrokerError> {
    match packet {
        Packet::Connect(_) => return Err(super::BrokerError::ProtocolViolation),
        Packet::Publish(publish) => handle_publish(conn, service, publish).await,
        Packet::Puback { message_id } => {
            conn.release_message_id(message_id);
            conn.store_inbound(service, &Packet::Puback { message_id });
        }
        Packet::Pubcomp { message_id } => {
            conn.release_message_id(message_id);
            conn.store_inbound(service, &Packet::Pubcomp { message_id });
        }
        Packet::Pubrec { message_id } => {
            conn.queue_packet(Packet::Pubrel { message_id }).await;
        }
        Packet::Pubrel { message_id } => {
            conn.end_exactly_once(message_id);
            conn.store_inbound(service, &Packet::Pubrel { message_id });
            conn.queue_packet(Packet::Pubcomp { message_id }).await;
        }
        Packet::Subscribe(subscribe) => handle_subscribe(conn, service, subscribe).await,
        Packet::Unsubscribe(unsubscribe) => handle_unsubscribe(conn, service, unsubscribe).await,
        Packet::Pingreq => {
            conn.queue_packet(Packet::Pingresp).await;
        }
        Packet::Disconnect => return Ok(Flow::Stop),
        // Server-to-client packets arriving from the peer.
        _ => return Err(super::BrokerError::ProtocolViolation),
    }
    Ok(Flow::Continue)
}

/// Parse and authorize a topic for the given access, surfacing failures on
/// the error topic. Returns `None` when the request must be dropped.
async fn checked_topic(
    conn: &Arc<Conn>,
    service: &Arc<Service>,
    raw: &[u8],
    wildcard: bool,
    access: Access,
    message_id: u16,
) -> Option<Topic> {
    let mut parsed = topic::parse_key(raw);
    if parsed.topic.is_empty() {
        conn.notify_error(ErrorReply::topic_invalid(), message_id).await;
        return None;
    }
    parsed.parse(conn.contract(), wildcard);
    if !parsed.is_valid() {
        conn.notify_error(ErrorReply::topic_invalid(), message_id).await;
        return None;
    }
    if !conn.insecure() && !service.auth.authorize(&parsed.key, &parsed, access) {
        conn.notify_error(ErrorReply::unauthorized(), message_id).await;
        return None;
    }
    Some(parsed)
}

async fn handle_publish(conn: &Arc<Conn>, service: &Arc<Service>, publish: Publish) {
    let Some(parsed) = checked_topic(
        conn,
        service,
        &publish.topic,
        false,
        Access::Write,
        publish.message_id,
    )
    .await
    else {
        return;
    };

    let deliver = match publish.qos {
        Qos::AtMostOnce => true,
        Qos::AtLeastOnce => {
            conn.store_inbound(service, &Packet::Publish(publish.clone()));
            true
        }
        // A repeated PUBLISH with an in-flight id acknowledges again but
        // must not re-deliver downstream.
        Qos::ExactlyOnce => {
            let fresh = conn.begin_exactly_once(publish.message_id);
            conn.store_inbound(service, &Packet::Publish(publish.clone()));
            fresh
        }
    };

    if deliver {
        let result = conn
            .publish(
                service,
                publish.forwarded,
                &parsed,
                &publish.payload,
                publish.message_id,
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(
                context = "session.publish",
                connid = conn.connid(),
                "publish failed: {e}"
            );
            conn.notify_error(ErrorReply::server_error(), publish.message_id)
                .await;
        }
    }

    match publish.qos {
        Qos::AtMostOnce => {}
        Qos::AtLeastOnce => {
            conn.queue_packet(Packet::Puback {
                message_id: publish.message_id,
            })
            .await;
        }
        Qos::ExactlyOnce => {
            conn.queue_packet(Packet::Pubrec {
                message_id: publish.message_id,
            })
            .await;
        }
    }
}

async fn handle_subscribe(conn: &Arc<Conn>, service: &Arc<Service>, subscribe: Subscribe) {
    let mut granted = Vec::with_capacity(subscribe.subscriptions.len());
    for tuple in &subscribe.subscriptions {
        let Some(parsed) = checked_topic(
            conn,
            service,
            &tuple.topic,
            true,
            Access::Read,
            subscribe.message_id,
        )
        .await
        else {
            granted.push(0x80);
            continue;
        };
        match conn.subscribe(service, tuple.qos, subscribe.forwarded, &parsed) {
            Ok(()) => granted.push(tuple.qos as u8),
            Err(e) => {
                tracing::warn!(
                    context = "session.subscribe",
                    connid = conn.connid(),
                    "subscribe failed: {e}"
                );
                conn.notify_error(ErrorReply::server_error(), subscribe.message_id)
                    .await;
                granted.push(0x80);
            }
        }
    }
    conn.queue_packet(Packet::Suback(Suback {
        message_id: subscribe.message_id,
        qos: granted,
    }))
    .await;
}

async fn handle_unsubscribe(conn: &Arc<Conn>, service: &Arc<Service>, unsubscribe: Unsubscribe) {
    for raw in &unsubscribe.topics {
        let Some(parsed) = checked_topic(
            conn,
            service,
            raw,
            true,
            Access::Read,
            unsubscribe.message_id,
        )
        .await
        else {
            continue;
        };
        if let Err(e) = conn.unsubscribe(service, unsubscribe.forwarded, &parsed) {
            tracing::warn!(
                context = "session.unsubscribe",
                connid = conn.connid(),
                "unsubscribe failed: {e}"
            );
            conn.notify_error(ErrorReply::server_error(), unsubscribe.message_id)
                .await;
        }
    }
    conn.queue_packet(Packet::Unsuback {
        message_id: unsubscribe.message_id,
    })
    .await;
}
