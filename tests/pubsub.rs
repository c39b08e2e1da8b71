//! End-to-end broker scenarios over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use unitd::config::Config;
use unitd::protocol::{codec, Connect, Packet, PacketType, Publish, Qos, ReturnCode, Subscribe,
    TopicQosTuple, Unsubscribe};
use unitd::Service;

const CLIENT_ID: &[u8] = b"UCBFDONCNJLaKMCAIeJBaOVfbAXUZHNPLDKKLDKLHZHKYIZLCDPQ";

/// Allocate an ephemeral loopback port.
fn ephemeral_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("ephemeral addr").to_string()
}

async fn start_broker(mut cfg: Config) -> (Arc<Service>, String) {
    let addr = ephemeral_addr();
    cfg.listen = addr.clone();
    let service = Service::new(cfg).expect("service");
    let runner = service.clone();
    tokio::spawn(async move {
        runner.listen().await.expect("listen");
    });
    for _ in 0..100 {
        if TcpStream::connect(&addr).await.is_ok() {
            return (service, addr);
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("broker did not come up on {addr}");
}

struct Client {
    stream: TcpStream,
}

impl Client {
    async fn dial(addr: &str) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.expect("dial"),
        }
    }

    /// Dial and run the CONNECT handshake.
    async fn connect(addr: &str, client_id: &[u8]) -> Self {
        let mut client = Self::dial(addr).await;
        client
            .send(&Packet::Connect(Connect {
                client_id: Bytes::copy_from_slice(client_id),
                username: None,
                password: None,
                clean_session: true,
                insecure: false,
                keep_alive: 30,
            }))
            .await;
        let connack = client.recv().await;
        assert_eq!(
            connack,
            Packet::Connack {
                return_code: ReturnCode::Accepted
            }
        );
        client
    }

    async fn send(&mut self, packet: &Packet) {
        self.stream
            .write_all(&codec::encode(packet))
            .await
            .expect("send");
    }

    async fn recv(&mut self) -> Packet {
        timeout(Duration::from_secs(5), codec::read_packet(&mut self.stream))
            .await
            .expect("recv timed out")
            .expect("recv")
    }

    /// Expect silence on the wire for a short window.
    async fn expect_nothing(&mut self) {
        let quiet = timeout(
            Duration::from_millis(300),
            codec::read_packet(&mut self.stream),
        )
        .await;
        assert!(quiet.is_err(), "unexpected packet: {:?}", quiet);
    }

    async fn subscribe(&mut self, message_id: u16, topic: &[u8], qos: Qos) {
        self.send(&Packet::Subscribe(Subscribe {
            message_id,
            subscriptions: vec![TopicQosTuple {
                qos,
                topic: Bytes::copy_from_slice(topic),
            }],
            forwarded: false,
        }))
        .await;
        let suback = self.recv().await;
        assert_eq!(suback.packet_type(), PacketType::Suback);
        assert_eq!(suback.message_id(), message_id);
    }
}

#[tokio::test]
async fn connect_then_ping() {
    let (_service, addr) = start_broker(Config::default()).await;
    let mut client = Client::connect(&addr, CLIENT_ID).await;

    client.send(&Packet::Pingreq).await;
    assert_eq!(client.recv().await, Packet::Pingresp);

    client.send(&Packet::Disconnect).await;
}

#[tokio::test]
async fn minted_client_id_is_announced() {
    let (_service, addr) = start_broker(Config::default()).await;
    let mut client = Client::connect(&addr, b"").await;

    // The broker assigns an id and publishes it on the reserved topic.
    let packet = client.recv().await;
    let Packet::Publish(publish) = packet else {
        panic!("expected client id announcement, got {packet:?}");
    };
    assert_eq!(&publish.topic[..], b"unitd/clientid/");
    assert!(publish.payload.len() >= 4);
}

#[tokio::test]
async fn subscribe_publish_roundtrip() {
    let (_service, addr) = start_broker(Config::default()).await;
    let mut client = Client::connect(&addr, CLIENT_ID).await;

    client.subscribe(1, b"AYAAMACRZDCHK/...", Qos::AtMostOnce).await;

    client
        .send(&Packet::Publish(Publish {
            message_id: 0,
            qos: Qos::AtMostOnce,
            topic: Bytes::from_static(b"AbYANcEEZDcdY/unit8.b.b1?ttl=3m"),
            payload: Bytes::from_static(b"Hi unit8.b.b1!"),
            forwarded: false,
        }))
        .await;

    let packet = client.recv().await;
    assert_eq!(
        packet,
        Packet::Publish(Publish {
            message_id: 0,
            qos: Qos::AtMostOnce,
            topic: Bytes::from_static(b"unit8.b.b1"),
            payload: Bytes::from_static(b"Hi unit8.b.b1!"),
            forwarded: false,
        })
    );
}

#[tokio::test]
async fn unsubscribe_stops_fanout() {
    let (service, addr) = start_broker(Config::default()).await;
    let mut subscriber = Client::connect(&addr, CLIENT_ID).await;
    // Same contract, different session.
    let mut publisher = Client::connect(&addr, b"UCBFPUBLISHERAAAAAAA").await;

    subscriber.subscribe(1, b"AYAAMACRZDCHK/unit8.b", Qos::AtMostOnce).await;
    assert_eq!(service.varz().subscriptions, 1);

    let publish = Packet::Publish(Publish {
        message_id: 0,
        qos: Qos::AtMostOnce,
        topic: Bytes::from_static(b"AbYANcEEZDcdY/unit8.b"),
        payload: Bytes::from_static(b"one"),
        forwarded: false,
    });
    publisher.send(&publish).await;
    assert_eq!(subscriber.recv().await.packet_type(), PacketType::Publish);

    subscriber
        .send(&Packet::Unsubscribe(Unsubscribe {
            message_id: 2,
            topics: vec![Bytes::from_static(b"AYAAMACRZDCHK/unit8.b")],
            forwarded: false,
        }))
        .await;
    let unsuback = subscriber.recv().await;
    assert_eq!(unsuback.packet_type(), PacketType::Unsuback);
    assert_eq!(service.varz().subscriptions, 0);

    publisher.send(&publish).await;
    subscriber.expect_nothing().await;
}

#[tokio::test]
async fn exactly_once_handshake_is_idempotent() {
    let (_service, addr) = start_broker(Config::default()).await;
    let mut client = Client::connect(&addr, CLIENT_ID).await;

    client.subscribe(1, b"AYAAMACRZDCHK/q.two", Qos::AtMostOnce).await;

    let publish = Packet::Publish(Publish {
        message_id: 42,
        qos: Qos::ExactlyOnce,
        topic: Bytes::from_static(b"AbYANcEEZDcdY/q.two"),
        payload: Bytes::from_static(b"exactly once"),
        forwarded: false,
    });
    client.send(&publish).await;

    // One PUBREC and exactly one delivery, in either order.
    let mut got_pubrec = false;
    let mut deliveries = 0;
    for _ in 0..2 {
        match client.recv().await {
            Packet::Pubrec { message_id } => {
                assert_eq!(message_id, 42);
                got_pubrec = true;
            }
            Packet::Publish(p) => {
                assert_eq!(&p.payload[..], b"exactly once");
                deliveries += 1;
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }
    assert!(got_pubrec);
    assert_eq!(deliveries, 1);

    // A duplicate PUBLISH while the handshake is in flight acknowledges
    // again but does not re-deliver.
    client.send(&publish).await;
    assert_eq!(client.recv().await, Packet::Pubrec { message_id: 42 });
    client.expect_nothing().await;

    client.send(&Packet::Pubrel { message_id: 42 }).await;
    assert_eq!(client.recv().await, Packet::Pubcomp { message_id: 42 });

    // Duplicate PUBREL is idempotent.
    client.send(&Packet::Pubrel { message_id: 42 }).await;
    assert_eq!(client.recv().await, Packet::Pubcomp { message_id: 42 });

    // Id 42 is free again: the next handshake with it completes the same way.
    client.send(&publish).await;
    for _ in 0..2 {
        let packet = client.recv().await;
        if let Packet::Pubrec { message_id } = packet {
            assert_eq!(message_id, 42);
        }
    }
}

#[tokio::test]
async fn at_least_once_publish_is_acked() {
    let (_service, addr) = start_broker(Config::default()).await;
    let mut client = Client::connect(&addr, CLIENT_ID).await;

    client
        .send(&Packet::Publish(Publish {
            message_id: 7,
            qos: Qos::AtLeastOnce,
            topic: Bytes::from_static(b"AbYANcEEZDcdY/q.one"),
            payload: Bytes::from_static(b"at least once"),
            forwarded: false,
        }))
        .await;
    assert_eq!(client.recv().await, Packet::Puback { message_id: 7 });
}

#[tokio::test]
async fn fanout_reaches_every_subscriber() {
    let (service, addr) = start_broker(Config::default()).await;
    let mut subscribers = Vec::new();
    for i in 0..3u8 {
        let id = [b"UCBFSUB".as_slice(), &[b'0' + i]].concat();
        let mut client = Client::connect(&addr, &id).await;
        client.subscribe(1, b"AYAAMACRZDCHK/fan.out", Qos::AtMostOnce).await;
        subscribers.push(client);
    }
    let mut publisher = Client::connect(&addr, b"UCBFPUBLISHERAAAAAAA").await;

    let out_before = service.varz().out_msgs;
    publisher
        .send(&Packet::Publish(Publish {
            message_id: 0,
            qos: Qos::AtMostOnce,
            topic: Bytes::from_static(b"AbYANcEEZDcdY/fan.out"),
            payload: Bytes::from_static(b"to all"),
            forwarded: false,
        }))
        .await;

    for subscriber in &mut subscribers {
        let packet = subscriber.recv().await;
        assert_eq!(packet.packet_type(), PacketType::Publish);
    }
    assert_eq!(service.varz().out_msgs - out_before, 3);
}

#[tokio::test]
async fn disconnect_drops_every_subscription() {
    let (service, addr) = start_broker(Config::default()).await;
    let connections_before = service.varz().connections;
    let subscriptions_before = service.varz().subscriptions;

    let mut client = Client::connect(&addr, CLIENT_ID).await;
    client.subscribe(1, b"AYAAMACRZDCHK/a.b", Qos::AtMostOnce).await;
    client.subscribe(2, b"AYAAMACRZDCHJ/c...", Qos::AtMostOnce).await;
    assert_eq!(service.varz().subscriptions, subscriptions_before + 2);

    client.send(&Packet::Disconnect).await;
    for _ in 0..100 {
        if service.varz().connections == connections_before {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(service.varz().connections, connections_before);
    assert_eq!(service.varz().subscriptions, subscriptions_before);

    // A fresh publisher in the same contract sees zero fan-out.
    let mut publisher = Client::connect(&addr, b"UCBFPUBLISHERAAAAAAA").await;
    let out_before = service.varz().out_msgs;
    publisher
        .send(&Packet::Publish(Publish {
            message_id: 0,
            qos: Qos::AtMostOnce,
            topic: Bytes::from_static(b"AbYANcEEZDcdY/a.b"),
            payload: Bytes::from_static(b"nobody home"),
            forwarded: false,
        }))
        .await;
    publisher.send(&Packet::Pingreq).await;
    assert_eq!(publisher.recv().await, Packet::Pingresp);
    assert_eq!(service.varz().out_msgs, out_before);
}

#[tokio::test]
async fn rejects_a_first_packet_that_is_not_connect() {
    let (_service, addr) = start_broker(Config::default()).await;
    let mut client = Client::dial(&addr).await;
    client.send(&Packet::Pingreq).await;
    let packet = client.recv().await;
    let Packet::Connack { return_code } = packet else {
        panic!("expected CONNACK, got {packet:?}");
    };
    assert_ne!(return_code, ReturnCode::Accepted);
}

#[tokio::test]
async fn varz_is_served_on_the_client_listener() {
    let (_service, addr) = start_broker(Config::default()).await;
    let mut stream = TcpStream::connect(&addr).await.expect("dial");
    stream
        .write_all(b"GET /varz HTTP/1.1\r\nHost: unitd\r\n\r\n")
        .await
        .expect("request");
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.expect("response");
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.contains("\"connections\""), "{response}");
}

#[tokio::test]
async fn websocket_upgrade_carries_the_packet_alphabet() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let (_service, addr) = start_broker(Config::default()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
        .await
        .expect("upgrade");

    let connect = codec::encode(&Packet::Connect(Connect {
        client_id: Bytes::copy_from_slice(CLIENT_ID),
        username: None,
        password: None,
        clean_session: true,
        insecure: false,
        keep_alive: 30,
    }));
    ws.send(WsMessage::Binary(connect.to_vec())).await.expect("send");

    let reply = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("connack timed out")
        .expect("stream ended")
        .expect("connack");
    let WsMessage::Binary(frame) = reply else {
        panic!("expected binary frame, got {reply:?}");
    };
    assert_eq!(
        codec::decode(&frame).expect("decode"),
        Packet::Connack {
            return_code: ReturnCode::Accepted
        }
    );
}

#[tokio::test]
async fn stream_listener_speaks_the_proto_framing() {
    use unitd::protocol::grpc;

    let grpc_addr = ephemeral_addr();
    let cfg = Config {
        grpc_listen: Some(grpc_addr.clone()),
        ..Config::default()
    };
    let (_service, _addr) = start_broker(cfg).await;

    let mut stream = TcpStream::connect(&grpc_addr).await.expect("dial");
    stream
        .write_all(&grpc::encode(&Packet::Connect(Connect {
            client_id: Bytes::copy_from_slice(CLIENT_ID),
            username: None,
            password: None,
            clean_session: true,
            insecure: false,
            keep_alive: 30,
        })))
        .await
        .expect("send");
    let reply = timeout(Duration::from_secs(5), grpc::read_packet(&mut stream))
        .await
        .expect("connack timed out")
        .expect("connack");
    assert_eq!(
        reply,
        Packet::Connack {
            return_code: ReturnCode::Accepted
        }
    );

    stream
        .write_all(&grpc::encode(&Packet::Pingreq))
        .await
        .expect("ping");
    let pong = timeout(Duration::from_secs(5), grpc::read_packet(&mut stream))
        .await
        .expect("pong timed out")
        .expect("pong");
    assert_eq!(pong, Packet::Pingresp);
}
