//! Protobuf rendition of the packet alphabet.
//!
//! Each frame is a one-byte header length, a serialized [`FixedHeader`]
//! carrying the message type and remaining length, then the per-type message
//! body. The stream listener speaks this framing; the surrounding HTTP/2
//! envelope is a transport concern outside the broker core.

use bytes::Bytes;
use prost::Message as ProstMessage;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{
    Connect, Packet, ProtocolError, Publish, Qos, ReturnCode, Subscribe, Suback, TopicQosTuple,
    Unsubscribe, MAX_MESSAGE_SIZE,
};

pub const MESSAGE_TYPE_CONNECT: i32 = 1;
pub const MESSAGE_TYPE_CONNACK: i32 = 2;
pub const MESSAGE_TYPE_PUBLISH: i32 = 3;
pub const MESSAGE_TYPE_PUBACK: i32 = 4;
pub const MESSAGE_TYPE_PUBREC: i32 = 5;
pub const MESSAGE_TYPE_PUBREL: i32 = 6;
pub const MESSAGE_TYPE_PUBCOMP: i32 = 7;
pub const MESSAGE_TYPE_SUBSCRIBE: i32 = 8;
pub const MESSAGE_TYPE_SUBACK: i32 = 9;
pub const MESSAGE_TYPE_UNSUBSCRIBE: i32 = 10;
pub const MESSAGE_TYPE_UNSUBACK: i32 = 11;
pub const MESSAGE_TYPE_PINGREQ: i32 = 12;
pub const MESSAGE_TYPE_PINGRESP: i32 = 13;
pub const MESSAGE_TYPE_DISCONNECT: i32 = 14;

#[derive(Clone, PartialEq, prost::Message)]
pub struct FixedHeader {
    #[prost(int32, tag = "1")]
    pub message_type: i32,
    #[prost(uint32, tag = "2")]
    pub remaining_length: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PbConnect {
    #[prost(bytes = "vec", tag = "1")]
    pub client_id: Vec<u8>,
    #[prost(string, tag = "2")]
    pub username: String,
    #[prost(bytes = "vec", tag = "3")]
    pub password: Vec<u8>,
    #[prost(bool, tag = "4")]
    pub clean_session: bool,
    #[prost(bool, tag = "5")]
    pub insecure: bool,
    #[prost(uint32, tag = "6")]
    pub keep_alive: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PbConnack {
    #[prost(uint32, tag = "1")]
    pub return_code: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PbPublish {
    #[prost(uint32, tag = "1")]
    pub message_id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub topic: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
    #[prost(uint32, tag = "4")]
    pub qos: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PbAck {
    #[prost(uint32, tag = "1")]
    pub message_id: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PbTopicQos {
    #[prost(uint32, tag = "1")]
    pub qos: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub topic: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PbSubscribe {
    #[prost(uint32, tag = "1")]
    pub message_id: u32,
    #[prost(message, repeated, tag = "2")]
    pub subscriptions: Vec<PbTopicQos>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PbSuback {
    #[prost(uint32, tag = "1")]
    pub message_id: u32,
    #[prost(uint32, repeated, tag = "2")]
    pub qos: Vec<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PbUnsubscribe {
    #[prost(uint32, tag = "1")]
    pub message_id: u32,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub topics: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PbEmpty {}

/// Encode a packet as a header-prefixed protobuf frame.
pub fn encode(packet: &Packet) -> Bytes {
    let (message_type, body) = match packet {
        Packet::Connect(c) => (
            MESSAGE_TYPE_CONNECT,
            PbConnect {
                client_id: c.client_id.to_vec(),
                username: c.username.clone().unwrap_or_default(),
                password: c.password.as_ref().map(|p| p.to_vec()).unwrap_or_default(),
                clean_session: c.clean_session,
                insecure: c.insecure,
                keep_alive: u32::from(c.keep_alive),
            }
            .encode_to_vec(),
        ),
        Packet::Connack { return_code } => (
            MESSAGE_TYPE_CONNACK,
            PbConnack {
                return_code: *return_code as u32,
            }
            .encode_to_vec(),
        ),
        Packet::Publish(p) => (
            MESSAGE_TYPE_PUBLISH,
            PbPublish {
                message_id: u32::from(p.message_id),
                topic: p.topic.to_vec(),
                payload: p.payload.to_vec(),
                qos: p.qos as u32,
            }
            .encode_to_vec(),
        ),
        Packet::Puback { message_id } => (
            MESSAGE_TYPE_PUBACK,
            PbAck {
                message_id: u32::from(*message_id),
            }
            .encode_to_vec(),
        ),
        Packet::Pubrec { message_id } => (
            MESSAGE_TYPE_PUBREC,
            PbAck {
                message_id: u32::from(*message_id),
            }
            .encode_to_vec(),
        ),
        Packet::Pubrel { message_id } => (
            MESSAGE_TYPE_PUBREL,
            PbAck {
                message_id: u32::from(*message_id),
            }
            .encode_to_vec(),
        ),
        Packet::Pubcomp { message_id } => (
            MESSAGE_TYPE_PUBCOMP,
            PbAck {
                message_id: u32::from(*message_id),
            }
            .encode_to_vec(),
        ),
        Packet::Subscribe(s) => (
            MESSAGE_TYPE_SUBSCRIBE,
            PbSubscribe {
                message_id: u32::from(s.message_id),
                subscriptions: s
                    .subscriptions
                    .iter()
                    .map(|t| PbTopicQos {
                        qos: t.qos as u32,
                        topic: t.topic.to_vec(),
                    })
                    .collect(),
            }
            .encode_to_vec(),
        ),
        Packet::Suback(s) => (
            MESSAGE_TYPE_SUBACK,
            PbSuback {
                message_id: u32::from(s.message_id),
                qos: s.qos.iter().map(|q| u32::from(*q)).collect(),
            }
            .encode_to_vec(),
        ),
        Packet::Unsubscribe(u) => (
            MESSAGE_TYPE_UNSUBSCRIBE,
            PbUnsubscribe {
                message_id: u32::from(u.message_id),
                topics: u.topics.iter().map(|t| t.to_vec()).collect(),
            }
            .encode_to_vec(),
        ),
        Packet::Unsuback { message_id } => (
            MESSAGE_TYPE_UNSUBACK,
            PbAck {
                message_id: u32::from(*message_id),
            }
            .encode_to_vec(),
        ),
        Packet::Pingreq => (MESSAGE_TYPE_PINGREQ, PbEmpty {}.encode_to_vec()),
        Packet::Pingresp => (MESSAGE_TYPE_PINGRESP, PbEmpty {}.encode_to_vec()),
        Packet::Disconnect => (MESSAGE_TYPE_DISCONNECT, PbEmpty {}.encode_to_vec()),
    };

    let header = FixedHeader {
        message_type,
        remaining_length: body.len() as u32,
    }
    .encode_to_vec();
    let mut frame = Vec::with_capacity(1 + header.len() + body.len());
    frame.push(header.len() as u8);
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&body);
    Bytes::from(frame)
}

/// Read one protobuf-framed packet from a byte stream.
pub async fn read_packet<R>(stream: &mut R) -> Result<Packet, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    let mut header = vec![0u8; len[0] as usize];
    stream.read_exact(&mut header).await?;
    let header = FixedHeader::decode(&header[..])?;
    let remaining = header.remaining_length as usize;
    if remaining > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(remaining));
    }
    let mut body = vec![0u8; remaining];
    stream.read_exact(&mut body).await?;
    unpack(header.message_type, &body)
}

/// Decode the per-type body of a frame.
pub fn unpack(message_type: i32, body: &[u8]) -> Result<Packet, ProtocolError> {
    let packet = match message_type {
        MESSAGE_TYPE_CONNECT => {
            let pb = PbConnect::decode(body)?;
            Packet::Connect(Connect {
                client_id: Bytes::from(pb.client_id),
                username: if pb.username.is_empty() {
                    None
                } else {
                    Some(pb.username)
                },
                password: if pb.password.is_empty() {
                    None
                } else {
                    Some(Bytes::from(pb.password))
                },
                clean_session: pb.clean_session,
                insecure: pb.insecure,
                keep_alive: pb.keep_alive as u16,
            })
        }
        MESSAGE_TYPE_CONNACK => {
            let pb = PbConnack::decode(body)?;
            Packet::Connack {
                return_code: ReturnCode::try_from(pb.return_code as u8)?,
            }
        }
        MESSAGE_TYPE_PUBLISH => {
            let pb = PbPublish::decode(body)?;
            Packet::Publish(Publish {
                message_id: pb.message_id as u16,
                qos: Qos::try_from(pb.qos as u8)?,
                topic: Bytes::from(pb.topic),
                payload: Bytes::from(pb.payload),
                forwarded: false,
            })
        }
        MESSAGE_TYPE_PUBACK => Packet::Puback {
            message_id: PbAck::decode(body)?.message_id as u16,
        },
        MESSAGE_TYPE_PUBREC => Packet::Pubrec {
            message_id: PbAck::decode(body)?.message_id as u16,
        },
        MESSAGE_TYPE_PUBREL => Packet::Pubrel {
            message_id: PbAck::decode(body)?.message_id as u16,
        },
        MESSAGE_TYPE_PUBCOMP => Packet::Pubcomp {
            message_id: PbAck::decode(body)?.message_id as u16,
        },
        MESSAGE_TYPE_SUBSCRIBE => {
            let pb = PbSubscribe::decode(body)?;
            let mut subscriptions = Vec::with_capacity(pb.subscriptions.len());
            for t in pb.subscriptions {
                subscriptions.push(TopicQosTuple {
                    qos: Qos::try_from(t.qos as u8)?,
                    topic: Bytes::from(t.topic),
                });
            }
            Packet::Subscribe(Subscribe {
                message_id: pb.message_id as u16,
                subscriptions,
                forwarded: false,
            })
        }
        MESSAGE_TYPE_SUBACK => {
            let pb = PbSuback::decode(body)?;
            Packet::Suback(Suback {
                message_id: pb.message_id as u16,
                qos: pb.qos.into_iter().map(|q| q as u8).collect(),
            })
        }
        MESSAGE_TYPE_UNSUBSCRIBE => {
            let pb = PbUnsubscribe::decode(body)?;
            Packet::Unsubscribe(Unsubscribe {
                message_id: pb.message_id as u16,
                topics: pb.topics.into_iter().map(Bytes::from).collect(),
                forwarded: false,
            })
        }
        MESSAGE_TYPE_UNSUBACK => Packet::Unsuback {
            message_id: PbAck::decode(body)?.message_id as u16,
        },
        MESSAGE_TYPE_PINGREQ => Packet::Pingreq,
        MESSAGE_TYPE_PINGRESP => Packet::Pingresp,
        MESSAGE_TYPE_DISCONNECT => Packet::Disconnect,
        other => return Err(ProtocolError::UnknownMessageType(other as u8)),
    };
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_over_stream() {
        let packets = vec![
            Packet::Connect(Connect {
                client_id: Bytes::from_static(b"AAAAclient"),
                username: None,
                password: None,
                clean_session: true,
                insecure: false,
                keep_alive: 10,
            }),
            Packet::Publish(Publish {
                message_id: 42,
                qos: Qos::ExactlyOnce,
                topic: Bytes::from_static(b"k/a.b.c"),
                payload: Bytes::from_static(b"hello"),
                forwarded: false,
            }),
            Packet::Suback(Suback {
                message_id: 5,
                qos: vec![0, 2],
            }),
            Packet::Pingreq,
        ];
        for packet in packets {
            let frame = encode(&packet);
            let mut stream = std::io::Cursor::new(frame.to_vec());
            let decoded = read_packet(&mut stream).await.expect("read");
            assert_eq!(decoded, packet);
        }
    }
}
