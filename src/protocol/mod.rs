//! Control packet alphabet shared by every framing.
//!
//! Ten packet kinds travel over the wire: CONNECT/CONNACK, PUBLISH and its
//! QoS acknowledgement family, SUBSCRIBE/SUBACK, UNSUBSCRIBE/UNSUBACK,
//! PINGREQ/PINGRESP and DISCONNECT. The binary layout lives in [`codec`];
//! [`frame`] adapts the alphabet onto the accepted transport and [`grpc`]
//! carries it as length-delimited protobuf bodies.

pub mod codec;
pub mod frame;
pub mod grpc;

use bytes::Bytes;
use thiserror::Error;

/// Maximum on-wire size of a single packet body.
pub const MAX_MESSAGE_SIZE: usize = 65_536;

/// Protocol name carried in the CONNECT variable header.
pub const PROTOCOL_NAME: &[u8] = b"MQIsdp";

/// Protocol level carried in the CONNECT variable header.
pub const PROTOCOL_VERSION: u8 = 3;

/// Errors produced while reading or decoding a packet.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("short read: needed {needed} bytes, have {have}")]
    ShortRead { needed: usize, have: usize },
    #[error("malformed header")]
    MalformedHeader,
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("invalid qos {0}")]
    InvalidQos(u8),
    #[error("message of {0} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit")]
    MessageTooLarge(usize),
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protobuf: {0}")]
    Proto(#[from] prost::DecodeError),
    #[error("connection closed")]
    Closed,
}

/// Packet type nibble of the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Quality-of-service level for a publish handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Qos {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for Qos {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(ProtocolError::InvalidQos(other)),
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    Accepted = 0,
    RefusedBadProtocolVersion = 1,
    RefusedIdRejected = 2,
    RefusedServerUnavailable = 3,
    RefusedBadUsernameOrPassword = 4,
    RefusedNotAuthorized = 5,
}

impl TryFrom<u8> for ReturnCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ReturnCode::Accepted),
            1 => Ok(ReturnCode::RefusedBadProtocolVersion),
            2 => Ok(ReturnCode::RefusedIdRejected),
            3 => Ok(ReturnCode::RefusedServerUnavailable),
            4 => Ok(ReturnCode::RefusedBadUsernameOrPassword),
            5 => Ok(ReturnCode::RefusedNotAuthorized),
            _ => Err(ProtocolError::MalformedHeader),
        }
    }
}

/// CONNECT packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: Bytes,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub clean_session: bool,
    /// Skips key validation and topic permission checks for the session.
    pub insecure: bool,
    pub keep_alive: u16,
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub message_id: u16,
    pub qos: Qos,
    pub topic: Bytes,
    pub payload: Bytes,
    /// Set by the cluster plane when replaying a peer's request; never on
    /// the client wire.
    pub forwarded: bool,
}

/// One `(qos, topic)` tuple of a SUBSCRIBE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicQosTuple {
    pub qos: Qos,
    pub topic: Bytes,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub message_id: u16,
    pub subscriptions: Vec<TopicQosTuple>,
    /// See [`Publish::forwarded`].
    pub forwarded: bool,
}

/// SUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub message_id: u16,
    pub qos: Vec<u8>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub message_id: u16,
    pub topics: Vec<Bytes>,
    /// See [`Publish::forwarded`].
    pub forwarded: bool,
}

/// A decoded control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack { return_code: ReturnCode },
    Publish(Publish),
    Puback { message_id: u16 },
    Pubrec { message_id: u16 },
    Pubrel { message_id: u16 },
    Pubcomp { message_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { message_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Packet {
    /// The type nibble this packet encodes with.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack { .. } => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Puback { .. } => PacketType::Puback,
            Packet::Pubrec { .. } => PacketType::Pubrec,
            Packet::Pubrel { .. } => PacketType::Pubrel,
            Packet::Pubcomp { .. } => PacketType::Pubcomp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::Unsuback { .. } => PacketType::Unsuback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// The message id carried by the packet, zero when it carries none.
    pub fn message_id(&self) -> u16 {
        match self {
            Packet::Publish(p) => p.message_id,
            Packet::Puback { message_id }
            | Packet::Pubrec { message_id }
            | Packet::Pubrel { message_id }
            | Packet::Pubcomp { message_id }
            | Packet::Unsuback { message_id } => *message_id,
            Packet::Subscribe(s) => s.message_id,
            Packet::Suback(s) => s.message_id,
            Packet::Unsubscribe(u) => u.message_id,
            _ => 0,
        }
    }

    /// QoS of the packet, `AtMostOnce` when it carries none.
    pub fn qos(&self) -> Qos {
        match self {
            Packet::Publish(p) => p.qos,
            _ => Qos::AtMostOnce,
        }
    }
}
