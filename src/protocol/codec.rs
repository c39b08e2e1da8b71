//! Binary line-protocol framing.
//!
//! A frame is a fixed header byte `(type:4 | flags:4)`, a 7-bit varint
//! remaining length and the body. PUBLISH carries its QoS in the flag bits;
//! SUBSCRIBE, UNSUBSCRIBE and PUBREL carry the reserved flag `0x02`.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{
    Connect, Packet, PacketType, ProtocolError, Publish, Qos, ReturnCode, Subscribe, Suback,
    TopicQosTuple, Unsubscribe, MAX_MESSAGE_SIZE, PROTOCOL_NAME, PROTOCOL_VERSION,
};

const CONNECT_FLAG_USERNAME: u8 = 0x80;
const CONNECT_FLAG_PASSWORD: u8 = 0x40;
const CONNECT_FLAG_CLEAN_SESSION: u8 = 0x02;
const CONNECT_FLAG_INSECURE: u8 = 0x01;

/// Encode a packet into a complete wire frame.
pub fn encode(packet: &Packet) -> Bytes {
    let body = encode_body(packet);
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    buf.put_u8(fixed_header(packet));
    put_remaining_length(&mut buf, body.len());
    buf.extend_from_slice(&body);
    buf.freeze()
}

fn fixed_header(packet: &Packet) -> u8 {
    let type_nibble = (packet.packet_type() as u8) << 4;
    match packet {
        Packet::Publish(p) => type_nibble | ((p.qos as u8) << 1),
        Packet::Subscribe(_) | Packet::Unsubscribe(_) | Packet::Pubrel { .. } => {
            type_nibble | 0x02
        }
        _ => type_nibble,
    }
}

fn encode_body(packet: &Packet) -> BytesMut {
    let mut body = BytesMut::new();
    match packet {
        Packet::Connect(c) => {
            put_blob(&mut body, PROTOCOL_NAME);
            body.put_u8(PROTOCOL_VERSION);
            let mut flags = 0u8;
            if c.username.is_some() {
                flags |= CONNECT_FLAG_USERNAME;
            }
            if c.password.is_some() {
                flags |= CONNECT_FLAG_PASSWORD;
            }
            if c.clean_session {
                flags |= CONNECT_FLAG_CLEAN_SESSION;
            }
            if c.insecure {
                flags |= CONNECT_FLAG_INSECURE;
            }
            body.put_u8(flags);
            body.put_u16(c.keep_alive);
            put_blob(&mut body, &c.client_id);
            if let Some(ref username) = c.username {
                put_blob(&mut body, username.as_bytes());
            }
            if let Some(ref password) = c.password {
                put_blob(&mut body, password);
            }
        }
        Packet::Connack { return_code } => {
            body.put_u8(0);
            body.put_u8(*return_code as u8);
        }
        Packet::Publish(p) => {
            put_blob(&mut body, &p.topic);
            if p.qos != Qos::AtMostOnce {
                body.put_u16(p.message_id);
            }
            body.extend_from_slice(&p.payload);
        }
        Packet::Puback { message_id }
        | Packet::Pubrec { message_id }
        | Packet::Pubrel { message_id }
        | Packet::Pubcomp { message_id }
        | Packet::Unsuback { message_id } => {
            body.put_u16(*message_id);
        }
        Packet::Subscribe(s) => {
            body.put_u16(s.message_id);
            for sub in &s.subscriptions {
                put_blob(&mut body, &sub.topic);
                body.put_u8(sub.qos as u8);
            }
        }
        Packet::Suback(s) => {
            body.put_u16(s.message_id);
            body.extend_from_slice(&s.qos);
        }
        Packet::Unsubscribe(u) => {
            body.put_u16(u.message_id);
            for topic in &u.topics {
                put_blob(&mut body, topic);
            }
        }
        Packet::Pingreq | Packet::Pingresp | Packet::Disconnect => {}
    }
    body
}

fn put_blob(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u16(data.len() as u16);
    buf.extend_from_slice(data);
}

fn put_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

/// Read one packet from a byte stream. Blocks until a complete frame arrives.
pub async fn read_packet<R>(stream: &mut R) -> Result<Packet, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 1];
    stream.read_exact(&mut header).await?;
    let remaining = read_remaining_length(stream).await?;
    if remaining > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(remaining));
    }
    let mut body = vec![0u8; remaining];
    stream.read_exact(&mut body).await?;
    decode_body(header[0], &body)
}

async fn read_remaining_length<R>(stream: &mut R) -> Result<usize, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut multiplier = 1usize;
    let mut value = 0usize;
    for _ in 0..4 {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        value += ((byte[0] & 0x7F) as usize) * multiplier;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        multiplier *= 128;
    }
    Err(ProtocolError::MalformedHeader)
}

/// Decode a complete frame held in memory (WebSocket messages arrive whole).
pub fn decode(frame: &[u8]) -> Result<Packet, ProtocolError> {
    if frame.is_empty() {
        return Err(ProtocolError::ShortRead { needed: 2, have: 0 });
    }
    let mut pos = 1usize;
    let mut multiplier = 1usize;
    let mut remaining = 0usize;
    loop {
        let byte = *frame.get(pos).ok_or(ProtocolError::MalformedHeader)?;
        pos += 1;
        remaining += ((byte & 0x7F) as usize) * multiplier;
        if byte & 0x80 == 0 {
            break;
        }
        if pos > 4 {
            return Err(ProtocolError::MalformedHeader);
        }
        multiplier *= 128;
    }
    if remaining > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(remaining));
    }
    let body = frame
        .get(pos..pos + remaining)
        .ok_or(ProtocolError::ShortRead {
            needed: remaining,
            have: frame.len() - pos,
        })?;
    decode_body(frame[0], body)
}

fn decode_body(header: u8, body: &[u8]) -> Result<Packet, ProtocolError> {
    let packet_type = PacketType::try_from(header >> 4)?;
    let flags = header & 0x0F;
    let mut r = Reader::new(body);
    let packet = match packet_type {
        PacketType::Connect => {
            let name = r.blob()?;
            if name != PROTOCOL_NAME {
                return Err(ProtocolError::MalformedHeader);
            }
            let version = r.u8()?;
            if version != PROTOCOL_VERSION {
                return Err(ProtocolError::MalformedHeader);
            }
            let connect_flags = r.u8()?;
            let keep_alive = r.u16()?;
            let client_id = Bytes::copy_from_slice(r.blob()?);
            let username = if connect_flags & CONNECT_FLAG_USERNAME != 0 {
                Some(
                    String::from_utf8(r.blob()?.to_vec())
                        .map_err(|_| ProtocolError::MalformedHeader)?,
                )
            } else {
                None
            };
            let password = if connect_flags & CONNECT_FLAG_PASSWORD != 0 {
                Some(Bytes::copy_from_slice(r.blob()?))
            } else {
                None
            };
            Packet::Connect(Connect {
                client_id,
                username,
                password,
                clean_session: connect_flags & CONNECT_FLAG_CLEAN_SESSION != 0,
                insecure: connect_flags & CONNECT_FLAG_INSECURE != 0,
                keep_alive,
            })
        }
        PacketType::Connack => {
            let _ack_flags = r.u8()?;
            Packet::Connack {
                return_code: ReturnCode::try_from(r.u8()?)?,
            }
        }
        PacketType::Publish => {
            let qos = Qos::try_from((flags >> 1) & 0x03)?;
            let topic = Bytes::copy_from_slice(r.blob()?);
            let message_id = if qos != Qos::AtMostOnce { r.u16()? } else { 0 };
            let payload = Bytes::copy_from_slice(r.rest());
            Packet::Publish(Publish {
                message_id,
                qos,
                topic,
                payload,
                forwarded: false,
            })
        }
        PacketType::Puback => Packet::Puback { message_id: r.u16()? },
        PacketType::Pubrec => Packet::Pubrec { message_id: r.u16()? },
        PacketType::Pubrel => Packet::Pubrel { message_id: r.u16()? },
        PacketType::Pubcomp => Packet::Pubcomp { message_id: r.u16()? },
        PacketType::Subscribe => {
            let message_id = r.u16()?;
            let mut subscriptions = Vec::new();
            while !r.is_empty() {
                let topic = Bytes::copy_from_slice(r.blob()?);
                let qos = Qos::try_from(r.u8()?)?;
                subscriptions.push(TopicQosTuple { qos, topic });
            }
            Packet::Subscribe(Subscribe {
                message_id,
                subscriptions,
                forwarded: false,
            })
        }
        PacketType::Suback => {
            let message_id = r.u16()?;
            Packet::Suback(Suback {
                message_id,
                qos: r.rest().to_vec(),
            })
        }
        PacketType::Unsubscribe => {
            let message_id = r.u16()?;
            let mut topics = Vec::new();
            while !r.is_empty() {
                topics.push(Bytes::copy_from_slice(r.blob()?));
            }
            Packet::Unsubscribe(Unsubscribe {
                message_id,
                topics,
                forwarded: false,
            })
        }
        PacketType::Unsuback => Packet::Unsuback { message_id: r.u16()? },
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        PacketType::Disconnect => Packet::Disconnect,
    };
    Ok(packet)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        let b = *self.buf.get(self.pos).ok_or(ProtocolError::ShortRead {
            needed: 1,
            have: 0,
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let hi = self.u8()?;
        let lo = self.u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn blob(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.u16()? as usize;
        let end = self.pos + len;
        let data = self.buf.get(self.pos..end).ok_or(ProtocolError::ShortRead {
            needed: len,
            have: self.buf.len() - self.pos,
        })?;
        self.pos = end;
        Ok(data)
    }

    fn rest(&mut self) -> &'a [u8] {
        let data = &self.buf[self.pos..];
        self.pos = self.buf.len();
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) {
        let frame = encode(&packet);
        let decoded = decode(&frame).expect("decode");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn roundtrip_all_packet_kinds() {
        roundtrip(Packet::Connect(Connect {
            client_id: Bytes::from_static(b"UCBFDONCNJLaKMCAIeJBaOVfbAXUZHNPLDKKLDKLHZHKYIZLCDPQ"),
            username: None,
            password: None,
            clean_session: true,
            insecure: false,
            keep_alive: 30,
        }));
        roundtrip(Packet::Connect(Connect {
            client_id: Bytes::from_static(b"AAAAclient"),
            username: Some("user".into()),
            password: Some(Bytes::from_static(b"secret")),
            clean_session: false,
            insecure: true,
            keep_alive: 0,
        }));
        roundtrip(Packet::Connack {
            return_code: ReturnCode::Accepted,
        });
        roundtrip(Packet::Connack {
            return_code: ReturnCode::RefusedNotAuthorized,
        });
        for qos in [Qos::AtMostOnce, Qos::AtLeastOnce, Qos::ExactlyOnce] {
            roundtrip(Packet::Publish(Publish {
                message_id: if qos == Qos::AtMostOnce { 0 } else { 42 },
                qos,
                topic: Bytes::from_static(b"AbYANcEEZDcdY/unit8.b.b1?ttl=3m"),
                payload: Bytes::from_static(b"Hi unit8.b.b1!"),
                forwarded: false,
            }));
        }
        roundtrip(Packet::Puback { message_id: 7 });
        roundtrip(Packet::Pubrec { message_id: 42 });
        roundtrip(Packet::Pubrel { message_id: 42 });
        roundtrip(Packet::Pubcomp { message_id: 42 });
        roundtrip(Packet::Subscribe(Subscribe {
            message_id: 3,
            subscriptions: vec![TopicQosTuple {
                qos: Qos::AtMostOnce,
                topic: Bytes::from_static(b"AYAAMACRZDCHK/..."),
            }],
            forwarded: false,
        }));
        roundtrip(Packet::Suback(Suback {
            message_id: 3,
            qos: vec![0, 1],
        }));
        roundtrip(Packet::Unsubscribe(Unsubscribe {
            message_id: 4,
            topics: vec![Bytes::from_static(b"AYAAMACRZDCHK/...")],
            forwarded: false,
        }));
        roundtrip(Packet::Unsuback { message_id: 4 });
        roundtrip(Packet::Pingreq);
        roundtrip(Packet::Pingresp);
        roundtrip(Packet::Disconnect);
    }

    #[test]
    fn connect_header_is_fourteen_bytes() {
        let client_id = b"UCBFDONCNJLaKMCAIeJBaOVfbAXUZHNPLDKKLDKLHZHKYIZLCDPQ";
        let frame = encode(&Packet::Connect(Connect {
            client_id: Bytes::from_static(client_id),
            username: None,
            password: None,
            clean_session: false,
            insecure: false,
            keep_alive: 0,
        }));
        // Fixed header, one-byte remaining length, protocol name, version,
        // flags and keep-alive add up to 14; the client id field follows.
        assert_eq!(frame.len(), 14 + 2 + client_id.len());
        assert_eq!(frame[0] >> 4, PacketType::Connect as u8);
    }

    #[test]
    fn pingreq_and_disconnect_are_two_bytes() {
        assert_eq!(encode(&Packet::Pingreq).len(), 2);
        assert_eq!(encode(&Packet::Disconnect).len(), 2);
    }

    #[test]
    fn oversized_body_is_rejected() {
        let mut frame = BytesMut::new();
        frame.put_u8((PacketType::Publish as u8) << 4);
        put_remaining_length(&mut frame, MAX_MESSAGE_SIZE + 1);
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn subscribe_carries_reserved_flag() {
        let frame = encode(&Packet::Subscribe(Subscribe {
            message_id: 1,
            subscriptions: vec![TopicQosTuple {
                qos: Qos::AtLeastOnce,
                topic: Bytes::from_static(b"k/a.b"),
            }],
            forwarded: false,
        }));
        assert_eq!(frame[0] & 0x0F, 0x02);
    }

    #[tokio::test]
    async fn read_packet_from_stream() {
        let frame = encode(&Packet::Publish(Publish {
            message_id: 9,
            qos: Qos::AtLeastOnce,
            topic: Bytes::from_static(b"k/a.b"),
            payload: Bytes::from_static(b"payload"),
            forwarded: false,
        }));
        let mut stream = std::io::Cursor::new(frame.to_vec());
        let packet = read_packet(&mut stream).await.expect("read");
        assert_eq!(packet.message_id(), 9);
        assert_eq!(packet.packet_type(), PacketType::Publish);
    }
}
