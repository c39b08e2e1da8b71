//! Framing adapters between accepted transports and the packet alphabet.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use super::{codec, grpc, Packet, ProtocolError};

/// Framing negotiated at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    /// Length-prefixed binary framing over TCP or TLS.
    Binary,
    /// The packet alphabet carried in WebSocket binary messages.
    WebSock,
    /// Protobuf-framed packets on the stream listener.
    Grpc,
    /// Stand-in sessions replayed from a peer node.
    Cluster,
}

pub trait Stream: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> Stream for T {}

/// Boxed IO stream handed to the session engine.
pub type Io = Box<dyn Stream + Unpin + Send>;

/// Reading half of an accepted session.
pub enum PacketReader {
    Binary(ReadHalf<Io>),
    WebSock(SplitStream<WebSocketStream<Io>>),
    Grpc(ReadHalf<Io>),
}

/// Writing half of an accepted session.
pub enum PacketWriter {
    Binary(WriteHalf<Io>),
    WebSock(SplitSink<WebSocketStream<Io>, WsMessage>),
    Grpc(WriteHalf<Io>),
}

/// Split a raw stream into framing halves for the given protocol.
pub fn split(io: Io, proto: Proto) -> (PacketReader, PacketWriter) {
    let (r, w) = tokio::io::split(io);
    match proto {
        Proto::Grpc => (PacketReader::Grpc(r), PacketWriter::Grpc(w)),
        _ => (PacketReader::Binary(r), PacketWriter::Binary(w)),
    }
}

/// Split an upgraded WebSocket stream into framing halves.
pub fn split_websocket(ws: WebSocketStream<Io>) -> (PacketReader, PacketWriter) {
    let (sink, stream) = ws.split();
    (PacketReader::WebSock(stream), PacketWriter::WebSock(sink))
}

impl PacketReader {
    /// Read the next packet, blocking until a complete frame arrives.
    pub async fn read_packet(&mut self) -> Result<Packet, ProtocolError> {
        match self {
            PacketReader::Binary(r) => codec::read_packet(r).await,
            PacketReader::Grpc(r) => grpc::read_packet(r).await,
            PacketReader::WebSock(stream) => loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Binary(data))) => return codec::decode(&data),
                    Some(Ok(WsMessage::Close(_))) | None => return Err(ProtocolError::Closed),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                }
            },
        }
    }
}

impl PacketWriter {
    /// Serialize and write one packet.
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), ProtocolError> {
        match self {
            PacketWriter::Binary(w) => {
                w.write_all(&codec::encode(packet)).await?;
                Ok(())
            }
            PacketWriter::Grpc(w) => {
                w.write_all(&grpc::encode(packet)).await?;
                Ok(())
            }
            PacketWriter::WebSock(sink) => {
                sink.send(WsMessage::Binary(codec::encode(packet).to_vec()))
                    .await?;
                Ok(())
            }
        }
    }

    /// Flush and close the transport.
    pub async fn shutdown(&mut self) {
        match self {
            PacketWriter::Binary(w) | PacketWriter::Grpc(w) => {
                let _ = w.shutdown().await;
            }
            PacketWriter::WebSock(sink) => {
                let _ = sink.close().await;
            }
        }
    }
}
