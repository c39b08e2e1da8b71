//! The broker service: listeners, protocol demux and lifecycle.
//!
//! The client listener demuxes by peeking the first byte of each accepted
//! stream: a TLS record byte starts a TLS handshake when certificates are
//! configured, an HTTP `GET` becomes either the varz endpoint or a
//! WebSocket upgrade, and anything else speaks the binary framing. The
//! protobuf stream framing gets its own listener, and the cluster plane
//! its own port per node. All framings feed the same session engine.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use super::cache::ConnCache;
use super::cluster::{Cluster, ClusterError, ClusterNode, RpcOp};
use super::conn::{Conn, ConnChannels};
use super::session;
use crate::core::config::{Config, TlsConfig};
use crate::message::topic::Topic;
use crate::message::Message;
use crate::ops::meters::{Meter, Varz};
use crate::protocol::frame::{self, Io, Proto};
use crate::security::{AllowAll, Authenticator, ClientId, Lid};
use crate::store::Store;

/// Broker runtime shared by every session.
pub struct Service {
    cfg: Config,
    pub(crate) store: Store,
    pub(crate) cache: ConnCache,
    pub(crate) meters: Meter,
    pub(crate) auth: Arc<dyn Authenticator>,
    cluster: Option<Arc<Cluster>>,
    started: Instant,
    shutdown: CancellationToken,
}

impl Service {
    /// Open the store and build the cluster plane from config.
    pub fn new(cfg: Config) -> Result<Arc<Self>> {
        Self::with_authenticator(cfg, Arc::new(AllowAll))
    }

    /// Same as [`Service::new`] with a custom credential collaborator.
    pub fn with_authenticator(cfg: Config, auth: Arc<dyn Authenticator>) -> Result<Arc<Self>> {
        let store = Store::open(&cfg.store).context("failed to open the message store")?;
        // Replay of in-flight handshakes is best-effort; surface what the
        // log still holds and move on.
        match store.log.recovery(false) {
            Ok(pending) if !pending.is_empty() => {
                tracing::info!(
                    context = "service",
                    "message log holds {} in-flight entries",
                    pending.len()
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(context = "service", "message log recovery failed: {e}");
            }
        }
        let cluster = match &cfg.cluster {
            Some(cluster_cfg) => {
                Some(Cluster::from_config(cluster_cfg).context("invalid cluster config")?)
            }
            None => None,
        };
        Ok(Arc::new(Self {
            cfg,
            store,
            cache: ConnCache::new(),
            meters: Meter::default(),
            auth,
            cluster,
            started: Instant::now(),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub(crate) fn cluster(&self) -> Option<&Arc<Cluster>> {
        self.cluster.as_ref()
    }

    /// Node name used in the varz snapshot; single-node brokers report a
    /// fixed name.
    fn node_name(&self) -> &str {
        self.cluster
            .as_ref()
            .map_or("unitd", |cluster| cluster.self_name())
    }

    pub fn varz(&self) -> Varz {
        self.meters.varz(self.node_name(), self.started)
    }

    pub(crate) fn is_remote_contract(&self, contract: u32) -> bool {
        self.cluster
            .as_ref()
            .is_some_and(|cluster| cluster.is_remote_contract(contract))
    }

    pub(crate) fn route_to_contract(
        &self,
        op: RpcOp,
        topic: &Topic,
        m: &Message,
        conn: &Conn,
    ) -> Result<(), ClusterError> {
        match &self.cluster {
            Some(cluster) => cluster.route_to_contract(op, topic, m, conn),
            None => Ok(()),
        }
    }

    /// Create and register a client session.
    pub(crate) fn new_conn(&self, proto: Proto) -> (Arc<Conn>, ConnChannels) {
        let (conn, channels) = Conn::new(proto);
        self.meters.connections.inc(1);
        self.cache.add(conn.clone());
        (conn, channels)
    }

    /// Create and register a phantom for a session on a peer node.
    pub(crate) fn new_rpc_conn(
        &self,
        origin: Arc<ClusterNode>,
        connid: Lid,
        client_id: ClientId,
    ) -> (Arc<Conn>, ConnChannels) {
        let (conn, channels) = Conn::new_rpc(origin, connid, client_id);
        self.cache.add(conn.clone());
        (conn, channels)
    }

    /// Bind every configured listener and serve until shutdown. Returns an
    /// error when a listener cannot bind; the process exits non-zero.
    pub async fn listen(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.cfg.listen)
            .await
            .with_context(|| format!("failed to bind listener on {}", self.cfg.listen))?;
        tracing::info!(context = "service", "listening on {}", self.cfg.listen);

        let tls_acceptor = match &self.cfg.tls {
            Some(tls_cfg) => {
                tracing::info!(context = "service", "tls enabled on the client listener");
                Some(build_tls_acceptor(tls_cfg)?)
            }
            None => None,
        };

        if let Some(grpc_listen) = self.cfg.grpc_listen.clone() {
            let grpc_listener = TcpListener::bind(&grpc_listen)
                .await
                .with_context(|| format!("failed to bind stream listener on {grpc_listen}"))?;
            tracing::info!(context = "service", "stream listening on {grpc_listen}");
            let service = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = service.shutdown.cancelled() => break,
                        accepted = grpc_listener.accept() => {
                            let Ok((stream, _)) = accepted else { continue };
                            let service = service.clone();
                            tokio::spawn(async move {
                                service.serve_io(Box::new(stream), Proto::Grpc).await;
                            });
                        }
                    }
                }
            });
        }

        if let Some(cluster) = &self.cluster {
            cluster
                .start(self.clone())
                .await
                .context("failed to start the cluster plane")?;
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let service = self.clone();
                        let acceptor = tls_acceptor.clone();
                        tokio::spawn(async move { service.accept_client(stream, acceptor).await });
                    }
                    Err(e) => {
                        tracing::warn!(context = "service.accept", "accept failed: {e}");
                    }
                },
            }
        }

        self.close_sessions().await;
        Ok(())
    }

    /// Request shutdown; `listen` unwinds, closing every session.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    async fn close_sessions(&self) {
        for conn in self.cache.all() {
            if conn.is_phantom() {
                conn.close(self).await;
            } else {
                conn.closing.cancel();
            }
        }
        // Sessions observe the close signal and tear themselves down; give
        // their wait counters a bounded window to drain.
        for _ in 0..200 {
            if self.cache.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if let Err(e) = self.store.log.write() {
            tracing::warn!(context = "service.close", "log flush failed: {e}");
        }
        if let Err(e) = self.store.close() {
            tracing::warn!(context = "service.close", "store close failed: {e}");
        }
        tracing::info!(context = "service.close", "service stopped");
    }

    /// Demux a freshly accepted client stream by peeking its first byte: a
    /// TLS record starts a handshake, an HTTP `GET` goes to the varz or
    /// WebSocket path, anything else is the binary framing.
    async fn accept_client(self: Arc<Self>, stream: TcpStream, tls: Option<TlsAcceptor>) {
        const TLS_HANDSHAKE: u8 = 0x16;

        let mut first = [0u8; 1];
        let Ok(n) = stream.peek(&mut first).await else {
            return;
        };
        if n == 0 {
            return;
        }
        if first[0] == TLS_HANDSHAKE {
            if let Some(acceptor) = tls {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        self.serve_io(Box::new(tls_stream), Proto::Binary).await;
                    }
                    Err(e) => {
                        tracing::debug!(context = "service.tls", "handshake failed: {e}");
                    }
                }
                return;
            }
        }
        if first[0] == b'G' {
            self.serve_http(stream).await;
        } else {
            self.serve_io(Box::new(stream), Proto::Binary).await;
        }
    }

    /// Serve an HTTP request on the client listener: the varz snapshot or a
    /// WebSocket upgrade carrying the packet alphabet.
    async fn serve_http(self: Arc<Self>, mut stream: TcpStream) {
        let mut head = [0u8; 1024];
        let Ok(n) = stream.peek(&mut head).await else {
            return;
        };
        let path = request_path(&head[..n]).unwrap_or_default();
        if path == self.cfg.varz_path {
            // Consume the peeked request before answering.
            let _ = stream.read(&mut head).await;
            let body = match serde_json::to_vec(&self.varz()) {
                Ok(body) => body,
                Err(_) => return,
            };
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.write_all(&body).await;
            let _ = stream.shutdown().await;
            return;
        }
        match tokio_tungstenite::accept_async(Box::new(stream) as Io).await {
            Ok(ws) => {
                let (reader, writer) = frame::split_websocket(ws);
                let (conn, channels) = self.new_conn(Proto::WebSock);
                session::run(self.clone(), conn, reader, writer, channels).await;
            }
            Err(e) => {
                tracing::debug!(context = "service.ws", "upgrade failed: {e}");
            }
        }
    }

    async fn serve_io(self: Arc<Self>, io: Io, proto: Proto) {
        let (reader, writer) = frame::split(io, proto);
        let (conn, channels) = self.new_conn(proto);
        session::run(self.clone(), conn, reader, writer, channels).await;
    }
}

/// Extract the path of an HTTP request line.
fn request_path(head: &[u8]) -> Option<&str> {
    let line = head.split(|&b| b == b'\r' || b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?;
    let mut fields = line.split_whitespace();
    let _method = fields.next()?;
    fields.next()
}

fn build_tls_acceptor(cfg: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(&cfg.cert_path)
            .with_context(|| format!("failed to read TLS certificate {}", cfg.cert_path))?,
    ))
    .collect::<std::result::Result<Vec<_>, _>>()
    .context("invalid TLS certificate")?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(&cfg.key_path)
            .with_context(|| format!("failed to read TLS key {}", cfg.key_path))?,
    ))
    .context("invalid TLS key")?
    .context("no private key found")?;
    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS configuration")?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_path_parses_the_request_line() {
        assert_eq!(
            request_path(b"GET /varz HTTP/1.1\r\nHost: x\r\n\r\n"),
            Some("/varz")
        );
        assert_eq!(request_path(b"GET / HTTP/1.1\r\n"), Some("/"));
        assert_eq!(request_path(b"garbage"), None);
    }

    #[test]
    fn varz_reports_the_node_name() {
        let service = Service::new(Config::default()).expect("service");
        let varz = service.varz();
        assert_eq!(varz.node, "unitd");
        assert_eq!(varz.connections, 0);
    }
}
