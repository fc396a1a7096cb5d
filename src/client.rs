//! Request/reply client over one connection, and a per-URI client pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{ErrorCode, RpcError};
use crate::message::Message;
use crate::stream::{PeerInfo, ScampStream, ServiceAddress};
use crate::transport::{Connection, Incoming};
use crate::Error;

/// Error for a connection that never came up. Safe to redispatch.
pub const CONNECT_FAILED: &str = "Connection could not be established";

/// Error for requests outstanding when the connection dropped.
pub const CONNECTION_LOST: &str = "Connection lost";

/// Establishes authenticated byte streams to service endpoints.
///
/// Implementations own the TLS handshake. When `fingerprint` is given the
/// implementation should report the peer's actual certificate fingerprint in
/// [`PeerInfo::fingerprint`] so the client can check it.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a stream to `address`.
    async fn connect(
        &self,
        address: &ServiceAddress,
        fingerprint: Option<&str>,
    ) -> std::io::Result<ScampStream>;
}

/// Plain TCP connector, for loopback use and for deployments that terminate
/// TLS in front of the service.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        address: &ServiceAddress,
        _fingerprint: Option<&str>,
    ) -> std::io::Result<ScampStream> {
        let tcp = TcpStream::connect(address.authority()).await?;
        tcp.set_nodelay(true)?;
        let peer = tcp
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| address.authority());
        Ok(ScampStream::new(tcp, PeerInfo::new(peer, None)))
    }
}

type ReplySender = oneshot::Sender<Result<Message, RpcError>>;

struct ClientInner {
    conn: Connection,
    pending: Mutex<HashMap<u64, ReplySender>>,
    next_id: AtomicU64,
}

impl ClientInner {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, ReplySender>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take(&self, id: u64) -> Option<ReplySender> {
        let mut pending = self.lock_pending();
        let sender = pending.remove(&id);
        self.conn.set_busy(!pending.is_empty());
        sender
    }
}

/// A client bound to one connection. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("conn", &self.inner.conn)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect to `uri` through `connector`.
    ///
    /// Any failure before the connection is up is reported as a dispatch
    /// failure.
    pub async fn connect(
        connector: &dyn Connector,
        uri: &str,
        fingerprint: Option<&str>,
        config: ConnectionConfig,
    ) -> Result<Client, RpcError> {
        let address = ServiceAddress::parse(uri)
            .map_err(|e| RpcError::new(ErrorCode::Transport, e.to_string()))?;
        debug!(%address, "connecting");
        let stream = connector.connect(&address, fingerprint).await.map_err(|e| {
            warn!(%address, error = %e, "connect failed");
            RpcError::dispatch_failure(CONNECT_FAILED)
        })?;
        if let (Some(expected), Some(actual)) = (fingerprint, stream.peer_info().fingerprint.as_deref()) {
            if expected != actual {
                error!(%address, announced = expected, peer = actual, "TLS fingerprint mismatch");
                return Err(RpcError::dispatch_failure(CONNECT_FAILED));
            }
        }
        info!(%address, "connected");
        Ok(Client::from_stream(stream, config))
    }

    /// Client over an established stream.
    pub fn from_stream(stream: ScampStream, config: ConnectionConfig) -> Client {
        let (conn, incoming) = Connection::spawn(stream, config);
        let inner = Arc::new(ClientInner {
            conn,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });
        tokio::spawn(reply_loop(Arc::clone(&inner), incoming));
        Client { inner }
    }

    /// Underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    /// True once the connection has closed.
    pub fn is_closed(&self) -> bool {
        self.inner.conn.is_closed()
    }

    /// Send `request` and wait up to `timeout` for the reply.
    ///
    /// `request_id` and `type` are set here. A timeout fails only this
    /// request; the connection stays up.
    pub async fn request(&self, mut request: Message, timeout: Duration) -> Result<Message, RpcError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        request.header.insert("request_id".into(), Value::from(id));
        request.header.insert("type".into(), Value::from("request"));

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.lock_pending();
            pending.insert(id, tx);
            self.inner.conn.set_busy(true);
        }

        if let Err(e) = self.inner.conn.send_message(request) {
            self.inner.take(id);
            return Err(match e {
                // never queued, so never seen by the peer
                Error::Closed(_) => RpcError::dispatch_failure(CONNECTION_LOST),
                other => other.into_rpc(),
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RpcError::new(ErrorCode::Transport, CONNECTION_LOST)),
            Err(_) => {
                self.inner.take(id);
                debug!(request_id = id, "request timed out");
                Err(RpcError::new(
                    ErrorCode::Transport,
                    format!("RPC Timeout (request {id})"),
                ))
            }
        }
    }

    /// Close the connection.
    pub fn close(&self) {
        self.inner.conn.close("client closed");
    }
}

async fn reply_loop(inner: Arc<ClientInner>, mut incoming: Incoming) {
    while let Some(reply) = incoming.next().await {
        let Some(id) = reply.header.get("request_id").and_then(Value::as_u64) else {
            error!("Received reply with no request_id");
            continue;
        };
        match inner.take(id) {
            Some(sender) => {
                let _ = sender.send(Ok(reply));
            }
            None => debug!(request_id = id, "reply for unknown or expired request"),
        }
    }

    let orphans: Vec<ReplySender> = {
        let mut pending = inner.lock_pending();
        pending.drain().map(|(_, sender)| sender).collect()
    };
    inner.conn.set_busy(false);
    for sender in orphans {
        let _ = sender.send(Err(RpcError::new(ErrorCode::Transport, CONNECTION_LOST)));
    }
}

/// One client per endpoint URI. Closed clients are replaced on next use.
#[derive(Clone)]
pub struct ClientPool {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    clients: Arc<Mutex<HashMap<String, Client>>>,
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ClientPool {
    /// Empty pool.
    pub fn new(connector: impl Connector, config: ConnectionConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            config,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Client>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Live client for `uri`, connecting if needed.
    pub async fn client(&self, uri: &str, fingerprint: Option<&str>) -> Result<Client, RpcError> {
        {
            let mut clients = self.lock();
            match clients.get(uri) {
                Some(client) if !client.is_closed() => return Ok(client.clone()),
                Some(_) => {
                    clients.remove(uri);
                }
                None => {}
            }
        }
        let client = Client::connect(self.connector.as_ref(), uri, fingerprint, self.config.clone()).await?;
        self.lock().insert(uri.to_string(), client.clone());
        Ok(client)
    }

    /// Number of pooled clients, closed ones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if no clients are pooled.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Header;
    use crate::transport::Connection;

    fn pair() -> (Client, Connection, Incoming) {
        let (a, b) = tokio::io::duplex(1 << 16);
        let client = Client::from_stream(
            ScampStream::new(a, PeerInfo::new("server", None)),
            ConnectionConfig::default(),
        );
        let (server, incoming) = Connection::spawn(
            ScampStream::new(b, PeerInfo::new("client", None)),
            ConnectionConfig::server(),
        );
        (client, server, incoming)
    }

    fn reply_to(request: &Message, body: &str) -> Message {
        let mut header = Header::new();
        header.insert("type".into(), "reply".into());
        header.insert("request_id".into(), request.header["request_id"].clone());
        Message::from_bytes(header, body.to_string())
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (client, server, mut incoming) = pair();
        let task = tokio::spawn(async move {
            let req = incoming.next().await.unwrap();
            assert_eq!(req.header_str("type"), Some("request"));
            server.send_message(reply_to(&req, "pong")).unwrap();
            incoming
        });

        let reply = client
            .request(Message::from_bytes(Header::new(), "ping"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(&reply.body.collect(16).await.data[..], b"pong");
        let _incoming = task.await.unwrap();
    }

    #[tokio::test]
    async fn test_replies_matched_out_of_order() {
        let (client, server, mut incoming) = pair();
        tokio::spawn(async move {
            let first = incoming.next().await.unwrap();
            let second = incoming.next().await.unwrap();
            server.send_message(reply_to(&second, "second")).unwrap();
            server.send_message(reply_to(&first, "first")).unwrap();
            let _ = incoming.next().await;
        });

        let (a, b) = tokio::join!(
            client.request(Message::from_bytes(Header::new(), "1"), Duration::from_secs(5)),
            client.request(Message::from_bytes(Header::new(), "2"), Duration::from_secs(5)),
        );
        assert_eq!(&a.unwrap().body.collect(16).await.data[..], b"first");
        assert_eq!(&b.unwrap().body.collect(16).await.data[..], b"second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_only_that_request() {
        let (client, server, mut incoming) = pair();
        let err = client
            .request(Message::from_bytes(Header::new(), "x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.message.contains("RPC Timeout"));
        assert!(!err.dispatch_failure);
        assert!(!client.is_closed());

        let late = incoming.next().await.unwrap();
        tokio::spawn(async move {
            let req = incoming.next().await.unwrap();
            server.send_message(reply_to(&late, "late")).unwrap();
            server.send_message(reply_to(&req, "ok")).unwrap();
            let _ = incoming.next().await;
        });
        let reply = client
            .request(Message::from_bytes(Header::new(), "y"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(&reply.body.collect(16).await.data[..], b"ok");
    }

    #[tokio::test]
    async fn test_connection_lost() {
        let (client, server, mut incoming) = pair();
        tokio::spawn(async move {
            let _req = incoming.next().await.unwrap();
            server.close("going away");
        });
        let err = client
            .request(Message::from_bytes(Header::new(), "x"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Transport);
        assert_eq!(err.message, CONNECTION_LOST);
        assert!(!err.dispatch_failure);
    }

    #[tokio::test]
    async fn test_connect_failure_is_dispatch_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = Client::connect(
            &TcpConnector,
            &format!("scamp+tls://127.0.0.1:{port}"),
            None,
            ConnectionConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(err.dispatch_failure);
        assert_eq!(err.message, CONNECT_FAILED);
    }

    #[tokio::test]
    async fn test_pool_reuses_and_replaces() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("scamp+tls://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });

        let pool = ClientPool::new(TcpConnector, ConnectionConfig::default());
        let a = pool.client(&uri, None).await.unwrap();
        let b = pool.client(&uri, None).await.unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));

        a.close();
        let c = pool.client(&uri, None).await.unwrap();
        assert!(!Arc::ptr_eq(&a.inner, &c.inner));
        assert_eq!(pool.len(), 1);
    }
}
