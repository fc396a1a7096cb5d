//! Serving side: accepted streams in, action handlers dispatched, replies out.
//!
//! Streams arrive through a [`ServerIncoming`] fed by whatever accepts
//! connections (the plain TCP acceptor here, or a TLS acceptor owned by the
//! caller). Each stream becomes a [`Connection`]; every inbound message on it
//! must be a request carrying `type = "request"` and a `request_id`.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddrV4;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use crate::auth::{AccessPolicy, Principal};
use crate::config::ServerConfig;
use crate::discovery::{ActionDescriptor, ActionName};
use crate::error::{ErrorCode, RpcError};
use crate::message::{Body, Header, Message};
use crate::stream::{PeerInfo, ScampStream, URI_SCHEME};
use crate::transport::{Connection, Incoming};
use crate::{Error, Result};

/// Sender half feeding a [`ServerIncoming`].
pub type StreamSender = mpsc::UnboundedSender<io::Result<ScampStream>>;

/// Accepted streams waiting to be served.
pub struct ServerIncoming {
    receiver: UnboundedReceiverStream<io::Result<ScampStream>>,
}

impl ServerIncoming {
    /// Create the stream and the sender acceptors push connections into.
    pub fn new() -> (Self, StreamSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let incoming = Self {
            receiver: UnboundedReceiverStream::new(rx),
        };
        (incoming, tx)
    }
}

impl Stream for ServerIncoming {
    type Item = io::Result<ScampStream>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

/// A request handed to an action handler.
pub struct Request {
    /// The action as registered.
    pub action: ActionDescriptor,
    /// Request header.
    pub header: Header,
    /// Request body.
    pub body: Body,
    /// Ticket holder, when the action required one.
    pub principal: Option<Principal>,
    /// Connection peer.
    pub peer: PeerInfo,
}

impl Request {
    /// Buffer the body (up to `limit` bytes) and parse it as JSON.
    pub async fn json(self, limit: usize) -> std::result::Result<Value, RpcError> {
        let data = self
            .body
            .collect(limit)
            .await
            .into_result()
            .map_err(|e| RpcError::new(ErrorCode::BadRequest, e.to_string()))?;
        serde_json::from_slice(&data).map_err(|e| RpcError::new(ErrorCode::BadRequest, e.to_string()))
    }
}

/// A reply with an empty header and `value` as its JSON body.
pub fn json_reply(value: &Value) -> Message {
    Message::from_bytes(Header::new(), Bytes::from(value.to_string()))
}

/// Serves one action.
#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    /// Handle `request`. `type` and `request_id` are filled into the reply
    /// header by the server; an `Err` becomes an error reply.
    async fn handle(&self, request: Request) -> std::result::Result<Message, RpcError>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = std::result::Result<Message, RpcError>> + Send + 'static>>;

struct FnHandler {
    f: Box<dyn Fn(Request) -> HandlerFuture + Send + Sync>,
}

#[async_trait]
impl ActionHandler for FnHandler {
    async fn handle(&self, request: Request) -> std::result::Result<Message, RpcError> {
        (self.f)(request).await
    }
}

/// Wrap an async closure as a handler.
pub fn action_fn<F, Fut>(f: F) -> impl ActionHandler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Message, RpcError>> + Send + 'static,
{
    FnHandler {
        f: Box::new(move |request| -> HandlerFuture { Box::pin(f(request)) }),
    }
}

/// Registered actions keyed by lowercase `namespace.name.vN`.
#[derive(Clone, Default)]
pub struct ActionTable {
    entries: HashMap<String, (ActionDescriptor, Arc<dyn ActionHandler>)>,
}

impl std::fmt::Debug for ActionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.entries.keys().collect();
        keys.sort();
        f.debug_struct("ActionTable").field("actions", &keys).finish()
    }
}

impl ActionTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `action`, replacing any handler with the same key.
    pub fn register(mut self, action: ActionDescriptor, handler: impl ActionHandler) -> Self {
        let key = action.name.handler_key();
        if self.entries.insert(key.clone(), (action, Arc::new(handler))).is_some() {
            warn!(action = %key, "replaced action handler");
        }
        self
    }

    /// Handler for `action` (`namespace.name`) at `version`.
    pub fn get(&self, action: &str, version: u32) -> Option<(&ActionDescriptor, &Arc<dyn ActionHandler>)> {
        let key = format!("{action}.v{}", version.max(1)).to_lowercase();
        self.entries.get(&key).map(|(d, h)| (d, h))
    }

    /// Registered actions, for the service descriptor.
    pub fn actions(&self) -> Vec<ActionDescriptor> {
        let mut actions: Vec<_> = self.entries.values().map(|(d, _)| d.clone()).collect();
        actions.sort_by_key(|a| a.name.handler_key());
        actions
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct Shared {
    table: ActionTable,
    policy: Option<AccessPolicy>,
    config: ServerConfig,
}

/// Dispatches requests on accepted connections. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("table", &self.shared.table)
            .field("access_checks", &self.shared.policy.is_some())
            .finish()
    }
}

impl Server {
    /// Server for `table` without access checks.
    pub fn new(table: ActionTable, config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                table,
                policy: None,
                config,
            }),
        }
    }

    /// Server for `table` checking tickets with `policy`.
    pub fn with_policy(table: ActionTable, policy: AccessPolicy, config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                table,
                policy: Some(policy),
                config,
            }),
        }
    }

    /// Registered actions.
    pub fn actions(&self) -> Vec<ActionDescriptor> {
        self.shared.table.actions()
    }

    /// Serve every stream `incoming` yields until it ends.
    pub async fn serve<S>(&self, mut incoming: S)
    where
        S: Stream<Item = io::Result<ScampStream>> + Unpin,
    {
        while let Some(accepted) = incoming.next().await {
            match accepted {
                Ok(stream) => {
                    self.serve_connection(stream);
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
        debug!("incoming streams ended");
    }

    /// Serve one stream in the background.
    pub fn serve_connection(&self, stream: ScampStream) -> JoinHandle<()> {
        let (conn, incoming) = Connection::spawn(stream, self.shared.config.connection.clone());
        info!(peer = %conn.peer().address, "accepted connection");
        tokio::spawn(Arc::clone(&self.shared).connection_loop(conn, incoming))
    }
}

impl Shared {
    async fn connection_loop(self: Arc<Self>, conn: Connection, mut incoming: Incoming) {
        let in_flight = Arc::new(AtomicUsize::new(0));
        while let Some(message) = incoming.next().await {
            if message.header_str("type") != Some("request") {
                error!(peer = %conn.peer().address, "received non-request");
                continue;
            }
            let Some(request_id) = message.header.get("request_id").cloned() else {
                error!(peer = %conn.peer().address, "received request without request_id");
                continue;
            };

            if in_flight.fetch_add(1, Ordering::SeqCst) == 0 {
                conn.set_busy(true);
            }
            let shared = Arc::clone(&self);
            let conn = conn.clone();
            let in_flight = Arc::clone(&in_flight);
            tokio::spawn(async move {
                let mut reply = match shared.dispatch(conn.peer().clone(), message).await {
                    Ok(reply) => reply,
                    Err(err) => {
                        let mut header = Header::new();
                        err.to_header(&mut header);
                        Message::from_bytes(header, Bytes::new())
                    }
                };
                reply.header.insert("type".into(), Value::from("reply"));
                reply.header.insert("request_id".into(), request_id);
                if let Err(e) = conn.send_message(reply) {
                    debug!(error = %e, "reply not sent");
                }
                if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                    conn.set_busy(false);
                }
            });
        }
        debug!(peer = %conn.peer().address, reason = ?conn.close_reason(), "connection finished");
    }

    async fn dispatch(&self, peer: PeerInfo, message: Message) -> std::result::Result<Message, RpcError> {
        let Message { header, body } = message;
        let action = header.get("action").and_then(Value::as_str).unwrap_or_default();
        let version = header
            .get("version")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(1);

        let Some((descriptor, handler)) = self.table.get(action, version) else {
            debug!(action, version, "no such action");
            return Err(RpcError::new(
                ErrorCode::NoSuchAction,
                format!("No such action {}", ActionName::from_qualified("", action, version).handler_key()),
            ));
        };

        let principal = match &self.policy {
            Some(policy) => {
                let ticket = header.get("ticket").and_then(Value::as_str);
                policy.check(descriptor, ticket).await?
            }
            None => None,
        };

        let request = Request {
            action: descriptor.clone(),
            header,
            body,
            principal,
            peer,
        };
        handler.handle(request).await
    }
}

/// Bind a listener on a random port from the configured range.
///
/// Returns the listener and the `scamp+tls://host:port` URI to announce.
pub async fn bind(config: &ServerConfig) -> Result<(TcpListener, String)> {
    if config.ports.is_empty() {
        return Err(Error::Config(format!(
            "empty port range {}..={}",
            config.ports.start(),
            config.ports.end()
        )));
    }
    let mut last_error = None;
    for _ in 0..config.bind_tries.max(1) {
        let port = rand::thread_rng().gen_range(config.ports.clone());
        match TcpListener::bind(SocketAddrV4::new(config.bind_addr, port)).await {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                let uri = format!("{URI_SCHEME}://{}:{port}", config.advertise_host);
                info!(%uri, "listening");
                return Ok((listener, uri));
            }
            Err(e) => {
                debug!(port, error = %e, "bind failed");
                last_error = Some(e);
            }
        }
    }
    Err(match last_error {
        Some(e) => Error::Io(e),
        None => Error::connection("no port to bind"),
    })
}

/// Accept plain TCP connections into `sender` until shutdown.
pub fn accept_tcp(
    listener: TcpListener,
    sender: StreamSender,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let stream = accepted.and_then(|(tcp, addr)| {
                        tcp.set_nodelay(true)?;
                        Ok(ScampStream::new(tcp, PeerInfo::new(addr.to_string(), None)))
                    });
                    if sender.send(stream).is_err() {
                        debug!("server gone, stopping acceptor");
                        break;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("acceptor shutting down");
                    break;
                }
            }
        }
    })
}
