//! Action-level requests: lookup, dispatch and one redispatch.

use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, error};

use crate::client::{ClientPool, Connector};
use crate::config::RequesterConfig;
use crate::discovery::DiscoveryRegistry;
use crate::error::{ErrorCode, RpcError};
use crate::message::{Header, Message};

/// Per-request options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Envelope the request body uses.
    pub envelope: String,
    /// Action version.
    pub version: u32,
    /// Only dispatch to this instance identity. Disables redispatch.
    pub target: Option<String>,
    /// Override the action's timeout.
    pub timeout: Option<Duration>,
    /// Ticket forwarded in the header.
    pub ticket: Option<String>,
    /// Terminal forwarded in the header.
    pub terminal: Option<String>,
    /// Extra header fields.
    pub header: Header,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            envelope: "json".to_string(),
            version: 1,
            target: None,
            timeout: None,
            ticket: None,
            terminal: None,
            header: Header::new(),
        }
    }
}

impl RequestOptions {
    /// Set the version.
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Set the envelope.
    pub fn envelope(mut self, envelope: impl Into<String>) -> Self {
        self.envelope = envelope.into();
        self
    }

    /// Restrict dispatch to one instance.
    pub fn target(mut self, identity: impl Into<String>) -> Self {
        self.target = Some(identity.into());
        self
    }

    /// Set the ticket.
    pub fn ticket(mut self, ticket: impl Into<String>) -> Self {
        self.ticket = Some(ticket.into());
        self
    }

    /// Override the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Sends requests to whichever live instance serves an action.
#[derive(Clone, Debug)]
pub struct Requester {
    registry: DiscoveryRegistry,
    pool: ClientPool,
    config: RequesterConfig,
}

impl Requester {
    /// Requester over `registry`, connecting through `connector`.
    pub fn new(registry: DiscoveryRegistry, connector: impl Connector, config: RequesterConfig) -> Self {
        let pool = ClientPool::new(connector, config.connection.clone());
        Self {
            registry,
            pool,
            config,
        }
    }

    /// Registry used for lookups.
    pub fn registry(&self) -> &DiscoveryRegistry {
        &self.registry
    }

    /// Send `body` to `action` and return the raw reply.
    ///
    /// Error replies are returned as replies; only failures to get a reply at
    /// all are `Err`. A dispatch failure is retried once on another endpoint
    /// unless a target instance was requested.
    pub async fn request(
        &self,
        action: &str,
        body: impl Into<Bytes>,
        opts: &RequestOptions,
    ) -> Result<Message, RpcError> {
        let body = body.into();
        let mut retried = false;
        loop {
            let target = self
                .registry
                .lookup(action, opts.version, &opts.envelope, opts.target.as_deref())
                .ok_or_else(|| {
                    RpcError::new(ErrorCode::NoSuchAction, format!("Action {action} not found"))
                })?;

            let mut header = opts.header.clone();
            header.insert("action".into(), Value::from(target.action.name.qualified()));
            header.insert("version".into(), Value::from(target.action.name.version));
            header.insert("envelope".into(), Value::from(opts.envelope.clone()));
            header.insert(
                "sector".into(),
                Value::from(self.registry.config().default_sector.clone()),
            );
            if let Some(ticket) = &opts.ticket {
                header.insert("ticket".into(), Value::from(ticket.clone()));
            }
            if let Some(terminal) = &opts.terminal {
                header.insert("terminal".into(), Value::from(terminal.clone()));
            }
            let timeout = opts.timeout.unwrap_or(target.timeout) + self.config.timeout_slack;

            debug!(action, uri = %target.uri(), identity = %target.identity(), "dispatching request");
            let result = match self.pool.client(target.uri(), Some(target.fingerprint())).await {
                Ok(client) => client.request(Message::from_bytes(header, body.clone()), timeout).await,
                Err(e) => Err(e),
            };

            match result {
                Err(e)
                    if e.dispatch_failure
                        && !retried
                        && opts.target.is_none()
                        && self.config.redispatch =>
                {
                    error!(action, uri = %target.uri(), "Failed to dispatch, redispatching");
                    self.registry.connect_failed(&target.descriptor);
                    retried = true;
                }
                Err(e) => {
                    if e.dispatch_failure {
                        self.registry.connect_failed(&target.descriptor);
                    }
                    return Err(e);
                }
                Ok(reply) => return Ok(reply),
            }
        }
    }

    /// Send `payload` as JSON and decode the JSON reply.
    ///
    /// The reply body is buffered up to `reply_limit`. Error headers become
    /// `Err` with the peer's code.
    pub async fn request_json(
        &self,
        action: &str,
        payload: &Value,
        opts: &RequestOptions,
    ) -> Result<Value, RpcError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| RpcError::new(ErrorCode::BadRequest, e.to_string()))?;
        let reply = self.request(action, body, opts).await?;
        let Message { header, body } = reply;
        let collected = body.collect(self.config.reply_limit).await;
        if let Some(error) = collected.error {
            return Err(RpcError::new(ErrorCode::Transport, error));
        }
        if let Some(err) = RpcError::from_header(&header) {
            return Err(err);
        }
        match serde_json::from_slice::<Value>(&collected.data) {
            Ok(value @ (Value::Object(_) | Value::Array(_) | Value::Null)) => Ok(value),
            _ => Err(RpcError::new(
                ErrorCode::Transport,
                "failed to parse JSON response",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use futures_util::StreamExt;

    use crate::config::{ConnectionConfig, DiscoveryConfig};
    use crate::discovery::descriptor::{sign_descriptor, Announcement};
    use crate::discovery::{ActionDescriptor, ActionName, AllowAll, Source};
    use crate::identity::ServiceIdentity;
    use crate::stream::{PeerInfo, ScampStream, ServiceAddress};
    use crate::transport::Connection;

    /// Connects to in-memory echo services; host `down` refuses.
    #[derive(Clone, Default)]
    struct Loopback {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for Loopback {
        async fn connect(
            &self,
            address: &ServiceAddress,
            _fingerprint: Option<&str>,
        ) -> std::io::Result<ScampStream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if address.host == "down" {
                return Err(std::io::ErrorKind::ConnectionRefused.into());
            }
            let (a, b) = tokio::io::duplex(1 << 16);
            let (conn, mut incoming) =
                Connection::spawn(ScampStream::new(b, PeerInfo::new("client", None)), ConnectionConfig::server());
            tokio::spawn(async move {
                while let Some(request) = incoming.next().await {
                    let mut header = Header::new();
                    header.insert("type".into(), "reply".into());
                    header.insert("request_id".into(), request.header["request_id"].clone());
                    let action = request.header_str("action").unwrap_or_default().to_string();
                    let body = request.body.collect(1 << 20).await.data;
                    if action == "store.fail" {
                        RpcError::new(ErrorCode::Internal, "boom").to_header(&mut header);
                        let _ = conn.send_message(Message::from_bytes(header, ""));
                    } else if action == "store.text" {
                        let _ = conn.send_message(Message::from_bytes(header, "not json"));
                    } else {
                        let _ = conn.send_message(Message::from_bytes(header, body));
                    }
                }
            });
            Ok(ScampStream::new(a, PeerInfo::new(address.authority(), None)))
        }
    }

    fn announce(registry: &DiscoveryRegistry, identity: &str, host: &str, actions: &[&str]) {
        let ann = Announcement {
            identity: identity.to_string(),
            sector: "main".to_string(),
            weight: 1.0,
            send_interval: Duration::from_secs(5),
            envelopes: vec!["json".to_string()],
            actions: actions
                .iter()
                .map(|a| ActionDescriptor::new(ActionName::from_qualified("main", a, 1)))
                .collect(),
        };
        let uri = format!("scamp+tls://{host}:30100");
        let blob = sign_descriptor(&ServiceIdentity::generate().unwrap(), &ann, &uri, false, 1.0)
            .unwrap()
            .raw()
            .clone();
        assert_eq!(registry.ingest(&blob, Source::Permanent), crate::discovery::Admission::Admitted);
    }

    fn requester(config: RequesterConfig) -> (Requester, Loopback) {
        let registry = DiscoveryRegistry::new(DiscoveryConfig::default(), AllowAll);
        let connector = Loopback::default();
        (Requester::new(registry, connector.clone(), config), connector)
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let (requester, _) = requester(RequesterConfig::default());
        let err = requester
            .request("nobody.home", "{}", &RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NoSuchAction);
        assert_eq!(err.message, "Action nobody.home not found");
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let (requester, _) = requester(RequesterConfig::default());
        announce(requester.registry(), "store-1", "up", &["Store.Echo", "store.fail", "store.text"]);

        let opts = RequestOptions::default();
        let payload = serde_json::json!({"n": 1});
        let reply = requester.request_json("store.echo", &payload, &opts).await.unwrap();
        assert_eq!(reply, payload);

        let err = requester.request_json("store.fail", &payload, &opts).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");

        let err = requester.request_json("store.text", &payload, &opts).await.unwrap_err();
        assert_eq!(err.message, "failed to parse JSON response");
    }

    #[tokio::test]
    async fn test_action_name_rewritten_from_registry() {
        let (requester, _) = requester(RequesterConfig::default());
        announce(requester.registry(), "store-1", "up", &["Store.Echo"]);
        let reply = requester
            .request("STORE.ECHO", "[]", &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(&reply.body.collect(64).await.data[..], b"[]");
    }

    #[tokio::test]
    async fn test_redispatch_once() {
        let (requester, connector) = requester(RequesterConfig::default());
        announce(requester.registry(), "store-1", "down", &["store.echo"]);

        let err = requester
            .request("store.echo", "{}", &RequestOptions::default())
            .await
            .unwrap_err();
        assert!(err.dispatch_failure);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        let descriptor = requester.registry().snapshot().remove(0);
        assert!(requester.registry().is_failed(&descriptor));
    }

    #[tokio::test]
    async fn test_no_redispatch_with_target_or_disabled() {
        let (requester, connector) = requester(RequesterConfig::default());
        announce(requester.registry(), "store-1", "down", &["store.echo"]);
        let opts = RequestOptions::default().target("store-1");
        assert!(requester.request("store.echo", "{}", &opts).await.is_err());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

        let (requester, connector) = requester_without_redispatch();
        announce(requester.registry(), "store-1", "down", &["store.echo"]);
        assert!(requester
            .request("store.echo", "{}", &RequestOptions::default())
            .await
            .is_err());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    fn requester_without_redispatch() -> (Requester, Loopback) {
        requester(RequesterConfig::default().redispatch(false))
    }

    #[tokio::test]
    async fn test_redispatch_reaches_healthy_endpoint() {
        let (requester, _) = requester(RequesterConfig::default());
        announce(requester.registry(), "store-down", "down", &["store.echo"]);
        announce(requester.registry(), "store-up", "up", &["store.echo"]);

        for _ in 0..8 {
            let reply = requester
                .request_json("store.echo", &serde_json::json!([1]), &RequestOptions::default())
                .await
                .unwrap();
            assert_eq!(reply, serde_json::json!([1]));
        }
    }
}
