//! Error types for scamp-bus.

use std::fmt;

use serde_json::{Map, Value};

use crate::discovery::DescriptorError;
use crate::transport::FrameError;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed frame on the wire.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Peer violated the multiplexing or flow-control rules.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection has already been closed.
    #[error("Connection closed: {0}")]
    Closed(String),

    /// Outbound bytes queued faster than the peer drains them.
    #[error("write queue exceeded ({queued} bytes queued, limit {limit})")]
    WriteQueueFull {
        /// Bytes that would be queued after this write.
        queued: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A message body ended with an error trailer.
    #[error("Message error: {0}")]
    Message(String),

    /// Descriptor blob rejected.
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Key or certificate could not be loaded.
    #[error("Identity error: {0}")]
    Identity(String),

    /// Error reported at the request/reply boundary.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Discovery cache file is older than its staleness ceiling.
    #[error("Stale discovery cache: {0}")]
    StaleCache(String),

    /// Unusable configuration value.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    /// True for errors that must tear down the connection they occurred on.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Frame(_) | Self::Protocol(_) | Self::WriteQueueFull { .. }
        )
    }

    /// Convert into the boundary error callers see, keeping RPC errors intact.
    pub fn into_rpc(self) -> RpcError {
        match self {
            Self::Rpc(err) => err,
            other => RpcError::new(ErrorCode::Transport, other.to_string()),
        }
    }
}

/// Machine-readable error codes exchanged in reply headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Connection-level or framing failure.
    Transport,
    /// Missing, invalid or expired ticket.
    Authn,
    /// Ticket lacks a privilege the action requires.
    Authz,
    /// Caller throttled.
    RateLimit,
    /// No live endpoint serves the action.
    NoSuchAction,
    /// Request could not be understood.
    BadRequest,
    /// Handler failed.
    Internal,
    /// Code produced by a peer that this crate does not know.
    Other(String),
}

impl ErrorCode {
    /// Parse a wire code, accepting the legacy aliases.
    pub fn parse(code: &str) -> Self {
        match code {
            "transport" => Self::Transport,
            "authn" => Self::Authn,
            "authz" => Self::Authz,
            "ratelimit" => Self::RateLimit,
            "no_such_action" | "no_action" => Self::NoSuchAction,
            "bad_request" | "malformed" => Self::BadRequest,
            "internal" | "general" => Self::Internal,
            other => Self::Other(other.to_string()),
        }
    }

    /// Wire representation.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Transport => "transport",
            Self::Authn => "authn",
            Self::Authz => "authz",
            Self::RateLimit => "ratelimit",
            Self::NoSuchAction => "no_such_action",
            Self::BadRequest => "bad_request",
            Self::Internal => "internal",
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error surfaced to the caller of a request.
///
/// `dispatch_failure` is set only when the request provably never left this
/// process, so redispatching it to another endpoint cannot duplicate side
/// effects.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    /// Error class.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Extra structured data from the reply header, if any.
    pub data: Option<Value>,
    /// Safe to retry against a different endpoint.
    pub dispatch_failure: bool,
}

impl RpcError {
    /// Create an error with the given code.
    pub fn new<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
            dispatch_failure: false,
        }
    }

    /// Transport error for a connection that could not be established.
    pub fn dispatch_failure<S: Into<String>>(message: S) -> Self {
        Self {
            dispatch_failure: true,
            ..Self::new(ErrorCode::Transport, message)
        }
    }

    /// Attach structured data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Write this error into a reply header.
    pub fn to_header(&self, header: &mut Map<String, Value>) {
        header.insert("error_code".into(), Value::from(self.code.as_str()));
        header.insert("error".into(), Value::from(self.message.clone()));
        if let Some(data) = &self.data {
            header.insert("error_data".into(), data.clone());
        }
    }

    /// Extract an error from a reply header, if it carries one.
    pub fn from_header(header: &Map<String, Value>) -> Option<Self> {
        let code = header.get("error_code").and_then(Value::as_str);
        let message = header.get("error").and_then(Value::as_str);
        if code.is_none() && message.is_none() {
            return None;
        }
        let mut err = Self::new(
            ErrorCode::parse(code.unwrap_or("general")),
            message.unwrap_or("Unknown error"),
        );
        err.data = header.get("error_data").cloned();
        Some(err)
    }
}
