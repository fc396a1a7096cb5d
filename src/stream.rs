//! AsyncRead/AsyncWrite wrapper for the authenticated byte streams the bus runs over.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

use crate::{Error, Result};

/// URI scheme for bus endpoints.
pub const URI_SCHEME: &str = "scamp+tls";

/// Anything usable as a connection's byte stream.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Host and port of a `scamp+tls://host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceAddress {
    /// Host name or address literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ServiceAddress {
    /// Parse a service URI.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(URI_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| Error::connection(format!("unsupported service URI {uri:?}")))?;
        let rest = rest.trim_end_matches('/');
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| Error::connection(format!("service URI {uri:?} has no port")))?;
        let port = port
            .parse()
            .map_err(|_| Error::connection(format!("service URI {uri:?} has a bad port")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::connection(format!("service URI {uri:?} has no host")));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{URI_SCHEME}://{}", self.authority())
    }
}

/// Peer information for a connection.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Remote address as text.
    pub address: String,
    /// Certificate fingerprint the remote authenticated with, if known.
    pub fingerprint: Option<String>,
    /// When the stream was established.
    pub established_at: Instant,
}

impl PeerInfo {
    /// Peer info stamped now.
    pub fn new(address: impl Into<String>, fingerprint: Option<String>) -> Self {
        Self {
            address: address.into(),
            fingerprint,
            established_at: Instant::now(),
        }
    }
}

/// A boxed duplex stream plus who is on the other end.
pub struct ScampStream {
    inner: Box<dyn DuplexStream>,
    peer_info: PeerInfo,
}

impl fmt::Debug for ScampStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScampStream")
            .field("peer_info", &self.peer_info)
            .finish_non_exhaustive()
    }
}

impl ScampStream {
    /// Wrap an established stream.
    pub fn new(inner: impl DuplexStream, peer_info: PeerInfo) -> Self {
        Self {
            inner: Box::new(inner),
            peer_info,
        }
    }

    /// Who is on the other end.
    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }
}

impl AsyncRead for ScampStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ScampStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
