//! Multiplexed request/reply transport and signed multicast discovery for a
//! brokerless service bus.
//!
//! Services announce a signed descriptor listing the actions they serve.
//! Requesters keep a [`DiscoveryRegistry`] of live descriptors, pick an
//! endpoint per action and exchange framed, flow-controlled messages with it
//! over a single long-lived connection.
//!
//! ```ignore
//! use scamp_bus::{DiscoveryRegistry, Requester, RequestOptions, TcpConnector};
//! use scamp_bus::discovery::AllowAll;
//!
//! let registry = DiscoveryRegistry::new(Default::default(), AllowAll);
//! let requester = Requester::new(registry, TcpConnector, Default::default());
//! let reply = requester
//!     .request_json("auth.getTicket", &serde_json::json!({}), &RequestOptions::default())
//!     .await?;
//! ```

#![deny(missing_docs)]

pub mod auth;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod message;
pub mod requester;
pub mod server;
pub mod stream;
pub mod transport;

pub use auth::{AccessPolicy, Principal, PrivilegeTable, StaticPrivileges, TicketVerifier};
pub use client::{Client, ClientPool, Connector, TcpConnector};
pub use config::{
    AnnounceConfig, CacheConfig, ConnectionConfig, DiscoveryConfig, RequesterConfig, ServerConfig,
};
pub use discovery::{ActionDescriptor, ActionFlags, ActionName, DiscoveryRegistry, ServiceDescriptor};
pub use error::{Error, ErrorCode, Result, RpcError};
pub use identity::ServiceIdentity;
pub use message::{Body, Header, Message};
pub use requester::{RequestOptions, Requester};
pub use server::{action_fn, ActionHandler, ActionTable, Request, Server, ServerIncoming};
pub use stream::{PeerInfo, ScampStream, ServiceAddress};
pub use transport::{Connection, Incoming};
