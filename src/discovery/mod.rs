//! Signed service discovery.
//!
//! Every service instance periodically broadcasts a signed descriptor naming
//! its identity, endpoint and actions. Consumers verify each descriptor,
//! keep the freshest one per instance and index the actions it serves.
//!
//! # Overview
//!
//! - [`ServiceDescriptor`]: blob codec with lazily memoized signature checks
//! - [`DiscoveryRegistry`]: dedup, expiry, action index and endpoint selection
//! - [`AccessFilter`]: which fingerprints may serve which actions
//! - [`Announcer`] / [`observe`]: multicast transport for descriptors,
//!   zlib-deflated on the wire ([`packet`])
//! - [`CacheFile`]: authoritative descriptors from a shared file
//!
//! # Example
//!
//! ```ignore
//! use scamp_bus::discovery::{AccessFile, DiscoveryRegistry, Source};
//!
//! let registry = DiscoveryRegistry::new(Default::default(), AccessFile::new("/etc/scamp/authorized_services"));
//! registry.ingest(&datagram, Source::Broadcast);
//! let target = registry.lookup("auth.getTicket", 1, "json", None);
//! ```

pub mod access;
pub mod action;
pub mod announce;
pub mod cache;
pub mod descriptor;
pub mod observe;
pub mod packet;
pub mod registry;
mod rle;

pub use access::{AccessFile, AccessFilter, AllowAll, Authorizer};
pub use action::{ActionDescriptor, ActionFlags, ActionName};
pub use announce::Announcer;
pub use cache::CacheFile;
pub use descriptor::{
    generate_identity, Announcement, DescriptorBuilder, DescriptorError, ServiceDescriptor,
};
pub use registry::{ActionTarget, Admission, DiscoveryRegistry, Source};
