//! Tunables for connections, discovery, announcing and requests.
//!
//! Every struct carries the deployment defaults in its `Default` impl;
//! callers override individual fields with the chainable setters.

use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// Per-connection framing and flow-control limits.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Largest accepted frame payload.
    pub max_frame_len: usize,
    /// Outbound bytes allowed to sit in the write queue.
    pub max_write_queue: usize,
    /// Unacknowledged body bytes allowed in flight per message.
    pub window: usize,
    /// Largest DATA payload the sender emits.
    pub data_chunk: usize,
    /// Close the connection after this long with nothing in flight.
    pub idle_timeout: Duration,
    /// Bytes reserved in the read buffer before each read.
    pub read_quantum: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_len: 128 * 1024,
            max_write_queue: 16 * 1024 * 1024,
            window: 64 * 1024,
            data_chunk: 128 * 1024,
            idle_timeout: Duration::from_secs(90),
            read_quantum: 4096,
        }
    }
}

impl ConnectionConfig {
    /// Defaults for the accepting side, which idles out later than clients.
    pub fn server() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            ..Self::default()
        }
    }

    /// Set the flow-control window.
    pub fn window(mut self, bytes: usize) -> Self {
        self.window = bytes;
        self
    }

    /// Set the idle timeout.
    pub fn idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    /// Set the write queue ceiling.
    pub fn max_write_queue(mut self, bytes: usize) -> Self {
        self.max_write_queue = bytes;
        self
    }

    /// Set the largest accepted frame payload.
    pub fn max_frame_len(mut self, bytes: usize) -> Self {
        self.max_frame_len = bytes;
        self
    }
}

/// Registry admission, expiry and failure-marking parameters.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Sector assumed when a caller does not name one.
    pub default_sector: String,
    /// Multiple of a descriptor's send interval after which it expires.
    pub expiry_multiplier: f64,
    /// Timeout for actions that carry no `tN` flag.
    pub default_timeout: Duration,
    /// Sliding window over which connect failures are counted.
    pub failure_window: Duration,
    /// Upper bound on quarantine length, in minutes.
    pub max_quarantine_minutes: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            default_sector: "main".to_string(),
            expiry_multiplier: 2.1,
            default_timeout: Duration::from_secs(75),
            failure_window: Duration::from_secs(24 * 60 * 60),
            max_quarantine_minutes: 60,
        }
    }
}

impl DiscoveryConfig {
    /// Set the default action timeout.
    pub fn default_timeout(mut self, d: Duration) -> Self {
        self.default_timeout = d;
        self
    }

    /// Set the expiry multiplier.
    pub fn expiry_multiplier(mut self, m: f64) -> Self {
        self.expiry_multiplier = m;
        self
    }
}

/// Shared cache file read by the pinboard loader.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Path of the `%%%`-delimited blob file.
    pub path: PathBuf,
    /// Files whose mtime is older than this are refused.
    pub max_age: Duration,
    /// Minimum spacing between re-reads.
    pub reload_interval: Duration,
}

impl CacheConfig {
    /// Config for the given cache file with default staleness limits.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_age: Duration::from_secs(120),
            reload_interval: Duration::from_secs(1),
        }
    }

    /// Set the staleness ceiling.
    pub fn max_age(mut self, d: Duration) -> Self {
        self.max_age = d;
        self
    }
}

/// Multicast announcement parameters.
#[derive(Clone, Debug)]
pub struct AnnounceConfig {
    /// Multicast group.
    pub group: Ipv4Addr,
    /// Multicast port.
    pub port: u16,
    /// Time between announcements.
    pub send_interval: Duration,
    /// Relative capacity advertised to callers.
    pub weight: f64,
    /// Repeats of the withdrawing announcement after the first one.
    pub withdraw_repeats: u32,
    /// Spacing of withdrawing announcements.
    pub withdraw_spacing: Duration,
    /// Envelopes advertised.
    pub envelopes: Vec<String>,
    /// Sector advertised.
    pub sector: String,
    /// Local interface addresses to announce from and listen on.
    pub interfaces: Vec<Ipv4Addr>,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 63, 248, 106),
            port: 5555,
            send_interval: Duration::from_millis(5000),
            weight: 1.0,
            withdraw_repeats: 4,
            withdraw_spacing: Duration::from_millis(200),
            envelopes: vec!["json".to_string()],
            sector: "main".to_string(),
            interfaces: vec![Ipv4Addr::UNSPECIFIED],
        }
    }
}

impl AnnounceConfig {
    /// Set the destination group. A unicast address works for point-to-point setups.
    pub fn group(mut self, group: Ipv4Addr) -> Self {
        self.group = group;
        self
    }

    /// Set the interfaces to listen on.
    pub fn interfaces(mut self, interfaces: Vec<Ipv4Addr>) -> Self {
        self.interfaces = interfaces;
        self
    }

    /// Set the announcement interval.
    pub fn send_interval(mut self, d: Duration) -> Self {
        self.send_interval = d;
        self
    }

    /// Set the multicast port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the advertised weight.
    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Request dispatch parameters.
#[derive(Clone, Debug)]
pub struct RequesterConfig {
    /// Cap on buffered JSON replies.
    pub reply_limit: usize,
    /// Added to the action timeout to form the request deadline.
    pub timeout_slack: Duration,
    /// Retry once on a different endpoint when dispatch fails.
    pub redispatch: bool,
    /// Connection settings for pooled clients.
    pub connection: ConnectionConfig,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            reply_limit: 10 * 1024 * 1024,
            timeout_slack: Duration::from_secs(5),
            redispatch: true,
            connection: ConnectionConfig::default(),
        }
    }
}

impl RequesterConfig {
    /// Set the buffered reply cap.
    pub fn reply_limit(mut self, bytes: usize) -> Self {
        self.reply_limit = bytes;
        self
    }

    /// Enable or disable redispatch.
    pub fn redispatch(mut self, on: bool) -> Self {
        self.redispatch = on;
        self
    }
}

/// Listener parameters for the serving side.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Interface address to bind.
    pub bind_addr: Ipv4Addr,
    /// Host name advertised in the service URI.
    pub advertise_host: String,
    /// Ports to try.
    pub ports: RangeInclusive<u16>,
    /// Random bind attempts before giving up.
    pub bind_tries: u32,
    /// Connection settings for accepted connections.
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: Ipv4Addr::UNSPECIFIED,
            advertise_host: "127.0.0.1".to_string(),
            ports: 30100..=30399,
            bind_tries: 20,
            connection: ConnectionConfig::server(),
        }
    }
}

impl ServerConfig {
    /// Set the port range.
    pub fn ports(mut self, ports: RangeInclusive<u16>) -> Self {
        self.ports = ports;
        self
    }

    /// Set the address to bind and advertise.
    pub fn bind_addr(mut self, addr: Ipv4Addr) -> Self {
        self.bind_addr = addr;
        self.advertise_host = addr.to_string();
        self
    }
}
