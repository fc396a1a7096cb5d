//! Multicast listener feeding the registry.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::packet;
use super::registry::{Admission, DiscoveryRegistry, Source};
use crate::config::AnnounceConfig;
use crate::Result;

/// Largest datagram accepted.
pub const MAX_DATAGRAM: usize = 65_536;

const PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// Bind the discovery port and join the group on every configured interface.
pub async fn bind(config: &AnnounceConfig) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port)).await?;
    if config.group.is_multicast() {
        for interface in &config.interfaces {
            socket.join_multicast_v4(config.group, *interface)?;
        }
    }
    info!(group = %config.group, port = config.port, "discovery observer bound");
    Ok(socket)
}

/// Feed every datagram on `socket` to `registry` until shutdown, purging
/// expired descriptors once a second.
///
/// Inflation, parsing and signature checks run on the blocking pool.
pub fn spawn(
    socket: UdpSocket,
    registry: DiscoveryRegistry,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut purge = tokio::time::interval(PURGE_INTERVAL);
        purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = purge.tick() => registry.purge_expired(),
                received = socket.recv_from(&mut buf) => {
                    let (n, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(error = %e, "discovery receive failed");
                            continue;
                        }
                    };
                    trace!(%from, bytes = n, "received announcement");
                    let datagram = buf[..n].to_vec();
                    let registry = registry.clone();
                    let outcome = tokio::task::spawn_blocking(move || {
                        registry.ingest(&packet::decompress(&datagram), Source::Broadcast)
                    })
                    .await;
                    match outcome {
                        Ok(Admission::Admitted) => debug!(%from, "announcement admitted"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "announcement ingest panicked"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("discovery observer shutting down");
                    break;
                }
            }
        }
    })
}
