//! Periodic multicast announcements.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::descriptor::DescriptorBuilder;
use super::packet;
use crate::config::AnnounceConfig;
use crate::Result;

/// Sends one signed blob per interface to the discovery group.
///
/// Interfaces are the keys registered with
/// [`DescriptorBuilder::add_address`]; keys that parse as IPv4 addresses
/// are used as the source address.
pub struct Announcer {
    builder: Arc<DescriptorBuilder>,
    config: AnnounceConfig,
    task_handle: Option<JoinHandle<()>>,
}

impl Announcer {
    /// Announcer for `builder`.
    pub fn new(builder: Arc<DescriptorBuilder>, config: AnnounceConfig) -> Self {
        Self {
            builder,
            config,
            task_handle: None,
        }
    }

    /// Descriptor builder.
    pub fn builder(&self) -> &Arc<DescriptorBuilder> {
        &self.builder
    }

    /// Send one round. Returns the number of datagrams sent.
    pub async fn announce_once(&self, withdrawing: bool) -> Result<usize> {
        send_round(&self.builder, &self.config, withdrawing).await
    }

    /// Start announcing every `send_interval`. On shutdown the withdrawing
    /// burst is sent before the task exits.
    pub fn start(&mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        if self.task_handle.is_some() {
            warn!("Announcer already started");
            return;
        }
        let builder = Arc::clone(&self.builder);
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            info!(
                identity = %builder.instance(),
                group = %config.group,
                port = config.port,
                "starting service announcer"
            );
            let mut interval = tokio::time::interval(config.send_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = send_round(&builder, &config, false).await {
                            error!(error = %e, "failed to send announcement");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("service announcer withdrawing");
                        withdraw_burst(&builder, &config).await;
                        break;
                    }
                }
            }
        });
        self.task_handle = Some(handle);
    }

    /// Stop periodic announcements and send the withdrawing burst.
    pub async fn withdraw(&mut self) {
        self.stop().await;
        withdraw_burst(&self.builder, &self.config).await;
    }

    /// Stop the background task without withdrawing.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn withdraw_burst(builder: &DescriptorBuilder, config: &AnnounceConfig) {
    for round in 0..=config.withdraw_repeats {
        if round > 0 {
            tokio::time::sleep(config.withdraw_spacing).await;
        }
        if let Err(e) = send_round(builder, config, true).await {
            warn!(error = %e, "failed to send withdrawal");
        }
    }
}

async fn send_round(
    builder: &DescriptorBuilder,
    config: &AnnounceConfig,
    withdrawing: bool,
) -> Result<usize> {
    let dest = SocketAddrV4::new(config.group, config.port);
    let mut sent = 0;
    for interface in builder.interfaces() {
        let blob = builder.blob_for(&interface, withdrawing)?;
        let source: Ipv4Addr = interface.parse().unwrap_or(Ipv4Addr::UNSPECIFIED);
        let socket = UdpSocket::bind(SocketAddrV4::new(source, 0)).await?;
        if config.group.is_multicast() {
            socket.set_multicast_loop_v4(true)?;
        }
        let datagram = packet::compress(&blob)?;
        socket.send_to(&datagram, dest).await?;
        debug!(%interface, bytes = datagram.len(), withdrawing, "sent announcement");
        sent += 1;
    }
    Ok(sent)
}
