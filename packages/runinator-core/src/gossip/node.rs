//! The gossip node: one UDP socket, an announce task, and a receive task.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{GossipDatagram, ServiceDirectory, ServiceKind};
use crate::error::RuninatorError;
use crate::model::ServiceAnnouncement;

/// Default announcement cadence.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);
/// Default announcement expiry.
pub const ANNOUNCE_TTL_SECS: i64 = 10;
/// Default gossip port.
pub const DEFAULT_GOSSIP_PORT: u16 = 5504;

/// Gossip socket and announcement settings.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Address the UDP socket binds on.
    pub bind: IpAddr,
    /// Port the UDP socket binds on.
    pub port: u16,
    /// Peers to announce to (unicast fan-out).
    pub targets: Vec<SocketAddr>,
    /// Address advertised in outgoing announcements. Left blank, receivers
    /// substitute the datagram's source address.
    pub announce_address: Option<String>,
    /// How often to announce.
    pub announce_interval: Duration,
    /// How long peers keep an announcement alive.
    pub ttl: chrono::Duration,
    /// Base path advertised for this service's HTTP surface.
    pub base_path: String,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_GOSSIP_PORT,
            targets: Vec::new(),
            announce_address: None,
            announce_interval: ANNOUNCE_INTERVAL,
            ttl: chrono::Duration::seconds(ANNOUNCE_TTL_SECS),
            base_path: String::new(),
        }
    }
}

/// A running gossip participant.
///
/// Owns a bound UDP socket shared by the announce and receive tasks. Both
/// stop when the shutdown token fires.
pub struct GossipNode {
    service_id: String,
    local_addr: SocketAddr,
}

impl GossipNode {
    /// Bind the socket and start announcing and absorbing.
    ///
    /// `advertised_port` is the port written into outgoing announcements —
    /// the service's HTTP port for broker/web service, the gossip port for
    /// presence-only processes. A bind failure is returned to the caller;
    /// by contract it disables discovery only, not the hosting process.
    pub async fn spawn(
        kind: ServiceKind,
        advertised_port: u16,
        config: GossipConfig,
        directory: Arc<ServiceDirectory>,
        shutdown: CancellationToken,
    ) -> Result<GossipNode, RuninatorError> {
        let socket = UdpSocket::bind((config.bind, config.port))
            .await
            .map_err(|e| {
                RuninatorError::Config(format!(
                    "gossip bind {}:{} failed: {e}",
                    config.bind, config.port
                ))
            })?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| RuninatorError::Config(format!("gossip local addr: {e}")))?;
        let socket = Arc::new(socket);
        let service_id = Uuid::new_v4().to_string();

        tokio::spawn(announce_loop(
            socket.clone(),
            kind,
            service_id.clone(),
            advertised_port,
            config.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(receive_loop(socket, directory, shutdown));

        Ok(GossipNode {
            service_id,
            local_addr,
        })
    }

    /// This node's announcement id.
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// The address the UDP socket actually bound (port 0 resolved).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn announce_loop(
    socket: Arc<UdpSocket>,
    kind: ServiceKind,
    service_id: String,
    advertised_port: u16,
    config: GossipConfig,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.announce_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let datagram = GossipDatagram {
            kind,
            service: ServiceAnnouncement {
                service_id: service_id.clone(),
                address: config.announce_address.clone().unwrap_or_default(),
                port: advertised_port,
                base_path: config.base_path.clone(),
                last_heartbeat: Utc::now(),
            },
        };
        let payload = match serde_json::to_vec(&datagram) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode announcement");
                continue;
            }
        };
        for target in &config.targets {
            if let Err(e) = socket.send_to(&payload, target).await {
                debug!(target = %target, error = %e, "announcement send failed");
            }
        }
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    directory: Arc<ServiceDirectory>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; 8192];
    loop {
        let (len, src) = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "gossip receive failed");
                    continue;
                }
            },
        };

        // Garbage on the wire is nobody's problem.
        let Ok(datagram) = serde_json::from_slice::<GossipDatagram>(&buf[..len]) else {
            continue;
        };
        let mut service = datagram.service;
        if service.address.is_empty() {
            service.address = src.ip().to_string();
        }
        if service.service_id.is_empty() {
            service.service_id = format!("{}:{}", service.address, service.port);
        }
        debug!(
            kind = datagram.kind.as_str(),
            service_id = %service.service_id,
            address = %service.address,
            port = service.port,
            "absorbed announcement"
        );
        directory.observe(datagram.kind, service);
    }
}
