//! Shared CLI argument groups and process exit conventions.
//!
//! Each service binary flattens the groups it needs into its own clap
//! parser, so flags and env fallbacks stay identical across processes.

use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::api::Endpoint;
use crate::gossip::{GossipConfig, ServiceDirectory, ServiceKind};

/// Gossip flags shared by every service.
#[derive(Debug, Clone, Args)]
pub struct GossipArgs {
    /// Address to bind the gossip UDP socket on
    #[arg(long, default_value = "127.0.0.1", env = "RUNINATOR_GOSSIP_BIND")]
    pub gossip_bind: IpAddr,

    /// Port to bind the gossip UDP socket on
    #[arg(long, default_value_t = crate::gossip::DEFAULT_GOSSIP_PORT, env = "RUNINATOR_GOSSIP_PORT")]
    pub gossip_port: u16,

    /// Peers to announce to, as a comma-separated list of host:port
    #[arg(long, value_delimiter = ',')]
    pub gossip_targets: Vec<SocketAddr>,

    /// Address to advertise in announcements; peers fall back to the
    /// datagram source address when omitted
    #[arg(long)]
    pub announce_address: Option<String>,
}

impl GossipArgs {
    pub fn to_config(&self) -> GossipConfig {
        GossipConfig {
            bind: self.gossip_bind,
            port: self.gossip_port,
            targets: self.gossip_targets.clone(),
            announce_address: self.announce_address.clone(),
            ..GossipConfig::default()
        }
    }
}

/// Web service client flags.
#[derive(Debug, Clone, Args)]
pub struct ApiArgs {
    /// Fixed web service base URL; discovered over gossip when omitted
    #[arg(long)]
    pub api_base_url: Option<String>,

    /// Timeout for control-plane calls to the web service
    #[arg(long, default_value_t = 30)]
    pub api_timeout_seconds: u64,
}

impl ApiArgs {
    /// Resolve the endpoint: the fixed URL when given, otherwise the
    /// gossip-selected web service.
    pub fn endpoint(&self, directory: &Arc<ServiceDirectory>) -> Endpoint {
        match &self.api_base_url {
            Some(url) => Endpoint::fixed(url),
            None => Endpoint::Discovered(directory.subscribe(ServiceKind::WebService)),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_seconds)
    }
}

/// Which binding of the broker contract a process uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BrokerBackend {
    /// Talk to a broker process over its HTTP control plane.
    Http,
    /// Run the firing queue inside this process.
    InMemory,
}

/// Broker client flags shared by scheduler and worker.
#[derive(Debug, Clone, Args)]
pub struct BrokerClientArgs {
    /// Fixed broker base URL; discovered over gossip when omitted
    #[arg(long)]
    pub broker_endpoint: Option<String>,

    /// Broker binding to use
    #[arg(long, value_enum, default_value_t = BrokerBackend::Http)]
    pub broker_backend: BrokerBackend,
}

impl BrokerClientArgs {
    pub fn endpoint(&self, directory: &Arc<ServiceDirectory>) -> Endpoint {
        match &self.broker_endpoint {
            Some(url) => Endpoint::fixed(url),
            None => Endpoint::Discovered(directory.subscribe(ServiceKind::Broker)),
        }
    }
}

/// A fatal service error, classified for the process exit code:
/// startup failures exit 1, unrecoverable runtime failures exit 2.
#[derive(Debug)]
pub enum Fatal {
    Startup(anyhow::Error),
    Runtime(anyhow::Error),
}

impl Fatal {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Fatal::Startup(_) => ExitCode::from(1),
            Fatal::Runtime(_) => ExitCode::from(2),
        }
    }

    pub fn error(&self) -> &anyhow::Error {
        match self {
            Fatal::Startup(e) | Fatal::Runtime(e) => e,
        }
    }
}
