// Broker binary: firing queue + HTTP control plane + gossip presence.

use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use runinator_broker::{sweep_loop, FiringQueue};
use runinator_core::config::{Fatal, GossipArgs};
use runinator_core::gossip::{GossipNode, ServiceDirectory, ServiceKind};

#[derive(Debug, Parser)]
#[command(name = "runinator-broker", about = "Claim-once firing queue")]
struct Cli {
    /// Address to bind the HTTP control plane on
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Port for the HTTP control plane
    #[arg(long, default_value_t = 5500, env = "RUNINATOR_BROKER_PORT")]
    port: u16,

    /// Attempts after which a firing is dead-lettered
    #[arg(long, default_value_t = runinator_broker::queue::DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    #[command(flatten)]
    gossip: GossipArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,runinator_broker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            tracing::error!(error = %format!("{:#}", fatal.error()), "broker exiting");
            fatal.exit_code()
        }
    }
}

async fn run(cli: Cli) -> Result<(), Fatal> {
    tracing::info!("Starting Runinator broker");

    let queue = Arc::new(FiringQueue::with_max_attempts(cli.max_attempts));
    let shutdown = CancellationToken::new();

    tokio::spawn(sweep_loop(
        queue.clone(),
        runinator_broker::queue::SWEEP_INTERVAL,
        shutdown.clone(),
    ));

    // Gossip is best-effort: a failed bind loses discovery, not the broker.
    let gossip_config = cli.gossip.to_config();
    let directory = Arc::new(ServiceDirectory::new(gossip_config.ttl));
    match GossipNode::spawn(
        ServiceKind::Broker,
        cli.port,
        gossip_config,
        directory,
        shutdown.clone(),
    )
    .await
    {
        Ok(node) => tracing::info!(service_id = node.service_id(), "gossip announcing"),
        Err(e) => tracing::warn!(error = %e, "gossip disabled"),
    }

    let app = runinator_broker::http::build_router(queue);
    let addr = format!("{}:{}", cli.bind, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
        .map_err(Fatal::Startup)?;
    tracing::info!("Broker control plane on http://{addr}");

    let serve_shutdown = shutdown.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = serve_shutdown.cancelled() => {}
            }
        })
        .await;

    shutdown.cancel();
    result.context("control plane server error").map_err(Fatal::Runtime)?;
    tracing::info!("Broker stopped");
    Ok(())
}
