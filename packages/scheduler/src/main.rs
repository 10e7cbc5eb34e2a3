// Scheduler binary: cron ticks into broker firings.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use runinator_broker::{sweep_loop, FiringQueue};
use runinator_core::api::ApiClient;
use runinator_core::broker::{FiringBroker, HttpBroker};
use runinator_core::config::{ApiArgs, BrokerBackend, BrokerClientArgs, Fatal, GossipArgs};
use runinator_core::gossip::{GossipNode, ServiceDirectory, ServiceKind};
use runinator_scheduler::{SchedulerConfig, SchedulerService};

#[derive(Debug, Parser)]
#[command(name = "runinator-scheduler", about = "Cron tick loop")]
struct Cli {
    /// Seconds between scheduler ticks
    #[arg(long, default_value_t = 1)]
    poll_interval_seconds: u64,

    #[command(flatten)]
    api: ApiArgs,

    #[command(flatten)]
    broker: BrokerClientArgs,

    #[command(flatten)]
    gossip: GossipArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,runinator_scheduler=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            tracing::error!(error = %format!("{:#}", fatal.error()), "scheduler exiting");
            fatal.exit_code()
        }
    }
}

async fn run(cli: Cli) -> Result<(), Fatal> {
    tracing::info!("Starting Runinator scheduler");
    let shutdown = CancellationToken::new();

    let gossip_config = cli.gossip.to_config();
    let directory = Arc::new(ServiceDirectory::new(gossip_config.ttl));
    match GossipNode::spawn(
        ServiceKind::Scheduler,
        cli.gossip.gossip_port,
        gossip_config,
        directory.clone(),
        shutdown.clone(),
    )
    .await
    {
        Ok(node) => tracing::info!(service_id = node.service_id(), "gossip announcing"),
        Err(e) => tracing::warn!(error = %e, "gossip disabled"),
    }

    let broker: Arc<dyn FiringBroker> = match cli.broker.broker_backend {
        BrokerBackend::Http => Arc::new(
            HttpBroker::new(cli.broker.endpoint(&directory), cli.api.timeout())
                .map_err(|e| Fatal::Startup(e.into()))?,
        ),
        BrokerBackend::InMemory => {
            let queue = Arc::new(FiringQueue::new());
            tokio::spawn(sweep_loop(
                queue.clone(),
                runinator_broker::queue::SWEEP_INTERVAL,
                shutdown.clone(),
            ));
            queue
        }
    };

    let tasks = Arc::new(
        ApiClient::new(cli.api.endpoint(&directory), cli.api.timeout())
            .map_err(|e| Fatal::Startup(e.into()))?,
    );

    let scheduler = SchedulerService::with_config(
        tasks,
        broker,
        SchedulerConfig {
            tick_interval: std::time::Duration::from_secs(cli.poll_interval_seconds.max(1)),
        },
    );

    let loop_shutdown = shutdown.clone();
    let handle = tokio::spawn(scheduler.run(loop_shutdown));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Fatal::Runtime(e.into()))?;
    tracing::info!("shutdown signal received");
    shutdown.cancel();
    handle.await.map_err(|e| Fatal::Runtime(e.into()))?;

    tracing::info!("Scheduler stopped");
    Ok(())
}
