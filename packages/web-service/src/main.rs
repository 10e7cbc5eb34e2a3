// Web service binary: admin API + SQLite persistence + gossip presence.

use std::net::IpAddr;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use runinator_core::config::{Fatal, GossipArgs};
use runinator_core::gossip::{GossipNode, ServiceDirectory, ServiceKind};
use runinator_web_service::build_app;

#[derive(Debug, Parser)]
#[command(name = "runinator-web-service", about = "Task admin API and persistence")]
struct Cli {
    /// Address to bind the HTTP API on
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Port for the HTTP API
    #[arg(long, default_value_t = 8080, env = "PORT")]
    port: u16,

    /// SQLite database URL
    #[arg(long, default_value = "sqlite:runinator.db", env = "DATABASE_URL")]
    database_url: String,

    #[command(flatten)]
    gossip: GossipArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present (development).
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,runinator_web_service=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            tracing::error!(error = %format!("{:#}", fatal.error()), "web service exiting");
            fatal.exit_code()
        }
    }
}

async fn run(cli: Cli) -> Result<(), Fatal> {
    tracing::info!("Starting Runinator web service");

    let options = SqliteConnectOptions::from_str(&cli.database_url)
        .context("invalid database URL")
        .map_err(Fatal::Startup)?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("failed to open database")
        .map_err(Fatal::Startup)?;
    tracing::info!("Database connected");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")
        .map_err(Fatal::Startup)?;
    tracing::info!("Migrations complete");

    let shutdown = CancellationToken::new();
    let gossip_config = cli.gossip.to_config();
    let directory = Arc::new(ServiceDirectory::new(gossip_config.ttl));
    match GossipNode::spawn(
        ServiceKind::WebService,
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

    let app = build_app(pool);
    let addr = format!("{}:{}", cli.bind, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
        .map_err(Fatal::Startup)?;
    tracing::info!("Admin API on http://{addr}");

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
    result.context("API server error").map_err(Fatal::Runtime)?;
    tracing::info!("Web service stopped");
    Ok(())
}
