// Importer binary: read a JSON array of task definitions and create each
// one through the web service.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use runinator_core::api::{ApiClient, Endpoint};
use runinator_core::config::ApiArgs;
use runinator_core::cron::CronSchedule;
use runinator_core::model::NewScheduledTask;

#[derive(Debug, Parser)]
#[command(name = "runinator-importer", about = "Bulk-load task definitions")]
struct Cli {
    /// JSON file holding an array of task definitions
    #[arg(long)]
    file: PathBuf,

    /// Keep going when a task is rejected instead of stopping at the first
    /// failure
    #[arg(long)]
    keep_going: bool,

    #[command(flatten)]
    api: ApiArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(Cli::parse()).await {
        Ok(failed) if failed == 0 => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "import failed");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<usize> {
    let base_url = cli
        .api
        .api_base_url
        .as_deref()
        .context("--api-base-url is required")?;
    let client = ApiClient::new(Endpoint::fixed(base_url), cli.api.timeout())?;

    let raw = std::fs::read_to_string(&cli.file)
        .with_context(|| format!("failed to read {}", cli.file.display()))?;
    let tasks: Vec<NewScheduledTask> =
        serde_json::from_str(&raw).context("file is not a JSON array of task definitions")?;
    tracing::info!(count = tasks.len(), file = %cli.file.display(), "importing tasks");

    let mut created = 0usize;
    let mut failed = 0usize;
    for task in tasks {
        // Validate locally first so an obviously broken definition is
        // reported with its name rather than a bare HTTP status.
        if let Err(e) = CronSchedule::parse(&task.cron_schedule) {
            tracing::error!(task = %task.name, error = %e, "invalid cron expression");
            failed += 1;
            if !cli.keep_going {
                anyhow::bail!("aborting after invalid task '{}'", task.name);
            }
            continue;
        }

        match client.create_task(&task).await {
            Ok(id) => {
                tracing::info!(task = %task.name, id, "task created");
                created += 1;
            }
            Err(e) => {
                tracing::error!(task = %task.name, error = %e, "task rejected");
                failed += 1;
                if !cli.keep_going {
                    anyhow::bail!("aborting after rejected task '{}'", task.name);
                }
            }
        }
    }

    tracing::info!(created, failed, "import complete");
    Ok(failed)
}
