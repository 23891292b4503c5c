//! CLI command definitions and process wiring.
//!
//! Three entrypoints share one binary: the queue worker, the change feed
//! watcher, and a one-shot migration runner. All of them read their
//! connection settings from the environment.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::info;

use crate::cluster::{ChangeFeedWatcher, KubeReconciler};
use crate::config::AppConfig;
use crate::queue::{ConsumerRuntime, RedisBroker, UpdatePublisher};
use crate::store::Database;
use crate::worker;

/// Asynchronous Kubernetes deployment pipeline.
#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Queue-driven Kubernetes deployment pipeline")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the queue worker processing deployment requests and change events.
    Worker,

    /// Run the change feed watcher publishing cluster changes.
    Watcher,

    /// Apply database migrations and exit.
    Migrate,
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses CLI arguments and runs the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Runs the selected command with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    match cli.command {
        Commands::Worker => run_worker(config).await,
        Commands::Watcher => run_watcher(config).await,
        Commands::Migrate => run_migrate(config).await,
    }
}

async fn run_migrate(config: AppConfig) -> anyhow::Result<()> {
    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!("migrations applied");
    Ok(())
}

async fn run_worker(config: AppConfig) -> anyhow::Result<()> {
    let database = Arc::new(Database::connect(&config.database_url).await?);
    database.run_migrations().await?;

    let broker = RedisBroker::connect(
        &config.redis_url,
        &config.request_channel,
        &config.update_channel,
    )
    .await?;
    let reconciler = Arc::new(KubeReconciler::connect(&config.manager_tag).await?);

    let mut runtime =
        ConsumerRuntime::new(broker, &config.consumer_group, config.shutdown_timeout);
    worker::register_routes(
        &mut runtime,
        &config,
        database.clone(),
        database.clone(),
        reconciler,
    );

    runtime.start().await?;
    info!(
        group = %config.consumer_group,
        request_channel = %config.request_channel,
        update_channel = %config.update_channel,
        "worker started"
    );

    tokio::signal::ctrl_c().await?;
    runtime.shutdown().await?;
    Ok(())
}

async fn run_watcher(config: AppConfig) -> anyhow::Result<()> {
    let broker = RedisBroker::connect(
        &config.redis_url,
        &config.request_channel,
        &config.update_channel,
    )
    .await?;
    let publisher: Arc<dyn UpdatePublisher> = Arc::new(broker);

    let client = kube::Client::try_default().await?;
    let watcher = ChangeFeedWatcher::new(
        client,
        &config.manager_tag,
        publisher,
        config.resync_interval,
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(async move { watcher.run(shutdown_rx).await });
    info!(manager_tag = %config.manager_tag, "watcher started");

    tokio::signal::ctrl_c().await?;
    let _ = shutdown_tx.send(());
    handle.await??;
    Ok(())
}
