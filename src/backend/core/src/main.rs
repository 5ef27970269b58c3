//! Eventide - event store maintenance and scheduled command worker.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use eventide_core::{
    commands::{CommandBus, CommandRegistry, InProcessCommandBus},
    config::Config,
    events::{AggregateId, EventLog, EventPersistence, GlobalPosition, InMemoryEventLog, PostgresEventLog},
    jobs::{InMemoryJobStore, JobQueue, JobRegistry, JobServices, JobStore, JobWorker, QueueConfig, RedisJobStore, WorkerConfig},
    sagas::{DispatchToSagas, InMemorySagaStore, SagaTimeoutDispatcher},
    telemetry,
};

/// Eventide - event-sourcing persistence tools
#[derive(Parser)]
#[command(name = "eventide", version, about, propagate_version = true)]
struct Cli {
    /// Configuration file (environment variables `EVENTIDE__*` override it)
    #[arg(short, long, global = true, env = "EVENTIDE_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduled job worker until interrupted.
    ///
    /// Refuses to start unless commands are registered, so it never claims
    /// jobs it cannot decode.
    Worker,

    /// Print every non-system event from a position as JSON lines
    Replay {
        /// Position token to start from (empty for the start of the log)
        #[arg(long, default_value = "")]
        from: String,

        /// Records read per page (defaults to the configured page size)
        #[arg(long)]
        page_size: Option<usize>,
    },

    /// Permanently delete an aggregate's events
    Delete {
        aggregate_id: String,
    },

    /// Apply event log migrations
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };

    let _metrics = telemetry::init_telemetry(&config.telemetry)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Eventide");

    match cli.command {
        Commands::Worker => run_worker(&config).await,
        Commands::Replay { from, page_size } => {
            let page_size = page_size.unwrap_or(config.event_store.page_size);
            replay(&config, GlobalPosition::new(from), page_size).await
        }
        Commands::Delete { aggregate_id } => delete(&config, AggregateId::new(aggregate_id)).await,
        Commands::Migrate => migrate(&config).await,
    }
}

async fn event_log(config: &Config) -> anyhow::Result<Arc<dyn EventLog>> {
    match &config.event_store.database_url {
        Some(url) => {
            let log = PostgresEventLog::connect(url, config.event_store.max_connections)
                .await
                .context("Failed to connect to the event store")?;
            tracing::info!("Connected to PostgreSQL event store");
            Ok(Arc::new(log))
        }
        None => {
            tracing::warn!("No database URL configured, using an in-memory event log");
            Ok(Arc::new(InMemoryEventLog::new()))
        }
    }
}

async fn persistence(config: &Config) -> anyhow::Result<EventPersistence> {
    Ok(EventPersistence::new(event_log(config).await?).with_system_prefix(config.event_store.system_prefix.clone()))
}

async fn run_worker(config: &Config) -> anyhow::Result<()> {
    // Commands are registered by the application embedding the worker.
    let services = JobServices {
        commands: Arc::new(CommandRegistry::new()),
        command_bus: Arc::new(InProcessCommandBus::new()) as Arc<dyn CommandBus>,
        sagas: Arc::new(SagaTimeoutDispatcher::new(Arc::new(InMemorySagaStore::new()))) as Arc<dyn DispatchToSagas>,
    };
    services
        .ensure_commands_registered()
        .context("Refusing to start a worker that would dead-letter every scheduled command")?;

    let store: Arc<dyn JobStore> = match &config.jobs.redis_url {
        Some(url) => {
            let store = RedisJobStore::connect(url, config.jobs.queue_key.clone())
                .await
                .context("Failed to connect to the job store")?;
            tracing::info!(key = store.key(), "Connected to Redis job store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("No Redis URL configured, using an in-memory job store");
            Arc::new(InMemoryJobStore::new())
        }
    };
    let queue = Arc::new(JobQueue::new(store, QueueConfig::from(&config.jobs)));

    let worker = JobWorker::new(
        queue,
        Arc::new(JobRegistry::with_defaults()),
        Arc::new(services),
        WorkerConfig::from(&config.jobs),
    );
    let handle = worker.start();

    shutdown_signal().await;
    handle.shutdown();
    handle.join().await;

    tracing::info!("Worker shutdown complete");
    Ok(())
}

async fn replay(config: &Config, from: GlobalPosition, page_size: usize) -> anyhow::Result<()> {
    let persistence = persistence(config).await?;
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        ctrl_c.cancel();
    });

    let page = persistence.load_all_committed_events(&from, page_size, &cancel).await?;
    for event in &page.events {
        println!("{}", serde_json::to_string(event)?);
    }
    println!(
        "{}",
        serde_json::json!({ "next_global_position": page.next_global_position })
    );

    tracing::info!(events = page.events.len(), "Replay complete");
    Ok(())
}

async fn delete(config: &Config, aggregate_id: AggregateId) -> anyhow::Result<()> {
    let persistence = persistence(config).await?;
    persistence
        .delete_events(&aggregate_id, &CancellationToken::new())
        .await?;

    tracing::info!(aggregate_id = %aggregate_id, "Aggregate deleted");
    Ok(())
}

async fn migrate(config: &Config) -> anyhow::Result<()> {
    let url = config
        .event_store
        .database_url
        .as_deref()
        .context("EVENTIDE__EVENT_STORE__DATABASE_URL is not set")?;

    let log = PostgresEventLog::connect(url, config.event_store.max_connections).await?;
    log.migrate().await?;

    tracing::info!("Event log migrations applied");
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
