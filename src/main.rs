//! # Threadwatch entry point

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use threadwatch::{
    config::{AppConfig, ConfigLoader},
    connectors::{ChatReplier, ErrorMonitor, GitHubTracker, HttpLlm, MattermostReplier, SentryMonitor},
    db,
    pipeline::{Pipeline, PipelineParts, PipelineSettings, TriggerReceiver},
    repositories::IssueRecordRepository,
    server::{AppState, run_server},
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "threadwatch", version, about = "Turns chat threads into tracker issues")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the webhook server and the pipeline (default)
    Serve,
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;
    if let Ok(redacted) = config.redacted_json() {
        info!(profile = %config.profile, configuration = %redacted, "Configuration loaded");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    db::run_migrations(&db).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => Ok(()),
        Command::Serve => serve(config, db).await,
    }
}

fn build_pipeline(config: &AppConfig, db: &DatabaseConnection) -> Result<(Pipeline, TriggerReceiver)> {
    let llm = HttpLlm::new(&config.llm).context("configuring LLM client")?;
    let tracker = GitHubTracker::new(&config.tracker).context("configuring issue tracker")?;
    let monitor = SentryMonitor::from_config(&config.monitoring)
        .context("configuring error monitor")?
        .map(|monitor| Arc::new(monitor) as Arc<dyn ErrorMonitor>);
    let replier = MattermostReplier::from_config(&config.chat)
        .context("configuring chat replies")?
        .map(|replier| Arc::new(replier) as Arc<dyn ChatReplier>);

    if monitor.is_none() {
        info!("Error monitoring not configured, enrichment disabled");
    }
    if replier.is_none() {
        info!("Chat API not configured, replies disabled");
    }

    let parts = PipelineParts {
        settings: PipelineSettings::from_config(config),
        llm: Arc::new(llm),
        tracker: Arc::new(tracker),
        store: Arc::new(IssueRecordRepository::new(Arc::new(db.clone()))),
        monitor,
        replier,
    };
    Ok(Pipeline::new(parts)?)
}

async fn serve(config: AppConfig, db: DatabaseConnection) -> Result<()> {
    let (pipeline, triggers) = build_pipeline(&config, &db)?;
    let shutdown = CancellationToken::new();

    let worker = tokio::spawn(pipeline.clone().run(triggers, shutdown.clone()));

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                signal.cancel();
            }
            Err(error) => error!(%error, "Failed to listen for shutdown signal"),
        }
    });

    let state = AppState {
        db,
        pipeline,
        webhook_token: config.chat.webhook_token.as_deref().map(Into::into),
    };
    let served = run_server(&config, state, shutdown.clone()).await;
    shutdown.cancel();
    if let Err(error) = worker.await {
        error!(%error, "Pipeline worker panicked");
    }
    served
}
