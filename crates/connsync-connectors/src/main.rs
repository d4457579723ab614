//! connsync - connector sync daemon

use anyhow::{Context, Result};
use clap::Parser;
use connsync_common::logging::{init_logging, LogConfig, LogLevel};
use connsync_connectors::ConnectorRegistry;
use connsync_engine::checkpoint::{CheckpointStore, PgCheckpointStore};
use connsync_engine::connector::PassthroughRequest;
use connsync_engine::ledger::PgRunLedger;
use connsync_engine::{db, Config, Scheduler};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "connsync")]
#[command(author, version, about = "Connector sync daemon")]
struct Cli {
    /// Config file (defaults to connsync.toml)
    #[arg(short, long, env = "CONNSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run one pipeline once
    Run {
        #[arg(short, long)]
        pipeline: String,
    },

    /// Run due pipelines until interrupted
    Schedule,

    /// Delete a pipeline's checkpoint so the next run starts from scratch
    Reset {
        #[arg(short, long)]
        pipeline: String,
    },

    /// Send a raw request through a pipeline's source connector
    Passthrough {
        #[arg(short, long)]
        pipeline: String,

        #[arg(short, long, default_value = "GET")]
        method: String,

        /// Path relative to the connector's base URL
        path: String,

        /// Query parameter as key=value, repeatable
        #[arg(short, long = "query")]
        query: Vec<String>,

        /// JSON request body
        #[arg(short, long)]
        body: Option<String>,
    },
}

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current commit");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging based on verbose flag
    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("connsync")
        .build()
        // Environment variables take precedence
        .merge_env()?;

    init_logging(&log_config)?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let pool = db::create_pool(&config.database)
        .await
        .context("Failed to connect to database")?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(PgCheckpointStore::new(pool.clone()));
    let registry = Arc::new(ConnectorRegistry::new(pool.clone(), config.destination.clone()));
    let token = CancellationToken::new();

    match cli.command {
        Command::Run { pipeline } => {
            let pipeline = config
                .pipeline(&pipeline)
                .with_context(|| format!("Unknown pipeline '{}'", pipeline))?;
            let scheduler = Scheduler::new(
                &config,
                registry,
                store,
                Arc::new(PgRunLedger::new(pool)),
            )
            .with_cancellation(token.clone());
            cancel_on_ctrl_c(token);

            let result = scheduler.run_pipeline(pipeline).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if let Some(kind) = result.error {
                anyhow::bail!(
                    "Pipeline '{}' failed ({}): {}",
                    pipeline.id,
                    kind,
                    result.error_message.unwrap_or_default()
                );
            }
        },
        Command::Schedule => {
            let scheduler = Scheduler::new(
                &config,
                registry,
                store,
                Arc::new(PgRunLedger::new(pool)),
            )
            .with_cancellation(token.clone());
            cancel_on_ctrl_c(token);

            scheduler.run_forever().await;
        },
        Command::Reset { pipeline } => {
            if store.delete(&pipeline).await? {
                info!(pipeline = %pipeline, "Checkpoint deleted");
            } else {
                info!(pipeline = %pipeline, "No checkpoint stored");
            }
        },
        Command::Passthrough {
            pipeline,
            method,
            path,
            query,
            body,
        } => {
            let pipeline = config
                .pipeline(&pipeline)
                .with_context(|| format!("Unknown pipeline '{}'", pipeline))?;
            let connector = registry.passthrough(&pipeline.source)?;

            let mut request = PassthroughRequest {
                method,
                path,
                ..PassthroughRequest::default()
            };
            for pair in query {
                let (key, value) = pair
                    .split_once('=')
                    .with_context(|| format!("Query parameter '{}' is not key=value", pair))?;
                request = request.with_query(key, value);
            }
            if let Some(body) = body {
                request.body = Some(serde_json::from_str(&body).context("Body is not valid JSON")?);
            }

            let response = connector.passthrough(request).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        },
    }

    Ok(())
}
