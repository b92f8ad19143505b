//! LedgerMirror CLI: run the indexer and operate its recovery surface.
//!
//! # Commands
//! ```text
//! ledgermirror run
//! ledgermirror status
//! ledgermirror config
//! ledgermirror reset-worker      --worker <name> --height <h>
//! ledgermirror redirect-backward --height <h>
//! ledgermirror reprocess         --worker <name> --from <h> --to <h> [--chunk-size N] [--concurrency N]
//! ledgermirror errors            [--worker <name>] [--limit N]
//! ledgermirror skipped           [--worker <name>]
//! ledgermirror resolve-errors    --worker <name>
//! ```
//!
//! Every command prints JSON on stdout; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ledgermirror_core::config::{LogConfig, PipelineConfig};
use ledgermirror_ingest::oracle::HttpScriptOracle;
use ledgermirror_ingest::pipeline::{Pipeline, PipelineBuilder};
use ledgermirror_ingest::reader::HttpChainReader;
use ledgermirror_ingest::stores::Stores;
use ledgermirror_storage::{InMemoryStorage, PostgresStorage};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "ledgermirror",
    about = "Checkpoint-driven ledger mirror and indexer",
    long_about = "
LedgerMirror mirrors raw blocks into a database and derives indexed tables
from them with resumable, lease-based workers.

ENVIRONMENT VARIABLES:
  DB_URL                      Postgres URL (in-memory storage when unset)
  CHAIN_URL                   Access node base URL
  LOG_LEVEL, LOG_JSON         Logging overrides
  ENABLE_FORWARD_INGESTER     true/false
  ENABLE_HISTORY_INGESTER     true/false
  HISTORY_FLOOR               Lowest height the backward ingester fetches
  ENABLE_<WORKER>             e.g. ENABLE_TOKEN_WORKER=false
  <WORKER>_RANGE              Chunk size, e.g. TOKEN_WORKER_RANGE=500
  <WORKER>_CONCURRENCY        Parallel chunks per worker
",
    version
)]
struct Cli {
    /// YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging for the ledgermirror crates
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run ingesters, workers and the metadata enricher until Ctrl-C
    Run,

    /// Checkpoint heights of every ingester and worker
    Status,

    /// Print the effective configuration after env overrides
    Config,

    /// Rewind a worker's checkpoint and drop its leases from that height on
    #[command(name = "reset-worker")]
    ResetWorker {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        height: u64,
    },

    /// Point the backward ingester at a height
    #[command(name = "redirect-backward")]
    RedirectBackward {
        #[arg(long)]
        height: u64,
    },

    /// Re-run a worker over [from, to) and wait for the job to finish
    Reprocess {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        from: u64,
        #[arg(long)]
        to: u64,
        #[arg(long, default_value_t = 1_000)]
        chunk_size: u64,
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },

    /// Unresolved errors, newest first, with a message histogram
    Errors {
        #[arg(long)]
        worker: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Unresolved skipped ranges
    Skipped {
        #[arg(long)]
        worker: Option<String>,
    },

    /// Mark a worker's errors and skipped ranges resolved
    #[command(name = "resolve-errors")]
    ResolveErrors {
        #[arg(long)]
        worker: String,
    },
}

fn init_tracing(log: &LogConfig, verbose: bool) {
    let mut directives = log.directives();
    if verbose {
        directives.push_str(",ledgermirror_core=debug,ledgermirror_ingest=debug,ledgermirror_storage=debug");
    }
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));

    if log.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

async fn open_stores(config: &PipelineConfig) -> Result<Stores> {
    match &config.database_url {
        Some(url) => {
            let storage = PostgresStorage::connect(url)
                .await
                .context("connecting to postgres")?;
            Ok(Stores::shared(Arc::new(storage)))
        }
        None => {
            warn!("DB_URL not set, using in-memory storage; nothing will persist");
            Ok(Stores::shared(Arc::new(InMemoryStorage::new())))
        }
    }
}

/// Build the pipeline. Admin commands never ingest, so they do not need a
/// chain URL.
async fn build_pipeline(config: &PipelineConfig, ingesting: bool) -> Result<Pipeline> {
    let mut effective = config.clone();
    if config.chain_url.is_none() {
        if ingesting {
            bail!("CHAIN_URL (or chain_url in the config file) is required to run");
        }
        effective.forward_ingester.enabled = false;
        effective.backward_ingester.enabled = false;
    }

    let stores = open_stores(config).await?;
    let mut builder = PipelineBuilder::new(effective).stores(stores);
    if let Some(url) = &config.chain_url {
        builder = builder.reader(Arc::new(HttpChainReader::new(url.as_str(), HTTP_TIMEOUT)?));
        if config.oracle.enabled {
            let timeout = Duration::from_secs(config.oracle.timeout_secs);
            builder = builder.oracle(Arc::new(HttpScriptOracle::new(url.as_str(), timeout)?));
        }
    }
    Ok(builder.build()?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config.log, cli.verbose);

    match cli.command {
        Commands::Config => print_json(&config)?,

        Commands::Run => {
            let pipeline = build_pipeline(&config, true).await?;
            let cancel = CancellationToken::new();
            let stopper = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested, draining in-flight chunks");
                    stopper.cancel();
                }
            });
            pipeline.run(cancel).await?;
        }

        Commands::Status => {
            let pipeline = build_pipeline(&config, false).await?;
            print_json(&pipeline.status().snapshot().await?)?;
        }

        Commands::ResetWorker { worker, height } => {
            let pipeline = build_pipeline(&config, false).await?;
            print_json(&pipeline.recovery().reset_worker_to_height(&worker, height).await?)?;
        }

        Commands::RedirectBackward { height } => {
            let pipeline = build_pipeline(&config, false).await?;
            print_json(&pipeline.recovery().redirect_backward_ingester(height).await?)?;
        }

        Commands::Reprocess { worker, from, to, chunk_size, concurrency } => {
            let pipeline = build_pipeline(&config, false).await?;
            let recovery = pipeline.recovery();
            let ticket = recovery.reprocess_worker(&worker, from, to, chunk_size, concurrency)?;
            let job = recovery
                .job(ticket.job_id)
                .context("reprocess job vanished from the registry")?;
            tokio::select! {
                _ = job.wait() => {}
                _ = tokio::signal::ctrl_c() => {
                    warn!(job_id = %ticket.job_id, "cancelling reprocess job");
                    recovery.cancel_job(ticket.job_id);
                    job.wait().await;
                }
            }
            print_json(&job.snapshot())?;
        }

        Commands::Errors { worker, limit } => {
            let pipeline = build_pipeline(&config, false).await?;
            print_json(&pipeline.recovery().list_errors(worker.as_deref(), limit).await?)?;
        }

        Commands::Skipped { worker } => {
            let pipeline = build_pipeline(&config, false).await?;
            print_json(&pipeline.recovery().list_skipped_ranges(worker.as_deref()).await?)?;
        }

        Commands::ResolveErrors { worker } => {
            let pipeline = build_pipeline(&config, false).await?;
            print_json(&pipeline.recovery().resolve_errors(&worker).await?)?;
        }
    }
    Ok(())
}
