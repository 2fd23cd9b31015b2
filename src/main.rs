//! # docpipe CLI
//!
//! The `docpipe` binary hosts pipeline invocations. It stands in for the
//! event runtime: feed it a notification document (or a single object
//! reference) and it runs one independent invocation per object.
//!
//! ## Usage
//!
//! ```bash
//! docpipe --config ./config/docpipe.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docpipe init` | Create the SQLite database and schema |
//! | `docpipe handle <EVENT_JSON\|->` | Process a notification document |
//! | `docpipe process <BUCKET> <KEY>` | Process one object |
//! | `docpipe get <ID>` | Print a stored record |
//! | `docpipe list` | Print stored records, newest first |
//!
//! Logs go to stderr (`RUST_LOG` filters, default `info`); command output
//! goes to stdout as JSON.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docpipe::aws::AwsCredentials;
use docpipe::config::{self, Config};
use docpipe::model::BedrockModel;
use docpipe::models::DocumentEvent;
use docpipe::object_store::S3ObjectStore;
use docpipe::pipeline::{self, Pipeline, PipelineOutcome};
use docpipe::store::{DocumentStore, SqliteStore};
use docpipe::{db, migrate};

/// docpipe: turn uploaded documents into stored text and summaries.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docpipe.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docpipe",
    about = "docpipe: an event-driven document extraction and summarization pipeline",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docpipe.toml")]
    config: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the documents table. This
    /// command is idempotent.
    Init,

    /// Process an object-created notification document.
    ///
    /// Runs one invocation per `aws:s3` record and prints the handler
    /// response as JSON.
    Handle {
        /// Path to the notification JSON, or `-` for stdin.
        event: String,
    },

    /// Process a single object.
    Process {
        bucket: String,
        key: String,

        /// Object version to fetch.
        #[arg(long)]
        version: Option<String>,
    },

    /// Print a stored record by document ID.
    Get {
        /// Document ID (hex SHA-256 of bucket, key and version).
        id: String,
    },

    /// Print stored records, most recently processed first.
    List {
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn init_tracing(format: LogFormat) {
    let json = format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

async fn open_store(cfg: &Config) -> Result<SqliteStore> {
    let pool = db::connect(cfg).await?;
    migrate::apply(&pool).await?;
    Ok(SqliteStore::new(pool))
}

async fn build_pipeline(cfg: &Config) -> Result<Arc<Pipeline>> {
    let creds = AwsCredentials::from_env()?;
    let objects = Arc::new(S3ObjectStore::new(&cfg.object_store, creds.clone())?);
    let model = Arc::new(BedrockModel::new(&cfg.model, creds)?);
    let documents = Arc::new(open_store(cfg).await?);
    Ok(Arc::new(Pipeline::new(cfg, objects, model, documents)))
}

fn read_event(source: &str) -> Result<String> {
    if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read notification from stdin")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("Failed to read notification file: {}", source))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Handle { event } => {
            let json = read_event(&event)?;
            let pipeline = build_pipeline(&cfg).await?;
            let response = pipeline::handle_notification(&pipeline, &json).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if response.status_code != 200 {
                std::process::exit(1);
            }
        }
        Commands::Process {
            bucket,
            key,
            version,
        } => {
            let pipeline = build_pipeline(&cfg).await?;
            let event = DocumentEvent::new(bucket, key, version);
            match pipeline.process(&event).await {
                PipelineOutcome::Stored(record) => {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                }
                PipelineOutcome::Failed { state, error, .. } => {
                    bail!("{} failed while {}: {}", event.uri(), state.as_str(), error);
                }
            }
        }
        Commands::Get { id } => {
            let store = open_store(&cfg).await?;
            match store.get(&id).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => bail!("document not found: {}", id),
            }
        }
        Commands::List { limit } => {
            let store = open_store(&cfg).await?;
            let records = store.scan(limit).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}
