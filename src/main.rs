// Import from library crate
use nl2sql_engine::config::{RunConfig, DEFAULT_BASE_URL, DEFAULT_CATALOG, DEFAULT_MODEL};
use nl2sql_engine::db::Database;
use nl2sql_engine::events::EventEmitter;
use nl2sql_engine::llm::LlmClient;
use nl2sql_engine::observability::{QueryLogEntry, RunLogger};
use nl2sql_engine::pipeline::Pipeline;
use nl2sql_engine::schema::SchemaDescriptor;
use nl2sql_engine::stages::LlmAgents;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "nl2sql-engine")]
#[command(about = "Natural-language-to-SQL pipeline with a bounded correction loop")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a natural-language question against a SQLite database
    Ask {
        /// The question in natural language
        question: String,

        /// Path to the SQLite database file
        #[arg(short, long)]
        db: PathBuf,

        /// Logical catalog name the database is attached under
        #[arg(long, default_value = DEFAULT_CATALOG)]
        catalog: String,

        /// Model identifier
        #[arg(short, long, default_value = DEFAULT_MODEL)]
        model: String,

        /// API key (or set OPENAI_API_KEY env var)
        #[arg(long)]
        api_key: Option<String>,

        /// Base URL of the completion API
        #[arg(long, default_value = DEFAULT_BASE_URL)]
        base_url: String,

        /// Append per-run JSONL entries to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Print the introspected schema of a SQLite database
    Schema {
        /// Path to the SQLite database file
        #[arg(short, long)]
        db: PathBuf,

        /// Logical catalog name the database is attached under
        #[arg(long, default_value = DEFAULT_CATALOG)]
        catalog: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Ask {
            question,
            db,
            catalog,
            model,
            api_key,
            base_url,
            log_file,
        } => {
            let api_key = api_key
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .ok_or_else(|| anyhow!("API key required: pass --api-key or set OPENAI_API_KEY"))?;

            let database = Database::open(&db, &catalog)?;
            let config = RunConfig::new(api_key.clone(), model.clone())
                .with_base_url(base_url.clone())
                .with_catalog(catalog);

            let llm = LlmClient::new(api_key, model, base_url);
            let agents = Arc::new(LlmAgents::new(llm, config.catalog.clone()));
            let (emitter, mut rx) = EventEmitter::new();
            let pipeline = Pipeline::new(agents, database, emitter, config);

            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    println!("{}", event.to_json_line());
                }
            });

            let outcome = pipeline.run(&question).await;
            // Dropping the pipeline closes the event channel and lets the
            // printer drain to completion.
            drop(pipeline);
            printer.await.ok();

            let logger = RunLogger::new(log_file, 1000);
            logger.log(QueryLogEntry::from_outcome(&question, &outcome))?;

            if outcome.success {
                info!("Run succeeded in {} attempt(s)", outcome.attempts);
                Ok(())
            } else {
                Err(anyhow!(
                    "Run failed after {} attempt(s): {}",
                    outcome.attempts,
                    outcome.error.unwrap_or_else(|| "unknown error".to_string())
                ))
            }
        }
        Commands::Schema { db, catalog } => {
            let database = Database::open(&db, &catalog)?;
            let schema = SchemaDescriptor::snapshot(&database)?;
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
    }
}
