//! # Text2SQL Harness CLI (`t2s`)
//!
//! ## Usage
//!
//! ```bash
//! t2s --config ./config/t2s.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `t2s init` | Create the SQLite document database and run migrations |
//! | `t2s index <MDL_FILE>` | Index an MDL manifest into the document stores |
//! | `t2s answer --query .. --sql .. --sql-summary ..` | Answer a question from its SQL result |
//! | `t2s serve http` | Start the HTTP API |

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::warn;
use uuid::Uuid;

use text2sql_harness::answer::SqlAnswer;
use text2sql_harness::broker::StreamingBroker;
use text2sql_harness::config::{self, Config};
use text2sql_harness::indexing::Indexing;
use text2sql_harness::llm::create_generator;
use text2sql_harness::sql_executor::create_sql_executor;
use text2sql_harness::{logging, migrate, server};

/// Text2SQL Harness CLI: schema indexing and streamed answer generation
/// over SQL results.
#[derive(Parser)]
#[command(
    name = "t2s",
    about = "Text2SQL Harness: index MDL manifests and answer questions from SQL results",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/t2s.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the document database schema.
    ///
    /// Idempotent; only needed for the `sqlite` document store.
    Init,

    /// Index an MDL manifest.
    ///
    /// Replaces every document previously indexed for the same project id.
    Index {
        /// Path to the MDL JSON file.
        mdl_file: PathBuf,

        /// Scope the indexed documents to this project.
        #[arg(long)]
        project_id: Option<String>,

        /// Also write the indexing graph in Graphviz DOT format to this file.
        #[arg(long)]
        dot: Option<PathBuf>,
    },

    /// Answer a question from the result of its SQL.
    ///
    /// The SQL runs against `[engine].data_path` when configured.
    Answer {
        /// The user's question.
        #[arg(long)]
        query: String,

        /// SQL that answers the question.
        #[arg(long)]
        sql: String,

        /// Short description of what the SQL does.
        #[arg(long)]
        sql_summary: String,

        /// Language the answer is written in.
        #[arg(long, default_value = "English")]
        language: String,

        /// Print tokens as they are generated.
        #[arg(long)]
        stream: bool,
    },

    /// Start a server.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

#[derive(Subcommand)]
enum ServeService {
    /// Start the HTTP API on `[server].bind`.
    Http,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index {
            mdl_file,
            project_id,
            dot,
        } => {
            run_index(&cfg, &mdl_file, project_id.as_deref(), dot.as_deref()).await?;
        }
        Commands::Answer {
            query,
            sql,
            sql_summary,
            language,
            stream,
        } => {
            run_answer(&cfg, &query, &sql, &sql_summary, &language, stream).await?;
        }
        Commands::Serve { service } => match service {
            ServeService::Http => {
                server::run_server(&cfg).await?;
            }
        },
    }

    Ok(())
}

async fn run_index(
    cfg: &Config,
    mdl_file: &std::path::Path,
    project_id: Option<&str>,
    dot: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    let mdl = std::fs::read_to_string(mdl_file)
        .with_context(|| format!("Failed to read MDL file: {}", mdl_file.display()))?;
    if cfg.document_store.provider == "memory" {
        warn!("document_store.provider is 'memory'; indexed documents are discarded on exit");
    }

    let indexing = Indexing::from_config(cfg).await?;
    if let Some(path) = dot {
        std::fs::write(path, indexing.to_dot()?)
            .with_context(|| format!("Failed to write graph: {}", path.display()))?;
    }

    let result = indexing.run(&mdl, project_id).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_answer(
    cfg: &Config,
    query: &str,
    sql: &str,
    sql_summary: &str,
    language: &str,
    stream: bool,
) -> anyhow::Result<()> {
    let sql_answer = SqlAnswer::new(
        create_generator(&cfg.llm)?,
        Arc::new(StreamingBroker::new()),
    )?;
    let sql_data = create_sql_executor(&cfg.engine)
        .await?
        .execute(sql, None)
        .await?;

    let query_id = stream.then(|| Uuid::new_v4().to_string());
    let printer = query_id.as_deref().map(|id| {
        let mut tokens = sql_answer.get_streaming_results(id);
        tokio::spawn(async move {
            let mut stdout = std::io::stdout();
            while let Some(token) = tokens.next().await {
                print!("{}", token);
                let _ = stdout.flush();
            }
            println!();
        })
    });

    let outcome = sql_answer
        .run(query, sql, sql_summary, sql_data, language, query_id.as_deref())
        .await;
    if let (Some(id), Some(printer)) = (query_id.as_deref(), printer) {
        sql_answer.close_stream(id);
        printer.await?;
    }

    let result = outcome?;
    if !result.error.is_empty() {
        anyhow::bail!("answer generation failed: {}", result.error);
    }
    if stream {
        println!("---");
    }
    println!("{}", result.answer);
    Ok(())
}
