//! # docrag CLI
//!
//! The `docrag` binary chunks documents, builds per-document vector indexes,
//! and answers questions over them, either one command at a time or as an
//! HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! docrag --config ./config/docrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docrag split <file>` | Chunk a file and store the chunks |
//! | `docrag chunks <doc>` | Print a document's stored chunks |
//! | `docrag embed <doc>` | Embed stored chunks and (re)build the document's index |
//! | `docrag ingest <file>` | Split, embed, and index a file in one step |
//! | `docrag search "<query>"` | Similarity search over one or all documents |
//! | `docrag ask "<question>"` | Retrieval-augmented answer |
//! | `docrag indexes` | List vector indexes |
//! | `docrag stats [doc]` | Chunk and index statistics |
//! | `docrag delete <doc>` | Delete a document's chunks and index |
//! | `docrag serve` | Start the HTTP API |
//!
//! Logs go to stderr (`RUST_LOG` overrides the filter); command output goes
//! to stdout, as JSON with `--json`.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use docrag::commands;
use docrag::config;
use docrag::server;
use docrag::services::Services;
use docrag_core::pipeline::AnswerRequest;

const DEFAULT_CONFIG: &str = "./config/docrag.toml";

/// docrag: document chunking, vector indexing, and retrieval-augmented
/// answers.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docrag.example.toml` for a full example. When the
/// default config file is absent, built-in defaults are used.
#[derive(Parser)]
#[command(name = "docrag", version, about)]
struct Cli {
    /// Path to configuration file (TOML). Defaults to `./config/docrag.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Print machine-readable JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a file (or `-` for stdin) into chunks and store them.
    Split {
        path: PathBuf,
        /// Document id. Defaults to the file stem.
        #[arg(long)]
        id: Option<String>,
    },

    /// Print a document's stored chunks.
    Chunks {
        document_id: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Embed a document's stored chunks and (re)build its index.
    ///
    /// Requires an embedding provider to be configured.
    Embed { document_id: String },

    /// Split, store, embed, and index a file (or `-` for stdin).
    Ingest {
        path: PathBuf,
        /// Document id. Defaults to the file stem.
        #[arg(long)]
        id: Option<String>,
    },

    /// Similarity search.
    Search {
        query: String,
        /// Restrict to one document; searches every index when omitted.
        #[arg(long)]
        document: Option<String>,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
        #[arg(long, default_value_t = 0.0)]
        threshold: f32,
    },

    /// Answer a question from the most similar chunks.
    Ask {
        question: String,
        #[arg(long)]
        document: Option<String>,
        /// Number of contexts to retrieve.
        #[arg(long)]
        context_length: Option<usize>,
        #[arg(long)]
        threshold: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        temperature: Option<f32>,
    },

    /// List vector indexes, newest first.
    Indexes,

    /// Chunk and index statistics for one document or all of them.
    Stats { document_id: Option<String> },

    /// Delete a document's chunks and index.
    Delete { document_id: String },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "docrag=debug,docrag_core=debug"
    } else {
        "docrag=info,docrag_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => config::load_config_or_default(Path::new(DEFAULT_CONFIG), true)?,
    };
    let services = Services::from_config(cfg)?;
    let json = cli.json;

    match cli.command {
        Commands::Split { path, id } => {
            let document_id = commands::document_id_for(&path, id);
            commands::run_split(&services, &path, document_id, json).await?;
        }
        Commands::Chunks {
            document_id,
            limit,
            offset,
        } => {
            commands::run_chunks(&services, &document_id, limit, offset, json).await?;
        }
        Commands::Embed { document_id } => {
            commands::run_embed(&services, &document_id, json).await?;
        }
        Commands::Ingest { path, id } => {
            let document_id = commands::document_id_for(&path, id);
            commands::run_ingest(&services, &path, document_id, json).await?;
        }
        Commands::Search {
            query,
            document,
            top_k,
            threshold,
        } => {
            commands::run_search(&services, &query, document.as_deref(), top_k, threshold, json)
                .await?;
        }
        Commands::Ask {
            question,
            document,
            context_length,
            threshold,
            max_tokens,
            temperature,
        } => {
            let request = AnswerRequest {
                question,
                document_id: document,
                context_length,
                similarity_threshold: threshold,
                max_tokens,
                temperature,
                ..AnswerRequest::default()
            };
            commands::run_ask(&services, request, json).await?;
        }
        Commands::Indexes => {
            commands::run_indexes(&services, json).await?;
        }
        Commands::Stats { document_id } => {
            commands::run_stats(&services, document_id.as_deref(), json).await?;
        }
        Commands::Delete { document_id } => {
            commands::run_delete(&services, &document_id, json).await?;
        }
        Commands::Serve => {
            server::run_server(services).await?;
        }
    }

    Ok(())
}
