//! # Knowledge Sync CLI (`ksync`)
//!
//! ## Usage
//!
//! ```bash
//! ksync --config ./ksync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ksync refresh <dir>` | Bring the directory's knowledge base up to date |
//! | `ksync search <dir> "<query>"` | Search the directory's knowledge base |
//! | `ksync stats <dir>` | Show document, chunk, and vector counts |
//! | `ksync serve` | Start the HTTP tool server |
//!
//! Set `RUST_LOG` to change log verbosity (default `info`).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use knowledge_sync::config::{self, RequestParams};
use knowledge_sync::registry::KnowledgeBaseRegistry;
use knowledge_sync::server;

/// Keep semantic-search knowledge bases in sync with directories on disk.
#[derive(Parser)]
#[command(name = "ksync", version)]
struct Cli {
    /// Path to configuration file (TOML). A missing file means defaults.
    #[arg(long, global = true, default_value = "./ksync.toml")]
    config: PathBuf,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a directory and commit any changes to its knowledge base.
    Refresh {
        dir: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Search a directory's knowledge base.
    ///
    /// Refreshes first unless `--no-refresh` is given.
    Search {
        dir: PathBuf,
        query: String,
        #[arg(long)]
        no_refresh: bool,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Show counts for a directory's knowledge base.
    Stats {
        dir: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Start the HTTP tool server on `[server].bind`.
    Serve,
}

/// Per-call overrides; these win over `[defaults]` in the config file.
#[derive(Args)]
struct Overrides {
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    chunk_size: Option<usize>,
    #[arg(long)]
    chunk_overlap: Option<usize>,
    #[arg(long)]
    top_k: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
}

impl Overrides {
    fn into_params(self, dir: PathBuf) -> RequestParams {
        RequestParams {
            source_path: dir,
            embedding_model: self.model,
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            top_k: self.top_k,
            batch_size: self.batch_size,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let registry = Arc::new(KnowledgeBaseRegistry::from_config(cfg));

    match cli.command {
        Commands::Refresh { dir, overrides } => {
            let summary = registry.refresh(&overrides.into_params(dir)).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "added {}, updated {}, removed {}, unchanged {} ({} chunks added, {} removed)",
                    summary.documents_added,
                    summary.documents_updated,
                    summary.documents_removed,
                    summary.documents_unchanged,
                    summary.chunks_added,
                    summary.chunks_removed
                );
                if summary.reconciled_documents > 0 || summary.orphan_vectors_retired > 0 {
                    println!(
                        "reconciled {} documents, retired {} orphan vectors",
                        summary.reconciled_documents, summary.orphan_vectors_retired
                    );
                }
                for err in &summary.errors {
                    println!("  ! {} ({:?}): {}", err.path, err.error_kind, err.message);
                }
            }
        }
        Commands::Search {
            dir,
            query,
            no_refresh,
            overrides,
        } => {
            let params = overrides.into_params(dir);
            if !no_refresh {
                registry.refresh(&params).await?;
            }
            let hits = registry.search(&params, &query).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else if hits.is_empty() {
                println!("No results.");
            } else {
                for (i, hit) in hits.iter().enumerate() {
                    println!(
                        "{}. [{:.3}] {} ({}..{})",
                        i + 1,
                        hit.score,
                        hit.document_path,
                        hit.start_offset,
                        hit.end_offset
                    );
                    let preview: String = hit.chunk_text.chars().take(200).collect();
                    println!("   {}", preview.replace('\n', " "));
                }
            }
        }
        Commands::Stats { dir, overrides } => {
            let stats = registry.stats(&overrides.into_params(dir)).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("key:          {}", stats.key);
                println!("model:        {}", stats.embedding_model);
                println!("documents:    {}", stats.documents);
                println!("chunks:       {}", stats.chunks);
                println!("live vectors: {}", stats.live_vectors);
                println!("tombstones:   {}", stats.tombstones);
                if stats.dangling_documents > 0 || stats.orphan_vectors > 0 {
                    println!(
                        "out of sync:  {} dangling documents, {} orphan vectors (next refresh repairs)",
                        stats.dangling_documents, stats.orphan_vectors
                    );
                }
            }
        }
        Commands::Serve => {
            server::run_server(registry).await?;
        }
    }

    Ok(())
}
