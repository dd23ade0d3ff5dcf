//! Command-line front end: `ingest`, `query`, `graph-stats` and `config`.

mod output;
mod setup;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use lectern_config::Config;
use lectern_index::{IngestProgress, ProgressSink};
use tracing::info;
use tracing_subscriber::EnvFilter;

pub use setup::{build_context, settings_from_config};

#[derive(Parser, Debug)]
#[command(name = "lectern")]
#[command(version, about = "Incremental knowledge base for course documents", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to <config dir>/lectern/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bring a collection up to date with its materials directory
    Ingest {
        /// Collection id, also the materials subdirectory name
        collection: String,

        /// Discard the ledger, graph and vectors and rebuild from scratch
        #[arg(long)]
        force: bool,
    },

    /// Retrieve documents for a question
    Query {
        collection: String,

        /// The question
        text: String,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Summarise a collection's knowledge graph
    GraphStats { collection: String },

    /// Print the effective configuration as TOML
    Config,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Ingest { collection, force } => ingest(&config, &collection, force).await,
        Commands::Query {
            collection,
            text,
            json,
        } => query(&config, &collection, &text, json).await,
        Commands::GraphStats { collection } => graph_stats(&config, &collection),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// `RUST_LOG` when set, otherwise `info`.
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .init();
}

/// Drives an indicatif bar from ingestion progress.
struct BarSink {
    bar: ProgressBar,
}

impl ProgressSink for BarSink {
    fn report(&self, progress: IngestProgress) {
        self.bar.set_position(progress.percent.round() as u64);
        self.bar.set_message(progress.message);
    }
}

async fn ingest(config: &Config, collection: &str, force: bool) -> Result<()> {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}% {msg}")
            .context("Invalid progress template")?,
    );

    let ctx = build_context(config)?.with_progress(Arc::new(BarSink { bar: bar.clone() }));

    let result = lectern_index::ingest(&ctx, collection, force).await;
    bar.finish_and_clear();
    let report = result.with_context(|| format!("Ingestion of {} failed", collection))?;

    println!("{}", output::render_report(&report));
    info!(collection = %collection, "Ingestion finished");
    Ok(())
}

async fn query(config: &Config, collection: &str, text: &str, json: bool) -> Result<()> {
    let ctx = build_context(config)?;
    let documents = lectern_index::retrieve(&ctx, text, collection)
        .await
        .with_context(|| format!("Retrieval from {} failed", collection))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&output::documents_json(&documents))?);
    } else {
        print!("{}", output::render_documents(&documents));
    }
    Ok(())
}

fn graph_stats(config: &Config, collection: &str) -> Result<()> {
    let store = lectern_index::GraphStore::new(&config.storage.knowledge_base_dir);
    let graph = store
        .load(collection)?
        .with_context(|| format!("Collection {} has no knowledge graph; run `lectern ingest {}` first", collection, collection))?;
    let metadata = store.load_metadata(collection)?;

    print!("{}", output::render_graph_stats(collection, &graph, metadata.as_ref()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ingest() {
        let cli = Cli::try_parse_from(["lectern", "ingest", "c1", "--force"]).unwrap();
        match cli.command {
            Commands::Ingest { collection, force } => {
                assert_eq!(collection, "c1");
                assert!(force);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_query_with_global_config() {
        let cli = Cli::try_parse_from([
            "lectern",
            "query",
            "c1",
            "What is Django?",
            "--json",
            "--config",
            "/tmp/lectern.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/lectern.toml")));
        match cli.command {
            Commands::Query {
                collection,
                text,
                json,
            } => {
                assert_eq!(collection, "c1");
                assert_eq!(text, "What is Django?");
                assert!(json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_graph_stats() {
        let cli = Cli::try_parse_from(["lectern", "graph-stats", "c1"]).unwrap();
        assert!(matches!(cli.command, Commands::GraphStats { ref collection } if collection == "c1"));
    }

    #[test]
    fn test_log_filter_respects_rust_log() {
        std::env::set_var("RUST_LOG", "warn");
        assert_eq!(log_filter().to_string(), "warn");
        std::env::remove_var("RUST_LOG");
        assert_eq!(log_filter().to_string(), "info");
    }

    #[test]
    fn test_query_requires_text() {
        assert!(Cli::try_parse_from(["lectern", "query", "c1"]).is_err());
    }
}
