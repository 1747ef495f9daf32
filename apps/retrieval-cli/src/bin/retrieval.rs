use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use tracing_subscriber::EnvFilter;

use retrieval_core::config::RetrievalConfig;
use retrieval_core::types::{CollectionRef, DocumentChunk, Filters, HealthState};
use retrieval_router::RetrievalRouter;

/// Operational CLI for the unified retrieval layer.
#[derive(Parser, Debug)]
#[command(name = "retrieval", version, about = "Search and inspect retrieval backends")]
struct Cli {
    /// Directory holding config.toml (and config.<RUST_ENV>.toml)
    #[arg(long, default_value = ".", env = "RETRIEVAL_CONFIG_DIR")]
    config_dir: PathBuf,

    /// Load a single TOML file instead of the layered directory config
    #[arg(long, conflicts_with = "config_dir")]
    config_file: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Search a collection with a query vector
    Search {
        collection: String,
        /// Comma-separated query vector, e.g. "0.1,0.2,0.3"
        #[arg(long, conflicts_with = "vector_file")]
        vector: Option<String>,
        /// JSON file holding the query vector as an array of numbers
        #[arg(long)]
        vector_file: Option<PathBuf>,
        #[arg(long, short = 'k', default_value_t = 5)]
        top_k: usize,
        /// Equality filter, repeatable: --filter source=bylaws.pdf
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
    },
    /// Probe every backend and print its health
    Status {
        /// Only print the cached state without probing
        #[arg(long)]
        cached: bool,
    },
    /// Show each backend in a collection's chain with index details
    Describe { collection: String },
    /// List configured collections
    Collections,
    /// Write chunks from a JSON Lines file to every backend of a collection
    Upsert {
        collection: String,
        input: PathBuf,
        #[arg(long, default_value_t = 64)]
        batch_size: usize,
    },
}

fn parse_filter(s: &str) -> Result<(String, String), String> {
    let (k, v) = s.split_once('=').ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    Ok((k.trim().to_string(), v.to_string()))
}

fn parse_vector(s: &str) -> Result<Vec<f32>> {
    s.split(',').map(|x| x.trim().parse::<f32>().with_context(|| format!("invalid vector component '{x}'"))).collect()
}

fn load_config(cli: &Cli) -> Result<RetrievalConfig> {
    let config = match &cli.config_file {
        Some(path) => RetrievalConfig::from_toml_file(path),
        None => RetrievalConfig::load_from(&cli.config_dir),
    };
    config.context("loading retrieval configuration")
}

fn read_chunks(path: &PathBuf) -> Result<Vec<DocumentChunk>> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut chunks = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let chunk: DocumentChunk = serde_json::from_str(&line).with_context(|| format!("{}:{}", path.display(), n + 1))?;
        chunks.push(chunk);
    }
    Ok(chunks)
}

fn state_icon(state: HealthState) -> &'static str {
    match state {
        HealthState::Healthy => "✅",
        HealthState::Degraded => "⚠️ ",
        HealthState::Unreachable => "❌",
        HealthState::Unknown => "❔",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let router = RetrievalRouter::from_config(&config)?;
    info!(collections = config.collections.len(), backends = config.backends.len(), "configuration loaded");

    match &cli.command {
        Commands::Search { collection, vector, vector_file, top_k, filters } => {
            let query = match (vector, vector_file) {
                (Some(v), _) => parse_vector(v)?,
                (None, Some(path)) => serde_json::from_str(&std::fs::read_to_string(path)?).with_context(|| format!("parsing {}", path.display()))?,
                (None, None) => bail!("one of --vector or --vector-file is required"),
            };
            let filters: Filters = filters.iter().cloned().collect();
            // seed the health cache so known-dead backends are skipped
            router.probe_all().await;
            let resp = router.search(&CollectionRef::from(collection.as_str()), &query, *top_k, &filters).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&resp)?);
                return Ok(());
            }
            println!("🔍 {} results from '{}'{}", resp.results.len(), resp.used_backend, if resp.degraded { " (degraded)" } else { "" });
            if let Some(notice) = &resp.notice {
                println!("ℹ️  {notice}");
            }
            for (i, r) in resp.results.iter().enumerate() {
                let flag = if r.anomaly { "  [anomaly]" } else { "" };
                println!("\n  {}. score={:.4}  chunk={}  source={}  page={}{}", i + 1, r.score, r.chunk_id, r.source, r.page, flag);
                println!("     📝 {}", r.content);
            }
        }
        Commands::Status { cached } => {
            let statuses = if *cached { router.monitor().statuses() } else { router.probe_all().await };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
                return Ok(());
            }
            for s in &statuses {
                let checked = s.last_checked_at.map_or_else(|| "never".to_string(), |t| t.to_rfc3339());
                println!("{} {:<20} {:<12} failures={} checked={}", state_icon(s.state), s.backend.as_str(), s.state.to_string(), s.consecutive_failures, checked);
                if let Some(err) = &s.last_error {
                    println!("     {err}");
                }
            }
        }
        Commands::Describe { collection } => {
            let links = router.describe(&CollectionRef::from(collection.as_str())).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&links)?);
                return Ok(());
            }
            println!("📚 {collection}");
            for (i, l) in links.iter().enumerate() {
                match (&l.description, &l.error) {
                    (Some(d), _) => println!("  {}. {} ({}, {:?}) index={} dim={} vectors={}", i + 1, l.backend, l.kind, l.role, l.index, d.dimension, d.vector_count),
                    (None, err) => println!("  {}. {} ({}, {:?}) index={} error: {}", i + 1, l.backend, l.kind, l.role, l.index, err.as_deref().unwrap_or("unknown")),
                }
            }
        }
        Commands::Collections => {
            let names: Vec<String> = router.collections().into_iter().map(|c| c.to_string()).collect();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else {
                names.iter().for_each(|n| println!("{n}"));
            }
        }
        Commands::Upsert { collection, input, batch_size } => {
            let chunks = read_chunks(input)?;
            let collection = CollectionRef::from(collection.as_str());
            let pb = ProgressBar::new(chunks.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({percent}%) {msg}")?
                    .progress_chars("#>-"),
            );
            for batch in chunks.chunks((*batch_size).max(1)) {
                router.upsert(&collection, batch).await?;
                pb.inc(batch.len() as u64);
            }
            pb.finish_with_message("done");
            println!("✅ Upserted {} chunks into '{}'", chunks.len(), collection);
        }
    }
    router.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_filters_and_vectors() {
        assert_eq!(parse_filter("source=a=b.pdf").unwrap(), ("source".to_string(), "a=b.pdf".to_string()));
        assert!(parse_filter("nokey").is_err());
        assert_eq!(parse_vector("0.5, 1,-2").unwrap(), vec![0.5, 1.0, -2.0]);
        assert!(parse_vector("0.5,x").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
