//! CLI entry point for the embedding search service.
//!
//! Provides commands for inspecting stored indexes and running searches
//! against a directory of index blobs.

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use embsearch::search::{EmbeddingsSearcher, PrecomputedEmbedder, SearchRequest};
use embsearch::storage::{
    CachedIndexGetter, FsBlobStore, IndexCache, MemoryJobStore, repo_index_key,
};
use embsearch::vector::{EmbeddingIndex, RepoId, decode, detect_kernel};
use embsearch::{SearchError, Settings};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Embedding index search
#[derive(Parser)]
#[command(
    name = "embsearch",
    version = env!("CARGO_PKG_VERSION"),
    about = "Quantized embedding index search",
    next_line_help = true,
    styles = clap_cargo_style()
)]
struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
enum Commands {
    #[command(about = "Write a default .embsearch/settings.toml")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    #[command(about = "Display active settings")]
    Config,

    #[command(about = "Decode an index file and print its shape")]
    Inspect {
        /// Encoded index file, current or legacy format
        file: PathBuf,
    },

    #[command(about = "Search one repository index with a precomputed query vector")]
    Search {
        /// Directory holding index blobs (defaults to storage.blob_dir)
        #[arg(long)]
        index_dir: Option<PathBuf>,

        /// Repository name, mapped to its blob key
        #[arg(long)]
        repo: String,

        /// JSON file containing the query embedding as an array of floats
        #[arg(long)]
        query_vector: PathBuf,

        /// Model that produced the query vector (defaults to search.embeddings_model)
        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        code_results: Option<usize>,

        #[arg(long)]
        text_results: Option<usize>,

        /// Ignore document ranks when scoring
        #[arg(long)]
        no_ranks: bool,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("Configuration error loading from {}", path.display()))?,
        None => Settings::load().unwrap_or_else(|e| {
            eprintln!("Configuration error: {e}");
            eprintln!("Using default configuration.");
            Settings::default()
        }),
    };
    init_tracing(&settings.logging.level);

    match cli.command {
        Commands::Init { force } => init(&settings, force),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
        Commands::Inspect { file } => inspect(&file),
        Commands::Search {
            index_dir,
            repo,
            query_vector,
            model,
            code_results,
            text_results,
            no_ranks,
        } => {
            let options = settings.search.search_options();
            let request = SearchRequest {
                query_text: String::new(),
                repo_ids: vec![RepoId::new(1)],
                repo_names: vec![repo],
                code_result_count: code_results.unwrap_or(settings.search.code_result_count),
                text_result_count: text_results.unwrap_or(settings.search.text_result_count),
                use_document_ranks: options.use_document_ranks && !no_ranks,
            };
            let index_dir = index_dir.unwrap_or_else(|| settings.storage.blob_dir.clone());
            let model = model.unwrap_or_else(|| settings.search.embeddings_model.clone());
            search(&settings, &index_dir, &query_vector, model, request).await
        }
    }
}

fn init(settings: &Settings, force: bool) -> anyhow::Result<()> {
    let path = Settings::default_config_path();
    if path.exists() && !force {
        bail!(
            "Configuration file already exists at: {}\nUse --force to overwrite",
            path.display()
        );
    }
    settings
        .save(&path)
        .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", path.display()))?;
    println!("Created configuration file at: {}", path.display());
    Ok(())
}

fn inspect(file: &Path) -> anyhow::Result<()> {
    let reader = BufReader::new(
        File::open(file).with_context(|| format!("Failed to open {}", file.display()))?,
    );
    let index = decode(reader).with_context(|| format!("Failed to decode {}", file.display()))?;

    println!("repo:     {}", index.repo_name);
    println!("revision: {}", index.revision);
    let model = if index.embeddings_model.is_empty() {
        "(untagged)"
    } else {
        index.embeddings_model.as_str()
    };
    println!("model:    {model}");
    print_index_shape("code", &index.code_index);
    print_index_shape("text", &index.text_index);
    println!("size:     {} bytes (estimated)", index.estimate_size());
    Ok(())
}

fn print_index_shape(label: &str, index: &EmbeddingIndex) {
    println!(
        "{label}:     {} rows x {} dims, {} ranks",
        index.len(),
        index.column_dimension,
        index.ranks.len()
    );
}

async fn search(
    settings: &Settings,
    index_dir: &Path,
    query_vector: &Path,
    model: String,
    request: SearchRequest,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(query_vector)
        .with_context(|| format!("Failed to read {}", query_vector.display()))?;
    let vector: Vec<f32> =
        serde_json::from_str(&raw).context("Query vector must be a JSON array of numbers")?;

    // The blob's modification time stands in for the job completion time
    let repo_name = &request.repo_names[0];
    let blob_path = index_dir.join(repo_index_key(repo_name));
    let jobs = Arc::new(MemoryJobStore::new());
    if let Ok(modified) = std::fs::metadata(&blob_path).and_then(|m| m.modified()) {
        jobs.complete_job(request.repo_ids[0], DateTime::<Utc>::from(modified));
    }

    let getter = CachedIndexGetter::new(
        Arc::new(FsBlobStore::new(index_dir)),
        jobs,
        Arc::new(IndexCache::new(settings.cache.capacity_bytes)),
    );
    let searcher = EmbeddingsSearcher::new(
        getter,
        Arc::new(PrecomputedEmbedder::new(model, vector)),
        detect_kernel(),
        settings.search.worker_options(),
    );

    match searcher.search(&CancellationToken::new(), &request).await {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(e) => {
            report_search_error(&e);
            Err(e.into())
        }
    }
}

fn report_search_error(err: &SearchError) {
    eprintln!("Error [{}]", err.status_code());
    for suggestion in err.recovery_suggestions() {
        eprintln!("  - {suggestion}");
    }
}
