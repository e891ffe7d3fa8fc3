//! code-search CLI
//!
//! Serves search requests over stdin/stdout through a supervised worker,
//! or runs one-shot searches and indexing passes from the terminal.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use code_search::server;
use code_search::worker::run_stdio_worker;
use code_search::{
    format_report, Config, Embedder, EmbeddingModel, InProcessSpawner, IndexingPipeline,
    ProcessSpawner, SupervisorConfig, WorkerContext, WorkerOptions, WorkerSupervisor,
};
use colored::*;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "code-search")]
#[command(author, version, about = "Resilient local code search with a supervised worker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

/// Options shared by everything that runs the search engine
#[derive(Args, Debug, Clone)]
struct EngineArgs {
    /// Try embedding search first, fall back to lexical ranking
    #[arg(long, env = "CODE_SEARCH_SEMANTIC")]
    semantic: bool,

    /// Embedding model to use
    #[arg(long, default_value = "minilm", env = "CODE_SEARCH_MODEL")]
    model: String,

    /// File replacing the built-in ignore list
    #[arg(long, env = "CODE_SEARCH_DEFAULT_IGNORE")]
    default_ignore_file: Option<PathBuf>,

    /// Maximum number of results
    #[arg(short = 'm', long, default_value = "10", env = "CODE_SEARCH_MAX_RESULTS")]
    max_results: usize,
}

impl EngineArgs {
    fn worker_options(&self) -> Result<WorkerOptions> {
        let model: EmbeddingModel = self.model.parse()?;
        let mut config = Config::default().with_model(model);
        config.max_results = self.max_results;
        if let Some(path) = &self.default_ignore_file {
            config = config.with_default_ignore_file(path.clone());
        }
        Ok(WorkerOptions::new(config).with_semantic(self.semantic))
    }

    /// Arguments re-creating these options in a worker process
    fn worker_args(&self, verbose: bool) -> Vec<String> {
        let mut args = Vec::new();
        if verbose {
            args.push("--verbose".to_string());
        }
        args.extend([
            "worker".to_string(),
            "--model".to_string(),
            self.model.clone(),
            "--max-results".to_string(),
            self.max_results.to_string(),
        ]);
        if self.semantic {
            args.push("--semantic".to_string());
        }
        if let Some(path) = &self.default_ignore_file {
            args.push("--default-ignore-file".to_string());
            args.push(path.display().to_string());
        }
        args
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Answer JSON-lines search requests on stdin (default)
    Serve {
        #[command(flatten)]
        engine: EngineArgs,

        /// Run the worker as a task instead of a child process
        #[arg(long, env = "CODE_SEARCH_IN_PROCESS")]
        in_process: bool,

        /// Seconds before an unanswered request fails
        #[arg(long, default_value = "600", env = "CODE_SEARCH_REQUEST_TIMEOUT")]
        request_timeout: u64,

        /// Seconds between worker liveness probes
        #[arg(long, default_value = "30", env = "CODE_SEARCH_HEALTH_INTERVAL")]
        health_interval: u64,
    },

    /// Search a repository once
    Search {
        /// Search query
        query: String,

        /// Repository to search
        #[arg(short = 'p', long, default_value = ".")]
        path: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Show result snippets
        #[arg(short = 'c', long)]
        content: bool,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Build the embedding index for a repository
    Index {
        /// Path to index
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Embedding model to use
        #[arg(long, default_value = "minilm", env = "CODE_SEARCH_MODEL")]
        model: String,
    },

    /// List available embedding models
    Models,

    /// Execution unit entry point
    #[command(hide = true)]
    Worker {
        #[command(flatten)]
        engine: EngineArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries protocol messages, logs always go to stderr
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(Commands::Serve {
            engine,
            in_process,
            request_timeout,
            health_interval,
        }) => cmd_serve(engine, in_process, request_timeout, health_interval, cli.verbose),
        None => cmd_serve(
            EngineArgs {
                semantic: false,
                model: "minilm".to_string(),
                default_ignore_file: None,
                max_results: 10,
            },
            false,
            600,
            30,
            cli.verbose,
        ),
        Some(Commands::Search {
            query,
            path,
            json,
            content,
            engine,
        }) => cmd_search(query, path, json, content, engine),
        Some(Commands::Index { path, model }) => cmd_index(path, model),
        Some(Commands::Models) => cmd_models(),
        Some(Commands::Worker { engine }) => cmd_worker(engine),
    }
}

fn cmd_serve(
    engine: EngineArgs,
    in_process: bool,
    request_timeout: u64,
    health_interval: u64,
    verbose: bool,
) -> Result<()> {
    let supervisor_config = SupervisorConfig::default()
        .with_request_timeout(Duration::from_secs(request_timeout))
        .with_health_interval(Duration::from_secs(health_interval));
    let options = engine.worker_options()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let supervisor = if in_process {
            WorkerSupervisor::start(InProcessSpawner::new(options), supervisor_config)
        } else {
            let spawner = ProcessSpawner::current_exe(engine.worker_args(verbose))?;
            WorkerSupervisor::start(spawner, supervisor_config)
        };
        info!("Serving requests on stdin");

        let result = tokio::select! {
            result = server::serve(tokio::io::stdin(), tokio::io::stdout(), supervisor.clone()) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                Ok(())
            }
        };

        supervisor.shutdown().await;
        result.map_err(anyhow::Error::from)
    })
}

fn cmd_worker(engine: EngineArgs) -> Result<()> {
    let options = engine.worker_options()?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_stdio_worker(options))?;
    Ok(())
}

fn cmd_search(query: String, path: PathBuf, json: bool, content: bool, engine: EngineArgs) -> Result<()> {
    let path = path.canonicalize()?;
    let mut context = WorkerContext::new(engine.worker_options()?);
    let outcome = context.search(&query, path.to_str(), false);

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    if let Some(error) = outcome.error() {
        eprintln!("{} {}", "Error:".red().bold(), error);
        std::process::exit(1);
    }

    if let Some(report) = outcome.report() {
        if report.results.is_empty() {
            println!("No results found for: {}", query.yellow());
            return Ok(());
        }
        println!(
            "\n{} results for \"{}\":\n",
            report.results_count.to_string().green().bold(),
            query.cyan()
        );
        print!("{}", format_report(report, content));
    }

    Ok(())
}

fn cmd_index(path: PathBuf, model: String) -> Result<()> {
    let path = path.canonicalize()?;
    println!("{} {:?}", "Indexing".cyan().bold(), path);

    let model: EmbeddingModel = model.parse()?;
    let config = Config::new(path).with_model(model);
    let embedder = Embedder::new(&config.model, &config.model_cache_dir)?;

    let mut pipeline = IndexingPipeline::with_local_store(config, embedder).with_progress(true);
    let summary = pipeline.index_repository()?;
    pipeline.close()?;

    println!("\n{} {}", "✓".green(), summary);
    Ok(())
}

fn cmd_models() -> Result<()> {
    println!("{}", "Available Embedding Models".cyan().bold());
    println!();
    println!("  {} (default)", "minilm".green().bold());
    println!("    Fast, lightweight model (384 dims, ~30MB)");
    println!();
    println!("  {}", "bge".green().bold());
    println!("    High quality retrieval model (384 dims, ~90MB)");
    println!();
    println!("  {}", "nomic".green().bold());
    println!("    Optimized for code and technical content (768 dims, ~90MB)");
    println!();
    println!("  {}", "multilingual".green().bold());
    println!("    Supports 100+ languages (384 dims, ~470MB)");
    println!();
    println!("Usage: {} --model nomic", "code-search index".yellow());

    Ok(())
}
