//! Execution unit: owns per-repository indexes and answers requests
//!
//! The unit reads newline-delimited [`WorkerRequest`]s and writes
//! [`WorkerMessage`]s. Liveness probes are answered as soon as they are read,
//! searches run one at a time on the blocking pool so a slow scan never
//! delays a probe. A panic inside a search becomes a fault tagged with the
//! request id and the context is rebuilt from scratch.

use crate::config::{Config, INDEX_DIR_NAME};
use crate::embedder::{Embedder, EmbeddingGenerator};
use crate::error::{Result, SearchError};
use crate::ignore_rules::IgnoreSet;
use crate::lexical::LexicalIndex;
use crate::pipeline::IndexingPipeline;
use crate::protocol::{
    RequestBody, SearchOutcome, SearchReport, SearchResult, WorkerMessage, WorkerRequest, PROBE_ID,
};
use crate::scanner::Scanner;
use crate::store::HnswStore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

type SharedEmbedder = Arc<dyn EmbeddingGenerator>;

/// Settings a unit is started with
#[derive(Clone, Default)]
pub struct WorkerOptions {
    /// Template config; root and index dir are replaced per repository
    pub config: Config,
    /// Try the embedding path before the lexical engine
    pub semantic: bool,
    /// Preloaded generator; loaded from `config.model` on first use otherwise
    pub embedder: Option<SharedEmbedder>,
}

impl WorkerOptions {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            semantic: false,
            embedder: None,
        }
    }

    pub fn with_semantic(mut self, semantic: bool) -> Self {
        self.semantic = semantic;
        self
    }

    pub fn with_embedder(mut self, embedder: SharedEmbedder) -> Self {
        self.embedder = Some(embedder);
        self.semantic = true;
        self
    }
}

/// State owned by one execution unit for its whole lifetime
pub struct WorkerContext {
    options: WorkerOptions,
    indexes: HashMap<PathBuf, LexicalIndex>,
    pipelines: HashMap<PathBuf, IndexingPipeline<SharedEmbedder, HnswStore>>,
    embedder: Option<SharedEmbedder>,
}

impl WorkerContext {
    pub fn new(options: WorkerOptions) -> Self {
        let embedder = options.embedder.clone();
        Self {
            options,
            indexes: HashMap::new(),
            pipelines: HashMap::new(),
            embedder,
        }
    }

    /// Number of repositories with a cached lexical index
    pub fn cached_repositories(&self) -> usize {
        self.indexes.len()
    }

    /// Answer one search request
    pub fn search(&mut self, query: &str, repository_path: Option<&str>, reindex: bool) -> SearchOutcome {
        if query.trim().is_empty() {
            return SearchOutcome::failure("Query must be a non-empty string");
        }

        let root = match resolve_root(repository_path) {
            Ok(root) => root,
            Err(e) => {
                debug!("Rejected repository path: {}", e);
                return SearchOutcome::failure(format!(
                    "Repository path not found: {}",
                    repository_path.unwrap_or(".")
                ));
            }
        };

        if reindex {
            self.forget(&root);
        }

        let semantic = if self.options.semantic {
            match self.semantic_search(&root, query) {
                Ok(results) if !results.is_empty() => Some(results),
                Ok(_) => None,
                Err(e) => {
                    warn!("Semantic search failed, using lexical ranking: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let results = match semantic {
            Some(results) => results,
            None => match self.lexical_search(&root, query) {
                Ok(Some(results)) => results,
                Ok(None) => return SearchOutcome::failure("No code chunks found"),
                Err(e) => return SearchOutcome::failure(e.to_string()),
            },
        };

        SearchOutcome::Found(SearchReport::build(
            query,
            &root.display().to_string(),
            &results,
            self.options.config.max_results,
        ))
    }

    fn forget(&mut self, root: &Path) {
        self.indexes.remove(root);
        if let Some(mut pipeline) = self.pipelines.remove(root) {
            if let Err(e) = pipeline.close() {
                warn!("Failed to close pipeline for {:?}: {}", root, e);
            }
        }
    }

    fn repo_config(&self, root: &Path) -> Config {
        Config {
            root_path: root.to_path_buf(),
            index_dir: root.join(INDEX_DIR_NAME),
            ..self.options.config.clone()
        }
    }

    /// Cached index for `root`, built on first use; `None` when nothing was scanned
    fn lexical_index(&mut self, root: &Path) -> Result<Option<&LexicalIndex>> {
        if !self.indexes.contains_key(root) {
            let config = self.repo_config(root);
            config.validate()?;
            let ignore = IgnoreSet::resolve(root, config.default_ignore_file.as_deref());
            let chunks = Scanner::new(&config).scan(root, &ignore)?;
            if chunks.is_empty() {
                return Ok(None);
            }
            let index = LexicalIndex::build(chunks);
            info!(
                "Indexed {:?}: {} chunks, {} tokens",
                root,
                index.chunk_count(),
                index.token_count()
            );
            self.indexes.insert(root.to_path_buf(), index);
        }
        Ok(self.indexes.get(root))
    }

    fn lexical_search(&mut self, root: &Path, query: &str) -> Result<Option<Vec<SearchResult>>> {
        let Some(index) = self.lexical_index(root)? else {
            return Ok(None);
        };

        Ok(Some(
            index
                .query(query)
                .into_iter()
                .filter_map(|m| {
                    index.chunk(m.chunk_index).map(|chunk| SearchResult {
                        chunk: chunk.clone(),
                        score: m.score as f32,
                    })
                })
                .collect(),
        ))
    }

    fn shared_embedder(&mut self) -> Result<SharedEmbedder> {
        if let Some(embedder) = &self.embedder {
            return Ok(Arc::clone(embedder));
        }
        let config = &self.options.config;
        let loaded: SharedEmbedder = Arc::new(Embedder::new(&config.model, &config.model_cache_dir)?);
        self.embedder = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    fn semantic_search(&mut self, root: &Path, query: &str) -> Result<Vec<SearchResult>> {
        if !self.pipelines.contains_key(root) {
            let embedder = self.shared_embedder()?;
            let mut pipeline = IndexingPipeline::with_local_store(self.repo_config(root), embedder);
            pipeline.index_repository()?;
            self.pipelines.insert(root.to_path_buf(), pipeline);
        }

        let limit = self.options.config.max_results;
        let result = self
            .pipelines
            .get(root)
            .ok_or(SearchError::NoIndex)?
            .search(query, limit);
        if result.is_err() {
            self.forget(root);
        }
        result
    }
}

fn resolve_root(repository_path: Option<&str>) -> Result<PathBuf> {
    let path = match repository_path {
        Some(p) => PathBuf::from(p),
        None => std::env::current_dir()?,
    };
    if !path.is_dir() {
        return Err(SearchError::InvalidPath(path.display().to_string()));
    }
    Ok(path.canonicalize()?)
}

struct SearchJob {
    id: i64,
    query: String,
    repository_path: Option<String>,
    reindex: bool,
}

/// Run the unit's message loop until the input closes
pub async fn run_worker<R, W>(reader: R, writer: W, options: WorkerOptions) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let (job_tx, job_rx) = mpsc::unbounded_channel::<SearchJob>();

    let writer_task = tokio::spawn(write_messages(writer, out_rx));
    let jobs_task = tokio::spawn(process_jobs(options, job_rx, out_tx.clone()));

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim(),
            Err(e) => {
                warn!("Request is not valid UTF-8: {}", e);
                let fault = WorkerMessage::fault(PROBE_ID, format!("Malformed request: {}", e));
                if out_tx.send(fault).is_err() {
                    break;
                }
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }

        let message = match serde_json::from_str::<WorkerRequest>(line) {
            Ok(WorkerRequest {
                id,
                body: RequestBody::HealthCheck,
            }) => Some(WorkerMessage::pong(id)),
            Ok(WorkerRequest {
                id,
                body:
                    RequestBody::Search {
                        query,
                        repository_path,
                        reindex,
                    },
            }) => {
                let job = SearchJob {
                    id,
                    query,
                    repository_path,
                    reindex,
                };
                if job_tx.send(job).is_err() {
                    return Err(SearchError::Worker("job processor stopped".into()));
                }
                None
            }
            Err(e) => {
                let id = request_id(line).unwrap_or(PROBE_ID);
                warn!(id, "Malformed request: {}", e);
                Some(WorkerMessage::fault(id, format!("Malformed request: {}", e)))
            }
        };

        if let Some(message) = message {
            if out_tx.send(message).is_err() {
                break;
            }
        }
    }

    drop(job_tx);
    drop(out_tx);
    if let Err(e) = jobs_task.await {
        error!("Job processor failed: {}", e);
    }
    writer_task
        .await
        .map_err(|e| SearchError::Worker(e.to_string()))?
}

fn request_id(line: &str) -> Option<i64> {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()?
        .get("id")?
        .as_i64()
}

async fn write_messages<W>(mut writer: W, mut messages: mpsc::UnboundedReceiver<WorkerMessage>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = messages.recv().await {
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn process_jobs(
    options: WorkerOptions,
    mut jobs: mpsc::UnboundedReceiver<SearchJob>,
    out: mpsc::UnboundedSender<WorkerMessage>,
) {
    let mut context = Some(WorkerContext::new(options.clone()));

    while let Some(job) = jobs.recv().await {
        let mut ctx = context
            .take()
            .unwrap_or_else(|| WorkerContext::new(options.clone()));
        let id = job.id;

        let handle = tokio::task::spawn_blocking(move || {
            let outcome = ctx.search(&job.query, job.repository_path.as_deref(), job.reindex);
            (ctx, outcome)
        });

        let message = match handle.await {
            Ok((ctx, outcome)) => {
                context = Some(ctx);
                WorkerMessage::result(id, outcome)
            }
            Err(e) => {
                let reason = panic_message(e);
                error!(id, "Search panicked, resetting worker context: {}", reason);
                WorkerMessage::fault(id, reason)
            }
        };

        if out.send(message).is_err() {
            break;
        }
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Run the unit over the process's stdin and stdout
pub async fn run_stdio_worker(options: WorkerOptions) -> Result<()> {
    info!("Worker started (pid {})", std::process::id());
    run_worker(tokio::io::stdin(), tokio::io::stdout(), options).await
}
