//! Semantic indexing pipeline
//!
//! Scans a repository, embeds the chunks in batches, and replaces the
//! vector store content with the result. The store handle is closed on
//! every failure before the error is returned.

use crate::config::{Config, INDEX_DIR_NAME};
use crate::embedder::{embed_in_batches, EmbeddingGenerator};
use crate::error::{Result, SearchError};
use crate::ignore_rules::IgnoreSet;
use crate::protocol::SearchResult;
use crate::scanner::{Chunk, Scanner};
use crate::store::{HnswStore, VectorRecord, VectorStore};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// Outcome of one indexing pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSummary {
    /// Number of distinct files that produced chunks
    pub files: usize,
    /// Number of chunks written to the store
    pub chunks: usize,
}

impl std::fmt::Display for IndexSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Indexed {} files, {} chunks", self.files, self.chunks)
    }
}

/// Scan, embed and store one repository
pub struct IndexingPipeline<E: EmbeddingGenerator, S: VectorStore> {
    config: Config,
    embedder: E,
    store: S,
    show_progress: bool,
    ready: bool,
}

impl<E: EmbeddingGenerator> IndexingPipeline<E, HnswStore> {
    /// Pipeline writing to the HNSW store in the configured index dir
    pub fn with_local_store(config: Config, embedder: E) -> Self {
        let store = HnswStore::with_dimension(config.model.model_name(), embedder.dimension());
        Self::new(config, embedder, store)
    }
}

impl<E: EmbeddingGenerator, S: VectorStore> IndexingPipeline<E, S> {
    pub fn new(config: Config, embedder: E, store: S) -> Self {
        Self {
            config,
            embedder,
            store,
            show_progress: false,
            ready: false,
        }
    }

    /// Draw progress bars on stderr while indexing
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Whether a pass has completed and the store is open for queries
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Scan the configured root and index everything found
    pub fn index_repository(&mut self) -> Result<IndexSummary> {
        self.config.validate()?;
        let root = self.config.root_path.canonicalize()?;
        info!("Building fresh index for {:?}", root);

        let ignore = IgnoreSet::resolve(&root, self.config.default_ignore_file.as_deref());
        let chunks = Scanner::new(&self.config).scan(&root, &ignore)?;

        ensure_ignore_entry(&root);
        self.index_chunks(chunks)
    }

    /// Embed `chunks` and replace the store content with them
    pub fn index_chunks(&mut self, chunks: Vec<Chunk>) -> Result<IndexSummary> {
        self.ready = false;
        let result = self.try_index_chunks(chunks);

        if result.is_err() {
            if let Err(e) = self.store.close() {
                warn!("Failed to close vector store after error: {}", e);
            }
        } else {
            self.ready = true;
        }

        result
    }

    fn try_index_chunks(&mut self, chunks: Vec<Chunk>) -> Result<IndexSummary> {
        let pb = self.progress_bar(chunks.len() as u64, "chunks embedded");

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = embed_in_batches(&self.embedder, &texts, self.config.batch_size, |done, _| {
            pb.set_position(done as u64);
        })?;
        pb.finish_with_message("Embeddings generated");

        let mut files: Vec<&str> = chunks.iter().map(|c| c.file_path.as_str()).collect();
        files.dedup();
        let summary = IndexSummary {
            files: files.len(),
            chunks: chunks.len(),
        };

        let records: Vec<VectorRecord> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, vector)| VectorRecord { chunk, vector })
            .collect();

        self.store.open(&self.config.index_dir)?;
        self.store.upsert_all(records)?;
        self.config.save()?;

        info!("{}", summary);
        Ok(summary)
    }

    /// Nearest chunks to `query`, best first
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Err(SearchError::InvalidQuery("query cannot be empty".into()));
        }
        if !self.ready {
            return Err(SearchError::NoIndex);
        }

        let vector = self
            .embedder
            .generate(&[query.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| SearchError::Embedding("No embedding returned".to_string()))?;

        Ok(self
            .store
            .query_nearest(&vector, limit)?
            .into_iter()
            .map(|record| SearchResult {
                score: record.score(),
                chunk: record.chunk,
            })
            .collect())
    }

    /// Release the store handle
    pub fn close(&mut self) -> Result<()> {
        self.ready = false;
        self.store.close()
    }

    fn progress_bar(&self, len: u64, what: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        let template = format!("{{spinner:.green}} [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {}", what);
        if let Ok(style) = ProgressStyle::default_bar().template(&template) {
            pb.set_style(style.progress_chars("=>-"));
        }
        pb
    }
}

impl<E: EmbeddingGenerator, S: VectorStore> Drop for IndexingPipeline<E, S> {
    fn drop(&mut self) {
        if let Err(e) = self.store.close() {
            warn!("Failed to close vector store: {}", e);
        }
    }
}

/// Make sure the repository's `.gitignore` excludes the index directory
///
/// Best effort: write failures are logged and otherwise ignored.
pub fn ensure_ignore_entry(root: &Path) {
    let gitignore = root.join(".gitignore");
    let entry = format!("{}/", INDEX_DIR_NAME);

    let result = match std::fs::read_to_string(&gitignore) {
        Ok(content) if content.lines().any(|l| l.trim() == entry || l.trim() == INDEX_DIR_NAME) => {
            return;
        }
        Ok(content) => std::fs::OpenOptions::new()
            .append(true)
            .open(&gitignore)
            .and_then(|mut f| {
                let sep = if content.is_empty() || content.ends_with('\n') { "" } else { "\n" };
                write!(f, "{}{}\n", sep, entry)
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::write(&gitignore, format!("{}\n", entry))
        }
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        warn!("Could not update {:?}: {}", gitignore, e);
    }
}
