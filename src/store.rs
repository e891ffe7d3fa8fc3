//! Vector store using usearch (HNSW algorithm)
//!
//! Persists chunk vectors and their metadata in the repository's index
//! directory. Every upsert replaces the previous content entirely.

use crate::error::{Result, SearchError};
use crate::scanner::Chunk;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

/// A chunk paired with its embedding
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// A stored chunk returned by a nearest-neighbour query
#[derive(Debug, Clone)]
pub struct NearestRecord {
    pub chunk: Chunk,
    /// Cosine distance reported by the index
    pub distance: f32,
}

impl NearestRecord {
    /// Similarity score in `0.0..=1.0`
    pub fn score(&self) -> f32 {
        distance_to_score(self.distance)
    }
}

/// Map a store distance to a similarity score
pub fn distance_to_score(distance: f32) -> f32 {
    1.0 - distance.clamp(0.0, 1.0)
}

/// Storage and similarity search over chunk vectors
pub trait VectorStore: Send {
    /// Open (or create) the store rooted at `path`
    fn open(&mut self, path: &Path) -> Result<()>;

    /// Replace the whole store content with `records`
    fn upsert_all(&mut self, records: Vec<VectorRecord>) -> Result<()>;

    /// Nearest records to `vector`, closest first
    fn query_nearest(&self, vector: &[f32], limit: usize) -> Result<Vec<NearestRecord>>;

    /// Release the handle; later calls fail until reopened
    fn close(&mut self) -> Result<()>;
}

/// Metadata persisted alongside the vectors
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreMetadata {
    /// Chunks in key order (key = position)
    pub chunks: Vec<Chunk>,
    /// Model name used to create embeddings
    pub model_name: String,
    /// Embedding vector dimension
    pub dimension: usize,
}

struct OpenStore {
    dir: PathBuf,
    index: Index,
    metadata: StoreMetadata,
}

/// File-backed HNSW store
pub struct HnswStore {
    model_name: String,
    dimension: usize,
    inner: Option<OpenStore>,
}

impl HnswStore {
    /// Create a closed store with an explicit dimension
    pub fn with_dimension(model_name: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_name: model_name.into(),
            dimension,
            inner: None,
        }
    }

    /// Check if the store currently holds an open handle
    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Get total number of stored chunks
    pub fn chunk_count(&self) -> usize {
        self.inner
            .as_ref()
            .map(|s| s.metadata.chunks.len())
            .unwrap_or(0)
    }

    fn index_options(dimension: usize) -> IndexOptions {
        IndexOptions {
            dimensions: dimension,
            metric: MetricKind::Cos, // Cosine similarity
            quantization: ScalarKind::F32,
            connectivity: 16,     // M parameter for HNSW
            expansion_add: 128,   // ef_construction
            expansion_search: 64, // ef
            multi: false,
        }
    }

    fn new_index(dimension: usize) -> Result<Index> {
        Index::new(&Self::index_options(dimension)).map_err(|e| SearchError::Store(e.to_string()))
    }

    fn open_store(&self) -> Result<&OpenStore> {
        self.inner
            .as_ref()
            .ok_or_else(|| SearchError::Store("store is closed".to_string()))
    }

    fn save(store: &OpenStore) -> Result<()> {
        std::fs::create_dir_all(&store.dir)?;

        let index_path = store.dir.join("vectors.usearch");
        let metadata_path = store.dir.join("metadata.bin");

        store
            .index
            .save(&path_str(&index_path)?)
            .map_err(|e| SearchError::Store(e.to_string()))?;
        std::fs::write(&metadata_path, bincode::serialize(&store.metadata)?)?;

        info!(
            "Saved {} vectors, {} chunks to {:?}",
            store.index.size(),
            store.metadata.chunks.len(),
            store.dir
        );
        Ok(())
    }
}

impl VectorStore for HnswStore {
    fn open(&mut self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;

        let index_path = path.join("vectors.usearch");
        let metadata_path = path.join("metadata.bin");

        let (index, metadata) = if index_path.exists() && metadata_path.exists() {
            info!("Loading store from {:?}", index_path);
            let metadata: StoreMetadata = bincode::deserialize(&std::fs::read(&metadata_path)?)?;
            let index = Self::new_index(metadata.dimension)?;
            index
                .load(&path_str(&index_path)?)
                .map_err(|e| SearchError::Store(e.to_string()))?;
            (index, metadata)
        } else {
            let metadata = StoreMetadata {
                chunks: Vec::new(),
                model_name: self.model_name.clone(),
                dimension: self.dimension,
            };
            (Self::new_index(self.dimension)?, metadata)
        };

        self.inner = Some(OpenStore {
            dir: path.to_path_buf(),
            index,
            metadata,
        });
        Ok(())
    }

    fn upsert_all(&mut self, records: Vec<VectorRecord>) -> Result<()> {
        let dimension = self.dimension;
        let model_name = self.model_name.clone();
        let store = self
            .inner
            .as_mut()
            .ok_or_else(|| SearchError::Store("store is closed".to_string()))?;

        if let Some(bad) = records.iter().find(|r| r.vector.len() != dimension) {
            return Err(SearchError::Store(format!(
                "vector for {} has dimension {}, expected {}",
                bad.chunk.file_path,
                bad.vector.len(),
                dimension
            )));
        }

        let index = Self::new_index(dimension)?;
        index
            .reserve(records.len())
            .map_err(|e| SearchError::Store(e.to_string()))?;

        let mut chunks = Vec::with_capacity(records.len());
        for (key, record) in records.into_iter().enumerate() {
            index
                .add(key as u64, &record.vector)
                .map_err(|e| SearchError::Store(e.to_string()))?;
            debug!("Added chunk {} from {}", key, record.chunk.file_path);
            chunks.push(record.chunk);
        }

        store.index = index;
        store.metadata = StoreMetadata {
            chunks,
            model_name,
            dimension,
        };

        Self::save(store)
    }

    fn query_nearest(&self, vector: &[f32], limit: usize) -> Result<Vec<NearestRecord>> {
        let store = self.open_store()?;
        if store.index.size() == 0 || limit == 0 {
            return Ok(vec![]);
        }

        let matches = store
            .index
            .search(vector, limit)
            .map_err(|e| SearchError::Store(e.to_string()))?;

        let mut records: Vec<NearestRecord> = matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .filter_map(|(key, distance)| {
                store
                    .metadata
                    .chunks
                    .get(*key as usize)
                    .map(|chunk| NearestRecord {
                        chunk: chunk.clone(),
                        distance: *distance,
                    })
            })
            .collect();

        records.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(records)
    }

    fn close(&mut self) -> Result<()> {
        if self.inner.take().is_some() {
            debug!("Closed vector store");
        }
        Ok(())
    }
}

fn path_str(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| SearchError::InvalidPath(path.display().to_string()))
}
