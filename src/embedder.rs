//! Local embedding generation using fastembed (ONNX runtime)
//!
//! Generates embeddings entirely locally - no API calls required.
//! Models are downloaded once and cached under the configured model cache dir.

use crate::config::EmbeddingModel;
use crate::error::{Result, SearchError};
use crate::retry::RetryOnce;
use fastembed::{EmbeddingModel as FastEmbedModel, InitOptions, TextEmbedding};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Turns texts into fixed-dimension vectors, same length and order as the input
pub trait EmbeddingGenerator: Send + Sync {
    /// Embed a batch; empty input yields an empty output
    fn generate(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Dimension of every produced vector
    fn dimension(&self) -> usize;
}

/// Local embedder using fastembed with ONNX runtime
pub struct Embedder {
    model: TextEmbedding,
    dimension: usize,
}

impl Embedder {
    /// Create a new embedder with the specified model
    ///
    /// On first use, downloads the model from HuggingFace (~30-470MB).
    /// A load failure that looks like a corrupted cache clears `cache_dir`
    /// and tries once more.
    pub fn new(model_config: &EmbeddingModel, cache_dir: &Path) -> Result<Self> {
        info!("Loading embedding model: {:?}", model_config);

        let policy = RetryOnce::new();
        let model = policy.run(
            || load_model(model_config, cache_dir),
            is_corrupted_cache,
            || clear_model_cache(cache_dir),
        )?;

        let dimension = model_config.dimension();
        info!("Model loaded successfully (dimension: {})", dimension);

        Ok(Self { model, dimension })
    }
}

impl EmbeddingGenerator for Embedder {
    fn generate(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let batch: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
        self.model
            .embed(batch, None)
            .map_err(|e| SearchError::Embedding(e.to_string()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

impl<G: EmbeddingGenerator + ?Sized> EmbeddingGenerator for std::sync::Arc<G> {
    fn generate(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        (**self).generate(texts)
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }
}

fn load_model(model_config: &EmbeddingModel, cache_dir: &Path) -> Result<TextEmbedding> {
    let fastembed_model = match model_config {
        EmbeddingModel::AllMiniLmL6V2 => FastEmbedModel::AllMiniLML6V2,
        EmbeddingModel::BgeSmallEnV15 => FastEmbedModel::BGESmallENV15,
        EmbeddingModel::NomicEmbedTextV15 => FastEmbedModel::NomicEmbedTextV15,
        EmbeddingModel::MultilingualE5Small => FastEmbedModel::MultilingualE5Small,
    };

    TextEmbedding::try_new(
        InitOptions::new(fastembed_model)
            .with_cache_dir(PathBuf::from(cache_dir))
            .with_show_download_progress(false),
    )
    .map_err(|e| SearchError::Embedding(e.to_string()))
}

/// A model file that fails to decode means the cached download is damaged
pub fn is_corrupted_cache(error: &SearchError) -> bool {
    match error {
        SearchError::Embedding(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("protobuf") || msg.contains("parsing")
        }
        _ => false,
    }
}

fn clear_model_cache(cache_dir: &Path) {
    if !cache_dir.exists() {
        return;
    }
    match std::fs::remove_dir_all(cache_dir) {
        Ok(()) => info!("Cleared corrupted model cache at {:?}", cache_dir),
        Err(e) => warn!("Could not clear model cache {:?}: {}", cache_dir, e),
    }
}

/// Embed texts in fixed-size batches, preserving input order
///
/// Every batch must come back with one vector per text.
pub fn embed_in_batches<G, F>(
    generator: &G,
    texts: &[String],
    batch_size: usize,
    mut progress: F,
) -> Result<Vec<Vec<f32>>>
where
    G: EmbeddingGenerator + ?Sized,
    F: FnMut(usize, usize),
{
    let total = texts.len();
    let mut all_embeddings = Vec::with_capacity(total);

    for batch in texts.chunks(batch_size.max(1)) {
        let embeddings = generator.generate(batch)?;
        if embeddings.len() != batch.len() {
            return Err(SearchError::Embedding(format!(
                "expected {} embeddings, got {}",
                batch.len(),
                embeddings.len()
            )));
        }
        all_embeddings.extend(embeddings);
        progress(all_embeddings.len(), total);
    }

    Ok(all_embeddings)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Normalize embedding vector to unit length (for cosine similarity)
    fn normalize(embedding: &mut [f32]) {
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in embedding.iter_mut() {
                *x /= norm;
            }
        }
    }

    /// Deterministic generator: vector built from byte statistics of the text
    pub(crate) struct HashEmbedder {
        pub calls: AtomicUsize,
    }

    impl HashEmbedder {
        pub fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl EmbeddingGenerator for HashEmbedder {
        fn generate(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0_f32; 4];
                    for (i, b) in t.bytes().enumerate() {
                        v[i % 4] += f32::from(b);
                    }
                    v[3] += t.len() as f32;
                    normalize(&mut v);
                    v
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            4
        }
    }

    struct FailingEmbedder;

    impl EmbeddingGenerator for FailingEmbedder {
        fn generate(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(SearchError::Embedding("inference failed".into()))
        }

        fn dimension(&self) -> usize {
            4
        }
    }

    #[test]
    fn test_batches_preserve_order_and_count() {
        let embedder = HashEmbedder::new();
        let texts: Vec<String> = (0..70).map(|i| format!("text {}", i)).collect();
        let mut seen = Vec::new();

        let vectors = embed_in_batches(&embedder, &texts, 32, |done, total| seen.push((done, total))).unwrap();

        assert_eq!(vectors.len(), 70);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
        assert_eq!(seen, vec![(32, 70), (64, 70), (70, 70)]);
        let expected = embedder.generate(&texts[40..41]).unwrap();
        assert_eq!(vectors[40], expected[0]);
    }

    #[test]
    fn test_empty_input_yields_empty_output() {
        let embedder = HashEmbedder::new();
        assert!(embedder.generate(&[]).unwrap().is_empty());
        let vectors = embed_in_batches(&embedder, &[], 32, |_, _| {}).unwrap();
        assert!(vectors.is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failures_propagate() {
        let texts = vec!["a".to_string()];
        let result = embed_in_batches(&FailingEmbedder, &texts, 8, |_, _| {});
        assert!(matches!(result, Err(SearchError::Embedding(_))));
    }

    #[test]
    fn test_corrupted_cache_classification() {
        assert!(is_corrupted_cache(&SearchError::Embedding(
            "Protobuf parsing failed".into()
        )));
        assert!(!is_corrupted_cache(&SearchError::Embedding("timeout".into())));
        assert!(!is_corrupted_cache(&SearchError::NoIndex));
    }
}
