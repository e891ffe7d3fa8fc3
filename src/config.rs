//! Configuration types and constants for code-search
//!
//! Defines embedding models, scan/index configuration, supervisor timing,
//! and the extension tables used for file filtering and scoring.

use crate::error::{Result, SearchError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-repository directory holding persisted index data
pub const INDEX_DIR_NAME: &str = ".code-search";

/// Supported embedding models (all run locally via ONNX)
///
/// These models are downloaded on first use and cached locally.
/// No API keys or network access required after initial download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EmbeddingModel {
    /// Fast, small model (384 dims, ~30MB) - good for most use cases
    #[default]
    AllMiniLmL6V2,
    /// Higher quality (384 dims, ~90MB) - better semantic understanding
    BgeSmallEnV15,
    /// Best quality for code (768 dims, ~90MB)
    NomicEmbedTextV15,
    /// Multilingual support (384 dims, ~470MB)
    MultilingualE5Small,
}

impl EmbeddingModel {
    /// Get the HuggingFace model identifier
    pub fn model_name(&self) -> &'static str {
        match self {
            Self::AllMiniLmL6V2 => "sentence-transformers/all-MiniLM-L6-v2",
            Self::BgeSmallEnV15 => "BAAI/bge-small-en-v1.5",
            Self::NomicEmbedTextV15 => "nomic-ai/nomic-embed-text-v1.5",
            Self::MultilingualE5Small => "intfloat/multilingual-e5-small",
        }
    }

    /// Get the embedding vector dimension
    pub fn dimension(&self) -> usize {
        match self {
            Self::AllMiniLmL6V2 => 384,
            Self::BgeSmallEnV15 => 384,
            Self::NomicEmbedTextV15 => 768,
            Self::MultilingualE5Small => 384,
        }
    }

    /// Short name accepted on the command line
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::AllMiniLmL6V2 => "minilm",
            Self::BgeSmallEnV15 => "bge",
            Self::NomicEmbedTextV15 => "nomic",
            Self::MultilingualE5Small => "multilingual",
        }
    }
}

impl std::str::FromStr for EmbeddingModel {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "minilm" | "all-minilm-l6-v2" | "default" => Ok(Self::AllMiniLmL6V2),
            "bge" | "bge-small" | "bge-small-en-v1.5" => Ok(Self::BgeSmallEnV15),
            "nomic" | "nomic-embed" | "nomic-embed-text-v1.5" => Ok(Self::NomicEmbedTextV15),
            "multilingual" | "e5" | "multilingual-e5-small" => Ok(Self::MultilingualE5Small),
            _ => Err(SearchError::Config(format!(
                "Unknown model: {}. Valid options: minilm, bge, nomic, multilingual",
                s
            ))),
        }
    }
}

/// Configuration for scanning, indexing and search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory being indexed
    pub root_path: PathBuf,
    /// Directory to store index data
    pub index_dir: PathBuf,
    /// Embedding model to use
    pub model: EmbeddingModel,
    /// Chunk size in lines
    pub chunk_size: usize,
    /// Overlap between consecutive chunks in lines
    pub chunk_overlap: usize,
    /// Maximum file size to index (bytes)
    pub max_file_size: u64,
    /// Number of texts sent to the embedding model at once
    pub batch_size: usize,
    /// Number of results included in a search report
    pub max_results: usize,
    /// Number of parallel workers for reading files
    pub workers: usize,
    /// Replaces the built-in default ignore list when present on disk
    pub default_ignore_file: Option<PathBuf>,
    /// Where downloaded embedding models are cached
    pub model_cache_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("."),
            index_dir: PathBuf::from(INDEX_DIR_NAME),
            model: EmbeddingModel::default(),
            chunk_size: 1000,
            chunk_overlap: 200,
            max_file_size: 5 * 1024 * 1024, // 5 MiB
            batch_size: 32,
            max_results: 10,
            workers: num_cpus::get(),
            default_ignore_file: None,
            model_cache_dir: default_model_cache_dir(),
        }
    }
}

impl Config {
    /// Create a new config for the given root path
    pub fn new(root_path: PathBuf) -> Self {
        let index_dir = root_path.join(INDEX_DIR_NAME);
        Self {
            root_path,
            index_dir,
            ..Default::default()
        }
    }

    /// Set the embedding model
    pub fn with_model(mut self, model: EmbeddingModel) -> Self {
        self.model = model;
        self
    }

    /// Set the chunk window and overlap, both in lines
    pub fn with_chunking(mut self, size: usize, overlap: usize) -> Self {
        self.chunk_size = size;
        self.chunk_overlap = overlap;
        self
    }

    /// Set the embedding batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set an on-disk file that overrides the built-in ignore list
    pub fn with_default_ignore_file(mut self, path: PathBuf) -> Self {
        self.default_ignore_file = Some(path);
        self
    }

    /// Get path to the vector index file
    pub fn index_path(&self) -> PathBuf {
        self.index_dir.join("vectors.usearch")
    }

    /// Get path to the metadata file
    pub fn metadata_path(&self) -> PathBuf {
        self.index_dir.join("metadata.bin")
    }

    /// Get path to the config file
    pub fn config_path(&self) -> PathBuf {
        self.index_dir.join("config.json")
    }

    /// Reject settings that would make chunking loop forever
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_overlap >= self.chunk_size {
            return Err(SearchError::Config(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.batch_size == 0 {
            return Err(SearchError::Config("batch size must be positive".into()));
        }
        Ok(())
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.index_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(self.config_path(), json)?;
        Ok(())
    }

    /// Load configuration from disk
    pub fn load(index_dir: &Path) -> Result<Self> {
        let config_path = index_dir.join("config.json");
        if !config_path.exists() {
            return Err(SearchError::NoIndex);
        }
        let json = std::fs::read_to_string(config_path)?;
        let config: Config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

fn default_model_cache_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".cache")
        .join("code-search")
        .join("models")
}

/// Timing knobs for the worker supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// First restart delay after a crash
    pub restart_floor: Duration,
    /// Upper bound for the restart delay
    pub restart_ceiling: Duration,
    /// Interval between liveness probes
    pub health_interval: Duration,
    /// How long a caller waits for a worker reply
    pub request_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_floor: Duration::from_secs(1),
            restart_ceiling: Duration::from_secs(60),
            health_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(600),
        }
    }
}

impl SupervisorConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }
}

/// File extensions that should be indexed
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    // JavaScript/TypeScript
    "js", "ts", "tsx", "jsx", "mjs", "cjs",
    // Python
    "py", "pyw", "pyi",
    // Go
    "go",
    // Rust
    "rs",
    // JVM
    "java", "kt", "scala", "groovy", "gradle",
    // C/C++
    "c", "h", "cpp", "cc", "cxx", "hpp", "hxx",
    // Ruby
    "rb", "erb",
    // PHP
    "php",
    // C#
    "cs", "csx",
    // Swift / Objective-C
    "swift", "m", "mm",
    // Shell
    "sh", "bash", "zsh",
    // SQL
    "sql",
    // Scripting
    "r", "lua", "pl", "pm",
    // Data / config
    "xml", "xsd", "json", "jsonc", "yaml", "yml", "toml",
    // Web
    "html", "htm", "css", "scss", "sass", "less", "vue", "svelte",
    // Documentation
    "md", "markdown",
];

/// Extensions that are never read, regardless of the allowlist
pub const BINARY_EXTENSIONS: &[&str] = &[
    // Archives
    "zip", "tar", "gz", "rar", "7z", "iso",
    // Executables / libraries
    "exe", "dll", "so", "dylib", "bin",
    // Images
    "jpg", "jpeg", "png", "gif", "bmp", "svg", "ico",
    // Audio / video
    "mp3", "mp4", "mov", "avi", "flv", "m4a",
    // Documents
    "pdf", "doc", "docx", "xls", "xlsx",
    // Fonts
    "woff", "woff2", "ttf", "otf", "eot",
];

/// Extensions whose chunks receive the source-code score multiplier
pub const CODE_EXTENSIONS: &[&str] = &["js", "ts", "jsx", "tsx", "py", "java", "go", "rs", "rb"];

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

/// Check if a file should be indexed based on its extension
pub fn should_index_file(path: &Path) -> bool {
    extension_of(path)
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Check if a file has a known binary/media extension
pub fn is_binary_file(path: &Path) -> bool {
    extension_of(path)
        .map(|ext| BINARY_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Check if a file is recognized source code (case-sensitive, like the file name on disk)
pub fn is_code_file(file_path: &str) -> bool {
    Path::new(file_path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| CODE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}
