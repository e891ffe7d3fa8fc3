//! Repository scanning and line-window chunking
//!
//! Walks a repository depth-first, prunes ignored subtrees, keeps supported
//! text files under the size limit, and splits them into overlapping
//! line-range chunks. Per-entry failures are skipped, never fatal.

use crate::config::{is_binary_file, should_index_file, Config};
use crate::error::{Result, SearchError};
use crate::ignore_rules::IgnoreSet;
use ignore::WalkBuilder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info};

/// A contiguous line range of one file, the unit of indexing and retrieval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Source file path (relative to the scan root, `/`-separated)
    pub file_path: String,
    /// Position of this chunk within its file (0 for single-chunk files)
    pub chunk_index: usize,
    /// The text content
    pub content: String,
    /// Starting line number (1-indexed, inclusive)
    pub line_start: usize,
    /// Ending line number (1-indexed, inclusive)
    pub line_end: usize,
    /// File modification time in milliseconds since the Unix epoch
    pub mtime: u64,
}

/// One line window produced by [`chunk_lines`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineWindow {
    pub content: String,
    pub line_start: usize,
    pub line_end: usize,
}

/// File selected by the walk, not yet read
#[derive(Debug)]
struct FileToScan {
    path: PathBuf,
    relative_path: String,
}

/// Walks a repository and turns its files into chunks
pub struct Scanner {
    chunk_size: usize,
    chunk_overlap: usize,
    max_file_size: u64,
    workers: usize,
}

impl Scanner {
    /// Create a scanner from the chunking and size settings of `config`
    pub fn new(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            max_file_size: config.max_file_size,
            workers: config.workers.max(1),
        }
    }

    /// Scan `root`, producing chunks in walk order then chunk order
    pub fn scan(&self, root: &Path, ignore: &IgnoreSet) -> Result<Vec<Chunk>> {
        if !root.is_dir() {
            return Err(SearchError::InvalidPath(root.display().to_string()));
        }

        let files = self.discover_files(root, ignore);
        debug!("Discovered {} candidate files under {:?}", files.len(), root);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| SearchError::Config(e.to_string()))?;

        // `collect` on an indexed parallel iterator keeps the walk order.
        let per_file: Vec<Vec<Chunk>> =
            pool.install(|| files.par_iter().map(|file| self.chunk_file(file)).collect());

        let chunks: Vec<Chunk> = per_file.into_iter().flatten().collect();
        info!("Scanned {} files into {} chunks", files.len(), chunks.len());

        Ok(chunks)
    }

    /// Walk the tree, pruning ignored entries before they are visited
    fn discover_files(&self, root: &Path, ignore: &IgnoreSet) -> Vec<FileToScan> {
        let rules = Arc::new(ignore.clone());
        let filter_root = root.to_path_buf();

        let walker = WalkBuilder::new(root)
            .standard_filters(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                match relative_path(&filter_root, entry.path()) {
                    Some(rel) => !rules.matches(&rel),
                    None => false,
                }
            })
            .build();

        walker
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
            .filter(|entry| !is_binary_file(entry.path()) && should_index_file(entry.path()))
            .filter(|entry| {
                entry
                    .metadata()
                    .map(|m| m.len() <= self.max_file_size)
                    .unwrap_or(false)
            })
            .filter_map(|entry| {
                let relative_path = relative_path(root, entry.path())?;
                Some(FileToScan {
                    path: entry.into_path(),
                    relative_path,
                })
            })
            .collect()
    }

    /// Read one file and split it; read failures yield no chunks
    fn chunk_file(&self, file: &FileToScan) -> Vec<Chunk> {
        let bytes = match std::fs::read(&file.path) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Skipping unreadable file {}: {}", file.relative_path, e);
                return vec![];
            }
        };
        let content = String::from_utf8(bytes)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
        let mtime = modification_millis(&file.path);

        let line_count = content.split('\n').count();
        if line_count <= self.chunk_size {
            if content.trim().is_empty() {
                return vec![];
            }
            return vec![Chunk {
                file_path: file.relative_path.clone(),
                chunk_index: 0,
                content,
                line_start: 1,
                line_end: line_count,
                mtime,
            }];
        }

        chunk_lines(&content, self.chunk_size, self.chunk_overlap)
            .into_iter()
            .enumerate()
            .map(|(chunk_index, window)| Chunk {
                file_path: file.relative_path.clone(),
                chunk_index,
                content: window.content,
                line_start: window.line_start,
                line_end: window.line_end,
                mtime,
            })
            .collect()
    }
}

/// Split text into windows of `chunk_size` lines advancing by `chunk_size - overlap`
///
/// The last window is clipped to the final line and ends the split.
/// Windows that are blank after trimming are dropped.
pub fn chunk_lines(content: &str, chunk_size: usize, overlap: usize) -> Vec<LineWindow> {
    let lines: Vec<&str> = content.split('\n').collect();
    let chunk_size = chunk_size.max(1);
    let stride = chunk_size.saturating_sub(overlap).max(1);

    let mut windows = Vec::new();
    let mut start = 0;

    while start < lines.len() {
        let end = (start + chunk_size).min(lines.len());
        let text = lines[start..end].join("\n");

        if !text.trim().is_empty() {
            windows.push(LineWindow {
                content: text,
                line_start: start + 1,
                line_end: end,
            });
        }

        if end == lines.len() {
            break;
        }
        start += stride;
    }

    windows
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(rel.to_string_lossy().replace('\\', "/"))
}

fn modification_millis(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
