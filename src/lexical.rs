//! In-memory lexical index and scorer
//!
//! Ranks chunks by token overlap, declared-symbol hits and literal matches,
//! without any external ranking library. Built once per chunk set and
//! queried many times; a new scan means a new index.
//!
//! Scoring per chunk:
//! - every query token the chunk contains adds `boost * frequency`, with a
//!   1.5 boost for tokens longer than four characters
//! - every query symbol declared in the chunk adds 5
//! - the raw query appearing verbatim in the chunk adds 10
//! - source-code files multiply the sum by 1.2
//!
//! Reported scores are `min(raw / 100, 1)`; ordering uses the raw score and
//! keeps enumeration order for ties.

use crate::config::is_code_file;
use crate::scanner::Chunk;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::LazyLock;

const LONG_TOKEN_BOOST: f64 = 1.5;
const SYMBOL_BONUS: f64 = 5.0;
const EXACT_MATCH_BONUS: f64 = 10.0;
const CODE_MULTIPLIER: f64 = 1.2;
const SCORE_SCALE: f64 = 100.0;

static CAMEL_PIECE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z]+|[A-Z][a-z]*|[0-9]+").unwrap());

static FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:function\s*\*?|fn|def|func)\s+([A-Za-z_$][\w$]*)").unwrap()
});

static CONST_FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bconst\s+([A-Za-z_$][\w$]*)\s*=\s*(?:async\s*)?(?:function\b|\()").unwrap()
});

static CLASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bclass\s+([A-Za-z_$][\w$]*)").unwrap());

static EXPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bexport\s+(?:default\s+)?(?:async\s+)?(?:function|class)\s+([A-Za-z_$][\w$]*)")
        .unwrap()
});

/// Per-chunk facts gathered at build time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkMetadata {
    /// Occurrence count of each token in the chunk
    pub frequency: HashMap<String, u32>,
    /// Lower-cased names declared in the chunk
    pub symbols: HashSet<String>,
    /// Whether the chunk comes from a recognized source-code file
    pub is_code: bool,
}

/// Inverted index plus per-chunk metadata for one chunk set
#[derive(Debug, Clone, Default)]
pub struct LexicalIndexData {
    /// Token to chunk indices, one entry per occurrence, in chunk order
    pub postings: HashMap<String, Vec<usize>>,
    /// Metadata aligned with the chunk slice the index was built from
    pub chunk_metadata: Vec<ChunkMetadata>,
}

/// A ranked chunk
#[derive(Debug, Clone, PartialEq)]
pub struct LexicalMatch {
    /// Position of the chunk in the indexed slice
    pub chunk_index: usize,
    /// Normalized score in `0.0..=1.0`
    pub score: f64,
    /// Score before normalization, used for ordering
    pub raw_score: f64,
}

/// Lexical index owning the chunk set it was built from
#[derive(Debug, Clone, Default)]
pub struct LexicalIndex {
    chunks: Vec<Chunk>,
    data: LexicalIndexData,
}

impl LexicalIndex {
    /// Build an index over `chunks`
    pub fn build(chunks: Vec<Chunk>) -> Self {
        let data = build_index(&chunks);
        Self { chunks, data }
    }

    /// Rank all chunks against `query`, best first
    pub fn query(&self, query: &str) -> Vec<LexicalMatch> {
        search(query, &self.chunks, &self.data)
    }

    /// Get a chunk by its position
    pub fn chunk(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }

    /// Get total number of chunks
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Get number of distinct tokens
    pub fn token_count(&self) -> usize {
        self.data.postings.len()
    }
}

/// Build postings and metadata for a chunk set
pub fn build_index(chunks: &[Chunk]) -> LexicalIndexData {
    let mut postings: HashMap<String, Vec<usize>> = HashMap::new();
    let mut chunk_metadata = Vec::with_capacity(chunks.len());

    for (idx, chunk) in chunks.iter().enumerate() {
        let mut frequency: HashMap<String, u32> = HashMap::new();

        for token in token_occurrences(&chunk.content) {
            *frequency.entry(token.clone()).or_insert(0) += 1;
            postings.entry(token).or_default().push(idx);
        }

        chunk_metadata.push(ChunkMetadata {
            frequency,
            symbols: extract_symbols(&chunk.content).into_iter().collect(),
            is_code: is_code_file(&chunk.file_path),
        });
    }

    LexicalIndexData {
        postings,
        chunk_metadata,
    }
}

/// Rank `chunks` against `query` using a previously built index
///
/// Deterministic: the same chunk set and query always produce the same
/// ranking and scores.
pub fn search(query: &str, chunks: &[Chunk], data: &LexicalIndexData) -> Vec<LexicalMatch> {
    let mut raw = vec![0.0_f64; chunks.len()];

    // BTreeSet iteration keeps float accumulation order fixed.
    for token in tokenize(query) {
        let Some(posting) = data.postings.get(&token) else {
            continue;
        };
        let boost = if token.len() > 4 { LONG_TOKEN_BOOST } else { 1.0 };

        let mut last = None;
        for &idx in posting {
            // Occurrences of one chunk are adjacent; score each chunk once per token.
            if last == Some(idx) || idx >= raw.len() {
                continue;
            }
            last = Some(idx);
            let freq = data.chunk_metadata[idx]
                .frequency
                .get(&token)
                .copied()
                .unwrap_or(1);
            raw[idx] += boost * f64::from(freq);
        }
    }

    let symbols = query_symbols(query);

    for (idx, chunk) in chunks.iter().enumerate() {
        let Some(meta) = data.chunk_metadata.get(idx) else {
            continue;
        };

        let hits = symbols.iter().filter(|s| meta.symbols.contains(*s)).count();
        raw[idx] += SYMBOL_BONUS * hits as f64;

        if !query.is_empty() && chunk.content.contains(query) {
            raw[idx] += EXACT_MATCH_BONUS;
        }

        if meta.is_code {
            raw[idx] *= CODE_MULTIPLIER;
        }
    }

    let mut matches: Vec<LexicalMatch> = raw
        .into_iter()
        .enumerate()
        .filter(|(_, score)| *score > 0.0)
        .map(|(chunk_index, raw_score)| LexicalMatch {
            chunk_index,
            score: (raw_score / SCORE_SCALE).min(1.0),
            raw_score,
        })
        .collect();

    // Stable: equal scores keep enumeration order.
    matches.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(Ordering::Equal)
    });

    matches
}

/// Tokenize text into a deduplicated set of lower-cased tokens longer than one character
///
/// Each whitespace-separated word contributes the word with non-word
/// characters removed, its camelCase pieces and its `-`/`_` pieces.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split_whitespace().flat_map(word_tokens).collect()
}

/// Tokens of every word, repeated once per word they occur in
fn token_occurrences(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace().flat_map(word_tokens)
}

fn word_tokens(word: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    let lowered = word.to_lowercase();

    tokens.insert(strip_non_word(&lowered));

    for piece in CAMEL_PIECE_RE.find_iter(word) {
        let piece = piece.as_str();
        if piece.len() > 1 {
            tokens.insert(piece.to_lowercase());
        }
    }

    for piece in lowered.split(['-', '_']) {
        let piece = strip_non_word(piece);
        if piece.len() > 1 {
            tokens.insert(piece);
        }
    }

    tokens.retain(|t| t.len() > 1);
    tokens
}

fn strip_non_word(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Extract lower-cased names of declared functions and classes
///
/// Pattern matching only; false positives and misses are expected.
pub fn extract_symbols(text: &str) -> BTreeSet<String> {
    [&*FUNCTION_RE, &*CONST_FUNCTION_RE, &*CLASS_RE, &*EXPORT_RE]
        .into_iter()
        .flat_map(|re| re.captures_iter(text))
        .filter_map(|caps| caps.get(1))
        .map(|name| name.as_str().to_lowercase())
        .collect()
}

/// Symbols a query can hit: declarations in the query plus its identifier-shaped words
fn query_symbols(query: &str) -> BTreeSet<String> {
    let mut symbols = extract_symbols(query);

    for word in query.split_whitespace() {
        let name = strip_non_word(word).to_lowercase();
        let starts_like_identifier = name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        if starts_like_identifier {
            symbols.insert(name);
        }
    }

    symbols
}
