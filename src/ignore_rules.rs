//! Ignore rule resolution
//!
//! Merges the built-in exclusion list with the ignore files found at a
//! repository root into one [`IgnoreSet`], and tests relative paths against it.
//!
//! Patterns are simplified: negations are dropped, directory markers and
//! trailing `/*` wildcards are stripped, and every remaining pattern matches
//! whole path segments only.

use crate::config::INDEX_DIR_NAME;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

/// Ignore files read from the repository root, in no particular precedence
pub const PROJECT_IGNORE_FILES: &[&str] = &[
    ".gitignore",
    ".dockerignore",
    ".npmignore",
    ".eslintignore",
    ".prettierignore",
    ".codesearchignore",
];

/// Built-in exclusions used when no default-ignore file overrides them
pub const DEFAULT_IGNORES: &[&str] = &[
    "node_modules", ".git", ".svn", ".hg", "dist", "build", "out",
    "target", "vendor", "__pycache__", ".pytest_cache", ".mypy_cache",
    ".next", ".nuxt", ".cache", ".parcel-cache", ".vite", ".turbo",
    "coverage", ".nyc_output", ".firebase", ".terraform", ".aws",
    ".azure", ".gcloud", ".vscode", ".idea", ".vs", "bin", "obj",
    ".gradle", ".mvn", "Pods", "DerivedData", ".bundle",
    ".yarn", ".pnp", "pnpm-lock.yaml", ".pnpm-store",
    ".tox", ".eggs", "*.egg-info", ".venv", "venv", "env",
    ".tsc", ".eslintcache", ".stylelintcache",
    "temp", "tmp", ".tmp", ".DS_Store", "Thumbs.db",
    ".swp", ".swo", "*.swp", "*.swo", ".tern-port",
    "dist-server", "out-tsc", "typings", ".env", ".env.local",
];

/// A merged, read-only set of path-fragment patterns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreSet {
    patterns: BTreeSet<String>,
}

impl IgnoreSet {
    /// Build an ignore set from explicit patterns (already normalized)
    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    /// Resolve the full ignore set for a repository root
    ///
    /// `default_override` names a file whose patterns replace the built-in
    /// list; when it is absent or unreadable the built-in list is used.
    pub fn resolve(root: &Path, default_override: Option<&Path>) -> Self {
        let mut patterns = default_patterns(default_override);
        patterns.extend(project_patterns(root));
        // The persisted index lives inside the repository and is never content.
        patterns.insert(INDEX_DIR_NAME.to_string());

        debug!("Resolved {} ignore patterns for {:?}", patterns.len(), root);
        Self { patterns }
    }

    /// Number of distinct patterns
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Check if the set holds no patterns
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Check whether a pattern is part of the set
    pub fn contains(&self, pattern: &str) -> bool {
        self.patterns.contains(pattern)
    }

    /// Check whether a relative path is excluded
    pub fn matches(&self, relative_path: &str) -> bool {
        let normalized = relative_path.replace('\\', "/");
        let segments: Vec<&str> = normalized.split('/').collect();

        self.patterns
            .iter()
            .any(|pattern| pattern_matches(&normalized, &segments, pattern))
    }
}

/// Parse one ignore file into normalized patterns
pub fn parse_ignore_file(content: &str) -> BTreeSet<String> {
    content.lines().filter_map(normalize_pattern).collect()
}

fn normalize_pattern(line: &str) -> Option<String> {
    let line = line.trim();

    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    // Re-inclusion needs ordered rule evaluation, which this resolver does not do.
    if line.starts_with('!') {
        return None;
    }

    let mut pattern = line.strip_suffix('/').unwrap_or(line);
    // Only a `/*`-style suffix collapses; `foo*` is kept as written.
    if let Some(prefix) = pattern.trim_end_matches('*').strip_suffix('/') {
        if pattern.ends_with('*') {
            pattern = prefix;
        }
    }
    let pattern = pattern.strip_prefix('/').unwrap_or(pattern);

    if pattern.is_empty() {
        None
    } else {
        Some(pattern.to_string())
    }
}

fn default_patterns(default_override: Option<&Path>) -> BTreeSet<String> {
    if let Some(path) = default_override {
        match std::fs::read_to_string(path) {
            Ok(content) => return parse_ignore_file(&content),
            Err(e) => debug!("Default ignore file {:?} unusable: {}", path, e),
        }
    }

    DEFAULT_IGNORES.iter().map(|p| p.to_string()).collect()
}

fn project_patterns(root: &Path) -> BTreeSet<String> {
    let mut patterns = BTreeSet::new();

    for name in PROJECT_IGNORE_FILES {
        let path = root.join(name);
        if !path.is_file() {
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(content) => patterns.extend(parse_ignore_file(&content)),
            Err(e) => debug!("Skipping unreadable ignore file {:?}: {}", path, e),
        }
    }

    patterns
}

fn pattern_matches(path: &str, segments: &[&str], pattern: &str) -> bool {
    // `*.ext` style patterns match a segment suffix.
    if let Some(suffix) = pattern.strip_prefix('*') {
        if !suffix.is_empty() && !suffix.contains(['*', '/']) {
            return segments.iter().any(|segment| segment.ends_with(suffix));
        }
    }

    if segments.iter().any(|segment| *segment == pattern) {
        return true;
    }

    occurs_on_segment_boundary(path, pattern)
}

/// True when `pattern` occurs in `path` starting and ending on `/` boundaries
fn occurs_on_segment_boundary(path: &str, pattern: &str) -> bool {
    let bytes = path.as_bytes();

    std::iter::once(0)
        .chain(path.match_indices('/').map(|(i, _)| i + 1))
        .any(|start| {
            let end = start + pattern.len();
            path[start..].starts_with(pattern) && (end == bytes.len() || bytes[end] == b'/')
        })
}
