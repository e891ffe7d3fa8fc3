//! Messages exchanged between callers, the supervisor and the worker
//!
//! Every worker-bound request carries a correlation id; every message the
//! worker emits carries the id it answers. Liveness probes use [`PROBE_ID`].

use crate::scanner::Chunk;
use colored::*;
use serde::{Deserialize, Serialize};

/// Correlation id used by liveness probes and unattributable faults
pub const PROBE_ID: i64 = -1;

/// Lines of chunk content shown in a result snippet
const SNIPPET_LINES: usize = 3;
/// Characters kept per snippet line
const SNIPPET_WIDTH: usize = 80;

/// Work the execution unit can be asked to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RequestBody {
    /// Rank a repository's chunks against a query
    Search {
        query: String,
        /// Defaults to the worker's working directory
        #[serde(rename = "repositoryPath", default, skip_serializing_if = "Option::is_none")]
        repository_path: Option<String>,
        /// Drop any cached index for the repository first
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        reindex: bool,
    },
    /// No-op liveness probe
    HealthCheck,
}

impl RequestBody {
    pub fn search(query: impl Into<String>, repository_path: impl Into<String>) -> Self {
        Self::Search {
            query: query.into(),
            repository_path: Some(repository_path.into()),
            reindex: false,
        }
    }
}

/// Supervisor to worker envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: i64,
    #[serde(flatten)]
    pub body: RequestBody,
}

/// What a worker message carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerPayload {
    /// Reply to a liveness probe
    Pong,
    /// Answer to a request
    Result { result: SearchOutcome },
    /// A fault caught at the worker boundary
    Fault { error: String },
}

/// Worker to supervisor envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    pub id: i64,
    #[serde(flatten)]
    pub payload: WorkerPayload,
}

impl WorkerMessage {
    pub fn pong(id: i64) -> Self {
        Self {
            id,
            payload: WorkerPayload::Pong,
        }
    }

    pub fn result(id: i64, result: SearchOutcome) -> Self {
        Self {
            id,
            payload: WorkerPayload::Result { result },
        }
    }

    pub fn fault(id: i64, error: impl Into<String>) -> Self {
        Self {
            id,
            payload: WorkerPayload::Fault {
                error: error.into(),
            },
        }
    }
}

/// A scored chunk from either the lexical or the vector path
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// The matched chunk
    pub chunk: Chunk,
    /// Normalized score (0.0 to 1.0, higher is better)
    pub score: f32,
}

/// One ranked entry of a search report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    /// 1-based position
    pub rank: usize,
    pub file: String,
    /// `<start>-<end>`
    pub lines: String,
    /// 0-100 with one decimal
    pub score: f64,
    pub snippet: String,
}

/// Successful search answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchReport {
    pub query: String,
    pub repository: String,
    /// Total number of matches, before truncation to `results`
    #[serde(rename = "resultsCount")]
    pub results_count: usize,
    pub results: Vec<ResultEntry>,
}

impl SearchReport {
    /// Build a report from ranked results, keeping the first `max_results`
    pub fn build(query: &str, repository: &str, results: &[SearchResult], max_results: usize) -> Self {
        let entries = results
            .iter()
            .take(max_results)
            .enumerate()
            .map(|(i, r)| ResultEntry {
                rank: i + 1,
                file: r.chunk.file_path.clone(),
                lines: format!("{}-{}", r.chunk.line_start, r.chunk.line_end),
                score: percent_one_decimal(r.score),
                snippet: snippet(&r.chunk.content),
            })
            .collect();

        Self {
            query: query.to_string(),
            repository: repository.to_string(),
            results_count: results.len(),
            results: entries,
        }
    }
}

/// Failed search answer; `results` is always empty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchFailure {
    pub error: String,
    #[serde(default)]
    pub results: Vec<ResultEntry>,
}

/// Caller-visible outcome of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchOutcome {
    Found(SearchReport),
    Failed(SearchFailure),
}

impl SearchOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failed(SearchFailure {
            error: error.into(),
            results: Vec::new(),
        })
    }

    /// The error message, if this outcome is a failure
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Found(_) => None,
            Self::Failed(f) => Some(&f.error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }

    /// The report, if this outcome is a success
    pub fn report(&self) -> Option<&SearchReport> {
        match self {
            Self::Found(report) => Some(report),
            Self::Failed(_) => None,
        }
    }
}

fn percent_one_decimal(score: f32) -> f64 {
    (f64::from(score) * 1000.0).round() / 10.0
}

/// First lines of a chunk, each cut to the snippet width
pub fn snippet(content: &str) -> String {
    content
        .split('\n')
        .take(SNIPPET_LINES)
        .map(|line| line.chars().take(SNIPPET_WIDTH).collect::<String>())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a report for the terminal
pub fn format_report(report: &SearchReport, show_snippet: bool) -> String {
    let mut output = String::new();

    for entry in &report.results {
        let score_color = if entry.score >= 80.0 {
            "green"
        } else if entry.score >= 60.0 {
            "yellow"
        } else {
            "red"
        };

        output.push_str(&format!(
            "\n{} {} ({}%)\n",
            format!("[{}]", entry.rank).dimmed(),
            format!("{}:{}", entry.file, entry.lines).cyan().bold(),
            format!("{:.1}", entry.score).color(score_color)
        ));

        if show_snippet {
            let first_line: usize = entry
                .lines
                .split('-')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1);
            for (j, line) in entry.snippet.lines().enumerate() {
                output.push_str(&format!(
                    "{} {}\n",
                    format!("{:>5}", first_line + j).dimmed(),
                    line
                ));
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(file: &str, content: &str, score: f32) -> SearchResult {
        SearchResult {
            chunk: Chunk {
                file_path: file.to_string(),
                chunk_index: 0,
                content: content.to_string(),
                line_start: 1,
                line_end: content.split('\n').count(),
                mtime: 0,
            },
            score,
        }
    }

    #[test]
    fn test_request_wire_format() {
        let request = WorkerRequest {
            id: 7,
            body: RequestBody::search("login", "/repo"),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"id": 7, "type": "search", "query": "login", "repositoryPath": "/repo"})
        );

        let probe: WorkerRequest =
            serde_json::from_value(json!({"id": -1, "type": "health-check"})).unwrap();
        assert_eq!(probe.body, RequestBody::HealthCheck);
        assert_eq!(probe.id, PROBE_ID);
    }

    #[test]
    fn test_message_wire_format() {
        let pong = serde_json::to_value(WorkerMessage::pong(PROBE_ID)).unwrap();
        assert_eq!(pong, json!({"id": -1, "type": "pong"}));

        let failed = WorkerMessage::result(3, SearchOutcome::failure("boom"));
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(
            value,
            json!({"id": 3, "type": "result", "result": {"error": "boom", "results": []}})
        );
        let back: WorkerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, failed);
    }

    #[test]
    fn test_report_formatting() {
        let long_line = "x".repeat(120);
        let content = format!("{}\nsecond\nthird\nfourth", long_line);
        let results = vec![result("a.js", &content, 0.198), result("b.js", "b", 0.05)];

        let report = SearchReport::build("login", "/repo", &results, 1);
        assert_eq!(report.results_count, 2);
        assert_eq!(report.results.len(), 1);

        let entry = &report.results[0];
        assert_eq!(entry.rank, 1);
        assert_eq!(entry.file, "a.js");
        assert_eq!(entry.lines, "1-4");
        assert_eq!(entry.score, 19.8);
        let lines: Vec<&str> = entry.snippet.split('\n').collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].len(), 80);
        assert_eq!(lines[2], "third");
    }

    #[test]
    fn test_report_serializes_results_count() {
        let report = SearchReport::build("q", "/r", &[], 10);
        let value = serde_json::to_value(SearchOutcome::Found(report)).unwrap();
        assert_eq!(
            value,
            json!({"query": "q", "repository": "/r", "resultsCount": 0, "results": []})
        );
    }

    #[test]
    fn test_format_report_lists_entries() {
        colored::control::set_override(false);
        let results = vec![result("src/auth.js", "function login() {}\nreturn", 0.9)];
        let report = SearchReport::build("login", "/repo", &results, 10);

        let plain = format_report(&report, false);
        assert!(plain.contains("[1] src/auth.js:1-2 (90.0%)"));
        assert!(!plain.contains("function login"));

        let with_snippet = format_report(&report, true);
        assert!(with_snippet.contains("    1 function login() {}"));
        assert!(with_snippet.contains("    2 return"));
    }

    #[test]
    fn test_outcome_untagged_roundtrip_distinguishes_failure() {
        let outcome: SearchOutcome =
            serde_json::from_value(json!({"error": "Request timeout", "results": []})).unwrap();
        assert_eq!(outcome.error(), Some("Request timeout"));
        assert!(outcome.report().is_none());
    }
}
