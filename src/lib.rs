//! # code-search - resilient local code search
//!
//! Indexes a repository into line-range chunks and ranks them against
//! natural-language queries. Ranking is done by a built-in lexical engine,
//! optionally preceded by an offline embedding search. All indexing and
//! searching runs inside a supervised worker that is restarted on crash.
//!
//! ## Example
//!
//! ```no_run
//! use code_search::{
//!     InProcessSpawner, RequestBody, SupervisorConfig, WorkerOptions, WorkerSupervisor,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let supervisor = WorkerSupervisor::start(
//!         InProcessSpawner::new(WorkerOptions::default()),
//!         SupervisorConfig::default(),
//!     );
//!
//!     let outcome = supervisor
//!         .send_request(RequestBody::search("authentication handler", "."))
//!         .await;
//!     if let Some(report) = outcome.report() {
//!         for entry in &report.results {
//!             println!("{}:{} ({})", entry.file, entry.lines, entry.score);
//!         }
//!     }
//!
//!     supervisor.shutdown().await;
//! }
//! ```

pub mod config;
pub mod embedder;
pub mod error;
pub mod ignore_rules;
pub mod lexical;
pub mod pipeline;
pub mod protocol;
pub mod retry;
pub mod scanner;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod worker;

// Re-export commonly used types
pub use config::{Config, EmbeddingModel, SupervisorConfig};
pub use embedder::{Embedder, EmbeddingGenerator};
pub use error::{Result, SearchError};
pub use ignore_rules::IgnoreSet;
pub use lexical::{LexicalIndex, LexicalMatch};
pub use pipeline::{ensure_ignore_entry, IndexSummary, IndexingPipeline};
pub use protocol::{format_report, RequestBody, SearchOutcome, SearchReport, SearchResult};
pub use scanner::{Chunk, Scanner};
pub use store::{HnswStore, VectorStore};
pub use supervisor::{
    InProcessSpawner, ProcessSpawner, SupervisorHandle, SupervisorState, WorkerSpawner,
    WorkerSupervisor,
};
pub use worker::{WorkerContext, WorkerOptions};
