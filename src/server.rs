//! Caller-facing request loop
//!
//! Reads one JSON request per line, validates it, forwards it through the
//! supervisor and writes one JSON response per line. Requests are handled
//! concurrently; each response echoes the caller's `id` when one was given.

use crate::error::Result;
use crate::protocol::{RequestBody, SearchOutcome};
use crate::supervisor::SupervisorHandle;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// A validated caller request
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRequest {
    pub id: Option<Value>,
    pub body: RequestBody,
}

/// A request refused before reaching the worker
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub id: Option<Value>,
    pub error: String,
}

/// One response line
#[derive(Debug, Serialize)]
pub struct ClientResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub outcome: SearchOutcome,
}

/// Validate one request line; relative repository paths resolve against `cwd`
pub fn parse_request(line: &str, cwd: &Path) -> std::result::Result<ClientRequest, Rejection> {
    let value: Value = serde_json::from_str(line).map_err(|e| Rejection {
        id: None,
        error: format!("Invalid JSON: {}", e),
    })?;

    let id = value.get("id").cloned();
    let reject = |error: String| Rejection {
        id: id.clone(),
        error,
    };

    let Some(object) = value.as_object() else {
        return Err(reject("Request must be a JSON object".into()));
    };

    match object.get("type").and_then(Value::as_str) {
        Some("search") | None => {}
        Some(other) => return Err(reject(format!("Unknown request type: {}", other))),
    }

    let query = match object.get("query").and_then(Value::as_str) {
        Some(q) if !q.trim().is_empty() => q.to_string(),
        _ => return Err(reject("Query must be a non-empty string".into())),
    };

    let path = match object.get("repositoryPath") {
        None | Some(Value::Null) => cwd.to_path_buf(),
        Some(Value::String(p)) => cwd.join(p),
        Some(_) => return Err(reject("repositoryPath must be a string".into())),
    };
    let root = resolve_repository(&path).ok_or_else(|| {
        reject(format!("Repository path not found: {}", path.display()))
    })?;

    let reindex = object.get("reindex").and_then(Value::as_bool).unwrap_or(false);

    Ok(ClientRequest {
        id,
        body: RequestBody::Search {
            query,
            repository_path: Some(root.display().to_string()),
            reindex,
        },
    })
}

fn resolve_repository(path: &Path) -> Option<PathBuf> {
    if path.is_dir() {
        path.canonicalize().ok()
    } else {
        None
    }
}

/// Serve requests from `reader` until it closes, then wait for in-flight work
pub async fn serve<R, W>(reader: R, writer: W, supervisor: SupervisorHandle) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let cwd = std::env::current_dir()?;
    let (out_tx, out_rx) = mpsc::unbounded_channel::<ClientResponse>();
    let writer_task = tokio::spawn(write_responses(writer, out_rx));
    let mut in_flight = JoinSet::new();

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        match parse_request(&line, &cwd) {
            Ok(request) => {
                let supervisor = supervisor.clone();
                let out = out_tx.clone();
                in_flight.spawn(async move {
                    let outcome = supervisor.send_request(request.body).await;
                    let _ = out.send(ClientResponse {
                        id: request.id,
                        outcome,
                    });
                });
            }
            Err(rejection) => {
                debug!("Rejected request: {}", rejection.error);
                let _ = out_tx.send(ClientResponse {
                    id: rejection.id,
                    outcome: SearchOutcome::failure(rejection.error),
                });
            }
        }
    }

    info!("Input closed, waiting for {} in-flight requests", in_flight.len());
    while in_flight.join_next().await.is_some() {}
    drop(out_tx);

    writer_task
        .await
        .map_err(|e| crate::error::SearchError::Worker(e.to_string()))?
}

async fn write_responses<W>(mut writer: W, mut responses: mpsc::UnboundedReceiver<ClientResponse>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = responses.recv().await {
        let mut line = serde_json::to_string(&response)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::supervisor::{InProcessSpawner, WorkerSupervisor};
    use crate::worker::WorkerOptions;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_parse_valid_request() {
        let dir = tempdir().unwrap();
        let line = json!({"id": "abc", "type": "search", "query": "login", "repositoryPath": dir.path()})
            .to_string();

        let request = parse_request(&line, Path::new("/")).unwrap();
        assert_eq!(request.id, Some(json!("abc")));
        let expected_root = dir.path().canonicalize().unwrap().display().to_string();
        assert_eq!(
            request.body,
            RequestBody::Search {
                query: "login".into(),
                repository_path: Some(expected_root),
                reindex: false,
            }
        );
    }

    #[test]
    fn test_relative_path_and_default_type() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("repo")).unwrap();

        let request = parse_request(r#"{"query": "x", "repositoryPath": "repo", "reindex": true}"#, dir.path())
            .unwrap();
        match request.body {
            RequestBody::Search {
                repository_path,
                reindex,
                ..
            } => {
                assert!(repository_path.unwrap().ends_with("repo"));
                assert!(reindex);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_input_errors_rejected() {
        let cwd = Path::new("/");

        let bad_json = parse_request("{nope", cwd).unwrap_err();
        assert!(bad_json.error.starts_with("Invalid JSON"));
        assert_eq!(bad_json.id, None);

        let no_query = parse_request(r#"{"id": 1, "type": "search"}"#, cwd).unwrap_err();
        assert_eq!(no_query.error, "Query must be a non-empty string");
        assert_eq!(no_query.id, Some(json!(1)));

        let number_query = parse_request(r#"{"type": "search", "query": 5}"#, cwd).unwrap_err();
        assert_eq!(number_query.error, "Query must be a non-empty string");

        let missing = parse_request(r#"{"query": "x", "repositoryPath": "/no/such/dir"}"#, cwd).unwrap_err();
        assert!(missing.error.starts_with("Repository path not found"));

        let unknown = parse_request(r#"{"type": "index", "query": "x"}"#, cwd).unwrap_err();
        assert_eq!(unknown.error, "Unknown request type: index");
    }

    #[test]
    fn test_response_shape() {
        let response = ClientResponse {
            id: Some(json!(9)),
            outcome: SearchOutcome::failure("Request timeout"),
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"id": 9, "error": "Request timeout", "results": []})
        );
    }

    #[tokio::test]
    async fn test_serve_round_trip() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.js"), "function login() {}").unwrap();

        let supervisor = WorkerSupervisor::start(
            InProcessSpawner::new(WorkerOptions::default()),
            SupervisorConfig::default(),
        );

        let input = format!(
            "{}\n{}\n",
            json!({"id": 1, "type": "search", "query": "login", "repositoryPath": dir.path()}),
            json!({"id": 2, "type": "search", "query": ""}),
        );
        let (mut client, server_out) = tokio::io::duplex(64 * 1024);
        serve(input.as_bytes(), server_out, supervisor.clone()).await.unwrap();
        supervisor.shutdown().await;

        let mut output = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut client, &mut output)
            .await
            .unwrap();
        let responses: Vec<Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(responses.len(), 2);

        let rejected = responses.iter().find(|r| r["id"] == json!(2)).unwrap();
        assert_eq!(rejected["error"], "Query must be a non-empty string");

        let found = responses.iter().find(|r| r["id"] == json!(1)).unwrap();
        assert_eq!(found["resultsCount"], 1);
        assert_eq!(found["results"][0]["file"], "a.js");
    }
}
