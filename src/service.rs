//! JSON-lines request loop: one request object per input line, one response
//! object per output line.

use crate::error::JobError;
use crate::format::{RenderOptions, ResultFormatter, timestamp};
use crate::model::RunState;
use crate::operation::Operation;
use crate::orchestrator::JobOrchestrator;
use crate::registry::Filter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const DEFAULT_LIST_LIMIT: usize = 50;

const QUERY_OPS: &[&str] = &["get_run", "list_runs", "list_active_runs"];

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Query {
    GetRun(GetRunArgs),
    ListRuns(ListRunsArgs),
    ListActiveRuns,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GetRunArgs {
    run_id: String,
    #[serde(default)]
    include_stdout: bool,
    #[serde(default)]
    include_stderr: bool,
    #[serde(default = "default_true")]
    include_artifacts: bool,
    #[serde(default)]
    include_artifact_previews: bool,
    #[serde(default)]
    max_text: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListRunsArgs {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ActiveRun {
    run_id: String,
    kind: String,
    status: &'static str,
    started_at: String,
    command: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Dispatches requests to the orchestrator and the registry.
#[derive(Debug, Clone)]
pub struct Service {
    orchestrator: JobOrchestrator,
    formatter: ResultFormatter,
}

impl Service {
    pub fn new(orchestrator: JobOrchestrator) -> Self {
        let formatter = ResultFormatter::new(orchestrator.settings());
        Self {
            orchestrator,
            formatter,
        }
    }

    pub fn orchestrator(&self) -> &JobOrchestrator {
        &self.orchestrator
    }

    /// Handles one raw request line. Never fails: errors become
    /// `{"ok": false, ...}` responses.
    pub async fn handle_line(&self, line: &str) -> Value {
        let mut request: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                return respond(
                    None,
                    Err(JobError::invalid(format!("malformed request: {err}"))),
                );
            }
        };

        let id = request.as_object_mut().and_then(|fields| fields.remove("id"));
        let result = self.handle(request).await;
        respond(id, result)
    }

    pub async fn handle(&self, request: Value) -> Result<Value, JobError> {
        let op = request
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| JobError::invalid("request must carry a string \"op\" field"))?;

        if QUERY_OPS.contains(&op) {
            let query: Query = parse(request)?;
            return self.query(query);
        }

        let operation: Operation = parse(request)?;
        self.submit(operation).await
    }

    pub async fn submit(&self, operation: Operation) -> Result<Value, JobError> {
        let spec = operation.to_job(self.orchestrator.settings())?;
        let run = self.orchestrator.submit(spec).await?;
        let opts = operation.render_options(self.orchestrator.settings().max_text_output);
        to_value(self.formatter.render(&run, &opts))
    }

    fn query(&self, query: Query) -> Result<Value, JobError> {
        let settings = self.orchestrator.settings();
        let registry = self.orchestrator.registry();

        match query {
            Query::GetRun(args) => {
                let run = registry
                    .get(&args.run_id)
                    .ok_or_else(|| JobError::NotFound(args.run_id.clone()))?;
                let opts = RenderOptions {
                    include_stdout: args.include_stdout,
                    include_stderr: args.include_stderr,
                    include_artifacts: args.include_artifacts,
                    include_previews: args.include_artifact_previews,
                    named_previews: Vec::new(),
                    max_text: args
                        .max_text
                        .map_or(settings.max_text_output, |n| n.min(settings.max_text_output)),
                };
                to_value(self.formatter.render(&run, &opts))
            }
            Query::ListRuns(args) => {
                let state = args
                    .status
                    .as_deref()
                    .map(str::parse::<RunState>)
                    .transpose()
                    .map_err(JobError::invalid)?;
                let filter = Filter {
                    limit: Some(args.limit.unwrap_or(DEFAULT_LIST_LIMIT)),
                    state,
                    kind: args.kind,
                };

                let opts = RenderOptions::summary(settings.max_text_output).without_artifacts();
                let runs: Vec<_> = registry
                    .list(&filter)
                    .iter()
                    .map(|run| self.formatter.render(run, &opts))
                    .collect();
                Ok(json!({ "count": runs.len(), "runs": runs }))
            }
            Query::ListActiveRuns => {
                let active: Vec<ActiveRun> = registry
                    .list_active()
                    .into_iter()
                    .map(|run| ActiveRun {
                        status: run.state.as_str(),
                        started_at: timestamp(run.started_at),
                        run_id: run.id,
                        kind: run.kind,
                        command: run.command,
                    })
                    .collect();
                Ok(json!({
                    "active_runs": active,
                    "count": active.len(),
                    "max_concurrent": self.orchestrator.gate().capacity(),
                }))
            }
        }
    }

    /// Serves until `reader` hits EOF and every in-flight request has been
    /// answered. Each request runs on its own task, so responses may come
    /// back out of order; callers correlate them by `id`.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, mut writer: W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let read = async move {
            let mut lines = reader.lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                let service = Arc::clone(&self);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = service.handle_line(&line).await;
                    if tx.send(response.to_string()).is_err() {
                        warn!("response dropped: writer closed");
                    }
                });
            }
            debug!("input closed");
            Ok::<(), io::Error>(())
        };

        let write = async move {
            while let Some(line) = rx.recv().await {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            Ok::<(), io::Error>(())
        };

        let (read, write) = tokio::join!(read, write);
        read?;
        write
    }
}

fn parse<T: serde::de::DeserializeOwned>(request: Value) -> Result<T, JobError> {
    serde_json::from_value(request).map_err(|err| JobError::invalid(err.to_string()))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, JobError> {
    serde_json::to_value(value).map_err(|err| JobError::internal(err.to_string()))
}

fn respond(id: Option<Value>, result: Result<Value, JobError>) -> Value {
    let mut response = Map::new();
    if let Some(id) = id {
        response.insert("id".to_string(), id);
    }

    match result {
        Ok(result) => {
            response.insert("ok".to_string(), Value::Bool(true));
            response.insert("result".to_string(), result);
        }
        Err(err) => {
            response.insert("ok".to_string(), Value::Bool(false));
            response.insert(
                "error".to_string(),
                json!({ "code": err.code(), "message": err.to_string() }),
            );
        }
    }

    Value::Object(response)
}
