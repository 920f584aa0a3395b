use crate::config::Settings;
use crate::error::JobError;
use crate::format::{Cut, truncate};
use crate::gate::{ConcurrencyGate, Permit};
use crate::job::{JobSpec, StagedSource};
use crate::model::{Artifact, Run, RunState};
use crate::path_guard::{PathGuard, ResolvedPath};
use crate::registry::RunRegistry;
use crate::runner::{self, Invocation, ProcessOutput};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

const STDERR_TAIL_LINES: usize = 20;
const STDERR_TAIL_CHARS: usize = 2000;

/// Runs submitted jobs: validation, admission, execution, bookkeeping.
#[derive(Debug, Clone)]
pub struct JobOrchestrator {
    settings: Arc<Settings>,
    registry: Arc<RunRegistry>,
    gate: ConcurrencyGate,
    guard: PathGuard,
    output_root: PathBuf,
}

/// A job that has been validated and admitted.
struct Prepared {
    run: Run,
    env: BTreeMap<String, String>,
    stdin: Option<Vec<u8>>,
    staged: Vec<Staging>,
    deadline: Duration,
}

/// A staged file with its destination fixed.
struct Staging {
    target: PathBuf,
    contents: StagedContents,
    transient: bool,
}

enum StagedContents {
    Bytes(Vec<u8>),
    CopyOf(PathBuf),
}

enum Outcome {
    Exited {
        output: ProcessOutput,
        artifacts: Vec<Artifact>,
    },
    Aborted(JobError),
}

impl JobOrchestrator {
    pub fn new(settings: Arc<Settings>, registry: Arc<RunRegistry>) -> Self {
        let guard = PathGuard::new(
            &settings.guard_roots(),
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            settings.max_file_size,
        )
        .allow_any(settings.allow_any_path);

        let output_root = std::path::absolute(&settings.output_dir)
            .unwrap_or_else(|_| settings.output_dir.clone());

        Self {
            gate: ConcurrencyGate::new(settings.max_concurrent),
            output_root,
            settings,
            registry,
            guard,
        }
    }

    pub fn with_guard(mut self, guard: PathGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    /// Validation and admission failures come back as `Err` before anything
    /// is spawned. Once admitted, every outcome (including timeouts and spawn
    /// failures) is recorded on the returned run.
    pub async fn submit(&self, spec: JobSpec) -> Result<Run, JobError> {
        let resolved = spec
            .inputs
            .iter()
            .map(|input| self.guard.validate(&input.raw, input.expect))
            .collect::<Result<Vec<ResolvedPath>, JobError>>()?;

        if spec.args.is_empty() {
            return Err(JobError::invalid("command is required"));
        }
        spec.check_staged()?;

        let id = self.registry.next_id();
        let output_directory = self
            .output_root
            .join(format!("{}_{id}", dir_label(&spec.kind)));
        let argv = spec.materialize(&resolved, &output_directory);
        let staged = stage_plan(&spec, &resolved, &output_directory);
        let working_directory = spec
            .cwd
            .and_then(|idx| resolved.get(idx))
            .map(|input| input.path.clone())
            .unwrap_or_else(|| output_directory.clone());

        let mut run = Run::pending(
            id.clone(),
            spec.kind.clone(),
            argv,
            working_directory,
            output_directory,
        );

        let permit = match self.gate.try_acquire() {
            Ok(permit) => permit,
            Err(err) => {
                warn!(run_id = %id, kind = %spec.kind, "rejected: {err}");
                run.finish(RunState::Errored, Some(err.to_string()))?;
                self.registry.insert(run)?;
                return Err(err);
            }
        };

        self.registry.insert(run.clone())?;
        debug!(run_id = %id, kind = %spec.kind, "admitted");

        let mut env = self.settings.env.clone();
        env.extend(spec.env.clone());
        env.insert(
            "PWD".to_string(),
            run.working_directory.display().to_string(),
        );

        let deadline = spec.deadline(self.settings.default_timeout);
        let prepared = Prepared {
            run,
            env,
            stdin: spec.stdin,
            staged,
            deadline,
        };

        let task = tokio::spawn(drive(
            prepared,
            Arc::clone(&self.registry),
            self.settings.max_text_output,
            permit,
        ));

        match task.await {
            Ok(run) => Ok(run),
            Err(join_err) => {
                error!(run_id = %id, "run task aborted: {join_err}");
                let mut run = self
                    .registry
                    .get(&id)
                    .ok_or_else(|| JobError::NotFound(id.clone()))?;
                if run.state.is_live() {
                    run.finish(
                        RunState::Errored,
                        Some("internal error while running job".to_string()),
                    )?;
                    self.registry.update(run.clone())?;
                }
                Ok(run)
            }
        }
    }
}

/// Owns the run from admission to its terminal state. The permit is dropped
/// only after the terminal record has been written back.
async fn drive(
    job: Prepared,
    registry: Arc<RunRegistry>,
    max_text: usize,
    permit: Permit,
) -> Run {
    let Prepared {
        mut run,
        env,
        stdin,
        staged,
        deadline,
    } = job;

    let request = Request {
        env: &env,
        stdin: stdin.as_deref(),
        staged: &staged,
        deadline,
    };
    let outcome = execute(&mut run, request, &registry).await;
    finalize(&mut run, outcome, max_text);

    if let Err(err) = registry.update(run.clone()) {
        error!(run_id = %run.id, "failed to record run: {err}");
    }
    drop(permit);

    info!(
        run_id = %run.id,
        kind = %run.kind,
        state = %run.state,
        duration_ms = run.duration_ms.unwrap_or_default(),
        "run finished"
    );
    run
}

struct Request<'a> {
    env: &'a BTreeMap<String, String>,
    stdin: Option<&'a [u8]>,
    staged: &'a [Staging],
    deadline: Duration,
}

async fn execute(run: &mut Run, request: Request<'_>, registry: &RunRegistry) -> Outcome {
    if let Err(err) = create_output_dir(&run.output_directory) {
        return Outcome::Aborted(err);
    }
    if let Err(err) = stage_files(request.staged).await {
        return Outcome::Aborted(err);
    }

    if let Err(err) = run.mark_running().and_then(|()| registry.update(run.clone())) {
        return Outcome::Aborted(err);
    }
    info!(run_id = %run.id, kind = %run.kind, command = ?run.command, "run started");

    let invocation = Invocation {
        argv: &run.command,
        cwd: &run.working_directory,
        env: request.env,
        stdin: request.stdin,
        deadline: request.deadline,
    };

    let result = runner::execute(invocation).await;
    remove_transient(request.staged).await;
    let output = match result {
        Ok(output) => output,
        Err(err) => return Outcome::Aborted(err),
    };

    let root = run.output_directory.clone();
    match tokio::task::spawn_blocking(move || collect_artifacts(&root)).await {
        Ok(Ok(artifacts)) => Outcome::Exited { output, artifacts },
        Ok(Err(err)) => Outcome::Aborted(err),
        Err(err) => Outcome::Aborted(JobError::internal(format!("artifact scan: {err}"))),
    }
}

fn finalize(run: &mut Run, outcome: Outcome, max_text: usize) {
    let (state, message) = match outcome {
        Outcome::Exited { output, artifacts } => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);

            run.exit_code = Some(output.exit_code);
            run.artifacts = artifacts;
            run.stdout_text = Some(truncate(&stdout, max_text, Cut::HeadTail).into_owned());
            run.stderr_text = Some(truncate(&stderr, max_text, Cut::HeadTail).into_owned());

            if output.success() {
                (RunState::Completed, None)
            } else {
                let message = runner::tail(&stderr, STDERR_TAIL_LINES, STDERR_TAIL_CHARS)
                    .unwrap_or_else(|| {
                        JobError::NonZeroExit {
                            code: output.exit_code,
                        }
                        .to_string()
                    });
                (RunState::Failed, Some(message))
            }
        }
        Outcome::Aborted(err @ JobError::TimedOut { .. }) => {
            (RunState::TimedOut, Some(err.to_string()))
        }
        Outcome::Aborted(err) => (RunState::Errored, Some(err.to_string())),
    };

    if let Err(err) = run.finish(state, message) {
        // Only reachable if the run was already terminal.
        error!(run_id = %run.id, "{err}");
    }
}

fn stage_plan(spec: &JobSpec, resolved: &[ResolvedPath], output_dir: &Path) -> Vec<Staging> {
    spec.staged
        .iter()
        .filter_map(|file| {
            let contents = match &file.source {
                StagedSource::Inline(bytes) => StagedContents::Bytes(bytes.clone()),
                StagedSource::Copy(idx) => StagedContents::CopyOf(resolved.get(*idx)?.path.clone()),
            };
            Some(Staging {
                target: output_dir.join(&file.name),
                contents,
                transient: file.transient,
            })
        })
        .collect()
}

async fn stage_files(staged: &[Staging]) -> Result<(), JobError> {
    for file in staged {
        let written = match &file.contents {
            StagedContents::Bytes(bytes) => tokio::fs::write(&file.target, bytes).await,
            StagedContents::CopyOf(source) => tokio::fs::copy(source, &file.target).await.map(drop),
        };
        written.map_err(|e| {
            JobError::internal(format!("stage {}: {e}", file.target.display()))
        })?;
    }
    Ok(())
}

async fn remove_transient(staged: &[Staging]) {
    for file in staged.iter().filter(|file| file.transient) {
        if let Err(err) = tokio::fs::remove_file(&file.target).await {
            warn!("remove {}: {err}", file.target.display());
        }
    }
}

/// Kinds are opaque; only a filesystem-safe rendition names the directory.
fn dir_label(kind: &str) -> String {
    let label: String = kind
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(32)
        .collect();
    if label.is_empty() {
        "run".to_string()
    } else {
        label
    }
}

/// The directory must not exist yet: output directories are never shared.
fn create_output_dir(dir: &Path) -> Result<(), JobError> {
    if let Some(parent) = dir.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| JobError::internal(format!("create {}: {e}", parent.display())))?;
    }
    fs::create_dir(dir).map_err(|e| JobError::internal(format!("create {}: {e}", dir.display())))
}

/// Every regular file under `root`, relative to it and sorted by path.
/// Symlinks are skipped, never followed.
pub fn collect_artifacts(root: &Path) -> Result<Vec<Artifact>, JobError> {
    let mut artifacts = Vec::new();
    if !root.exists() {
        return Ok(artifacts);
    }

    for entry in WalkDir::new(root).follow_links(false) {
        let entry =
            entry.map_err(|e| JobError::internal(format!("walk {}: {e}", root.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };

        artifacts.push(Artifact {
            path: slash_path(relative),
            size: meta.len(),
        });
    }

    artifacts.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(artifacts)
}

fn slash_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
