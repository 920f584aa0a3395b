use crate::config::{MIN_TEXT_OUTPUT, Settings};
use crate::model::{Artifact, Run};
use crate::operation::secret_report;
use serde::Serialize;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use time::format_description::well_known::Rfc3339;

pub const TRUNCATION_MARKER: &str = "\n...(truncated)...\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cut {
    /// Keep the beginning and the end around the marker.
    HeadTail,
    /// Keep only the beginning.
    Head,
}

/// Bounds `text` to `limit` bytes, marker included, on char boundaries.
/// Text that already fits is returned untouched, so applying the same
/// limit twice changes nothing.
pub fn truncate(text: &str, limit: usize, cut: Cut) -> Cow<'_, str> {
    let limit = limit.max(MIN_TEXT_OUTPUT);
    if text.len() <= limit {
        return Cow::Borrowed(text);
    }

    let budget = limit - TRUNCATION_MARKER.len();
    match cut {
        Cut::Head => {
            let head = floor_boundary(text, budget);
            Cow::Owned(format!("{}{TRUNCATION_MARKER}", &text[..head]))
        }
        Cut::HeadTail => {
            let head = floor_boundary(text, budget / 2);
            let tail_len = budget - budget / 2;
            let tail = ceil_boundary(text, text.len() - tail_len);
            Cow::Owned(format!(
                "{}{TRUNCATION_MARKER}{}",
                &text[..head],
                &text[tail..]
            ))
        }
    }
}

fn floor_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(text: &str, mut idx: usize) -> usize {
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    pub include_stdout: bool,
    pub include_stderr: bool,
    pub include_artifacts: bool,
    pub include_previews: bool,
    /// Artifacts previewed whatever their extension, when present.
    pub named_previews: Vec<String>,
    pub max_text: usize,
}

impl RenderOptions {
    pub fn summary(max_text: usize) -> Self {
        Self {
            include_stdout: false,
            include_stderr: false,
            include_artifacts: true,
            include_previews: false,
            named_previews: Vec::new(),
            max_text,
        }
    }

    pub fn with_named_preview(mut self, path: impl Into<String>) -> Self {
        self.named_previews.push(path.into());
        self
    }

    pub fn with_output(mut self) -> Self {
        self.include_stdout = true;
        self.include_stderr = true;
        self
    }

    pub fn without_artifacts(mut self) -> Self {
        self.include_artifacts = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub kind: String,
    pub status: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub out_dir: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<Artifact>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts_truncated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_previews: Option<BTreeMap<String, String>>,
}

/// Turns runs into bounded summaries for callers.
#[derive(Debug, Clone)]
pub struct ResultFormatter {
    max_artifacts: usize,
    max_preview: usize,
    max_file_size: u64,
    preview_extensions: Vec<String>,
}

impl ResultFormatter {
    pub fn new(settings: &Settings) -> Self {
        Self {
            max_artifacts: settings.max_artifacts,
            max_preview: settings.max_artifact_preview,
            max_file_size: settings.max_file_size,
            preview_extensions: settings.preview_extensions.clone(),
        }
    }

    pub fn render(&self, run: &Run, opts: &RenderOptions) -> RunSummary {
        let mut summary = RunSummary {
            run_id: run.id.clone(),
            kind: run.kind.clone(),
            status: run.state.as_str().to_string(),
            command: run.command.clone(),
            working_dir: run.working_directory.display().to_string(),
            out_dir: run.output_directory.display().to_string(),
            started_at: timestamp(run.started_at),
            completed_at: run.completed_at.map(timestamp),
            duration_ms: run.duration_ms,
            exit_code: run.exit_code,
            error: run
                .error_message
                .as_deref()
                .map(|e| truncate(e, opts.max_text, Cut::Head).into_owned()),
            artifacts: None,
            artifacts_truncated: None,
            stdout: None,
            stderr: None,
            artifact_previews: None,
        };

        if opts.include_artifacts {
            let shown: Vec<Artifact> = run
                .artifacts
                .iter()
                .take(self.max_artifacts)
                .cloned()
                .collect();
            if run.artifacts.len() > shown.len() {
                summary.artifacts_truncated = Some(format!(
                    "showing {} of {} artifacts",
                    shown.len(),
                    run.artifacts.len()
                ));
            }
            summary.artifacts = Some(shown);
        }

        if opts.include_stdout {
            summary.stdout = run
                .stdout_text
                .as_deref()
                .map(|text| truncate(text, opts.max_text, Cut::HeadTail).into_owned());
        }

        if opts.include_stderr {
            summary.stderr = run
                .stderr_text
                .as_deref()
                .map(|text| truncate(text, opts.max_text, Cut::HeadTail).into_owned());
        }

        if opts.include_previews || !opts.named_previews.is_empty() {
            summary.artifact_previews = Some(self.previews(run, opts));
        }

        summary
    }

    fn previews(&self, run: &Run, opts: &RenderOptions) -> BTreeMap<String, String> {
        let limit = self.max_preview.min(opts.max_text.max(MIN_TEXT_OUTPUT));
        let masked = secret_report(&run.kind);
        let mut previews = BTreeMap::new();

        for artifact in run.artifacts.iter().take(self.max_artifacts) {
            let wanted = opts.named_previews.contains(&artifact.path)
                || (opts.include_previews && self.previewable(&artifact.path));
            if !wanted || artifact.size > self.max_file_size {
                continue;
            }

            let path = run.output_directory.join(&artifact.path);
            let preview = if masked == Some(artifact.path.as_str()) {
                masked_report(&path, limit)
            } else {
                read_preview(&path, limit)
            };
            previews.insert(artifact.path.clone(), preview);
        }

        previews
    }

    fn previewable(&self, path: &str) -> bool {
        let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.preview_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

/// Reads at most `limit + 1` bytes so oversized files are detected without
/// loading them.
fn read_preview(path: &Path, limit: usize) -> String {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => return format!("(error reading {}: {err})", path.display()),
    };

    let mut buf = Vec::new();
    if let Err(err) = file.take(limit as u64 + 1).read_to_end(&mut buf) {
        return format!("(error reading {}: {err})", path.display());
    }

    let text = String::from_utf8_lossy(&buf);
    truncate(&text, limit, Cut::Head).into_owned()
}

/// Shows at most the first four characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    const VISIBLE: usize = 4;
    let total = secret.chars().count();
    if total <= VISIBLE {
        return "****".to_string();
    }
    let head: String = secret.chars().take(VISIBLE).collect();
    format!("{head}{}", "*".repeat(total - VISIBLE))
}

/// gitleaks reports echo each secret in `Secret` and again inside `Match`.
/// Both are masked; a report that does not parse is withheld entirely.
fn masked_report(path: &Path, limit: usize) -> String {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => return format!("(error reading {}: {err})", path.display()),
    };
    let Ok(mut report) = serde_json::from_str::<Value>(&text) else {
        return "(report withheld: not valid JSON)".to_string();
    };

    mask_fields(&mut report);
    let rendered = serde_json::to_string(&report).unwrap_or_default();
    truncate(&rendered, limit, Cut::Head).into_owned()
}

fn mask_fields(value: &mut Value) {
    match value {
        Value::Object(fields) => {
            for (key, field) in fields.iter_mut() {
                match field {
                    Value::String(secret) if key == "Secret" || key == "Match" => {
                        *secret = mask_secret(secret);
                    }
                    other => mask_fields(other),
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(mask_fields),
        _ => {}
    }
}

pub fn timestamp(at: time::OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| "-".to_string())
}
