//! The closed set of jobs the service knows how to start.

use crate::config::Settings;
use crate::error::{JobError, PathKind};
use crate::format::RenderOptions;
use crate::job::JobSpec;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Added on top of the fuzzer's own test budget.
pub const FUZZ_TIMEOUT_MARGIN: Duration = Duration::from_secs(60);

/// gitleaks' JSON report, written next to the run's other artifacts.
pub const SECRET_REPORT: &str = "report.json";

pub const RECAP_FILE: &str = "recap-solazy.md";

const DETECT_INPUT: &str = "content.txt";

/// Kinds whose report carries raw secrets and must be masked before display.
pub fn secret_report(kind: &str) -> Option<&'static str> {
    matches!(kind, "scan" | "detect").then_some(SECRET_REPORT)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Exec(ExecArgs),
    Scan(ScanArgs),
    Reverse(ReverseArgs),
    Sast(SastArgs),
    Fetch(FetchArgs),
    Fuzz(FuzzArgs),
    Detect(DetectArgs),
    Recap(RecapArgs),
    Fetcher(FetcherArgs),
    Dotting(DottingArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecArgs {
    pub argv: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanArgs {
    pub target: String,
    #[serde(default)]
    pub no_git: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReverseMode {
    Disass,
    Cfg,
    #[default]
    Both,
}

impl ReverseMode {
    fn as_str(self) -> &'static str {
        match self {
            ReverseMode::Disass => "disass",
            ReverseMode::Cfg => "cfg",
            ReverseMode::Both => "both",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReverseArgs {
    pub filepath: String,
    #[serde(default)]
    pub mode: ReverseMode,
    #[serde(default = "default_true")]
    pub labeling: bool,
    #[serde(default)]
    pub reduced: bool,
    #[serde(default)]
    pub only_entrypoint: bool,
    #[serde(default)]
    pub include_artifact_previews: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SastArgs {
    pub target_dir: String,
    #[serde(default)]
    pub rules_dir: Option<String>,
    #[serde(default)]
    pub syn_scan_only: bool,
    #[serde(default = "default_true")]
    pub use_internal_rules: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchArgs {
    pub domain: String,
    #[serde(default)]
    pub get_subs: bool,
    #[serde(default)]
    pub no_subs: bool,
    #[serde(default)]
    pub dates: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FuzzArgs {
    pub workspace: String,
    /// The fuzzer's own test budget in seconds.
    #[serde(default)]
    pub test_timeout: Option<u64>,
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default)]
    pub workers: Option<u32>,
    #[serde(default)]
    pub test_limit: Option<u64>,
    #[serde(default)]
    pub target_contracts: Vec<String>,
    #[serde(default)]
    pub fail_fast: bool,
}

/// Scans inline text instead of a path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectArgs {
    pub content: String,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecapArgs {
    pub anchor_dir: String,
    #[serde(default = "default_true")]
    pub include_markdown: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetcherArgs {
    pub program_id: String,
    #[serde(default)]
    pub rpc_url: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DottingArgs {
    pub config_path: String,
    pub reduced_dot_path: String,
    pub full_dot_path: String,
    #[serde(default)]
    pub include_updated_dot: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Exec(_) => "exec",
            Operation::Scan(_) => "scan",
            Operation::Reverse(_) => "reverse",
            Operation::Sast(_) => "sast",
            Operation::Fetch(_) => "fetch",
            Operation::Fuzz(_) => "fuzz",
            Operation::Detect(_) => "detect",
            Operation::Recap(_) => "recap",
            Operation::Fetcher(_) => "fetcher",
            Operation::Dotting(_) => "dotting",
        }
    }

    pub fn to_job(&self, settings: &Settings) -> Result<JobSpec, JobError> {
        let tools = &settings.tools;
        let kind = self.kind();

        match self {
            Operation::Exec(args) => {
                if !settings.allow_exec {
                    return Err(JobError::invalid(
                        "exec is disabled (set tools.allow_exec or JOBGATE_ALLOW_EXEC=1)",
                    ));
                }
                if args.argv.first().is_none_or(|program| program.is_empty()) {
                    return Err(JobError::invalid("argv must name a program"));
                }

                let mut spec = JobSpec::command(kind, args.argv.iter().cloned())
                    .timeout(seconds(args.timeout));
                if let Some(cwd) = &args.cwd {
                    spec = spec.cwd_input(cwd.clone());
                }
                Ok(spec)
            }
            Operation::Scan(args) => Ok(JobSpec::new(kind)
                .arg(&tools.gitleaks)
                .arg("detect")
                .arg("--source")
                .input_arg(&args.target, PathKind::Any)
                .arg("--report-format")
                .arg("json")
                .arg("--report-path")
                .arg(SECRET_REPORT)
                .arg("--exit-code")
                .arg("0")
                .arg_if(args.no_git, "--no-git")
                .timeout(seconds(args.timeout))),
            Operation::Reverse(args) => Ok(JobSpec::new(kind)
                .arg(&tools.solazy)
                .arg("reverse")
                .arg("--mode")
                .arg(args.mode.as_str())
                .arg("--out-dir")
                .arg(".")
                .arg("--bytecodes-file")
                .input_arg(&args.filepath, PathKind::File)
                .arg_if(args.labeling, "--labeling")
                .arg_if(args.reduced, "--reduced")
                .arg_if(args.only_entrypoint, "--only-entrypoint")
                .timeout(seconds(args.timeout))),
            Operation::Sast(args) => {
                let mut spec = JobSpec::new(kind)
                    .arg(&tools.solazy)
                    .arg("sast")
                    .arg("-d")
                    .input_arg(&args.target_dir, PathKind::Dir);
                if let Some(rules) = &args.rules_dir {
                    spec = spec.arg("-r").input_arg(rules, PathKind::Dir);
                }
                Ok(spec
                    .arg_if(args.syn_scan_only, "--syn-scan-only")
                    .arg_if(!args.use_internal_rules, "--no-internal-rules")
                    .timeout(seconds(args.timeout)))
            }
            Operation::Fetch(args) => {
                let domain = normalize_domain(&args.domain)?;
                Ok(JobSpec::new(kind)
                    .arg(&tools.waybackurls)
                    .arg_if(args.get_subs, "-get-subs")
                    .arg_if(args.no_subs, "-no-subs")
                    .arg_if(args.dates, "-dates")
                    .stdin(format!("{domain}\n"))
                    .timeout(seconds(args.timeout)))
            }
            Operation::Fuzz(args) => {
                let mut spec = JobSpec::new(kind)
                    .arg(&tools.medusa)
                    .arg("fuzz")
                    .cwd_input(&args.workspace);
                if let Some(config) = &args.config {
                    spec = spec.arg("--config").input_arg(config, PathKind::File);
                }
                if let Some(workers) = args.workers {
                    spec = spec.arg("--workers").arg(workers.to_string());
                }
                if let Some(limit) = args.test_limit {
                    spec = spec.arg("--test-limit").arg(limit.to_string());
                }
                if !args.target_contracts.is_empty() {
                    spec = spec
                        .arg("--target-contracts")
                        .arg(args.target_contracts.join(","));
                }
                spec = spec.arg_if(args.fail_fast, "--fail-fast");
                if let Some(budget) = args.test_timeout {
                    spec = spec.arg("--timeout").arg(budget.to_string());
                }
                Ok(spec
                    .timeout(seconds(args.test_timeout))
                    .timeout_margin(FUZZ_TIMEOUT_MARGIN))
            }
            Operation::Detect(args) => {
                if args.content.len() as u64 > settings.max_file_size {
                    return Err(JobError::invalid(format!(
                        "content is {} bytes, limit is {}",
                        args.content.len(),
                        settings.max_file_size
                    )));
                }
                Ok(JobSpec::new(kind)
                    .arg(&tools.gitleaks)
                    .arg("detect")
                    .arg("--source")
                    .staged_content(DETECT_INPUT, args.content.as_bytes())
                    .arg("--report-format")
                    .arg("json")
                    .arg("--report-path")
                    .arg(SECRET_REPORT)
                    .arg("--exit-code")
                    .arg("0")
                    .arg("--no-git")
                    .timeout(seconds(args.timeout)))
            }
            Operation::Recap(args) => Ok(JobSpec::new(kind)
                .arg(&tools.solazy)
                .arg("recap")
                .arg("-d")
                .input_arg(&args.anchor_dir, PathKind::Dir)
                .timeout(seconds(args.timeout))),
            Operation::Fetcher(args) => {
                let program_id = plain_value("program_id", &args.program_id)?;
                let mut spec = JobSpec::new(kind)
                    .arg(&tools.solazy)
                    .arg("fetcher")
                    .arg("-p")
                    .arg(program_id)
                    .arg("-o")
                    .arg(".");
                if let Some(rpc_url) = &args.rpc_url {
                    spec = spec.arg("-r").arg(plain_value("rpc_url", rpc_url)?);
                }
                Ok(spec.timeout(seconds(args.timeout)))
            }
            Operation::Dotting(args) => Ok(JobSpec::new(kind)
                .arg(&tools.solazy)
                .arg("dotting")
                .arg("-c")
                .staged_copy(&args.config_path, file_name(&args.config_path)?)
                .arg("-r")
                .staged_copy(&args.reduced_dot_path, file_name(&args.reduced_dot_path)?)
                .arg("-f")
                .staged_copy(&args.full_dot_path, file_name(&args.full_dot_path)?)
                .timeout(seconds(args.timeout))),
        }
    }

    /// What the immediate response to this operation includes.
    pub fn render_options(&self, max_text: usize) -> RenderOptions {
        match self {
            Operation::Reverse(args) => RenderOptions {
                include_previews: args.include_artifact_previews,
                ..RenderOptions::summary(max_text)
            },
            Operation::Recap(args) if args.include_markdown => RenderOptions::summary(max_text)
                .with_output()
                .with_named_preview(RECAP_FILE),
            Operation::Dotting(args) if args.include_updated_dot => {
                let reduced = file_name(&args.reduced_dot_path).unwrap_or_default();
                RenderOptions::summary(max_text)
                    .with_output()
                    .with_named_preview(format!("updated_{reduced}"))
            }
            _ => RenderOptions::summary(max_text).with_output(),
        }
    }
}

/// Accepts a bare host or a URL and keeps only the lowercased host.
fn normalize_domain(raw: &str) -> Result<String, JobError> {
    let lowered = raw.trim().to_lowercase();
    let without_scheme = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
        .unwrap_or(&lowered);
    let host = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();

    if host.is_empty()
        || host.starts_with('-')
        || host.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(JobError::invalid(format!("invalid domain {raw:?}")));
    }
    Ok(host.to_string())
}

/// A value passed as its own argv entry: no leading dash, no whitespace.
fn plain_value<'a>(field: &str, raw: &'a str) -> Result<&'a str, JobError> {
    let value = raw.trim();
    if value.is_empty()
        || value.starts_with('-')
        || value.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(JobError::invalid(format!("invalid {field} {raw:?}")));
    }
    Ok(value)
}

fn file_name(raw: &str) -> Result<String, JobError> {
    Path::new(raw.trim())
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| JobError::invalid(format!("{raw:?} does not name a file")))
}

fn seconds(value: Option<u64>) -> Option<Duration> {
    value.filter(|secs| *secs > 0).map(Duration::from_secs)
}
