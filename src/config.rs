use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

pub const CURRENT_VERSION: i32 = 1;
pub const DEFAULT_CONFIG_PATH: &str = "./jobgate.yml";

/// Smallest accepted text ceiling; the truncation marker alone must fit.
pub const MIN_TEXT_OUTPUT: usize = 64;

const DEFAULT_MAX_CONCURRENT: usize = 2;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_MAX_TEXT_OUTPUT: usize = 20_000;
const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
const DEFAULT_MAX_ARTIFACT_PREVIEW: usize = 20_000;
const DEFAULT_MAX_ARTIFACTS: usize = 200;
const DEFAULT_PREVIEW_EXTENSIONS: &[&str] = &[".out", ".dot", ".md", ".json", ".txt"];

static ENV_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

static EXTENSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\.[A-Za-z0-9_-]{1,16}$").expect("valid regex"));

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: i32,
    pub limits: Limits,
    pub paths: Paths,
    pub tools: Tools,
    pub env: BTreeMap<String, String>,
    pub previews: Previews,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    pub max_concurrent: Option<usize>,
    pub timeout: String,
    pub max_text_output: Option<usize>,
    pub max_file_size: Option<u64>,
    pub max_artifact_preview: Option<usize>,
    pub max_artifacts: Option<usize>,
    pub max_retained_runs: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    pub output_dir: String,
    pub upload_dir: String,
    pub allowed_roots: Vec<String>,
    pub allow_any_path: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Tools {
    pub gitleaks: String,
    pub solazy: String,
    pub waybackurls: String,
    pub medusa: String,
    pub allow_exec: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Previews {
    pub extensions: Vec<String>,
}

/// Executables the built-in operations invoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolBinaries {
    pub gitleaks: String,
    pub solazy: String,
    pub waybackurls: String,
    pub medusa: String,
}

impl Default for ToolBinaries {
    fn default() -> Self {
        Self {
            gitleaks: "gitleaks".to_string(),
            solazy: "sol-azy".to_string(),
            waybackurls: "waybackurls".to_string(),
            medusa: "medusa".to_string(),
        }
    }
}

/// Validated, fully-resolved configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub max_concurrent: usize,
    pub default_timeout: Duration,
    pub max_text_output: usize,
    pub max_file_size: u64,
    pub max_artifact_preview: usize,
    pub max_artifacts: usize,
    pub max_retained_runs: Option<usize>,
    pub output_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub allowed_roots: Vec<PathBuf>,
    pub allow_any_path: bool,
    pub allow_exec: bool,
    pub tools: ToolBinaries,
    pub env: BTreeMap<String, String>,
    pub preview_extensions: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            default_timeout: DEFAULT_TIMEOUT,
            max_text_output: DEFAULT_MAX_TEXT_OUTPUT,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_artifact_preview: DEFAULT_MAX_ARTIFACT_PREVIEW,
            max_artifacts: DEFAULT_MAX_ARTIFACTS,
            max_retained_runs: None,
            output_dir: PathBuf::from("./output"),
            upload_dir: PathBuf::from("./uploads"),
            allowed_roots: Vec::new(),
            allow_any_path: false,
            allow_exec: false,
            tools: ToolBinaries::default(),
            env: BTreeMap::new(),
            preview_extensions: DEFAULT_PREVIEW_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

impl Settings {
    /// Roots PathGuard accepts: the upload and output directories plus any
    /// extra configured roots.
    pub fn guard_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![self.upload_dir.clone(), self.output_dir.clone()];
        roots.extend(self.allowed_roots.iter().cloned());
        roots
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationErrors {
    pub issues: Vec<ValidationError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F: Into<String>, M: Into<String>>(&mut self, field: F, message: M) {
        self.issues.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(first) = self.issues.first() {
            write!(
                f,
                "configuration validation failed: {}: {}",
                first.field, first.message
            )
        } else {
            write!(f, "configuration validation failed")
        }
    }
}

impl std::error::Error for ValidationErrors {}

pub fn parse(path: &Path) -> Result<Config, String> {
    let text = fs::read_to_string(path).map_err(|e| format!("read config: {e}"))?;
    parse_str(&text)
}

pub fn parse_str(text: &str) -> Result<Config, String> {
    serde_yaml::from_str(text).map_err(|e| format!("parse config yaml: {e}"))
}

/// Reads the file, applies environment overrides and validates the result.
pub fn load(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Settings, String> {
    let mut cfg = parse(path)?;
    cfg.apply_env(lookup).map_err(|e| e.to_string())?;
    cfg.resolve().map_err(|e| e.to_string())
}

pub fn validate(cfg: &Config) -> Result<(), ValidationErrors> {
    let mut issues = ValidationErrors::new();

    if cfg.version != CURRENT_VERSION {
        issues.add("version", format!("must be {CURRENT_VERSION}"));
    }

    validate_limits(&mut issues, &cfg.limits);
    validate_paths(&mut issues, &cfg.paths);
    validate_tools(&mut issues, &cfg.tools);

    for key in cfg.env.keys() {
        if !ENV_KEY_RE.is_match(key) {
            issues.add(
                format!("env.{key}"),
                "name must match ^[A-Za-z_][A-Za-z0-9_]*$",
            );
        }
    }

    for (idx, ext) in cfg.previews.extensions.iter().enumerate() {
        if !EXTENSION_RE.is_match(ext) {
            issues.add(
                format!("previews.extensions[{idx}]"),
                "must look like \".txt\"",
            );
        }
    }

    if issues.has_issues() {
        Err(issues)
    } else {
        Ok(())
    }
}

impl Config {
    /// Configuration used when no file is present.
    pub fn builtin() -> Self {
        Self {
            version: CURRENT_VERSION,
            ..Self::default()
        }
    }

    /// Overlays `JOBGATE_*` variables. Malformed values are reported as
    /// issues named after the variable.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ValidationErrors> {
        let mut issues = ValidationErrors::new();

        if let Some(raw) = lookup("JOBGATE_MAX_CONCURRENT") {
            match raw.trim().parse::<usize>() {
                Ok(value) => self.limits.max_concurrent = Some(value),
                Err(_) => issues.add("JOBGATE_MAX_CONCURRENT", "must be an integer"),
            }
        }

        if let Some(raw) = lookup("JOBGATE_TIMEOUT") {
            match parse_timeout_override(&raw) {
                Some(value) => self.limits.timeout = value,
                None => issues.add(
                    "JOBGATE_TIMEOUT",
                    "must be a number of seconds or a duration",
                ),
            }
        }

        if let Some(raw) = lookup("JOBGATE_MAX_TEXT_OUTPUT") {
            match raw.trim().parse::<usize>() {
                Ok(value) => self.limits.max_text_output = Some(value),
                Err(_) => issues.add("JOBGATE_MAX_TEXT_OUTPUT", "must be an integer"),
            }
        }

        if let Some(raw) = lookup("JOBGATE_MAX_FILE_SIZE") {
            match raw.trim().parse::<u64>() {
                Ok(value) => self.limits.max_file_size = Some(value),
                Err(_) => issues.add("JOBGATE_MAX_FILE_SIZE", "must be an integer"),
            }
        }

        if let Some(raw) = lookup("JOBGATE_OUTPUT_DIR") {
            self.paths.output_dir = raw;
        }

        if let Some(raw) = lookup("JOBGATE_UPLOAD_DIR") {
            self.paths.upload_dir = raw;
        }

        if let Some(raw) = lookup("JOBGATE_ALLOW_ANY_PATH") {
            match parse_flag(&raw) {
                Some(value) => self.paths.allow_any_path = Some(value),
                None => issues.add("JOBGATE_ALLOW_ANY_PATH", "must be a boolean"),
            }
        }

        if let Some(raw) = lookup("JOBGATE_ALLOW_EXEC") {
            match parse_flag(&raw) {
                Some(value) => self.tools.allow_exec = Some(value),
                None => issues.add("JOBGATE_ALLOW_EXEC", "must be a boolean"),
            }
        }

        if issues.has_issues() {
            Err(issues)
        } else {
            Ok(())
        }
    }

    pub fn resolve(&self) -> Result<Settings, ValidationErrors> {
        validate(self)?;

        let defaults = Settings::default();
        let default_timeout = if self.limits.timeout.is_empty() {
            defaults.default_timeout
        } else {
            // validate() has already checked the syntax.
            parse_duration(&self.limits.timeout).unwrap_or(defaults.default_timeout)
        };

        let tools = ToolBinaries {
            gitleaks: or_default(&self.tools.gitleaks, &defaults.tools.gitleaks),
            solazy: or_default(&self.tools.solazy, &defaults.tools.solazy),
            waybackurls: or_default(&self.tools.waybackurls, &defaults.tools.waybackurls),
            medusa: or_default(&self.tools.medusa, &defaults.tools.medusa),
        };

        let preview_extensions = if self.previews.extensions.is_empty() {
            defaults.preview_extensions
        } else {
            self.previews.extensions.clone()
        };

        Ok(Settings {
            max_concurrent: self
                .limits
                .max_concurrent
                .unwrap_or(defaults.max_concurrent),
            default_timeout,
            max_text_output: self
                .limits
                .max_text_output
                .unwrap_or(defaults.max_text_output),
            max_file_size: self.limits.max_file_size.unwrap_or(defaults.max_file_size),
            max_artifact_preview: self
                .limits
                .max_artifact_preview
                .unwrap_or(defaults.max_artifact_preview),
            max_artifacts: self.limits.max_artifacts.unwrap_or(defaults.max_artifacts),
            max_retained_runs: self.limits.max_retained_runs,
            output_dir: path_or_default(&self.paths.output_dir, defaults.output_dir),
            upload_dir: path_or_default(&self.paths.upload_dir, defaults.upload_dir),
            allowed_roots: self.paths.allowed_roots.iter().map(PathBuf::from).collect(),
            allow_any_path: self.paths.allow_any_path.unwrap_or(false),
            allow_exec: self.tools.allow_exec.unwrap_or(false),
            tools,
            env: self.env.clone(),
            preview_extensions,
        })
    }
}

fn validate_limits(issues: &mut ValidationErrors, l: &Limits) {
    if l.max_concurrent == Some(0) {
        issues.add("limits.max_concurrent", "must be >= 1");
    }

    if !l.timeout.is_empty() {
        match parse_duration(&l.timeout) {
            Ok(timeout) if timeout.is_zero() => {
                issues.add("limits.timeout", "must be greater than zero")
            }
            Ok(_) => {}
            Err(_) => issues.add("limits.timeout", "must be a valid duration"),
        }
    }

    if let Some(max) = l.max_text_output
        && max < MIN_TEXT_OUTPUT
    {
        issues.add(
            "limits.max_text_output",
            format!("must be >= {MIN_TEXT_OUTPUT}"),
        );
    }

    if l.max_file_size == Some(0) {
        issues.add("limits.max_file_size", "must be >= 1");
    }

    if let Some(max) = l.max_artifact_preview
        && max < MIN_TEXT_OUTPUT
    {
        issues.add(
            "limits.max_artifact_preview",
            format!("must be >= {MIN_TEXT_OUTPUT}"),
        );
    }

    if l.max_retained_runs == Some(0) {
        issues.add("limits.max_retained_runs", "must be >= 1 when set");
    }
}

fn validate_paths(issues: &mut ValidationErrors, p: &Paths) {
    if p.output_dir.trim().is_empty() && !p.output_dir.is_empty() {
        issues.add("paths.output_dir", "must not be blank");
    }

    if p.upload_dir.trim().is_empty() && !p.upload_dir.is_empty() {
        issues.add("paths.upload_dir", "must not be blank");
    }

    for (idx, root) in p.allowed_roots.iter().enumerate() {
        if root.trim().is_empty() {
            issues.add(format!("paths.allowed_roots[{idx}]"), "must not be empty");
        }
    }
}

fn validate_tools(issues: &mut ValidationErrors, t: &Tools) {
    for (field, value) in [
        ("tools.gitleaks", &t.gitleaks),
        ("tools.solazy", &t.solazy),
        ("tools.waybackurls", &t.waybackurls),
        ("tools.medusa", &t.medusa),
    ] {
        if !value.is_empty() && value.trim() != value {
            issues.add(field, "must not have surrounding whitespace");
        }
    }
}

fn parse_duration(text: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(text)
}

/// Bare integers are seconds; anything else must be a humantime duration.
pub fn parse_timeout(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    parse_duration(trimmed).ok()
}

fn parse_timeout_override(raw: &str) -> Option<String> {
    parse_timeout(raw).map(|timeout| humantime::format_duration(timeout).to_string())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn or_default(value: &str, default_value: &str) -> String {
    if value.is_empty() {
        default_value.to_string()
    } else {
        value.to_string()
    }
}

fn path_or_default(value: &str, default_value: PathBuf) -> PathBuf {
    if value.is_empty() {
        default_value
    } else {
        PathBuf::from(value)
    }
}
