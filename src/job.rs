use crate::error::{JobError, PathKind};
use crate::path_guard::ResolvedPath;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path};
use std::time::Duration;

/// One piece of the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Literal(String),
    /// Replaced by the canonical form of `inputs[n]` once it has been validated.
    Input(usize),
    /// Replaced by the absolute path of `staged[n]` inside the output directory.
    Staged(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputPath {
    pub raw: String,
    pub expect: PathKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedSource {
    Inline(Vec<u8>),
    /// Copy of `inputs[n]`, so the tool never writes next to the original.
    Copy(usize),
}

/// A file placed in the output directory before the command starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub name: String,
    pub source: StagedSource,
    /// Removed once the process has exited; never reported as an artifact.
    pub transient: bool,
}

/// Everything the orchestrator needs to run one external command.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub kind: String,
    pub args: Vec<Arg>,
    pub inputs: Vec<InputPath>,
    /// Index into `inputs`; the run's output directory when unset.
    pub cwd: Option<usize>,
    pub staged: Vec<StagedFile>,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    /// Added to a caller-supplied timeout.
    pub timeout_margin: Duration,
}

impl JobSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Plain argv with no validated inputs.
    pub fn command<I, S>(kind: impl Into<String>, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = Self::new(kind);
        spec.args = argv.into_iter().map(|a| Arg::Literal(a.into())).collect();
        spec
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(Arg::Literal(value.into()));
        self
    }

    pub fn arg_if(self, cond: bool, value: impl Into<String>) -> Self {
        if cond { self.arg(value) } else { self }
    }

    /// Registers an input path and appends a reference to it.
    pub fn input_arg(mut self, raw: impl Into<String>, expect: PathKind) -> Self {
        let idx = self.add_input(raw, expect);
        self.args.push(Arg::Input(idx));
        self
    }

    /// Runs the command inside a validated directory instead of the output
    /// directory.
    pub fn cwd_input(mut self, raw: impl Into<String>) -> Self {
        let idx = self.add_input(raw, PathKind::Dir);
        self.cwd = Some(idx);
        self
    }

    /// Writes `contents` into the output directory as `name`, passes its path,
    /// and deletes it after the run.
    pub fn staged_content(
        mut self,
        name: impl Into<String>,
        contents: impl Into<Vec<u8>>,
    ) -> Self {
        self.staged.push(StagedFile {
            name: name.into(),
            source: StagedSource::Inline(contents.into()),
            transient: true,
        });
        self.args.push(Arg::Staged(self.staged.len() - 1));
        self
    }

    /// Validates `raw` as a file, copies it into the output directory as
    /// `name`, and passes the copy's path.
    pub fn staged_copy(mut self, raw: impl Into<String>, name: impl Into<String>) -> Self {
        let idx = self.add_input(raw, PathKind::File);
        self.staged.push(StagedFile {
            name: name.into(),
            source: StagedSource::Copy(idx),
            transient: false,
        });
        self.args.push(Arg::Staged(self.staged.len() - 1));
        self
    }

    /// Staged names must be distinct plain file names.
    pub fn check_staged(&self) -> Result<(), JobError> {
        let mut seen = BTreeSet::new();
        for file in &self.staged {
            let mut components = Path::new(&file.name).components();
            let plain = matches!(
                (components.next(), components.next()),
                (Some(Component::Normal(_)), None)
            );
            if !plain {
                return Err(JobError::invalid(format!(
                    "staged file name {:?} must be a plain file name",
                    file.name
                )));
            }
            if !seen.insert(file.name.as_str()) {
                return Err(JobError::invalid(format!(
                    "two staged files are both named {:?}",
                    file.name
                )));
            }
        }
        Ok(())
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout_margin(mut self, margin: Duration) -> Self {
        self.timeout_margin = margin;
        self
    }

    pub fn deadline(&self, default_timeout: Duration) -> Duration {
        match self.timeout {
            Some(timeout) => timeout.saturating_add(self.timeout_margin),
            None => default_timeout,
        }
    }

    /// Expands `args` against validated inputs (same order as `inputs`) and
    /// the output directory that staged files land in.
    pub fn materialize(&self, resolved: &[ResolvedPath], output_dir: &Path) -> Vec<String> {
        self.args
            .iter()
            .filter_map(|arg| match arg {
                Arg::Literal(value) => Some(value.clone()),
                Arg::Input(idx) => resolved
                    .get(*idx)
                    .map(|input| input.path.display().to_string()),
                Arg::Staged(idx) => self
                    .staged
                    .get(*idx)
                    .map(|file| output_dir.join(&file.name).display().to_string()),
            })
            .collect()
    }

    fn add_input(&mut self, raw: impl Into<String>, expect: PathKind) -> usize {
        self.inputs.push(InputPath {
            raw: raw.into(),
            expect,
        });
        self.inputs.len() - 1
    }
}
