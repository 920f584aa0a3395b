use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// What a caller-supplied path is expected to point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    File,
    Dir,
    Any,
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKind::File => write!(f, "file"),
            PathKind::Dir => write!(f, "directory"),
            PathKind::Any => write!(f, "file or directory"),
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("path not allowed: {}; allowed roots: {roots}", .path.display())]
    PathNotAllowed { path: PathBuf, roots: String },

    #[error("path not found: {}", .path.display())]
    PathNotFound { path: PathBuf },

    #[error("expected a {expected}, got: {}", .path.display())]
    WrongKind { path: PathBuf, expected: PathKind },

    #[error("file too large ({size} bytes), max: {max} bytes")]
    FileTooLarge { path: PathBuf, size: u64, max: u64 },

    #[error("maximum concurrent runs ({capacity}) reached, retry later")]
    CapacityExceeded { capacity: usize },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {}", format_timeout(.timeout))]
    TimedOut { timeout: Duration },

    #[error("command failed with exit code {code}")]
    NonZeroExit { code: i32 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("run {0:?} not found")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }

    pub fn invalid<T: Into<String>>(message: T) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Stable identifier used in service responses.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::PathNotAllowed { .. } => "path_not_allowed",
            JobError::PathNotFound { .. } => "path_not_found",
            JobError::WrongKind { .. } => "wrong_kind",
            JobError::FileTooLarge { .. } => "file_too_large",
            JobError::CapacityExceeded { .. } => "capacity_exceeded",
            JobError::Spawn { .. } => "spawn_error",
            JobError::TimedOut { .. } => "timed_out",
            JobError::NonZeroExit { .. } => "non_zero_exit",
            JobError::InvalidRequest(_) => "invalid_request",
            JobError::NotFound(_) => "not_found",
            JobError::Internal(_) => "internal_error",
        }
    }

    /// Errors raised before a run is admitted: nothing was spawned.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            JobError::PathNotAllowed { .. }
                | JobError::PathNotFound { .. }
                | JobError::WrongKind { .. }
                | JobError::FileTooLarge { .. }
                | JobError::CapacityExceeded { .. }
                | JobError::InvalidRequest(_)
        )
    }
}

fn format_timeout(timeout: &Duration) -> String {
    humantime::format_duration(*timeout).to_string()
}
