use crate::config::ValidationErrors;
use crate::error::JobError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    RuntimeFailure = 1,
    Usage = 2,
    Internal = 3,
}

/// A failure classified by how the process should exit.
#[derive(Debug)]
pub struct AppError {
    code: ExitCode,
    message: String,
}

impl AppError {
    pub fn usage<T: Into<String>>(message: T) -> Self {
        Self::with_code(ExitCode::Usage, message)
    }

    pub fn runtime<T: Into<String>>(message: T) -> Self {
        Self::with_code(ExitCode::RuntimeFailure, message)
    }

    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::with_code(ExitCode::Internal, message)
    }

    fn with_code<T: Into<String>>(code: ExitCode, message: T) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> i32 {
        self.code as i32
    }
}

impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        let code = match &err {
            JobError::Internal(_) => ExitCode::Internal,
            err if err.is_rejection() && !matches!(err, JobError::CapacityExceeded { .. }) => {
                ExitCode::Usage
            }
            _ => ExitCode::RuntimeFailure,
        };
        Self::with_code(code, format!("{}: {err}", err.code()))
    }
}

impl From<ValidationErrors> for AppError {
    fn from(err: ValidationErrors) -> Self {
        let lines: Vec<String> = err
            .issues
            .iter()
            .map(|issue| format!("  {}: {}", issue.field, issue.message))
            .collect();
        Self::usage(format!("invalid configuration:\n{}", lines.join("\n")))
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}
