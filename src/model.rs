use crate::error::JobError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    #[serde(rename = "timeout")]
    TimedOut,
    #[serde(rename = "error")]
    Errored,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::TimedOut | RunState::Errored
        )
    }

    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::TimedOut => "timeout",
            RunState::Errored => "error",
        }
    }

    /// Pending may only move to Running, or straight to Errored when the run
    /// never got off the ground. Running may only move to a terminal state.
    pub fn can_transition_to(self, next: RunState) -> bool {
        match self {
            RunState::Pending => matches!(next, RunState::Running | RunState::Errored),
            RunState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunState::Pending),
            "running" => Ok(RunState::Running),
            "completed" => Ok(RunState::Completed),
            "failed" => Ok(RunState::Failed),
            "timeout" => Ok(RunState::TimedOut),
            "error" => Ok(RunState::Errored),
            other => Err(format!(
                "unknown status {other:?} (expected pending, running, completed, failed, timeout or error)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Relative to the run's output directory, `/`-separated.
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub kind: String,
    pub command: Vec<String>,
    pub working_directory: PathBuf,
    pub output_directory: PathBuf,
    pub state: RunState,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub duration_ms: Option<i64>,
    pub exit_code: Option<i32>,
    pub stdout_text: Option<String>,
    pub stderr_text: Option<String>,
    pub artifacts: Vec<Artifact>,
    pub error_message: Option<String>,
}

impl Run {
    pub fn pending(
        id: String,
        kind: String,
        command: Vec<String>,
        working_directory: PathBuf,
        output_directory: PathBuf,
    ) -> Self {
        Self {
            id,
            kind,
            command,
            working_directory,
            output_directory,
            state: RunState::Pending,
            started_at: OffsetDateTime::now_utc(),
            completed_at: None,
            duration_ms: None,
            exit_code: None,
            stdout_text: None,
            stderr_text: None,
            artifacts: Vec::new(),
            error_message: None,
        }
    }

    pub fn mark_running(&mut self) -> Result<(), JobError> {
        self.transition(RunState::Running)
    }

    /// Moves the run into a terminal state and stamps its completion time.
    pub fn finish(
        &mut self,
        state: RunState,
        error_message: Option<String>,
    ) -> Result<(), JobError> {
        if !state.is_terminal() {
            return Err(JobError::internal(format!(
                "run {}: {state} is not a terminal state",
                self.id
            )));
        }
        self.transition(state)?;

        let now = OffsetDateTime::now_utc();
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).whole_milliseconds() as i64);
        self.error_message = error_message;
        Ok(())
    }

    fn transition(&mut self, next: RunState) -> Result<(), JobError> {
        if !self.state.can_transition_to(next) {
            return Err(JobError::internal(format!(
                "run {}: illegal transition {} -> {next}",
                self.id, self.state
            )));
        }
        self.state = next;
        Ok(())
    }
}
