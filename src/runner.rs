use crate::error::JobError;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How long to wait for a killed process to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub argv: &'a [String],
    pub cwd: &'a Path,
    /// Applied on top of the inherited environment.
    pub env: &'a BTreeMap<String, String>,
    pub stdin: Option<&'a [u8]>,
    pub deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs one command to completion or until the deadline passes, whichever
/// comes first. On expiry the whole process group is killed and reaped
/// before `TimedOut` is returned.
pub async fn execute(inv: Invocation<'_>) -> Result<ProcessOutput, JobError> {
    let (program, args) = inv
        .argv
        .split_first()
        .ok_or_else(|| JobError::invalid("command is required"))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(inv.cwd)
        .envs(inv.env)
        .stdin(if inv.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|source| JobError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pid = child.id();
    debug!(?pid, program = %program, "spawned");

    let mut stdin = child.stdin.take();
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| JobError::internal("failed to capture stdout"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| JobError::internal("failed to capture stderr"))?;

    let payload = inv.stdin;
    let collect = async {
        let feed = async {
            if let (Some(mut pipe), Some(bytes)) = (stdin.take(), payload) {
                // A tool that exits without draining stdin is not an error.
                if let Err(err) = pipe.write_all(bytes).await {
                    debug!(error = %err, "stdin closed early");
                }
            }
        };

        let mut out = Vec::new();
        let mut err = Vec::new();
        let ((), read_out, read_err) = tokio::join!(
            feed,
            stdout.read_to_end(&mut out),
            stderr.read_to_end(&mut err)
        );
        read_out.map_err(|e| JobError::internal(format!("read stdout: {e}")))?;
        read_err.map_err(|e| JobError::internal(format!("read stderr: {e}")))?;

        let status = child
            .wait()
            .await
            .map_err(|e| JobError::internal(format!("wait command: {e}")))?;
        Ok::<_, JobError>((status, out, err))
    };

    let outcome = tokio::time::timeout(inv.deadline, collect).await;
    match outcome {
        Ok(Ok((status, stdout, stderr))) => Ok(ProcessOutput {
            exit_code: exit_code(status),
            stdout,
            stderr,
        }),
        Ok(Err(err)) => {
            terminate(&mut child, pid).await;
            Err(err)
        }
        Err(_) => {
            warn!(
                ?pid,
                timeout = %humantime::format_duration(inv.deadline),
                "deadline exceeded, killing process group"
            );
            terminate(&mut child, pid).await;
            Err(JobError::TimedOut {
                timeout: inv.deadline,
            })
        }
    }
}

async fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        kill_process_group(pid);
    }

    if let Err(err) = child.start_kill() {
        debug!(?pid, error = %err, "kill");
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(?pid, %status, "process terminated"),
        Ok(Err(err)) => warn!(?pid, error = %err, "failed to reap killed process"),
        Err(_) => warn!(?pid, "process still alive after kill"),
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    // The child leads its own group (process_group(0)), so this also reaches
    // anything it forked.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(
            pgid,
            error = %std::io::Error::last_os_error(),
            "killpg"
        );
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}

/// Last `line_limit` lines of `input`, capped at `char_limit` characters.
pub fn tail(input: &str, line_limit: usize, char_limit: usize) -> Option<String> {
    if input.is_empty() {
        return None;
    }

    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        return None;
    }

    let mut lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() > line_limit {
        lines = lines.split_off(lines.len() - line_limit);
    }

    let mut out = lines.join("\n");

    if out.chars().count() > char_limit {
        let start = out.chars().count().saturating_sub(char_limit);
        out = out.chars().skip(start).collect();
    }

    Some(out)
}
