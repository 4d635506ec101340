//! Process-per-trial executor.
//!
//! Every call gets a fresh scratch directory and a fresh interpreter process,
//! so nothing a candidate defines survives into the next trial.
//!
//! On unix the interpreter leads its own process group. The whole group is
//! killed once the trial ends, on timeout or normal exit, so processes the
//! candidate spawned cannot outlive it. The interpreter's working directory
//! is the scratch directory.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::domain::{ErrorKind, ExecutorOutcome};

use super::error::{ExecutorError, ExecutorResult};
use super::harness::{Envelope, PYTHON_HARNESS};
use super::{Executor, ExecutorConfig};

const CANDIDATE_FILE: &str = "candidate.py";
const HARNESS_FILE: &str = "harness.py";
const ARG_FILE: &str = "arg.json";
const RESULT_FILE: &str = "result.json";

/// Grace period for draining stderr once the interpreter has exited.
const STDERR_DRAIN: Duration = Duration::from_millis(250);

/// Runs candidates in a child interpreter under a wall-clock timeout.
#[derive(Debug, Clone)]
pub struct InterpreterExecutor {
    config: ExecutorConfig,
}

impl InterpreterExecutor {
    pub fn new(config: ExecutorConfig) -> ExecutorResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    async fn scratch_dir(&self) -> ExecutorResult<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("trial-");
        let dir = match &self.config.scratch_root {
            Some(root) => {
                tokio::fs::create_dir_all(root)
                    .await
                    .map_err(ExecutorError::Workspace)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        };
        dir.map_err(ExecutorError::Workspace)
    }

    async fn harness_path(&self, dir: &Path) -> ExecutorResult<PathBuf> {
        if let Some(custom) = &self.config.harness_script {
            // The interpreter runs inside the scratch dir.
            return tokio::fs::canonicalize(custom)
                .await
                .map_err(ExecutorError::Workspace);
        }
        let path = dir.join(HARNESS_FILE);
        tokio::fs::write(&path, PYTHON_HARNESS)
            .await
            .map_err(ExecutorError::Workspace)?;
        Ok(path)
    }
}

#[async_trait]
impl Executor for InterpreterExecutor {
    async fn execute(
        &self,
        source: &str,
        entrypoint: &str,
        arity: usize,
        arg: &Value,
    ) -> ExecutorResult<ExecutorOutcome> {
        let scratch = self.scratch_dir().await?;
        let workdir = tokio::fs::canonicalize(scratch.path())
            .await
            .map_err(ExecutorError::Workspace)?;
        let dir = workdir.as_path();
        let candidate_path = dir.join(CANDIDATE_FILE);
        let arg_path = dir.join(ARG_FILE);
        let result_path = dir.join(RESULT_FILE);

        tokio::fs::write(&candidate_path, source)
            .await
            .map_err(ExecutorError::Workspace)?;
        let encoded_arg =
            serde_json::to_vec(arg).map_err(|e| ExecutorError::Workspace(e.into()))?;
        tokio::fs::write(&arg_path, encoded_arg)
            .await
            .map_err(ExecutorError::Workspace)?;
        let harness = self.harness_path(dir).await?;

        let mut cmd = Command::new(&self.config.interpreter);
        cmd.args(&self.config.interpreter_args)
            .arg(&harness)
            .arg(&candidate_path)
            .arg(entrypoint)
            .arg(arity.to_string())
            .arg(&result_path)
            .arg(&arg_path)
            .envs(&self.config.env)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            interpreter: self.config.interpreter.clone(),
            source,
        })?;
        let group = child.id();
        let tail_bytes = self.config.stderr_tail_bytes;
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_tail(stderr, tail_bytes)));

        let limit = Duration::from_millis(self.config.timeout_ms);
        let status = match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status.map_err(ExecutorError::Wait)?,
            Err(_elapsed) => {
                kill_process_group(group);
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill timed-out interpreter");
                }
                if let Some(task) = stderr_task {
                    task.abort();
                }
                debug!(limit_ms = self.config.timeout_ms, "candidate timed out");
                return Ok(ExecutorOutcome::TimedOut {
                    limit_ms: self.config.timeout_ms,
                });
            }
        };

        // The interpreter is gone but its descendants may still hold the
        // stderr pipe open.
        kill_process_group(group);

        let stderr_tail = match stderr_task {
            Some(mut task) => match tokio::time::timeout(STDERR_DRAIN, &mut task).await {
                Ok(Ok(tail)) => tail,
                Ok(Err(_)) => String::new(),
                Err(_) => {
                    task.abort();
                    String::new()
                }
            },
            None => String::new(),
        };

        match tokio::fs::read_to_string(&result_path).await {
            Ok(raw) => match Envelope::parse(&raw) {
                Ok(envelope) => Ok(envelope.into_outcome(entrypoint)),
                Err(e) => Ok(crash(status, &format!("{e}; {stderr_tail}"))),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(crash(status, &stderr_tail)),
            Err(e) => Err(ExecutorError::Workspace(e)),
        }
    }
}

/// SIGKILL every process in the trial's group. A group that has already
/// emptied out is not an error.
#[cfg(unix)]
fn kill_process_group(group: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = group.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "failed to kill trial process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_group: Option<u32>) {}

fn crash(status: ExitStatus, stderr_tail: &str) -> ExecutorOutcome {
    let tail = stderr_tail.trim();
    let message = if tail.is_empty() {
        format!("interpreter exited ({status}) without a result")
    } else {
        format!("interpreter exited ({status}) without a result: {tail}")
    };
    ExecutorOutcome::RaisedError {
        kind: ErrorKind::Crash,
        message,
    }
}

/// Read `reader` to EOF keeping only the last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > limit {
                    let excess = tail.len() - limit;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}
