//! Local child process runner.
//!
//! Spawns the command with `tokio::process`, buffers stdout and stderr,
//! and races the child against the cancellation token. The child is
//! spawned with `kill_on_drop`, so abandoning the wait on cancellation is
//! enough to kill it.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Command, ExecResult, ProcessError, ProcessResult, ProcessRunner};

/// Runs commands as child processes of the current process.
#[derive(Debug, Default, Clone)]
pub struct LocalProcessRunner {
    env: Vec<(String, String)>,
}

impl LocalProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an environment variable applied to every command.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl ProcessRunner for LocalProcessRunner {
    async fn execute(&self, cmd: &Command, token: &CancellationToken) -> ProcessResult<ExecResult> {
        if token.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }

        let mut process = tokio::process::Command::new(&cmd.program);
        process.args(&cmd.args);
        if let Some(dir) = &cmd.working_dir {
            process.current_dir(dir);
        }
        for (key, value) in self.env.iter().chain(&cmd.env) {
            process.env(key, value);
        }
        process
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Executing: {}", cmd.to_shell_string());
        let start = Instant::now();
        let child = process.spawn().map_err(|source| ProcessError::SpawnFailed {
            program: cmd.program.clone(),
            source,
        })?;

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = token.cancelled() => {
                debug!("Cancelled: {}", cmd.program);
                return Err(ProcessError::Cancelled);
            }
        };

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if cmd.merge_stderr {
            stdout.push_str(&stderr);
            stderr.clear();
        }

        let result = ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout,
            stderr,
            duration: start.elapsed(),
        };
        debug!(
            "{} exited with {} after {:?}",
            cmd.program, result.exit_code, result.duration
        );
        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_captures_output() {
        let runner = LocalProcessRunner::new();
        let cmd = Command::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let result = runner.execute(&cmd, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_merge_stderr() {
        let runner = LocalProcessRunner::new();
        let cmd = Command::new("sh")
            .args(["-c", "echo out; echo err >&2"])
            .merge_stderr();
        let result = runner.execute(&cmd, &CancellationToken::new()).await.unwrap();
        assert!(result.stdout.contains("out"));
        assert!(result.stdout.contains("err"));
        assert!(result.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_runner_env_applies_to_every_command() {
        let runner = LocalProcessRunner::new().with_env("PYRUNNER_A", "runner");
        let cmd = Command::new("sh")
            .args(["-c", "echo $PYRUNNER_A $PYRUNNER_B"])
            .env("PYRUNNER_B", "command");
        let result = runner.execute(&cmd, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.stdout.trim(), "runner command");
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let runner = LocalProcessRunner::new();
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let start = Instant::now();
        let cmd = Command::new("sleep").arg("30");
        let err = runner.execute(&cmd, &token).await.unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let runner = LocalProcessRunner::new();
        let cmd = Command::new("/definitely/not/a/program");
        let err = runner.execute(&cmd, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProcessError::SpawnFailed { .. }));
    }
}
