//! Subprocess invocation.
//!
//! Every runner adapter talks to its external runner through the
//! [`ProcessRunner`] trait: build a [`Command`], execute it with a
//! [`CancellationToken`], get back an [`ExecResult`] with buffered output.
//!
//! ```text
//! RunnerAdapter ── Command ──► ProcessRunner::execute ──► ExecResult
//!                                     ▲
//!                     CancellationToken (kills the child)
//! ```
//!
//! # Built-in Runners
//!
//! | Runner | Module | Description |
//! |--------|--------|-------------|
//! | Local | [`local`] | Spawns child processes with `tokio::process` |
//!
//! Tests substitute their own implementation to script runner output and
//! count spawns.

pub mod local;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use local::LocalProcessRunner;

/// Result type for process operations.
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Errors that can occur while running a subprocess.
///
/// A command that runs but exits non-zero is not an error; callers inspect
/// [`ExecResult::exit_code`].
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The program could not be started (missing executable, permissions).
    #[error("Failed to launch {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The token was cancelled before the child exited. The child has been
    /// killed.
    #[error("Process cancelled")]
    Cancelled,

    /// I/O error while collecting output.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A command to execute.
///
/// # Example
///
/// ```
/// use pyrunner::process::Command;
///
/// let cmd = Command::new("python")
///     .args(["-m", "pytest", "--collect-only"])
///     .working_dir("/app")
///     .env("PYTHONDONTWRITEBYTECODE", "1");
///
/// assert_eq!(cmd.program, "python");
/// assert_eq!(cmd.args.len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory; the current directory when `None`.
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables.
    pub env: Vec<(String, String)>,

    /// Append stderr to stdout instead of keeping it separate.
    pub merge_stderr: bool,
}

impl Command {
    /// Creates a new command with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            merge_stderr: false,
        }
    }

    /// Adds a single argument to the command.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments to the command.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable for this command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Merges stderr into stdout.
    pub fn merge_stderr(mut self) -> Self {
        self.merge_stderr = true;
        self
    }

    /// Renders the command as a shell string, for logs and output.
    ///
    /// ```
    /// use pyrunner::process::Command;
    /// let cmd = Command::new("pytest").arg("-k").arg("add or sub");
    /// assert_eq!(cmd.to_shell_string(), "pytest -k 'add or sub'");
    /// ```
    pub fn to_shell_string(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|part| shell_words::quote(part).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Exit code; `-1` when the process was terminated by a signal.
    pub exit_code: i32,

    /// Captured standard output (including stderr if it was merged).
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// Wall-clock time the command took to execute.
    pub duration: Duration,
}

impl ExecResult {
    /// Returns `true` if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout.trim_end_matches('\n'), self.stderr)
        }
    }
}

/// Executes commands on behalf of the runner adapters.
///
/// Implementations must stop the child when `token` is cancelled and
/// return [`ProcessError::Cancelled`]. Output is buffered until exit.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn execute(&self, cmd: &Command, token: &CancellationToken) -> ProcessResult<ExecResult>;
}

/// Builds the command that launches a runner.
///
/// An explicit executable path (anything that is not a bare file name) is
/// run directly. Otherwise the runner is started as a module of the
/// configured interpreter: `python -m <module>`. `~` and environment
/// variables in both paths are expanded.
///
/// ```
/// use pyrunner::process::runner_command;
///
/// let cmd = runner_command(Some("pytest"), "pytest", "python3");
/// assert_eq!(cmd.program, "python3");
/// assert_eq!(cmd.args, vec!["-m", "pytest"]);
///
/// let cmd = runner_command(Some("/venv/bin/py.test"), "pytest", "python3");
/// assert_eq!(cmd.program, "/venv/bin/py.test");
/// assert!(cmd.args.is_empty());
/// ```
pub fn runner_command(executable: Option<&str>, module: &str, python: &str) -> Command {
    match executable.map(expand_path).filter(|exe| is_explicit_path(exe)) {
        Some(exe) => Command::new(exe),
        None => Command::new(expand_path(python)).args(["-m", module]),
    }
}

fn is_explicit_path(executable: &str) -> bool {
    let path = Path::new(executable);
    path.file_name()
        .is_some_and(|name| name != path.as_os_str())
}

/// Expands `~` and `$VAR` in a configured path, leaving it unchanged when
/// a variable is undefined.
pub fn expand_path(path: &str) -> String {
    match shellexpand::full(path) {
        Ok(expanded) => expanded.into_owned(),
        Err(_) => shellexpand::tilde(path).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output() {
        let result = ExecResult {
            exit_code: 1,
            stdout: "out\n".into(),
            stderr: "err".into(),
            duration: Duration::ZERO,
        };
        assert_eq!(result.combined_output(), "out\nerr");
        assert!(!result.success());
    }

    #[test]
    fn test_runner_command_module_fallback() {
        let cmd = runner_command(None, "nose", "python");
        assert_eq!(cmd.program, "python");
        assert_eq!(cmd.args, vec!["-m", "nose"]);

        let cmd = runner_command(Some("nosetests"), "nose", "python");
        assert_eq!(cmd.args, vec!["-m", "nose"]);

        let cmd = runner_command(Some("./bin/nosetests"), "nose", "python");
        assert_eq!(cmd.program, "./bin/nosetests");
    }

    #[test]
    fn test_expand_path_keeps_unknown_variables() {
        assert_eq!(expand_path("$PYRUNNER_SURELY_UNSET/x"), "$PYRUNNER_SURELY_UNSET/x");
    }
}
