//! Runner adapters.
//!
//! Each external runner is wrapped by a [`RunnerAdapter`]. An adapter knows
//! how to build the runner's command lines, how to turn its discovery output
//! into a [`Tests`] tree, and where the results of a run come from.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        RunnerAdapter                            │
//! ├────────────────────────────────────────────────────────────────┤
//! │  build_discovery_invocation ──► Command ──► ProcessRunner       │
//! │                                               │                 │
//! │  parse_discovery_output(stdout) ◄─────────────┘                 │
//! │           │                                                     │
//! │           ▼                                                     │
//! │        Tests ──► build_run_invocations ──► Command* ──► runner  │
//! │                                                        │        │
//! │  results: xUnit file (pytest, nose) or transport (unittest)     │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Adapters
//!
//! | Adapter | Runner | Discovery | Results |
//! |---------|--------|-----------|---------|
//! | [`pytest::PytestAdapter`] | pytest | `--collect-only` tree | `--junitxml` |
//! | [`unittest::UnittestAdapter`] | unittest | bundled discovery script | result transport |
//! | [`nose::NoseAdapter`] | nosetests | `--collect-only -vvv` selector log | `--with-xunit` |

pub mod nose;
pub mod pytest;
pub mod unittest;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bundled::BundledError;
use crate::config::Config;
use crate::model::{RunSelector, SharedTests, TestProvider, Tests};
use crate::process::{Command, ProcessError, ProcessRunner, expand_path, runner_command};
use crate::report::Reporter;
use crate::results::junit::JunitError;
use crate::transport::TransportError;

pub use nose::NoseAdapter;
pub use pytest::PytestAdapter;
pub use unittest::UnittestAdapter;

/// Result type for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors raised by runner adapters.
///
/// Adapters report raw failures; the test manager decides whether an error
/// is a user cancellation or a real failure.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The operation's token was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// The discovery command exited unsuccessfully without usable output.
    #[error("{provider} discovery failed with exit code {exit_code}")]
    DiscoveryFailed {
        provider: TestProvider,
        exit_code: i32,
        output: String,
    },

    /// A run produced no results to read.
    #[error("{provider} run failed: {message}")]
    RunFailed {
        provider: TestProvider,
        message: String,
    },

    /// Runner output did not follow the expected format.
    #[error("Failed to parse runner output: {0}")]
    Parse(String),

    #[error(transparent)]
    Process(ProcessError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Report(#[from] JunitError),

    #[error(transparent)]
    Bundled(#[from] BundledError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProcessError> for AdapterError {
    fn from(error: ProcessError) -> Self {
        match error {
            ProcessError::Cancelled => AdapterError::Cancelled,
            other => AdapterError::Process(other),
        }
    }
}

impl AdapterError {
    /// Runner output attached to the error, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            AdapterError::DiscoveryFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Everything an adapter needs from its workspace for one operation.
#[derive(Clone)]
pub struct RunnerContext {
    /// Workspace root.
    pub root: PathBuf,
    /// Directory the runner is launched from.
    pub cwd: PathBuf,
    /// Settings snapshot taken when the operation started.
    pub settings: Config,
    pub process: Arc<dyn ProcessRunner>,
    pub reporter: Arc<dyn Reporter>,
}

impl RunnerContext {
    /// The user's arguments for `provider`.
    pub fn args(&self, provider: TestProvider) -> &[String] {
        self.settings.unit_test.args(provider)
    }

    /// The interpreter, with `~` and variables expanded.
    pub fn python(&self) -> String {
        expand_path(&self.settings.python.interpreter)
    }

    /// The base command launching `provider`, run from [`Self::cwd`].
    pub fn runner_command(&self, provider: TestProvider) -> Command {
        runner_command(
            self.settings.unit_test.executable(provider),
            provider.module_name(),
            &self.settings.python.interpreter,
        )
        .working_dir(&self.cwd)
    }
}

/// Files the runner writes results to, or the port it reports them on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunArtifacts {
    pub result_port: Option<u16>,
    pub xunit_file: Option<PathBuf>,
}

/// A test runner integration.
#[async_trait]
pub trait RunnerAdapter: Send + Sync {
    fn provider(&self) -> TestProvider;

    /// Builds the collect-only command.
    fn build_discovery_invocation(&self, ctx: &RunnerContext, ignore_cache: bool) -> AdapterResult<Command>;

    /// Turns discovery stdout into a test tree. `root` is the directory test
    /// file names are relative to.
    fn parse_discovery_output(&self, output: &str, root: &Path) -> AdapterResult<Tests>;

    /// Builds the commands executing `selector`, in order.
    fn build_run_invocations(
        &self,
        ctx: &RunnerContext,
        tests: &Tests,
        selector: &RunSelector,
        artifacts: &RunArtifacts,
    ) -> AdapterResult<Vec<Command>>;

    /// Whether `exit_code` means discovery finished normally.
    fn is_clean_exit(&self, exit_code: i32) -> bool {
        exit_code == 0
    }

    /// Directory discovered file names are relative to.
    fn discovery_root(&self, ctx: &RunnerContext) -> PathBuf {
        ctx.cwd.clone()
    }

    /// Runs discovery and parses its output.
    ///
    /// A clean exit with no tests is an empty tree. An unclean exit is only
    /// an error when nothing could be parsed from the output.
    async fn discover(
        &self,
        ctx: &RunnerContext,
        ignore_cache: bool,
        token: &CancellationToken,
    ) -> AdapterResult<Tests> {
        let cmd = self.build_discovery_invocation(ctx, ignore_cache)?;
        let result = ctx.process.execute(&cmd, token).await?;
        if token.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }

        let root = self.discovery_root(ctx);
        let parsed = self.parse_discovery_output(&result.stdout, &root);
        if self.is_clean_exit(result.exit_code) {
            return parsed;
        }

        match parsed {
            Ok(tests) if tests.test_files().next().is_some() => {
                debug!(
                    "{} discovery exited with {} but produced {} files",
                    self.provider(),
                    result.exit_code,
                    tests.test_files().count()
                );
                Ok(tests)
            }
            Ok(_) | Err(_) => {
                warn!("{} discovery failed with exit code {}", self.provider(), result.exit_code);
                Err(AdapterError::DiscoveryFailed {
                    provider: self.provider(),
                    exit_code: result.exit_code,
                    output: result.combined_output(),
                })
            }
        }
    }

    /// Runs `selector` against `tests`, recording results into it.
    async fn run(
        &self,
        ctx: &RunnerContext,
        tests: SharedTests,
        selector: &RunSelector,
        token: &CancellationToken,
    ) -> AdapterResult<()>;
}

/// Creates the adapter for `provider`.
pub fn create_adapter(provider: TestProvider) -> Arc<dyn RunnerAdapter> {
    match provider {
        TestProvider::Unittest => Arc::new(UnittestAdapter::new()),
        TestProvider::Pytest => Arc::new(PytestAdapter::new()),
        TestProvider::Nosetest => Arc::new(NoseAdapter::new()),
    }
}

/// Identifiers the runner is given for a subset run: folders, files,
/// suites, then functions.
pub(crate) fn subset_names(selector: &RunSelector) -> Vec<String> {
    selector
        .subset()
        .map(|subset| subset.names().map(str::to_string).collect())
        .unwrap_or_default()
}

pub(crate) fn lock_tests(tests: &SharedTests) -> std::sync::MutexGuard<'_, Tests> {
    tests.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A temporary xUnit report path that is removed when dropped.
pub(crate) fn xunit_report_file() -> AdapterResult<tempfile::TempPath> {
    let file = tempfile::Builder::new()
        .prefix("pyrunner-")
        .suffix(".xml")
        .tempfile()?;
    Ok(file.into_temp_path())
}

/// Reads an xUnit report into `tests` after an xUnit-reporting run.
pub(crate) fn ingest_xunit_report(
    provider: TestProvider,
    tests: &SharedTests,
    report: &Path,
) -> AdapterResult<()> {
    // A runner that died before reporting may leave no file at all.
    let xml = match std::fs::read_to_string(report) {
        Ok(xml) => xml,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(AdapterError::Io(e)),
    };
    if xml.trim().is_empty() {
        return Err(AdapterError::RunFailed {
            provider,
            message: format!("no results were written to {}", report.display()),
        });
    }
    let cases = crate::results::junit::parse_report(&xml)?;

    let mut tests = lock_tests(tests);
    let matched = crate::results::junit::apply_junit_report(&mut tests, &cases);
    debug!("{}: {} of {} xUnit results matched", provider, matched, cases.len());
    crate::results::update_results(&mut tests);
    Ok(())
}

/// Executes xUnit-reporting commands in order, streaming their output to
/// the reporter. A non-zero exit is expected when tests fail.
pub(crate) async fn execute_all(
    ctx: &RunnerContext,
    commands: &[Command],
    token: &CancellationToken,
) -> AdapterResult<()> {
    for cmd in commands {
        let result = ctx.process.execute(cmd, token).await?;
        ctx.reporter.on_output(&result.combined_output());
        if token.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }
        debug!("{} exited with {}", cmd.program, result.exit_code);
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_unclean_exit_without_output_fails() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(crate::process::ExecResult {
            exit_code: 2,
            stderr: "No module named pytest".into(),
            ..Default::default()
        });
        let ctx = context(Path::new("/ws"), Config::default(), runner);

        let err = PytestAdapter::new()
            .discover(&ctx, false, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AdapterError::DiscoveryFailed { exit_code, output, .. } => {
                assert_eq!(exit_code, 2);
                assert!(output.contains("No module named pytest"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clean_exit_with_empty_output_is_empty() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(output(0, ""));
        let ctx = context(Path::new("/ws"), Config::default(), runner);

        let tests = UnittestAdapter::new()
            .discover(&ctx, false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(tests.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_discovery() {
        let runner = Arc::new(ScriptedRunner::default());
        let ctx = context(Path::new("/ws"), Config::default(), runner.clone());
        let token = CancellationToken::new();
        token.cancel();

        let err = NoseAdapter::new().discover(&ctx, false, &token).await.unwrap_err();
        assert!(matches!(err, AdapterError::Cancelled));
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn test_unreadable_report_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("report.xml");
        std::fs::write(&report, [0xff, 0xfe, b'<']).unwrap();
        let tests: SharedTests = Arc::new(std::sync::Mutex::new(Tests::default()));

        let err = ingest_xunit_report(TestProvider::Pytest, &tests, &report).unwrap_err();
        assert!(matches!(err, AdapterError::Io(_)), "unexpected error {err:?}");
    }

    #[test]
    fn test_empty_or_missing_report_means_no_results() {
        let dir = tempfile::tempdir().unwrap();
        let tests: SharedTests = Arc::new(std::sync::Mutex::new(Tests::default()));

        let empty = dir.path().join("empty.xml");
        std::fs::write(&empty, "  \n").unwrap();
        let missing = dir.path().join("missing.xml");
        for report in [empty, missing] {
            match ingest_xunit_report(TestProvider::Nosetest, &tests, &report) {
                Err(AdapterError::RunFailed { message, .. }) => assert!(message.contains("no results were written")),
                other => panic!("unexpected result {other:?}"),
            }
        }
    }

    #[test]
    fn test_create_adapter() {
        for provider in [TestProvider::Unittest, TestProvider::Pytest, TestProvider::Nosetest] {
            assert_eq!(create_adapter(provider).provider(), provider);
        }
    }
}
