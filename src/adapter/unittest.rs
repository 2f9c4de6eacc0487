//! unittest adapter.
//!
//! Discovery runs the bundled discovery program with `python -c`, which
//! prints a `start` marker followed by one dotted test id per line:
//!
//! ```text
//! start
//! tests.test_math.TestAdd.test_simple
//! unittest.loader._FailedTest.test_broken
//! ```
//!
//! Runs go through the bundled launcher, which streams results back over
//! the [result transport](crate::transport). The launcher handles one
//! target per invocation, so a subset run launches it once per selected
//! file, suite or function.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AdapterError, AdapterResult, RunArtifacts, RunnerAdapter, RunnerContext, lock_tests};
use crate::bundled::Script;
use crate::model::{
    Parent, RunSelector, SharedTests, TestFile, TestFunction, TestProvider, TestStatus, TestSuite, Tests,
    TestsBuilder,
};
use crate::process::Command;
use crate::report::Reporter;
use crate::results::{Outcome, mark_running, record_result, update_results};
use crate::transport::{FrameHandler, ResultFrame, ResultServer, ServerEvent};

/// Prefix of the ids unittest gives modules it failed to import.
const FAILED_IMPORT_PREFIX: &str = "unittest.loader._FailedTest.";

/// How long to wait for the launcher's connection to drain after it exits.
const RESULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// The launcher options derived from `unittest_args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnittestOptions {
    pub start_directory: String,
    pub pattern: String,
    pub verbosity: u8,
    pub fail_fast: bool,
}

impl UnittestOptions {
    /// Reads `-s`/`--start-directory`, `-p`/`--pattern`, `-v*` and
    /// `-f`/`--failfast` from `args`.
    ///
    /// ```
    /// use pyrunner::adapter::unittest::UnittestOptions;
    ///
    /// let options = UnittestOptions::from_args(&["-v", "-s", "./tests", "-p=*_test.py"]);
    /// assert_eq!(options.start_directory, "./tests");
    /// assert_eq!(options.pattern, "*_test.py");
    /// assert_eq!(options.verbosity, 2);
    /// assert!(!options.fail_fast);
    /// ```
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Self {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        Self {
            start_directory: option_value(&args, "-s", "--start-directory").unwrap_or_else(|| ".".to_string()),
            pattern: option_value(&args, "-p", "--pattern").unwrap_or_else(|| "test*.py".to_string()),
            verbosity: if args.iter().any(|a| a.starts_with("-v")) { 2 } else { 1 },
            fail_fast: args.iter().any(|a| *a == "-f" || *a == "--failfast"),
        }
    }
}

/// Value of a short/long option given as `-s dir`, `-sdir`, `-s=dir`,
/// `--long dir` or `--long=dir`.
fn option_value(args: &[&str], short: &str, long: &str) -> Option<String> {
    let index = args.iter().position(|a| a.starts_with(short) || a.starts_with(long))?;
    let arg = args[index].trim();
    if arg == short || arg == long {
        return args.get(index + 1).map(|v| v.to_string());
    }
    let rest = arg.strip_prefix(long).or_else(|| arg.strip_prefix(short))?;
    let rest = rest.strip_prefix('=').or_else(|| rest.strip_prefix(' ')).unwrap_or(rest);
    Some(rest.trim().to_string())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnittestAdapter;

impl UnittestAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RunnerAdapter for UnittestAdapter {
    fn provider(&self) -> TestProvider {
        TestProvider::Unittest
    }

    fn build_discovery_invocation(&self, ctx: &RunnerContext, _ignore_cache: bool) -> AdapterResult<Command> {
        let options = UnittestOptions::from_args(ctx.args(TestProvider::Unittest));
        Ok(Command::new(ctx.python())
            .arg("-c")
            .arg(Script::Discovery.source()?)
            .arg(options.start_directory)
            .arg(options.pattern)
            .working_dir(&ctx.cwd))
    }

    fn discovery_root(&self, ctx: &RunnerContext) -> PathBuf {
        let options = UnittestOptions::from_args(ctx.args(TestProvider::Unittest));
        match options.start_directory.as_str() {
            "" | "." | "./" => ctx.cwd.clone(),
            dir => ctx.cwd.join(dir.trim_start_matches("./")),
        }
    }

    fn parse_discovery_output(&self, output: &str, root: &Path) -> AdapterResult<Tests> {
        Ok(parse_test_ids(output, root))
    }

    fn build_run_invocations(
        &self,
        ctx: &RunnerContext,
        tests: &Tests,
        selector: &RunSelector,
        artifacts: &RunArtifacts,
    ) -> AdapterResult<Vec<Command>> {
        let options = UnittestOptions::from_args(ctx.args(TestProvider::Unittest));
        let launcher = Script::Launcher.path()?;

        let mut base = Command::new(ctx.python())
            .arg(launcher.to_string_lossy())
            .arg(format!("--us={}", options.start_directory))
            .arg(format!("--up={}", options.pattern))
            .arg(format!("--uvInt={}", options.verbosity))
            .working_dir(&ctx.cwd);
        if options.fail_fast {
            base = base.arg("--uf");
        }
        if let Some(port) = artifacts.result_port {
            base = base.arg(format!("--result-port={port}"));
        }

        if matches!(selector, RunSelector::Subset(subset) if subset.is_empty()) || *selector == RunSelector::All {
            return Ok(vec![base]);
        }

        Ok(run_targets(tests, selector)
            .into_iter()
            .map(|(file, id)| {
                base.clone()
                    .arg(format!("-t{id}"))
                    .arg(format!("--testFile={}", file.display()))
            })
            .collect())
    }

    async fn run(
        &self,
        ctx: &RunnerContext,
        tests: SharedTests,
        selector: &RunSelector,
        token: &CancellationToken,
    ) -> AdapterResult<()> {
        let options = UnittestOptions::from_args(ctx.args(TestProvider::Unittest));
        let halt = token.child_token();
        let handler = result_handler(
            tests.clone(),
            ctx.reporter.clone(),
            options.fail_fast.then(|| halt.clone()),
        );

        let server = ResultServer::new(handler);
        let port = server.start().await?;
        let artifacts = RunArtifacts {
            result_port: Some(port),
            ..Default::default()
        };
        let commands = {
            let tests = lock_tests(&tests);
            self.build_run_invocations(ctx, &tests, selector, &artifacts)?
        };
        debug!("Launching {} unittest invocation(s)", commands.len());

        let mut outcome = Ok(());
        for cmd in &commands {
            if halt.is_cancelled() {
                break;
            }
            match ctx.process.execute(cmd, &halt).await {
                Ok(result) => ctx.reporter.on_output(&result.combined_output()),
                Err(e) => {
                    outcome = Err(AdapterError::from(e));
                    break;
                }
            }
        }
        server.shutdown(RESULT_DRAIN_GRACE).await;

        if token.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }
        match outcome {
            // Fail-fast halted the remaining invocations.
            Err(AdapterError::Cancelled) => debug!("Stopping after first failure"),
            other => other?,
        }

        update_results(&mut lock_tests(&tests));
        Ok(())
    }
}

/// Parses the output of the discovery program.
///
/// `root` is the start directory; module paths are resolved against it.
pub fn parse_test_ids(output: &str, root: &Path) -> Tests {
    let mut builder = TestsBuilder::new();
    let ids = output
        .lines()
        .skip_while(|line| line.trim_end() != "start")
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty());

    for id in ids {
        if let Some(module) = id.strip_prefix(FAILED_IMPORT_PREFIX) {
            add_failed_module(&mut builder, root, module);
            continue;
        }
        add_test_id(&mut builder, root, id);
    }
    builder.build()
}

fn module_file(root: &Path, module: &str) -> (String, PathBuf) {
    let name = format!("{}.py", module.replace('.', "/"));
    let full_path = root.join(&name);
    (name, full_path)
}

fn add_failed_module(builder: &mut TestsBuilder, root: &Path, module: &str) {
    let (name, full_path) = module_file(root, module);
    if builder.find_file_by_path(&full_path).is_some() {
        return;
    }
    builder.add_file(
        TestFile::new(name, full_path, module)
            .with_discovery_errors(format!("Failed to import test module: {module}")),
    );
}

fn add_test_id(builder: &mut TestsBuilder, root: &Path, id: &str) {
    let parts: Vec<&str> = id.split('.').collect();
    if parts.len() < 3 {
        debug!("Ignoring unittest id {}", id);
        return;
    }
    let module = parts[..parts.len() - 2].join(".");
    let class = parts[parts.len() - 2];
    let method = parts[parts.len() - 1];

    let (name, full_path) = module_file(root, &module);
    let file = match builder.find_file_by_path(&full_path) {
        Some(file) => file,
        None => builder.add_file(TestFile::new(name, full_path, module.clone())),
    };
    let suite = match builder.find_suite_in_file(file, class) {
        Some(suite) => suite,
        None => {
            let class_id = format!("{module}.{class}");
            builder.add_suite(
                Parent::File(file),
                TestSuite::new(class, class_id.clone(), class_id).unit_test(true),
            )
        }
    };
    builder.add_function(Parent::Suite(suite), TestFunction::new(method, id));
}

/// `(file path, id)` pairs for a subset or failed-only run.
fn run_targets(tests: &Tests, selector: &RunSelector) -> Vec<(PathBuf, String)> {
    let mut targets = Vec::new();
    match selector {
        RunSelector::All => {}
        RunSelector::Failed => {
            for flat in tests.test_functions() {
                let function = tests.function(flat.function);
                if matches!(function.status, TestStatus::Fail | TestStatus::Error) {
                    let file = tests.file(flat.parent_file);
                    targets.push((file.full_path.clone(), function.name_to_run.clone()));
                }
            }
        }
        RunSelector::Subset(subset) => {
            for name in &subset.folders {
                let Some(folder) = tests.find_folder(name) else {
                    warn!("Unknown test folder {}", name);
                    continue;
                };
                for file in tests.files_in_folder(folder) {
                    let file = tests.file(file);
                    targets.push((file.full_path.clone(), file.name_to_run.clone()));
                }
            }
            for name in &subset.files {
                match tests.find_file(name) {
                    Some(file) => {
                        let file = tests.file(file);
                        targets.push((file.full_path.clone(), file.name_to_run.clone()));
                    }
                    None => warn!("Unknown test file {}", name),
                }
            }
            for name in &subset.suites {
                match tests.find_suite(name) {
                    Some(suite) => {
                        let file = tests.file(tests.flattened_suite(suite).parent_file);
                        targets.push((file.full_path.clone(), name.clone()));
                    }
                    None => warn!("Unknown test suite {}", name),
                }
            }
            for name in &subset.functions {
                match tests.find_function(name) {
                    Some(function) => {
                        let file = tests.file(tests.flattened_function(function).parent_file);
                        targets.push((file.full_path.clone(), name.clone()));
                    }
                    None => warn!("Unknown test function {}", name),
                }
            }
        }
    }
    targets
}

/// Applies transport events to `tests`. With `fail_fast`, the first
/// failure or error cancels the token.
fn result_handler(
    tests: SharedTests,
    reporter: Arc<dyn Reporter>,
    fail_fast: Option<CancellationToken>,
) -> FrameHandler {
    Arc::new(move |event: ServerEvent| match event {
        ServerEvent::Frame(ResultFrame::Start { test }) => {
            mark_running(&mut lock_tests(&tests), &test);
            reporter.on_test_start(&test);
        }
        ServerEvent::Frame(ResultFrame::Result {
            test,
            outcome,
            message,
            traceback,
        }) => {
            let Some(outcome) = Outcome::parse(&outcome) else {
                debug!("Ignoring result with outcome {:?} for {}", outcome, test);
                return;
            };
            let matched = record_result(&mut lock_tests(&tests), &test, outcome, message.clone(), traceback);
            if !matched {
                return;
            }
            reporter.on_test_result(&test, outcome, message.as_deref());
            if outcome.is_failure()
                && let Some(halt) = &fail_fast
            {
                halt.cancel();
            }
        }
        ServerEvent::Frame(ResultFrame::Other { event }) => debug!("Launcher event: {}", event),
        ServerEvent::Connected => debug!("Launcher connected"),
        ServerEvent::Disconnected => debug!("Launcher disconnected"),
        ServerEvent::Error(message) => warn!("Result transport: {}", message),
    })
}
