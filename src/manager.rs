//! Test manager.
//!
//! A [`TestManager`] owns the discovered [`Tests`] of one workspace for one
//! runner, and sequences discovery and runs against it:
//!
//! ```text
//!  discover_tests ──► cached? ──yes──► Idle, cached tree
//!        │              │
//!        │              no
//!        │              ▼
//!        └──► in flight? ──yes──► await the same discovery
//!                       │
//!                       no ──► Discovering ──► adapter.discover ──► Idle / Error
//!
//!  run_test ──► Running ──► discovery (child token) ──► adapter.run ──► Idle / Error
//! ```
//!
//! # Cancellation
//!
//! Every operation runs on a child of the manager's stop token.
//! [`TestManager::stop`] cancels that token, which kills the runner
//! subprocess and makes the pending operation fail with
//! [`ManagerError::Cancelled`] (displayed as [`CANCELLATION_REASON`]). A
//! cancelled operation leaves the manager `Idle`, never `Error`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterError, RunnerAdapter, RunnerContext, lock_tests};
use crate::config::{Config, SettingsProvider};
use crate::model::{RunSelector, SharedTests, TestProvider, TestStatus, TestSummary, Tests};
use crate::process::ProcessRunner;
use crate::report::Reporter;
use crate::results::reset_results;

/// The message a cancelled operation fails with.
pub const CANCELLATION_REASON: &str = "cancelled_user_request";

/// Result type for manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Errors returned by [`TestManager`] operations.
///
/// Cloneable so that every caller awaiting a shared discovery gets the
/// same error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ManagerError {
    /// The operation was stopped by the user.
    #[error("cancelled_user_request")]
    Cancelled,

    #[error("Test discovery failed: {0}")]
    Discovery(Arc<AdapterError>),

    #[error("Test run failed: {0}")]
    Run(Arc<AdapterError>),

    /// `pyrunner.toml` could not be loaded.
    #[error("Failed to load settings: {0}")]
    Settings(String),
}

impl ManagerError {
    /// Returns `true` for user cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ManagerError::Cancelled)
    }
}

type DiscoveryFuture = Shared<BoxFuture<'static, ManagerResult<SharedTests>>>;

struct State {
    status: TestStatus,
    tests: Option<SharedTests>,
    discovery: Option<DiscoveryFuture>,
    stop: CancellationToken,
    /// Set from the start of `run_test` until `finish_run`. Discovery never
    /// writes the status while it is set.
    running: bool,
}

struct Inner {
    provider: TestProvider,
    root: PathBuf,
    adapter: Arc<dyn RunnerAdapter>,
    settings: Arc<dyn SettingsProvider>,
    process: Arc<dyn ProcessRunner>,
    reporter: Arc<dyn Reporter>,
    state: Mutex<State>,
}

/// Discovers and runs the tests of one workspace with one runner.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TestManager {
    inner: Arc<Inner>,
}

impl TestManager {
    pub fn new(
        provider: TestProvider,
        root: impl Into<PathBuf>,
        adapter: Arc<dyn RunnerAdapter>,
        settings: Arc<dyn SettingsProvider>,
        process: Arc<dyn ProcessRunner>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                root: root.into(),
                adapter,
                settings,
                process,
                reporter,
                state: Mutex::new(State {
                    status: TestStatus::Unknown,
                    tests: None,
                    discovery: None,
                    stop: CancellationToken::new(),
                    running: false,
                }),
            }),
        }
    }

    pub fn provider(&self) -> TestProvider {
        self.inner.provider
    }

    /// Workspace root.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn status(&self) -> TestStatus {
        self.lock_state().status
    }

    /// The cached tree of the last successful discovery.
    pub fn tests(&self) -> Option<SharedTests> {
        self.lock_state().tests.clone()
    }

    /// The directory runners are launched from: the `cwd` setting when
    /// set, otherwise the workspace root.
    pub fn working_directory(&self) -> PathBuf {
        match self.inner.settings.settings() {
            Ok(settings) => working_directory(&self.inner.root, &settings),
            Err(e) => {
                warn!("Using workspace root as working directory: {:#}", e);
                self.inner.root.clone()
            }
        }
    }

    /// Discovers tests, reusing the cached tree unless `ignore_cache` is
    /// set. Concurrent calls share a single discovery.
    ///
    /// With `quiet`, discovery results and collection errors are not sent
    /// to the reporter.
    pub async fn discover_tests(&self, ignore_cache: bool, quiet: bool) -> ManagerResult<SharedTests> {
        self.discover(ignore_cache, quiet, None).await
    }

    async fn discover(
        &self,
        ignore_cache: bool,
        quiet: bool,
        run_token: Option<&CancellationToken>,
    ) -> ManagerResult<SharedTests> {
        let future = {
            let mut state = self.lock_state();
            match state.discovery.clone() {
                Some(in_flight) => {
                    debug!("Joining in-flight {} discovery", self.inner.provider);
                    in_flight
                }
                None => {
                    if !ignore_cache
                        && let Some(tests) = &state.tests
                        && !lock_tests(tests).is_empty()
                    {
                        let tests = tests.clone();
                        if !state.running {
                            state.status = TestStatus::Idle;
                        }
                        return Ok(tests);
                    }

                    let within_run = run_token.is_some();
                    let token = match run_token {
                        Some(run) => run.child_token(),
                        None => {
                            if !state.running {
                                state.status = TestStatus::Discovering;
                            }
                            state.stop.child_token()
                        }
                    };
                    let future = self
                        .clone()
                        .discovery_task(ignore_cache, quiet, token, within_run)
                        .boxed()
                        .shared();
                    state.discovery = Some(future.clone());
                    future
                }
            }
        };
        future.await
    }

    async fn discovery_task(
        self,
        ignore_cache: bool,
        quiet: bool,
        token: CancellationToken,
        within_run: bool,
    ) -> ManagerResult<SharedTests> {
        info!("Discovering {} tests", self.inner.provider);
        let result = match self.context() {
            Ok(ctx) => self
                .inner
                .adapter
                .discover(&ctx, ignore_cache, &token)
                .await
                .map_err(|e| ManagerError::Discovery(Arc::new(e))),
            Err(e) => Err(e),
        };

        let mut state = self.lock_state();
        state.discovery = None;
        match result {
            Ok(mut tests) => {
                reset_results(&mut tests);
                let shared: SharedTests = Arc::new(Mutex::new(tests));
                state.tests = Some(shared.clone());
                if !state.running {
                    state.status = TestStatus::Idle;
                }
                drop(state);

                let tests = lock_tests(&shared);
                debug!(
                    "Discovered {} tests in {} files",
                    tests.test_functions().len(),
                    tests.test_files().count()
                );
                self.report_discovery_errors(&tests, quiet);
                if !quiet {
                    self.inner.reporter.on_discovery_complete(self.inner.provider, &tests);
                }
                drop(tests);
                Ok(shared)
            }
            Err(_) if token.is_cancelled() => {
                state.tests = None;
                if !state.running {
                    state.status = TestStatus::Idle;
                }
                info!("{} discovery cancelled", self.inner.provider);
                Err(ManagerError::Cancelled)
            }
            Err(e) => {
                state.tests = None;
                if !state.running {
                    state.status = TestStatus::Error;
                }
                drop(state);

                if let ManagerError::Discovery(adapter_error) = &e
                    && let Some(output) = adapter_error.output()
                {
                    self.inner.reporter.on_output(output);
                }
                if !within_run {
                    self.inner.reporter.on_error(&e.to_string());
                }
                Err(e)
            }
        }
    }

    fn report_discovery_errors(&self, tests: &Tests, quiet: bool) {
        let broken: Vec<_> = tests.files_with_discovery_errors().collect();
        if broken.is_empty() {
            return;
        }
        for file in &broken {
            warn!("Failed to collect {}", file.name_to_run);
            let separator = "_".repeat(10);
            self.inner.reporter.on_output(&format!(
                "{separator}There was an error in identifying unit tests in {}{separator}\n{}",
                file.name_to_run,
                file.errors_when_discovering.as_deref().unwrap_or_default()
            ));
        }
        if !quiet {
            let names: Vec<&str> = broken.iter().map(|f| f.name_to_run.as_str()).collect();
            self.inner.reporter.on_discovery_errors(&format!(
                "There were errors discovering tests in {} file(s): {}",
                broken.len(),
                names.join(", ")
            ));
        }
    }

    /// Runs the selected tests.
    ///
    /// A full run re-discovers first and resets previous results. Failed
    /// and subset runs reuse the cached tree so earlier statuses survive. If
    /// that discovery fails the run proceeds with an empty tree.
    pub async fn run_test(&self, selector: impl Into<RunSelector>) -> ManagerResult<SharedTests> {
        let selector = selector.into();
        let full_run = selector == RunSelector::All;
        let token = {
            let mut state = self.lock_state();
            if full_run && let Some(tests) = &state.tests {
                reset_results(&mut lock_tests(tests));
            }
            state.status = TestStatus::Running;
            state.running = true;
            state.stop.child_token()
        };

        let tests = match self.discover(full_run, true, Some(&token)).await {
            Ok(tests) => tests,
            Err(_) if token.is_cancelled() => return self.finish_run(Err(ManagerError::Cancelled)),
            Err(e) => {
                warn!("Discovery failed, continuing with no tests: {}", e);
                self.inner
                    .reporter
                    .on_error("Errors in discovering tests, continuing with tests");
                Arc::new(Mutex::new(Tests::default()))
            }
        };

        let ctx = match self.context() {
            Ok(ctx) => ctx,
            Err(e) => return self.finish_run(Err(e)),
        };
        lock_tests(&tests).summary = TestSummary::default();

        info!("Running {} tests", self.inner.provider);
        let result = self
            .inner
            .adapter
            .run(&ctx, tests.clone(), &selector, &token)
            .await;

        match result {
            Ok(()) => {
                self.inner.reporter.on_run_complete(&lock_tests(&tests));
                self.finish_run(Ok(tests))
            }
            Err(_) if token.is_cancelled() => self.finish_run(Err(ManagerError::Cancelled)),
            Err(e) => self.finish_run(Err(ManagerError::Run(Arc::new(e)))),
        }
    }

    fn finish_run(&self, result: ManagerResult<SharedTests>) -> ManagerResult<SharedTests> {
        let mut state = self.lock_state();
        state.running = false;
        match &result {
            Ok(_) => state.status = TestStatus::Idle,
            Err(ManagerError::Cancelled) => {
                info!("{} run cancelled", self.inner.provider);
                state.status = TestStatus::Idle;
            }
            Err(e) => {
                state.status = TestStatus::Error;
                state.tests = None;
                drop(state);
                self.inner.reporter.on_error(&e.to_string());
            }
        }
        result
    }

    /// Cancels the in-flight discovery or run, if any.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        state.stop.cancel();
        state.stop = CancellationToken::new();
    }

    /// Forgets the cached tree.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        state.status = TestStatus::Unknown;
        state.tests = None;
    }

    /// Stops any in-flight work and releases the cached tree.
    pub fn dispose(&self) {
        self.stop();
        self.reset();
    }

    fn context(&self) -> ManagerResult<RunnerContext> {
        let settings = self
            .inner
            .settings
            .settings()
            .map_err(|e| ManagerError::Settings(format!("{e:#}")))?;
        Ok(RunnerContext {
            root: self.inner.root.clone(),
            cwd: working_directory(&self.inner.root, &settings),
            settings,
            process: self.inner.process.clone(),
            reporter: self.inner.reporter.clone(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn working_directory(root: &Path, settings: &Config) -> PathBuf {
    match &settings.unit_test.cwd {
        Some(cwd) if !cwd.as_os_str().is_empty() => root.join(crate::process::expand_path(&cwd.to_string_lossy())),
        _ => root.to_path_buf(),
    }
}
