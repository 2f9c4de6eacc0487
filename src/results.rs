//! Result aggregation.
//!
//! Runners report per-test outcomes as plain strings (`passed`, `failed`,
//! `error`, `skipped`). This module maps them onto [`TestStatus`], writes
//! them into the matching [`TestFunction`](crate::model::TestFunction), and
//! keeps [`TestSummary`] in step.
//!
//! The summary is only ever incremented here, once per matched result, so
//! after a run `summary.total()` equals the number of results that named a
//! discovered test.

pub mod junit;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{FileId, FolderId, SuiteId, TestStatus, TestSummary, Tests};

/// The outcome of a single test execution, as reported by a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// All assertions succeeded.
    Passed,

    /// An assertion failed.
    Failed,

    /// The test could not complete normally (exception outside an
    /// assertion, broken fixture, import error).
    Error,

    /// The test was not executed.
    Skipped,
}

impl Outcome {
    /// Parses a runner outcome string. Unknown strings yield `None`.
    ///
    /// ```
    /// use pyrunner::results::Outcome;
    ///
    /// assert_eq!(Outcome::parse("failed"), Some(Outcome::Failed));
    /// assert_eq!(Outcome::parse("xpassed"), None);
    /// ```
    pub fn parse(outcome: &str) -> Option<Self> {
        match outcome {
            "passed" => Some(Outcome::Passed),
            "failed" => Some(Outcome::Failed),
            "error" => Some(Outcome::Error),
            "skipped" => Some(Outcome::Skipped),
            _ => None,
        }
    }

    /// The entity status this outcome maps to.
    pub fn status(self) -> TestStatus {
        match self {
            Outcome::Passed => TestStatus::Pass,
            Outcome::Failed => TestStatus::Fail,
            Outcome::Error => TestStatus::Error,
            Outcome::Skipped => TestStatus::Skipped,
        }
    }

    /// Returns `true` for failures and errors.
    pub fn is_failure(self) -> bool {
        matches!(self, Outcome::Failed | Outcome::Error)
    }
}

impl TestSummary {
    /// Increments the counter for `outcome`.
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Passed => self.passed += 1,
            Outcome::Failed => self.failures += 1,
            Outcome::Error => self.errors += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

/// Records one result against the function whose `name_to_run` matches
/// exactly.
///
/// Returns `false` and leaves `tests` untouched when nothing matches.
pub fn record_result(
    tests: &mut Tests,
    name_to_run: &str,
    outcome: Outcome,
    message: Option<String>,
    traceback: Option<String>,
) -> bool {
    let Some(id) = tests.find_function(name_to_run) else {
        debug!("Dropping result for unknown test {}", name_to_run);
        return false;
    };

    let function = tests.function_mut(id);
    function.status = outcome.status();
    function.message = message.filter(|m| !m.is_empty());
    function.traceback = traceback.filter(|t| !t.is_empty());
    tests.summary.record(outcome);
    true
}

/// Marks a function as running. Unknown names are ignored.
pub fn mark_running(tests: &mut Tests, name_to_run: &str) -> bool {
    match tests.find_function(name_to_run) {
        Some(id) => {
            tests.function_mut(id).status = TestStatus::Running;
            true
        }
        None => false,
    }
}

/// Sets every entity back to `Unknown` and zeroes the summary.
pub fn reset_results(tests: &mut Tests) {
    for function in tests.functions_mut() {
        function.status = TestStatus::Unknown;
        function.time = 0.0;
        function.message = None;
        function.traceback = None;
    }
    for suite in tests.suites_mut() {
        suite.status = TestStatus::Unknown;
        suite.time = 0.0;
        suite.passed = None;
        suite.functions_passed = 0;
        suite.functions_failed = 0;
    }
    for file in tests.files_mut() {
        file.status = TestStatus::Unknown;
        file.time = 0.0;
        file.message = None;
        file.traceback = None;
        file.passed = None;
        file.functions_passed = 0;
        file.functions_failed = 0;
    }
    for folder in tests.folders_mut() {
        folder.status = TestStatus::Unknown;
        folder.time = 0.0;
        folder.passed = None;
        folder.functions_passed = 0;
        folder.functions_failed = 0;
    }
    tests.summary = TestSummary::default();
}

/// Aggregate of a container's children.
#[derive(Debug, Default, Clone, Copy)]
struct Rollup {
    time: f64,
    functions_passed: usize,
    functions_failed: usize,
    all_passed: bool,
    all_ran: bool,
}

impl Rollup {
    fn new() -> Self {
        Self {
            all_passed: true,
            all_ran: true,
            ..Default::default()
        }
    }

    fn add_child(&mut self, passed: Option<bool>, time: f64, functions_passed: usize, functions_failed: usize) {
        self.time += time;
        self.functions_passed += functions_passed;
        self.functions_failed += functions_failed;
        match passed {
            Some(false) => self.all_passed = false,
            Some(true) => {}
            None => self.all_ran = false,
        }
    }

    fn passed(&self) -> Option<bool> {
        self.all_ran.then_some(self.all_passed)
    }

    fn status(&self, failed: TestStatus) -> TestStatus {
        match self.passed() {
            Some(true) => TestStatus::Idle,
            Some(false) => failed,
            None => TestStatus::Unknown,
        }
    }
}

/// Rolls function results up into suites, files and folders.
///
/// A container passes when every child ran and passed; it is marked
/// `Error` (suites, files) or `Fail` (folders) when a child failed, and
/// `Unknown` when some child did not run. Skipped functions count as
/// having run without failing.
pub fn update_results(tests: &mut Tests) {
    let files: Vec<FileId> = tests.test_files().map(|(id, _)| id).collect();
    for file in files {
        update_file(tests, file);
    }
    let roots = tests.root_test_folders().to_vec();
    for folder in roots {
        update_folder(tests, folder);
    }
}

fn function_rollup(tests: &Tests, functions: &[crate::model::FunctionId], rollup: &mut Rollup) {
    for id in functions {
        let function = tests.function(*id);
        match function.status {
            TestStatus::Pass => rollup.add_child(Some(true), function.time, 1, 0),
            TestStatus::Fail | TestStatus::Error => rollup.add_child(Some(false), function.time, 0, 1),
            TestStatus::Skipped => rollup.add_child(Some(true), function.time, 0, 0),
            _ => rollup.add_child(None, function.time, 0, 0),
        }
    }
}

fn update_suite(tests: &mut Tests, id: SuiteId) -> Rollup {
    let mut rollup = Rollup::new();
    function_rollup(tests, tests.suite(id).functions(), &mut rollup);
    for child in tests.suite(id).suites().to_vec() {
        let child_rollup = update_suite(tests, child);
        rollup.add_child(
            child_rollup.passed(),
            child_rollup.time,
            child_rollup.functions_passed,
            child_rollup.functions_failed,
        );
    }

    let suite = tests.suite_mut(id);
    suite.time = rollup.time;
    suite.functions_passed = rollup.functions_passed;
    suite.functions_failed = rollup.functions_failed;
    suite.passed = rollup.passed();
    suite.status = rollup.status(TestStatus::Error);
    rollup
}

fn update_file(tests: &mut Tests, id: FileId) {
    // Stub files for collection errors keep whatever status they were given.
    if tests.file(id).functions().is_empty() && tests.file(id).suites().is_empty() {
        return;
    }

    let mut rollup = Rollup::new();
    function_rollup(tests, tests.file(id).functions(), &mut rollup);
    for suite in tests.file(id).suites().to_vec() {
        let suite_rollup = update_suite(tests, suite);
        rollup.add_child(
            suite_rollup.passed(),
            suite_rollup.time,
            suite_rollup.functions_passed,
            suite_rollup.functions_failed,
        );
    }

    let file = tests.file_mut(id);
    file.time = rollup.time;
    file.functions_passed = rollup.functions_passed;
    file.functions_failed = rollup.functions_failed;
    file.passed = rollup.passed();
    file.status = rollup.status(TestStatus::Error);
}

fn update_folder(tests: &mut Tests, id: FolderId) -> Rollup {
    let mut rollup = Rollup::new();
    for file in tests.folder(id).files().to_vec() {
        let file = tests.file(file);
        rollup.add_child(file.passed, file.time, file.functions_passed, file.functions_failed);
    }
    for child in tests.folder(id).folders().to_vec() {
        let child_rollup = update_folder(tests, child);
        rollup.add_child(
            child_rollup.passed(),
            child_rollup.time,
            child_rollup.functions_passed,
            child_rollup.functions_failed,
        );
    }

    let folder = tests.folder_mut(id);
    folder.time = rollup.time;
    folder.functions_passed = rollup.functions_passed;
    folder.functions_failed = rollup.functions_failed;
    folder.passed = rollup.passed();
    folder.status = rollup.status(TestStatus::Fail);
    rollup
}
