//! Test entity model.
//!
//! Discovered tests form a tree of folders, files, suites and functions.
//! The tree is stored as an arena inside [`Tests`]: every node lives in a
//! flat vector and refers to its children by typed index ([`FileId`],
//! [`SuiteId`], [`FunctionId`], [`FolderId`]).
//!
//! ```text
//! TestFolder ──► TestFolder* ──► TestFile*
//!                                   │
//!                                   ├──► TestSuite* ──► TestSuite* (nested classes)
//!                                   │        └──────► TestFunction*
//!                                   └──► TestFunction*
//! ```
//!
//! Alongside the tree, [`Tests`] keeps flattened lists of every function
//! and suite paired with their parent file (and suite). Both views are
//! produced together by [`TestsBuilder::build`]; after that only the
//! result fields (`status`, `message`, `traceback`, `time` and the rollup
//! counters) change.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// A discovered test tree shared between the manager and a running
/// result transport.
pub type SharedTests = Arc<Mutex<Tests>>;

/// The external test runner backing a test manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestProvider {
    /// Python's built-in `unittest`, driven through the bundled launcher.
    Unittest,
    /// `pytest`.
    Pytest,
    /// `nosetests`.
    Nosetest,
}

impl TestProvider {
    /// Name of the Python module implementing the runner.
    pub fn module_name(&self) -> &'static str {
        match self {
            TestProvider::Unittest => "unittest",
            TestProvider::Pytest => "pytest",
            TestProvider::Nosetest => "nose",
        }
    }
}

impl fmt::Display for TestProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestProvider::Unittest => "unittest",
            TestProvider::Pytest => "pytest",
            TestProvider::Nosetest => "nosetest",
        };
        f.write_str(name)
    }
}

/// Status of a test entity, and of a test manager.
///
/// | Status | Entity meaning | Manager meaning |
/// |--------|----------------|-----------------|
/// | Unknown | Not run yet | Nothing discovered |
/// | Discovering | - | Discovery in flight |
/// | Idle | All children passed | Resting state |
/// | Running | - | Run in flight |
/// | Pass / Fail / Error / Skipped | Last result | - |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    #[default]
    Unknown,
    Discovering,
    Idle,
    Running,
    Pass,
    Fail,
    Error,
    Skipped,
}

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Position of the node in its arena.
            pub fn index(self) -> usize {
                self.0
            }
        }
    };
}

arena_id!(
    /// Index of a [`TestFile`] inside [`Tests`].
    FileId
);
arena_id!(
    /// Index of a [`TestSuite`] inside [`Tests`].
    SuiteId
);
arena_id!(
    /// Index of a [`TestFunction`] inside [`Tests`].
    FunctionId
);
arena_id!(
    /// Index of a [`TestFolder`] inside [`Tests`].
    FolderId
);

/// A single test function or method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFunction {
    /// Display name, e.g. `test_add`.
    pub name: String,
    /// Runner specific identifier used to re-run just this function.
    pub name_to_run: String,
    pub status: TestStatus,
    /// Duration of the last run in seconds.
    pub time: f64,
    pub line: Option<u32>,
    pub message: Option<String>,
    pub traceback: Option<String>,
}

impl TestFunction {
    /// Creates a function that has not run yet.
    pub fn new(name: impl Into<String>, name_to_run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            name_to_run: name_to_run.into(),
            status: TestStatus::Unknown,
            time: 0.0,
            line: None,
            message: None,
            traceback: None,
        }
    }
}

/// A test class. Suites nest to mirror nested classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSuite {
    pub name: String,
    pub name_to_run: String,
    /// Dotted name used to match xUnit `classname` attributes.
    pub xml_name: String,
    /// The class derives from `unittest.TestCase`.
    pub is_unit_test: bool,
    /// pytest wrapped the methods in an implicit instance node.
    pub is_instance: bool,
    pub status: TestStatus,
    pub time: f64,
    pub passed: Option<bool>,
    pub functions_passed: usize,
    pub functions_failed: usize,
    functions: Vec<FunctionId>,
    suites: Vec<SuiteId>,
}

impl TestSuite {
    pub fn new(
        name: impl Into<String>,
        name_to_run: impl Into<String>,
        xml_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            name_to_run: name_to_run.into(),
            xml_name: xml_name.into(),
            is_unit_test: false,
            is_instance: false,
            status: TestStatus::Unknown,
            time: 0.0,
            passed: None,
            functions_passed: 0,
            functions_failed: 0,
            functions: Vec::new(),
            suites: Vec::new(),
        }
    }

    /// Marks the suite as a `unittest.TestCase` subclass.
    pub fn unit_test(mut self, is_unit_test: bool) -> Self {
        self.is_unit_test = is_unit_test;
        self
    }

    pub fn functions(&self) -> &[FunctionId] {
        &self.functions
    }

    pub fn suites(&self) -> &[SuiteId] {
        &self.suites
    }
}

/// A test module.
///
/// A file that the runner failed to collect carries the collection output
/// in `errors_when_discovering` instead of children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFile {
    /// Path relative to the discovery root, e.g. `tests/test_foo.py`.
    pub name: String,
    pub full_path: PathBuf,
    pub name_to_run: String,
    pub xml_name: String,
    pub status: TestStatus,
    pub time: f64,
    pub message: Option<String>,
    pub traceback: Option<String>,
    pub errors_when_discovering: Option<String>,
    pub passed: Option<bool>,
    pub functions_passed: usize,
    pub functions_failed: usize,
    functions: Vec<FunctionId>,
    suites: Vec<SuiteId>,
}

impl TestFile {
    /// Creates a file node; `xml_name` is derived from `name`.
    pub fn new(
        name: impl Into<String>,
        full_path: impl Into<PathBuf>,
        name_to_run: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            xml_name: convert_file_to_package(&name),
            name,
            full_path: full_path.into(),
            name_to_run: name_to_run.into(),
            status: TestStatus::Unknown,
            time: 0.0,
            message: None,
            traceback: None,
            errors_when_discovering: None,
            passed: None,
            functions_passed: 0,
            functions_failed: 0,
            functions: Vec::new(),
            suites: Vec::new(),
        }
    }

    /// Records collection output for a file the runner could not import.
    pub fn with_discovery_errors(mut self, errors: impl Into<String>) -> Self {
        self.errors_when_discovering = Some(errors.into());
        self
    }

    pub fn functions(&self) -> &[FunctionId] {
        &self.functions
    }

    pub fn suites(&self) -> &[SuiteId] {
        &self.suites
    }

    /// Returns `true` if the runner reported a collection error.
    pub fn has_discovery_errors(&self) -> bool {
        self.errors_when_discovering
            .as_deref()
            .is_some_and(|errors| !errors.is_empty())
    }
}

/// A directory containing test files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFolder {
    pub name: String,
    pub name_to_run: String,
    pub status: TestStatus,
    pub time: f64,
    pub passed: Option<bool>,
    pub functions_passed: usize,
    pub functions_failed: usize,
    files: Vec<FileId>,
    folders: Vec<FolderId>,
}

impl TestFolder {
    fn new(name: String) -> Self {
        Self {
            name_to_run: name.clone(),
            name,
            status: TestStatus::Unknown,
            time: 0.0,
            passed: None,
            functions_passed: 0,
            functions_failed: 0,
            files: Vec::new(),
            folders: Vec::new(),
        }
    }

    pub fn files(&self) -> &[FileId] {
        &self.files
    }

    pub fn folders(&self) -> &[FolderId] {
        &self.folders
    }
}

/// A function paired with the file (and suite) that contains it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlattenedTestFunction {
    pub function: FunctionId,
    pub parent_file: FileId,
    pub parent_suite: Option<SuiteId>,
    /// Dotted class name as it appears in xUnit reports.
    pub xml_class_name: String,
}

/// A suite paired with the file (and enclosing suite) that contains it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlattenedTestSuite {
    pub suite: SuiteId,
    pub parent_file: FileId,
    pub parent_suite: Option<SuiteId>,
    pub xml_class_name: String,
}

/// Aggregated counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub passed: usize,
    pub failures: usize,
    pub errors: usize,
    pub skipped: usize,
}

impl TestSummary {
    /// Number of results recorded so far.
    pub fn total(&self) -> usize {
        self.passed + self.failures + self.errors + self.skipped
    }

    /// Returns `true` if any failure or error was recorded.
    pub fn has_failures(&self) -> bool {
        self.failures > 0 || self.errors > 0
    }
}

/// Selects a subset of tests to run.
///
/// Each list holds `name_to_run` identifiers. An empty selector means
/// "run everything".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestsToRun {
    #[serde(default)]
    pub folders: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub suites: Vec<String>,
    #[serde(default)]
    pub functions: Vec<String>,
}

impl TestsToRun {
    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
            && self.files.is_empty()
            && self.suites.is_empty()
            && self.functions.is_empty()
    }

    /// All identifiers, folders first, then files, suites and functions.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.folders
            .iter()
            .chain(&self.files)
            .chain(&self.suites)
            .chain(&self.functions)
            .map(String::as_str)
    }
}

/// What a run request targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RunSelector {
    /// Every discovered test.
    #[default]
    All,
    /// Only the tests that failed in the previous run.
    Failed,
    /// A specific subset.
    Subset(TestsToRun),
}

impl RunSelector {
    /// Returns `true` for a failed-only re-run.
    pub fn run_failed(&self) -> bool {
        matches!(self, RunSelector::Failed)
    }

    /// The requested subset, if any.
    pub fn subset(&self) -> Option<&TestsToRun> {
        match self {
            RunSelector::Subset(subset) => Some(subset),
            _ => None,
        }
    }
}

impl From<bool> for RunSelector {
    fn from(run_failed: bool) -> Self {
        if run_failed {
            RunSelector::Failed
        } else {
            RunSelector::All
        }
    }
}

impl From<TestsToRun> for RunSelector {
    fn from(subset: TestsToRun) -> Self {
        if subset.is_empty() {
            RunSelector::All
        } else {
            RunSelector::Subset(subset)
        }
    }
}

/// The aggregate root of a discovery.
///
/// Created by [`TestsBuilder::build`] and replaced wholesale by the next
/// discovery. See the module documentation for the layout.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Tests {
    pub summary: TestSummary,
    files: Vec<TestFile>,
    suites: Vec<TestSuite>,
    functions: Vec<TestFunction>,
    folders: Vec<TestFolder>,
    root_folders: Vec<FolderId>,
    test_functions: Vec<FlattenedTestFunction>,
    test_suites: Vec<FlattenedTestSuite>,
    #[serde(skip)]
    function_slots: Vec<usize>,
    #[serde(skip)]
    suite_slots: Vec<usize>,
    #[serde(skip)]
    function_index: HashMap<String, FunctionId>,
}

impl Tests {
    /// Returns `true` if no test function was discovered.
    pub fn is_empty(&self) -> bool {
        self.test_functions.is_empty()
    }

    /// Iterates over all files, including stub files for collection errors.
    pub fn test_files(&self) -> impl Iterator<Item = (FileId, &TestFile)> {
        self.files.iter().enumerate().map(|(i, f)| (FileId(i), f))
    }

    /// Every function with its parents.
    pub fn test_functions(&self) -> &[FlattenedTestFunction] {
        &self.test_functions
    }

    /// Every suite with its parents.
    pub fn test_suites(&self) -> &[FlattenedTestSuite] {
        &self.test_suites
    }

    pub fn test_folders(&self) -> impl Iterator<Item = (FolderId, &TestFolder)> {
        self.folders.iter().enumerate().map(|(i, f)| (FolderId(i), f))
    }

    pub fn root_test_folders(&self) -> &[FolderId] {
        &self.root_folders
    }

    pub fn file(&self, id: FileId) -> &TestFile {
        &self.files[id.0]
    }

    pub fn file_mut(&mut self, id: FileId) -> &mut TestFile {
        &mut self.files[id.0]
    }

    pub fn suite(&self, id: SuiteId) -> &TestSuite {
        &self.suites[id.0]
    }

    pub fn suite_mut(&mut self, id: SuiteId) -> &mut TestSuite {
        &mut self.suites[id.0]
    }

    pub fn function(&self, id: FunctionId) -> &TestFunction {
        &self.functions[id.0]
    }

    pub fn function_mut(&mut self, id: FunctionId) -> &mut TestFunction {
        &mut self.functions[id.0]
    }

    pub fn folder(&self, id: FolderId) -> &TestFolder {
        &self.folders[id.0]
    }

    pub fn folder_mut(&mut self, id: FolderId) -> &mut TestFolder {
        &mut self.folders[id.0]
    }

    pub(crate) fn functions_mut(&mut self) -> impl Iterator<Item = &mut TestFunction> {
        self.functions.iter_mut()
    }

    pub(crate) fn suites_mut(&mut self) -> impl Iterator<Item = &mut TestSuite> {
        self.suites.iter_mut()
    }

    pub(crate) fn files_mut(&mut self) -> impl Iterator<Item = &mut TestFile> {
        self.files.iter_mut()
    }

    pub(crate) fn folders_mut(&mut self) -> impl Iterator<Item = &mut TestFolder> {
        self.folders.iter_mut()
    }

    /// Looks up a function by its exact `name_to_run`.
    ///
    /// When two functions share an identifier the first one discovered wins.
    pub fn find_function(&self, name_to_run: &str) -> Option<FunctionId> {
        self.function_index.get(name_to_run).copied()
    }

    pub fn find_file(&self, name_to_run: &str) -> Option<FileId> {
        self.files
            .iter()
            .position(|f| f.name_to_run == name_to_run)
            .map(FileId)
    }

    pub fn find_suite(&self, name_to_run: &str) -> Option<SuiteId> {
        self.suites
            .iter()
            .position(|s| s.name_to_run == name_to_run)
            .map(SuiteId)
    }

    pub fn find_folder(&self, name_to_run: &str) -> Option<FolderId> {
        self.folders
            .iter()
            .position(|f| f.name_to_run == name_to_run)
            .map(FolderId)
    }

    /// The flattened entry of a function, giving O(1) access to its parents.
    pub fn flattened_function(&self, id: FunctionId) -> &FlattenedTestFunction {
        &self.test_functions[self.function_slots[id.0]]
    }

    /// The flattened entry of a suite.
    pub fn flattened_suite(&self, id: SuiteId) -> &FlattenedTestSuite {
        &self.test_suites[self.suite_slots[id.0]]
    }

    /// All files below a folder, recursively.
    pub fn files_in_folder(&self, id: FolderId) -> Vec<FileId> {
        let mut files = Vec::new();
        let mut pending = vec![id];
        while let Some(folder) = pending.pop() {
            let folder = self.folder(folder);
            files.extend_from_slice(folder.files());
            pending.extend(folder.folders().iter().rev());
        }
        files
    }

    /// Files the runner failed to collect.
    pub fn files_with_discovery_errors(&self) -> impl Iterator<Item = &TestFile> {
        self.files.iter().filter(|f| f.has_discovery_errors())
    }

    /// Resolves a user supplied name into a selector.
    ///
    /// Tries folders, then files (by name, identifier or absolute path),
    /// then functions (by identifier or display name). Anything else is
    /// passed through as a file for the runner to interpret.
    pub fn resolve_name(&self, name: &str, root: &Path) -> TestsToRun {
        let absolute = if Path::new(name).is_absolute() {
            PathBuf::from(name)
        } else {
            root.join(name)
        };

        let folders: Vec<String> = self
            .folders
            .iter()
            .filter(|f| f.name_to_run == name || f.name == name || root.join(&f.name) == absolute)
            .map(|f| f.name_to_run.clone())
            .collect();
        if !folders.is_empty() {
            return TestsToRun {
                folders,
                ..Default::default()
            };
        }

        let files: Vec<String> = self
            .files
            .iter()
            .filter(|f| f.name_to_run == name || f.name == name || f.full_path == absolute)
            .map(|f| f.name_to_run.clone())
            .collect();
        if !files.is_empty() {
            return TestsToRun {
                files,
                ..Default::default()
            };
        }

        let functions: Vec<String> = self
            .functions
            .iter()
            .filter(|f| f.name_to_run == name || f.name == name)
            .map(|f| f.name_to_run.clone())
            .collect();
        if !functions.is_empty() {
            return TestsToRun {
                functions,
                ..Default::default()
            };
        }

        TestsToRun {
            files: vec![name.to_string()],
            ..Default::default()
        }
    }
}

/// Where a new suite or function is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parent {
    File(FileId),
    Suite(SuiteId),
}

/// Incrementally assembles the tree; [`build`](Self::build) derives the
/// flattened lists and folders.
///
/// # Example
///
/// ```
/// use pyrunner::model::{Parent, TestFile, TestFunction, TestSuite, TestsBuilder};
///
/// let mut builder = TestsBuilder::new();
/// let file = builder.add_file(TestFile::new("tests/test_a.py", "/p/tests/test_a.py", "tests/test_a.py"));
/// let suite = builder.add_suite(Parent::File(file), TestSuite::new("TestA", "tests/test_a.py::TestA", "tests.test_a.TestA"));
/// builder.add_function(Parent::Suite(suite), TestFunction::new("test_one", "tests/test_a.py::TestA::test_one"));
///
/// let tests = builder.build();
/// assert_eq!(tests.test_functions().len(), 1);
/// assert_eq!(tests.root_test_folders().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct TestsBuilder {
    files: Vec<TestFile>,
    suites: Vec<TestSuite>,
    functions: Vec<TestFunction>,
}

impl TestsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, file: TestFile) -> FileId {
        self.files.push(file);
        FileId(self.files.len() - 1)
    }

    pub fn add_suite(&mut self, parent: Parent, suite: TestSuite) -> SuiteId {
        let id = SuiteId(self.suites.len());
        self.suites.push(suite);
        match parent {
            Parent::File(file) => self.files[file.0].suites.push(id),
            Parent::Suite(suite) => self.suites[suite.0].suites.push(id),
        }
        id
    }

    pub fn add_function(&mut self, parent: Parent, function: TestFunction) -> FunctionId {
        let id = FunctionId(self.functions.len());
        self.functions.push(function);
        match parent {
            Parent::File(file) => self.files[file.0].functions.push(id),
            Parent::Suite(suite) => self.suites[suite.0].functions.push(id),
        }
        id
    }

    pub fn file(&self, id: FileId) -> &TestFile {
        &self.files[id.0]
    }

    pub fn suite(&self, id: SuiteId) -> &TestSuite {
        &self.suites[id.0]
    }

    pub fn suite_mut(&mut self, id: SuiteId) -> &mut TestSuite {
        &mut self.suites[id.0]
    }

    /// `name_to_run` of a parent node.
    pub fn name_to_run(&self, parent: Parent) -> &str {
        match parent {
            Parent::File(file) => &self.files[file.0].name_to_run,
            Parent::Suite(suite) => &self.suites[suite.0].name_to_run,
        }
    }

    /// `xml_name` of a parent node.
    pub fn xml_name(&self, parent: Parent) -> &str {
        match parent {
            Parent::File(file) => &self.files[file.0].xml_name,
            Parent::Suite(suite) => &self.suites[suite.0].xml_name,
        }
    }

    pub fn find_file_by_path(&self, full_path: &Path) -> Option<FileId> {
        self.files
            .iter()
            .position(|f| f.full_path == full_path)
            .map(FileId)
    }

    /// Finds a suite directly inside `file` by display name.
    pub fn find_suite_in_file(&self, file: FileId, name: &str) -> Option<SuiteId> {
        self.files[file.0]
            .suites
            .iter()
            .copied()
            .find(|s| self.suites[s.0].name == name)
    }

    /// Drops files that ended up with neither suites nor functions nor
    /// collection errors.
    ///
    /// Call only once parsing is finished: file ids handed out earlier are
    /// no longer valid afterwards.
    pub fn remove_empty_files(&mut self) {
        self.files.retain(|f| {
            !f.functions.is_empty() || !f.suites.is_empty() || f.has_discovery_errors()
        });
    }

    /// Freezes the tree and derives the flattened and folder views.
    pub fn build(self) -> Tests {
        let mut tests = Tests {
            summary: TestSummary::default(),
            function_slots: vec![usize::MAX; self.functions.len()],
            suite_slots: vec![usize::MAX; self.suites.len()],
            files: self.files,
            suites: self.suites,
            functions: self.functions,
            ..Default::default()
        };

        for file_index in 0..tests.files.len() {
            let file_id = FileId(file_index);
            let package = convert_file_to_package(&tests.files[file_index].name);
            for function in tests.files[file_index].functions.clone() {
                push_function(&mut tests, function, file_id, None, package.clone());
            }
            for suite in tests.files[file_index].suites.clone() {
                flatten_suite(&mut tests, suite, file_id, None);
            }
        }

        for flattened in &tests.test_functions {
            let name = &tests.functions[flattened.function.0].name_to_run;
            tests
                .function_index
                .entry(name.clone())
                .or_insert(flattened.function);
        }

        place_files_into_folders(&mut tests);
        tests
    }
}

fn push_function(
    tests: &mut Tests,
    function: FunctionId,
    parent_file: FileId,
    parent_suite: Option<SuiteId>,
    xml_class_name: String,
) {
    tests.function_slots[function.0] = tests.test_functions.len();
    tests.test_functions.push(FlattenedTestFunction {
        function,
        parent_file,
        parent_suite,
        xml_class_name,
    });
}

fn flatten_suite(tests: &mut Tests, suite: SuiteId, parent_file: FileId, parent_suite: Option<SuiteId>) {
    let xml_name = tests.suites[suite.0].xml_name.clone();
    for function in tests.suites[suite.0].functions.clone() {
        push_function(tests, function, parent_file, Some(suite), xml_name.clone());
    }
    for child in tests.suites[suite.0].suites.clone() {
        flatten_suite(tests, child, parent_file, Some(suite));
    }
    tests.suite_slots[suite.0] = tests.test_suites.len();
    tests.test_suites.push(FlattenedTestSuite {
        suite,
        parent_file,
        parent_suite,
        xml_class_name: xml_name,
    });
}

/// Directory part of a file name, `.` for files at the root.
fn folder_of(file_name: &str) -> String {
    let normalized = file_name.replace('\\', "/");
    match normalized.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir.to_string(),
        _ => ".".to_string(),
    }
}

fn place_files_into_folders(tests: &mut Tests) {
    let mut dirs: Vec<String> = tests.files.iter().map(|f| folder_of(&f.name)).collect();
    dirs.sort();
    dirs.dedup();

    let mut by_path: HashMap<String, FolderId> = HashMap::new();
    for dir in dirs {
        let mut path = String::new();
        let mut parent: Option<FolderId> = None;
        for component in dir.split('/') {
            let next = if path.is_empty() {
                component.to_string()
            } else {
                format!("{path}/{component}")
            };
            let id = match by_path.get(&next) {
                Some(id) => *id,
                None => {
                    let id = FolderId(tests.folders.len());
                    tests.folders.push(TestFolder::new(next.clone()));
                    match parent {
                        Some(parent) => tests.folders[parent.0].folders.push(id),
                        None => tests.root_folders.push(id),
                    }
                    by_path.insert(next.clone(), id);
                    id
                }
            };
            parent = Some(id);
            path = next;
        }
    }

    for (index, file) in tests.files.iter().enumerate() {
        if let Some(folder) = by_path.get(&folder_of(&file.name)) {
            tests.folders[folder.0].files.push(FileId(index));
        }
    }
}

/// Converts a file path into a dotted package name.
///
/// ```
/// use pyrunner::model::convert_file_to_package;
///
/// assert_eq!(convert_file_to_package("tests/unit/test_math.py"), "tests.unit.test_math");
/// ```
pub fn convert_file_to_package(file_path: &str) -> String {
    let stem = match file_path.rfind('.') {
        Some(index) => &file_path[..index],
        None => file_path,
    };
    stem.replace(['/', '\\'], ".")
}
