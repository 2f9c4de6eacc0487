//! Configuration schema definitions for pyrunner.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── PythonConfig     - Interpreter used to launch runners
//! └── UnitTestConfig   - Which runner is enabled, its arguments and paths
//! ```
//!
//! Every field has a default, so an empty file (or no file at all) is a
//! valid configuration with every runner disabled.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::TestProvider;

/// Root configuration structure for pyrunner.
///
/// # TOML Structure
///
/// ```toml
/// [python]
/// interpreter = "python3"
///
/// [unit_test]
/// pytest_enabled = true
/// pytest_args = ["-q", "tests"]
/// cwd = "src"
/// ```
///
/// # Example
///
/// ```
/// use pyrunner::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [unit_test]
///     unittest_enabled = true
///     unittest_args = ["-s", "tests", "-p", "*_test.py"]
/// "#).unwrap();
///
/// assert!(config.unit_test.unittest_enabled);
/// assert_eq!(config.python.interpreter, "python");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Interpreter settings.
    #[serde(default)]
    pub python: PythonConfig,

    /// Test runner settings.
    #[serde(default)]
    pub unit_test: UnitTestConfig,
}

impl Config {
    /// A configuration enabling exactly one runner, as written by
    /// `pyrunner init`.
    pub fn starter(provider: TestProvider) -> Self {
        let mut config = Config::default();
        match provider {
            TestProvider::Unittest => {
                config.unit_test.unittest_enabled = true;
                config.unit_test.unittest_args = vec!["-v".into(), "-s".into(), ".".into(), "-p".into(), "test*.py".into()];
            }
            TestProvider::Pytest => config.unit_test.pytest_enabled = true,
            TestProvider::Nosetest => config.unit_test.nosetests_enabled = true,
        }
        config
    }
}

/// Interpreter settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PythonConfig {
    /// Interpreter used for `python -m <runner>` and the unittest launcher.
    ///
    /// `~` and environment variables are expanded.
    ///
    /// Default: `"python"`
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
        }
    }
}

fn default_interpreter() -> String {
    "python".to_string()
}

/// Test runner settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `*_enabled` | `false` |
/// | `*_args` | `[]` |
/// | `pytest_path` | `"pytest"` |
/// | `nosetest_path` | `"nosetests"` |
/// | `cwd` | None (workspace root) |
///
/// When more than one runner is enabled, nose wins over pytest, which wins
/// over unittest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UnitTestConfig {
    #[serde(default)]
    pub unittest_enabled: bool,

    #[serde(default)]
    pub pytest_enabled: bool,

    #[serde(default)]
    pub nosetests_enabled: bool,

    /// Arguments understood by the unittest launcher: `-s`/`--start-directory`,
    /// `-p`/`--pattern`, `-v`, `-f`/`--failfast`.
    #[serde(default)]
    pub unittest_args: Vec<String>,

    /// Extra pytest arguments, passed through (minus run-only flags during
    /// discovery).
    #[serde(default)]
    pub pytest_args: Vec<String>,

    /// Extra nosetests arguments.
    #[serde(default)]
    pub nosetest_args: Vec<String>,

    /// pytest executable. A bare name runs `python -m pytest` instead.
    ///
    /// Default: `"pytest"`
    #[serde(default = "default_pytest_path")]
    pub pytest_path: String,

    /// nosetests executable. A bare name runs `python -m nose` instead.
    ///
    /// Default: `"nosetests"`
    #[serde(default = "default_nosetest_path")]
    pub nosetest_path: String,

    /// Directory runners are launched from, relative to the workspace.
    pub cwd: Option<PathBuf>,
}

impl Default for UnitTestConfig {
    fn default() -> Self {
        Self {
            unittest_enabled: false,
            pytest_enabled: false,
            nosetests_enabled: false,
            unittest_args: Vec::new(),
            pytest_args: Vec::new(),
            nosetest_args: Vec::new(),
            pytest_path: default_pytest_path(),
            nosetest_path: default_nosetest_path(),
            cwd: None,
        }
    }
}

impl UnitTestConfig {
    /// Whether `provider` is switched on.
    pub fn is_enabled(&self, provider: TestProvider) -> bool {
        match provider {
            TestProvider::Unittest => self.unittest_enabled,
            TestProvider::Pytest => self.pytest_enabled,
            TestProvider::Nosetest => self.nosetests_enabled,
        }
    }

    /// The runner to use: nose, then pytest, then unittest, whichever is
    /// enabled first.
    pub fn preferred_provider(&self) -> Option<TestProvider> {
        [TestProvider::Nosetest, TestProvider::Pytest, TestProvider::Unittest]
            .into_iter()
            .find(|provider| self.is_enabled(*provider))
    }

    /// The user arguments for `provider`.
    pub fn args(&self, provider: TestProvider) -> &[String] {
        match provider {
            TestProvider::Unittest => &self.unittest_args,
            TestProvider::Pytest => &self.pytest_args,
            TestProvider::Nosetest => &self.nosetest_args,
        }
    }

    /// The configured executable for `provider`; unittest has none.
    pub fn executable(&self, provider: TestProvider) -> Option<&str> {
        match provider {
            TestProvider::Unittest => None,
            TestProvider::Pytest => Some(&self.pytest_path),
            TestProvider::Nosetest => Some(&self.nosetest_path),
        }
    }
}

fn default_pytest_path() -> String {
    "pytest".to_string()
}

fn default_nosetest_path() -> String {
    "nosetests".to_string()
}
