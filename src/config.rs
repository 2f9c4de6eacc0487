//! Configuration loading and schema definitions for pyrunner.
//!
//! Settings live in `pyrunner.toml` at the workspace root. They are read
//! through a [`SettingsProvider`] handed to each test manager, so every
//! workspace sees its own settings and tests can inject fixed ones.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Name of the settings file looked up in a workspace.
pub const CONFIG_FILE_NAME: &str = "pyrunner.toml";

/// Loads pyrunner configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use pyrunner::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("pyrunner.toml"))?;
/// println!("pytest enabled: {}", config.unit_test.pytest_enabled);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads pyrunner configuration from a TOML string.
///
/// # Example
///
/// ```
/// use pyrunner::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [unit_test]
///     nosetests_enabled = true
///     nosetest_args = ["--where=tests"]
/// "#)?;
///
/// assert!(config.unit_test.nosetests_enabled);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Source of settings for one workspace.
pub trait SettingsProvider: Send + Sync {
    /// Current settings. Called at the start of every discovery and run,
    /// so edits take effect without restarting.
    fn settings(&self) -> Result<Config>;
}

/// Reads `<workspace>/pyrunner.toml` on every call.
///
/// A missing file yields [`Config::default`]; a malformed one is an error.
#[derive(Debug, Clone)]
pub struct FileSettingsProvider {
    path: PathBuf,
}

impl FileSettingsProvider {
    /// Settings for the workspace rooted at `workspace`.
    pub fn for_workspace(workspace: &Path) -> Self {
        Self {
            path: workspace.join(CONFIG_FILE_NAME),
        }
    }

    /// Settings from an explicit file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsProvider for FileSettingsProvider {
    fn settings(&self) -> Result<Config> {
        if !self.path.exists() {
            tracing::debug!("No {} found, using defaults", self.path.display());
            return Ok(Config::default());
        }
        load_config(&self.path)
    }
}

/// Fixed settings.
#[derive(Debug, Clone, Default)]
pub struct StaticSettingsProvider {
    config: Config,
}

impl StaticSettingsProvider {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl SettingsProvider for StaticSettingsProvider {
    fn settings(&self) -> Result<Config> {
        Ok(self.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TestProvider;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = load_config_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.unit_test.pytest_path, "pytest");
        assert!(!config.unit_test.is_enabled(TestProvider::Pytest));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(load_config_str("[unit_test]\npytest_enabled = \"yes\"").is_err());
    }

    #[test]
    fn test_file_provider() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileSettingsProvider::for_workspace(dir.path());
        assert_eq!(provider.settings().unwrap(), Config::default());

        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[unit_test]\npytest_enabled = true\npytest_args = [\"-k\", \"fast\"]\ncwd = \"src\"\n",
        )
        .unwrap();
        let config = provider.settings().unwrap();
        assert!(config.unit_test.pytest_enabled);
        assert_eq!(config.unit_test.args(TestProvider::Pytest), ["-k", "fast"]);
        assert_eq!(config.unit_test.cwd, Some(PathBuf::from("src")));

        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "not = [valid").unwrap();
        assert!(provider.settings().is_err());
    }

    #[test]
    fn test_starter_roundtrips() {
        let config = Config::starter(TestProvider::Nosetest);
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(load_config_str(&text).unwrap(), config);
    }

    #[test]
    fn test_preferred_provider() {
        let mut config = Config::default();
        assert_eq!(config.unit_test.preferred_provider(), None);
        config.unit_test.unittest_enabled = true;
        assert_eq!(config.unit_test.preferred_provider(), Some(TestProvider::Unittest));
        config.unit_test.pytest_enabled = true;
        assert_eq!(config.unit_test.preferred_provider(), Some(TestProvider::Pytest));
        config.unit_test.nosetests_enabled = true;
        assert_eq!(config.unit_test.preferred_provider(), Some(TestProvider::Nosetest));
    }
}
