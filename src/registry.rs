//! Lookup of test managers by workspace.
//!
//! ```text
//! WorkspaceTestManagerService
//! ├── /ws/a ──► TestManagerService ──► { pytest: TestManager }
//! └── /ws/b ──► TestManagerService ──► { unittest: TestManager, nose: TestManager }
//! ```
//!
//! Both levels are created on first use and memoized. The runner of a
//! workspace is re-read from its settings on every lookup, so switching
//! runners in `pyrunner.toml` takes effect on the next call. The manager of
//! the previous runner stays cached until [`TestManagerService::dispose`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::adapter::create_adapter;
use crate::config::{FileSettingsProvider, SettingsProvider};
use crate::manager::{ManagerError, ManagerResult, TestManager};
use crate::model::TestProvider;
use crate::process::ProcessRunner;
use crate::report::Reporter;

/// The test managers of one workspace, one per runner.
pub struct TestManagerService {
    workspace: PathBuf,
    settings: Arc<dyn SettingsProvider>,
    process: Arc<dyn ProcessRunner>,
    reporter: Arc<dyn Reporter>,
    managers: Mutex<HashMap<TestProvider, TestManager>>,
}

impl TestManagerService {
    pub fn new(
        workspace: impl Into<PathBuf>,
        settings: Arc<dyn SettingsProvider>,
        process: Arc<dyn ProcessRunner>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            settings,
            process,
            reporter,
            managers: Mutex::new(HashMap::new()),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// The enabled runner with the highest precedence, if any.
    pub fn preferred_provider(&self) -> ManagerResult<Option<TestProvider>> {
        let settings = self
            .settings
            .settings()
            .map_err(|e| ManagerError::Settings(format!("{e:#}")))?;
        Ok(settings.unit_test.preferred_provider())
    }

    /// The manager of the preferred runner, or `None` when no runner is
    /// enabled. Repeated calls return the same manager.
    pub fn test_manager(&self) -> ManagerResult<Option<TestManager>> {
        let Some(provider) = self.preferred_provider()? else {
            return Ok(None);
        };

        let mut managers = self.managers.lock().unwrap_or_else(|p| p.into_inner());
        let manager = managers.entry(provider).or_insert_with(|| {
            debug!("Creating {} test manager for {}", provider, self.workspace.display());
            TestManager::new(
                provider,
                self.workspace.clone(),
                create_adapter(provider),
                self.settings.clone(),
                self.process.clone(),
                self.reporter.clone(),
            )
        });
        Ok(Some(manager.clone()))
    }

    /// The working directory of the preferred runner's manager, or the
    /// workspace root.
    pub fn working_directory(&self) -> PathBuf {
        match self.test_manager() {
            Ok(Some(manager)) => manager.working_directory(),
            _ => self.workspace.clone(),
        }
    }

    /// Disposes every manager created so far.
    pub fn dispose(&self) {
        let managers: Vec<_> = self
            .managers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .map(|(_, manager)| manager)
            .collect();
        for manager in managers {
            manager.dispose();
        }
    }
}

type SettingsFactory = Box<dyn Fn(&Path) -> Arc<dyn SettingsProvider> + Send + Sync>;

/// One [`TestManagerService`] per workspace.
pub struct WorkspaceTestManagerService {
    process: Arc<dyn ProcessRunner>,
    reporter: Arc<dyn Reporter>,
    settings_factory: SettingsFactory,
    services: Mutex<HashMap<PathBuf, Arc<TestManagerService>>>,
}

impl WorkspaceTestManagerService {
    /// Services reading each workspace's `pyrunner.toml`.
    pub fn new(process: Arc<dyn ProcessRunner>, reporter: Arc<dyn Reporter>) -> Self {
        Self::with_settings(process, reporter, |workspace| {
            Arc::new(FileSettingsProvider::for_workspace(workspace))
        })
    }

    /// Services whose settings come from `factory`.
    pub fn with_settings<F>(process: Arc<dyn ProcessRunner>, reporter: Arc<dyn Reporter>, factory: F) -> Self
    where
        F: Fn(&Path) -> Arc<dyn SettingsProvider> + Send + Sync + 'static,
    {
        Self {
            process,
            reporter,
            settings_factory: Box::new(factory),
            services: Mutex::new(HashMap::new()),
        }
    }

    /// The service of `workspace`, created on first use.
    pub fn service(&self, workspace: &Path) -> Arc<TestManagerService> {
        let mut services = self.services.lock().unwrap_or_else(|p| p.into_inner());
        services
            .entry(workspace.to_path_buf())
            .or_insert_with(|| {
                Arc::new(TestManagerService::new(
                    workspace,
                    (self.settings_factory)(workspace),
                    self.process.clone(),
                    self.reporter.clone(),
                ))
            })
            .clone()
    }

    /// Shorthand for `service(workspace).test_manager()`.
    pub fn test_manager(&self, workspace: &Path) -> ManagerResult<Option<TestManager>> {
        self.service(workspace).test_manager()
    }

    pub fn working_directory(&self, workspace: &Path) -> PathBuf {
        self.service(workspace).working_directory()
    }

    /// Disposes every service and, through them, every manager.
    pub fn dispose(&self) {
        let services: Vec<_> = self
            .services
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .map(|(_, service)| service)
            .collect();
        for service in services {
            service.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::ScriptedRunner;
    use crate::config::{Config, StaticSettingsProvider};
    use crate::report::NullReporter;

    fn service(config: Config) -> TestManagerService {
        TestManagerService::new(
            "/ws",
            Arc::new(StaticSettingsProvider::new(config)),
            Arc::new(ScriptedRunner::default()),
            Arc::new(NullReporter),
        )
    }

    #[test]
    fn test_no_runner_enabled() {
        let service = service(Config::default());
        assert_eq!(service.preferred_provider().unwrap(), None);
        assert!(service.test_manager().unwrap().is_none());
        assert_eq!(service.working_directory(), PathBuf::from("/ws"));
    }

    #[test]
    fn test_manager_is_memoized() {
        let mut config = Config::default();
        config.unit_test.pytest_enabled = true;
        config.unit_test.unittest_enabled = true;
        config.unit_test.cwd = Some(PathBuf::from("tests"));
        let service = service(config);

        let first = service.test_manager().unwrap().unwrap();
        let second = service.test_manager().unwrap().unwrap();
        assert_eq!(first.provider(), TestProvider::Pytest);
        assert_eq!(second.provider(), TestProvider::Pytest);
        assert_eq!(service.managers.lock().unwrap().len(), 1);
        assert_eq!(service.working_directory(), PathBuf::from("/ws/tests"));

        service.dispose();
        assert!(service.managers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_workspace_services_are_memoized() {
        let registry = WorkspaceTestManagerService::with_settings(
            Arc::new(ScriptedRunner::default()),
            Arc::new(NullReporter),
            |_| Arc::new(StaticSettingsProvider::new(Config::starter(TestProvider::Nosetest))),
        );

        let a = registry.service(Path::new("/ws/a"));
        let again = registry.service(Path::new("/ws/a"));
        let b = registry.service(Path::new("/ws/b"));
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));

        let manager = registry.test_manager(Path::new("/ws/b")).unwrap().unwrap();
        assert_eq!(manager.provider(), TestProvider::Nosetest);
        assert_eq!(manager.root(), Path::new("/ws/b"));

        registry.dispose();
        assert!(registry.services.lock().unwrap().is_empty());
        assert!(b.managers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_settings_error() {
        struct Broken;
        impl SettingsProvider for Broken {
            fn settings(&self) -> anyhow::Result<Config> {
                anyhow::bail!("bad toml")
            }
        }
        let service = TestManagerService::new(
            "/ws",
            Arc::new(Broken),
            Arc::new(ScriptedRunner::default()),
            Arc::new(NullReporter),
        );
        assert!(matches!(service.test_manager(), Err(ManagerError::Settings(_))));
    }
}
