//! pyrunner CLI - discover and run Python tests.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pyrunner::config::{self, CONFIG_FILE_NAME, Config};
use pyrunner::process::LocalProcessRunner;
use pyrunner::registry::WorkspaceTestManagerService;
use pyrunner::report::ConsoleReporter;
use pyrunner::{ManagerError, RunSelector, TestManager, TestProvider, TestsToRun};

#[derive(Parser)]
#[command(name = "pyrunner")]
#[command(about = "Discover and run Python tests with unittest, pytest or nose", long_about = None)]
#[command(version)]
struct Cli {
    /// Workspace root containing pyrunner.toml
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover tests without running them
    Discover {
        /// Re-run discovery even if results are cached
        #[arg(long)]
        ignore_cache: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Run tests
    Run {
        /// Only re-run tests that failed last time
        #[arg(long)]
        failed: bool,

        /// Folders, files or tests to run (default: everything)
        names: Vec<String>,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Test runner to enable
        #[arg(short, long, value_enum, default_value_t = Runner::Pytest)]
        runner: Runner,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum Runner {
    Pytest,
    Unittest,
    Nose,
}

impl From<Runner> for TestProvider {
    fn from(runner: Runner) -> Self {
        match runner {
            Runner::Pytest => TestProvider::Pytest,
            Runner::Unittest => TestProvider::Unittest,
            Runner::Nose => TestProvider::Nosetest,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let workspace = std::fs::canonicalize(&cli.workspace)
        .with_context(|| format!("Workspace {} does not exist", cli.workspace.display()))?;

    match cli.command {
        Commands::Discover { ignore_cache, format } => discover(&workspace, ignore_cache, format, cli.verbose).await,
        Commands::Run { failed, names } => run(&workspace, failed, &names, cli.verbose).await,
        Commands::Validate => validate_config(&workspace),
        Commands::Init { runner } => init_config(&workspace, runner.into()),
    }
}

fn test_manager(workspace: &Path, verbose: bool) -> Result<TestManager> {
    let registry = WorkspaceTestManagerService::new(
        Arc::new(LocalProcessRunner::new().with_env("PYTHONIOENCODING", "utf-8")),
        Arc::new(ConsoleReporter::new(verbose)),
    );
    match registry.test_manager(workspace)? {
        Some(manager) => Ok(manager),
        None => bail!(
            "No test runner is enabled in {}. Run `pyrunner init` to create one.",
            workspace.join(CONFIG_FILE_NAME).display()
        ),
    }
}

/// Awaits `operation`, stopping the manager on Ctrl-C.
async fn until_interrupted<T>(manager: &TestManager, operation: impl Future<Output = T>) -> T {
    tokio::pin!(operation);
    tokio::select! {
        result = &mut operation => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping {}", manager.provider());
            manager.stop();
            operation.await
        }
    }
}

async fn discover(workspace: &Path, ignore_cache: bool, format: Format, verbose: bool) -> Result<()> {
    let manager = test_manager(workspace, verbose)?;
    let quiet = matches!(format, Format::Json);
    let tests = until_interrupted(&manager, manager.discover_tests(ignore_cache, quiet)).await?;
    let tests = tests.lock().unwrap_or_else(|p| p.into_inner());

    match format {
        Format::Json => {
            let json = serde_json::to_string_pretty(&*tests)?;
            println!("{}", json);
        }
        Format::Text => {
            for flattened in tests.test_functions() {
                println!("  {}", tests.function(flattened.function).name_to_run);
            }
            for file in tests.files_with_discovery_errors() {
                println!("  {} (collection error)", file.name_to_run);
            }
        }
    }

    Ok(())
}

async fn run(workspace: &Path, failed: bool, names: &[String], verbose: bool) -> Result<()> {
    let manager = test_manager(workspace, verbose)?;

    let selector = if failed {
        RunSelector::Failed
    } else if names.is_empty() {
        RunSelector::All
    } else {
        let tests = until_interrupted(&manager, manager.discover_tests(false, true)).await?;
        let tests = tests.lock().unwrap_or_else(|p| p.into_inner());
        let root = manager.working_directory();
        let mut subset = TestsToRun::default();
        for name in names {
            let resolved = tests.resolve_name(name, &root);
            subset.folders.extend(resolved.folders);
            subset.files.extend(resolved.files);
            subset.suites.extend(resolved.suites);
            subset.functions.extend(resolved.functions);
        }
        RunSelector::from(subset)
    };

    match until_interrupted(&manager, manager.run_test(selector)).await {
        Ok(tests) => {
            let failures = tests.lock().unwrap_or_else(|p| p.into_inner()).summary.has_failures();
            if failures {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(ManagerError::Cancelled) => {
            eprintln!("Test run cancelled");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

fn validate_config(workspace: &Path) -> Result<()> {
    let config_path = workspace.join(CONFIG_FILE_NAME);
    match config::load_config(&config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Interpreter: {}", config.python.interpreter);
            match config.unit_test.preferred_provider() {
                Some(provider) => {
                    println!("  Runner: {}", provider);
                    println!("  Arguments: {}", shell_words::join(config.unit_test.args(provider)));
                    if let Some(executable) = config.unit_test.executable(provider) {
                        println!("  Executable: {}", executable);
                    }
                }
                None => println!("  Runner: none enabled"),
            }
            if let Some(cwd) = &config.unit_test.cwd {
                println!("  Working directory: {}", cwd.display());
            }

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(workspace: &Path, provider: TestProvider) -> Result<()> {
    let path = workspace.join(CONFIG_FILE_NAME);
    if path.exists() {
        bail!("{} already exists", path.display());
    }

    let config = Config::starter(provider);
    let content = toml::to_string_pretty(&config).context("Failed to serialize config")?;
    std::fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Created {} with {} enabled", path.display(), provider);
    Ok(())
}
