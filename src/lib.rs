//! pyrunner: discover and run Python tests through unittest, pytest or nose.
//!
//! Each runner reports tests in its own format. This crate drives the
//! runner as a subprocess, normalizes what it prints into one [`Tests`]
//! tree and aggregates pass/fail/skip/error results into it.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Model**: The test tree (folders, files, suites, functions) and its flat views
//! - **Adapters**: Per-runner command lines and output parsers (pytest, unittest, nose)
//! - **Transport**: Loopback server receiving streamed unittest results
//! - **Results**: Outcome bookkeeping, roll-ups and xUnit ingestion
//! - **Manager**: Discovery caching, de-duplication, runs and cancellation
//! - **Registry**: One manager per workspace and runner
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use pyrunner::process::LocalProcessRunner;
//! use pyrunner::registry::WorkspaceTestManagerService;
//! use pyrunner::report::ConsoleReporter;
//! use pyrunner::RunSelector;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = WorkspaceTestManagerService::new(
//!         Arc::new(LocalProcessRunner::new()),
//!         Arc::new(ConsoleReporter::new(false)),
//!     );
//!     if let Some(manager) = registry.test_manager(Path::new("."))? {
//!         manager.run_test(RunSelector::All).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod args;
pub mod bundled;
pub mod config;
pub mod manager;
pub mod model;
pub mod process;
pub mod registry;
pub mod report;
pub mod results;
pub mod transport;

// Re-export commonly used types
pub use adapter::{RunnerAdapter, create_adapter};
pub use config::{Config, SettingsProvider, load_config};
pub use manager::{CANCELLATION_REASON, ManagerError, TestManager};
pub use model::{RunSelector, SharedTests, TestProvider, TestStatus, Tests, TestsToRun};
pub use registry::{TestManagerService, WorkspaceTestManagerService};
pub use report::Reporter;
