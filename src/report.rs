//! Test reporting and console output.
//!
//! The test manager reports progress through the [`Reporter`] trait: runner
//! output, discovery warnings, live per-test events from the result
//! transport, and the final tree once a run completes. Implementations
//! must be cheap and non-blocking; methods are called from the transport's
//! connection tasks.

use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};

use crate::model::{TestProvider, TestStatus, TestSummary, Tests};
use crate::results::Outcome;

/// Receives events during discovery and runs.
pub trait Reporter: Send + Sync {
    /// Raw runner output (stdout, merged stderr).
    fn on_output(&self, text: &str);

    /// Discovery finished with a fresh tree.
    fn on_discovery_complete(&self, provider: TestProvider, tests: &Tests);

    /// One aggregated message listing files that failed to collect.
    fn on_discovery_errors(&self, message: &str);

    /// A discovery or run failed.
    fn on_error(&self, message: &str);

    /// A test started (streamed runners only).
    fn on_test_start(&self, name_to_run: &str);

    /// A test finished (streamed runners only).
    fn on_test_result(&self, name_to_run: &str, outcome: Outcome, message: Option<&str>);

    /// A run finished; `tests` carries the final statuses and summary.
    fn on_run_complete(&self, tests: &Tests);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

impl Reporter for NullReporter {
    fn on_output(&self, _text: &str) {}
    fn on_discovery_complete(&self, _provider: TestProvider, _tests: &Tests) {}
    fn on_discovery_errors(&self, _message: &str) {}
    fn on_error(&self, _message: &str) {}
    fn on_test_start(&self, _name_to_run: &str) {}
    fn on_test_result(&self, _name_to_run: &str, _outcome: Outcome, _message: Option<&str>) {}
    fn on_run_complete(&self, _tests: &Tests) {}
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: Mutex<Option<ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    /// Create a new console reporter. `verbose` echoes runner output and
    /// passing tests.
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn with_progress(&self, f: impl FnOnce(&ProgressBar)) {
        let mut progress = self.progress.lock().unwrap_or_else(|p| p.into_inner());
        let pb = progress.get_or_insert_with(|| {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {pos} tests {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(std::time::Duration::from_millis(120));
            pb
        });
        f(pb);
    }

    fn finish_progress(&self) {
        if let Some(pb) = self.progress.lock().unwrap_or_else(|p| p.into_inner()).take() {
            pb.finish_and_clear();
        }
    }
}

impl Reporter for ConsoleReporter {
    fn on_output(&self, text: &str) {
        if self.verbose && !text.trim().is_empty() {
            println!("{}", console::style(text.trim_end()).dim());
        }
    }

    fn on_discovery_complete(&self, provider: TestProvider, tests: &Tests) {
        println!(
            "Discovered {} tests in {} files ({})",
            tests.test_functions().len(),
            tests.test_files().count(),
            provider
        );
    }

    fn on_discovery_errors(&self, message: &str) {
        eprintln!("{} {}", console::style("warning:").yellow().bold(), message);
    }

    fn on_error(&self, message: &str) {
        self.finish_progress();
        eprintln!("{} {}", console::style("error:").red().bold(), message);
    }

    fn on_test_start(&self, name_to_run: &str) {
        self.with_progress(|pb| pb.set_message(name_to_run.to_string()));
    }

    fn on_test_result(&self, name_to_run: &str, outcome: Outcome, message: Option<&str>) {
        let verbose = self.verbose;
        self.with_progress(|pb| {
            pb.inc(1);
            if verbose || outcome != Outcome::Passed {
                pb.println(format!("{} {}", outcome_label(outcome), name_to_run));
                if let Some(message) = message.filter(|_| outcome.is_failure()) {
                    pb.println(format!("    {}", console::style(message).dim()));
                }
            }
        });
    }

    fn on_run_complete(&self, tests: &Tests) {
        self.finish_progress();

        let failed: Vec<_> = tests
            .test_functions()
            .iter()
            .map(|f| tests.function(f.function))
            .filter(|f| matches!(f.status, TestStatus::Fail | TestStatus::Error))
            .collect();
        if !failed.is_empty() {
            println!();
            println!("Failed tests:");
            for function in failed {
                println!("  - {}", function.name_to_run);
                if let Some(message) = &function.message {
                    println!("    {}", console::style(message).dim());
                }
            }
        }
        for file in tests.test_files().map(|(_, f)| f).filter(|f| f.status == TestStatus::Error) {
            println!("  - {} (file error)", file.name);
        }

        print_summary(&tests.summary);
    }
}

fn outcome_label(outcome: Outcome) -> console::StyledObject<&'static str> {
    match outcome {
        Outcome::Passed => console::style("PASS").green(),
        Outcome::Failed => console::style("FAIL").red(),
        Outcome::Skipped => console::style("SKIP").yellow(),
        Outcome::Error => console::style("ERR ").red().bold(),
    }
}

/// Prints a summary of test results to the console.
pub fn print_summary(summary: &TestSummary) {
    println!();
    println!("Test Results:");
    println!("  Total:   {}", summary.total());
    println!("  Passed:  {}", console::style(summary.passed).green());
    println!("  Failed:  {}", console::style(summary.failures).red());
    println!("  Errors:  {}", console::style(summary.errors).red());
    println!("  Skipped: {}", console::style(summary.skipped).yellow());

    println!();
    if summary.has_failures() {
        println!("{}", console::style("Some tests failed.").red().bold());
    } else if summary.total() == 0 {
        println!("{}", console::style("No test results were collected.").yellow().bold());
    } else {
        println!("{}", console::style("All tests passed!").green().bold());
    }
}
