//! nose adapter.
//!
//! nose has no machine-readable collection output. Discovery runs
//! `nosetests --collect-only -vvv` and reads the selector's debug log,
//! keeping only the decisions that selected something:
//!
//! ```text
//! nose.selector: DEBUG: wantFile /ws/tests/test_math.py? True
//! nose.selector: DEBUG: wantClass <class 'tests.test_math.TestAdd'>? True
//! nose.selector: DEBUG: wantMethod <function TestAdd.test_simple at 0x10a2b>? True
//! nose.selector: DEBUG: wantFunction <function test_module_level at 0x10a2c>? True
//! ```
//!
//! Tests are addressed as `file:Class.method`. Results come from the xUnit
//! plugin.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    AdapterResult, RunArtifacts, RunnerAdapter, RunnerContext, execute_all, ingest_xunit_report,
    lock_tests, subset_names, xunit_report_file,
};
use crate::args::{filter_arguments, get_option_values, has_option};
use crate::model::{
    FileId, Parent, RunSelector, SharedTests, TestFile, TestFunction, TestProvider, TestSuite, Tests,
    TestsBuilder,
};
use crate::process::Command;

const DISCOVERY_EXCLUDED_FLAGS: &[&str] = &[
    "-v",
    "--verbose",
    "-q",
    "--quiet",
    "-x",
    "--stop",
    "--with-coverage",
    "--cover-erase",
    "--cover-tests",
    "--cover-inclusive",
    "--cover-html",
    "--cover-branches",
    "--cover-xml",
    "--cover-*",
    "--pdb",
    "--pdb-failures",
    "--pdb-errors",
    "--failed",
    "--process-restartworker",
    "--with-xunit",
    "--verbosity*",
];

const WITH_ID: &str = "--with-id";
const WITH_XUNIT: &str = "--with-xunit";
const XUNIT_FILE: &str = "--xunit-file";

const SELECTOR: &str = "nose.selector: DEBUG: ";
const SELECTED: &str = "? True";

#[derive(Debug, Default, Clone, Copy)]
pub struct NoseAdapter;

impl NoseAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RunnerAdapter for NoseAdapter {
    fn provider(&self) -> TestProvider {
        TestProvider::Nosetest
    }

    fn build_discovery_invocation(&self, ctx: &RunnerContext, _ignore_cache: bool) -> AdapterResult<Command> {
        let mut args = filter_arguments(ctx.args(TestProvider::Nosetest), &[], DISCOVERY_EXCLUDED_FLAGS);
        if !has_option(&args, WITH_ID) {
            args.push(WITH_ID.to_string());
        }
        args.push("--collect-only".to_string());
        args.push("-vvv".to_string());
        Ok(ctx
            .runner_command(TestProvider::Nosetest)
            .args(args)
            .merge_stderr())
    }

    fn parse_discovery_output(&self, output: &str, root: &Path) -> AdapterResult<Tests> {
        Ok(parse_selector_log(output, root))
    }

    fn build_run_invocations(
        &self,
        ctx: &RunnerContext,
        _tests: &Tests,
        selector: &RunSelector,
        artifacts: &RunArtifacts,
    ) -> AdapterResult<Vec<Command>> {
        let mut args = ctx.args(TestProvider::Nosetest).to_vec();
        if !has_option(&args, WITH_XUNIT) {
            args.push(WITH_XUNIT.to_string());
        }
        if !has_option(&args, XUNIT_FILE)
            && let Some(report) = &artifacts.xunit_file
        {
            args.push(format!("{XUNIT_FILE}={}", report.display()));
        }
        if !has_option(&args, WITH_ID) {
            args.push(WITH_ID.to_string());
        }
        if selector.run_failed() && !has_option(&args, "--failed") {
            args.push("--failed".to_string());
        }
        args.extend(subset_names(selector));
        Ok(vec![ctx.runner_command(TestProvider::Nosetest).args(args)])
    }

    async fn run(
        &self,
        ctx: &RunnerContext,
        tests: SharedTests,
        selector: &RunSelector,
        token: &CancellationToken,
    ) -> AdapterResult<()> {
        // A report path given by the user is read in place of a temp file.
        let user_report = get_option_values(ctx.args(TestProvider::Nosetest), XUNIT_FILE)
            .pop()
            .map(|file| ctx.cwd.join(file));
        let temp_report;
        let report: PathBuf = match user_report {
            Some(path) => path,
            None => {
                temp_report = xunit_report_file()?;
                temp_report.to_path_buf()
            }
        };

        let artifacts = RunArtifacts {
            xunit_file: Some(report.clone()),
            ..Default::default()
        };
        let commands = {
            let tests = lock_tests(&tests);
            self.build_run_invocations(ctx, &tests, selector, &artifacts)?
        };

        execute_all(ctx, &commands, token).await?;
        ingest_xunit_report(TestProvider::Nosetest, &tests, &report)
    }
}

/// Extracts the text between `start` and the first `end` after it.
fn between<'a>(line: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(start)?;
    rest.find(end).map(|index| &rest[..index])
}

/// Builds a test tree from the `nose.selector` debug log.
pub fn parse_selector_log(output: &str, root: &Path) -> Tests {
    let mut builder = TestsBuilder::new();
    let mut current: Option<FileId> = None;

    for line in output.lines() {
        let line = line.trim_end();
        let Some(decision) = line.strip_prefix(SELECTOR).and_then(|l| l.strip_suffix(SELECTED)) else {
            continue;
        };

        if let Some(path) = decision.strip_prefix("wantFile ") {
            current = add_file(&mut builder, root, path);
            continue;
        }
        let Some(file) = current else {
            continue;
        };

        if let Some(class) = between(decision, "wantClass <class '", "'>") {
            add_suite(&mut builder, file, class);
        } else if let Some(class) = decision.strip_prefix("wantClass ") {
            add_suite(&mut builder, file, class);
        } else if let Some(method) = decision
            .strip_prefix("wantMethod <unbound method ")
            .and_then(|m| m.strip_suffix('>'))
            .or_else(|| between(decision, "wantMethod <function ", " at "))
        {
            add_method(&mut builder, file, method);
        } else if let Some(function) = between(decision, "wantFunction <function ", " at ") {
            let name_to_run = format!("{}:{}", builder.file(file).name_to_run, function);
            builder.add_function(Parent::File(file), TestFunction::new(function, name_to_run));
        }
    }

    builder.remove_empty_files();
    builder.build()
}

fn add_file(builder: &mut TestsBuilder, root: &Path, path: &str) -> Option<FileId> {
    let path = path.strip_suffix('c').filter(|p| p.ends_with(".py")).unwrap_or(path);
    if !path.ends_with(".py") {
        // Directories and packages are also "wanted".
        return None;
    }
    let full_path = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        root.join(path)
    };
    if let Some(existing) = builder.find_file_by_path(&full_path) {
        return Some(existing);
    }
    let name = full_path
        .strip_prefix(root)
        .unwrap_or(&full_path)
        .to_string_lossy()
        .replace('\\', "/");
    Some(builder.add_file(TestFile::new(name.clone(), full_path, name)))
}

fn add_suite(builder: &mut TestsBuilder, file: FileId, qualified: &str) -> Parent {
    let name = qualified.rsplit('.').next().unwrap_or(qualified);
    if let Some(existing) = builder.find_suite_in_file(file, name) {
        return Parent::Suite(existing);
    }
    let name_to_run = format!("{}:{}", builder.file(file).name_to_run, name);
    let xml_name = if qualified.contains('.') {
        qualified.to_string()
    } else {
        format!("{}.{}", builder.file(file).xml_name, name)
    };
    Parent::Suite(builder.add_suite(Parent::File(file), TestSuite::new(name, name_to_run, xml_name)))
}

fn add_method(builder: &mut TestsBuilder, file: FileId, method: &str) {
    let Some((class, name)) = method.rsplit_once('.') else {
        debug!("Ignoring nose method without class: {}", method);
        return;
    };
    let class = class.rsplit('.').next().unwrap_or(class);
    let suite = add_suite(builder, file, class);
    let name_to_run = format!("{}:{}.{}", builder.file(file).name_to_run, class, name);
    builder.add_function(suite, TestFunction::new(name, name_to_run));
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::adapter::testing::*;
    use crate::config::Config;
    use crate::model::TestStatus;

    const SELECTOR_LOG: &str = "\
nose.config: INFO: Ignoring files matching ['^\\\\.', '^_', '^setup\\\\.py$']
nose.selector: DEBUG: wantDirectory /ws/tests? True
nose.selector: DEBUG: wantFile /ws/tests/__init__.py? False
nose.selector: DEBUG: wantFile /ws/tests/test_math.py? True
nose.selector: DEBUG: wantClass <class 'tests.test_math.TestAdd'>? True
nose.selector: DEBUG: wantMethod <function TestAdd.test_simple at 0x10a2b7d90>? True
nose.selector: DEBUG: wantMethod <function TestAdd.test_negative at 0x10a2b7e18>? True
nose.selector: DEBUG: wantMethod <function TestAdd.helper at 0x10a2b7ea0>? False
nose.selector: DEBUG: wantFunction <function test_module_level at 0x10a2b7f28>? True
nose.selector: DEBUG: wantFile /ws/tests/test_legacy.pyc? True
nose.selector: DEBUG: wantClass <class 'tests.test_legacy.OldStyle'>? True
nose.selector: DEBUG: wantMethod <unbound method OldStyle.test_old>? True
nose.selector: DEBUG: wantFile /ws/tests/test_empty.py? True
nose.selector: DEBUG: wantFile /ws/tests/helpers.py? False

----------------------------------------------------------------------
Ran 0 tests in 0.001s

OK
";

    #[test]
    fn test_parse_selector_log() {
        let tests = parse_selector_log(SELECTOR_LOG, Path::new("/ws"));
        // test_empty.py selected nothing and is dropped.
        assert_eq!(tests.test_files().count(), 2);
        assert_eq!(tests.test_functions().len(), 4);

        let simple = tests.find_function("tests/test_math.py:TestAdd.test_simple").unwrap();
        let flat = tests.flattened_function(simple);
        assert_eq!(flat.xml_class_name, "tests.test_math.TestAdd");
        assert_eq!(tests.file(flat.parent_file).full_path, PathBuf::from("/ws/tests/test_math.py"));

        let module_level = tests.find_function("tests/test_math.py:test_module_level").unwrap();
        assert_eq!(tests.flattened_function(module_level).xml_class_name, "tests.test_math");

        assert!(tests.find_function("tests/test_legacy.py:OldStyle.test_old").is_some());
        assert!(tests.find_function("tests/test_math.py:TestAdd.helper").is_none());
    }

    fn nose_config(args: &[&str]) -> Config {
        let mut config = Config::default();
        config.unit_test.nosetests_enabled = true;
        config.unit_test.nosetest_args = args.iter().map(|a| a.to_string()).collect();
        config
    }

    #[test]
    fn test_discovery_invocation() {
        let runner = Arc::new(ScriptedRunner::default());
        let ctx = context(
            Path::new("/ws"),
            nose_config(&["-v", "--with-coverage", "--cover-package", "pkg", "--verbosity=3", "--where=tests"]),
            runner,
        );

        let cmd = NoseAdapter::new().build_discovery_invocation(&ctx, false).unwrap();
        assert_eq!(
            cmd.args,
            vec!["-m", "nose", "--where=tests", "--with-id", "--collect-only", "-vvv"]
        );
        assert!(cmd.merge_stderr);
    }

    #[test]
    fn test_run_invocation() {
        let runner = Arc::new(ScriptedRunner::default());
        let ctx = context(Path::new("/ws"), nose_config(&[]), runner);
        let artifacts = RunArtifacts {
            xunit_file: Some(PathBuf::from("/tmp/nose.xml")),
            ..Default::default()
        };

        let cmds = NoseAdapter::new()
            .build_run_invocations(&ctx, &Tests::default(), &RunSelector::Failed, &artifacts)
            .unwrap();
        assert_eq!(
            cmds[0].args,
            vec!["-m", "nose", "--with-xunit", "--xunit-file=/tmp/nose.xml", "--with-id", "--failed"]
        );
    }

    #[tokio::test]
    async fn test_run_reads_user_report() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("out.xml");
        let runner = Arc::new(ScriptedRunner::default());
        let written = report.clone();
        runner.push_with(move |_| {
            std::fs::write(
                &written,
                r#"<testsuite><testcase classname="tests.test_math.TestAdd()" name="test_simple" time="0.1"/></testsuite>"#,
            )
            .unwrap();
            output(0, "")
        });
        let user_arg = format!("--xunit-file={}", report.display());
        let ctx = context(Path::new("/ws"), nose_config(&[user_arg.as_str()]), runner.clone());
        let shared = Arc::new(std::sync::Mutex::new(parse_selector_log(SELECTOR_LOG, Path::new("/ws"))));

        NoseAdapter::new()
            .run(&ctx, shared.clone(), &RunSelector::All, &CancellationToken::new())
            .await
            .unwrap();

        let commands = runner.commands();
        assert_eq!(commands[0].args.iter().filter(|a| a.starts_with("--xunit-file")).count(), 1);
        let tests = shared.lock().unwrap();
        assert_eq!(tests.summary.passed, 1);
        let simple = tests.find_function("tests/test_math.py:TestAdd.test_simple").unwrap();
        assert_eq!(tests.function(simple).status, TestStatus::Pass);
    }
}
