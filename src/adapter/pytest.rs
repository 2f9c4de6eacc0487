//! pytest adapter.
//!
//! Discovery runs `pytest --collect-only` and parses the collection tree:
//!
//! ```text
//! <Module 'tests/test_math.py'>
//!   <Class 'TestAdd'>
//!     <Instance '()'>
//!       <Function 'test_simple'>
//!   <Function 'test_module_level[1-2]'>
//! ```
//!
//! Nesting is given by the column of each node's `<`. Newer pytest versions
//! drop the quotes and wrap modules in `<Package>`/`<Dir>` nodes; both forms
//! are understood. Files that fail to import are listed in an `ERRORS`
//! section and become stub files carrying the collection output.
//!
//! Runs pass the selected `name_to_run` ids (`tests/test_math.py::TestAdd`)
//! and read results from `--junitxml`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use super::{
    AdapterResult, RunArtifacts, RunnerAdapter, RunnerContext, execute_all, ingest_xunit_report,
    lock_tests, subset_names, xunit_report_file,
};
use crate::args::{filter_arguments, has_option};
use crate::model::{
    FileId, Parent, RunSelector, SharedTests, SuiteId, TestFile, TestFunction, TestProvider, TestSuite,
    Tests, TestsBuilder,
};
use crate::process::Command;

/// Flags that only make sense when tests actually run.
const DISCOVERY_EXCLUDED_FLAGS: &[&str] = &[
    "-x",
    "--exitfirst",
    "--fixtures-per-test",
    "--pdb",
    "--runxfail",
    "--lf",
    "--last-failed",
    "--ff",
    "--failed-first",
    "--cache-show",
    "--cache-clear",
    "-v",
    "--verbose",
    "-q",
    "--quiet",
    "--disable-pytest-warnings",
    "-l",
    "--showlocals",
];

/// pytest's "no tests were collected" exit code.
const EXIT_NO_TESTS_COLLECTED: i32 = 5;

#[derive(Debug, Default, Clone, Copy)]
pub struct PytestAdapter;

impl PytestAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RunnerAdapter for PytestAdapter {
    fn provider(&self) -> TestProvider {
        TestProvider::Pytest
    }

    fn build_discovery_invocation(&self, ctx: &RunnerContext, ignore_cache: bool) -> AdapterResult<Command> {
        let mut args = filter_arguments(ctx.args(TestProvider::Pytest), &[], DISCOVERY_EXCLUDED_FLAGS);
        if ignore_cache {
            args.push("--cache-clear".to_string());
        }
        args.push("--collect-only".to_string());
        Ok(ctx.runner_command(TestProvider::Pytest).args(args))
    }

    fn parse_discovery_output(&self, output: &str, root: &Path) -> AdapterResult<Tests> {
        Ok(parse_collect_output(output, root))
    }

    fn build_run_invocations(
        &self,
        ctx: &RunnerContext,
        _tests: &Tests,
        selector: &RunSelector,
        artifacts: &RunArtifacts,
    ) -> AdapterResult<Vec<Command>> {
        let user_args = ctx.args(TestProvider::Pytest);
        let mut args: Vec<String> = user_args.to_vec();
        if selector.run_failed() && !has_option(user_args, "--lf") && !has_option(user_args, "--last-failed")
        {
            args.push("--last-failed".to_string());
        }
        if let Some(report) = &artifacts.xunit_file {
            args.push(format!("--junitxml={}", report.display()));
        }
        args.extend(subset_names(selector));
        Ok(vec![ctx.runner_command(TestProvider::Pytest).args(args)])
    }

    fn is_clean_exit(&self, exit_code: i32) -> bool {
        exit_code == 0 || exit_code == EXIT_NO_TESTS_COLLECTED
    }

    async fn run(
        &self,
        ctx: &RunnerContext,
        tests: SharedTests,
        selector: &RunSelector,
        token: &CancellationToken,
    ) -> AdapterResult<()> {
        let report = xunit_report_file()?;
        let artifacts = RunArtifacts {
            xunit_file: Some(report.to_path_buf()),
            ..Default::default()
        };
        let commands = {
            let tests = lock_tests(&tests);
            self.build_run_invocations(ctx, &tests, selector, &artifacts)?
        };

        execute_all(ctx, &commands, token).await?;
        ingest_xunit_report(TestProvider::Pytest, &tests, &report)
    }
}

fn errors_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^=+ *ERRORS *=+$").expect("valid regex"))
}

fn error_collecting() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^_+ *ERROR collecting (.*?) *_*$").expect("valid regex"))
}

fn node_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^<(\w+) (?:'(.*)'|(.*))>$").expect("valid regex"))
}

#[derive(Debug, Clone)]
enum Node {
    /// A `<Package>` or `<Dir>`; holds the directory relative to the root.
    Dir(String),
    File(FileId),
    Suite(SuiteId),
}

impl Node {
    fn as_parent(&self) -> Option<Parent> {
        match self {
            Node::Dir(_) => None,
            Node::File(id) => Some(Parent::File(*id)),
            Node::Suite(id) => Some(Parent::Suite(*id)),
        }
    }
}

struct ErrorBlock {
    file: String,
    lines: Vec<String>,
}

struct CollectParser<'a> {
    root: &'a Path,
    builder: TestsBuilder,
    stack: Vec<(usize, Node)>,
    in_errors: bool,
    error_block: Option<ErrorBlock>,
}

/// Parses `pytest --collect-only` output.
///
/// Lines are consumed strictly in order; the parent of every node is the
/// nearest preceding node with a smaller indent.
pub fn parse_collect_output(output: &str, root: &Path) -> Tests {
    let mut parser = CollectParser {
        root,
        builder: TestsBuilder::new(),
        stack: Vec::new(),
        in_errors: false,
        error_block: None,
    };
    for line in output.lines() {
        parser.line(line);
    }
    parser.flush_error_block();
    parser.builder.build()
}

impl CollectParser<'_> {
    fn line(&mut self, line: &str) {
        if errors_header().is_match(line.trim_end()) {
            self.flush_error_block();
            self.in_errors = true;
            return;
        }

        if self.in_errors {
            if let Some(caps) = error_collecting().captures(line.trim_end()) {
                self.flush_error_block();
                self.error_block = Some(ErrorBlock {
                    file: caps[1].trim().to_string(),
                    lines: vec![line.to_string()],
                });
            } else if line.starts_with('=') {
                self.flush_error_block();
            } else if let Some(block) = &mut self.error_block {
                block.lines.push(line.to_string());
            }
            return;
        }

        self.node(line);
    }

    fn node(&mut self, line: &str) {
        let Some(indent) = line.find('<') else {
            return;
        };
        let Some(caps) = node_line().captures(line.trim()) else {
            return;
        };
        let kind = &caps[1];
        let name = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str())
            .unwrap_or_default()
            .to_string();

        while self.stack.last().is_some_and(|(depth, _)| *depth >= indent) {
            self.stack.pop();
        }
        let parent = self.stack.last().and_then(|(_, node)| node.as_parent());

        match kind {
            "Package" | "Dir" => {
                let dir = self.relative_dir(&name);
                self.stack.push((indent, Node::Dir(dir)));
            }
            "Module" => {
                let file_name = self.module_path(&name);
                let full_path = self.root.join(&file_name);
                let id = self
                    .builder
                    .add_file(TestFile::new(file_name.clone(), full_path, file_name));
                self.stack.push((indent, Node::File(id)));
            }
            "Class" | "UnitTestCase" => {
                let Some(parent) = parent else {
                    return;
                };
                let suite = TestSuite::new(
                    name.clone(),
                    format!("{}::{}", self.builder.name_to_run(parent), name),
                    format!("{}.{}", self.builder.xml_name(parent), name),
                )
                .unit_test(kind == "UnitTestCase");
                let id = self.builder.add_suite(parent, suite);
                self.stack.push((indent, Node::Suite(id)));
            }
            "Instance" => {
                if let Some(Parent::Suite(id)) = parent {
                    self.builder.suite_mut(id).is_instance = true;
                }
            }
            "Function" | "TestCaseFunction" => {
                let Some(parent) = parent else {
                    return;
                };
                let name_to_run = format!("{}::{}", self.builder.name_to_run(parent), name);
                self.builder
                    .add_function(parent, TestFunction::new(name, name_to_run));
            }
            _ => {}
        }
    }

    /// Directory enclosing the next module, from the nearest `Dir` entry.
    fn current_dir(&self) -> Option<&str> {
        self.stack.iter().rev().find_map(|(_, node)| match node {
            Node::Dir(dir) => Some(dir.as_str()),
            _ => None,
        })
    }

    fn relative_dir(&self, name: &str) -> String {
        let path = Path::new(name);
        if path.is_absolute() {
            return relative_to(path, self.root);
        }
        match self.current_dir() {
            Some(parent) if !parent.is_empty() => format!("{parent}/{name}"),
            // The outermost `<Dir>` of recent pytest versions is the root itself.
            None if self.root.file_name().is_some_and(|root| root == name) => String::new(),
            _ => name.to_string(),
        }
    }

    fn module_path(&self, name: &str) -> String {
        let path = Path::new(name);
        if path.is_absolute() {
            return relative_to(path, self.root);
        }
        match self.current_dir() {
            Some(dir) if !dir.is_empty() && !name.contains('/') => format!("{dir}/{name}"),
            _ => name.to_string(),
        }
    }

    fn flush_error_block(&mut self) {
        let Some(block) = self.error_block.take() else {
            return;
        };
        let full_path = if Path::new(&block.file).is_absolute() {
            PathBuf::from(&block.file)
        } else {
            self.root.join(&block.file)
        };
        let errors = block.lines.join("\n");
        self.builder.add_file(
            TestFile::new(block.file.clone(), full_path, block.file).with_discovery_errors(errors),
        );
    }
}

fn relative_to(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::adapter::testing::*;
    use crate::config::Config;
    use crate::model::TestStatus;

    const COLLECT_OUTPUT: &str = "\
============================= test session starts ==============================
platform linux -- Python 3.6.3, pytest-3.3.0, py-1.5.2, pluggy-0.6.0
rootdir: /ws, inifile:
collected 12 items
<Module 'test_another.py'>
  <Class 'Test_CheckMyApp'>
    <Instance '()'>
      <Function 'test_simple_check'>
      <Function 'test_complex_check'>
<Module 'test_one.py'>
  <UnitTestCase 'Test_test1'>
    <TestCaseFunction 'test_A'>
    <TestCaseFunction 'test_B'>
<Module 'testPasswords/test_multi.py'>
  <Class 'Test_CheckMyApp'>
    <Instance '()'>
      <Function 'test_simple_check'>
      <Class 'Test_NestedClassA'>
        <Instance '()'>
          <Function 'test_nested_class_methodB'>
  <Function 'test_username'>
  <Function 'test_parametrized_username[one]'>
  <Function 'test_parametrized_username[two]'>

========================= no tests ran in 0.05 seconds =========================
";

    fn names(tests: &Tests) -> Vec<String> {
        tests
            .test_functions()
            .iter()
            .map(|f| tests.function(f.function).name_to_run.clone())
            .collect()
    }

    #[test]
    fn test_parse_collect_tree() {
        let tests = parse_collect_output(COLLECT_OUTPUT, Path::new("/ws"));
        assert_eq!(tests.test_files().count(), 3);
        assert_eq!(tests.test_functions().len(), 9);

        let nested = tests
            .find_function("testPasswords/test_multi.py::Test_CheckMyApp::Test_NestedClassA::test_nested_class_methodB")
            .unwrap();
        let flat = tests.flattened_function(nested);
        assert_eq!(flat.xml_class_name, "testPasswords.test_multi.Test_CheckMyApp.Test_NestedClassA");
        assert_eq!(tests.file(flat.parent_file).name, "testPasswords/test_multi.py");
        assert_eq!(tests.file(flat.parent_file).full_path, PathBuf::from("/ws/testPasswords/test_multi.py"));

        let module_level = tests
            .find_function("testPasswords/test_multi.py::test_parametrized_username[two]")
            .unwrap();
        assert!(tests.flattened_function(module_level).parent_suite.is_none());

        let unit = tests.find_suite("test_one.py::Test_test1").unwrap();
        assert!(tests.suite(unit).is_unit_test);
        let instance = tests.find_suite("test_another.py::Test_CheckMyApp").unwrap();
        assert!(tests.suite(instance).is_instance);
    }

    #[test]
    fn test_indent_determines_parent() {
        let output = "\
<Module 'test_x.py'>
  <Class 'A'>
    <Function 'f'>
  <Function 'g'>
";
        let tests = parse_collect_output(output, Path::new("/ws"));
        let f = tests.find_function("test_x.py::A::f").unwrap();
        let g = tests.find_function("test_x.py::g").unwrap();
        assert!(tests.flattened_function(f).parent_suite.is_some());
        let g = tests.flattened_function(g);
        assert!(g.parent_suite.is_none());
        assert_eq!(tests.file(g.parent_file).name, "test_x.py");
        assert_eq!(names(&tests), vec!["test_x.py::g", "test_x.py::A::f"]);
    }

    #[test]
    fn test_last_line_without_newline() {
        let output = "<Module 'test_x.py'>\n  <Function 'test_last'>";
        let tests = parse_collect_output(output, Path::new("/ws"));
        assert!(tests.find_function("test_x.py::test_last").is_some());
    }

    #[test]
    fn test_unquoted_nodes_inside_packages() {
        let output = "\
<Dir ws>
  <Package tests>
    <Module test_math.py>
      <Class TestAdd>
        <Function test_add>
    <Package unit>
      <Module test_unit.py>
        <Function test_unit>
  <Module test_root.py>
    <Function test_root>
";
        let tests = parse_collect_output(output, Path::new("/home/me/ws"));
        assert_eq!(
            names(&tests),
            vec![
                "tests/test_math.py::TestAdd::test_add",
                "tests/unit/test_unit.py::test_unit",
                "test_root.py::test_root",
            ]
        );
    }

    #[test]
    fn test_absolute_package_paths() {
        let output = "\
<Package /ws/tests>
  <Module test_a.py>
    <Function test_a>
";
        let tests = parse_collect_output(output, Path::new("/ws"));
        assert!(tests.find_function("tests/test_a.py::test_a").is_some());
    }

    #[test]
    fn test_collection_errors_become_stub_files() {
        let output = "\
collected 1 item / 2 errors
<Module 'tests/test_ok.py'>
  <Function 'test_ok'>

==================================== ERRORS ====================================
____________________ ERROR collecting tests/test_broken.py _____________________
tests/test_broken.py:1: in <module>
    import missing
E   ModuleNotFoundError: No module named 'missing'
_____________________ ERROR collecting tests/test_other.py _____________________
E   SyntaxError: invalid syntax
!!!!!!!!!!!!!!!!!!! Interrupted: 2 errors during collection !!!!!!!!!!!!!!!!!!!!
=========================== 2 error in 0.10 seconds ============================
";
        let tests = parse_collect_output(output, Path::new("/ws"));
        assert_eq!(tests.test_functions().len(), 1);

        let broken: Vec<_> = tests.files_with_discovery_errors().collect();
        assert_eq!(broken.len(), 2);
        assert_eq!(broken[0].name, "tests/test_broken.py");
        assert_eq!(broken[0].full_path, PathBuf::from("/ws/tests/test_broken.py"));
        let errors = broken[0].errors_when_discovering.as_deref().unwrap();
        assert!(errors.contains("No module named 'missing'"));
        assert!(!errors.contains("SyntaxError"));
        assert!(broken[1].errors_when_discovering.as_deref().unwrap().contains("SyntaxError"));
    }

    fn pytest_config(args: &[&str]) -> Config {
        let mut config = Config::default();
        config.unit_test.pytest_enabled = true;
        config.unit_test.pytest_args = args.iter().map(|a| a.to_string()).collect();
        config
    }

    #[test]
    fn test_discovery_invocation_filters_run_flags() {
        let runner = Arc::new(ScriptedRunner::default());
        let ctx = context(Path::new("/ws"), pytest_config(&["-x", "--lf", "-k", "fast", "tests"]), runner);

        let cmd = PytestAdapter::new().build_discovery_invocation(&ctx, true).unwrap();
        assert_eq!(cmd.program, "python");
        assert_eq!(
            cmd.args,
            vec!["-m", "pytest", "-k", "fast", "tests", "--cache-clear", "--collect-only"]
        );
        assert_eq!(cmd.working_dir, Some(PathBuf::from("/ws")));
    }

    #[test]
    fn test_run_invocation() {
        let runner = Arc::new(ScriptedRunner::default());
        let ctx = context(Path::new("/ws"), pytest_config(&["-q"]), runner);
        let adapter = PytestAdapter::new();
        let artifacts = RunArtifacts {
            xunit_file: Some(PathBuf::from("/tmp/report.xml")),
            ..Default::default()
        };

        let cmds = adapter
            .build_run_invocations(&ctx, &Tests::default(), &RunSelector::Failed, &artifacts)
            .unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(
            cmds[0].args,
            vec!["-m", "pytest", "-q", "--last-failed", "--junitxml=/tmp/report.xml"]
        );

        let subset = RunSelector::Subset(crate::model::TestsToRun {
            files: vec!["tests/test_a.py".into()],
            functions: vec!["tests/test_b.py::test_x".into()],
            ..Default::default()
        });
        let cmds = adapter
            .build_run_invocations(&ctx, &Tests::default(), &subset, &artifacts)
            .unwrap();
        assert_eq!(
            &cmds[0].args[3..],
            ["--junitxml=/tmp/report.xml", "tests/test_a.py", "tests/test_b.py::test_x"]
        );
    }

    #[test]
    fn test_exit_code_five_is_clean() {
        let adapter = PytestAdapter::new();
        assert!(adapter.is_clean_exit(5));
        assert!(!adapter.is_clean_exit(2));
    }

    #[tokio::test]
    async fn test_run_reads_junit_report() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push_with(|cmd| {
            let report = cmd
                .args
                .iter()
                .find_map(|a| a.strip_prefix("--junitxml="))
                .unwrap();
            std::fs::write(
                report,
                r#"<testsuite tests="2">
  <testcase classname="test_x.A" name="f" time="0.5"/>
  <testcase classname="test_x" name="g" time="0.25"><failure message="boom">trace</failure></testcase>
</testsuite>"#,
            )
            .unwrap();
            output(1, "1 failed, 1 passed")
        });
        let ctx = context(Path::new("/ws"), pytest_config(&[]), runner.clone());
        let tests = parse_collect_output(
            "<Module 'test_x.py'>\n  <Class 'A'>\n    <Function 'f'>\n  <Function 'g'>\n",
            Path::new("/ws"),
        );
        let shared = Arc::new(std::sync::Mutex::new(tests));

        PytestAdapter::new()
            .run(&ctx, shared.clone(), &RunSelector::All, &CancellationToken::new())
            .await
            .unwrap();

        let tests = shared.lock().unwrap();
        assert_eq!(tests.summary.passed, 1);
        assert_eq!(tests.summary.failures, 1);
        let g = tests.function(tests.find_function("test_x.py::g").unwrap());
        assert_eq!(g.status, TestStatus::Fail);
        assert_eq!(g.message.as_deref(), Some("boom"));
        let file = tests.file(tests.find_file("test_x.py").unwrap());
        assert_eq!(file.status, TestStatus::Error);
    }

    #[tokio::test]
    async fn test_run_without_report_fails() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(output(4, "usage error"));
        let ctx = context(Path::new("/ws"), pytest_config(&[]), runner);
        let shared = Arc::new(std::sync::Mutex::new(Tests::default()));

        let err = PytestAdapter::new()
            .run(&ctx, shared, &RunSelector::All, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::adapter::AdapterError::RunFailed { .. }));
    }
}
