//! xUnit report ingestion.
//!
//! pytest (`--junitxml`) and nose (`--with-xunit`) report results through an
//! xUnit XML file rather than the streaming transport. The file is read
//! once the runner exits and folded into the discovered [`Tests`].
//!
//! ```xml
//! <testsuite errors="0" failures="1" skipped="0" tests="2" time="0.12">
//!   <testcase classname="tests.test_math.TestAdd" name="test_ok" file="tests/test_math.py" line="4" time="0.001"/>
//!   <testcase classname="tests.test_math.TestAdd" name="test_bad" time="0.002">
//!     <failure message="assert 1 == 2">Traceback ...</failure>
//!   </testcase>
//! </testsuite>
//! ```
//!
//! Cases are matched to functions by class name plus function name. The
//! class name is normalized first: nose emits `Class()` for instance
//! methods and occasionally doubles dots.

use std::collections::HashMap;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, warn};

use super::Outcome;
use crate::model::{FunctionId, TestStatus, Tests};

/// Errors parsing an xUnit report.
#[derive(Debug, thiserror::Error)]
pub enum JunitError {
    #[error("Malformed xUnit report: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Malformed xUnit attribute: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),
}

/// One `<testcase>` element.
#[derive(Debug, Clone, PartialEq)]
pub struct JunitCase {
    pub classname: String,
    pub name: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub time: f64,
    pub outcome: Outcome,
    pub message: Option<String>,
    pub traceback: Option<String>,
}

impl JunitCase {
    fn from_element(element: &BytesStart<'_>) -> Result<Self, JunitError> {
        let mut case = JunitCase {
            classname: String::new(),
            name: String::new(),
            file: None,
            line: None,
            time: 0.0,
            outcome: Outcome::Passed,
            message: None,
            traceback: None,
        };
        for attr in element.attributes() {
            let attr = attr?;
            let value = attr.unescape_value()?.into_owned();
            match attr.key.as_ref() {
                b"classname" => case.classname = value,
                b"name" => case.name = value,
                b"file" => case.file = Some(value),
                b"line" => case.line = value.parse().ok(),
                b"time" => case.time = value.parse().unwrap_or(0.0),
                _ => {}
            }
        }
        Ok(case)
    }

    /// Applies a `<failure>`, `<error>` or `<skipped>` child.
    ///
    /// Later children win in the order failure, error, skipped.
    fn set_outcome(&mut self, outcome: Outcome, element: &BytesStart<'_>) -> Result<(), JunitError> {
        let rank = |o: Outcome| match o {
            Outcome::Passed => 0,
            Outcome::Failed => 1,
            Outcome::Error => 2,
            Outcome::Skipped => 3,
        };
        if rank(outcome) < rank(self.outcome) {
            return Ok(());
        }
        self.outcome = outcome;
        self.message = None;
        self.traceback = None;
        for attr in element.attributes() {
            let attr = attr?;
            if attr.key.as_ref() == b"message" {
                self.message = Some(attr.unescape_value()?.into_owned());
            }
        }
        Ok(())
    }
}

fn detail_outcome(name: &[u8]) -> Option<Outcome> {
    match name {
        b"failure" => Some(Outcome::Failed),
        b"error" => Some(Outcome::Error),
        b"skipped" | b"skip" => Some(Outcome::Skipped),
        _ => None,
    }
}

/// Parses every `<testcase>` of an xUnit document.
pub fn parse_report(xml: &str) -> Result<Vec<JunitCase>, JunitError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut cases = Vec::new();
    let mut current: Option<JunitCase> = None;
    let mut collecting = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"testcase" => {
                current = Some(JunitCase::from_element(&e)?);
            }
            Event::Empty(e) if e.name().as_ref() == b"testcase" => {
                cases.push(JunitCase::from_element(&e)?);
            }
            Event::Start(e) => {
                if let (Some(case), Some(outcome)) = (current.as_mut(), detail_outcome(e.name().as_ref())) {
                    case.set_outcome(outcome, &e)?;
                    collecting = case.outcome == outcome;
                }
            }
            Event::Empty(e) => {
                if let (Some(case), Some(outcome)) = (current.as_mut(), detail_outcome(e.name().as_ref())) {
                    case.set_outcome(outcome, &e)?;
                }
            }
            Event::Text(text) if collecting => {
                if let Some(case) = current.as_mut() {
                    let text = text.unescape()?;
                    case.traceback.get_or_insert_with(String::new).push_str(&text);
                }
            }
            Event::CData(data) if collecting => {
                if let Some(case) = current.as_mut() {
                    let text = String::from_utf8_lossy(&data);
                    case.traceback.get_or_insert_with(String::new).push_str(&text);
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"testcase" => {
                    if let Some(case) = current.take() {
                        cases.push(case);
                    }
                    collecting = false;
                }
                name if detail_outcome(name).is_some() => collecting = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(cases)
}

/// Normalizes an xUnit class name to the form stored on discovered tests.
///
/// ```
/// use pyrunner::results::junit::normalize_class_name;
///
/// assert_eq!(normalize_class_name("tests.test_a.TestA()"), "tests.test_a.TestA");
/// assert_eq!(normalize_class_name("pkg..mod."), "pkg.mod");
/// ```
pub fn normalize_class_name(classname: &str) -> String {
    let mut name = classname.replace("()", "");
    while name.contains("..") {
        name = name.replace("..", ".");
    }
    name.trim_end_matches('.').to_string()
}

/// Folds xUnit cases into `tests`, returning how many matched a function.
///
/// A case that matches no function but names a known file and carries an
/// error marks that file as failed to import.
pub fn apply_junit_report(tests: &mut Tests, cases: &[JunitCase]) -> usize {
    let index = index_by_xml_name(tests);
    let mut matched = 0;
    for case in cases {
        let class_name = normalize_class_name(&case.classname);
        let found = index
            .get(class_name.as_str())
            .and_then(|functions| functions.get(case.name.as_str()))
            .copied();

        let Some(id) = found else {
            let file = case.file.as_deref().and_then(|file| tests.find_file(file));
            match file {
                Some(file) if case.outcome == Outcome::Error => {
                    let file = tests.file_mut(file);
                    file.status = TestStatus::Error;
                    file.passed = Some(false);
                    file.message = case.message.clone();
                    file.traceback = case.traceback.clone();
                }
                _ => debug!("No discovered test for {}::{}", case.classname, case.name),
            }
            continue;
        };

        let function = tests.function_mut(id);
        function.line = case.line;
        function.time = case.time;
        function.status = case.outcome.status();
        function.message = case.message.clone();
        function.traceback = match case.outcome {
            Outcome::Skipped => None,
            _ => case.traceback.clone(),
        };
        tests.summary.record(case.outcome);
        matched += 1;
    }

    if matched < cases.len() {
        warn!(
            "{} of {} xUnit results did not match a discovered test",
            cases.len() - matched,
            cases.len()
        );
    }
    matched
}

/// Functions keyed by xml class name, then function name. The first
/// function wins when a name repeats.
fn index_by_xml_name(tests: &Tests) -> HashMap<String, HashMap<String, FunctionId>> {
    let mut index: HashMap<String, HashMap<String, FunctionId>> = HashMap::new();
    for flat in tests.test_functions() {
        index
            .entry(flat.xml_class_name.clone())
            .or_default()
            .entry(tests.function(flat.function).name.clone())
            .or_insert(flat.function);
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Parent, TestFile, TestFunction, TestSuite, TestsBuilder};

    const REPORT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<testsuite errors="1" failures="1" skipped="1" tests="4" time="0.5">
  <testcase classname="tests.test_a.TestA" name="test_ok" file="tests/test_a.py" line="4" time="0.010"/>
  <testcase classname="tests.test_a.TestA" name="test_bad" time="0.020">
    <failure message="assert 1 == 2">Traceback &lt;here&gt;</failure>
  </testcase>
  <testcase classname="tests.test_a.TestA()" name="test_skip" time="0">
    <skipped message="not today"/>
  </testcase>
  <testcase classname="tests.test_b" name="tests/test_b.py" file="tests/test_b.py" time="0">
    <error message="collection failure"><![CDATA[ImportError: no module]]></error>
  </testcase>
</testsuite>"#;

    fn sample() -> Tests {
        let mut builder = TestsBuilder::new();
        let a = builder.add_file(TestFile::new("tests/test_a.py", "/w/tests/test_a.py", "tests/test_a.py"));
        let suite = builder.add_suite(
            Parent::File(a),
            TestSuite::new("TestA", "tests/test_a.py::TestA", "tests.test_a.TestA"),
        );
        for name in ["test_ok", "test_bad", "test_skip"] {
            builder.add_function(
                Parent::Suite(suite),
                TestFunction::new(name, format!("tests/test_a.py::TestA::{name}")),
            );
        }
        builder.add_file(
            TestFile::new("tests/test_b.py", "/w/tests/test_b.py", "tests/test_b.py")
                .with_discovery_errors("ImportError"),
        );
        builder.build()
    }

    #[test]
    fn test_parse_report() {
        let cases = parse_report(REPORT).unwrap();
        assert_eq!(cases.len(), 4);
        assert_eq!(cases[0].outcome, Outcome::Passed);
        assert_eq!(cases[0].line, Some(4));
        assert_eq!(cases[1].outcome, Outcome::Failed);
        assert_eq!(cases[1].message.as_deref(), Some("assert 1 == 2"));
        assert_eq!(cases[1].traceback.as_deref(), Some("Traceback <here>"));
        assert_eq!(cases[2].outcome, Outcome::Skipped);
        assert_eq!(cases[3].outcome, Outcome::Error);
        assert_eq!(cases[3].traceback.as_deref(), Some("ImportError: no module"));
    }

    #[test]
    fn test_apply_report() {
        let mut tests = sample();
        let cases = parse_report(REPORT).unwrap();
        assert_eq!(apply_junit_report(&mut tests, &cases), 3);

        assert_eq!(tests.summary.passed, 1);
        assert_eq!(tests.summary.failures, 1);
        assert_eq!(tests.summary.skipped, 1);
        assert_eq!(tests.summary.errors, 0);

        let skip = tests.find_function("tests/test_a.py::TestA::test_skip").unwrap();
        assert_eq!(tests.function(skip).status, TestStatus::Skipped);

        let b = tests.find_file("tests/test_b.py").unwrap();
        assert_eq!(tests.file(b).status, TestStatus::Error);
        assert_eq!(tests.file(b).message.as_deref(), Some("collection failure"));
    }

    #[test]
    fn test_same_name_in_other_class() {
        let mut builder = TestsBuilder::new();
        let file = builder.add_file(TestFile::new("test_m.py", "/w/test_m.py", "test_m.py"));
        for class in ["TestX", "TestY"] {
            let suite = builder.add_suite(
                Parent::File(file),
                TestSuite::new(class, format!("test_m.py::{class}"), format!("test_m.{class}")),
            );
            builder.add_function(
                Parent::Suite(suite),
                TestFunction::new("test_it", format!("test_m.py::{class}::test_it")),
            );
        }
        let mut tests = builder.build();

        let report = r#"<testsuite>
  <testcase classname="test_m.TestY" name="test_it"><failure message="no"/></testcase>
  <testcase classname="test_m.TestX" name="test_it"/>
  <testcase classname="test_m.TestZ" name="test_it"/>
</testsuite>"#;
        let cases = parse_report(report).unwrap();
        assert_eq!(apply_junit_report(&mut tests, &cases), 2);

        let x = tests.find_function("test_m.py::TestX::test_it").unwrap();
        let y = tests.find_function("test_m.py::TestY::test_it").unwrap();
        assert_eq!(tests.function(x).status, TestStatus::Pass);
        assert_eq!(tests.function(y).status, TestStatus::Fail);
        assert_eq!(tests.summary.total(), 2);
    }

    #[test]
    fn test_malformed_report() {
        assert!(parse_report("<testsuite><testcase></testsuite>").is_err());
    }
}
