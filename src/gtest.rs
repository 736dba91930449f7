//! gtest command-line composition and summary parsing.
//!
//! Test binaries print a stable textual summary at the end of a run:
//!
//! ```text
//! [==========] 2 tests from 1 test suite ran. (4 ms total)
//! [  PASSED  ] 1 test.
//! [  FAILED  ] 1 test, listed below:
//! [  FAILED  ] Suite.CaseA
//! ```
//!
//! [`parse_results`] turns the collected lines into a [`GtestSummary`], and
//! [`compose_args`] builds the argv the runner passes to a binary.

use std::sync::LazyLock;

use regex::Regex;

/// Substring marking a case as flaky.
pub const FLAKY_MARKER: &str = ".FLAKY_";

/// Attempts made for each failed flaky case after the initial run.
pub const MAX_FLAKY_ATTEMPTS: usize = 4;

static TESTS_RAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[==========\] (\d+) tests? from .* ran\.").expect("valid regex")
});

static TESTS_PASSED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[  PASSED  \] (\d+) tests?").expect("valid regex"));

static TESTS_FAILED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[  FAILED  \] (\d+) tests?, listed below:").expect("valid regex")
});

static FAILED_CASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[  FAILED  \] (.+)").expect("valid regex"));

/// Counters and failed case names parsed from a gtest summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtestSummary {
    /// Cases that ran.
    pub total: usize,
    /// Cases that passed.
    pub passed: usize,
    /// Cases that failed.
    pub failed: usize,
    /// Names of the failed cases, in the order they were listed.
    pub failed_names: Vec<String>,
}

impl GtestSummary {
    /// Failed case names that carry the flaky marker.
    pub fn flaky_failures(&self) -> impl Iterator<Item = &str> {
        self.failed_names
            .iter()
            .map(String::as_str)
            .filter(|name| is_flaky(name))
    }

    /// Number of failed cases that are not flaky.
    pub fn hard_failures(&self) -> usize {
        self.failed_names.iter().filter(|name| !is_flaky(name)).count()
    }
}

/// Parses the summary block out of a binary's output lines.
///
/// Lines that match none of the summary patterns are ignored. Failed case
/// names are read from the lines directly following the
/// `[  FAILED  ] N tests, listed below:` header.
pub fn parse_results<S: AsRef<str>>(lines: &[S]) -> GtestSummary {
    let mut summary = GtestSummary::default();

    let mut index = 0;
    while index < lines.len() {
        let line = lines[index].as_ref();
        index += 1;

        if let Some(count) = capture_count(&TESTS_RAN, line) {
            summary.total = count;
        } else if let Some(count) = capture_count(&TESTS_PASSED, line) {
            summary.passed = count;
        } else if let Some(count) = capture_count(&TESTS_FAILED, line) {
            summary.failed = count;
            summary.failed_names.clear();
            while index < lines.len() {
                let next = lines[index].as_ref();
                if TESTS_FAILED.is_match(next) {
                    break;
                }
                let Some(caps) = FAILED_CASE.captures(next) else {
                    break;
                };
                summary.failed_names.push(caps[1].trim_end().to_string());
                index += 1;
            }
        }
    }

    summary
}

fn capture_count(regex: &Regex, line: &str) -> Option<usize> {
    regex
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Returns `true` if `name` carries the flaky marker.
pub fn is_flaky(name: &str) -> bool {
    name.contains(FLAKY_MARKER)
}

/// Strips parameter annotations (`Suite.Case, where GetParam() = 3`).
pub fn bare_case_name(name: &str) -> &str {
    name.split(',').next().unwrap_or(name).trim()
}

/// Which cases of a target a run selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseSelection {
    /// Every case, with the given exclusions.
    Exclude(Vec<String>),
    /// A single case.
    Only(String),
}

impl CaseSelection {
    /// The `--gtest_filter` value, or `None` when no filter is needed.
    pub fn filter_expression(&self) -> Option<String> {
        match self {
            CaseSelection::Exclude(excluded) if excluded.is_empty() => None,
            CaseSelection::Exclude(excluded) => Some(format!("-{}", excluded.join(":"))),
            CaseSelection::Only(name) => Some(name.clone()),
        }
    }
}

/// Inputs for [`compose_args`].
#[derive(Debug, Clone)]
pub struct GtestInvocation<'a> {
    /// Cases to run.
    pub selection: CaseSelection,
    /// 0-based gtest shard index and shard count.
    pub shard: Option<(usize, usize)>,
    /// Where the binary writes its result XML.
    pub xml_output: Option<String>,
    /// Caller-supplied parameters, passed positionally.
    pub target_params: &'a [String],
    /// List the cases instead of running them.
    pub list_only: bool,
}

/// Builds the argv passed to a gtest binary.
pub fn compose_args(invocation: &GtestInvocation<'_>) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(filter) = invocation.selection.filter_expression() {
        args.push(format!("--gtest_filter={}", filter));
    }

    if let Some((index, total)) = invocation.shard {
        args.push(format!("--gtest_shard_index={}", index));
        args.push(format!("--gtest_total_shards={}", total));
    }

    if let Some(path) = &invocation.xml_output {
        args.push(format!("--gtest_output=xml:{}", path));
    }

    args.push("--gtest_color=no".to_string());
    args.extend(invocation.target_params.iter().cloned());

    if invocation.list_only {
        args.push("--gtest_list_tests".to_string());
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_passing_run() {
        let lines = [
            "[==========] 3 tests from 1 test suites ran. (5 ms total)",
            "[  PASSED  ] 3 tests.",
        ];
        let summary = parse_results(&lines);
        assert_eq!(
            summary,
            GtestSummary {
                total: 3,
                passed: 3,
                failed: 0,
                failed_names: vec![],
            }
        );
    }

    #[test]
    fn test_parse_failing_run() {
        let lines = [
            "[ RUN      ] Suite.CaseA",
            "[  FAILED  ] Suite.CaseA (1 ms)",
            "[==========] 2 tests from 1 test suites ran. (4 ms total)",
            "[  PASSED  ] 1 test.",
            "[  FAILED  ] 1 test, listed below:",
            "[  FAILED  ] Suite.CaseA",
            "",
            " 1 FAILED TEST",
        ];
        let summary = parse_results(&lines);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failed_names, vec!["Suite.CaseA"]);
    }

    #[test]
    fn test_parse_without_summary() {
        let lines = ["Segmentation fault", ""];
        assert_eq!(parse_results(&lines), GtestSummary::default());
    }

    #[test]
    fn test_parse_singular_and_old_wording() {
        let lines = [
            "[==========] 1 test from 1 test case ran. (0 ms total)",
            "[  PASSED  ] 1 test.",
        ];
        let summary = parse_results(&lines);
        assert_eq!(summary.total, 1);
        assert_eq!(summary.passed, 1);
    }

    #[test]
    fn test_flaky_classification() {
        let summary = GtestSummary {
            total: 3,
            passed: 1,
            failed: 2,
            failed_names: vec![
                "Net.FLAKY_Connect, where GetParam() = 2".to_string(),
                "Net.Resolve".to_string(),
            ],
        };
        let flaky: Vec<_> = summary.flaky_failures().collect();
        assert_eq!(flaky, vec!["Net.FLAKY_Connect, where GetParam() = 2"]);
        assert_eq!(summary.hard_failures(), 1);
        assert_eq!(bare_case_name(flaky[0]), "Net.FLAKY_Connect");
    }

    #[test]
    fn test_compose_args_order() {
        let params = vec!["--enable_foo".to_string()];
        let args = compose_args(&GtestInvocation {
            selection: CaseSelection::Exclude(vec!["A.B".into(), "C.D".into()]),
            shard: Some((1, 4)),
            xml_output: Some("/tmp/nplb.xml".into()),
            target_params: &params,
            list_only: true,
        });
        assert_eq!(
            args,
            vec![
                "--gtest_filter=-A.B:C.D",
                "--gtest_shard_index=1",
                "--gtest_total_shards=4",
                "--gtest_output=xml:/tmp/nplb.xml",
                "--gtest_color=no",
                "--enable_foo",
                "--gtest_list_tests",
            ]
        );
    }

    #[test]
    fn test_compose_args_minimal() {
        let args = compose_args(&GtestInvocation {
            selection: CaseSelection::Exclude(vec![]),
            shard: None,
            xml_output: None,
            target_params: &[],
            list_only: false,
        });
        assert_eq!(args, vec!["--gtest_color=no"]);

        let args = compose_args(&GtestInvocation {
            selection: CaseSelection::Only("Suite.Case".into()),
            shard: None,
            xml_output: None,
            target_params: &[],
            list_only: false,
        });
        assert_eq!(args[0], "--gtest_filter=Suite.Case");
    }
}
