//! JUnit XML report generation.
//!
//! One `testsuite` per target. Each failed case becomes a `testcase` with a
//! `failure`, and every suite carries a synthetic case named after the
//! target that records the run as a whole, so crashes with no parsed cases
//! still show up in CI dashboards.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="linux-x64x11 devel" tests="3" failures="1" time="1.234" timestamp="2024-05-01T12:00:00">
//!   <testsuite name="nplb" tests="3" failures="1" skipped="0" time="1.234">
//!     <testcase classname="nplb" name="nplb" time="1.234">
//!       <failure message="exit code 1"/>
//!     </testcase>
//!     <testcase classname="nplb.Suite" name="Case">
//!       <failure message="failed"/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};

use crate::executor::{RunSummary, TargetResult};

/// Renders `summary` as JUnit XML.
pub fn generate_xml(summary: &RunSummary) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let tests: usize = summary.results.iter().map(case_count).sum();
    let failures: usize = summary.results.iter().map(failure_count).sum();

    let suite_name = format!("{} {}", summary.platform, summary.config);
    let mut testsuites = BytesStart::new("testsuites");
    testsuites.push_attribute(("name", clean(&suite_name).as_str()));
    testsuites.push_attribute(("tests", tests.to_string().as_str()));
    testsuites.push_attribute(("failures", failures.to_string().as_str()));
    testsuites.push_attribute((
        "time",
        format!("{:.3}", summary.duration.as_secs_f64()).as_str(),
    ));
    testsuites.push_attribute((
        "timestamp",
        summary
            .started_at
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string()
            .as_str(),
    ));
    writer.write_event(Event::Start(testsuites))?;

    for result in &summary.results {
        write_testsuite(&mut writer, result)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

    Ok(String::from_utf8(writer.into_inner())?)
}

/// Writes the report to `path`, creating parent directories.
pub fn write_junit_report(summary: &RunSummary, path: &Path) -> Result<()> {
    let xml = generate_xml(summary)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    std::fs::write(path, xml)
        .with_context(|| format!("Failed to write JUnit XML: {}", path.display()))?;
    tracing::info!("JUnit XML written to: {}", path.display());
    Ok(())
}

fn failed_cases(result: &TargetResult) -> impl Iterator<Item = &str> {
    result
        .hard_failures()
        .chain(result.flaky_failed.iter().map(String::as_str))
}

fn case_count(result: &TargetResult) -> usize {
    1 + failed_cases(result).count()
}

fn failure_count(result: &TargetResult) -> usize {
    usize::from(!result.succeeded()) + failed_cases(result).count()
}

fn write_testsuite<W: std::io::Write>(writer: &mut Writer<W>, result: &TargetResult) -> Result<()> {
    let time = format!("{:.3}", result.duration.as_secs_f64());
    let target = clean(&result.target);

    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", target.as_str()));
    testsuite.push_attribute(("tests", case_count(result).to_string().as_str()));
    testsuite.push_attribute(("failures", failure_count(result).to_string().as_str()));
    testsuite.push_attribute(("skipped", result.filtered.len().to_string().as_str()));
    testsuite.push_attribute(("time", time.as_str()));
    writer.write_event(Event::Start(testsuite))?;

    let mut aggregate = BytesStart::new("testcase");
    aggregate.push_attribute(("classname", target.as_str()));
    aggregate.push_attribute(("name", target.as_str()));
    aggregate.push_attribute(("time", time.as_str()));
    if result.succeeded() {
        writer.write_event(Event::Empty(aggregate))?;
    } else {
        writer.write_event(Event::Start(aggregate))?;
        let message = if result.results_missing() {
            super::RESULTS_NOT_AVAILABLE.to_string()
        } else {
            format!("exit code {}", result.return_code)
        };
        let mut failure = BytesStart::new("failure");
        failure.push_attribute(("message", clean(&message).as_str()));
        writer.write_event(Event::Empty(failure))?;
        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    }

    for name in failed_cases(result) {
        let (suite, case) = split_case_name(name);
        let classname = clean(&format!("{}.{}", result.target, suite));

        let mut testcase = BytesStart::new("testcase");
        testcase.push_attribute(("classname", classname.as_str()));
        testcase.push_attribute(("name", clean(case).as_str()));
        writer.write_event(Event::Start(testcase))?;

        let mut failure = BytesStart::new("failure");
        failure.push_attribute(("message", clean(name).as_str()));
        writer.write_event(Event::Empty(failure))?;
        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

/// Splits `Suite.Case` at the last dot of the bare case name.
fn split_case_name(name: &str) -> (&str, &str) {
    let bare = crate::gtest::bare_case_name(name);
    bare.rsplit_once('.').unwrap_or(("", bare))
}

/// Drops characters that are not allowed in XML. Escaping is left to
/// quick-xml.
fn clean(s: &str) -> String {
    s.chars()
        .filter(|&c| {
            matches!(
                c,
                '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}'
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ReturnCodeStatus;
    use crate::gtest::GtestSummary;
    use std::time::Duration;

    fn summary() -> RunSummary {
        RunSummary {
            platform: "linux-x64x11".into(),
            config: "devel".into(),
            results: vec![TargetResult {
                target: "nplb".into(),
                status: ReturnCodeStatus::Ok,
                return_code: 1,
                summary: GtestSummary {
                    total: 3,
                    passed: 1,
                    failed: 2,
                    failed_names: vec![
                        "SbSocketTest.SunnyDay".into(),
                        "Param/Sb.Case/0, where GetParam() = \"<x>\"".into(),
                    ],
                },
                filtered: vec!["A.B".into()],
                flaky_passed: vec![],
                flaky_failed: vec![],
                duration: Duration::from_millis(1500),
            }],
            ..RunSummary::default()
        }
    }

    #[test]
    fn test_generate_xml() {
        let xml = generate_xml(&summary()).unwrap();
        assert!(xml.contains(r#"<testsuites name="linux-x64x11 devel" tests="3" failures="3""#));
        assert!(xml.contains(r#"<testsuite name="nplb" tests="3" failures="3" skipped="1" time="1.500">"#));
        assert!(xml.contains(r#"<failure message="exit code 1"/>"#));
        assert!(xml.contains(r#"<testcase classname="nplb.SbSocketTest" name="SunnyDay">"#));
        assert!(xml.contains(r#"classname="nplb.Param/Sb" name="Case/0""#));
        assert!(xml.contains("&lt;x&gt;"));
        assert!(xml.contains(r#"timestamp="1970-01-01T00:00:00""#));
    }

    #[test]
    fn test_split_case_name() {
        assert_eq!(split_case_name("Suite.Case"), ("Suite", "Case"));
        assert_eq!(split_case_name("Case"), ("", "Case"));
    }

    #[test]
    fn test_write_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/junit.xml");
        write_junit_report(&summary(), &path).unwrap();
        assert!(std::fs::read_to_string(path).unwrap().starts_with("<?xml"));
    }
}
