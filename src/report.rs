//! Run summaries.
//!
//! The console summary is written to the run's sink after the last target,
//! and [`junit`] renders the same results as JUnit XML for CI systems.
//!
//! ```text
//! nplb: FAILED
//!   TESTS RUN: 12
//!   TESTS PASSED: 11
//!   TESTS FAILED: 1
//!   TESTS FLAKED: 0
//!   TESTS FILTERED: 2
//!   FAILED TESTS:
//!     SbSocketTest.SunnyDay
//! ```

pub mod junit;

pub use junit::write_junit_report;

use std::fmt::Write as _;

use console::Style;

use crate::executor::{RunSummary, TargetResult};
use crate::sink::OutputSink;

/// Printed for a failed target with no parsed summary.
pub const RESULTS_NOT_AVAILABLE: &str = "Results not available. Did the test crash?";

struct Palette {
    ok: Style,
    bad: Style,
    warn: Style,
    bold: Style,
}

impl Palette {
    fn new(styled: bool) -> Self {
        let base = Style::new().force_styling(styled);
        Self {
            ok: base.clone().green().bold(),
            bad: base.clone().red().bold(),
            warn: base.clone().yellow(),
            bold: base.bold(),
        }
    }
}

fn target_status(result: &TargetResult) -> &'static str {
    if result.succeeded() {
        "SUCCEEDED"
    } else if result.crashed() {
        "FAILED (CRASHED)"
    } else {
        "FAILED"
    }
}

fn write_target(out: &mut String, result: &TargetResult, palette: &Palette) {
    let status = target_status(result);
    let style = if result.succeeded() {
        &palette.ok
    } else {
        &palette.bad
    };
    let _ = writeln!(out, "{}: {}", result.target, style.apply_to(status));

    if result.results_missing() {
        let _ = writeln!(out, "  {}", palette.bad.apply_to(RESULTS_NOT_AVAILABLE));
        return;
    }

    let _ = writeln!(out, "  TESTS RUN: {}", result.summary.total);
    let _ = writeln!(out, "  TESTS PASSED: {}", result.passed());
    let _ = writeln!(out, "  TESTS FAILED: {}", result.failed());
    let _ = writeln!(out, "  TESTS FLAKED: {}", result.flaked());
    let _ = writeln!(out, "  TESTS FILTERED: {}", result.filtered.len());

    let hard: Vec<&str> = result.hard_failures().collect();
    if !hard.is_empty() {
        let _ = writeln!(out, "  FAILED TESTS:");
        for name in hard {
            let _ = writeln!(out, "    {}", name);
        }
    }
    if !result.flaky_failed.is_empty() {
        let _ = writeln!(out, "  FLAKY TESTS FAILED ON EVERY RETRY:");
        for name in &result.flaky_failed {
            let _ = writeln!(out, "    {}", palette.bad.apply_to(name));
        }
    }
    if !result.flaky_passed.is_empty() {
        let _ = writeln!(out, "  FLAKY TESTS PASSED ON RETRY:");
        for name in &result.flaky_passed {
            let _ = writeln!(out, "    {}", palette.warn.apply_to(name));
        }
    }
    if result.return_code != 0 {
        let _ = writeln!(out, "  RETURN CODE: {}", result.return_code);
    }
}

/// Renders the end-of-run summary.
pub fn format_summary(summary: &RunSummary, styled: bool) -> String {
    let palette = Palette::new(styled);
    let mut out = String::new();

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{}",
        palette
            .bold
            .apply_to(format!("TEST RUN COMPLETE: {} {}", summary.platform, summary.config))
    );

    if summary.testing_disabled {
        let _ = writeln!(out, "Testing is disabled for {}.", summary.platform);
        return out;
    }

    for result in &summary.results {
        let _ = writeln!(out);
        write_target(&mut out, result, &palette);
    }

    if !summary.skipped.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "SKIPPED (OTHER SHARDS): {}", summary.skipped.join(", "));
    }

    let total: usize = summary.results.iter().map(|r| r.summary.total).sum();
    let passed: usize = summary.results.iter().map(TargetResult::passed).sum();
    let failed: usize = summary.results.iter().map(TargetResult::failed).sum();
    let flaked: usize = summary.results.iter().map(TargetResult::flaked).sum();
    let filtered: usize = summary.results.iter().map(|r| r.filtered.len()).sum();

    let _ = writeln!(out);
    let _ = writeln!(out, "TOTAL TESTS RUN: {}", total);
    let _ = writeln!(out, "TOTAL TESTS PASSED: {}", passed);
    let _ = writeln!(out, "TOTAL TESTS FAILED: {}", failed);
    let _ = writeln!(out, "TOTAL TESTS FLAKED: {}", flaked);
    let _ = writeln!(out, "TOTAL TESTS FILTERED: {}", filtered);
    let _ = writeln!(
        out,
        "DURATION: {:.1}s",
        summary.duration.as_secs_f64()
    );

    let _ = writeln!(out);
    if summary.interrupted {
        let _ = writeln!(out, "{}", palette.bad.apply_to("RUN INTERRUPTED"));
    }
    let failed_targets = summary.failed_targets();
    if summary.succeeded() {
        let _ = writeln!(out, "{}", palette.ok.apply_to("SUCCEEDED"));
    } else if !failed_targets.is_empty() {
        let _ = writeln!(
            out,
            "{} {}",
            palette.bad.apply_to("FAILED TARGETS:"),
            failed_targets.join(", ")
        );
    }
    out
}

/// Writes the end-of-run summary to `output`.
pub async fn write_summary(summary: &RunSummary, output: &OutputSink, styled: bool) {
    let _ = output
        .write_all(format_summary(summary, styled).as_bytes())
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ReturnCodeStatus;
    use crate::gtest::GtestSummary;
    use std::time::Duration;

    fn target(name: &str, return_code: i32, summary: GtestSummary) -> TargetResult {
        TargetResult {
            target: name.to_string(),
            status: ReturnCodeStatus::Ok,
            return_code,
            summary,
            filtered: vec![],
            flaky_passed: vec![],
            flaky_failed: vec![],
            duration: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_summary_statuses() {
        let mut passing = target(
            "nplb",
            0,
            GtestSummary {
                total: 3,
                passed: 3,
                ..GtestSummary::default()
            },
        );
        passing.filtered = vec!["A.B".into()];

        let failing = target(
            "base_unittests",
            1,
            GtestSummary {
                total: 2,
                passed: 1,
                failed: 1,
                failed_names: vec!["Suite.Broken".into()],
            },
        );
        let crashed = target("renderer_test", 139, GtestSummary::default());

        let summary = RunSummary {
            platform: "linux-x64x11".into(),
            config: "devel".into(),
            results: vec![passing, failing, crashed],
            ..RunSummary::default()
        };
        let text = format_summary(&summary, false);

        assert!(text.contains("nplb: SUCCEEDED\n"));
        assert!(text.contains("  TESTS FILTERED: 1\n"));
        assert!(text.contains("base_unittests: FAILED\n"));
        assert!(text.contains("  FAILED TESTS:\n    Suite.Broken\n"));
        assert!(text.contains("renderer_test: FAILED (CRASHED)\n"));
        assert!(text.contains(RESULTS_NOT_AVAILABLE));
        assert!(text.contains("TOTAL TESTS RUN: 5\n"));
        assert!(text.contains("FAILED TARGETS: base_unittests, renderer_test\n"));
        assert!(!text.contains('\x1b'));
    }

    #[test]
    fn test_disabled_summary() {
        let summary = RunSummary {
            platform: "raspi-2".into(),
            config: "devel".into(),
            testing_disabled: true,
            ..RunSummary::default()
        };
        let text = format_summary(&summary, false);
        assert!(text.contains("Testing is disabled for raspi-2."));
        assert!(!text.contains("TOTAL"));
    }
}
