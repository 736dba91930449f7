//! Coverage reports from collected `.profraw` files.
//!
//! Targets run with `--coverage_dir` write `<coverage_dir>/<target>.profraw`.
//! Report generation is left to the LLVM toolchain:
//!
//! ```text
//! llvm-profdata merge -sparse <dir>/*.profraw -o <dir>/merged.profdata
//! llvm-cov report -instr-profile=<dir>/merged.profdata <out>/<t1> -object <out>/<t2> ...
//! ```
//!
//! The `llvm-cov` output is saved as `<dir>/report.txt`. `LLVM_PROFDATA` and
//! `LLVM_COV` override the tool paths.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use crate::launcher::{Command, HostCommands, LauncherError};
use crate::sink::OutputSink;

/// Name of the merged profile inside the coverage directory.
pub const MERGED_PROFILE: &str = "merged.profdata";

/// Name of the text report inside the coverage directory.
pub const REPORT_FILE: &str = "report.txt";

/// Raw profiles in `dir`, sorted by name.
pub fn collect_profiles(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;

    let mut profiles = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "profraw") {
            profiles.push(path);
        }
    }
    profiles.sort();
    Ok(profiles)
}

/// Merges the profiles in `coverage_dir` and writes a text report.
///
/// Returns the report path, or `None` when there was nothing to report on.
pub async fn generate_report(
    coverage_dir: &Path,
    out_directory: &Path,
    output: &OutputSink,
    dry_run: bool,
) -> Result<Option<PathBuf>> {
    let profiles = collect_profiles(coverage_dir)?;
    if profiles.is_empty() {
        warn!("No coverage profiles in {}", coverage_dir.display());
        return Ok(None);
    }

    let commands = HostCommands::new(output.clone(), dry_run);
    let merged = coverage_dir.join(MERGED_PROFILE);

    let merge = merge_command(&tool("LLVM_PROFDATA", "llvm-profdata"), &profiles, &merged);
    commands.exec_checked(&merge, toolchain_error).await?;

    let objects: Vec<PathBuf> = profiles
        .iter()
        .filter_map(|p| p.file_stem())
        .map(|stem| out_directory.join(stem))
        .collect();
    let report = report_command(&tool("LLVM_COV", "llvm-cov"), &merged, &objects);
    let result = commands.exec_checked(&report, toolchain_error).await?;

    let report_path = coverage_dir.join(REPORT_FILE);
    if !dry_run {
        std::fs::write(&report_path, &result.stdout)
            .with_context(|| format!("Failed to write {}", report_path.display()))?;
        info!("Coverage report written to: {}", report_path.display());
    }
    Ok(Some(report_path))
}

fn toolchain_error(message: String) -> LauncherError {
    LauncherError::Other(anyhow!(message))
}

fn tool(env_var: &str, default: &str) -> String {
    std::env::var(env_var).unwrap_or_else(|_| default.to_string())
}

fn merge_command(program: &str, profiles: &[PathBuf], merged: &Path) -> Command {
    Command::new(program)
        .args(["merge", "-sparse"])
        .args(profiles.iter().map(|p| p.to_string_lossy().into_owned()))
        .arg("-o")
        .arg(merged.to_string_lossy())
}

fn report_command(program: &str, merged: &Path, objects: &[PathBuf]) -> Command {
    let mut cmd = Command::new(program)
        .arg("report")
        .arg(format!("-instr-profile={}", merged.display()));
    for (i, object) in objects.iter().enumerate() {
        if i > 0 {
            cmd = cmd.arg("-object");
        }
        cmd = cmd.arg(object.to_string_lossy());
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_profiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("nplb.profraw"), b"").unwrap();
        std::fs::write(dir.path().join("base_unittests.profraw"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let names: Vec<String> = collect_profiles(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["base_unittests.profraw", "nplb.profraw"]);
    }

    #[test]
    fn test_report_objects() {
        let cmd = report_command(
            "llvm-cov",
            Path::new("/cov/merged.profdata"),
            &[PathBuf::from("/out/a"), PathBuf::from("/out/b")],
        );
        assert_eq!(
            cmd.to_shell_string(),
            "llvm-cov report -instr-profile=/cov/merged.profdata /out/a -object /out/b"
        );
    }

    #[tokio::test]
    async fn test_dry_run_echoes_toolchain() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("nplb.profraw"), b"").unwrap();
        let (sink, captured) = OutputSink::capture();

        let report = generate_report(dir.path(), Path::new("/out"), &sink, true)
            .await
            .unwrap();
        assert_eq!(report, Some(dir.path().join(REPORT_FILE)));

        let echoed = captured.contents();
        assert!(echoed.contains(" merge -sparse "));
        assert!(echoed.contains(" report -instr-profile="));
        assert!(echoed.contains("/out/nplb"));
        assert!(!dir.path().join(REPORT_FILE).exists());
    }

    #[tokio::test]
    async fn test_no_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let report = generate_report(dir.path(), Path::new("/out"), &OutputSink::null(), true)
            .await
            .unwrap();
        assert!(report.is_none());
    }
}
