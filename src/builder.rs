//! Builds test targets before a run.
//!
//! The configured build tool (`ninja` unless `[runner] build_command` says
//! otherwise) is invoked once for every resolved target:
//!
//! ```text
//! ninja -C <out_directory> <targets...> $TEST_RUNNER_BUILD_FLAGS <ninja_flags...> $TEST_RUNNER_PLATFORM_BUILD_FLAGS
//! ```
//!
//! Build output goes straight to the terminal.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::launcher::Command;

/// Extra flags appended after the targets.
pub const BUILD_FLAGS_ENV: &str = "TEST_RUNNER_BUILD_FLAGS";

/// Extra flags appended last.
pub const PLATFORM_BUILD_FLAGS_ENV: &str = "TEST_RUNNER_PLATFORM_BUILD_FLAGS";

/// Runs the build for `targets`. A failed build is an error.
pub async fn build_all_targets(
    build_command: &[String],
    out_directory: &Path,
    targets: &[String],
    ninja_flags: &[String],
    dry_run: bool,
) -> Result<()> {
    let build_flags = env_flags(BUILD_FLAGS_ENV)?;
    let platform_flags = env_flags(PLATFORM_BUILD_FLAGS_ENV)?;
    let cmd = build_command_line(
        build_command,
        out_directory,
        targets,
        &build_flags,
        ninja_flags,
        &platform_flags,
    )?;

    if dry_run {
        info!("Would build: {}", cmd.to_shell_string());
        return Ok(());
    }

    info!("Building: {}", cmd.to_shell_string());
    let mut process = cmd.to_process();
    process.stdin(Stdio::null());
    let status = process
        .status()
        .await
        .with_context(|| format!("Failed to start build tool `{}`", cmd.program))?;

    if !status.success() {
        bail!(
            "Build failed with {}: {}",
            status
                .code()
                .map_or_else(|| "a signal".to_string(), |c| format!("exit code {}", c)),
            cmd.to_shell_string()
        );
    }
    Ok(())
}

/// Assembles the build invocation.
pub fn build_command_line(
    build_command: &[String],
    out_directory: &Path,
    targets: &[String],
    build_flags: &[String],
    ninja_flags: &[String],
    platform_flags: &[String],
) -> Result<Command> {
    let Some((program, base_args)) = build_command.split_first() else {
        bail!("build_command is empty");
    };

    Ok(Command::new(program.as_str())
        .args(base_args.iter().map(String::as_str))
        .arg("-C")
        .arg(out_directory.to_string_lossy())
        .args(targets.iter().map(String::as_str))
        .args(build_flags.iter().map(String::as_str))
        .args(ninja_flags.iter().map(String::as_str))
        .args(platform_flags.iter().map(String::as_str)))
}

fn env_flags(name: &str) -> Result<Vec<String>> {
    match std::env::var(name) {
        Ok(value) => shell_words::split(&value).with_context(|| format!("Invalid ${}", name)),
        Err(_) => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_command_line_order() {
        let cmd = build_command_line(
            &strings(&["ninja"]),
            Path::new("out/linux-x64x11_devel"),
            &strings(&["nplb", "base_unittests"]),
            &strings(&["-j", "8"]),
            &strings(&["-k", "0"]),
            &strings(&["-v"]),
        )
        .unwrap();

        assert_eq!(cmd.program, "ninja");
        assert_eq!(
            cmd.args,
            strings(&[
                "-C",
                "out/linux-x64x11_devel",
                "nplb",
                "base_unittests",
                "-j",
                "8",
                "-k",
                "0",
                "-v"
            ])
        );
    }

    #[test]
    fn test_wrapped_build_tool() {
        let cmd = build_command_line(
            &strings(&["autoninja", "--quiet"]),
            Path::new("out"),
            &strings(&["nplb"]),
            &[],
            &[],
            &[],
        )
        .unwrap();
        assert_eq!(cmd.to_shell_string(), "autoninja --quiet -C out nplb");
    }

    #[test]
    fn test_empty_build_command() {
        assert!(build_command_line(&[], Path::new("out"), &[], &[], &[], &[]).is_err());
    }

    #[tokio::test]
    async fn test_dry_run_does_not_spawn() {
        let command = strings(&["definitely-not-a-build-tool"]);
        build_all_targets(&command, Path::new("out"), &strings(&["nplb"]), &[], true)
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_build_is_error() {
        // `false -C out nplb` exits 1 regardless of its arguments.
        let err = build_all_targets(&strings(&["false"]), Path::new("out"), &strings(&["nplb"]), &[], false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Build failed with exit code 1"));

        build_all_targets(&strings(&["true"]), Path::new("out"), &strings(&["nplb"]), &[], false)
            .await
            .unwrap();
    }
}
