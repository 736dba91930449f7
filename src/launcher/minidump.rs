//! Minidump formatting.
//!
//! Crash dumps are formatted by an external printer configured as
//! `runner.minidump_printer`; the dump path is appended to that command and
//! its output is copied into the sink.

use std::path::Path;

use tracing::warn;

use super::{Command, HostCommands};
use crate::sink::OutputSink;

/// Writes a formatted dump to `output`.
///
/// With no printer configured, only the dump location is reported.
pub async fn print_minidump(printer: &[String], dump: &Path, output: &OutputSink) {
    let _ = output
        .write_line(&format!("Minidump found at {}", dump.display()))
        .await;

    let Some((program, args)) = printer.split_first() else {
        return;
    };

    let cmd = Command::new(program)
        .args(args.iter().cloned())
        .arg(dump.to_string_lossy());

    match HostCommands::new(output.clone(), false).exec(&cmd).await {
        Ok(result) => {
            let _ = output.write_all(result.stdout.as_bytes()).await;
            if !result.success() {
                warn!(
                    "Minidump printer exited with {}: {}",
                    result.exit_code,
                    result.stderr.trim()
                );
            }
        }
        Err(e) => warn!("Failed to run minidump printer: {}", e),
    }
}
