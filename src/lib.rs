//! testlauncher: cross-platform gtest runner.
//!
//! This crate deploys test binaries to a device, runs them one at a time,
//! streams their output, and turns the gtest summary each binary prints into
//! per-target and overall results.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Launchers**: Deploy and run one target on a device (local process,
//!   ADB, SSH, device portal)
//! - **Executor**: Resolve targets, drive launchers, retry flaky cases
//! - **Sharding**: Split targets and gtest chunks across CI shards
//! - **Report**: Console summary and JUnit XML
//!
//! # Example
//!
//! ```no_run
//! use testlauncher::config::load_config;
//! use testlauncher::executor::{RunnerOptions, TestRunner};
//! use testlauncher::sink::OutputSink;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("testlauncher.toml"))?;
//!     let options = RunnerOptions {
//!         platform: "linux-x64x11".into(),
//!         config: "devel".into(),
//!         out_directory: "out/linux-x64x11_devel".into(),
//!         ..RunnerOptions::default()
//!     };
//!     let runner = TestRunner::new(&config, options, OutputSink::stdout())?;
//!     let summary = runner.run_all_tests().await;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod builder;
pub mod config;
pub mod coverage;
pub mod executor;
pub mod filter;
pub mod gtest;
pub mod launcher;
pub mod report;
pub mod retry;
pub mod sharding;
pub mod sink;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use executor::{RunSummary, RunnerOptions, TargetResult, TestRunner};
pub use launcher::{Launcher, LauncherError, LauncherParams, create_launcher};
pub use sink::OutputSink;
