//! testlauncher CLI - cross-platform gtest runner.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use testlauncher::config;
use testlauncher::coverage;
use testlauncher::executor::{RunnerOptions, TestRunner, check_platform};
use testlauncher::launcher::LauncherArgs;
use testlauncher::report;
use testlauncher::sink::OutputSink;

#[derive(Parser)]
#[command(name = "testlauncher")]
#[command(about = "Builds, deploys and runs gtest targets on a platform", long_about = None)]
#[command(version)]
struct Cli {
    /// Platform to test
    #[arg(short, long)]
    platform: String,

    /// Build configuration (devel, debug, qa, gold)
    #[arg(short, long, default_value = "devel")]
    config: String,

    /// Device serial, address or hostname
    #[arg(short, long = "device_id", default_value = "")]
    device_id: String,

    /// Run only this target (repeatable)
    #[arg(short = 't', long = "target_name")]
    target_name: Vec<String>,

    /// Extra parameters passed to every target
    #[arg(long = "target_params", default_value = "")]
    target_params: String,

    /// Build output directory [default: out/<platform>_<config>]
    #[arg(short, long = "out_directory")]
    out_directory: Option<PathBuf>,

    /// Build the targets before running them
    #[arg(short, long)]
    build: bool,

    /// Run the targets (default when neither --build nor --run is given)
    #[arg(short, long)]
    run: bool,

    /// Print what would run without running it
    #[arg(short = 'n', long = "dry_run")]
    dry_run: bool,

    /// Skip the application's targets
    #[arg(long = "platform_tests_only")]
    platform_tests_only: bool,

    /// Application whose targets and filters are added
    #[arg(short = 'a', long = "application_name")]
    application_name: Option<String>,

    /// Directory receiving each target's result XML
    #[arg(short = 'x', long = "xml_output_dir")]
    xml_output_dir: Option<PathBuf>,

    /// Write result XML to the device's output path
    #[arg(short = 'l', long = "log_xml_results")]
    log_xml_results: bool,

    /// Shard index from the sharding configuration
    #[arg(short = 's', long = "shard_index")]
    shard_index: Option<usize>,

    /// Launcher flags (noinstall, systools, key=value; repeatable)
    #[arg(short = 'w', long = "launcher_args")]
    launcher_args: Vec<String>,

    /// Directory receiving <target>.profraw coverage files
    #[arg(long = "coverage_dir")]
    coverage_dir: Option<PathBuf>,

    /// Merge the coverage files and write a report after the run
    #[arg(long = "coverage_report", requires = "coverage_dir")]
    coverage_report: bool,

    /// Platform of the loader the targets run under
    #[arg(long = "loader_platform")]
    loader_platform: Option<String>,

    /// Build configuration of the loader
    #[arg(long = "loader_config", requires = "loader_platform")]
    loader_config: Option<String>,

    /// Extra flags passed to the build tool
    #[arg(long = "ninja_flags", default_value = "")]
    ninja_flags: String,

    /// JUnit XML output path
    #[arg(long)]
    junit: Option<PathBuf>,

    /// Runner configuration file
    #[arg(long = "config_file", default_value = "testlauncher.toml")]
    config_file: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging. RUST_LOG takes precedence over --verbose.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config = config::load_config(&cli.config_file)
        .with_context(|| format!("Failed to load config from {}", cli.config_file.display()))?;
    info!("Loaded configuration from {}", cli.config_file.display());
    check_platform(&config, &cli.platform)?;

    let out_directory = cli
        .out_directory
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("out/{}_{}", cli.platform, cli.config)));
    // Launchers start binaries from inside the out directory.
    let out_directory = std::path::absolute(&out_directory)
        .with_context(|| format!("Invalid out directory {}", out_directory.display()))?;
    let target_params =
        shell_words::split(&cli.target_params).context("Invalid --target_params")?;
    let ninja_flags = shell_words::split(&cli.ninja_flags).context("Invalid --ninja_flags")?;

    let mut launcher_args = LauncherArgs::parse(&cli.launcher_args);
    launcher_args.dryrun |= cli.dry_run;

    let options = RunnerOptions {
        platform: cli.platform.clone(),
        config: cli.config.clone(),
        loader_platform: cli.loader_platform.clone(),
        loader_config: cli.loader_config.clone(),
        device_id: cli.device_id.clone(),
        specified_targets: cli.target_name.clone(),
        target_params,
        out_directory: out_directory.clone(),
        platform_tests_only: cli.platform_tests_only,
        application_name: cli.application_name.clone(),
        dry_run: cli.dry_run,
        xml_output_dir: cli.xml_output_dir.clone(),
        log_xml_results: cli.log_xml_results,
        shard_index: cli.shard_index,
        launcher_args,
        coverage_directory: cli.coverage_dir.clone(),
    };

    let output = OutputSink::stdout();
    let runner = Arc::new(TestRunner::new(&config, options, output.clone())?);

    let run_tests = cli.run || !cli.build;

    if cli.build {
        runner.build_all_targets(&ninja_flags).await?;
        if !run_tests {
            return Ok(0);
        }
    }

    if let Some(dir) = &cli.coverage_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let interrupt = {
        let runner = runner.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping the current target");
                runner.kill().await;
            }
        })
    };

    let summary = runner.run_all_tests().await;
    interrupt.abort();

    report::write_summary(&summary, &output, console::colors_enabled()).await;

    if let Some(path) = &cli.junit {
        report::write_junit_report(&summary, path)?;
    }

    if cli.coverage_report
        && let Some(dir) = &cli.coverage_dir
    {
        coverage::generate_report(dir, &out_directory, &output, cli.dry_run).await?;
    }

    Ok(summary.exit_code())
}
