//! Test execution engine.
//!
//! The [`TestRunner`] resolves which targets to run on a platform, runs each
//! one through a [`Launcher`], parses the gtest summary out of its output and
//! retries flaky failures.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             TestRunner                               │
//! │  filters ──► targets ──► shard plan ──► run_test(target) per target  │
//! └───────────────────────────────┬──────────────────────────────────────┘
//!                                 │
//!        ┌────────────────────────┴─────────────────────────┐
//!        ▼                                                  ▼
//!  ┌──────────────┐   duplex pipe (write half)   ┌─────────────────┐
//!  │ LauncherTask │ ───────────────────────────► │   LineReader    │ ──► sink
//!  │  Launcher    │                              │ (buffers lines) │
//!  └──────────────┘                              └─────────────────┘
//! ```
//!
//! # Per-target Sequence
//!
//! 1. Open a pipe; its write half becomes the launcher's output
//! 2. Start the [`LineReader`] on the read half, then the [`LauncherTask`]
//! 3. Join the task, close the write half, join the reader
//! 4. Parse the reader's lines with [`gtest::parse_results`]
//!
//! Targets run one at a time, in name order. A target's output is fully
//! drained before the next target is launched.
//!
//! # Flaky Cases
//!
//! Failed cases whose name contains [`FLAKY_MARKER`](crate::gtest::FLAKY_MARKER)
//! are re-run alone, up to [`MAX_FLAKY_ATTEMPTS`] times each. A case that
//! passes any attempt no longer counts as a failure.

pub mod reader;
pub mod task;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::builder;
use crate::config::{Config, EnvMap, LauncherKind};
use crate::filter::{self, TestFilter};
use crate::gtest::{
    self, CaseSelection, GtestInvocation, GtestSummary, MAX_FLAKY_ATTEMPTS, bare_case_name,
};
use crate::launcher::{
    Capabilities, Launcher, LauncherArgs, LauncherContext, LauncherParams, create_launcher,
    resolve_device_output_path,
};
use crate::sharding::{ShardingConfig, TestRunConfig};
use crate::sink::OutputSink;

pub use reader::LineReader;
pub use task::{LauncherTask, ReturnCodeStatus};

/// Extra parameters every Android target receives.
const ANDROID_TARGET_PARAMS: [&str; 2] = ["--android_log_sleep_time=1000", "--disable_sign_in"];

/// Capacity of the pipe between a launcher and its line reader.
const PIPE_CAPACITY: usize = 64 * 1024;

/// What to run and how.
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    /// Platform to test.
    pub platform: String,
    /// Build configuration, e.g. `devel`.
    pub config: String,
    /// Platform hosting this platform's image.
    pub loader_platform: Option<String>,
    /// Build configuration of the loader.
    pub loader_config: Option<String>,
    /// Device address.
    pub device_id: String,
    /// Targets to run. Empty runs every known target.
    pub specified_targets: Vec<String>,
    /// Parameters for every target.
    pub target_params: Vec<String>,
    /// Build output directory.
    pub out_directory: PathBuf,
    /// Skip the application's targets.
    pub platform_tests_only: bool,
    /// Application whose targets and filters are added.
    pub application_name: Option<String>,
    /// List cases instead of running them.
    pub dry_run: bool,
    /// Directory receiving `<target>.xml` result files.
    pub xml_output_dir: Option<PathBuf>,
    /// Have targets write result XML on the device.
    pub log_xml_results: bool,
    /// Shard to run.
    pub shard_index: Option<usize>,
    /// `-w` launcher flags.
    pub launcher_args: LauncherArgs,
    /// Directory receiving `<target>.profraw` coverage files.
    pub coverage_directory: Option<PathBuf>,
}

/// Outcome of one target, retries included.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetResult {
    /// Target name.
    pub target: String,
    /// How the return code was obtained.
    pub status: ReturnCodeStatus,
    /// The initial run's return code.
    pub return_code: i32,
    /// Parsed gtest summary of the initial run.
    pub summary: GtestSummary,
    /// Cases excluded by filters.
    pub filtered: Vec<String>,
    /// Flaky cases that passed a retry.
    pub flaky_passed: Vec<String>,
    /// Flaky cases that failed every retry.
    pub flaky_failed: Vec<String>,
    /// Wall-clock time of the initial run.
    pub duration: Duration,
}

impl TargetResult {
    fn new(target: &str, filtered: Vec<String>) -> Self {
        Self {
            target: target.to_string(),
            status: ReturnCodeStatus::NotStarted,
            return_code: 0,
            summary: GtestSummary::default(),
            filtered,
            flaky_passed: Vec::new(),
            flaky_failed: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Failed cases without the flaky marker.
    pub fn hard_failures(&self) -> impl Iterator<Item = &str> {
        self.summary
            .failed_names
            .iter()
            .map(String::as_str)
            .filter(|name| !gtest::is_flaky(name))
    }

    /// Cases counted as passed, recovered flaky cases included.
    pub fn passed(&self) -> usize {
        self.summary.passed + self.flaky_passed.len()
    }

    /// Cases counted as failed after retries.
    pub fn failed(&self) -> usize {
        self.summary.hard_failures() + self.flaky_failed.len()
    }

    /// Flaky cases that failed the initial run.
    pub fn flaked(&self) -> usize {
        self.flaky_passed.len() + self.flaky_failed.len()
    }

    /// Non-zero exit other than a plain test failure, with no failed cases.
    pub fn crashed(&self) -> bool {
        self.return_code != 0 && self.return_code != 1 && self.summary.failed == 0
    }

    /// Non-zero exit with no parsed summary.
    pub fn results_missing(&self) -> bool {
        self.return_code != 0 && self.summary.total == 0
    }

    /// Whether the target passed, counting recovered flaky cases as passes.
    pub fn succeeded(&self) -> bool {
        if self.status != ReturnCodeStatus::Ok || self.failed() > 0 {
            return false;
        }
        let all_failures_recovered = self.summary.failed > 0
            && self.summary.hard_failures() == 0
            && self.flaky_passed.len() == self.summary.failed_names.len();
        self.return_code == 0 || all_failures_recovered
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Platform that was tested.
    pub platform: String,
    /// Build configuration that was tested.
    pub config: String,
    /// Per-target results, in run order.
    pub results: Vec<TargetResult>,
    /// Targets another shard runs.
    pub skipped: Vec<String>,
    /// Testing is disabled for the platform.
    pub testing_disabled: bool,
    /// The run was interrupted before every target ran.
    pub interrupted: bool,
    /// Wall-clock time of the run.
    pub duration: Duration,
    /// When the run started.
    pub started_at: DateTime<Utc>,
}

impl RunSummary {
    /// Whether every target succeeded.
    pub fn succeeded(&self) -> bool {
        !self.interrupted && self.results.iter().all(TargetResult::succeeded)
    }

    /// Targets that did not succeed.
    pub fn failed_targets(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| r.target.as_str())
            .collect()
    }

    /// Process exit code for the run.
    ///
    /// A single-target run exits with that target's code.
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            return 0;
        }
        match self.results.as_slice() {
            [only] if only.return_code != 0 => only.return_code,
            _ => 1,
        }
    }
}

/// Runs a platform's test targets.
pub struct TestRunner {
    options: RunnerOptions,
    context: LauncherContext,
    output: OutputSink,
    build_command: Vec<String>,
    launcher_kind: LauncherKind,
    targets: BTreeMap<String, Vec<String>>,
    testing_disabled: bool,
    shard_plan: Option<BTreeMap<String, TestRunConfig>>,
    base_env: EnvMap,
    target_env: BTreeMap<String, EnvMap>,
    target_params: Vec<String>,
    current: Mutex<Option<Arc<dyn Launcher>>>,
    interrupted: AtomicBool,
}

impl TestRunner {
    /// Resolves targets, filters, environment and shard plan for `options`.
    ///
    /// Fails if a platform is unknown or the shard configuration is invalid.
    pub fn new(config: &Config, options: RunnerOptions, output: OutputSink) -> Result<Self> {
        let context = LauncherContext::new(config);
        let platform = context.platform(&options.platform)?.clone();

        let loader = match &options.loader_platform {
            Some(name) => Some(context.platform(name)?.clone()),
            None => None,
        };

        let application = if options.platform_tests_only {
            None
        } else {
            options
                .application_name
                .as_deref()
                .and_then(|name| config.applications.get(name))
        };

        let device_platform = options
            .loader_platform
            .as_deref()
            .unwrap_or(&options.platform);
        let launcher_kind = match &loader {
            Some(loader) => loader.launcher_kind(device_platform),
            None => platform.launcher_kind(device_platform),
        };

        // Candidate targets.
        let candidates: Vec<String> = if options.specified_targets.is_empty() {
            let mut all = platform.test_targets.clone();
            if let Some(app) = application {
                for target in &app.test_targets {
                    if !all.contains(target) {
                        all.push(target.clone());
                    }
                }
            }
            all
        } else {
            options.specified_targets.clone()
        };

        // Filters: platform, then application, then the loader's.
        let mut filters = platform.filters.clone();
        if let Some(app) = application {
            filter::merge_filters(&mut filters, &app.filters);
        }
        if let Some(loader) = &loader {
            let loader_config = options.loader_config.as_deref().unwrap_or(&options.config);
            let loader_filters: Vec<TestFilter> = loader
                .filters
                .iter()
                .filter(|f| f.applies_to(loader_config))
                .map(unconditional)
                .collect();
            filter::merge_filters(&mut filters, &loader_filters);
        }

        let resolution = filter::resolve_targets(&candidates, &filters, &options.config);

        // Environment: loader, platform, application; later layers win.
        let mut base_env = EnvMap::new();
        let mut target_env: BTreeMap<String, EnvMap> = BTreeMap::new();
        let layers = [
            loader.as_ref().map(|l| (&l.env, &l.target_env)),
            Some((&platform.env, &platform.target_env)),
            application.map(|a| (&a.env, &a.target_env)),
        ];
        for (env, per_target) in layers.into_iter().flatten() {
            base_env.extend(env.clone());
            for (target, vars) in per_target {
                target_env
                    .entry(target.clone())
                    .or_default()
                    .extend(vars.clone());
            }
        }

        let mut target_params = options.target_params.clone();
        target_params.extend(platform.extra_target_params.iter().cloned());
        if launcher_kind == LauncherKind::Adb {
            target_params.extend(ANDROID_TARGET_PARAMS.iter().map(|p| p.to_string()));
        }

        let shard_plan = match options.shard_index {
            Some(index) => Self::plan_shard(config, &options.platform, &resolution.targets, index)?,
            None => None,
        };

        Ok(Self {
            build_command: config.runner.build_command.clone(),
            context,
            output,
            launcher_kind,
            targets: resolution.targets,
            testing_disabled: resolution.testing_disabled,
            shard_plan,
            base_env,
            target_env,
            target_params,
            current: Mutex::new(None),
            interrupted: AtomicBool::new(false),
            options,
        })
    }

    fn plan_shard(
        config: &Config,
        platform: &str,
        targets: &BTreeMap<String, Vec<String>>,
        shard_index: usize,
    ) -> Result<Option<BTreeMap<String, TestRunConfig>>> {
        let Some(path) = config.sharding_config_path() else {
            warn!("Shard {} requested but no sharding configuration exists, running everything", shard_index);
            return Ok(None);
        };

        let names: Vec<String> = targets.keys().cloned().collect();
        let Some(sharding) = ShardingConfig::load(&path, platform, &names)
            .with_context(|| format!("Invalid sharding configuration {}", path.display()))?
        else {
            warn!("No shards for {} in {}, running everything", platform, path.display());
            return Ok(None);
        };

        let mut plan = BTreeMap::new();
        for name in names {
            let decision = sharding.test_run_config(&name, shard_index)?;
            plan.insert(name, decision);
        }
        Ok(Some(plan))
    }

    /// Targets that will run, with their excluded cases.
    pub fn targets(&self) -> &BTreeMap<String, Vec<String>> {
        &self.targets
    }

    /// Builds every resolved target.
    pub async fn build_all_targets(&self, ninja_flags: &[String]) -> Result<()> {
        let targets: Vec<String> = self.targets.keys().cloned().collect();
        builder::build_all_targets(
            &self.build_command,
            &self.options.out_directory,
            &targets,
            ninja_flags,
            self.options.dry_run,
        )
        .await
    }

    /// What the platform's launcher can do beyond running targets.
    pub async fn launcher_capabilities(&self) -> Result<Capabilities> {
        let mut params = self.launcher_params("", self.target_params.clone(), OutputSink::null());
        params.launcher_args.dryrun = true;
        let launcher = create_launcher(params, &self.context).await?;
        Ok(launcher.capabilities())
    }

    /// Stops the running target and skips the rest.
    pub async fn kill(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(launcher) = current {
            launcher.kill().await;
        }
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    fn set_current(&self, launcher: Option<Arc<dyn Launcher>>) {
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = launcher;
    }

    /// Runs every resolved target and retries flaky failures.
    pub async fn run_all_tests(&self) -> RunSummary {
        let start = Instant::now();
        let mut summary = RunSummary {
            platform: self.options.platform.clone(),
            config: self.options.config.clone(),
            testing_disabled: self.testing_disabled,
            started_at: Utc::now(),
            ..RunSummary::default()
        };

        if self.testing_disabled {
            info!("Testing is disabled for {}", self.options.platform);
            return summary;
        }

        for (target, excluded) in &self.targets {
            if self.is_interrupted() {
                summary.interrupted = true;
                break;
            }

            let shard = match self.shard_plan.as_ref().and_then(|plan| plan.get(target)) {
                Some(TestRunConfig::Skip) => {
                    debug!("{} runs in another shard", target);
                    summary.skipped.push(target.clone());
                    continue;
                }
                Some(TestRunConfig::RunPartial { index, total }) => Some((*index, *total)),
                Some(TestRunConfig::RunFull) | None => None,
            };

            let mut result = self
                .run_test(target, CaseSelection::Exclude(excluded.clone()), shard)
                .await;
            self.retry_flaky(&mut result).await;
            summary.results.push(result);
        }

        summary.interrupted |= self.is_interrupted();
        summary.duration = start.elapsed();
        summary
    }

    async fn retry_flaky(&self, result: &mut TargetResult) {
        if self.options.dry_run {
            return;
        }

        let flaky: Vec<String> = result.summary.flaky_failures().map(String::from).collect();
        for name in flaky {
            let case = bare_case_name(&name).to_string();
            let mut recovered = false;

            for attempt in 1..=MAX_FLAKY_ATTEMPTS {
                if self.is_interrupted() {
                    break;
                }
                info!("Retrying flaky case {} (attempt {})", case, attempt);
                let retry = self
                    .run_test(&result.target, CaseSelection::Only(case.clone()), None)
                    .await;
                if retry.status == ReturnCodeStatus::Ok
                    && retry.return_code == 0
                    && retry.summary.failed == 0
                {
                    recovered = true;
                    break;
                }
            }

            if recovered {
                result.flaky_passed.push(name);
            } else {
                result.flaky_failed.push(name);
            }
        }
    }

    fn launcher_params(
        &self,
        target: &str,
        target_params: Vec<String>,
        output: OutputSink,
    ) -> LauncherParams {
        let mut env = self.base_env.clone();
        if let Some(vars) = self.target_env.get(target) {
            env.extend(vars.clone());
        }

        let mut params = LauncherParams::new(
            &self.options.platform,
            target,
            &self.options.config,
            &self.options.out_directory,
            output,
        );
        params.device_id = self.options.device_id.clone();
        params.target_params = target_params;
        params.env_variables = env;
        params.launcher_args = self.options.launcher_args.clone();
        params.loader_platform = self.options.loader_platform.clone();
        params
    }

    fn compose(
        &self,
        selection: &CaseSelection,
        shard: Option<(usize, usize)>,
        xml_output: Option<String>,
    ) -> Vec<String> {
        gtest::compose_args(&GtestInvocation {
            selection: selection.clone(),
            shard,
            xml_output,
            target_params: &self.target_params,
            list_only: self.options.dry_run,
        })
    }

    /// Runs one target, or one case of it, and parses its output.
    ///
    /// Result XML and coverage are only requested for whole-target runs.
    pub async fn run_test(
        &self,
        target: &str,
        selection: CaseSelection,
        shard: Option<(usize, usize)>,
    ) -> TargetResult {
        let filtered = match &selection {
            CaseSelection::Exclude(excluded) => excluded.clone(),
            CaseSelection::Only(_) => Vec::new(),
        };
        let mut result = TargetResult::new(target, filtered);
        let whole_target = matches!(selection, CaseSelection::Exclude(_));
        let display_name = match &selection {
            CaseSelection::Only(case) => case.clone(),
            CaseSelection::Exclude(_) => target.to_string(),
        };

        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let pipe = OutputSink::new(writer);

        let launcher = match self.prepare_launcher(target, &selection, shard, whole_target, pipe.clone()).await {
            Ok(launcher) => launcher,
            Err(e) => {
                let _ = self
                    .output
                    .write_line(&format!("Error while running {}: {:#}", display_name, e))
                    .await;
                result.status = ReturnCodeStatus::Na;
                result.return_code = 1;
                return result;
            }
        };

        let params = launcher.params();
        let env_vars = params
            .env_variables
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";");
        let _ = self
            .output
            .write_line(&format!(
                "Starting {} ARGS:{} ENV VARS: {}",
                display_name,
                params.target_params.join(" "),
                env_vars
            ))
            .await;

        let start = Instant::now();
        let mut line_reader = LineReader::start(reader, self.output.clone());
        let mut task = LauncherTask::new(launcher.clone());

        self.set_current(Some(launcher));
        task.start();
        task.join().await;
        self.set_current(None);

        if let Err(e) = pipe.close().await {
            debug!("Closing pipe for {}: {}", target, e);
        }
        line_reader.join().await;

        let (status, return_code) = task.return_code();
        result.status = status;
        result.return_code = return_code;
        result.summary = gtest::parse_results(&line_reader.lines());
        result.duration = start.elapsed();

        info!(
            "{} finished with {} in {:.1}s",
            display_name,
            return_code,
            result.duration.as_secs_f64()
        );
        result
    }

    async fn prepare_launcher(
        &self,
        target: &str,
        selection: &CaseSelection,
        shard: Option<(usize, usize)>,
        whole_target: bool,
        pipe: OutputSink,
    ) -> Result<Arc<dyn Launcher>> {
        let mut params = self.launcher_params(target, self.compose(selection, shard, None), pipe);

        if whole_target && let Some(dir) = &self.options.coverage_directory {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            params.coverage_file_path = Some(dir.join(format!("{}.profraw", target)));
        }

        let xml_path = if !whole_target {
            None
        } else if let Some(dir) = &self.options.xml_output_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            Some(dir.join(format!("{}.xml", target)).to_string_lossy().into_owned())
        } else {
            None
        };

        let xml_path = match xml_path {
            Some(path) => Some(path),
            None if whole_target && self.options.log_xml_results => {
                let file_name = format!("{}_testoutput.xml", target);
                Some(match resolve_device_output_path(&params, &self.context)? {
                    Some(dir) => join_device_path(&dir, &file_name),
                    None => file_name,
                })
            }
            None => None,
        };

        if let Some(path) = xml_path {
            params.target_params = self.compose(selection, shard, Some(path.clone()));
            params.test_result_xml_path = Some(path);
        }
        Ok(create_launcher(params, &self.context).await?)
    }

    /// The launcher backend reaching the device.
    pub fn launcher_kind(&self) -> LauncherKind {
        self.launcher_kind
    }
}

/// Strips the config restriction of a filter already matched by config.
fn unconditional(filter: &TestFilter) -> TestFilter {
    match filter {
        TestFilter::Exclude { target, test, .. } => TestFilter::exclude(target, test),
        other => other.clone(),
    }
}

fn join_device_path(dir: &str, file_name: &str) -> String {
    if dir.ends_with('/') || dir.ends_with('\\') {
        format!("{}{}", dir, file_name)
    } else if dir.contains('\\') {
        format!("{}\\{}", dir, file_name)
    } else {
        format!("{}/{}", dir, file_name)
    }
}

/// Validates a run before it starts. Fails for an unknown platform.
pub fn check_platform(config: &Config, platform: &str) -> Result<()> {
    if !config.platforms.contains_key(platform) {
        bail!(
            "Unknown platform: {} (known: {})",
            platform,
            config
                .platforms
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;

    fn result(return_code: i32, summary: GtestSummary) -> TargetResult {
        TargetResult {
            status: ReturnCodeStatus::Ok,
            return_code,
            summary,
            ..TargetResult::new("nplb", vec![])
        }
    }

    fn failing(names: &[&str]) -> GtestSummary {
        GtestSummary {
            total: names.len() + 1,
            passed: 1,
            failed: names.len(),
            failed_names: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    fn options(platform: &str) -> RunnerOptions {
        RunnerOptions {
            platform: platform.to_string(),
            config: "devel".to_string(),
            out_directory: PathBuf::from("/out"),
            ..RunnerOptions::default()
        }
    }

    #[test]
    fn test_target_status() {
        assert!(result(0, GtestSummary::default()).succeeded());

        let crash = result(139, GtestSummary::default());
        assert!(!crash.succeeded());
        assert!(crash.crashed());
        assert!(crash.results_missing());

        let failed = result(1, failing(&["A.B"]));
        assert!(!failed.succeeded());
        assert!(!failed.crashed());

        let mut flaky = result(1, failing(&["A.FLAKY_B"]));
        assert!(!flaky.succeeded());
        flaky.flaky_passed.push("A.FLAKY_B".into());
        assert!(flaky.succeeded());
        assert_eq!(flaky.passed(), 2);
        assert_eq!(flaky.flaked(), 1);

        let mut mixed = result(1, failing(&["A.FLAKY_B", "A.C"]));
        mixed.flaky_passed.push("A.FLAKY_B".into());
        assert!(!mixed.succeeded());
        assert_eq!(mixed.hard_failures().collect::<Vec<_>>(), vec!["A.C"]);
    }

    #[test]
    fn test_single_target_exit_code() {
        let mut summary = RunSummary::default();
        summary.results.push(result(139, GtestSummary::default()));
        assert_eq!(summary.exit_code(), 139);

        summary.results.push(result(0, GtestSummary::default()));
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.failed_targets(), vec!["nplb"]);
    }

    #[test]
    fn test_resolution_merges_application_and_loader() {
        let config = load_config_str(
            r#"
            [platforms.evergreen-arm]
            test_targets = ["nplb", "base_unittests"]
            env = { A = "platform" }
            filters = [{ target = "nplb", test = "Sb.Slow" }]

            [platforms.android-arm]
            env = { A = "loader", B = "loader" }
            filters = [
                { target = "nplb", test = "Sb.Android", config = "gold" },
                { target = "nplb", test = "Sb.Devel", config = "devel" },
            ]

            [applications.cobalt]
            test_targets = ["renderer_test"]
            target_env.nplb = { C = "app" }
            filters = [{ target = "renderer_test", test = "*" }]
            "#,
        )
        .unwrap();

        let runner_options = RunnerOptions {
            loader_platform: Some("android-arm".into()),
            loader_config: Some("devel".into()),
            application_name: Some("cobalt".into()),
            ..options("evergreen-arm")
        };
        let runner = TestRunner::new(&config, runner_options, OutputSink::null()).unwrap();

        assert_eq!(runner.launcher_kind(), LauncherKind::Adb);
        assert_eq!(
            runner.targets().keys().collect::<Vec<_>>(),
            vec!["base_unittests", "nplb"]
        );
        assert_eq!(runner.targets()["nplb"], vec!["Sb.Slow", "Sb.Devel"]);

        let params = runner.launcher_params("nplb", vec![], OutputSink::null());
        assert_eq!(params.env_variables["A"], "platform");
        assert_eq!(params.env_variables["B"], "loader");
        assert_eq!(params.env_variables["C"], "app");
        assert!(
            runner
                .target_params
                .contains(&"--android_log_sleep_time=1000".to_string())
        );
    }

    #[test]
    fn test_platform_tests_only_skips_application() {
        let config = load_config_str(
            r#"
            [platforms.linux-x64x11]
            test_targets = ["nplb"]
            [applications.cobalt]
            test_targets = ["renderer_test"]
            "#,
        )
        .unwrap();

        let with_app = RunnerOptions {
            application_name: Some("cobalt".into()),
            ..options("linux-x64x11")
        };
        let runner = TestRunner::new(&config, with_app.clone(), OutputSink::null()).unwrap();
        assert_eq!(runner.targets().len(), 2);

        let platform_only = RunnerOptions {
            platform_tests_only: true,
            ..with_app
        };
        let runner = TestRunner::new(&config, platform_only, OutputSink::null()).unwrap();
        assert_eq!(runner.targets().keys().collect::<Vec<_>>(), vec!["nplb"]);
    }

    #[test]
    fn test_unknown_platform_and_bad_shard() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("testlauncher.toml");
        std::fs::write(
            &config_path,
            "[platforms.linux-x64x11]\ntest_targets = [\"foo\"]\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("sharding_configuration.json"),
            r#"{ "linux": [ {"foo": "*"} ] }"#,
        )
        .unwrap();
        let config = crate::config::load_config(&config_path).unwrap();

        assert!(TestRunner::new(&config, options("ps5"), OutputSink::null()).is_err());
        assert!(check_platform(&config, "ps5").is_err());

        let out_of_range = RunnerOptions {
            shard_index: Some(5),
            ..options("linux-x64x11")
        };
        assert!(TestRunner::new(&config, out_of_range, OutputSink::null()).is_err());

        let shard_one = RunnerOptions {
            shard_index: Some(1),
            ..options("linux-x64x11")
        };
        let runner = TestRunner::new(&config, shard_one, OutputSink::null()).unwrap();
        assert_eq!(
            runner.shard_plan.as_ref().unwrap()["foo"],
            TestRunConfig::RunFull
        );
    }

    #[tokio::test]
    async fn test_disabled_platform_succeeds_without_running() {
        let config = load_config_str(
            r#"
            [platforms.raspi-2]
            test_targets = ["nplb"]
            filters = [{ sentinel = "DISABLE_TESTING" }]
            "#,
        )
        .unwrap();
        let runner = TestRunner::new(&config, options("raspi-2"), OutputSink::null()).unwrap();
        let summary = runner.run_all_tests().await;
        assert!(summary.testing_disabled);
        assert!(summary.results.is_empty());
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_lists_cases() {
        let config = load_config_str(
            r#"
            [platforms.linux-x64x11]
            test_targets = ["nplb"]
            filters = [{ target = "nplb", test = "A.B" }]
            "#,
        )
        .unwrap();
        let run_options = RunnerOptions {
            dry_run: true,
            launcher_args: LauncherArgs::parse(["dryrun"]),
            target_params: vec!["--verbose".into()],
            ..options("linux-x64x11")
        };
        let (sink, captured) = OutputSink::capture();
        let runner = TestRunner::new(&config, run_options, sink).unwrap();

        let summary = runner.run_all_tests().await;
        assert_eq!(summary.exit_code(), 0);

        let output = captured.contents();
        assert!(output.contains(
            "Starting nplb ARGS:--gtest_filter=-A.B --gtest_color=no --verbose --gtest_list_tests"
        ));
        assert!(output.contains("/out/nplb --gtest_filter=-A.B"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_flaky_case_recovers_on_retry() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("nplb");
        // Fails the flaky case on the whole-target run only.
        std::fs::write(
            &binary,
            r#"#!/bin/sh
case "$1" in
  --gtest_filter=Suite.FLAKY_Case)
    echo "[==========] 1 test from 1 test suite ran. (1 ms total)"
    echo "[  PASSED  ] 1 test."
    exit 0 ;;
esac
echo "[==========] 2 tests from 1 test suite ran. (2 ms total)"
echo "[  PASSED  ] 1 test."
echo "[  FAILED  ] 1 test, listed below:"
echo "[  FAILED  ] Suite.FLAKY_Case"
exit 1
"#,
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = load_config_str("[platforms.linux-x64x11]\ntest_targets = [\"nplb\"]\n")
            .unwrap();
        let run_options = RunnerOptions {
            out_directory: dir.path().to_path_buf(),
            ..options("linux-x64x11")
        };
        let (sink, captured) = OutputSink::capture();
        let runner = TestRunner::new(&config, run_options, sink).unwrap();

        let summary = runner.run_all_tests().await;
        let nplb = &summary.results[0];
        assert_eq!(nplb.return_code, 1);
        assert_eq!(nplb.flaky_passed, vec!["Suite.FLAKY_Case"]);
        assert!(summary.succeeded());
        assert_eq!(summary.exit_code(), 0);
        assert!(captured.contents().contains("Starting Suite.FLAKY_Case ARGS:"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_device_result_path_creates_one_launcher() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let adb = dir.path().join("adb");
        let calls = dir.path().join("calls");
        std::fs::write(
            &adb,
            format!(
                "#!/bin/sh\necho \"$*\" >> '{}'\necho 'List of devices attached'\nprintf 'emulator-5554\\tdevice\\n'\n",
                calls.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&adb, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = load_config_str(&format!(
            "[platforms.android-arm]\ntest_targets = [\"nplb\"]\n[platforms.android-arm.adb]\nadb_path = '{}'\n",
            adb.display()
        ))
        .unwrap();
        let run_options = RunnerOptions {
            log_xml_results: true,
            ..options("android-arm")
        };
        let runner = TestRunner::new(&config, run_options, OutputSink::null()).unwrap();

        let launcher = runner
            .prepare_launcher(
                "nplb",
                &CaseSelection::Exclude(vec![]),
                None,
                true,
                OutputSink::null(),
            )
            .await
            .unwrap();

        let path = "/data/data/dev.cobalt.coat/cache/nplb_testoutput.xml";
        assert_eq!(launcher.params().test_result_xml_path.as_deref(), Some(path));
        assert!(
            launcher
                .params()
                .target_params
                .contains(&format!("--gtest_output=xml:{}", path))
        );
        let calls = std::fs::read_to_string(&calls).unwrap();
        assert_eq!(calls.lines().collect::<Vec<_>>(), vec!["devices"]);
    }

    #[test]
    fn test_join_device_path() {
        assert_eq!(
            join_device_path("/data/data/dev.cobalt.coat/cache/", "nplb_testoutput.xml"),
            "/data/data/dev.cobalt.coat/cache/nplb_testoutput.xml"
        );
        assert_eq!(join_device_path("/tmp", "a.xml"), "/tmp/a.xml");
        assert_eq!(join_device_path("D:\\DevelopmentFiles", "a.xml"), "D:\\DevelopmentFiles\\a.xml");
    }
}
