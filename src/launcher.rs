//! Launcher contract and backend selection.
//!
//! A [`Launcher`] turns a (platform, target, config, device) tuple into a
//! running test binary on a device, copies the binary's output into an
//! [`OutputSink`], and returns its exit code.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ create_launcher(params, context)                              │
//! │   platform registry lookup ──► LauncherKind                   │
//! └───────────────────────────────┬───────────────────────────────┘
//!                                 │
//!          ┌──────────────┬───────┴──────┬──────────────┐
//!          ▼              ▼              ▼              ▼
//!     LocalLauncher   AdbLauncher   SshLauncher   PortalLauncher
//!     (host process)  (adb + am)    (rsync + ssh) (device portal)
//!
//!   run() ──► exit code      kill() ──► run() returns within a grace period
//! ```
//!
//! # Built-in Launchers
//!
//! | Launcher | Module | Platforms |
//! |----------|--------|-----------|
//! | Local | [`local`] | `linux-*`, `win-*` and other host platforms |
//! | ADB | [`adb`] | `android-*` |
//! | SSH | [`ssh`] | `raspi-*`, `rdk` |
//! | Portal | [`portal`] | `xb1`, `xbox-*` |
//!
//! # Return Codes
//!
//! `run` returns the binary's exit code. A detected crash is reported as
//! [`CRASH_RETURN_CODE`] and a failure before the binary started as `1`,
//! unless the backend surfaces a [`LauncherError`] instead.
//!
//! # Error Handling
//!
//! All launcher operations return [`LauncherResult<T>`]. Errors never cross
//! the [`LauncherTask`](crate::executor::LauncherTask) boundary; the task
//! writes them to the sink and records a failed return code.

pub mod adb;
pub mod local;
pub mod minidump;
pub mod portal;
pub mod ssh;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{Config, EnvMap, LauncherKind, PlatformConfig};
use crate::retry::RetryError;
use crate::sink::OutputSink;

/// Return code reported for a detected application crash.
pub const CRASH_RETURN_CODE: i32 = 11;

/// Line carrying an exit code out of a device log, followed by the code.
pub const APPLICATION_STOPPED: &str = "***Application Stopped***";

/// Marker written to the sink when a crash is detected.
pub const APPLICATION_CRASHED: &str = "***Application Crashed***";

/// Result type for launcher operations.
pub type LauncherResult<T> = Result<T, LauncherError>;

/// Errors that can occur while deploying, running or controlling a target.
#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    /// No backend is registered for the platform.
    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    /// A network backend has neither a device id nor a fallback address.
    #[error("No device address for {platform}; pass --device_id or set {env_var}")]
    MissingDeviceAddress {
        /// Platform being launched.
        platform: String,
        /// Environment variable consulted as a fallback.
        env_var: &'static str,
    },

    /// The binary, package or install tree is missing from the build output.
    #[error("Artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    /// Copying or installing the target failed.
    #[error("Deploy failed: {0}")]
    DeployFailure(String),

    /// The device refused to start the target.
    #[error("Launch failed: {0}")]
    LaunchFailure(String),

    /// A bounded wait exceeded its budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The backend does not implement an optional capability.
    #[error("{launcher} launcher does not support {capability}")]
    UnsupportedCapability {
        /// Backend name.
        launcher: &'static str,
        /// Requested capability.
        capability: &'static str,
    },

    /// A retried operation kept failing.
    #[error("{operation} still failing after {retries} retries")]
    RetriesExceeded {
        /// Configured retry count.
        retries: usize,
        /// Retried operation.
        operation: String,
    },

    /// An operation was abandoned because the launcher was killed.
    #[error("{0} abandoned after kill")]
    Cancelled(String),

    /// I/O error talking to a child process or the filesystem.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Device portal request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Backend-specific error not covered by other variants.
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<RetryError<LauncherError>> for LauncherError {
    fn from(err: RetryError<LauncherError>) -> Self {
        match err {
            RetryError::Inner(e) => e,
            RetryError::RetriesExceeded { retries, operation } => {
                LauncherError::RetriesExceeded { retries, operation }
            }
            RetryError::Aborted { operation } => LauncherError::Cancelled(operation),
        }
    }
}

impl LauncherError {
    /// Transient failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LauncherError::Timeout(_)
                | LauncherError::Io(_)
                | LauncherError::DeployFailure(_)
                | LauncherError::Http(_)
        )
    }
}

/// Awaits `step`, giving up with [`LauncherError::Cancelled`] as soon as
/// `shutdown` fires. A step is never started once `shutdown` has fired.
pub(crate) async fn unless_killed<T, F>(
    shutdown: &CancellationToken,
    operation: &str,
    step: F,
) -> LauncherResult<T>
where
    F: std::future::Future<Output = LauncherResult<T>>,
{
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(LauncherError::Cancelled(operation.to_string())),
        result = step => result,
    }
}

fn unsupported(launcher: &'static str, capability: &'static str) -> LauncherError {
    LauncherError::UnsupportedCapability {
        launcher,
        capability,
    }
}

/// Modal launcher flags passed with `-w`.
///
/// # Example
///
/// ```
/// use testlauncher::launcher::LauncherArgs;
///
/// let args = LauncherArgs::parse(["noinstall", "log_level=verbose"]);
/// assert!(args.noinstall);
/// assert_eq!(args.extra.get("log_level").map(String::as_str), Some("verbose"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LauncherArgs {
    /// Echo every device command instead of running it.
    pub dryrun: bool,
    /// Skip installing the target.
    pub noinstall: bool,
    /// Use the system tools image on devices that have one.
    pub systools: bool,
    /// Any other `key=value` or bare flags.
    pub extra: BTreeMap<String, String>,
}

impl LauncherArgs {
    /// Parses `-w` values. Values may also be comma-separated.
    pub fn parse<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = LauncherArgs::default();
        for value in values {
            for item in value.as_ref().split(',').map(str::trim) {
                match item {
                    "" => {}
                    "dryrun" => args.dryrun = true,
                    "noinstall" => args.noinstall = true,
                    "systools" => args.systools = true,
                    other => {
                        let (key, val) = other.split_once('=').unwrap_or((other, ""));
                        args.extra.insert(key.to_string(), val.to_string());
                    }
                }
            }
        }
        args
    }
}

/// Everything a launcher needs to run one target.
#[derive(Debug, Clone)]
pub struct LauncherParams {
    /// Platform name, e.g. `android-arm` or `linux-x64x11`.
    pub platform: String,
    /// Test binary name.
    pub target_name: String,
    /// Build configuration, e.g. `devel`.
    pub config: String,
    /// Device address. May be empty for local and auto-detected devices.
    pub device_id: String,
    /// Build output directory.
    pub out_directory: PathBuf,
    /// Arguments for the binary, in order.
    pub target_params: Vec<String>,
    /// Environment layered over the process environment.
    pub env_variables: EnvMap,
    /// Receives the binary's output.
    pub output: OutputSink,
    /// `-w` flags.
    pub launcher_args: LauncherArgs,
    /// Where the binary writes its result XML, if anywhere.
    pub test_result_xml_path: Option<String>,
    /// Where the binary writes coverage data, if anywhere.
    pub coverage_file_path: Option<PathBuf>,
    /// Platform hosting this platform's image, if any.
    pub loader_platform: Option<String>,
}

impl LauncherParams {
    /// Parameters with defaults for everything but the identity fields.
    pub fn new(
        platform: impl Into<String>,
        target_name: impl Into<String>,
        config: impl Into<String>,
        out_directory: impl Into<PathBuf>,
        output: OutputSink,
    ) -> Self {
        Self {
            platform: platform.into(),
            target_name: target_name.into(),
            config: config.into(),
            device_id: String::new(),
            out_directory: out_directory.into(),
            target_params: Vec::new(),
            env_variables: EnvMap::new(),
            output,
            launcher_args: LauncherArgs::default(),
            test_result_xml_path: None,
            coverage_file_path: None,
            loader_platform: None,
        }
    }

    /// Platform whose backend reaches the device.
    pub fn device_platform(&self) -> &str {
        self.loader_platform.as_deref().unwrap_or(&self.platform)
    }
}

/// Optional operations a backend supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// [`Launcher::send_suspend`] and [`Launcher::send_resume`].
    pub suspend_resume: bool,
    /// [`Launcher::send_deep_link`].
    pub deep_link: bool,
    /// [`Launcher::create_device_to_host_tunnel`].
    pub device_to_host_tunnel: bool,
}

/// A backend that runs one target on one device.
///
/// Launchers are shared between the task running [`run`](Self::run) and the
/// caller that may [`kill`](Self::kill) it, so every method takes `&self`.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Backend name, for logs and errors.
    fn name(&self) -> &'static str;

    /// Parameters the launcher was created with.
    fn params(&self) -> &LauncherParams;

    /// Optional operations this backend supports.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Deploys (unless disabled), starts and waits for the target.
    ///
    /// Returns the target's exit code, [`CRASH_RETURN_CODE`] on a detected
    /// crash, or the code carried by an [`APPLICATION_STOPPED`] line.
    async fn run(&self) -> LauncherResult<i32>;

    /// Stops a running target. Idempotent; a no-op once `run` has returned.
    async fn kill(&self);

    /// Best-effort address of the device.
    async fn device_ip(&self) -> Option<String>;

    /// A directory on the device the target may write files into.
    fn device_output_path(&self) -> Option<String> {
        None
    }

    /// Whether [`send_suspend`](Self::send_suspend) and
    /// [`send_resume`](Self::send_resume) are available.
    fn supports_suspend_resume(&self) -> bool {
        self.capabilities().suspend_resume
    }

    /// Whether [`send_deep_link`](Self::send_deep_link) is available.
    fn supports_deep_link(&self) -> bool {
        self.capabilities().deep_link
    }

    /// Suspends the running target.
    async fn send_suspend(&self) -> LauncherResult<()> {
        Err(unsupported(self.name(), "system suspend"))
    }

    /// Resumes a suspended target.
    async fn send_resume(&self) -> LauncherResult<()> {
        Err(unsupported(self.name(), "system resume"))
    }

    /// Delivers a deep link to the running target.
    async fn send_deep_link(&self, _url: &str) -> LauncherResult<()> {
        Err(unsupported(self.name(), "deep links"))
    }

    /// Lets the device reach `host_port` on the host through `device_port`.
    async fn create_device_to_host_tunnel(
        &self,
        _host_port: u16,
        _device_port: u16,
    ) -> LauncherResult<bool> {
        Err(unsupported(self.name(), "device-to-host tunnels"))
    }

    /// Removes a tunnel created by
    /// [`create_device_to_host_tunnel`](Self::create_device_to_host_tunnel).
    async fn remove_device_to_host_tunnel(&self, _host_port: u16) -> LauncherResult<()> {
        Err(unsupported(self.name(), "device-to-host tunnels"))
    }
}

/// State shared by every launcher a runner creates.
#[derive(Debug, Clone)]
pub struct LauncherContext {
    registry: Arc<BTreeMap<String, PlatformConfig>>,
    first_run: Arc<AtomicBool>,
    /// Command formatting minidumps; the dump path is appended.
    pub minidump_printer: Vec<String>,
    /// Where dumps fetched from devices are saved.
    pub crashdump_dir: PathBuf,
}

impl LauncherContext {
    /// Context backed by the platforms and runner settings of `config`.
    pub fn new(config: &Config) -> Self {
        Self {
            registry: Arc::new(config.platforms.clone()),
            first_run: Arc::new(AtomicBool::new(true)),
            minidump_printer: config.runner.minidump_printer.clone(),
            crashdump_dir: PathBuf::from(
                shellexpand::tilde(&config.runner.crashdump_dir.to_string_lossy()).into_owned(),
            ),
        }
    }

    /// Looks up a platform in the registry.
    pub fn platform(&self, name: &str) -> LauncherResult<&PlatformConfig> {
        self.registry
            .get(name)
            .ok_or_else(|| LauncherError::UnknownPlatform(name.to_string()))
    }

    /// Returns `true` exactly once per context.
    ///
    /// Backends use it to run one-time device cleanup.
    pub fn take_first_run(&self) -> bool {
        self.first_run.swap(false, Ordering::SeqCst)
    }
}

/// Creates the launcher registered for `params.platform`.
///
/// When a loader platform is set, the loader's backend and settings reach
/// the device. Fails with [`LauncherError::UnknownPlatform`] when the
/// platform is not in the registry.
pub async fn create_launcher(
    params: LauncherParams,
    context: &LauncherContext,
) -> LauncherResult<Arc<dyn Launcher>> {
    context.platform(&params.platform)?;
    let device_platform = params.device_platform().to_string();
    let platform = context.platform(&device_platform)?;
    let kind = platform.launcher_kind(&device_platform);

    debug!(
        "Creating {} launcher for {} on {}",
        kind.as_str(),
        params.target_name,
        device_platform
    );

    let launcher: Arc<dyn Launcher> = match kind {
        LauncherKind::Local => Arc::new(local::LocalLauncher::new(params, platform, context)),
        LauncherKind::Adb => Arc::new(adb::AdbLauncher::new(params, &platform.adb).await?),
        LauncherKind::Ssh => {
            Arc::new(ssh::SshLauncher::new(params, &platform.ssh, context.clone())?)
        }
        LauncherKind::Portal => Arc::new(portal::PortalLauncher::new(
            params,
            &platform.portal,
            context,
        )?),
    };

    Ok(launcher)
}

/// The directory [`Launcher::device_output_path`] reports for `params`,
/// resolved without creating the launcher.
pub fn resolve_device_output_path(
    params: &LauncherParams,
    context: &LauncherContext,
) -> LauncherResult<Option<String>> {
    let device_platform = params.device_platform();
    let platform = context.platform(device_platform)?;
    Ok(match platform.launcher_kind(device_platform) {
        LauncherKind::Local => Some(local::device_output_dir()),
        LauncherKind::Adb => Some(adb::device_output_dir(&platform.adb)),
        LauncherKind::Ssh => Some(ssh::DEVICE_OUTPUT_DIR.to_string()),
        LauncherKind::Portal => None,
    })
}

/// A command to run on the host.
///
/// # Example
///
/// ```
/// use testlauncher::launcher::Command;
///
/// let cmd = Command::new("adb")
///     .args(["-s", "emulator-5554"])
///     .arg("shell")
///     .arg("am force-stop dev.cobalt.coat")
///     .timeout(30);
///
/// assert_eq!(cmd.program, "adb");
/// assert_eq!(
///     cmd.to_shell_string(),
///     "adb -s emulator-5554 shell 'am force-stop dev.cobalt.coat'"
/// );
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory for command execution.
    pub working_dir: Option<PathBuf>,

    /// Environment variables to set for this command.
    pub env: Vec<(String, String)>,

    /// Maximum execution time in seconds.
    pub timeout_secs: Option<u64>,
}

impl Command {
    /// Creates a new command with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout_secs: None,
        }
    }

    /// Adds a single argument to the command.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments to the command.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory for command execution.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable for this command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the execution timeout in seconds.
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Converts the command to a shell-executable string.
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_escape(&self.program)];
        for arg in &self.args {
            parts.push(shell_escape(arg));
        }
        parts.join(" ")
    }

    /// Builds the tokio process command, with no stdio configured.
    pub fn to_process(&self) -> tokio::process::Command {
        let mut process = tokio::process::Command::new(&self.program);
        process.args(&self.args);
        for (key, value) in &self.env {
            process.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            process.current_dir(dir);
        }
        process
    }
}

/// Result of running a [`Command`] to completion.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code of the command. `-1` when killed by a signal.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// Wall-clock time the command took to execute.
    pub duration: Duration,
}

impl ExecResult {
    /// Returns `true` if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn dry_run() -> Self {
        Self {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
        }
    }
}

/// Runs host commands for a launcher, honoring dry-run.
///
/// In dry-run mode every command is echoed to the sink and reported as
/// successful without being executed.
#[derive(Debug, Clone)]
pub struct HostCommands {
    output: OutputSink,
    dry_run: bool,
}

impl HostCommands {
    /// Runner writing echoes to `output`.
    pub fn new(output: OutputSink, dry_run: bool) -> Self {
        Self { output, dry_run }
    }

    /// Whether commands are echoed instead of run.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Echoes `cmd` to the sink if in dry-run mode. Returns `true` if it did.
    pub async fn echo_if_dry_run(&self, cmd: &Command) -> bool {
        if self.dry_run {
            let _ = self.output.write_line(&cmd.to_shell_string()).await;
        }
        self.dry_run
    }

    /// Runs `cmd` to completion and captures its output.
    pub async fn exec(&self, cmd: &Command) -> LauncherResult<ExecResult> {
        if self.echo_if_dry_run(cmd).await {
            return Ok(ExecResult::dry_run());
        }

        debug!("exec: {}", cmd.to_shell_string());
        let start = Instant::now();

        let mut process = cmd.to_process();
        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        let output = if let Some(timeout) = cmd.timeout_secs {
            tokio::time::timeout(Duration::from_secs(timeout), process.output())
                .await
                .map_err(|_| {
                    LauncherError::Timeout(format!(
                        "{} timed out after {}s",
                        cmd.program, timeout
                    ))
                })??
        } else {
            process.output().await?
        };

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        })
    }

    /// Runs `cmd` and fails with `make_err` on a non-zero exit.
    pub async fn exec_checked<F>(&self, cmd: &Command, make_err: F) -> LauncherResult<ExecResult>
    where
        F: FnOnce(String) -> LauncherError,
    {
        let result = self.exec(cmd).await?;
        if result.success() {
            Ok(result)
        } else {
            Err(make_err(format!(
                "`{}` exited with {}: {}",
                cmd.to_shell_string(),
                result.exit_code,
                result.stderr.trim()
            )))
        }
    }
}

/// Escape a string for use in a shell command.
pub fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars().all(|c| {
            c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | ',' | '@' | '+')
        })
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(toml: &str) -> LauncherContext {
        let config = crate::config::load_config_str(toml).unwrap();
        LauncherContext::new(&config)
    }

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("--gtest_filter=-A.B:C.D"), "--gtest_filter=-A.B:C.D");
        assert_eq!(shell_escape("hello world"), "'hello world'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn test_launcher_args_parse() {
        let args = LauncherArgs::parse(["noinstall,systools", "dryrun", "port=5555", "flag"]);
        assert!(args.noinstall);
        assert!(args.systools);
        assert!(args.dryrun);
        assert_eq!(args.extra["port"], "5555");
        assert_eq!(args.extra["flag"], "");
    }

    #[test]
    fn test_first_run_is_taken_once() {
        let context = context("");
        let clone = context.clone();
        assert!(context.take_first_run());
        assert!(!clone.take_first_run());
    }

    #[tokio::test]
    async fn test_unknown_platform() {
        let context = context("[platforms.linux]\n");
        let params = LauncherParams::new("ps5", "nplb", "devel", "/out", OutputSink::null());
        let err = create_launcher(params, &context).await.err().unwrap();
        assert!(matches!(err, LauncherError::UnknownPlatform(name) if name == "ps5"));
    }

    #[tokio::test]
    async fn test_loader_platform_selects_backend() {
        let context = context(
            r#"
            [platforms.evergreen-x64]
            [platforms.linux-x64x11]
            ipv6 = true
            "#,
        );
        let mut params =
            LauncherParams::new("evergreen-x64", "nplb", "devel", "/out", OutputSink::null());
        params.loader_platform = Some("linux-x64x11".to_string());

        let launcher = create_launcher(params, &context).await.unwrap();
        assert_eq!(launcher.name(), "local");
        assert_eq!(launcher.device_ip().await.as_deref(), Some("::1"));
    }

    #[tokio::test]
    async fn test_unsupported_capabilities() {
        let context = context("[platforms.linux-x64x11]\n");
        let params =
            LauncherParams::new("linux-x64x11", "nplb", "devel", "/out", OutputSink::null());
        let launcher = create_launcher(params, &context).await.unwrap();

        assert!(!launcher.supports_deep_link());
        assert!(matches!(
            launcher.send_deep_link("https://example.com").await,
            Err(LauncherError::UnsupportedCapability { .. })
        ));
        assert!(matches!(
            launcher.create_device_to_host_tunnel(8000, 8000).await,
            Err(LauncherError::UnsupportedCapability { .. })
        ));
    }

    #[tokio::test]
    async fn test_dry_run_echoes_commands() {
        let (sink, captured) = OutputSink::capture();
        let commands = HostCommands::new(sink, true);
        let result = commands
            .exec(&Command::new("adb").args(["-s", "serial", "install", "a b.apk"]))
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(captured.contents(), "adb -s serial install 'a b.apk'\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_checked_reports_failure() {
        let commands = HostCommands::new(OutputSink::null(), false);
        let err = commands
            .exec_checked(&Command::new("sh").args(["-c", "echo nope >&2; exit 3"]), |msg| {
                LauncherError::DeployFailure(msg)
            })
            .await
            .unwrap_err();
        match err {
            LauncherError::DeployFailure(msg) => {
                assert!(msg.contains("exited with 3"));
                assert!(msg.contains("nope"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_unless_killed() {
        let shutdown = CancellationToken::new();
        let value = unless_killed(&shutdown, "query", async { Ok(5) }).await.unwrap();
        assert_eq!(value, 5);

        let started = AtomicBool::new(false);
        shutdown.cancel();
        let err = unless_killed(&shutdown, "install", async {
            started.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, LauncherError::Cancelled(op) if op == "install"));
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unless_killed_interrupts_step() {
        let shutdown = CancellationToken::new();
        let killer = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            killer.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            unless_killed(&shutdown, "wait", async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        )
        .await
        .expect("step was not interrupted");
        assert!(matches!(result, Err(LauncherError::Cancelled(_))));
    }
}
