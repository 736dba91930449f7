//! Android launcher over ADB.
//!
//! Installs `<out_directory>/<target_name>.apk`, starts the application's
//! activity with the target parameters as an intent extra, and streams a
//! filtered `logcat` into the sink. The exit code travels back through the
//! log as an `***Application Stopped*** <code>` line.
//!
//! # Run Sequence
//!
//! ```text
//! wait-for-device ─► force-stop ─► grace ─► logcat -c ─► uninstall
//!   ─► install + grant permissions (unless noinstall) ─► wake up
//!   ─► logcat -G 2M ─► am monitor (crash watcher) ─► logcat ─► am start
//!   ─► watch logcat until "Application Stopped", a crash, EOF or kill
//!   ─► force-stop, remove forwarded ports
//! ```
//!
//! Crashes are detected two ways: a `beginning of crash` line in logcat and
//! an `** ERROR` report from `am monitor`. Either one stops logcat after a
//! short grace period, so the stack trace still reaches the sink, and turns
//! the return code into [`CRASH_RETURN_CODE`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    APPLICATION_CRASHED, APPLICATION_STOPPED, CRASH_RETURN_CODE, Capabilities, Command,
    HostCommands, Launcher, LauncherError, LauncherParams, LauncherResult, shell_escape,
    unless_killed,
};
use crate::config::AdbConfig;
use crate::sink::OutputSink;

/// Port `adb connect` uses for network-attached devices.
const ADB_TCP_PORT: u16 = 5555;

/// logcat ring buffer size requested before each run.
const LOGCAT_BUFFER_SIZE: &str = "2M";

/// logcat tag every `***Application Stopped***` line is logged under.
const STOP_LOG_TAG: &str = "starboard";

/// Marks a native crash in logcat.
const CRASH_LOG_MARKER: &str = "beginning of crash";

/// Parameter carrying the deep link the activity is started with.
const LINK_PARAM_PREFIX: &str = "--link=";

static AM_MONITOR_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\* ERROR").expect("valid regex"));

static IPV4_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}(\.\d{1,3}){3}$").expect("valid regex"));

static INET_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"inet (\d{1,3}(?:\.\d{1,3}){3})").expect("valid regex"));

/// The package's cache directory, writable by the target.
pub(crate) fn device_output_dir(config: &AdbConfig) -> String {
    format!("/data/data/{}/cache/", config.package)
}

/// How a logcat watch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogcatOutcome {
    /// Code from an `***Application Stopped***` line, or 1 if none was seen.
    pub return_code: i32,
    /// A crash was seen in logcat or reported by the activity monitor.
    pub crashed: bool,
}

/// Launcher for Android devices.
pub struct AdbLauncher {
    params: LauncherParams,
    config: AdbConfig,
    adb: String,
    device_id: String,
    commands: HostCommands,
    forwarded_ports: Mutex<Vec<u16>>,
    reverse_tunnels: Mutex<BTreeMap<u16, u16>>,
    active_run: Mutex<Option<CancellationToken>>,
    killed: AtomicBool,
}

impl AdbLauncher {
    /// Creates a launcher and resolves the device to talk to.
    ///
    /// An empty device id selects the first authorized attached device; an
    /// IPv4 address that is not attached yet is connected over TCP.
    pub async fn new(params: LauncherParams, config: &AdbConfig) -> LauncherResult<Self> {
        let dry_run = params.launcher_args.dryrun;
        let commands = HostCommands::new(params.output.clone(), dry_run);
        let adb = locate_adb(config);

        let mut launcher = Self {
            device_id: params.device_id.clone(),
            params,
            config: config.clone(),
            adb,
            commands,
            forwarded_ports: Mutex::new(Vec::new()),
            reverse_tunnels: Mutex::new(BTreeMap::new()),
            active_run: Mutex::new(None),
            killed: AtomicBool::new(false),
        };

        if !dry_run {
            launcher.device_id = launcher.resolve_device().await?;
        }
        info!("Using Android device {}", launcher.device_id);

        Ok(launcher)
    }

    async fn resolve_device(&self) -> LauncherResult<String> {
        let listing = self
            .commands
            .exec_checked(&Command::new(&self.adb).arg("devices"), |msg| {
                LauncherError::LaunchFailure(msg)
            })
            .await?;
        let attached = parse_devices(&listing.stdout);

        if self.device_id.is_empty() {
            return attached.into_iter().next().ok_or_else(|| {
                LauncherError::LaunchFailure("no authorized Android device attached".to_string())
            });
        }

        if IPV4_ADDRESS.is_match(&self.device_id) {
            let address = format!("{}:{}", self.device_id, ADB_TCP_PORT);
            if !attached.contains(&address) {
                info!("Connecting to {}", address);
                self.commands
                    .exec_checked(&Command::new(&self.adb).arg("connect").arg(&address), |msg| {
                        LauncherError::LaunchFailure(msg)
                    })
                    .await?;
            }
            return Ok(address);
        }

        Ok(self.device_id.clone())
    }

    fn adb_command(&self) -> Command {
        let cmd = Command::new(&self.adb);
        if self.device_id.is_empty() {
            cmd
        } else {
            cmd.args(["-s", self.device_id.as_str()])
        }
    }

    fn shell(&self, command: impl Into<String>) -> Command {
        self.adb_command().arg("shell").arg(command)
    }

    async fn adb_checked(&self, cmd: Command) -> LauncherResult<()> {
        self.commands
            .exec_checked(&cmd, LauncherError::LaunchFailure)
            .await
            .map(|_| ())
    }

    async fn adb_best_effort(&self, cmd: Command) {
        match self.commands.exec(&cmd).await {
            Ok(result) if !result.success() => {
                debug!("`{}` exited with {}", cmd.to_shell_string(), result.exit_code)
            }
            Ok(_) => {}
            Err(e) => debug!("`{}` failed: {}", cmd.to_shell_string(), e),
        }
    }

    fn activity_component(&self) -> String {
        format!("{}/{}", self.config.package, self.config.activity)
    }

    fn start_command(&self, link_override: Option<&str>) -> Command {
        self.shell(start_activity_command(
            &self.activity_component(),
            &self.params.target_params,
            link_override,
        ))
    }

    fn apk_path(&self) -> PathBuf {
        self.params
            .out_directory
            .join(format!("{}.apk", self.params.target_name))
    }

    async fn prepare_device(&self) -> LauncherResult<()> {
        self.adb_checked(
            self.adb_command()
                .arg("wait-for-device")
                .timeout(self.config.device_timeout_secs),
        )
        .await?;
        self.adb_best_effort(self.shell(format!("am force-stop {}", self.config.package)))
            .await;

        if !self.commands.is_dry_run() {
            tokio::time::sleep(Duration::from_secs_f64(self.config.start_grace_secs)).await;
        }

        self.adb_best_effort(self.adb_command().args(["logcat", "-c"]))
            .await;
        self.adb_best_effort(self.adb_command().arg("uninstall").arg(&self.config.package))
            .await;

        if !self.params.launcher_args.noinstall {
            let apk = self.apk_path();
            if !self.commands.is_dry_run() && !apk.is_file() {
                return Err(LauncherError::ArtifactNotFound(apk));
            }
            self.commands
                .exec_checked(
                    &self
                        .adb_command()
                        .args(["install", "-r"])
                        .arg(apk.to_string_lossy()),
                    LauncherError::DeployFailure,
                )
                .await?;
            for permission in &self.config.permissions {
                self.adb_best_effort(
                    self.shell(format!("pm grant {} {}", self.config.package, permission)),
                )
                .await;
            }
        }

        // Keeps Daydream from looping on the activity.
        self.adb_best_effort(self.shell("input keyevent KEYCODE_WAKEUP"))
            .await;
        self.adb_best_effort(self.adb_command().args(["logcat", "-G", LOGCAT_BUFFER_SIZE]))
            .await;

        Ok(())
    }

    fn logcat_command(&self) -> Command {
        self.adb_command()
            .args(["logcat", "-v", "raw", "-s"])
            .args(self.config.logcat_filter.iter().cloned())
    }

    fn spawn_piped(&self, cmd: &Command) -> LauncherResult<Child> {
        let mut process = cmd.to_process();
        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::null());
        process.kill_on_drop(true);
        process
            .spawn()
            .map_err(|e| LauncherError::LaunchFailure(format!("{}: {}", cmd.program, e)))
    }

    async fn run_app(&self, shutdown: &CancellationToken) -> LauncherResult<LogcatOutcome> {
        // Dropping a step kills the adb command it is running.
        unless_killed(shutdown, "device preparation", self.prepare_device()).await?;

        let monitor_cmd = self.shell("am monitor");
        let logcat_cmd = self.logcat_command();
        let start_cmd = self.start_command(None);

        if self.commands.is_dry_run() {
            for cmd in [&monitor_cmd, &logcat_cmd, &start_cmd] {
                self.commands.echo_if_dry_run(cmd).await;
            }
            return Ok(LogcatOutcome {
                return_code: 0,
                crashed: false,
            });
        }

        let (crash_tx, crash_rx) = mpsc::channel(4);
        let mut monitor = self.spawn_piped(&monitor_cmd)?;
        let monitor_task = monitor
            .stdout
            .take()
            .map(|stdout| spawn_activity_monitor(BufReader::new(stdout), crash_tx));

        let mut logcat = self.spawn_piped(&logcat_cmd)?;
        let logcat_stdout = logcat
            .stdout
            .take()
            .ok_or_else(|| LauncherError::LaunchFailure("logcat stdout not captured".into()));

        let started = match logcat_stdout {
            Ok(stdout) => unless_killed(shutdown, "activity start", self.adb_checked(start_cmd))
                .await
                .map(|()| stdout),
            Err(e) => Err(e),
        };
        let outcome = match started {
            Ok(stdout) => Ok(watch_logcat(
                BufReader::new(stdout),
                &self.params.output,
                crash_rx,
                shutdown,
                Duration::from_secs_f64(self.config.crash_grace_secs),
            )
            .await),
            Err(e) => Err(e),
        };

        if let Some(task) = monitor_task {
            task.abort();
        }
        for (name, child) in [("am monitor", &mut monitor), ("logcat", &mut logcat)] {
            if let Err(e) = child.start_kill() {
                debug!("{} already exited: {}", name, e);
            }
        }

        outcome
    }

    async fn release_ports(&self) {
        let forwarded: Vec<u16> = std::mem::take(
            &mut *self
                .forwarded_ports
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for port in forwarded {
            self.adb_best_effort(
                self.adb_command()
                    .args(["forward", "--remove"])
                    .arg(format!("tcp:{}", port)),
            )
            .await;
        }

        let reversed: BTreeMap<u16, u16> = std::mem::take(
            &mut *self
                .reverse_tunnels
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for device_port in reversed.into_values() {
            self.adb_best_effort(
                self.adb_command()
                    .args(["reverse", "--remove"])
                    .arg(format!("tcp:{}", device_port)),
            )
            .await;
        }
    }

    fn set_active_run(&self, token: Option<CancellationToken>) {
        *self
            .active_run
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token;
    }

    /// Forwards a host port to `device_port` and returns the host side.
    pub async fn host_and_port_for_device_port(
        &self,
        device_port: u16,
    ) -> LauncherResult<(String, u16)> {
        let result = self
            .commands
            .exec_checked(
                &self
                    .adb_command()
                    .args(["forward", "tcp:0"])
                    .arg(format!("tcp:{}", device_port)),
                LauncherError::LaunchFailure,
            )
            .await?;
        let host_port = parse_forward_port(&result.stdout).ok_or_else(|| {
            LauncherError::LaunchFailure(format!(
                "unexpected `adb forward` output: {:?}",
                result.stdout
            ))
        })?;

        self.forwarded_ports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(host_port);

        Ok(("127.0.0.1".to_string(), host_port))
    }
}

#[async_trait]
impl Launcher for AdbLauncher {
    fn name(&self) -> &'static str {
        "adb"
    }

    fn params(&self) -> &LauncherParams {
        &self.params
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            suspend_resume: true,
            deep_link: true,
            device_to_host_tunnel: true,
        }
    }

    async fn run(&self) -> LauncherResult<i32> {
        let shutdown = CancellationToken::new();
        self.killed.store(false, Ordering::SeqCst);
        self.set_active_run(Some(shutdown.clone()));

        let outcome = self.run_app(&shutdown).await;

        let result = match outcome {
            Ok(outcome) if outcome.crashed => {
                let _ = self.params.output.write_line(APPLICATION_CRASHED).await;
                Ok(CRASH_RETURN_CODE)
            }
            Ok(outcome) => Ok(outcome.return_code),
            Err(e) => Err(e),
        };

        self.adb_best_effort(self.shell(format!("am force-stop {}", self.config.package)))
            .await;
        self.release_ports().await;
        self.killed.store(true, Ordering::SeqCst);
        self.set_active_run(None);

        result
    }

    async fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        let active = self
            .active_run
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let Some(shutdown) = active else {
            return;
        };

        warn!("Killing {} on {}", self.params.target_name, self.device_id);
        shutdown.cancel();
        let stop_line = shell_escape(&format!("{} 1", APPLICATION_STOPPED));
        self.adb_best_effort(self.shell(format!("log -t {} {}", STOP_LOG_TAG, stop_line)))
            .await;
    }

    async fn device_ip(&self) -> Option<String> {
        if let Some((host, _)) = self.device_id.split_once(':')
            && IPV4_ADDRESS.is_match(host)
        {
            return Some(host.to_string());
        }
        let result = self
            .commands
            .exec(&self.shell("ip -f inet addr show wlan0"))
            .await
            .ok()?;
        INET_ADDRESS
            .captures(&result.stdout)
            .map(|caps| caps[1].to_string())
    }

    fn device_output_path(&self) -> Option<String> {
        Some(device_output_dir(&self.config))
    }

    async fn send_suspend(&self) -> LauncherResult<()> {
        self.adb_checked(self.shell("input keyevent KEYCODE_HOME"))
            .await
    }

    async fn send_resume(&self) -> LauncherResult<()> {
        self.adb_checked(self.start_command(None)).await
    }

    async fn send_deep_link(&self, url: &str) -> LauncherResult<()> {
        self.adb_checked(self.start_command(Some(url))).await
    }

    async fn create_device_to_host_tunnel(
        &self,
        host_port: u16,
        device_port: u16,
    ) -> LauncherResult<bool> {
        let result = self
            .commands
            .exec(
                &self
                    .adb_command()
                    .arg("reverse")
                    .arg(format!("tcp:{}", device_port))
                    .arg(format!("tcp:{}", host_port)),
            )
            .await?;
        if !result.success() {
            warn!("adb reverse failed: {}", result.stderr.trim());
            return Ok(false);
        }
        self.reverse_tunnels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(host_port, device_port);
        Ok(true)
    }

    async fn remove_device_to_host_tunnel(&self, host_port: u16) -> LauncherResult<()> {
        let device_port = self
            .reverse_tunnels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&host_port);
        if let Some(device_port) = device_port {
            self.adb_checked(
                self.adb_command()
                    .args(["reverse", "--remove"])
                    .arg(format!("tcp:{}", device_port)),
            )
            .await?;
        }
        Ok(())
    }
}

/// Finds `adb`: the configured path, `PATH`, then `$ANDROID_HOME/platform-tools`.
fn locate_adb(config: &AdbConfig) -> String {
    if let Some(path) = &config.adb_path {
        return shellexpand::tilde(&path.to_string_lossy()).into_owned();
    }

    let exe = if cfg!(windows) { "adb.exe" } else { "adb" };
    let on_path = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(exe).is_file()))
        .unwrap_or(false);
    if on_path {
        return exe.to_string();
    }

    if let Some(home) = std::env::var_os("ANDROID_HOME") {
        let candidate = PathBuf::from(home).join("platform-tools").join(exe);
        if candidate.is_file() {
            return candidate.to_string_lossy().into_owned();
        }
    }

    exe.to_string()
}

/// Serials of attached devices, skipping unauthorized ones.
fn parse_devices(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            let state = fields.next().unwrap_or("");
            (state != "unauthorized").then(|| serial.to_string())
        })
        .collect()
}

/// Host port allocated by `adb forward tcp:0 ...`.
fn parse_forward_port(output: &str) -> Option<u16> {
    output.lines().next()?.trim().parse().ok()
}

/// The `am start` shell command for `component`.
///
/// `--link=URL` parameters become the intent data; everything else is
/// passed comma-joined as the `args` string array extra.
fn start_activity_command(
    component: &str,
    target_params: &[String],
    link_override: Option<&str>,
) -> String {
    let mut link = link_override.map(str::to_string);
    let mut args = Vec::new();
    for param in target_params {
        match param.strip_prefix(LINK_PARAM_PREFIX) {
            Some(url) => {
                if link.is_none() {
                    link = Some(url.to_string());
                }
            }
            None => args.push(param.as_str()),
        }
    }

    let mut command = vec!["am".to_string(), "start".to_string()];
    if !args.is_empty() {
        command.push("--esa".to_string());
        command.push("args".to_string());
        command.push(shell_escape(&args.join(",")));
    }
    if let Some(url) = link {
        command.push("-d".to_string());
        command.push(shell_escape(&url));
    }
    command.push(component.to_string());
    command.join(" ")
}

/// Scans `am monitor` output and reports crashes on `crash_tx`.
fn spawn_activity_monitor<R>(reader: R, crash_tx: mpsc::Sender<()>) -> JoinHandle<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if AM_MONITOR_ERROR.is_match(&line) {
                debug!("am monitor: {}", line);
                let _ = crash_tx.try_send(());
            }
        }
    })
}

/// Copies logcat into `output` until the application stops.
///
/// Ends on an [`APPLICATION_STOPPED`] line, on EOF, when `shutdown` is
/// cancelled, or `crash_grace` after a crash was first seen.
pub async fn watch_logcat<R>(
    mut reader: R,
    output: &OutputSink,
    mut crash_rx: mpsc::Receiver<()>,
    shutdown: &CancellationToken,
    crash_grace: Duration,
) -> LogcatOutcome
where
    R: AsyncBufRead + Unpin,
{
    let mut outcome = LogcatOutcome {
        return_code: 1,
        crashed: false,
    };
    let mut crash_deadline: Option<tokio::time::Instant> = None;
    let mut line = Vec::new();

    loop {
        let grace_elapsed = async {
            match crash_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = grace_elapsed => break,
            Some(()) = crash_rx.recv() => {
                outcome.crashed = true;
                crash_deadline.get_or_insert_with(|| tokio::time::Instant::now() + crash_grace);
            }
            read = reader.read_until(b'\n', &mut line) => {
                match read {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("logcat read failed: {}", e);
                        break;
                    }
                }

                let _ = output.write_all(&line).await;
                let text = String::from_utf8_lossy(&line).into_owned();
                line.clear();

                if text.contains(CRASH_LOG_MARKER) {
                    outcome.crashed = true;
                    crash_deadline
                        .get_or_insert_with(|| tokio::time::Instant::now() + crash_grace);
                }

                if text.contains(APPLICATION_STOPPED) {
                    if let Some(code) = text
                        .split_whitespace()
                        .last()
                        .and_then(|token| token.parse().ok())
                    {
                        outcome.return_code = code;
                    }
                    break;
                }
            }
        }
    }

    outcome
}
