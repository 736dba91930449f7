//! Local process launcher.
//!
//! Runs host-built test binaries as child processes of the runner. The
//! binary lives at `<out_directory>/<target_name><binary_suffix>` and its
//! stdout and stderr are both copied, line by line, into the sink.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Device address | `::1` or `127.0.0.1` unless a device id is given |
//! | Suspend/resume | Linux only (`SIGUSR1` / `SIGCONT`) |
//! | Crash detection | `<binary>.dmp` next to the binary, when enabled |
//! | Coverage | `LLVM_PROFILE_FILE` |
//!
//! # Example Configuration
//!
//! ```toml
//! [platforms.win-win32]
//! launcher = "local"
//!
//! [platforms.win-win32.local]
//! binary_suffix = ".exe"
//! minidump = true
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    CRASH_RETURN_CODE, Capabilities, Command, HostCommands, Launcher, LauncherContext,
    LauncherError, LauncherParams, LauncherResult, minidump,
};
use crate::config::PlatformConfig;
use crate::sink::OutputSink;

/// Budget for a suspend or resume to take effect.
const PROCESS_STATE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long output is still drained after a kill.
const KILL_DRAIN_GRACE: Duration = Duration::from_millis(300);

/// Interval between process state checks.
const PROCESS_STATE_POLL: Duration = Duration::from_millis(5);

struct RunningProcess {
    pid: Option<u32>,
    cancel: CancellationToken,
}

/// Launcher running the target as a local child process.
pub struct LocalLauncher {
    params: LauncherParams,
    device_ip: String,
    binary: PathBuf,
    minidump: bool,
    minidump_printer: Vec<String>,
    running: Mutex<Option<RunningProcess>>,
}

impl LocalLauncher {
    /// Creates a launcher for `params` on a host platform.
    pub fn new(params: LauncherParams, platform: &PlatformConfig, context: &LauncherContext) -> Self {
        let device_ip = if !params.device_id.is_empty() {
            params.device_id.clone()
        } else if platform.ipv6 {
            "::1".to_string()
        } else {
            "127.0.0.1".to_string()
        };

        let binary = params.out_directory.join(format!(
            "{}{}",
            params.target_name, platform.local.binary_suffix
        ));

        Self {
            params,
            device_ip,
            binary,
            minidump: platform.local.minidump,
            minidump_printer: context.minidump_printer.clone(),
            running: Mutex::new(None),
        }
    }

    fn minidump_path(&self) -> PathBuf {
        let mut path = self.binary.clone().into_os_string();
        path.push(".dmp");
        PathBuf::from(path)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(self.binary.to_string_lossy())
            .args(self.params.target_params.iter().cloned())
            .working_dir(&self.params.out_directory);
        for (key, value) in &self.params.env_variables {
            cmd = cmd.env(key, value);
        }
        if let Some(path) = &self.params.coverage_file_path {
            cmd = cmd.env("LLVM_PROFILE_FILE", path.to_string_lossy());
        }
        cmd
    }

    fn set_running(&self, running: Option<RunningProcess>) {
        let mut guard = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = running;
    }

    fn running_pid(&self) -> Option<u32> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(|r| r.pid)
    }

    async fn signal_and_wait(&self, suspend: bool) -> LauncherResult<()> {
        let pid = self
            .running_pid()
            .ok_or_else(|| LauncherError::LaunchFailure("target is not running".to_string()))?;
        signal_process(pid, suspend, self.name()).await
    }
}

#[async_trait]
impl Launcher for LocalLauncher {
    fn name(&self) -> &'static str {
        "local"
    }

    fn params(&self) -> &LauncherParams {
        &self.params
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            suspend_resume: cfg!(target_os = "linux"),
            deep_link: false,
            device_to_host_tunnel: false,
        }
    }

    async fn run(&self) -> LauncherResult<i32> {
        let cmd = self.command();
        let output = &self.params.output;

        if HostCommands::new(output.clone(), self.params.launcher_args.dryrun)
            .echo_if_dry_run(&cmd)
            .await
        {
            return Ok(0);
        }

        if !self.binary.is_file() {
            return Err(LauncherError::ArtifactNotFound(self.binary.clone()));
        }

        let dump = self.minidump_path();
        if self.minidump && dump.exists() {
            debug!("Removing stale minidump {}", dump.display());
            tokio::fs::remove_file(&dump).await?;
        }

        let mut process = cmd.to_process();
        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);
        #[cfg(unix)]
        process.process_group(0);

        let mut child = process.spawn().map_err(|e| {
            LauncherError::LaunchFailure(format!("{}: {}", self.binary.display(), e))
        })?;

        let cancel = CancellationToken::new();
        self.set_running(Some(RunningProcess {
            pid: child.id(),
            cancel: cancel.clone(),
        }));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let wait = async {
            tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    if let Some(pid) = child.id() {
                        kill_process_group(pid);
                    }
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill {}: {}", self.binary.display(), e);
                    }
                    child.wait().await
                }
            }
        };

        // Once killed, output still held open by stray descendants is not
        // waited for past the grace period.
        let drain = async {
            let copy = async {
                tokio::join!(copy_lines(stdout, output), copy_lines(stderr, output));
            };
            tokio::select! {
                _ = copy => {}
                _ = async {
                    cancel.cancelled().await;
                    tokio::time::sleep(KILL_DRAIN_GRACE).await;
                } => debug!("Abandoning output of killed {}", self.binary.display()),
            }
        };

        let (status, _) = tokio::join!(wait, drain);
        self.set_running(None);

        let mut return_code = exit_code(status?);

        if self.minidump && dump.exists() {
            minidump::print_minidump(&self.minidump_printer, &dump, output).await;
            return_code = CRASH_RETURN_CODE;
        }

        Ok(return_code)
    }

    async fn kill(&self) {
        let guard = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(running) = guard.as_ref() {
            debug!("Killing {}", self.binary.display());
            running.cancel.cancel();
        }
    }

    async fn device_ip(&self) -> Option<String> {
        Some(self.device_ip.clone())
    }

    fn device_output_path(&self) -> Option<String> {
        Some(device_output_dir())
    }

    async fn send_suspend(&self) -> LauncherResult<()> {
        self.signal_and_wait(true).await
    }

    async fn send_resume(&self) -> LauncherResult<()> {
        self.signal_and_wait(false).await
    }
}

/// Copies `reader` into `output` one line at a time until EOF.
///
/// Keeps draining after the sink fails so the child never blocks on a full pipe.
async fn copy_lines<R>(reader: Option<R>, output: &OutputSink)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut sink_ok = true;

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if sink_ok && let Err(e) = output.write_all(&line).await {
                    debug!("Output sink rejected target output: {}", e);
                    sink_ok = false;
                }
            }
            Err(e) => {
                debug!("Reading target output failed: {}", e);
                break;
            }
        }
    }
}

/// The host's temporary directory.
pub(crate) fn device_output_dir() -> String {
    std::env::temp_dir().to_string_lossy().into_owned()
}

/// Kills every process in the group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory safety preconditions.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        debug!(
            "Failed to kill process group {}: {}",
            pgid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Extracts the state letter from a `/proc/<pid>/stat` line.
fn parse_proc_state(stat: &str) -> Option<char> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}

#[cfg(target_os = "linux")]
async fn signal_process(pid: u32, suspend: bool, _launcher: &'static str) -> LauncherResult<()> {
    let (signal, expected): (libc::c_int, &[char]) = if suspend {
        (libc::SIGUSR1, &['T'])
    } else {
        (libc::SIGCONT, &['S', 'R'])
    };

    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| LauncherError::LaunchFailure(format!("invalid pid {}", pid)))?;
    // SAFETY: kill(2) has no memory safety preconditions.
    if unsafe { libc::kill(pid, signal) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let stat_path = format!("/proc/{}/stat", pid);
    let deadline = tokio::time::Instant::now() + PROCESS_STATE_TIMEOUT;
    loop {
        let state = tokio::fs::read_to_string(&stat_path)
            .await
            .ok()
            .and_then(|stat| parse_proc_state(&stat));
        if state.is_some_and(|s| expected.contains(&s)) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(LauncherError::Timeout(format!(
                "process {} did not reach state {:?} (last {:?})",
                pid, expected, state
            )));
        }
        tokio::time::sleep(PROCESS_STATE_POLL).await;
    }
}

#[cfg(not(target_os = "linux"))]
async fn signal_process(_pid: u32, suspend: bool, launcher: &'static str) -> LauncherResult<()> {
    let _ = (PROCESS_STATE_TIMEOUT, PROCESS_STATE_POLL);
    Err(LauncherError::UnsupportedCapability {
        launcher,
        capability: if suspend {
            "system suspend"
        } else {
            "system resume"
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;

    fn launcher_for(out: &std::path::Path, sink: OutputSink, platform_toml: &str) -> LocalLauncher {
        let config = load_config_str(&format!("[platforms.linux]\n{}", platform_toml)).unwrap();
        let context = LauncherContext::new(&config);
        let mut params = LauncherParams::new("linux", "fake_test", "devel", out, sink);
        params.target_params = vec!["--flag".to_string()];
        params.env_variables.insert("FAKE_ENV".into(), "from-env".into());
        LocalLauncher::new(params, &config.platforms["linux"], &context)
    }

    #[cfg(unix)]
    fn write_script(dir: &std::path::Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_loopback_address() {
        let dir = tempfile::tempdir().unwrap();
        let v4 = launcher_for(dir.path(), OutputSink::null(), "");
        let v6 = launcher_for(dir.path(), OutputSink::null(), "ipv6 = true");
        assert_eq!(v4.device_ip, "127.0.0.1");
        assert_eq!(v6.device_ip, "::1");
    }

    #[test]
    fn test_parse_proc_state() {
        assert_eq!(parse_proc_state("1234 (my (odd) name) T 1 2 3"), Some('T'));
        assert_eq!(parse_proc_state("1234 (sh) S 1"), Some('S'));
        assert_eq!(parse_proc_state("garbage"), None);
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher_for(dir.path(), OutputSink::null(), "");
        assert!(matches!(
            launcher.run().await,
            Err(LauncherError::ArtifactNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_copies_output_and_returns_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "fake_test",
            "echo \"args: $*\"\necho \"env: $FAKE_ENV\"\necho oops >&2\nexit 3",
        );
        let (sink, captured) = OutputSink::capture();
        let launcher = launcher_for(dir.path(), sink, "");

        assert_eq!(launcher.run().await.unwrap(), 3);
        let output = captured.contents();
        assert!(output.contains("args: --flag\n"));
        assert!(output.contains("env: from-env\n"));
        assert!(output.contains("oops\n"));

        // Kill after run is a no-op.
        launcher.kill().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_stops_run() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "fake_test", "echo started\nexec sleep 30");
        let (sink, captured) = OutputSink::capture();
        let launcher = std::sync::Arc::new(launcher_for(dir.path(), sink, ""));

        let runner = {
            let launcher = launcher.clone();
            tokio::spawn(async move { launcher.run().await })
        };

        while !captured.contents().contains("started") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        launcher.kill().await;

        let code = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .expect("run returns within a second")
            .unwrap()
            .unwrap();
        assert_ne!(code, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_reaches_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        // The shell forks `sleep`, which inherits stdout and keeps it open.
        write_script(dir.path(), "fake_test", "echo started\nsleep 30\necho done");
        let (sink, captured) = OutputSink::capture();
        let launcher = std::sync::Arc::new(launcher_for(dir.path(), sink, ""));

        let runner = {
            let launcher = launcher.clone();
            tokio::spawn(async move { launcher.run().await })
        };

        while !captured.contents().contains("started") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        launcher.kill().await;

        let code = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .expect("run returns within a second")
            .unwrap()
            .unwrap();
        assert_ne!(code, 0);
        assert!(!captured.contents().contains("done"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_minidump_marks_crash() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "fake_test", "touch \"$0.dmp\"\nexit 0");
        std::fs::write(dir.path().join("fake_test.dmp"), b"stale").unwrap();
        let (sink, captured) = OutputSink::capture();
        let launcher = launcher_for(dir.path(), sink, "[platforms.linux.local]\nminidump = true");

        assert_eq!(launcher.run().await.unwrap(), CRASH_RETURN_CODE);
        assert!(captured.contents().contains("Minidump found at"));
    }

    #[tokio::test]
    async fn test_dry_run_does_not_execute() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, captured) = OutputSink::capture();
        let mut launcher = launcher_for(dir.path(), sink, "");
        launcher.params.launcher_args.dryrun = true;

        assert_eq!(launcher.run().await.unwrap(), 0);
        assert!(captured.contents().contains("fake_test --flag"));
    }
}
