//! SSH launcher for Raspberry Pi and RDK devices.
//!
//! The target's install tree is copied with `rsync`, then an interactive
//! `ssh -tt` session runs the binary and its output is read back line by
//! line.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | File transfer | `rsync -avzL`, retried |
//! | Authentication | Keys, or a password through `sshpass` |
//! | Readiness | Echoed random marker, or a configured prompt |
//! | End of run | Suite-ran marker, completion tag, EOF or kill |
//!
//! # Prerequisites
//!
//! - `ssh` and `rsync` available locally (`sshpass` for password auth)
//! - The device address as `--device_id`, `RASPI_ADDR` or `RDK_ADDR`
//!
//! # Example Configuration
//!
//! ```toml
//! [platforms.raspi-2.ssh]
//! user = "pi"
//! key_path = "~/.ssh/id_rsa"
//! remote_dir = "/home/pi/test"
//! readline_retries = 900
//! ```

use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::watch;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Command, HostCommands, Launcher, LauncherContext, LauncherError, LauncherParams,
    LauncherResult,
};
use crate::config::SshConfig;
use crate::retry::{RetryOptions, with_retry};
use crate::sink::OutputSink;

/// Characters escaped in flags sent through the remote shell.
/// Where targets on the device may write files.
pub(crate) const DEVICE_OUTPUT_DIR: &str = "/tmp";

const SHELL_META: &[char] = &['(', ')', '[', ']', '{', '}', '%', '!', '^', '"', '<', '>', '&', '|'];

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07]*\x07").expect("valid regex")
});

static TAG_FAILED_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"failed (-?\d+)").expect("valid regex"));

type LineStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// An interactive shell on the device.
struct Session {
    child: Option<Child>,
    stdin: Pin<Box<dyn AsyncWrite + Send>>,
    lines: LineStream,
}

impl Session {
    async fn send_line(&mut self, line: &str) -> LauncherResult<()> {
        debug!("ssh> {}", line);
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Next line with escapes and carriage returns removed. `None` at EOF.
    async fn read_line(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<String>, tokio::time::error::Elapsed> {
        let line = tokio::time::timeout(timeout, self.lines.next()).await?;
        Ok(line.map(|l| clean_line(&l)))
    }

    async fn close(mut self) {
        let _ = self.send_line("exit").await;
        if let Some(mut child) = self.child.take()
            && let Err(e) = child.start_kill()
        {
            debug!("ssh session already exited: {}", e);
        }
    }
}

/// How the end of a run is recognized.
#[derive(Debug, Clone)]
struct EndOfRun {
    /// Completion tag; the run ends on `<tag> succeeded` or `<tag> failed`.
    complete_tag: Option<String>,
    /// Lines marking the end of the test suite.
    suite_markers: Vec<String>,
}

/// Launcher for devices reached over SSH.
pub struct SshLauncher {
    params: LauncherParams,
    config: SshConfig,
    context: LauncherContext,
    address: String,
    commands: HostCommands,
    active: watch::Sender<bool>,
    shutdown: Mutex<CancellationToken>,
}

impl SshLauncher {
    /// Creates a launcher, falling back to `RASPI_ADDR` / `RDK_ADDR` for
    /// the device address.
    pub fn new(
        params: LauncherParams,
        config: &SshConfig,
        context: LauncherContext,
    ) -> LauncherResult<Self> {
        let env_var = if params.device_platform().starts_with("rdk") {
            "RDK_ADDR"
        } else {
            "RASPI_ADDR"
        };

        let address = if params.device_id.is_empty() {
            std::env::var(env_var).unwrap_or_default()
        } else {
            params.device_id.clone()
        };
        if address.trim().is_empty() {
            return Err(LauncherError::MissingDeviceAddress {
                platform: params.platform.clone(),
                env_var,
            });
        }

        let (active, _) = watch::channel(false);
        Ok(Self {
            commands: HostCommands::new(params.output.clone(), params.launcher_args.dryrun),
            address: address.trim().to_string(),
            params,
            config: config.clone(),
            context,
            active,
            shutdown: Mutex::new(CancellationToken::new()),
        })
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.config.user, self.address)
    }

    fn ssh_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
        ];

        if self.config.disable_host_key_check {
            opts.push("-o".to_string());
            opts.push("StrictHostKeyChecking=no".to_string());
            opts.push("-o".to_string());
            opts.push("UserKnownHostsFile=/dev/null".to_string());
        }

        if let Some(key_path) = &self.config.key_path {
            opts.push("-i".to_string());
            opts.push(shellexpand::tilde(&key_path.to_string_lossy()).into_owned());
        }

        opts.push("-p".to_string());
        opts.push(self.config.port.to_string());
        opts
    }

    /// Prefixes `sshpass` when a password is configured.
    fn with_password(&self, program: &str) -> Command {
        if self.config.password.is_empty() {
            Command::new(program)
        } else {
            Command::new("sshpass")
                .args(["-p", self.config.password.as_str()])
                .arg(program)
        }
    }

    fn install_dir(&self) -> PathBuf {
        self.params
            .out_directory
            .join(&self.config.install_subdir)
            .join(&self.params.target_name)
    }

    fn rsync_command(&self) -> Command {
        let mut ssh = vec!["ssh".to_string()];
        ssh.extend(self.ssh_options());

        self.with_password("rsync")
            .arg("-avzL")
            .arg(format!("--timeout={}", self.config.connect_timeout_secs))
            .arg("-e")
            .arg(shell_words::join(&ssh))
            .arg(self.install_dir().to_string_lossy())
            .arg(format!("{}:{}/", self.destination(), self.config.remote_dir))
    }

    fn ssh_command(&self) -> Command {
        self.with_password("ssh")
            .arg("-tt")
            .args(self.ssh_options())
            .arg(self.destination())
    }

    fn remote_binary(&self) -> String {
        format!(
            "{}/{}/{}",
            self.config.remote_dir, self.params.target_name, self.params.target_name
        )
    }

    fn test_command(&self, complete_tag: Option<&str>) -> String {
        let mut command = String::new();
        for (key, value) in &self.params.env_variables {
            command.push_str(&format!("{}={} ", key, super::shell_escape(value)));
        }
        command.push_str(&self.remote_binary());
        let flags = escape_flags(&self.params.target_params);
        if !flags.is_empty() {
            command.push(' ');
            command.push_str(&flags);
        }
        if let Some(tag) = complete_tag {
            command.push_str(&format!(
                "; rc=$?; if [ $rc -eq 0 ]; then echo \"{tag}\" succeeded; else echo \"{tag}\" failed $rc; fi"
            ));
        }
        command
    }

    fn current_shutdown(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn rsync_once(&self, cmd: &Command) -> LauncherResult<()> {
        self.commands
            .exec_checked(cmd, LauncherError::DeployFailure)
            .await
            .map(|_| ())
    }

    async fn deploy(&self, shutdown: &CancellationToken) -> LauncherResult<()> {
        let install_dir = self.install_dir();
        if !self.commands.is_dry_run() && !install_dir.is_dir() {
            return Err(LauncherError::ArtifactNotFound(install_dir));
        }

        let cmd = self.rsync_command();
        let options = RetryOptions::new("rsync")
            .retries(self.config.transfer_retries)
            .wrap_errors(true)
            .backoff_delay(Duration::from_secs(1), Duration::from_secs(8));

        with_retry(
            &options,
            || self.rsync_once(&cmd),
            LauncherError::is_transient,
            || shutdown.is_cancelled(),
        )
        .await?;
        Ok(())
    }

    async fn open_session_once(&self) -> LauncherResult<Session> {
        let cmd = self.ssh_command();
        let mut process = cmd.to_process();
        process.stdin(Stdio::piped());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        let mut child = process
            .spawn()
            .map_err(|e| LauncherError::LaunchFailure(format!("ssh: {}", e)))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(LauncherError::LaunchFailure(
                "ssh stdio not captured".to_string(),
            ));
        };

        let stdout_stream = LinesStream::new(BufReader::new(stdout).lines())
            .map(|line: Result<String, std::io::Error>| line.unwrap_or_default());
        let stderr_stream = LinesStream::new(BufReader::new(stderr).lines())
            .map(|line: Result<String, std::io::Error>| line.unwrap_or_default());

        let mut session = Session {
            child: Some(child),
            stdin: Box::pin(stdin),
            lines: Box::pin(stream::select(stdout_stream, stderr_stream)),
        };

        let marker = format!("ready-{:08x}", rand::random::<u32>());
        session.send_line(&format!("echo {}", marker)).await?;

        let ready = wait_ready(
            &mut session,
            &marker,
            self.config.prompt.as_deref(),
            Duration::from_secs(self.config.connect_timeout_secs),
        )
        .await;

        match ready {
            Ok(()) => Ok(session),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    async fn open_session(&self, shutdown: &CancellationToken) -> LauncherResult<Session> {
        let options = RetryOptions::new("ssh handshake")
            .retries(self.config.handshake_retries)
            .wrap_errors(true);

        let session = with_retry(
            &options,
            || self.open_session_once(),
            LauncherError::is_transient,
            || shutdown.is_cancelled(),
        )
        .await?;
        Ok(session)
    }

    async fn first_run_cleanup(&self, session: &mut Session) -> LauncherResult<()> {
        for diagnostic in ["free -mh", "ps -ux", "df -h"] {
            session.send_line(diagnostic).await?;
        }
        let pattern = self
            .config
            .cleanup_pattern
            .clone()
            .unwrap_or_else(|| self.params.target_name.clone());
        session
            .send_line(&format!(
                "pkill -9 -u {} -f {}",
                super::shell_escape(&self.config.user),
                super::shell_escape(&pattern)
            ))
            .await
    }

    async fn run_remote(&self, shutdown: &CancellationToken) -> LauncherResult<i32> {
        self.deploy(shutdown).await?;

        let complete_tag = self
            .config
            .complete_tag
            .then(|| format!("{}-{}", self.params.target_name, uuid::Uuid::new_v4()));
        let test_command = self.test_command(complete_tag.as_deref());

        if self.commands.is_dry_run() {
            self.commands.echo_if_dry_run(&self.ssh_command()).await;
            let _ = self.params.output.write_line(&test_command).await;
            return Ok(0);
        }

        let mut session = self.open_session(shutdown).await?;

        if self.context.take_first_run() {
            info!("First run on {}, cleaning up the device", self.address);
            self.first_run_cleanup(&mut session).await?;
        }

        if let Some(xml) = &self.params.test_result_xml_path {
            session
                .send_line(&format!("touch {}", super::shell_escape(xml)))
                .await?;
        }

        session.send_line(&test_command).await?;

        let end = EndOfRun {
            complete_tag,
            suite_markers: self.config.suite_ran_markers.clone(),
        };
        let result = stream_test_output(
            &mut session,
            &self.params.output,
            &end,
            Duration::from_secs(self.config.readline_timeout_secs),
            self.config.readline_retries,
            shutdown,
        )
        .await;

        session.close().await;
        result
    }
}

#[async_trait]
impl Launcher for SshLauncher {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn params(&self) -> &LauncherParams {
        &self.params
    }

    async fn run(&self) -> LauncherResult<i32> {
        let shutdown = CancellationToken::new();
        *self
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = shutdown.clone();
        self.active.send_replace(true);

        let result = self.run_remote(&shutdown).await;

        self.active.send_replace(false);
        result
    }

    async fn kill(&self) {
        if !*self.active.borrow() {
            return;
        }

        warn!("Killing {} on {}", self.params.target_name, self.address);
        self.current_shutdown().cancel();

        let mut inactive = self.active.subscribe();
        let grace = Duration::from_secs(self.config.kill_grace_secs);
        if tokio::time::timeout(grace, inactive.wait_for(|active| !active))
            .await
            .is_err()
        {
            warn!(
                "{} still running {}s after kill",
                self.params.target_name, self.config.kill_grace_secs
            );
        }
    }

    async fn device_ip(&self) -> Option<String> {
        Some(self.address.clone())
    }

    fn device_output_path(&self) -> Option<String> {
        Some(DEVICE_OUTPUT_DIR.to_string())
    }
}

/// Backslash-escapes shell meta-characters and joins the flags with spaces.
fn escape_flags(flags: &[String]) -> String {
    flags
        .iter()
        .map(|flag| {
            let mut escaped = String::with_capacity(flag.len());
            for c in flag.chars() {
                if SHELL_META.contains(&c) {
                    escaped.push('\\');
                }
                escaped.push(c);
            }
            escaped
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn clean_line(line: &str) -> String {
    ANSI_ESCAPE.replace_all(line, "").replace('\r', "")
}

/// Waits for the echoed `marker`, or a line containing `prompt`.
async fn wait_ready(
    session: &mut Session,
    marker: &str,
    prompt: Option<&str>,
    timeout: Duration,
) -> LauncherResult<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match session.read_line(remaining).await {
            Err(_) => {
                return Err(LauncherError::Timeout(format!(
                    "no shell prompt after {}s",
                    timeout.as_secs()
                )));
            }
            Ok(None) => {
                return Err(LauncherError::LaunchFailure(
                    "ssh session closed during handshake".to_string(),
                ));
            }
            Ok(Some(line)) => {
                let line = line.trim();
                if line == marker || prompt.is_some_and(|p| line.contains(p)) {
                    return Ok(());
                }
            }
        }
    }
}

/// Copies session output into `output` until the run ends.
///
/// Returns 0 once the suite-ran marker was seen (after draining the summary
/// that follows it), the code carried by the completion tag, or 1 if the
/// session ended or was shut down first.
async fn stream_test_output(
    session: &mut Session,
    output: &OutputSink,
    end: &EndOfRun,
    readline_timeout: Duration,
    readline_retries: usize,
    shutdown: &CancellationToken,
) -> LauncherResult<i32> {
    let succeeded = end.complete_tag.as_ref().map(|t| format!("{} succeeded", t));
    let failed = end.complete_tag.as_ref().map(|t| format!("{} failed", t));

    let mut return_code = 1;
    let mut suite_ran = false;
    let mut timeouts = 0usize;

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = session.read_line(readline_timeout) => read,
        };

        let line = match read {
            Err(_) if suite_ran => break,
            Err(_) => {
                timeouts += 1;
                if timeouts > readline_retries {
                    return Err(LauncherError::Timeout(format!(
                        "no output for {} consecutive reads",
                        timeouts
                    )));
                }
                continue;
            }
            Ok(None) => break,
            Ok(Some(line)) => line,
        };
        timeouts = 0;

        let _ = output.write_line(&line).await;

        if let (Some(succeeded), Some(failed)) = (&succeeded, &failed) {
            if line.contains(succeeded.as_str()) {
                return_code = 0;
                break;
            }
            if let Some(position) = line.find(failed.as_str()) {
                return_code = TAG_FAILED_CODE
                    .captures(&line[position..])
                    .and_then(|caps| caps[1].parse().ok())
                    .unwrap_or(1);
                break;
            }
        } else if end
            .suite_markers
            .iter()
            .any(|marker| line.contains(marker.as_str()))
        {
            return_code = 0;
            suite_ran = true;
        }
    }

    Ok(return_code)
}
