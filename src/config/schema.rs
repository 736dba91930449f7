//! Configuration schema definitions for testlauncher.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunnerConfig               - Shard file, build command, minidump printer
//! ├── platforms.<name>           - PlatformConfig
//! │   ├── launcher               - local | adb | ssh | portal (inferred if omitted)
//! │   ├── test_targets / filters / env / target_env
//! │   ├── local                  - LocalConfig (host binaries)
//! │   ├── adb                    - AdbConfig (Android devices)
//! │   ├── ssh                    - SshConfig (Raspberry Pi, RDK)
//! │   └── portal                 - PortalConfig (device portal over HTTPS)
//! └── applications.<name>        - ApplicationConfig
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::filter::TestFilter;

/// Environment variables, ordered by name.
pub type EnvMap = BTreeMap<String, String>;

/// Root configuration structure for testlauncher.
///
/// # Example
///
/// ```
/// use testlauncher::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [platforms.linux-x64x11]
///     test_targets = ["nplb"]
///
///     [applications.cobalt]
///     test_targets = ["renderer_test"]
/// "#).unwrap();
///
/// assert!(config.platforms.contains_key("linux-x64x11"));
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Runner-wide settings.
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Known platforms, keyed by platform name.
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,

    /// Applications whose targets are added to a platform's own.
    #[serde(default)]
    pub applications: BTreeMap<String, ApplicationConfig>,

    /// Directory relative paths in the file are resolved against.
    ///
    /// Set by [`load_config`](super::load_config) to the config file's parent.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Config {
    /// Resolves a path from the config file against [`Config::base_dir`].
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// The shard configuration file, if one is configured or present.
    pub fn sharding_config_path(&self) -> Option<PathBuf> {
        match &self.runner.sharding_config {
            Some(path) => Some(self.resolve_path(path)),
            None => {
                let default = self.base_dir.join(crate::sharding::SHARDING_CONFIG_FILE);
                default.exists().then_some(default)
            }
        }
    }
}

/// Runner-wide settings.
///
/// # Example
///
/// ```toml
/// [runner]
/// sharding_config = "sharding_configuration.json"
/// minidump_printer = ["python3", "tools/print_minidump.py"]
/// build_command = ["ninja"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Shard configuration file. Defaults to `sharding_configuration.json`
    /// next to the config file, when it exists.
    pub sharding_config: Option<PathBuf>,

    /// Command that formats a minidump; the dump path is appended.
    #[serde(default)]
    pub minidump_printer: Vec<String>,

    /// Build tool invoked by `--build`.
    ///
    /// Default: `["ninja"]`
    #[serde(default = "default_build_command")]
    pub build_command: Vec<String>,

    /// Where crash dumps fetched from devices are saved.
    ///
    /// Default: `~/.testlauncher/crashdumps`
    #[serde(default = "default_crashdump_dir")]
    pub crashdump_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            sharding_config: None,
            minidump_printer: Vec::new(),
            build_command: default_build_command(),
            crashdump_dir: default_crashdump_dir(),
        }
    }
}

fn default_build_command() -> Vec<String> {
    vec!["ninja".to_string()]
}

fn default_crashdump_dir() -> PathBuf {
    PathBuf::from("~/.testlauncher/crashdumps")
}

/// Which launcher backend drives a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherKind {
    /// Host processes.
    Local,
    /// Android devices over ADB.
    Adb,
    /// Devices reachable over SSH.
    Ssh,
    /// Devices driven through a device portal REST API.
    Portal,
}

impl LauncherKind {
    /// Infers the backend from a platform name.
    ///
    /// | Prefix | Backend |
    /// |--------|---------|
    /// | `android` | `adb` |
    /// | `raspi`, `rdk` | `ssh` |
    /// | `xb1`, `xbox` | `portal` |
    /// | anything else | `local` |
    pub fn infer(platform: &str) -> Self {
        if platform.starts_with("android") {
            LauncherKind::Adb
        } else if platform.starts_with("raspi") || platform.starts_with("rdk") {
            LauncherKind::Ssh
        } else if platform.starts_with("xb1") || platform.starts_with("xbox") {
            LauncherKind::Portal
        } else {
            LauncherKind::Local
        }
    }

    /// Lowercase name, as written in config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            LauncherKind::Local => "local",
            LauncherKind::Adb => "adb",
            LauncherKind::Ssh => "ssh",
            LauncherKind::Portal => "portal",
        }
    }
}

/// Settings for one platform.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PlatformConfig {
    /// Backend override; inferred from the platform name when omitted.
    pub launcher: Option<LauncherKind>,

    /// The device has an IPv6 loopback.
    #[serde(default)]
    pub ipv6: bool,

    /// Test binaries built for this platform.
    #[serde(default)]
    pub test_targets: Vec<String>,

    /// Parameters appended to every target's argv.
    #[serde(default)]
    pub extra_target_params: Vec<String>,

    /// Environment for every target.
    #[serde(default)]
    pub env: EnvMap,

    /// Environment for specific targets, keyed by target name.
    #[serde(default)]
    pub target_env: BTreeMap<String, EnvMap>,

    /// Filters applied when resolving targets.
    #[serde(default)]
    pub filters: Vec<TestFilter>,

    /// Host process settings.
    #[serde(default)]
    pub local: LocalConfig,

    /// ADB settings.
    #[serde(default)]
    pub adb: AdbConfig,

    /// SSH settings.
    #[serde(default)]
    pub ssh: SshConfig,

    /// Device portal settings.
    #[serde(default)]
    pub portal: PortalConfig,
}

impl PlatformConfig {
    /// The backend for `platform`, honoring an explicit override.
    pub fn launcher_kind(&self, platform: &str) -> LauncherKind {
        self.launcher.unwrap_or_else(|| LauncherKind::infer(platform))
    }
}

/// Targets, filters and environment an application adds to a platform.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ApplicationConfig {
    /// Application test binaries.
    #[serde(default)]
    pub test_targets: Vec<String>,

    /// Application filters.
    #[serde(default)]
    pub filters: Vec<TestFilter>,

    /// Environment for every application target.
    #[serde(default)]
    pub env: EnvMap,

    /// Environment for specific targets.
    #[serde(default)]
    pub target_env: BTreeMap<String, EnvMap>,
}

/// Settings for host-executed binaries.
///
/// # Example
///
/// ```toml
/// [platforms.win-win32.local]
/// binary_suffix = ".exe"
/// minidump = true
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LocalConfig {
    /// Appended to the target name to form the binary file name.
    #[serde(default)]
    pub binary_suffix: String,

    /// Look for `<binary>.dmp` after every run.
    #[serde(default)]
    pub minidump: bool,
}

/// Settings for Android devices.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `package` | `dev.cobalt.coat` |
/// | `activity` | `dev.cobalt.app.MainActivity` |
/// | `start_grace_secs` | 2.0 |
/// | `crash_grace_secs` | 1.0 |
/// | `device_timeout_secs` | 60 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdbConfig {
    /// Path to the `adb` executable. Looked up on `PATH`, then under
    /// `$ANDROID_HOME/platform-tools`, when omitted.
    pub adb_path: Option<PathBuf>,

    /// Application package.
    #[serde(default = "default_package")]
    pub package: String,

    /// Activity started for every run.
    #[serde(default = "default_activity")]
    pub activity: String,

    /// Pause between force-stopping the package and starting it again.
    #[serde(default = "default_start_grace")]
    pub start_grace_secs: f64,

    /// Delay before logcat is stopped once a crash is seen.
    #[serde(default = "default_crash_grace")]
    pub crash_grace_secs: f64,

    /// Longest wait for the device to come online before each run.
    #[serde(default = "default_device_timeout")]
    pub device_timeout_secs: u64,

    /// Runtime permissions granted after install.
    #[serde(default = "default_permissions")]
    pub permissions: Vec<String>,

    /// logcat tag filter.
    #[serde(default = "default_logcat_filter")]
    pub logcat_filter: Vec<String>,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            adb_path: None,
            package: default_package(),
            activity: default_activity(),
            start_grace_secs: default_start_grace(),
            crash_grace_secs: default_crash_grace(),
            device_timeout_secs: default_device_timeout(),
            permissions: default_permissions(),
            logcat_filter: default_logcat_filter(),
        }
    }
}

fn default_package() -> String {
    "dev.cobalt.coat".to_string()
}

fn default_activity() -> String {
    "dev.cobalt.app.MainActivity".to_string()
}

fn default_start_grace() -> f64 {
    2.0
}

fn default_crash_grace() -> f64 {
    1.0
}

fn default_device_timeout() -> u64 {
    60
}

fn default_permissions() -> Vec<String> {
    vec![
        "android.permission.GET_ACCOUNTS".to_string(),
        "android.permission.RECORD_AUDIO".to_string(),
    ]
}

fn default_logcat_filter() -> Vec<String> {
    [
        "*:F",
        "DEBUG:*",
        "System.err:*",
        "starboard:*",
        "starboard_media:*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Settings for devices reached over SSH.
///
/// # Example
///
/// ```toml
/// [platforms.raspi-2.ssh]
/// user = "pi"
/// key_path = "~/.ssh/id_rsa"
/// remote_dir = "/home/pi/test"
/// complete_tag = true
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshConfig {
    /// Remote user.
    ///
    /// Default: `pi`
    #[serde(default = "default_ssh_user")]
    pub user: String,

    /// Password for `sshpass`. Empty means key-based authentication.
    #[serde(default)]
    pub password: String,

    /// Private key.
    pub key_path: Option<PathBuf>,

    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Disable host key verification. Devices are reflashed often.
    #[serde(default = "default_true")]
    pub disable_host_key_check: bool,

    /// Directory on the device the install tree is copied into.
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,

    /// Subdirectory of the output directory holding per-target install trees.
    #[serde(default = "default_install_subdir")]
    pub install_subdir: String,

    /// Prompt that marks the session as ready. A random marker is echoed
    /// and matched when unset.
    pub prompt: Option<String>,

    /// Make the remote shell print `<tag> succeeded` or `<tag> failed` once
    /// the binary exits, and read the exit status from it.
    #[serde(default)]
    pub complete_tag: bool,

    /// Lines marking the end of a test suite run.
    #[serde(default = "default_suite_markers")]
    pub suite_ran_markers: Vec<String>,

    /// `pkill` pattern for leftovers of earlier runs. Defaults to the
    /// target name.
    pub cleanup_pattern: Option<String>,

    /// Connection and handshake timeout.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Handshake retries.
    #[serde(default = "default_handshake_retries")]
    pub handshake_retries: usize,

    /// Timeout of a single line read.
    #[serde(default = "default_readline_timeout")]
    pub readline_timeout_secs: u64,

    /// Consecutive line read timeouts absorbed before the run times out.
    #[serde(default = "default_readline_retries")]
    pub readline_retries: usize,

    /// rsync retries.
    #[serde(default = "default_transfer_retries")]
    pub transfer_retries: usize,

    /// How long `kill` waits for a run to wind down.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            password: String::new(),
            key_path: None,
            port: default_ssh_port(),
            disable_host_key_check: true,
            remote_dir: default_remote_dir(),
            install_subdir: default_install_subdir(),
            prompt: None,
            complete_tag: false,
            suite_ran_markers: default_suite_markers(),
            cleanup_pattern: None,
            connect_timeout_secs: default_connect_timeout(),
            handshake_retries: default_handshake_retries(),
            readline_timeout_secs: default_readline_timeout(),
            readline_retries: default_readline_retries(),
            transfer_retries: default_transfer_retries(),
            kill_grace_secs: default_kill_grace(),
        }
    }
}

fn default_ssh_user() -> String {
    "pi".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

fn default_remote_dir() -> String {
    "/home/pi/test".to_string()
}

fn default_install_subdir() -> String {
    "install".to_string()
}

fn default_suite_markers() -> Vec<String> {
    vec!["test suite ran".to_string(), "test suites ran".to_string()]
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_handshake_retries() -> usize {
    3
}

fn default_readline_timeout() -> u64 {
    1
}

fn default_readline_retries() -> usize {
    900
}

fn default_transfer_retries() -> usize {
    2
}

fn default_kill_grace() -> u64 {
    3
}

/// Settings for devices driven through a device portal.
///
/// # Example
///
/// ```toml
/// [platforms.xb1.portal]
/// user = "devkit"
/// password = "secret"
/// package_family = "Cobalt_8wekyb3d8bbwe"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortalConfig {
    /// Portal user.
    #[serde(default)]
    pub user: String,

    /// Portal password.
    #[serde(default)]
    pub password: String,

    /// Portal HTTPS port.
    #[serde(default = "default_portal_port")]
    pub port: u16,

    /// Package family name of the installed application.
    #[serde(default)]
    pub package_family: String,

    /// Prefix shared by the application's sub-packages.
    #[serde(default)]
    pub package_prefix: String,

    /// Application id within the package, used to launch it.
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Subdirectory of the output directory holding `<target>.appx`.
    #[serde(default = "default_appx_subdir")]
    pub appx_subdir: String,

    /// Known folder the application writes crash dumps into.
    #[serde(default = "default_dump_folder")]
    pub dump_folder: String,

    /// Port the application connects to for its arguments.
    #[serde(default = "default_net_args_port")]
    pub net_args_port: u16,

    /// Port the application streams its log to.
    #[serde(default = "default_net_log_port")]
    pub net_log_port: u16,

    /// Interval between "still running" queries.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long to wait for killed processes to go away.
    #[serde(default = "default_process_timeout")]
    pub process_timeout_secs: u64,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: String::new(),
            port: default_portal_port(),
            package_family: String::new(),
            package_prefix: String::new(),
            app_id: default_app_id(),
            appx_subdir: default_appx_subdir(),
            dump_folder: default_dump_folder(),
            net_args_port: default_net_args_port(),
            net_log_port: default_net_log_port(),
            poll_interval_ms: default_poll_interval(),
            process_timeout_secs: default_process_timeout(),
        }
    }
}

fn default_portal_port() -> u16 {
    11443
}

fn default_app_id() -> String {
    "App".to_string()
}

fn default_appx_subdir() -> String {
    "appx".to_string()
}

fn default_dump_folder() -> String {
    "LocalAppData".to_string()
}

fn default_net_args_port() -> u16 {
    49355
}

fn default_net_log_port() -> u16 {
    49353
}

fn default_poll_interval() -> u64 {
    500
}

fn default_process_timeout() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launcher_inference() {
        assert_eq!(LauncherKind::infer("android-arm"), LauncherKind::Adb);
        assert_eq!(LauncherKind::infer("raspi-2"), LauncherKind::Ssh);
        assert_eq!(LauncherKind::infer("rdk"), LauncherKind::Ssh);
        assert_eq!(LauncherKind::infer("xb1"), LauncherKind::Portal);
        assert_eq!(LauncherKind::infer("linux-x64x11"), LauncherKind::Local);
    }

    #[test]
    fn test_explicit_launcher_wins() {
        let platform: PlatformConfig = toml::from_str(r#"launcher = "local""#).unwrap();
        assert_eq!(platform.launcher_kind("android-x86"), LauncherKind::Local);
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str(
            r#"
            [platforms.android-arm]
            test_targets = ["nplb"]

            [platforms.android-arm.adb]
            start_grace_secs = 5
            "#,
        )
        .unwrap();

        let android = &config.platforms["android-arm"];
        assert_eq!(android.adb.start_grace_secs, 5.0);
        assert_eq!(android.adb.crash_grace_secs, 1.0);
        assert_eq!(android.adb.device_timeout_secs, 60);
        assert_eq!(android.adb.package, "dev.cobalt.coat");
        assert_eq!(android.ssh.readline_retries, 900);
        assert_eq!(android.portal.net_args_port, 49355);
        assert_eq!(config.runner.build_command, vec!["ninja"]);
    }

    #[test]
    fn test_resolve_path() {
        let config = Config {
            base_dir: PathBuf::from("/etc/testlauncher"),
            ..Default::default()
        };
        assert_eq!(
            config.resolve_path(Path::new("shards.json")),
            PathBuf::from("/etc/testlauncher/shards.json")
        );
        assert_eq!(
            config.resolve_path(Path::new("/abs/shards.json")),
            PathBuf::from("/abs/shards.json")
        );
    }
}
