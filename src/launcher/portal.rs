//! Device portal launcher for Xbox consoles.
//!
//! The console is driven entirely through its device portal REST API: the
//! target's package is installed, launched, polled and inspected for crash
//! dumps over HTTPS. The application cannot read a command line, so it
//! connects back to two TCP ports on the host at startup:
//!
//! ```text
//!   host                                   console
//!   ────                                   ───────
//!   :net_args_port  ◄── connect ───────────  app   (receives args, one per line)
//!   :net_log_port   ◄── connect ───────────  app   (streams stdout)
//!   portal client   ── HTTPS :11443 ───────►  device portal
//! ```
//!
//! # Example Configuration
//!
//! ```toml
//! [platforms.xb1.portal]
//! user = "devkit"
//! password = "secret"
//! package_family = "Cobalt_8wekyb3d8bbwe"
//! package_prefix = "Cobalt"
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    APPLICATION_CRASHED, APPLICATION_STOPPED, CRASH_RETURN_CODE, Launcher, LauncherContext,
    LauncherError, LauncherParams, LauncherResult, minidump, unless_killed,
};
use crate::config::PortalConfig;
use crate::sink::OutputSink;

/// Time allowed for the log socket to drain after the process exits.
const LOG_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between install-state and restart checks.
const PORTAL_POLL: Duration = Duration::from_secs(1);

/// Checks before an install or a restart is abandoned.
const PORTAL_POLL_LIMIT: usize = 300;

/// An installed application package.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstalledPackage {
    /// Full package name, unique per installed version.
    pub package_full_name: String,
    /// Family name shared by every version of the package.
    pub package_family_name: String,
}

/// A process running on the device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessInfo {
    /// Executable name, e.g. `nplb.exe`.
    pub image_name: String,
    /// Process id.
    pub process_id: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PackageList {
    #[serde(default)]
    installed_packages: Vec<InstalledPackage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProcessList {
    #[serde(default)]
    processes: Vec<ProcessInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileList {
    #[serde(default)]
    items: Vec<FileItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileItem {
    name: String,
}

/// The device portal operations the launcher relies on.
#[async_trait]
pub trait DevicePortal: Send + Sync {
    /// Packages installed on the device.
    async fn installed_packages(&self) -> LauncherResult<Vec<InstalledPackage>>;

    /// Removes a package.
    async fn uninstall(&self, package_full_name: &str) -> LauncherResult<()>;

    /// Uploads and installs a package bundle, waiting for completion.
    async fn install(&self, bundle: &Path) -> LauncherResult<()>;

    /// Clears temporary files left by previous deployments.
    async fn delete_temp_files(&self) -> LauncherResult<()>;

    /// Reboots the device and waits for the portal to come back.
    async fn restart(&self) -> LauncherResult<()>;

    /// Processes running on the device.
    async fn processes(&self) -> LauncherResult<Vec<ProcessInfo>>;

    /// Terminates a process.
    async fn kill_process(&self, pid: u32) -> LauncherResult<()>;

    /// Starts `app_id` from an installed package.
    async fn launch(&self, app_id: &str, package_full_name: &str) -> LauncherResult<()>;

    /// Force-stops every process of a package.
    async fn stop_app(&self, package_full_name: &str) -> LauncherResult<()>;

    /// File names in an application's known folder.
    async fn list_files(
        &self,
        known_folder: &str,
        package_full_name: &str,
    ) -> LauncherResult<Vec<String>>;

    /// Contents of a file in an application's known folder.
    async fn fetch_file(
        &self,
        known_folder: &str,
        package_full_name: &str,
        file_name: &str,
    ) -> LauncherResult<Vec<u8>>;

    /// Removes a file from an application's known folder.
    async fn delete_file(
        &self,
        known_folder: &str,
        package_full_name: &str,
        file_name: &str,
    ) -> LauncherResult<()>;
}

#[derive(Debug, Clone, Copy)]
enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

struct PortalResponse {
    status: u16,
    body: Vec<u8>,
}

/// [`DevicePortal`] over HTTPS.
///
/// Consoles serve the portal with a self-signed certificate, so
/// verification is disabled. Requests are blocking and run on the
/// blocking thread pool.
#[derive(Clone)]
pub struct HttpPortal {
    agent: ureq::Agent,
    base_url: String,
    authorization: String,
}

impl HttpPortal {
    /// Client for the portal at `address`.
    pub fn new(address: &str, config: &PortalConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .tls_config(
                ureq::tls::TlsConfig::builder()
                    .disable_verification(true)
                    .build(),
            )
            .timeout_global(Some(Duration::from_secs(600)))
            .http_status_as_error(false)
            .build()
            .into();

        let credentials = BASE64.encode(format!("{}:{}", config.user, config.password));
        let host = if address.contains(':') && !address.starts_with('[') {
            format!("[{}]", address)
        } else {
            address.to_string()
        };

        Self {
            agent,
            base_url: format!("https://{}:{}", host, config.port),
            authorization: format!("Basic {}", credentials),
        }
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> String {
        let mut url = format!("{}{}", self.base_url, path);
        for (i, (key, value)) in query.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(key);
            url.push('=');
            url.extend(utf8_percent_encode(value, NON_ALPHANUMERIC));
        }
        url
    }

    fn send_blocking(
        &self,
        method: Method,
        url: &str,
        body: Option<(String, Vec<u8>)>,
    ) -> LauncherResult<PortalResponse> {
        let auth = self.authorization.as_str();
        let result = match (method, body) {
            (Method::Get, _) => self.agent.get(url).header("Authorization", auth).call(),
            (Method::Delete, _) => self.agent.delete(url).header("Authorization", auth).call(),
            (Method::Post, Some((content_type, body))) => self
                .agent
                .post(url)
                .header("Authorization", auth)
                .header("Content-Type", &content_type)
                .send(&body[..]),
            (Method::Post, None) => self
                .agent
                .post(url)
                .header("Authorization", auth)
                .send_empty(),
        };

        let mut response =
            result.map_err(|e| LauncherError::Http(format!("{} {}: {}", method.as_str(), url, e)))?;
        let status = response.status().as_u16();
        let body = response
            .body_mut()
            .with_config()
            .limit(u64::MAX)
            .read_to_vec()
            .map_err(|e| LauncherError::Http(format!("{} {}: {}", method.as_str(), url, e)))?;

        Ok(PortalResponse { status, body })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<(String, Vec<u8>)>,
    ) -> LauncherResult<PortalResponse> {
        let url = self.url(path, query);
        debug!("portal: {} {}", method.as_str(), url);

        let portal = self.clone();
        tokio::task::spawn_blocking(move || portal.send_blocking(method, &url, body))
            .await
            .map_err(|e| LauncherError::Http(format!("portal request aborted: {}", e)))?
    }

    /// Like [`send`](Self::send), failing on any non-2xx status.
    async fn send_ok(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<(String, Vec<u8>)>,
    ) -> LauncherResult<Vec<u8>> {
        let response = self.send(method, path, query, body).await?;
        if (200..300).contains(&response.status) {
            Ok(response.body)
        } else {
            Err(LauncherError::Http(format!(
                "{} {} returned {}: {}",
                method.as_str(),
                path,
                response.status,
                String::from_utf8_lossy(&response.body).trim()
            )))
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> LauncherResult<T> {
        let body = self.send_ok(Method::Get, path, query, None).await?;
        serde_json::from_slice(&body)
            .map_err(|e| LauncherError::Http(format!("GET {}: invalid response: {}", path, e)))
    }
}

#[async_trait]
impl DevicePortal for HttpPortal {
    async fn installed_packages(&self) -> LauncherResult<Vec<InstalledPackage>> {
        let list: PackageList = self.get_json("/api/app/packagemanager/packages", &[]).await?;
        Ok(list.installed_packages)
    }

    async fn uninstall(&self, package_full_name: &str) -> LauncherResult<()> {
        self.send_ok(
            Method::Delete,
            "/api/app/packagemanager/package",
            &[("package", package_full_name)],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn install(&self, bundle: &Path) -> LauncherResult<()> {
        let file_name = bundle
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| LauncherError::ArtifactNotFound(bundle.to_path_buf()))?;
        let contents = tokio::fs::read(bundle).await?;

        let boundary = format!("----testlauncher{}", uuid::Uuid::new_v4().simple());
        let mut body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{file_name}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(&contents);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        self.send_ok(
            Method::Post,
            "/api/app/packagemanager/package",
            &[("package", &file_name)],
            Some((format!("multipart/form-data; boundary={}", boundary), body)),
        )
        .await?;

        // 204 while the install is still running.
        for _ in 0..PORTAL_POLL_LIMIT {
            let state = self
                .send(Method::Get, "/api/app/packagemanager/state", &[], None)
                .await?;
            match state.status {
                204 => tokio::time::sleep(PORTAL_POLL).await,
                200 => return Ok(()),
                status => {
                    return Err(LauncherError::DeployFailure(format!(
                        "install of {} failed with {}: {}",
                        file_name,
                        status,
                        String::from_utf8_lossy(&state.body).trim()
                    )));
                }
            }
        }
        Err(LauncherError::Timeout(format!(
            "install of {} did not finish",
            file_name
        )))
    }

    async fn delete_temp_files(&self) -> LauncherResult<()> {
        let response = self
            .send(
                Method::Delete,
                "/api/filesystem/apps/folder",
                &[("knownfolderid", "DevelopmentFiles"), ("path", "\\temp")],
                None,
            )
            .await?;
        // Nothing to delete.
        if response.status == 404 || (200..300).contains(&response.status) {
            Ok(())
        } else {
            Err(LauncherError::Http(format!(
                "deleting temporary files returned {}",
                response.status
            )))
        }
    }

    async fn restart(&self) -> LauncherResult<()> {
        self.send_ok(Method::Post, "/api/control/restart", &[], None)
            .await?;

        // The portal keeps answering for a moment before the reboot starts.
        tokio::time::sleep(PORTAL_POLL * 10).await;
        for _ in 0..PORTAL_POLL_LIMIT {
            match self.send(Method::Get, "/api/os/info", &[], None).await {
                Ok(response) if (200..300).contains(&response.status) => return Ok(()),
                _ => tokio::time::sleep(PORTAL_POLL).await,
            }
        }
        Err(LauncherError::Timeout(
            "device portal did not come back after restart".to_string(),
        ))
    }

    async fn processes(&self) -> LauncherResult<Vec<ProcessInfo>> {
        let list: ProcessList = self.get_json("/api/resourcemanager/processes", &[]).await?;
        Ok(list.processes)
    }

    async fn kill_process(&self, pid: u32) -> LauncherResult<()> {
        self.send_ok(
            Method::Delete,
            "/api/taskmanager/process",
            &[("pid", &pid.to_string())],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn launch(&self, app_id: &str, package_full_name: &str) -> LauncherResult<()> {
        let app_id = BASE64.encode(app_id);
        let package = BASE64.encode(package_full_name);
        self.send_ok(
            Method::Post,
            "/api/taskmanager/app",
            &[("appid", &app_id), ("package", &package)],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn stop_app(&self, package_full_name: &str) -> LauncherResult<()> {
        let package = BASE64.encode(package_full_name);
        self.send_ok(
            Method::Delete,
            "/api/taskmanager/app",
            &[("package", &package), ("forcestop", "true")],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn list_files(
        &self,
        known_folder: &str,
        package_full_name: &str,
    ) -> LauncherResult<Vec<String>> {
        let list: FileList = self
            .get_json(
                "/api/filesystem/apps/files",
                &[
                    ("knownfolderid", known_folder),
                    ("packagefullname", package_full_name),
                ],
            )
            .await?;
        Ok(list.items.into_iter().map(|item| item.name).collect())
    }

    async fn fetch_file(
        &self,
        known_folder: &str,
        package_full_name: &str,
        file_name: &str,
    ) -> LauncherResult<Vec<u8>> {
        self.send_ok(
            Method::Get,
            "/api/filesystem/apps/file",
            &[
                ("knownfolderid", known_folder),
                ("packagefullname", package_full_name),
                ("filename", file_name),
            ],
            None,
        )
        .await
    }

    async fn delete_file(
        &self,
        known_folder: &str,
        package_full_name: &str,
        file_name: &str,
    ) -> LauncherResult<()> {
        self.send_ok(
            Method::Delete,
            "/api/filesystem/apps/file",
            &[
                ("knownfolderid", known_folder),
                ("packagefullname", package_full_name),
                ("filename", file_name),
            ],
            None,
        )
        .await
        .map(|_| ())
    }
}

/// Launcher for consoles driven through the device portal.
pub struct PortalLauncher {
    params: LauncherParams,
    config: PortalConfig,
    address: String,
    portal: Arc<dyn DevicePortal>,
    minidump_printer: Vec<String>,
    crashdump_dir: PathBuf,
    /// Token the next kill cancels. `None` once a run has returned.
    shutdown: Mutex<Option<CancellationToken>>,
    running_package: Mutex<Option<String>>,
}

impl PortalLauncher {
    /// Creates a launcher talking HTTPS to the console, falling back to
    /// `XBOX_ADDR` for the device address.
    pub fn new(
        params: LauncherParams,
        config: &PortalConfig,
        context: &LauncherContext,
    ) -> LauncherResult<Self> {
        let address = if params.device_id.is_empty() {
            std::env::var("XBOX_ADDR").unwrap_or_default()
        } else {
            params.device_id.clone()
        };
        if address.trim().is_empty() {
            return Err(LauncherError::MissingDeviceAddress {
                platform: params.platform.clone(),
                env_var: "XBOX_ADDR",
            });
        }

        let address = address.trim().to_string();
        let portal = Arc::new(HttpPortal::new(&address, config));
        Ok(Self::with_portal(params, config, context, address, portal))
    }

    /// Creates a launcher over any [`DevicePortal`].
    pub fn with_portal(
        params: LauncherParams,
        config: &PortalConfig,
        context: &LauncherContext,
        address: String,
        portal: Arc<dyn DevicePortal>,
    ) -> Self {
        Self {
            params,
            config: config.clone(),
            address,
            portal,
            minidump_printer: context.minidump_printer.clone(),
            crashdump_dir: context.crashdump_dir.clone(),
            shutdown: Mutex::new(Some(CancellationToken::new())),
            running_package: Mutex::new(None),
        }
    }

    fn bundle_path(&self) -> PathBuf {
        self.params
            .out_directory
            .join(&self.config.appx_subdir)
            .join(format!("{}.appx", self.params.target_name))
    }

    fn executable(&self) -> String {
        format!("{}.exe", self.params.target_name)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    fn set_running_package(&self, package: Option<String>) {
        *self
            .running_package
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = package;
    }

    async fn uninstall_matching<F>(&self, matches: F) -> LauncherResult<()>
    where
        F: Fn(&InstalledPackage) -> bool,
    {
        for package in self.portal.installed_packages().await? {
            if matches(&package) {
                info!("Uninstalling {}", package.package_full_name);
                self.portal.uninstall(&package.package_full_name).await?;
            }
        }
        Ok(())
    }

    async fn deploy(&self) -> LauncherResult<()> {
        let bundle = self.bundle_path();
        if !bundle.is_file() {
            return Err(LauncherError::ArtifactNotFound(bundle));
        }

        let family = self.config.package_family.as_str();
        self.uninstall_matching(|p| p.package_family_name == family)
            .await?;
        self.portal.delete_temp_files().await?;

        let Err(first) = self.portal.install(&bundle).await else {
            return Ok(());
        };
        warn!("Install failed ({}), restarting the device", first);

        let prefix = if self.config.package_prefix.is_empty() {
            family
        } else {
            self.config.package_prefix.as_str()
        };
        self.uninstall_matching(|p| p.package_full_name.starts_with(prefix))
            .await?;
        self.portal.restart().await?;

        self.portal.install(&bundle).await.map_err(|e| {
            LauncherError::DeployFailure(format!("install failed after restart: {}", e))
        })
    }

    async fn matching_pids(&self) -> LauncherResult<Vec<u32>> {
        let executable = self.executable();
        Ok(self
            .portal
            .processes()
            .await?
            .into_iter()
            .filter(|p| p.image_name.eq_ignore_ascii_case(&executable))
            .map(|p| p.process_id)
            .collect())
    }

    async fn kill_running_instances(&self) -> LauncherResult<()> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.process_timeout_secs);
        loop {
            let pids = self.matching_pids().await?;
            if pids.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LauncherError::Timeout(format!(
                    "{} still running after {}s",
                    self.executable(),
                    self.config.process_timeout_secs
                )));
            }
            for pid in pids {
                debug!("Killing stale {} ({})", self.executable(), pid);
                if let Err(e) = self.portal.kill_process(pid).await {
                    warn!("Failed to kill process {}: {}", pid, e);
                }
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }

    /// Launches the app and streams its log until it exits or is killed.
    ///
    /// Returns the code from an application-stopped log line, if any.
    async fn run_app(
        &self,
        package_full_name: &str,
        shutdown: &CancellationToken,
    ) -> LauncherResult<Option<i32>> {
        let args_listener = TcpListener::bind(("0.0.0.0", self.config.net_args_port)).await?;
        let log_listener = TcpListener::bind(("0.0.0.0", self.config.net_log_port)).await?;

        let args_task = tokio::spawn(serve_args(
            args_listener,
            self.params.target_params.clone(),
        ));
        let mut log_task = tokio::spawn(stream_log(log_listener, self.params.output.clone()));

        let app_id = format!("{}!{}", self.config.package_family, self.config.app_id);
        let launched = unless_killed(
            shutdown,
            "launch",
            self.portal.launch(&app_id, package_full_name),
        )
        .await;

        if launched.is_ok() {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval()) => {}
                }
                match self.matching_pids().await {
                    Ok(pids) if pids.is_empty() => break,
                    Ok(_) => {}
                    Err(e) => debug!("Process query failed: {}", e),
                }
            }
        }

        args_task.abort();
        let stop_code = if launched.is_err() {
            log_task.abort();
            None
        } else {
            match tokio::time::timeout(LOG_FLUSH_TIMEOUT, &mut log_task).await {
                Ok(Ok(code)) => code,
                Ok(Err(e)) => {
                    debug!("Log stream ended abnormally: {}", e);
                    None
                }
                Err(_) => {
                    log_task.abort();
                    None
                }
            }
        };

        launched?;
        Ok(stop_code)
    }

    /// `<target>*.dmp` files in the package's dump folder.
    async fn dump_names(&self, package_full_name: &str) -> LauncherResult<Vec<String>> {
        Ok(self
            .portal
            .list_files(&self.config.dump_folder, package_full_name)
            .await?
            .into_iter()
            .filter(|name| name.starts_with(&self.params.target_name) && name.ends_with(".dmp"))
            .collect())
    }

    /// Deletes dumps left on the device by earlier runs.
    async fn purge_dumps(&self, package_full_name: &str) -> LauncherResult<()> {
        for name in self.dump_names(package_full_name).await? {
            debug!("Deleting stale dump {}", name);
            self.portal
                .delete_file(&self.config.dump_folder, package_full_name, &name)
                .await?;
        }
        Ok(())
    }

    /// Moves `<target>*.dmp` files from the device to the crashdump
    /// directory and prints them.
    ///
    /// Returns `true` if any were found.
    async fn collect_dumps(&self, package_full_name: &str) -> LauncherResult<bool> {
        let dumps = self.dump_names(package_full_name).await?;
        if dumps.is_empty() {
            return Ok(false);
        }

        tokio::fs::create_dir_all(&self.crashdump_dir).await?;
        for name in dumps {
            let contents = self
                .portal
                .fetch_file(&self.config.dump_folder, package_full_name, &name)
                .await?;
            let local = self.crashdump_dir.join(&name);
            tokio::fs::write(&local, contents).await?;
            if let Err(e) = self
                .portal
                .delete_file(&self.config.dump_folder, package_full_name, &name)
                .await
            {
                warn!("Failed to delete {} from the device: {}", name, e);
            }
            minidump::print_minidump(&self.minidump_printer, &local, &self.params.output).await;
        }
        Ok(true)
    }

    async fn dry_run(&self) -> LauncherResult<i32> {
        let output = &self.params.output;
        if !self.params.launcher_args.noinstall {
            let _ = output
                .write_line(&format!("install {}", self.bundle_path().display()))
                .await;
        }
        let _ = output
            .write_line(&format!(
                "launch {}!{} on {} with {}",
                self.config.package_family,
                self.config.app_id,
                self.address,
                self.params.target_params.join(" ")
            ))
            .await;
        Ok(0)
    }

    async fn run_on_device(&self, shutdown: &CancellationToken) -> LauncherResult<i32> {
        if !self.params.launcher_args.noinstall {
            unless_killed(shutdown, "deploy", self.deploy()).await?;
        }

        let package = unless_killed(shutdown, "package query", self.portal.installed_packages())
            .await?
            .into_iter()
            .find(|p| p.package_family_name == self.config.package_family)
            .ok_or_else(|| {
                LauncherError::LaunchFailure(format!(
                    "package family {} is not installed",
                    self.config.package_family
                ))
            })?;
        let full_name = package.package_full_name;

        unless_killed(
            shutdown,
            "stale process cleanup",
            self.kill_running_instances(),
        )
        .await?;
        unless_killed(shutdown, "stale dump cleanup", self.purge_dumps(&full_name)).await?;

        self.set_running_package(Some(full_name.clone()));
        let stop_code = self.run_app(&full_name, shutdown).await;
        self.set_running_package(None);
        let stop_code = stop_code?;

        if self.collect_dumps(&full_name).await? {
            let _ = self.params.output.write_line(APPLICATION_CRASHED).await;
            return Ok(CRASH_RETURN_CODE);
        }

        Ok(match stop_code {
            Some(code) => code,
            None if shutdown.is_cancelled() => 1,
            None => 0,
        })
    }
}

#[async_trait]
impl Launcher for PortalLauncher {
    fn name(&self) -> &'static str {
        "portal"
    }

    fn params(&self) -> &LauncherParams {
        &self.params
    }

    async fn run(&self) -> LauncherResult<i32> {
        if self.params.launcher_args.dryrun {
            return self.dry_run().await;
        }

        // A kill that landed before this run started is honored.
        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_or_insert_with(CancellationToken::new)
            .clone();

        let result = if shutdown.is_cancelled() {
            Err(LauncherError::Cancelled(format!(
                "{} on {}",
                self.params.target_name, self.address
            )))
        } else {
            self.run_on_device(&shutdown).await
        };

        *self
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        result
    }

    async fn kill(&self) {
        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let Some(shutdown) = shutdown else {
            return;
        };
        shutdown.cancel();

        let package = self
            .running_package
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let Some(package) = package else {
            return;
        };

        warn!("Stopping {} on {}", package, self.address);
        if let Err(e) = self.portal.stop_app(&package).await {
            warn!("Failed to stop {}: {}", package, e);
        }
    }

    async fn device_ip(&self) -> Option<String> {
        Some(self.address.clone())
    }
}

/// Sends `args` to the first connection, one per line.
async fn serve_args(listener: TcpListener, args: Vec<String>) -> std::io::Result<()> {
    let (mut stream, peer) = listener.accept().await?;
    debug!("Sending {} arguments to {}", args.len(), peer);
    for arg in &args {
        stream.write_all(arg.as_bytes()).await?;
        stream.write_all(b"\n").await?;
    }
    stream.shutdown().await
}

/// Copies the first connection's lines into `output`.
///
/// Returns the code carried by an application-stopped line.
async fn stream_log(listener: TcpListener, output: OutputSink) -> Option<i32> {
    let (stream, peer) = listener.accept().await.ok()?;
    debug!("Log stream connected from {}", peer);

    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut stop_code = None;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&buf).replace('\r', "");
        let line = line.trim_end_matches('\n');
        let _ = output.write_line(line).await;

        if let Some(rest) = line.split(APPLICATION_STOPPED).nth(1) {
            stop_code = rest.trim().parse().ok().or(stop_code);
        }
    }
    stop_code
}
