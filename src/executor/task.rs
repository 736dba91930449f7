//! Runs a launcher in the background.
//!
//! A [`LauncherTask`] lets the runner wait for a launcher while its
//! [`LineReader`](super::LineReader) drains the output concurrently. Errors
//! and panics are reported to the launcher's sink and recorded as a failed
//! return code; they never propagate to the runner.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::launcher::Launcher;

/// How a [`LauncherTask`]'s return code was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCodeStatus {
    /// The launcher returned a code.
    Ok,
    /// The task has not finished.
    NotStarted,
    /// The launcher failed before producing a code.
    Na,
}

type ReturnCode = Arc<Mutex<(ReturnCodeStatus, i32)>>;

/// A launcher running on its own task.
pub struct LauncherTask {
    launcher: Arc<dyn Launcher>,
    return_code: ReturnCode,
    handle: Option<JoinHandle<()>>,
}

impl LauncherTask {
    /// Wraps `launcher`. Nothing runs until [`start`](Self::start).
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self {
            launcher,
            return_code: Arc::new(Mutex::new((ReturnCodeStatus::NotStarted, 0))),
            handle: None,
        }
    }

    /// Spawns [`Launcher::run`]. Calling it again while running is a no-op.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }

        let launcher = self.launcher.clone();
        let return_code = self.return_code.clone();
        self.handle = Some(tokio::spawn(async move {
            let result = match launcher.run().await {
                Ok(code) => (ReturnCodeStatus::Ok, code),
                Err(e) => {
                    report_error(launcher.as_ref(), &e.to_string()).await;
                    (ReturnCodeStatus::Na, 1)
                }
            };
            set(&return_code, result);
        }));
    }

    /// Waits for the launcher to finish.
    pub async fn join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        if let Err(e) = handle.await {
            let message = if e.is_panic() {
                "launcher panicked".to_string()
            } else {
                e.to_string()
            };
            report_error(self.launcher.as_ref(), &message).await;
            set(&self.return_code, (ReturnCodeStatus::Na, 1));
        }
    }

    /// Stops the launcher.
    pub async fn kill(&self) {
        debug!("Killing {}", self.launcher.params().target_name);
        self.launcher.kill().await;
    }

    /// The recorded status and code.
    pub fn return_code(&self) -> (ReturnCodeStatus, i32) {
        *self
            .return_code
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn set(return_code: &ReturnCode, value: (ReturnCodeStatus, i32)) {
    *return_code
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
}

async fn report_error(launcher: &dyn Launcher, message: &str) {
    let target = &launcher.params().target_name;
    error!("{} failed: {}", target, message);
    let _ = launcher
        .params()
        .output
        .write_line(&format!("Error while running {}: {}", target, message))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{LauncherError, LauncherParams, LauncherResult};
    use crate::sink::OutputSink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    enum Behavior {
        Exit(i32),
        Fail,
        Panic,
    }

    struct FakeLauncher {
        params: LauncherParams,
        behavior: Behavior,
        killed: AtomicBool,
    }

    impl FakeLauncher {
        fn new(behavior: Behavior, output: OutputSink) -> Arc<Self> {
            Arc::new(Self {
                params: LauncherParams::new("linux-x64x11", "nplb", "devel", "/out", output),
                behavior,
                killed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn params(&self) -> &LauncherParams {
            &self.params
        }

        async fn run(&self) -> LauncherResult<i32> {
            match self.behavior {
                Behavior::Exit(code) => Ok(code),
                Behavior::Fail => Err(LauncherError::LaunchFailure("device offline".into())),
                Behavior::Panic => panic!("boom"),
            }
        }

        async fn kill(&self) {
            self.killed.store(true, Ordering::SeqCst);
        }

        async fn device_ip(&self) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn test_records_exit_code() {
        let launcher = FakeLauncher::new(Behavior::Exit(3), OutputSink::null());
        let mut task = LauncherTask::new(launcher);
        assert_eq!(task.return_code(), (ReturnCodeStatus::NotStarted, 0));

        task.start();
        task.join().await;
        assert_eq!(task.return_code(), (ReturnCodeStatus::Ok, 3));
    }

    #[tokio::test]
    async fn test_error_goes_to_sink() {
        let (sink, captured) = OutputSink::capture();
        let mut task = LauncherTask::new(FakeLauncher::new(Behavior::Fail, sink));

        task.start();
        task.join().await;
        assert_eq!(task.return_code(), (ReturnCodeStatus::Na, 1));
        assert_eq!(
            captured.contents(),
            "Error while running nplb: Launch failed: device offline\n"
        );
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let (sink, captured) = OutputSink::capture();
        let mut task = LauncherTask::new(FakeLauncher::new(Behavior::Panic, sink));

        task.start();
        task.join().await;
        assert_eq!(task.return_code(), (ReturnCodeStatus::Na, 1));
        assert!(captured.contents().contains("launcher panicked"));
    }

    #[tokio::test]
    async fn test_kill_delegates() {
        let launcher = FakeLauncher::new(Behavior::Exit(0), OutputSink::null());
        let task = LauncherTask::new(launcher.clone());
        task.kill().await;
        assert!(launcher.killed.load(Ordering::SeqCst));
    }
}
