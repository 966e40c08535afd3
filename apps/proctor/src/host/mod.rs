//! Test host process lifecycle.
//!
//! The orchestrator never spawns a test host itself. It goes through a
//! [`TestHostManager`], which either spawns the configured executable or
//! hands the start info to a caller-supplied [`TestHostLauncher`] (for
//! example one that attaches a debugger).

pub mod registry;

use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::transport::ConnectionInfo;

pub use registry::{HostManagerFactory, HostManagerRegistry, HostManagerSelector};

pub const ENV_ENDPOINT: &str = "PROCTOR_ENDPOINT";
pub const ENV_ROLE: &str = "PROCTOR_ROLE";
pub const ENV_PARENT_PID: &str = "PROCTOR_PARENT_PID";

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to start test host {program:?}: {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("custom launcher failed: {0}")]
    Launcher(String),
    #[error("test host already launched")]
    AlreadyLaunched,
}

/// Everything needed to start a test host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStartInfo {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl HostStartInfo {
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null());
        for (key, value) in &self.env {
            command.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

/// A running test host, however it was started.
pub trait HostProcess: Send {
    fn id(&self) -> Option<u32>;
    fn has_exited(&mut self) -> bool;
    fn kill(&mut self) -> io::Result<()>;
}

impl HostProcess for Child {
    fn id(&self) -> Option<u32> {
        Some(Child::id(self))
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.try_wait(), Ok(None))
    }

    fn kill(&mut self) -> io::Result<()> {
        match Child::kill(self) {
            Ok(()) => self.wait().map(|_| ()),
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(err),
        }
    }
}

pub trait TestHostLauncher: Send + Sync {
    fn launch_test_host(
        &self,
        start_info: &HostStartInfo,
        connection: &ConnectionInfo,
    ) -> Result<Box<dyn HostProcess>, HostError>;
}

/// Handle reported back to the request after a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostHandle {
    pub pid: Option<u32>,
    pub custom_launcher: bool,
}

pub trait TestHostManager: Send {
    fn name(&self) -> &str;

    fn launch(&mut self, connection: &ConnectionInfo) -> Result<HostHandle, HostError>;

    fn set_custom_launcher(&mut self, launcher: Arc<dyn TestHostLauncher>);

    fn has_custom_launcher(&self) -> bool;

    /// True when no process is running, including when none was launched.
    fn has_exited(&mut self) -> bool;

    /// Kills the process if it is still running. Idempotent.
    fn terminate(&mut self);

    /// Gives the process `grace` to exit on its own, then terminates it.
    /// Returns true when it had to be killed.
    fn shutdown(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while !self.has_exited() {
            if Instant::now() >= deadline {
                self.terminate();
                return true;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
        self.terminate();
        false
    }
}

/// Spawns `executable [base_args] --endpoint <addr> --role <role>`.
pub struct DefaultTestHostManager {
    name: String,
    executable: PathBuf,
    base_args: Vec<String>,
    launcher: Option<Arc<dyn TestHostLauncher>>,
    process: Option<Box<dyn HostProcess>>,
}

impl DefaultTestHostManager {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            name: "default".to_string(),
            executable: executable.into(),
            base_args: Vec::new(),
            launcher: None,
            process: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn start_info(&self, connection: &ConnectionInfo) -> HostStartInfo {
        let endpoint = connection.endpoint.to_string();
        let role = connection.role.as_str().to_string();
        let mut args = self.base_args.clone();
        args.extend([
            "--endpoint".to_string(),
            endpoint.clone(),
            "--role".to_string(),
            role.clone(),
        ]);
        HostStartInfo {
            program: self.executable.clone(),
            args,
            env: vec![
                (ENV_ENDPOINT.to_string(), endpoint),
                (ENV_ROLE.to_string(), role),
                (ENV_PARENT_PID.to_string(), std::process::id().to_string()),
            ],
            working_dir: None,
        }
    }
}

impl TestHostManager for DefaultTestHostManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(&mut self, connection: &ConnectionInfo) -> Result<HostHandle, HostError> {
        if self.process.is_some() {
            return Err(HostError::AlreadyLaunched);
        }
        let start_info = self.start_info(connection);
        let process: Box<dyn HostProcess> = match &self.launcher {
            Some(launcher) => launcher.launch_test_host(&start_info, connection)?,
            None => {
                let child =
                    start_info
                        .to_command()
                        .spawn()
                        .map_err(|source| HostError::Launch {
                            program: start_info.program.clone(),
                            source,
                        })?;
                Box::new(child)
            }
        };
        let handle = HostHandle {
            pid: process.id(),
            custom_launcher: self.launcher.is_some(),
        };
        info!(
            manager = %self.name,
            pid = ?handle.pid,
            endpoint = %connection.endpoint,
            custom_launcher = handle.custom_launcher,
            "test host launched"
        );
        self.process = Some(process);
        Ok(handle)
    }

    fn set_custom_launcher(&mut self, launcher: Arc<dyn TestHostLauncher>) {
        self.launcher = Some(launcher);
    }

    fn has_custom_launcher(&self) -> bool {
        self.launcher.is_some()
    }

    fn has_exited(&mut self) -> bool {
        self.process
            .as_mut()
            .is_none_or(|process| process.has_exited())
    }

    fn terminate(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        if process.has_exited() {
            debug!(manager = %self.name, pid = ?process.id(), "test host already exited");
            return;
        }
        match process.kill() {
            Ok(()) => info!(manager = %self.name, pid = ?process.id(), "test host terminated"),
            Err(err) => warn!(
                manager = %self.name,
                pid = ?process.id(),
                error = %err,
                "failed to terminate test host"
            ),
        }
    }
}

impl Drop for DefaultTestHostManager {
    fn drop(&mut self) {
        self.terminate();
    }
}
