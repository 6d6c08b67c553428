//! Worker process management.
//!
//! Spawns the worker executable with a scrubbed environment; the only
//! variables it sees are the `FUNCBRIDGE_*` rendezvous paths. The child
//! is killed when the handle is dropped so a supervisor crash never
//! leaves an orphan behind.

use std::env;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::Config;
use crate::HostError;

const WORKER_BIN: &str = "funcbridge-worker";

/// Everything the spawn needs, detached from the full config.
pub struct Paths {
    pub control_socket: PathBuf,
    pub data_socket: PathBuf,
    pub script: PathBuf,
    pub worker_command: Option<PathBuf>,
}

impl From<&Config> for Paths {
    fn from(config: &Config) -> Self {
        Self {
            control_socket: config.control_socket.clone(),
            data_socket: config.data_socket.clone(),
            script: config.script.clone(),
            worker_command: config.worker_command.clone(),
        }
    }
}

pub struct WorkerProcess {
    paths: Paths,
    child: Option<Child>,
}

impl WorkerProcess {
    pub fn new(paths: Paths) -> Self {
        Self { paths, child: None }
    }

    pub fn spawn(&mut self) -> Result<(), HostError> {
        if self.child.is_some() {
            warn!("worker process is already running");
            return Ok(());
        }

        let program = match self.paths.worker_command {
            Some(ref path) => path.clone(),
            None => which(WORKER_BIN).ok_or_else(|| {
                HostError::Startup(format!("{WORKER_BIN} not found on PATH"))
            })?,
        };

        let mut command = Command::new(program);
        command
            .env_clear()
            .env("FUNCBRIDGE_CONTROL_SOCKET", &self.paths.control_socket)
            .env("FUNCBRIDGE_DATA_SOCKET", &self.paths.data_socket)
            .env("FUNCBRIDGE_SCRIPT", &self.paths.script)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = command.spawn()?;
        info!(pid = child.id(), "worker process spawned");
        self.child = Some(child);
        Ok(())
    }

    /// Wait for the child to exit. Consumes the handle's child slot.
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus, HostError> {
        match self.child.take() {
            Some(mut child) => Ok(child.wait().await?),
            None => Err(HostError::Startup("no worker process to wait for".into())),
        }
    }

    pub async fn kill(&mut self) -> Result<(), HostError> {
        if let Some(mut child) = self.child.take() {
            info!(pid = child.id(), "killing worker process");
            child.kill().await?;
        }
        Ok(())
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take()
            && let Some(pid) = child.id()
        {
            info!(pid, "dropping supervisor handle, killing worker");
            let _ = child.start_kill();
        }
    }
}

fn which(bin: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    for dir in env::split_paths(&paths) {
        let candidate = dir.join(bin);
        if candidate.is_file()
            && candidate
                .metadata()
                .map(|m| m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        {
            return Some(candidate);
        }
    }
    None
}
