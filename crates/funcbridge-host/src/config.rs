//! funcbridge.toml configuration parser.
//!
//! Options come from an optional `funcbridge.toml` in the working
//! directory, with `FUNCBRIDGE_*` environment variables taking precedence
//! over the file. Only the script path is required.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::HostError;

const CONFIG_FILE: &str = "funcbridge.toml";
const ENV_PREFIX: &str = "FUNCBRIDGE_";

/// Resolved supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log directive, analogous to RUST_LOG.
    pub log: String,
    /// Unix socket path for the worker lifecycle channel.
    pub control_socket: PathBuf,
    /// Unix socket path for request/response chunk traffic.
    pub data_socket: PathBuf,
    /// Path to the user script the worker loads.
    pub script: PathBuf,
    /// Explicit worker executable; falls back to a PATH lookup.
    pub worker_command: Option<PathBuf>,
    /// Seconds to wait for the worker to report `ready`.
    pub ready_timeout_seconds: u64,
    /// Per-invocation handler wall-clock budget in seconds.
    pub handler_timeout_seconds: u64,
}

/// File/env shape before validation; everything optional so a partial
/// `funcbridge.toml` still parses.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    log: Option<String>,
    control_socket: Option<PathBuf>,
    data_socket: Option<PathBuf>,
    script: Option<PathBuf>,
    worker_command: Option<PathBuf>,
    ready_timeout_seconds: Option<u64>,
    handler_timeout_seconds: Option<u64>,
}

impl Config {
    /// Load from `funcbridge.toml` (if present) and the environment.
    pub fn load() -> Result<Self, HostError> {
        let file = match std::fs::read_to_string(CONFIG_FILE) {
            Ok(content) => toml::from_str(&content)
                .map_err(|err| HostError::Startup(format!("{CONFIG_FILE}: {err}")))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => RawConfig::default(),
            Err(err) => return Err(HostError::Startup(format!("{CONFIG_FILE}: {err}"))),
        };
        Self::from_sources(file, |key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Merge file values with an environment lookup. Environment wins.
    fn from_sources(
        file: RawConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, HostError> {
        let parse_secs = |key: &str, fallback: Option<u64>, default: u64| {
            match env(key) {
                Some(raw) => raw
                    .parse::<u64>()
                    .map_err(|_| HostError::Startup(format!("{ENV_PREFIX}{key} must be an integer, got {raw:?}"))),
                None => Ok(fallback.unwrap_or(default)),
            }
        };

        let script = env("SCRIPT")
            .map(PathBuf::from)
            .or(file.script)
            .ok_or_else(|| {
                HostError::Startup(format!(
                    "no script configured: set {ENV_PREFIX}SCRIPT or `script` in {CONFIG_FILE}"
                ))
            })?;

        Ok(Self {
            log: env("LOG").or(file.log).unwrap_or_else(|| "info".into()),
            control_socket: env("CONTROL_SOCKET")
                .map(PathBuf::from)
                .or(file.control_socket)
                .unwrap_or_else(|| PathBuf::from("/tmp/funcbridge-control.sock")),
            data_socket: env("DATA_SOCKET")
                .map(PathBuf::from)
                .or(file.data_socket)
                .unwrap_or_else(|| PathBuf::from("/tmp/funcbridge-data.sock")),
            script,
            worker_command: env("WORKER_COMMAND").map(PathBuf::from).or(file.worker_command),
            ready_timeout_seconds: parse_secs("READY_TIMEOUT_SECONDS", file.ready_timeout_seconds, 5)?,
            handler_timeout_seconds: parse_secs(
                "HANDLER_TIMEOUT_SECONDS",
                file.handler_timeout_seconds,
                30,
            )?,
        })
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_seconds)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_seconds)
    }

    pub fn init_tracing(&self) {
        let env_filter = tracing_subscriber::EnvFilter::builder().parse_lossy(&self.log);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_line_number(true)
                    .with_file(true),
            )
            .init();
    }
}
