//! ---
//! rload_section: "01-core-functionality"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Shared configuration and logging primitives."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_stop_wait() -> Duration {
    Duration::from_secs(5)
}

fn default_event_capacity() -> usize {
    256
}

fn default_thread_name_prefix() -> String {
    "rload".to_owned()
}

fn default_remote_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_remote_port() -> u16 {
    1099
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_attempts() -> u32 {
    2
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_event_poll_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_agent_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], default_remote_port()))
}

fn default_queue_capacity() -> usize {
    64
}

fn default_max_nesting() -> usize {
    8
}

/// Primary configuration object for rload processes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "RLOAD_CONFIG";

    /// Load configuration from disk, respecting the `RLOAD_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Some(path) = Self::env_override() {
            let config = Self::from_path(&path)?;
            return Ok(LoadedAppConfig {
                config,
                source: Some(path),
            });
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Like [`AppConfig::load_with_source`] but falls back to defaults when no file exists.
    ///
    /// An explicit `RLOAD_CONFIG` override that cannot be read is still an error.
    pub fn load_or_default<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if Self::env_override().is_some() || candidates.iter().any(|c| c.as_ref().exists()) {
            return Self::load_with_source(candidates);
        }
        debug!("no configuration file found; using defaults");
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    fn env_override() -> Option<PathBuf> {
        std::env::var(Self::ENV_CONFIG_PATH)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.remote.validate()?;
        if self.dispatcher.queue_capacity == 0 {
            return Err(anyhow!("dispatcher.queue_capacity must be at least 1"));
        }
        if self.engine.event_capacity == 0 {
            return Err(anyhow!("engine.event_capacity must be at least 1"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Filter used when neither `RLOAD_LOG` nor `RUST_LOG` is set.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            filter: None,
        }
    }
}

/// Settings applied to every engine created by this process.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a stop waits for engine threads before abandoning them.
    #[serde(default = "default_stop_wait")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub stop_wait: Duration,
    /// Capacity of the engine event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Prefix for virtual user names, rendered as `{prefix} {group} {group_no}-{thread_no}`.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stop_wait: default_stop_wait(),
            event_capacity: default_event_capacity(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

/// Distributed-run settings consumed by the remote coordinator.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Comma delimited list of engine hosts, optionally with `:port`.
    #[serde(default)]
    pub hosts: Option<String>,
    /// Host used when `hosts` is unset or empty.
    #[serde(default = "default_remote_host")]
    pub default_host: String,
    /// Port applied to hosts that do not carry one.
    #[serde(default = "default_remote_port")]
    pub port: u16,
    /// Upper bound for every individual per-host operation.
    #[serde(default = "default_remote_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_retry_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_delay: Duration,
    /// Exit every remote engine once all started hosts have finished.
    #[serde(default)]
    pub exit_on_finish: bool,
    #[serde(default = "default_event_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub event_poll_interval: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            hosts: None,
            default_host: default_remote_host(),
            port: default_remote_port(),
            timeout: default_remote_timeout(),
            connect_attempts: default_connect_attempts(),
            retry_delay: default_retry_delay(),
            exit_on_finish: false,
            event_poll_interval: default_event_poll_interval(),
        }
    }
}

impl RemoteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_host.trim().is_empty() {
            return Err(anyhow!("remote.default_host must not be empty"));
        }
        if self.timeout.is_zero() {
            return Err(anyhow!("remote.timeout must be greater than zero"));
        }
        if self.connect_attempts == 0 {
            return Err(anyhow!("remote.connect_attempts must be at least 1"));
        }
        if self.event_poll_interval.is_zero() {
            return Err(anyhow!("remote.event_poll_interval must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_listen")]
    pub listen: SocketAddr,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: default_agent_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Deepest chain of nested synchronous dispatches allowed.
    #[serde(default = "default_max_nesting")]
    pub max_nesting: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_nesting: default_max_nesting(),
        }
    }
}
