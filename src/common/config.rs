//! Configuration for the controller
//!
//! Loaded from a single TOML file, then `SDS__*` environment overrides,
//! then command-line flags (applied by the binary).

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "SDS_CONFIG";

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Bind address for the cluster API
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Directory holding the state log and snapshot
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Directory the promoter daemon reads its plugin configs from (on every node)
    #[serde(default = "default_promoter_config_dir")]
    pub promoter_config_dir: PathBuf,

    /// Port the node agents listen on
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    /// Optional dedicated Prometheus listener
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,

    /// Commits between state snapshots
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: u64,

    /// Completed workflow intents kept after compaction
    #[serde(default = "default_intent_retention")]
    pub intent_retention: usize,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub workflows: WorkflowConfig,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3374))
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/sds-controller")
}
fn default_promoter_config_dir() -> PathBuf {
    PathBuf::from("/etc/drbd-reactor.d")
}
fn default_agent_port() -> u16 {
    3375
}
fn default_snapshot_every() -> u64 {
    1_000
}
fn default_intent_retention() -> usize {
    256
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            state_dir: default_state_dir(),
            promoter_config_dir: default_promoter_config_dir(),
            agent_port: default_agent_port(),
            metrics_addr: None,
            snapshot_every: default_snapshot_every(),
            intent_retention: default_intent_retention(),
            health: HealthConfig::default(),
            workflows: WorkflowConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from `path` (or `$SDS_CONFIG`), with environment overrides.
    ///
    /// A missing explicit path is an error; a missing `$SDS_CONFIG` file is not.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                if let Ok(env_path) = std::env::var(CONFIG_ENV) {
                    builder = builder
                        .add_source(config::File::from(PathBuf::from(env_path)).required(false));
                }
            }
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("SDS")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize::<ControllerConfig>()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize::<ControllerConfig>()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.health.failure_threshold == 0 {
            return Err(crate::Error::InvalidConfig(
                "health.failure_threshold must be at least 1".into(),
            ));
        }
        if self.health.interval_secs == 0 {
            return Err(crate::Error::InvalidConfig(
                "health.interval_secs must be at least 1".into(),
            ));
        }
        if self.workflows.parallelism == 0 {
            return Err(crate::Error::InvalidConfig(
                "workflows.parallelism must be at least 1".into(),
            ));
        }
        if self.snapshot_every == 0 {
            return Err(crate::Error::InvalidConfig(
                "snapshot_every must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between probe rounds
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Deadline for a single probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Consecutive failed probes before a node is Unreachable (K)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_health_interval() -> u64 {
    10
}
fn default_probe_timeout() -> u64 {
    2
}
fn default_failure_threshold() -> u32 {
    3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            probe_timeout_secs: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Default fan-out parallelism per workflow step
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Per-workflow-kind parallelism, keyed by kind name (e.g. `create_resource`)
    #[serde(default)]
    pub parallelism_overrides: BTreeMap<String, usize>,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

fn default_parallelism() -> usize {
    8
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            parallelism_overrides: BTreeMap::new(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl WorkflowConfig {
    pub fn parallelism_for(&self, kind: &str) -> usize {
        self.parallelism_overrides
            .get(kind)
            .copied()
            .unwrap_or(self.parallelism)
            .max(1)
    }
}

/// Deadlines, in seconds unless noted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_rpc_timeout")]
    pub rpc_secs: u64,
    #[serde(default = "default_volume_manager_timeout")]
    pub volume_manager_secs: u64,
    #[serde(default = "default_metadata_timeout")]
    pub metadata_secs: u64,
    #[serde(default = "default_bring_up_timeout")]
    pub bring_up_secs: u64,
    #[serde(default = "default_evict_timeout")]
    pub evict_secs: u64,
    #[serde(default = "default_create_total_timeout")]
    pub create_total_secs: u64,
    /// Wait for the initial syncer to report a consistent disk
    #[serde(default = "default_sync_wait")]
    pub sync_wait_secs: u64,
    /// Interval for role/disk-state polling loops
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_rpc_timeout() -> u64 {
    10
}
fn default_volume_manager_timeout() -> u64 {
    30
}
fn default_metadata_timeout() -> u64 {
    60
}
fn default_bring_up_timeout() -> u64 {
    60
}
fn default_evict_timeout() -> u64 {
    120
}
fn default_create_total_timeout() -> u64 {
    300
}
fn default_sync_wait() -> u64 {
    120
}
fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            rpc_secs: default_rpc_timeout(),
            volume_manager_secs: default_volume_manager_timeout(),
            metadata_secs: default_metadata_timeout(),
            bring_up_secs: default_bring_up_timeout(),
            evict_secs: default_evict_timeout(),
            create_total_secs: default_create_total_timeout(),
            sync_wait_secs: default_sync_wait(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn rpc(&self) -> Duration {
        Duration::from_secs(self.rpc_secs)
    }
    pub fn volume_manager(&self) -> Duration {
        Duration::from_secs(self.volume_manager_secs)
    }
    pub fn metadata(&self) -> Duration {
        Duration::from_secs(self.metadata_secs)
    }
    pub fn bring_up(&self) -> Duration {
        Duration::from_secs(self.bring_up_secs)
    }
    pub fn evict(&self) -> Duration {
        Duration::from_secs(self.evict_secs)
    }
    pub fn create_total(&self) -> Duration {
        Duration::from_secs(self.create_total_secs)
    }
    pub fn sync_wait(&self) -> Duration {
        Duration::from_secs(self.sync_wait_secs)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
