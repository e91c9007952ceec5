//! Configuration management for the backup orchestrator.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! The resulting value is handed to each component explicitly.

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: HostConfig,
    pub backup: BackupConfig,
    pub quiesce: QuiesceConfig,
    pub transport: TransportConfig,
    pub remote: RemoteConfig,
    pub cluster: ClusterConfig,
    pub sync: SyncConfig,
    pub negotiate: NegotiateConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// Primary appliance as `[user@]host[:port]`
    #[serde(default)]
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Root directory holding snapshots and the `current` pointer
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Complete snapshots to retain after a successful run
    #[serde(default = "default_snapshots_to_keep")]
    pub snapshots_to_keep: usize,

    /// Upper bound on nodes transferring at the same time
    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuiesceConfig {
    /// Number of maintenance polls before giving up on a node
    #[serde(default = "default_cooldown_period")]
    pub cooldown_period: u32,

    /// Delay between polls in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// `pgrep -f` patterns identifying destructive maintenance processes
    #[serde(default = "default_process_patterns")]
    pub process_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,

    /// Extra arguments appended to every ssh invocation
    #[serde(default)]
    pub extra_ssh_opts: Vec<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Pass `-v` to ssh and rsync
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Data root on nodes speaking the current dialect
    #[serde(default = "default_remote_data_root")]
    pub data_root: String,

    /// Data root on nodes speaking the legacy dialect
    #[serde(default = "default_legacy_data_root")]
    pub legacy_data_root: String,

    /// Privilege wrapper for commands touching repository storage
    #[serde(default = "default_user_wrapper")]
    pub user_wrapper: String,

    /// Remote side of the sync tool, including its privilege wrapper
    #[serde(default = "default_rsync_path")]
    pub rsync_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    /// Ask the primary whether it is clustered
    Auto,
    Cluster,
    Standalone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_mode")]
    pub mode: ClusterMode,

    /// Role whose members hold repository data
    #[serde(default = "default_role")]
    pub role: String,

    /// Remote query listing members of `{role}`
    #[serde(default = "default_node_query")]
    pub node_query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_rsync_program")]
    pub rsync_program: String,

    /// Run the local sync tool under `nice`/`ionice`
    #[serde(default)]
    pub nice: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiateConfig {
    /// Port retried once when the primary refuses the configured one
    #[serde(default = "default_alternate_port")]
    pub alternate_port: u16,

    /// Oldest release accepted, e.g. "2.11.0"
    #[serde(default)]
    pub min_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/cluster-backup")
}

fn default_snapshots_to_keep() -> usize {
    10
}

fn default_max_parallel_nodes() -> usize {
    4
}

fn default_cooldown_period() -> u32 {
    60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_process_patterns() -> Vec<String> {
    vec!["git( -.*)? gc".to_string(), "nw-repack".to_string()]
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_remote_data_root() -> String {
    "/data/user".to_string()
}

fn default_legacy_data_root() -> String {
    "/data".to_string()
}

fn default_user_wrapper() -> String {
    "sudo -u git".to_string()
}

fn default_rsync_path() -> String {
    "sudo -u git rsync".to_string()
}

fn default_cluster_mode() -> ClusterMode {
    ClusterMode::Auto
}

fn default_role() -> String {
    "git".to_string()
}

fn default_node_query() -> String {
    "ghe-cluster-each -r {role} -p".to_string()
}

fn default_rsync_program() -> String {
    "rsync".to_string()
}

fn default_alternate_port() -> u16 {
    122
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            snapshots_to_keep: default_snapshots_to_keep(),
            max_parallel_nodes: default_max_parallel_nodes(),
        }
    }
}

impl Default for QuiesceConfig {
    fn default() -> Self {
        Self {
            cooldown_period: default_cooldown_period(),
            poll_interval_ms: default_poll_interval_ms(),
            process_patterns: default_process_patterns(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ssh_program: default_ssh_program(),
            extra_ssh_opts: Vec::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            verbose: false,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            data_root: default_remote_data_root(),
            legacy_data_root: default_legacy_data_root(),
            user_wrapper: default_user_wrapper(),
            rsync_path: default_rsync_path(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: default_cluster_mode(),
            role: default_role(),
            node_query: default_node_query(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rsync_program: default_rsync_program(),
            nice: false,
        }
    }
}

impl Default for NegotiateConfig {
    fn default() -> Self {
        Self {
            alternate_port: default_alternate_port(),
            min_version: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))
    }

    /// Apply `.env` and process environment overrides. A malformed value is
    /// an error rather than a silent fallback to the configured one.
    pub fn apply_env(&mut self) -> Result<()> {
        let _ = dotenvy::dotenv();
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(hostname) = lookup("BACKUP_HOSTNAME") {
            self.host.hostname = hostname;
        }
        if let Some(dir) = lookup("BACKUP_DATA_DIR") {
            self.backup.data_dir = PathBuf::from(dir);
        }
        if let Some(period) = lookup("BACKUP_COOLDOWN_PERIOD") {
            self.quiesce.cooldown_period = period.trim().parse().map_err(|_| {
                BackupError::Config(format!(
                    "BACKUP_COOLDOWN_PERIOD={period:?} is not a number of polls"
                ))
            })?;
        }
        if let Some(opts) = lookup("BACKUP_EXTRA_SSH_OPTS") {
            self.transport.extra_ssh_opts = opts.split_whitespace().map(str::to_string).collect();
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.hostname.trim().is_empty() {
            return Err(BackupError::Config(
                "host.hostname is not set (use --host or BACKUP_HOSTNAME)".into(),
            ));
        }
        if self.quiesce.cooldown_period == 0 {
            return Err(BackupError::Config(
                "quiesce.cooldown_period must be at least 1".into(),
            ));
        }
        if self.backup.max_parallel_nodes == 0 {
            return Err(BackupError::Config(
                "backup.max_parallel_nodes must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Remote data root for the negotiated dialect.
    pub fn data_root(&self, legacy: bool) -> &str {
        if legacy {
            &self.remote.legacy_data_root
        } else {
            &self.remote.data_root
        }
    }
}
