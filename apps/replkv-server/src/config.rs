//! Server configuration.
//!
//! Loads and validates configuration from YAML files or environment variables.

use replkv_raft::RaftConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
///
/// Example YAML:
/// ```yaml
/// node_id: "n1"
/// data_dir: "/var/lib/replkv"
/// bootstrap: true
/// raft:
///   heartbeat_interval_ms: 150
///   election_timeout_min_ms: 300
///   election_timeout_max_ms: 600
///   snapshot_threshold: 8192
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique node identifier
    pub node_id: String,

    /// Data directory for the Raft log and snapshots
    pub data_dir: PathBuf,

    /// Start a new cluster with this node as the only voter
    #[serde(default)]
    pub bootstrap: bool,

    /// Static initial voter set; takes precedence over `bootstrap`.
    /// The process has no network transport, so `node_id` is the only
    /// voter it accepts.
    #[serde(default)]
    pub voters: Vec<String>,

    /// Consensus tuning
    #[serde(default)]
    pub raft: RaftSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftSection {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,

    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    #[serde(default = "default_trailing_logs")]
    pub trailing_logs: u64,
}

impl Default for RaftSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            commit_timeout_ms: default_commit_timeout_ms(),
            snapshot_threshold: default_snapshot_threshold(),
            trailing_logs: default_trailing_logs(),
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    150
}

fn default_election_timeout_min_ms() -> u64 {
    300
}

fn default_election_timeout_max_ms() -> u64 {
    600
}

fn default_rpc_timeout_ms() -> u64 {
    100
}

fn default_commit_timeout_ms() -> u64 {
    5000
}

fn default_snapshot_threshold() -> u64 {
    8192
}

fn default_trailing_logs() -> u64 {
    1024
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("Failed to read config file: {}", e)))?;

        let config: ServerConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    ///
    /// Supported variables:
    /// - REPLKV_NODE_ID
    /// - REPLKV_DATA_DIR
    /// - REPLKV_BOOTSTRAP (`true` or `1`)
    /// - REPLKV_VOTERS (comma-separated)
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let node_id = std::env::var("REPLKV_NODE_ID")
            .map_err(|_| ConfigError::MissingField("REPLKV_NODE_ID".to_string()))?;

        let data_dir = std::env::var("REPLKV_DATA_DIR")
            .map_err(|_| ConfigError::MissingField("REPLKV_DATA_DIR".to_string()))?;

        let bootstrap = std::env::var("REPLKV_BOOTSTRAP")
            .map(|v| matches!(v.trim(), "true" | "1"))
            .unwrap_or(false);

        let voters = std::env::var("REPLKV_VOTERS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let config = ServerConfig {
            node_id,
            data_dir: PathBuf::from(data_dir),
            bootstrap,
            voters,
            raft: RaftSection::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::InvalidField(
                "node_id cannot be empty".to_string(),
            ));
        }

        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir).map_err(|e| {
                ConfigError::InvalidField(format!("Cannot create data_dir: {}", e))
            })?;
        }

        if !self.data_dir.is_dir() {
            return Err(ConfigError::InvalidField(
                "data_dir exists but is not a directory".to_string(),
            ));
        }

        if let Some(remote) = self.voters.iter().find(|v| **v != self.node_id) {
            return Err(ConfigError::InvalidField(format!(
                "voter {} is unreachable: only node_id {} can vote without a network transport",
                remote, self.node_id
            )));
        }

        self.to_raft_config()
            .validate()
            .map_err(ConfigError::InvalidField)?;

        Ok(())
    }

    /// Get the Raft data directory.
    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir.join("raft")
    }

    pub fn to_raft_config(&self) -> RaftConfig {
        RaftConfig {
            heartbeat_interval: Duration::from_millis(self.raft.heartbeat_interval_ms),
            election_timeout_min: Duration::from_millis(self.raft.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(self.raft.election_timeout_max_ms),
            rpc_timeout: Duration::from_millis(self.raft.rpc_timeout_ms),
            commit_timeout: Duration::from_millis(self.raft.commit_timeout_ms),
            snapshot_threshold: self.raft.snapshot_threshold,
            trailing_logs: self.raft.trailing_logs,
            ..RaftConfig::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field: {0}")]
    InvalidField(String),
}
