//! Configuration types for dedupio
//!
//! The node reads one TOML file; every section and field is optional and
//! falls back to the defaults below.

use crate::error::Result;
use crate::types::NodeRole;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub volume: VolumeConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Parse a configuration document
    pub fn from_toml(doc: &str) -> Result<Self> {
        Ok(toml::from_str(doc)?)
    }

    /// Load from a file, or fall back to defaults when the file is absent
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let doc = std::fs::read_to_string(path)?;
        Self::from_toml(&doc)
    }
}

/// Node identity
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable node name, also used as the group address
    #[serde(default = "default_node_name")]
    pub name: String,
    /// Role advertised to the group
    #[serde(default)]
    pub role: NodeRole,
    /// Directory for chunk data swept by garbage collection
    #[serde(default = "default_chunk_dir")]
    pub chunk_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            role: NodeRole::default(),
            chunk_dir: default_chunk_dir(),
        }
    }
}

/// The local volume whose metadata namespace imports land in
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Logical volume name
    #[serde(default = "default_volume_name")]
    pub name: String,
    /// Physical root of the volume's metadata namespace
    #[serde(default = "default_volume_path")]
    pub path: PathBuf,
    /// Path of the volume's own configuration document
    #[serde(default = "default_volume_config_path")]
    pub config_path: PathBuf,
    /// Fixed directory of the local deduplication database
    #[serde(default = "default_dedup_db_dir")]
    pub dedup_db_dir: PathBuf,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            name: default_volume_name(),
            path: default_volume_path(),
            config_path: default_volume_config_path(),
            dedup_db_dir: default_dedup_db_dir(),
        }
    }
}

/// Garbage collection schedule and policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// Enable the periodic trigger
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cron expression with a leading seconds field
    #[serde(default = "default_gc_schedule")]
    pub schedule: String,
    /// Chunks referenced more recently than this are never removed
    #[serde(default = "default_gc_min_age_secs")]
    pub min_age_secs: u64,
    /// Bypass the soft-delete grace period
    #[serde(default)]
    pub force: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: default_gc_schedule(),
            min_age_secs: default_gc_min_age_secs(),
            force: false,
        }
    }
}

/// Group broadcast behaviour
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Volumes this node advertises to the group
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Wait for every member instead of the first response
    #[serde(default)]
    pub wait_for_all: bool,
    /// Response collection timeout in milliseconds (0 = unbounded)
    #[serde(default)]
    pub response_timeout_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus listener; disabled when unset
    #[serde(default)]
    pub listen: Option<SocketAddr>,
}

fn default_node_name() -> String {
    "dedupio-node".to_string()
}

fn default_chunk_dir() -> PathBuf {
    PathBuf::from("/var/lib/dedupio/chunks")
}

fn default_volume_name() -> String {
    "pool0".to_string()
}

fn default_volume_path() -> PathBuf {
    PathBuf::from("/var/lib/dedupio/volume/files")
}

fn default_volume_config_path() -> PathBuf {
    PathBuf::from("/etc/dedupio/pool0-volume-cfg.xml")
}

fn default_dedup_db_dir() -> PathBuf {
    PathBuf::from("/var/lib/dedupio/volume/ddb")
}

fn default_gc_schedule() -> String {
    "0 59 23 * * *".to_string()
}

fn default_gc_min_age_secs() -> u64 {
    6 * 60 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_true() -> bool {
    true
}
