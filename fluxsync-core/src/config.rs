//! Agent configuration
//!
//! This module provides:
//! - The TOML configuration model with defaults for every general setting
//! - Validation of intervals, worker counts and node definitions
//! - Node lookup by name

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "conf/fluxsync.toml";

const DEFAULT_RW_MAX_RETRIES: u32 = 5;
const DEFAULT_RW_RETRY_DELAY_SECS: u64 = 10;

/// FluxSync agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// General settings
    #[serde(default)]
    pub general: GeneralSettings,
    /// Status API settings
    #[serde(default)]
    pub http: HttpSettings,
    /// Known database nodes
    #[serde(default, rename = "influxdb")]
    pub nodes: Vec<NodeConfig>,
}

/// Initial replication performed before HA monitoring starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialReplication {
    #[default]
    None,
    Schema,
    Data,
    Both,
}

impl InitialReplication {
    pub fn includes_schema(self) -> bool {
        matches!(self, InitialReplication::Schema | InitialReplication::Both)
    }

    pub fn includes_data(self) -> bool {
        matches!(self, InitialReplication::Data | InitialReplication::Both)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Identifier of this agent instance
    pub instance_id: String,
    /// Log level used in HA monitor mode
    pub log_level: String,
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Default master node name
    pub master_db: String,
    /// Default slave node name
    pub slave_db: String,
    /// Node probe interval in seconds
    pub check_interval_secs: u64,
    /// Supervisor tick interval in seconds
    pub min_sync_interval_secs: u64,
    pub initial_replication: InitialReplication,
    /// Time span of one sync chunk in seconds
    pub data_chunk_duration_secs: u64,
    /// Upper bound on any replicated window in seconds
    pub max_retention_interval_secs: u64,
    /// Attempts per read/write (0 selects the default)
    pub rw_max_retries: u32,
    /// Delay between read/write attempts in seconds (0 selects the default)
    pub rw_retry_delay_secs: u64,
    /// Concurrent measurement workers per chunk
    pub num_workers: usize,
    /// Maximum points per write call
    pub max_points_on_single_write: usize,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            instance_id: "fluxsync01".to_string(),
            log_level: "info".to_string(),
            log_dir: PathBuf::from("./log"),
            master_db: "influxdb01".to_string(),
            slave_db: "influxdb02".to_string(),
            check_interval_secs: 10,
            min_sync_interval_secs: 20,
            initial_replication: InitialReplication::None,
            data_chunk_duration_secs: 3600,
            max_retention_interval_secs: 30 * 24 * 3600,
            rw_max_retries: DEFAULT_RW_MAX_RETRIES,
            rw_retry_delay_secs: DEFAULT_RW_RETRY_DELAY_SECS,
            num_workers: 4,
            max_points_on_single_write: 50_000,
        }
    }
}

impl GeneralSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn min_sync_interval(&self) -> Duration {
        Duration::from_secs(self.min_sync_interval_secs)
    }

    pub fn data_chunk_duration(&self) -> Duration {
        Duration::from_secs(self.data_chunk_duration_secs)
    }

    pub fn max_retention_interval(&self) -> Duration {
        Duration::from_secs(self.max_retention_interval_secs)
    }

    pub fn rw_max_retries(&self) -> u32 {
        if self.rw_max_retries == 0 {
            DEFAULT_RW_MAX_RETRIES
        } else {
            self.rw_max_retries
        }
    }

    pub fn rw_retry_delay(&self) -> Duration {
        if self.rw_retry_delay_secs == 0 {
            Duration::from_secs(DEFAULT_RW_RETRY_DELAY_SECS)
        } else {
            Duration::from_secs(self.rw_retry_delay_secs)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Status API listen address
    pub bind_addr: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4090".to_string(),
        }
    }
}

/// Identity and credentials of one database node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// Base URL, e.g. `http://127.0.0.1:8086/`
    pub location: String,
    #[serde(default)]
    pub admin_user: String,
    #[serde(default)]
    pub admin_passwd: String,
    #[serde(default = "default_node_timeout")]
    pub timeout_secs: u64,
}

fn default_node_timeout() -> u64 {
    10
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            location: "http://127.0.0.1:8086/".to_string(),
            admin_user: String::new(),
            admin_passwd: String::new(),
            timeout_secs: default_node_timeout(),
        }
    }
}

impl NodeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl AgentConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        info!(
            "Loaded configuration from {} ({} nodes)",
            path.display(),
            config.nodes.len()
        );
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let general = &self.general;

        if general.check_interval_secs == 0 {
            return Err(anyhow!("Check interval cannot be 0"));
        }

        if general.min_sync_interval_secs == 0 {
            return Err(anyhow!("Minimum sync interval cannot be 0"));
        }

        if general.data_chunk_duration_secs == 0 {
            return Err(anyhow!("Data chunk duration cannot be 0"));
        }

        if general.max_retention_interval_secs == 0 {
            return Err(anyhow!("Max retention interval cannot be 0"));
        }

        if general.num_workers == 0 {
            return Err(anyhow!("Number of workers cannot be 0"));
        }

        if general.max_points_on_single_write == 0 {
            return Err(anyhow!("Max points on single write cannot be 0"));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                return Err(anyhow!("Node name cannot be empty"));
            }
            if !seen.insert(node.name.as_str()) {
                return Err(anyhow!("Duplicate node name: {}", node.name));
            }

            let url = reqwest::Url::parse(&node.location)
                .with_context(|| format!("Invalid location for node {}: {}", node.name, node.location))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(anyhow!(
                    "Node {} location must use http or https: {}",
                    node.name,
                    node.location
                ));
            }
        }

        Ok(())
    }

    /// Find a node definition by name
    pub fn find_node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[general]
instance_id = "agent-test"
master_db = "influxdb01"
slave_db = "influxdb02"
check_interval_secs = 5
initial_replication = "both"
rw_max_retries = 0
rw_retry_delay_secs = 0

[http]
bind_addr = "127.0.0.1:4091"

[[influxdb]]
name = "influxdb01"
location = "http://127.0.0.1:8086/"
admin_user = "admin"
admin_passwd = "admin"

[[influxdb]]
name = "influxdb02"
location = "http://127.0.0.1:8087/"
timeout_secs = 3
"#;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.general.check_interval_secs, 10);
        assert_eq!(config.general.min_sync_interval_secs, 20);
        assert_eq!(config.general.max_points_on_single_write, 50_000);
        assert_eq!(config.http.bind_addr, "0.0.0.0:4090");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sample() {
        let config = AgentConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.general.instance_id, "agent-test");
        assert_eq!(config.general.check_interval(), Duration::from_secs(5));
        assert_eq!(config.general.data_chunk_duration(), Duration::from_secs(3600));
        assert_eq!(config.general.initial_replication, InitialReplication::Both);
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.find_node("influxdb02").unwrap().timeout(), Duration::from_secs(3));
        assert_eq!(config.find_node("influxdb01").unwrap().timeout_secs, 10);
        assert!(config.find_node("influxdb03").is_none());
    }

    #[test]
    fn test_zero_retry_settings_fall_back() {
        let config = AgentConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.general.rw_max_retries(), 5);
        assert_eq!(config.general.rw_retry_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_config_validation() {
        let mut config = AgentConfig::from_toml(SAMPLE).unwrap();
        assert!(config.validate().is_ok());

        config.general.num_workers = 0;
        assert!(config.validate().is_err());
        config.general.num_workers = 2;

        config.general.data_chunk_duration_secs = 0;
        assert!(config.validate().is_err());
        config.general.data_chunk_duration_secs = 60;

        config.nodes[1].name = "influxdb01".to_string();
        assert!(config.validate().is_err());
        config.nodes[1].name = "influxdb02".to_string();

        config.nodes[1].location = "ftp://host/".to_string();
        assert!(config.validate().is_err());
        config.nodes[1].location = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_initial_replication_modes() {
        assert!(InitialReplication::Both.includes_schema());
        assert!(InitialReplication::Both.includes_data());
        assert!(InitialReplication::Schema.includes_schema());
        assert!(!InitialReplication::Schema.includes_data());
        assert!(!InitialReplication::None.includes_schema());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fluxsync.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.http.bind_addr, "127.0.0.1:4091");

        let missing = temp_dir.path().join("missing.toml");
        assert!(AgentConfig::load(&missing).is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = AgentConfig::from_toml(SAMPLE).unwrap();
        let text = config.to_toml().unwrap();
        let parsed = AgentConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.nodes, config.nodes);
    }
}
