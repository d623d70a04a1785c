//! devgrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Topology instance managed when none is configured.
pub const DEFAULT_TOPOLOGY_ID: &str = "topology-netconf";

/// Ask timeout used when `[timeouts]` does not set one.
pub const DEFAULT_ASK_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub node: NodeSection,
    pub timeouts: Option<TimeoutSection>,
    pub devices: Option<Vec<DeviceEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Cluster address this node advertises as leader address.
    pub address: String,
    pub topology_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSection {
    pub ask_timeout_secs: Option<u64>,
    /// Idle time after which an open write transaction is cancelled; 0 disables.
    pub write_transaction_idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub schemaless: Option<bool>,
    pub username: Option<String>,
    pub actor_response_wait_time_secs: Option<u16>,
    pub keepalive_delay_secs: Option<u32>,
    pub connection_timeout_millis: Option<u32>,
    pub default_request_timeout_millis: Option<u32>,
    pub max_connection_attempts: Option<u32>,
    pub between_attempts_timeout_millis: Option<u32>,
    pub sleep_factor: Option<f64>,
    pub concurrent_rpc_limit: Option<u16>,
    pub reconnect_on_changed_schema: Option<bool>,
    pub tcp_only: Option<bool>,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configs that would produce unaddressable endpoints.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.address.trim().is_empty() {
            anyhow::bail!("node.address must not be empty");
        }
        let mut seen = std::collections::HashSet::new();
        for device in self.devices() {
            if device.name.is_empty() {
                anyhow::bail!("device name must not be empty");
            }
            if !seen.insert(device.name.as_str()) {
                anyhow::bail!("device {} is configured more than once", device.name);
            }
        }
        Ok(())
    }

    pub fn topology_id(&self) -> &str {
        self.node
            .topology_id
            .as_deref()
            .unwrap_or(DEFAULT_TOPOLOGY_ID)
    }

    pub fn ask_timeout(&self) -> Duration {
        let secs = self
            .timeouts
            .as_ref()
            .and_then(|t| t.ask_timeout_secs)
            .unwrap_or(DEFAULT_ASK_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }

    pub fn write_transaction_idle_timeout(&self) -> Option<Duration> {
        self.timeouts
            .as_ref()
            .and_then(|t| t.write_transaction_idle_timeout_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn devices(&self) -> &[DeviceEntry] {
        self.devices.as_deref().unwrap_or_default()
    }

    /// Scaffold a minimal devgrid.toml for a single node with one device.
    pub fn scaffold(address: &str) -> Self {
        DaemonConfig {
            node: NodeSection {
                address: address.to_string(),
                topology_id: Some(DEFAULT_TOPOLOGY_ID.to_string()),
            },
            timeouts: Some(TimeoutSection {
                ask_timeout_secs: Some(DEFAULT_ASK_TIMEOUT_SECS),
                write_transaction_idle_timeout_secs: Some(0),
            }),
            devices: Some(vec![DeviceEntry::new("dev-1", "127.0.0.1", 17830)]),
        }
    }
}

impl DeviceEntry {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        DeviceEntry {
            name: name.to_string(),
            host: host.to_string(),
            port,
            schemaless: None,
            username: None,
            actor_response_wait_time_secs: None,
            keepalive_delay_secs: None,
            connection_timeout_millis: None,
            default_request_timeout_millis: None,
            max_connection_attempts: None,
            between_attempts_timeout_millis: None,
            sleep_factor: None,
            concurrent_rpc_limit: None,
            reconnect_on_changed_schema: None,
            tcp_only: None,
        }
    }
}
