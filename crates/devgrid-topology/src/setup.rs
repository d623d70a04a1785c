//! Per-device setup snapshot and per-node shared resources.

use std::sync::Arc;
use std::time::Duration;

use devgrid_core::{DaemonConfig, DeviceEntry};
use devgrid_endpoint::{EndpointPath, EndpointResult, EndpointSystem};
use devgrid_state::{DeviceConfig, DeviceIdentity, StateStore};

use crate::connector::DeviceConnector;
use crate::messages::Message;
use crate::mount::MountPointService;

/// Node-wide settings shared by every device context.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologySettings {
    pub topology_id: String,
    /// Ask timeout for devices that do not configure their own.
    pub default_ask_timeout: Duration,
    /// Idle time after which an open write transaction is cancelled.
    pub write_tx_idle_timeout: Option<Duration>,
}

impl TopologySettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            topology_id: config.topology_id().to_string(),
            default_ask_timeout: config.ask_timeout(),
            write_tx_idle_timeout: config.write_transaction_idle_timeout(),
        }
    }
}

impl Default for TopologySettings {
    fn default() -> Self {
        Self {
            topology_id: devgrid_core::DEFAULT_TOPOLOGY_ID.to_string(),
            default_ask_timeout: Duration::from_secs(devgrid_core::DEFAULT_ASK_TIMEOUT_SECS),
            write_tx_idle_timeout: None,
        }
    }
}

/// Everything a device role needs to know about its configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSetup {
    pub topology_id: String,
    pub config: DeviceConfig,
    pub default_ask_timeout: Duration,
    pub write_tx_idle_timeout: Option<Duration>,
}

impl DeviceSetup {
    pub fn new(settings: &TopologySettings, config: DeviceConfig) -> Self {
        Self {
            topology_id: settings.topology_id.clone(),
            config,
            default_ask_timeout: settings.default_ask_timeout,
            write_tx_idle_timeout: settings.write_tx_idle_timeout,
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.config.identity()
    }

    pub fn device_name(&self) -> &str {
        &self.config.name
    }

    /// Deadline for every ask issued on behalf of this device.
    pub fn ask_timeout(&self) -> Duration {
        match self.config.actor_response_wait_time_secs {
            Some(secs) => Duration::from_secs(u64::from(secs)),
            None => self.default_ask_timeout,
        }
    }

    /// Same setup with a replacement configuration record.
    pub fn with_config(&self, config: DeviceConfig) -> Self {
        Self {
            config,
            ..self.clone()
        }
    }
}

/// Configuration record for a device declared in `devgrid.toml`.
pub fn device_config_from_entry(entry: &DeviceEntry) -> DeviceConfig {
    DeviceConfig {
        schemaless: entry.schemaless.unwrap_or(false),
        username: entry.username.clone(),
        actor_response_wait_time_secs: entry.actor_response_wait_time_secs,
        keepalive_delay_secs: entry.keepalive_delay_secs,
        connection_timeout_millis: entry.connection_timeout_millis,
        default_request_timeout_millis: entry.default_request_timeout_millis,
        max_connection_attempts: entry.max_connection_attempts,
        between_attempts_timeout_millis: entry.between_attempts_timeout_millis,
        sleep_factor: entry.sleep_factor,
        concurrent_rpc_limit: entry.concurrent_rpc_limit,
        reconnect_on_changed_schema: entry.reconnect_on_changed_schema,
        tcp_only: entry.tcp_only,
        ..DeviceConfig::new(&entry.name, &entry.host, entry.port)
    }
}

/// Name of the owner endpoint for `device` held by the node at `node_address`.
pub fn owner_endpoint_name(device: &str, node_address: &str) -> String {
    format!("{device}_master_{node_address}")
}

/// Path of the owner endpoint for `device` when `leader_address` leads it.
pub fn owner_endpoint_path(device: &str, leader_address: &str) -> EndpointResult<EndpointPath> {
    EndpointPath::user(leader_address, &owner_endpoint_name(device, leader_address))
}

/// Name of the local endpoint a follower uses to receive its mount.
pub fn follower_endpoint_name(device: &str) -> String {
    format!("{device}_follower")
}

/// Collaborators shared by every device context on one node.
#[derive(Clone)]
pub struct NodeResources {
    pub system: EndpointSystem<Message>,
    pub store: StateStore,
    pub mounts: Arc<dyn MountPointService>,
    pub connector: Arc<dyn DeviceConnector>,
}

impl NodeResources {
    pub fn node_address(&self) -> &str {
        self.system.address()
    }
}
