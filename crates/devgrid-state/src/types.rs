//! Domain types for the devgrid state store.
//!
//! Configuration records describe the devices an operator wants managed;
//! operational records are written by the current owner of a device and
//! read by every other node. All types are JSON-serialized into redb.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a configured device (the record key).
pub type DeviceName = String;

// ── Identity ──────────────────────────────────────────────────────

/// Immutable identity of a managed device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: DeviceName,
    pub host: String,
    pub port: u16,
}

impl DeviceIdentity {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteDevice{{{}}}", self.name)
    }
}

// ── Configuration ─────────────────────────────────────────────────

pub const DEFAULT_ACTOR_RESPONSE_WAIT_TIME_SECS: u16 = 5;
pub const DEFAULT_KEEPALIVE_DELAY_SECS: u32 = 120;
pub const DEFAULT_CONNECTION_TIMEOUT_MILLIS: u32 = 20_000;
pub const DEFAULT_REQUEST_TIMEOUT_MILLIS: u32 = 60_000;
pub const DEFAULT_MAX_CONNECTION_ATTEMPTS: u32 = 0;
pub const DEFAULT_BETWEEN_ATTEMPTS_TIMEOUT_MILLIS: u32 = 2_000;
pub const DEFAULT_SLEEP_FACTOR: f64 = 1.5;
pub const DEFAULT_CONCURRENT_RPC_LIMIT: u16 = 0;

/// Configuration record for one managed device.
///
/// Optional fields fall back to the `DEFAULT_*` constants through the
/// accessor methods, so a record only needs name, host and port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub name: DeviceName,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub schemaless: bool,
    pub username: Option<String>,
    /// Ask timeout for endpoint traffic about this device.
    pub actor_response_wait_time_secs: Option<u16>,
    pub keepalive_delay_secs: Option<u32>,
    pub connection_timeout_millis: Option<u32>,
    pub default_request_timeout_millis: Option<u32>,
    /// 0 means unlimited.
    pub max_connection_attempts: Option<u32>,
    pub between_attempts_timeout_millis: Option<u32>,
    pub sleep_factor: Option<f64>,
    /// Values below 1 disable the limit.
    pub concurrent_rpc_limit: Option<u16>,
    pub reconnect_on_changed_schema: Option<bool>,
    pub tcp_only: Option<bool>,
}

impl DeviceConfig {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            schemaless: false,
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

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.name, &self.host, self.port)
    }

    pub fn actor_response_wait_time_secs(&self) -> u16 {
        self.actor_response_wait_time_secs
            .unwrap_or(DEFAULT_ACTOR_RESPONSE_WAIT_TIME_SECS)
    }

    pub fn keepalive_delay_secs(&self) -> u32 {
        self.keepalive_delay_secs.unwrap_or(DEFAULT_KEEPALIVE_DELAY_SECS)
    }

    pub fn connection_timeout_millis(&self) -> u32 {
        self.connection_timeout_millis
            .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_MILLIS)
    }

    pub fn default_request_timeout_millis(&self) -> u32 {
        self.default_request_timeout_millis
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MILLIS)
    }

    pub fn max_connection_attempts(&self) -> u32 {
        self.max_connection_attempts
            .unwrap_or(DEFAULT_MAX_CONNECTION_ATTEMPTS)
    }

    pub fn between_attempts_timeout_millis(&self) -> u32 {
        self.between_attempts_timeout_millis
            .unwrap_or(DEFAULT_BETWEEN_ATTEMPTS_TIMEOUT_MILLIS)
    }

    pub fn sleep_factor(&self) -> f64 {
        self.sleep_factor.unwrap_or(DEFAULT_SLEEP_FACTOR)
    }

    pub fn concurrent_rpc_limit(&self) -> u16 {
        self.concurrent_rpc_limit.unwrap_or(DEFAULT_CONCURRENT_RPC_LIMIT)
    }

    pub fn reconnect_on_changed_schema(&self) -> bool {
        self.reconnect_on_changed_schema.unwrap_or(false)
    }

    pub fn tcp_only(&self) -> bool {
        self.tcp_only.unwrap_or(false)
    }
}

// ── Operational status ────────────────────────────────────────────

/// Connection status published by the owner of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    UnableToConnect,
    Disconnected,
}

/// Replicated operational record for one device.
///
/// Only the owner writes it; followers learn the owner's address from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationalStatusRecord {
    pub name: DeviceName,
    pub host: String,
    pub port: u16,
    pub status: ConnectionStatus,
    /// Cluster address of the node holding the device connection.
    pub leader_address: Option<String>,
    pub session_id: Option<u32>,
    pub available_capabilities: Vec<String>,
    pub unavailable_capabilities: Vec<String>,
    /// Free-form detail, e.g. the cause of `UnableToConnect`.
    pub connected_message: Option<String>,
}

impl OperationalStatusRecord {
    /// A fresh record in `Connecting` state with no leader.
    pub fn connecting(identity: &DeviceIdentity) -> Self {
        Self {
            name: identity.name.clone(),
            host: identity.host.clone(),
            port: identity.port,
            status: ConnectionStatus::Connecting,
            leader_address: None,
            session_id: None,
            available_capabilities: Vec::new(),
            unavailable_capabilities: Vec::new(),
            connected_message: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

// ── Topology ──────────────────────────────────────────────────────

/// Operational container for one topology instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopologyRecord {
    pub topology_id: String,
}

// ── Change notifications ──────────────────────────────────────────

/// Kind of modification observed on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Record replaced wholesale (or created).
    Write,
    /// Existing record partially updated.
    SubtreeModified,
    Delete,
}

/// A single change to a keyed record, delivered to subscribers in commit order.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordChange<T> {
    pub key: String,
    pub kind: ChangeKind,
    pub before: Option<T>,
    pub after: Option<T>,
}

impl<T> RecordChange<T> {
    /// Whether this change created a record that did not exist before.
    pub fn is_creation(&self) -> bool {
        self.kind == ChangeKind::Write && self.before.is_none()
    }
}
