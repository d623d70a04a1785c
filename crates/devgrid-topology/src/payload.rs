//! Payload types carried by device service calls and endpoint messages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque data tree document exchanged with a device.
pub type DataNode = serde_json::Value;

/// Logical datastore a read or edit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Datastore {
    Configuration,
    Operational,
}

impl fmt::Display for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datastore::Configuration => f.write_str("CONFIGURATION"),
            Datastore::Operational => f.write_str("OPERATIONAL"),
        }
    }
}

/// Instance identifier of a node in a data tree, e.g. `/interfaces/interface`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct YangPath(Vec<String>);

impl YangPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse a `/`-separated path. Empty segments are ignored.
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self(segments)
    }
}

impl fmt::Display for YangPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

/// Qualified name of an RPC or schema node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QName {
    pub module: String,
    pub local_name: String,
}

impl QName {
    pub fn new(module: &str, local_name: &str) -> Self {
        Self {
            module: module.to_string(),
            local_name: local_name.to_string(),
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.local_name)
    }
}

/// Absolute schema path identifying an action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaPath(pub Vec<QName>);

impl SchemaPath {
    pub fn last(&self) -> Option<&QName> {
        self.0.last()
    }
}

impl fmt::Display for SchemaPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for qname in &self.0 {
            write!(f, "/{qname}")?;
        }
        Ok(())
    }
}

/// Data tree node an action is invoked on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTreeIdentifier {
    pub datastore: Datastore,
    pub path: YangPath,
}

/// Identifier of one YANG schema source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceIdentifier {
    pub name: String,
    pub revision: Option<String>,
}

impl SourceIdentifier {
    pub fn new(name: &str, revision: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            revision: revision.map(str::to_string),
        }
    }
}

impl fmt::Display for SourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.revision {
            Some(rev) => write!(f, "{}@{}", self.name, rev),
            None => f.write_str(&self.name),
        }
    }
}

/// YANG text of one schema source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YangTextSource {
    pub identifier: SourceIdentifier,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Error,
    Warning,
}

/// Error reported by a device inside an otherwise delivered reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorInfo {
    pub severity: ErrorSeverity,
    pub tag: String,
    pub message: String,
}

/// Outcome of an RPC (or a data tree operation answered like one).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcResult {
    pub value: Option<DataNode>,
    pub errors: Vec<RpcErrorInfo>,
}

impl RpcResult {
    pub fn with_value(value: DataNode) -> Self {
        Self {
            value: Some(value),
            errors: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errors
            .iter()
            .all(|e| e.severity != ErrorSeverity::Error)
    }
}

/// Outcome of an action invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub output: Option<DataNode>,
    pub errors: Vec<RpcErrorInfo>,
}

/// Kind of edit applied through the data tree service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOperation {
    Create,
    Merge,
    Replace,
    Delete,
    Remove,
}

impl EditOperation {
    /// Whether the edit carries a data payload.
    pub fn carries_data(self) -> bool {
        matches!(
            self,
            EditOperation::Create | EditOperation::Merge | EditOperation::Replace
        )
    }
}

/// Notification emitted by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceNotification {
    pub name: QName,
    pub body: DataNode,
}

/// Session facts reported once a device connects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSession {
    pub session_id: u32,
    pub source_ids: Vec<SourceIdentifier>,
    pub available_capabilities: Vec<String>,
    pub unavailable_capabilities: Vec<String>,
}
