//! Simulated devices and connector.
//!
//! Stand-ins for the real device connection machinery: each
//! [`SimulatedDevice`] keeps an in-memory datastore and implements all five
//! device services, with switches to inject failures. The
//! [`SimulatedConnector`] hands those services to whichever facade starts a
//! connection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connector::{DeviceConnection, DeviceConnector};
use crate::error::{ServiceError, ServiceResult};
use crate::facade::DeviceFacade;
use crate::payload::*;
use crate::services::*;
use crate::setup::DeviceSetup;

/// Canned reply for an RPC or action.
#[derive(Debug, Clone)]
pub enum CannedReply<T> {
    /// Device answers with this result (`None` = no result at all).
    Reply(Option<T>),
    Fail(String),
}

#[derive(Default)]
struct DeviceState {
    data: Mutex<HashMap<Datastore, BTreeMap<YangPath, DataNode>>>,
    candidate: Mutex<Vec<(Datastore, YangPath, Option<DataNode>)>>,
    rpc_replies: Mutex<HashMap<String, CannedReply<RpcResult>>>,
    action_replies: Mutex<HashMap<String, CannedReply<ActionResult>>>,
    sources: Mutex<Vec<YangTextSource>>,
    locked: AtomicBool,
    fail_edits: AtomicBool,
    rpc_invocations: AtomicUsize,
}

/// In-memory device implementing every device service.
#[derive(Clone)]
pub struct SimulatedDevice {
    name: String,
    state: Arc<DeviceState>,
}

impl SimulatedDevice {
    pub fn new(name: &str) -> Self {
        let device = Self {
            name: name.to_string(),
            state: Arc::new(DeviceState::default()),
        };
        device.add_source(
            SourceIdentifier::new("ietf-interfaces", Some("2018-02-20")),
            "module ietf-interfaces { namespace \"urn:ietf:params:xml:ns:yang:ietf-interfaces\"; }",
        );
        device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_source(&self, identifier: SourceIdentifier, text: &str) {
        self.state.sources.lock().push(YangTextSource {
            identifier,
            text: text.to_string(),
        });
    }

    pub fn source_ids(&self) -> Vec<SourceIdentifier> {
        self.state
            .sources
            .lock()
            .iter()
            .map(|s| s.identifier.clone())
            .collect()
    }

    /// Fix the reply for the RPC whose local name is `rpc`.
    pub fn set_rpc_reply(&self, rpc: &str, reply: CannedReply<RpcResult>) {
        self.state.rpc_replies.lock().insert(rpc.to_string(), reply);
    }

    /// Fix the reply for the action whose last path element is `action`.
    pub fn set_action_reply(&self, action: &str, reply: CannedReply<ActionResult>) {
        self.state
            .action_replies
            .lock()
            .insert(action.to_string(), reply);
    }

    pub fn set_fail_edits(&self, fail: bool) {
        self.state.fail_edits.store(fail, Ordering::SeqCst);
    }

    pub fn rpc_invocations(&self) -> usize {
        self.state.rpc_invocations.load(Ordering::SeqCst)
    }

    /// Committed value at `path`.
    pub fn value(&self, store: Datastore, path: &YangPath) -> Option<DataNode> {
        self.state
            .data
            .lock()
            .get(&store)
            .and_then(|tree| tree.get(path).cloned())
    }

    pub fn session(&self, session_id: u32) -> DeviceSession {
        let source_ids = self.source_ids();
        let available_capabilities = source_ids
            .iter()
            .map(|id| match &id.revision {
                Some(rev) => format!("urn:devgrid:{}?module={}&revision={rev}", id.name, id.name),
                None => format!("urn:devgrid:{}?module={}", id.name, id.name),
            })
            .collect();
        DeviceSession {
            session_id,
            source_ids,
            available_capabilities,
            unavailable_capabilities: Vec::new(),
        }
    }

    /// The five services bound to this device.
    pub fn services(&self) -> DeviceServices {
        let this = Arc::new(self.clone());
        DeviceServices {
            data_broker: this.clone(),
            rpc: this.clone(),
            action: this.clone(),
            data_tree: this.clone(),
            schema: this,
        }
    }

    fn apply(&self, store: Datastore, path: &YangPath, value: Option<DataNode>, merge: bool) {
        let mut data = self.state.data.lock();
        let tree = data.entry(store).or_default();
        match value {
            None => {
                tree.remove(path);
            }
            Some(value) if merge => {
                let merged = match (tree.remove(path), value) {
                    (Some(DataNode::Object(mut current)), DataNode::Object(update)) => {
                        current.extend(update);
                        DataNode::Object(current)
                    }
                    (_, value) => value,
                };
                tree.insert(path.clone(), merged);
            }
            Some(value) => {
                tree.insert(path.clone(), value);
            }
        }
    }
}

// ── Transactions ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Committed,
    Cancelled,
}

enum StagedWrite {
    Put(Datastore, YangPath, DataNode),
    Merge(Datastore, YangPath, DataNode),
    Delete(Datastore, YangPath),
}

struct SimulatedTransaction {
    device: SimulatedDevice,
    staged: Mutex<Vec<StagedWrite>>,
    state: Mutex<TxState>,
}

impl SimulatedTransaction {
    fn new(device: SimulatedDevice) -> Self {
        Self {
            device,
            staged: Mutex::new(Vec::new()),
            state: Mutex::new(TxState::Open),
        }
    }

    fn stage(&self, write: StagedWrite) -> ServiceResult<()> {
        if *self.state.lock() != TxState::Open {
            return Err(ServiceError::TransactionFailed(format!(
                "{}: transaction already finished",
                self.device.name
            )));
        }
        self.staged.lock().push(write);
        Ok(())
    }
}

#[async_trait]
impl ReadTransaction for SimulatedTransaction {
    async fn read(&self, store: Datastore, path: &YangPath) -> ServiceResult<Option<DataNode>> {
        Ok(self.device.value(store, path))
    }

    async fn exists(&self, store: Datastore, path: &YangPath) -> ServiceResult<bool> {
        Ok(self.device.value(store, path).is_some())
    }
}

#[async_trait]
impl WriteTransaction for SimulatedTransaction {
    async fn put(&self, store: Datastore, path: &YangPath, data: DataNode) -> ServiceResult<()> {
        self.stage(StagedWrite::Put(store, path.clone(), data))
    }

    async fn merge(&self, store: Datastore, path: &YangPath, data: DataNode) -> ServiceResult<()> {
        self.stage(StagedWrite::Merge(store, path.clone(), data))
    }

    async fn delete(&self, store: Datastore, path: &YangPath) -> ServiceResult<()> {
        self.stage(StagedWrite::Delete(store, path.clone()))
    }

    async fn commit(&self) -> ServiceResult<()> {
        {
            let mut state = self.state.lock();
            if *state != TxState::Open {
                return Err(ServiceError::TransactionFailed(format!(
                    "{}: transaction already finished",
                    self.device.name
                )));
            }
            *state = TxState::Committed;
        }
        for write in self.staged.lock().drain(..) {
            match write {
                StagedWrite::Put(store, path, data) => self.device.apply(store, &path, Some(data), false),
                StagedWrite::Merge(store, path, data) => self.device.apply(store, &path, Some(data), true),
                StagedWrite::Delete(store, path) => self.device.apply(store, &path, None, false),
            }
        }
        Ok(())
    }

    async fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if *state != TxState::Open {
            return false;
        }
        *state = TxState::Cancelled;
        self.staged.lock().clear();
        true
    }
}

struct SimulatedChain {
    device: SimulatedDevice,
    closed: AtomicBool,
}

#[async_trait]
impl TransactionChain for SimulatedChain {
    async fn new_write_only_transaction(&self) -> ServiceResult<Box<dyn WriteTransaction>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ServiceError::TransactionFailed("transaction chain closed".to_string()));
        }
        Ok(Box::new(SimulatedTransaction::new(self.device.clone())))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataBroker for SimulatedDevice {
    async fn new_read_only_transaction(&self) -> ServiceResult<Box<dyn ReadTransaction>> {
        Ok(Box::new(SimulatedTransaction::new(self.clone())))
    }

    async fn new_read_write_transaction(&self) -> ServiceResult<Box<dyn ReadWriteTransaction>> {
        Ok(Box::new(SimulatedTransaction::new(self.clone())))
    }

    async fn new_write_only_transaction(&self) -> ServiceResult<Box<dyn WriteTransaction>> {
        Ok(Box::new(SimulatedTransaction::new(self.clone())))
    }

    fn create_transaction_chain(&self) -> ServiceResult<Box<dyn TransactionChain>> {
        Ok(Box::new(SimulatedChain {
            device: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

// ── RPCs and actions ──────────────────────────────────────────────

#[async_trait]
impl RpcService for SimulatedDevice {
    async fn invoke_rpc(&self, rpc: &QName, input: Option<DataNode>) -> ServiceResult<Option<RpcResult>> {
        self.state.rpc_invocations.fetch_add(1, Ordering::SeqCst);
        let canned = self.state.rpc_replies.lock().get(&rpc.local_name).cloned();
        match canned {
            Some(CannedReply::Reply(result)) => Ok(result),
            Some(CannedReply::Fail(message)) => Err(ServiceError::Rpc(message)),
            // Unknown RPCs echo their input.
            None => Ok(Some(RpcResult {
                value: input,
                errors: Vec::new(),
            })),
        }
    }

    fn register_rpc_listener(&self, listener: Arc<dyn RpcAvailabilityListener>) -> ServiceResult<()> {
        let rpcs: Vec<QName> = self
            .state
            .rpc_replies
            .lock()
            .keys()
            .map(|name| QName::new(&self.name, name))
            .collect();
        listener.on_rpcs_available(&rpcs);
        Ok(())
    }
}

#[async_trait]
impl ActionService for SimulatedDevice {
    async fn invoke_action(
        &self,
        action: &SchemaPath,
        _target: &DataTreeIdentifier,
        input: DataNode,
    ) -> ServiceResult<Option<ActionResult>> {
        let key = action.last().map(|q| q.local_name.clone()).unwrap_or_default();
        let canned = self.state.action_replies.lock().get(&key).cloned();
        match canned {
            Some(CannedReply::Reply(result)) => Ok(result),
            Some(CannedReply::Fail(message)) => Err(ServiceError::Action(message)),
            None => Ok(Some(ActionResult {
                output: Some(input),
                errors: Vec::new(),
            })),
        }
    }
}

// ── Bulk data tree ────────────────────────────────────────────────

#[async_trait]
impl DataTreeService for SimulatedDevice {
    async fn lock(&self) -> ServiceResult<RpcResult> {
        if self.state.locked.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::DataTree(format!("{}: lock denied", self.name)));
        }
        Ok(RpcResult::default())
    }

    async fn unlock(&self) -> ServiceResult<RpcResult> {
        self.state.locked.store(false, Ordering::SeqCst);
        Ok(RpcResult::default())
    }

    async fn discard_changes(&self) -> ServiceResult<RpcResult> {
        self.state.candidate.lock().clear();
        Ok(RpcResult::default())
    }

    async fn get(&self, path: &YangPath, _fields: &[YangPath]) -> ServiceResult<Option<DataNode>> {
        Ok(self.value(Datastore::Operational, path))
    }

    async fn get_config(&self, path: &YangPath, _fields: &[YangPath]) -> ServiceResult<Option<DataNode>> {
        Ok(self.value(Datastore::Configuration, path))
    }

    async fn edit(
        &self,
        operation: EditOperation,
        store: Datastore,
        path: &YangPath,
        data: Option<DataNode>,
    ) -> ServiceResult<RpcResult> {
        if self.state.fail_edits.load(Ordering::SeqCst) {
            return Err(ServiceError::DataTree(format!(
                "{}: {operation:?} of {path} rejected",
                self.name
            )));
        }
        let value = if operation.carries_data() { data } else { None };
        self.state
            .candidate
            .lock()
            .push((store, path.clone(), value));
        Ok(RpcResult::default())
    }

    async fn commit(&self) -> ServiceResult<()> {
        let edits: Vec<_> = self.state.candidate.lock().drain(..).collect();
        for (store, path, value) in edits {
            self.apply(store, &path, value, false);
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaSourceProvider for SimulatedDevice {
    async fn get_source(&self, id: &SourceIdentifier) -> ServiceResult<YangTextSource> {
        self.state
            .sources
            .lock()
            .iter()
            .find(|s| &s.identifier == id)
            .cloned()
            .ok_or_else(|| ServiceError::SchemaSource(format!("{}: no source {id}", self.name)))
    }
}

// ── Connector ─────────────────────────────────────────────────────

/// Connector resolving device names to [`SimulatedDevice`]s.
///
/// Devices not added explicitly are created on first connect.
#[derive(Default)]
pub struct SimulatedConnector {
    devices: DashMap<String, SimulatedDevice>,
    unreachable: DashMap<String, String>,
    sessions: Arc<DashMap<String, Arc<dyn DeviceFacade>>>,
    next_session: AtomicU32,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device: SimulatedDevice) {
        self.devices.insert(device.name().to_string(), device);
    }

    pub fn device(&self, name: &str) -> SimulatedDevice {
        self.devices
            .entry(name.to_string())
            .or_insert_with(|| SimulatedDevice::new(name))
            .clone()
    }

    /// Make connection attempts to `name` fail with `cause`.
    pub fn set_unreachable(&self, name: &str, cause: &str) {
        self.unreachable.insert(name.to_string(), cause.to_string());
    }

    pub fn set_reachable(&self, name: &str) {
        self.unreachable.remove(name);
    }

    /// Whether a facade currently holds a session to `name`.
    pub fn is_connected(&self, name: &str) -> bool {
        self.sessions.contains_key(name)
    }

    /// Drop the session to `name` as if the device went away.
    pub async fn drop_session(&self, name: &str) {
        if let Some((_, facade)) = self.sessions.remove(name) {
            facade.on_device_disconnected().await;
        }
    }

    /// Push a notification through the facade holding `name`.
    pub fn emit_notification(&self, name: &str, notification: DeviceNotification) {
        if let Some(facade) = self.sessions.get(name) {
            facade.on_notification(notification);
        }
    }
}

impl DeviceConnector for SimulatedConnector {
    fn start(&self, setup: &DeviceSetup, facade: Arc<dyn DeviceFacade>) -> Box<dyn DeviceConnection> {
        let name = setup.device_name().to_string();
        let device = self.device(&name);
        let failure = self.unreachable.get(&name).map(|c| c.value().clone());
        let session_id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let sessions = Arc::clone(&self.sessions);

        info!(device = %name, host = %setup.config.host, port = setup.config.port, "connecting");
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            match failure {
                Some(cause) => facade.on_device_failed(cause).await,
                None => {
                    sessions.insert(task_name, Arc::clone(&facade));
                    facade
                        .on_device_connected(device.session(session_id), device.services())
                        .await;
                }
            }
        });

        Box::new(SimulatedConnection {
            name,
            sessions: Arc::clone(&self.sessions),
            task,
        })
    }
}

struct SimulatedConnection {
    name: String,
    sessions: Arc<DashMap<String, Arc<dyn DeviceFacade>>>,
    task: JoinHandle<()>,
}

impl DeviceConnection for SimulatedConnection {
    fn stop(&self) {
        self.task.abort();
        self.sessions.remove(&self.name);
        debug!(device = %self.name, "connection stopped");
    }
}
