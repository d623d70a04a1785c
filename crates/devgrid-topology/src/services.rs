//! The five device service surfaces published through a mount.
//!
//! On the owner they are backed by the live device connection; on a
//! follower they are the proxies in [`crate::proxy`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ServiceResult;
use crate::payload::*;

#[async_trait]
pub trait ReadTransaction: Send + Sync {
    async fn read(&self, store: Datastore, path: &YangPath) -> ServiceResult<Option<DataNode>>;

    async fn exists(&self, store: Datastore, path: &YangPath) -> ServiceResult<bool>;
}

#[async_trait]
pub trait WriteTransaction: Send + Sync {
    async fn put(&self, store: Datastore, path: &YangPath, data: DataNode) -> ServiceResult<()>;

    async fn merge(&self, store: Datastore, path: &YangPath, data: DataNode) -> ServiceResult<()>;

    async fn delete(&self, store: Datastore, path: &YangPath) -> ServiceResult<()>;

    async fn commit(&self) -> ServiceResult<()>;

    /// Returns false if the transaction was already committed or cancelled.
    async fn cancel(&self) -> bool;
}

pub trait ReadWriteTransaction: ReadTransaction + WriteTransaction {}

impl<T: ReadTransaction + WriteTransaction> ReadWriteTransaction for T {}

/// Ordered sequence of write transactions.
#[async_trait]
pub trait TransactionChain: Send + Sync {
    async fn new_write_only_transaction(&self) -> ServiceResult<Box<dyn WriteTransaction>>;

    fn close(&self);
}

#[async_trait]
pub trait DataBroker: Send + Sync {
    async fn new_read_only_transaction(&self) -> ServiceResult<Box<dyn ReadTransaction>>;

    async fn new_read_write_transaction(&self) -> ServiceResult<Box<dyn ReadWriteTransaction>>;

    async fn new_write_only_transaction(&self) -> ServiceResult<Box<dyn WriteTransaction>>;

    fn create_transaction_chain(&self) -> ServiceResult<Box<dyn TransactionChain>>;
}

/// Callback for RPC availability changes.
pub trait RpcAvailabilityListener: Send + Sync {
    fn on_rpcs_available(&self, rpcs: &[QName]);
}

#[async_trait]
pub trait RpcService: Send + Sync {
    /// `Ok(None)` means the device answered with no result at all.
    async fn invoke_rpc(&self, rpc: &QName, input: Option<DataNode>) -> ServiceResult<Option<RpcResult>>;

    fn register_rpc_listener(&self, listener: Arc<dyn RpcAvailabilityListener>) -> ServiceResult<()>;
}

#[async_trait]
pub trait ActionService: Send + Sync {
    /// `Ok(None)` means the device answered with no result at all.
    async fn invoke_action(
        &self,
        action: &SchemaPath,
        target: &DataTreeIdentifier,
        input: DataNode,
    ) -> ServiceResult<Option<ActionResult>>;
}

/// Bulk, lock-based data tree operations.
#[async_trait]
pub trait DataTreeService: Send + Sync {
    async fn lock(&self) -> ServiceResult<RpcResult>;

    async fn unlock(&self) -> ServiceResult<RpcResult>;

    async fn discard_changes(&self) -> ServiceResult<RpcResult>;

    async fn get(&self, path: &YangPath, fields: &[YangPath]) -> ServiceResult<Option<DataNode>>;

    async fn get_config(&self, path: &YangPath, fields: &[YangPath]) -> ServiceResult<Option<DataNode>>;

    async fn edit(
        &self,
        operation: EditOperation,
        store: Datastore,
        path: &YangPath,
        data: Option<DataNode>,
    ) -> ServiceResult<RpcResult>;

    async fn commit(&self) -> ServiceResult<()>;
}

#[async_trait]
pub trait SchemaSourceProvider: Send + Sync {
    async fn get_source(&self, id: &SourceIdentifier) -> ServiceResult<YangTextSource>;
}

/// The service bundle published for one device.
#[derive(Clone)]
pub struct DeviceServices {
    pub data_broker: Arc<dyn DataBroker>,
    pub rpc: Arc<dyn RpcService>,
    pub action: Arc<dyn ActionService>,
    pub data_tree: Arc<dyn DataTreeService>,
    pub schema: Arc<dyn SchemaSourceProvider>,
}

impl fmt::Debug for DeviceServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceServices")
    }
}
