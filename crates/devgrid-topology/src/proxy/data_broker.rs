use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ErrorDomain, OwnerClient};
use crate::error::{ServiceError, ServiceResult};
use crate::messages::{DeviceEndpointRef, Message};
use crate::payload::{DataNode, Datastore, YangPath};
use crate::services::*;

/// Data broker whose transactions live on the owner.
///
/// Opening a transaction asks the owner for a transaction sub-endpoint;
/// every later operation talks to that sub-endpoint directly.
pub struct ProxyDataBroker {
    client: Arc<OwnerClient>,
}

impl ProxyDataBroker {
    pub(crate) fn new(client: Arc<OwnerClient>) -> Self {
        Self { client }
    }

    async fn open(&self, request: Message, operation: &str) -> ServiceResult<ProxyTransaction> {
        let owner = &self.client.owner;
        match self.client.ask(owner, request, ErrorDomain::Transaction).await? {
            Message::Success(Some(tx)) => {
                debug!(device = %self.client.device, tx = %tx.path(), "transaction endpoint resolved");
                Ok(ProxyTransaction {
                    client: Arc::clone(&self.client),
                    tx,
                })
            }
            other => Err(self.client.unexpected(ErrorDomain::Transaction, operation, &other)),
        }
    }
}

#[async_trait]
impl DataBroker for ProxyDataBroker {
    async fn new_read_only_transaction(&self) -> ServiceResult<Box<dyn ReadTransaction>> {
        let tx = self
            .open(Message::NewReadTransactionRequest, "read transaction request")
            .await?;
        Ok(Box::new(tx))
    }

    async fn new_read_write_transaction(&self) -> ServiceResult<Box<dyn ReadWriteTransaction>> {
        let tx = self
            .open(Message::NewReadWriteTransactionRequest, "read-write transaction request")
            .await?;
        Ok(Box::new(tx))
    }

    async fn new_write_only_transaction(&self) -> ServiceResult<Box<dyn WriteTransaction>> {
        let tx = self
            .open(Message::NewWriteTransactionRequest, "write transaction request")
            .await?;
        Ok(Box::new(tx))
    }

    fn create_transaction_chain(&self) -> ServiceResult<Box<dyn TransactionChain>> {
        Err(ServiceError::Unsupported(format!(
            "{}: transaction chains",
            self.client.device
        )))
    }
}

/// A transaction executed by a sub-endpoint on the owner.
///
/// Writes are sent without waiting; their failures surface on `commit`.
pub struct ProxyTransaction {
    client: Arc<OwnerClient>,
    tx: DeviceEndpointRef,
}

impl ProxyTransaction {
    pub fn endpoint(&self) -> &DeviceEndpointRef {
        &self.tx
    }
}

#[async_trait]
impl ReadTransaction for ProxyTransaction {
    async fn read(&self, store: Datastore, path: &YangPath) -> ServiceResult<Option<DataNode>> {
        let request = Message::ReadRequest {
            store,
            path: path.clone(),
        };
        debug!(device = %self.client.device, %store, %path, "read via owner");
        match self.client.ask(&self.tx, request, ErrorDomain::Read).await? {
            Message::NormalizedNode(data) => Ok(Some(data)),
            Message::EmptyReadResponse => Ok(None),
            other => Err(self.client.unexpected(ErrorDomain::Read, "read", &other)),
        }
    }

    async fn exists(&self, store: Datastore, path: &YangPath) -> ServiceResult<bool> {
        let request = Message::ExistsRequest {
            store,
            path: path.clone(),
        };
        match self.client.ask(&self.tx, request, ErrorDomain::Read).await? {
            Message::Exists(exists) => Ok(exists),
            other => Err(self.client.unexpected(ErrorDomain::Read, "exists", &other)),
        }
    }
}

#[async_trait]
impl WriteTransaction for ProxyTransaction {
    async fn put(&self, store: Datastore, path: &YangPath, data: DataNode) -> ServiceResult<()> {
        self.tx.tell(Message::PutRequest {
            store,
            path: path.clone(),
            data,
        });
        Ok(())
    }

    async fn merge(&self, store: Datastore, path: &YangPath, data: DataNode) -> ServiceResult<()> {
        self.tx.tell(Message::MergeRequest {
            store,
            path: path.clone(),
            data,
        });
        Ok(())
    }

    async fn delete(&self, store: Datastore, path: &YangPath) -> ServiceResult<()> {
        self.tx.tell(Message::DeleteRequest {
            store,
            path: path.clone(),
        });
        Ok(())
    }

    async fn commit(&self) -> ServiceResult<()> {
        match self
            .client
            .ask(&self.tx, Message::SubmitRequest, ErrorDomain::Transaction)
            .await?
        {
            Message::Success(_) => Ok(()),
            other => Err(self.client.unexpected(ErrorDomain::Transaction, "submit", &other)),
        }
    }

    async fn cancel(&self) -> bool {
        match self
            .client
            .ask(&self.tx, Message::CancelRequest, ErrorDomain::Transaction)
            .await
        {
            Ok(Message::Cancelled(cancelled)) => cancelled,
            Ok(other) => {
                warn!(device = %self.client.device, reply = other.kind(), "unexpected cancel reply");
                false
            }
            Err(e) => {
                warn!(device = %self.client.device, error = %e, "cancel failed");
                false
            }
        }
    }
}
