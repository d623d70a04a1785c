use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{ErrorDomain, OwnerClient};
use crate::error::ServiceResult;
use crate::messages::{DeviceEndpointRef, Message};
use crate::payload::*;
use crate::services::DataTreeService;

/// Bulk data tree operations executed by a sub-endpoint on the owner.
///
/// Every successful `lock` opens a fresh sub-endpoint and `unlock` ends it.
/// Operations outside a lock reuse the current sub-endpoint, or request a
/// new one once the owner has stopped it. Edits are sent without waiting
/// and report success immediately.
pub struct ProxyDataTreeService {
    client: Arc<OwnerClient>,
    session: Mutex<Option<DeviceEndpointRef>>,
}

impl ProxyDataTreeService {
    pub(crate) fn new(client: Arc<OwnerClient>) -> Self {
        Self {
            client,
            session: Mutex::new(None),
        }
    }

    /// Current sub-endpoint, resolved again if the owner stopped it.
    async fn session(&self) -> ServiceResult<DeviceEndpointRef> {
        let current = self.session.lock().clone();
        if let Some(session) = current.filter(|s| s.is_alive()) {
            return Ok(session);
        }
        let session = self.request_session().await?;
        *self.session.lock() = Some(session.clone());
        Ok(session)
    }

    async fn request_session(&self) -> ServiceResult<DeviceEndpointRef> {
        let owner = &self.client.owner;
        match self
            .client
            .ask(owner, Message::NetconfDataTreeServiceRequest, ErrorDomain::DataTree)
            .await?
        {
            Message::Success(Some(session)) => {
                debug!(device = %self.client.device, session = %session.path(), "data tree endpoint resolved");
                Ok(session)
            }
            other => Err(self.client.unexpected(
                ErrorDomain::DataTree,
                "data tree service request",
                &other,
            )),
        }
    }

    async fn ask_rpc(&self, session: &DeviceEndpointRef, request: Message, operation: &str) -> ServiceResult<RpcResult> {
        match self.client.ask(session, request, ErrorDomain::DataTree).await? {
            Message::RpcResultReply(result) => Ok(result),
            other => Err(self.client.unexpected(ErrorDomain::DataTree, operation, &other)),
        }
    }

    async fn rpc_like(&self, request: Message, operation: &str) -> ServiceResult<RpcResult> {
        let session = self.session().await?;
        self.ask_rpc(&session, request, operation).await
    }

    async fn read(&self, request: Message, operation: &str) -> ServiceResult<Option<DataNode>> {
        let session = self.session().await?;
        match self.client.ask(&session, request, ErrorDomain::Read).await? {
            Message::NormalizedNode(data) => Ok(Some(data)),
            Message::EmptyReadResponse => Ok(None),
            other => Err(self.client.unexpected(ErrorDomain::Read, operation, &other)),
        }
    }
}

#[async_trait]
impl DataTreeService for ProxyDataTreeService {
    async fn lock(&self) -> ServiceResult<RpcResult> {
        let session = self.request_session().await?;
        match self.ask_rpc(&session, Message::LockRequest, "lock").await {
            Ok(result) => {
                *self.session.lock() = Some(session);
                Ok(result)
            }
            Err(e) => {
                session.stop();
                Err(e)
            }
        }
    }

    async fn unlock(&self) -> ServiceResult<RpcResult> {
        let session = self.session().await?;
        let result = self.ask_rpc(&session, Message::UnlockRequest, "unlock").await;
        if result.is_ok() {
            let mut current = self.session.lock();
            if current.as_ref() == Some(&session) {
                *current = None;
            }
            session.stop();
        }
        result
    }

    async fn discard_changes(&self) -> ServiceResult<RpcResult> {
        self.rpc_like(Message::DiscardChangesRequest, "discard changes")
            .await
    }

    async fn get(&self, path: &YangPath, fields: &[YangPath]) -> ServiceResult<Option<DataNode>> {
        let request = Message::GetRequest {
            path: path.clone(),
            fields: fields.to_vec(),
        };
        self.read(request, "get").await
    }

    async fn get_config(&self, path: &YangPath, fields: &[YangPath]) -> ServiceResult<Option<DataNode>> {
        let request = Message::GetConfigRequest {
            path: path.clone(),
            fields: fields.to_vec(),
        };
        self.read(request, "get-config").await
    }

    async fn edit(
        &self,
        operation: EditOperation,
        store: Datastore,
        path: &YangPath,
        data: Option<DataNode>,
    ) -> ServiceResult<RpcResult> {
        let session = self.session().await?;
        debug!(device = %self.client.device, ?operation, %store, %path, "edit via owner");
        session.tell(Message::EditRequest {
            operation,
            store,
            path: path.clone(),
            data,
        });
        Ok(RpcResult::default())
    }

    async fn commit(&self) -> ServiceResult<()> {
        let session = self.session().await?;
        match self
            .client
            .ask(&session, Message::CommitRequest, ErrorDomain::DataTree)
            .await?
        {
            Message::Success(_) => Ok(()),
            other => Err(self.client.unexpected(ErrorDomain::DataTree, "commit", &other)),
        }
    }
}
