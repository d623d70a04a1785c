use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{ErrorDomain, OwnerClient};
use crate::error::{ServiceError, ServiceResult};
use crate::messages::Message;
use crate::payload::{DataNode, QName, RpcResult};
use crate::services::{RpcAvailabilityListener, RpcService};

/// Invokes RPCs on the owner.
pub struct ProxyRpcService {
    client: Arc<OwnerClient>,
}

impl ProxyRpcService {
    pub(crate) fn new(client: Arc<OwnerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RpcService for ProxyRpcService {
    async fn invoke_rpc(&self, rpc: &QName, input: Option<DataNode>) -> ServiceResult<Option<RpcResult>> {
        debug!(device = %self.client.device, %rpc, owner = %self.client.owner.path(), "invoking rpc via owner");
        let request = Message::InvokeRpcMessage {
            rpc: rpc.clone(),
            input,
        };
        let owner = &self.client.owner;
        match self.client.ask(owner, request, ErrorDomain::Rpc).await? {
            Message::EmptyResultResponse => Ok(None),
            Message::InvokeRpcMessageReply(result) => Ok(Some(result)),
            other => Err(self.client.unexpected(ErrorDomain::Rpc, "rpc invocation", &other)),
        }
    }

    fn register_rpc_listener(&self, _listener: Arc<dyn RpcAvailabilityListener>) -> ServiceResult<()> {
        Err(ServiceError::Unsupported(format!(
            "{}: rpc availability listeners",
            self.client.device
        )))
    }
}
