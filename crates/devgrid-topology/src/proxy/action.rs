use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{ErrorDomain, OwnerClient};
use crate::error::ServiceResult;
use crate::messages::Message;
use crate::payload::{ActionResult, DataNode, DataTreeIdentifier, SchemaPath};
use crate::services::ActionService;

/// Invokes actions on the owner.
pub struct ProxyActionService {
    client: Arc<OwnerClient>,
}

impl ProxyActionService {
    pub(crate) fn new(client: Arc<OwnerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ActionService for ProxyActionService {
    async fn invoke_action(
        &self,
        action: &SchemaPath,
        target: &DataTreeIdentifier,
        input: DataNode,
    ) -> ServiceResult<Option<ActionResult>> {
        debug!(device = %self.client.device, %action, "invoking action via owner");
        let request = Message::InvokeActionMessage {
            action: action.clone(),
            target: target.clone(),
            input,
        };
        let owner = &self.client.owner;
        match self.client.ask(owner, request, ErrorDomain::Action).await? {
            Message::EmptyResultResponse => Ok(None),
            Message::InvokeActionMessageReply(result) => Ok(Some(result)),
            other => Err(self.client.unexpected(ErrorDomain::Action, "action invocation", &other)),
        }
    }
}
