use std::sync::Arc;

use async_trait::async_trait;
use devgrid_endpoint::{Context, Endpoint, ReplyTo};
use devgrid_state::DeviceIdentity;
use tracing::{debug, warn};

use super::respond;
use crate::error::{ServiceError, ServiceResult};
use crate::messages::Message;
use crate::payload::{DataNode, RpcResult};
use crate::services::DataTreeService;

/// Serves one bulk data tree session for a follower.
///
/// Edits arrive fire-and-forget; a failed edit makes the next commit fail.
/// An idle session discards its changes, releases the lock and stops.
pub struct DataTreeEndpoint {
    device: DeviceIdentity,
    service: Arc<dyn DataTreeService>,
    failed_edits: Vec<ServiceError>,
}

impl DataTreeEndpoint {
    pub fn new(device: DeviceIdentity, service: Arc<dyn DataTreeService>) -> Self {
        Self {
            device,
            service,
            failed_edits: Vec::new(),
        }
    }

    async fn commit(&mut self) -> ServiceResult<()> {
        if let Some(first) = self.failed_edits.first() {
            let err = ServiceError::DataTree(format!(
                "{}: commit of operation failed, {} edit(s) rejected: {first}",
                self.device,
                self.failed_edits.len()
            ));
            self.failed_edits.clear();
            return Err(err);
        }
        self.service.commit().await
    }
}

fn rpc_reply(result: ServiceResult<RpcResult>) -> Message {
    match result {
        Ok(result) => Message::RpcResultReply(result),
        Err(e) => Message::Failure(e),
    }
}

fn read_reply(result: ServiceResult<Option<DataNode>>) -> Message {
    match result {
        Ok(Some(data)) => Message::NormalizedNode(data),
        Ok(None) => Message::EmptyReadResponse,
        Err(e) => Message::Failure(e),
    }
}

#[async_trait]
impl Endpoint<Message> for DataTreeEndpoint {
    async fn handle(&mut self, _ctx: &mut Context<Message>, message: Message, reply: Option<ReplyTo<Message>>) {
        match message {
            Message::LockRequest => respond(reply, rpc_reply(self.service.lock().await)),
            Message::UnlockRequest => respond(reply, rpc_reply(self.service.unlock().await)),
            Message::DiscardChangesRequest => {
                self.failed_edits.clear();
                respond(reply, rpc_reply(self.service.discard_changes().await));
            }
            Message::GetRequest { path, fields } => {
                respond(reply, read_reply(self.service.get(&path, &fields).await));
            }
            Message::GetConfigRequest { path, fields } => {
                respond(reply, read_reply(self.service.get_config(&path, &fields).await));
            }
            Message::EditRequest {
                operation,
                store,
                path,
                data,
            } => {
                if let Err(e) = self.service.edit(operation, store, &path, data).await {
                    warn!(device = %self.device, ?operation, %path, error = %e, "edit failed");
                    self.failed_edits.push(e);
                }
            }
            Message::CommitRequest => {
                let response = match self.commit().await {
                    Ok(()) => Message::Success(None),
                    Err(e) => Message::Failure(e),
                };
                respond(reply, response);
            }
            other => debug!(device = %self.device, message = other.kind(), "unhandled data tree message"),
        }
    }

    async fn idle(&mut self, ctx: &mut Context<Message>) {
        warn!(device = %self.device, "data tree session idle for too long, discarding changes");
        if let Err(e) = self.service.discard_changes().await {
            warn!(device = %self.device, error = %e, "discard changes failed");
        }
        if let Err(e) = self.service.unlock().await {
            warn!(device = %self.device, error = %e, "unlock failed");
        }
        ctx.stop();
    }
}
