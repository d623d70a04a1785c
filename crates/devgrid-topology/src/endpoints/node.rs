use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devgrid_endpoint::{Context, Endpoint, ReplyTo};
use devgrid_state::DeviceIdentity;
use tracing::{debug, error, info, warn};

use super::{DataTreeEndpoint, TransactionEndpoint, answer_later, respond};
use crate::error::{ServiceError, ServiceResult};
use crate::facade::FollowerFacade;
use crate::messages::{DeviceEndpointRef, Message};
use crate::payload::SourceIdentifier;
use crate::services::DeviceServices;
use crate::setup::DeviceSetup;

/// Per-device endpoint on the owner and on each follower.
///
/// The owner's instance (named `{device}_master_{node}`) holds the real
/// device services once the device connects and serves proxy requests.
/// A follower's instance (named `{device}_follower`) only receives the
/// mount authorization the owner forwards to it.
pub struct NodeEndpoint {
    identity: DeviceIdentity,
    setup: DeviceSetup,
    ask_timeout: Duration,
    services: Option<DeviceServices>,
    source_ids: Vec<SourceIdentifier>,
    read_tx: Option<DeviceEndpointRef>,
    follower: Option<Arc<FollowerFacade>>,
}

impl NodeEndpoint {
    pub fn owner(setup: DeviceSetup) -> Self {
        Self::build(setup, None)
    }

    pub fn follower(setup: DeviceSetup, facade: Arc<FollowerFacade>) -> Self {
        Self::build(setup, Some(facade))
    }

    fn build(setup: DeviceSetup, follower: Option<Arc<FollowerFacade>>) -> Self {
        Self {
            identity: setup.identity(),
            ask_timeout: setup.ask_timeout(),
            setup,
            services: None,
            source_ids: Vec::new(),
            read_tx: None,
            follower,
        }
    }

    fn services(&self) -> ServiceResult<DeviceServices> {
        self.services
            .clone()
            .ok_or_else(|| ServiceError::NotOwner(self.identity.to_string()))
    }

    async fn initialize(
        &mut self,
        ctx: &mut Context<Message>,
        services: DeviceServices,
        source_ids: Vec<SourceIdentifier>,
    ) -> ServiceResult<()> {
        if let Some(old) = self.read_tx.take() {
            old.stop();
        }
        let tx = services.data_broker.new_read_only_transaction().await?;
        let read_tx = ctx
            .spawn_child("read-tx", TransactionEndpoint::read_only(self.identity.clone(), tx), None)
            .map_err(|e| ServiceError::Other(e.to_string()))?;

        self.read_tx = Some(read_tx);
        self.services = Some(services);
        self.source_ids = source_ids;
        info!(device = %self.identity, sources = self.source_ids.len(), "master data initialized");
        Ok(())
    }

    async fn open_transaction(&self, ctx: &mut Context<Message>, message: &Message) -> ServiceResult<DeviceEndpointRef> {
        let services = self.services()?;
        let idle = self.setup.write_tx_idle_timeout;
        let endpoint = match message {
            Message::NewReadTransactionRequest => {
                return self
                    .read_tx
                    .clone()
                    .ok_or_else(|| ServiceError::NotOwner(self.identity.to_string()));
            }
            Message::NewReadWriteTransactionRequest => {
                let tx = services.data_broker.new_read_write_transaction().await?;
                TransactionEndpoint::read_write(self.identity.clone(), tx)
            }
            _ => {
                let tx = services.data_broker.new_write_only_transaction().await?;
                TransactionEndpoint::write_only(self.identity.clone(), tx)
            }
        };
        ctx.spawn_child("tx", endpoint, idle)
            .map_err(|e| ServiceError::TransactionFailed(e.to_string()))
    }

    fn open_data_tree(&self, ctx: &mut Context<Message>) -> ServiceResult<DeviceEndpointRef> {
        let services = self.services()?;
        let endpoint = DataTreeEndpoint::new(self.identity.clone(), services.data_tree);
        ctx.spawn_child("data-tree", endpoint, self.setup.write_tx_idle_timeout)
            .map_err(|e| ServiceError::DataTree(e.to_string()))
    }

    fn handle_owner(&mut self, ctx: &mut Context<Message>, message: Message, reply: Option<ReplyTo<Message>>) {
        let services = match self.services() {
            Ok(services) => services,
            Err(e) => {
                debug!(device = %self.identity, message = message.kind(), "request before master data");
                respond(reply, Message::Failure(e));
                return;
            }
        };

        match message {
            Message::AskForMasterMountPoint { follower } => {
                info!(device = %self.identity, follower = %follower.path(), "authorizing follower mount");
                follower.forward(
                    Message::RegisterMountPoint {
                        source_ids: self.source_ids.clone(),
                        owner: ctx.myself().clone(),
                    },
                    reply,
                );
            }
            Message::YangTextSchemaSourceRequest { source_id } => {
                answer_later(reply, async move {
                    match services.schema.get_source(&source_id).await {
                        Ok(source) => Message::YangTextSchemaSource(source),
                        Err(e) => Message::Failure(e),
                    }
                });
            }
            Message::InvokeRpcMessage { rpc, input } => {
                answer_later(reply, async move {
                    match services.rpc.invoke_rpc(&rpc, input).await {
                        Ok(Some(result)) => Message::InvokeRpcMessageReply(result),
                        Ok(None) => Message::EmptyResultResponse,
                        Err(e) => Message::Failure(e),
                    }
                });
            }
            Message::InvokeActionMessage { action, target, input } => {
                answer_later(reply, async move {
                    match services.action.invoke_action(&action, &target, input).await {
                        Ok(Some(result)) => Message::InvokeActionMessageReply(result),
                        Ok(None) => Message::EmptyResultResponse,
                        Err(e) => Message::Failure(e),
                    }
                });
            }
            other => debug!(device = %self.identity, message = other.kind(), "unhandled owner message"),
        }
    }

    fn handle_follower(&mut self, message: Message, reply: Option<ReplyTo<Message>>) {
        let Some(facade) = self.follower.as_ref() else {
            debug!(device = %self.identity, message = message.kind(), "follower message on owner endpoint");
            return;
        };
        match message {
            Message::RegisterMountPoint { source_ids, owner } => {
                facade.register_slave_mount_point(owner, source_ids, self.ask_timeout);
                respond(reply, Message::Success(None));
            }
            Message::UnregisterSlaveMountPoint => {
                facade.unregister_slave_mount_point();
            }
            Message::RefreshSlaveActor { setup, ask_timeout } => {
                debug!(device = %self.identity, ?ask_timeout, "follower setup refreshed");
                self.identity = setup.identity();
                self.setup = setup;
                self.ask_timeout = ask_timeout;
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Endpoint<Message> for NodeEndpoint {
    async fn handle(&mut self, ctx: &mut Context<Message>, message: Message, reply: Option<ReplyTo<Message>>) {
        match message {
            Message::CreateInitialMasterActorData { services, source_ids } => {
                let response = match self.initialize(ctx, services, source_ids).await {
                    Ok(()) => Message::MasterActorDataInitialized,
                    Err(e) => {
                        error!(device = %self.identity, error = %e, "failed to initialize master data");
                        Message::Failure(e)
                    }
                };
                respond(reply, response);
            }
            Message::RefreshSetupMasterActorData { setup } => {
                self.ask_timeout = setup.ask_timeout();
                self.identity = setup.identity();
                self.setup = setup;
                debug!(device = %self.identity, "master setup refreshed");
                respond(reply, Message::MasterActorDataInitialized);
            }
            request @ (Message::NewReadTransactionRequest
            | Message::NewReadWriteTransactionRequest
            | Message::NewWriteTransactionRequest) => {
                let response = match self.open_transaction(ctx, &request).await {
                    Ok(tx) => Message::Success(Some(tx)),
                    Err(e) => {
                        warn!(device = %self.identity, request = request.kind(), error = %e, "transaction not opened");
                        Message::Failure(e)
                    }
                };
                respond(reply, response);
            }
            Message::NetconfDataTreeServiceRequest => {
                let response = match self.open_data_tree(ctx) {
                    Ok(session) => Message::Success(Some(session)),
                    Err(e) => Message::Failure(e),
                };
                respond(reply, response);
            }
            message @ (Message::RegisterMountPoint { .. }
            | Message::UnregisterSlaveMountPoint
            | Message::RefreshSlaveActor { .. }) => self.handle_follower(message, reply),
            message => self.handle_owner(ctx, message, reply),
        }
    }

    async fn stopped(&mut self, _ctx: &mut Context<Message>) {
        if let Some(facade) = self.follower.as_ref() {
            facade.unregister_slave_mount_point();
        }
        debug!(device = %self.identity, "device endpoint stopped");
    }
}
