use std::sync::Arc;

use async_trait::async_trait;
use devgrid_endpoint::{Context, Endpoint, ReplyTo};
use devgrid_state::DeviceIdentity;
use tracing::{debug, warn};

use super::{answer_later, respond};
use crate::error::{ServiceError, ServiceResult};
use crate::messages::Message;
use crate::payload::{DataNode, Datastore, YangPath};
use crate::services::{ReadTransaction, ReadWriteTransaction, WriteTransaction};

enum TxHandle {
    ReadOnly(Arc<dyn ReadTransaction>),
    WriteOnly(Box<dyn WriteTransaction>),
    ReadWrite(Box<dyn ReadWriteTransaction>),
}

/// Executes one device transaction on behalf of a proxy.
///
/// Write and read-write transactions stop after submit or cancel, and are
/// cancelled when idle for longer than the receive timeout they were
/// spawned with. The shared read-only transaction lives as long as its
/// parent and answers reads concurrently, off its mailbox.
pub struct TransactionEndpoint {
    device: DeviceIdentity,
    tx: TxHandle,
    /// First write failure; reported on submit.
    failed_write: Option<ServiceError>,
}

impl TransactionEndpoint {
    pub fn read_only(device: DeviceIdentity, tx: Box<dyn ReadTransaction>) -> Self {
        Self::with_handle(device, TxHandle::ReadOnly(Arc::from(tx)))
    }

    pub fn write_only(device: DeviceIdentity, tx: Box<dyn WriteTransaction>) -> Self {
        Self::with_handle(device, TxHandle::WriteOnly(tx))
    }

    pub fn read_write(device: DeviceIdentity, tx: Box<dyn ReadWriteTransaction>) -> Self {
        Self::with_handle(device, TxHandle::ReadWrite(tx))
    }

    fn with_handle(device: DeviceIdentity, tx: TxHandle) -> Self {
        Self {
            device,
            tx,
            failed_write: None,
        }
    }

    async fn read(&self, store: Datastore, path: &YangPath) -> ServiceResult<Option<DataNode>> {
        match &self.tx {
            TxHandle::ReadOnly(tx) => tx.read(store, path).await,
            TxHandle::ReadWrite(tx) => tx.read(store, path).await,
            TxHandle::WriteOnly(_) => Err(self.not_readable()),
        }
    }

    async fn exists(&self, store: Datastore, path: &YangPath) -> ServiceResult<bool> {
        match &self.tx {
            TxHandle::ReadOnly(tx) => tx.exists(store, path).await,
            TxHandle::ReadWrite(tx) => tx.exists(store, path).await,
            TxHandle::WriteOnly(_) => Err(self.not_readable()),
        }
    }

    fn not_writable(&self) -> ServiceError {
        ServiceError::TransactionFailed(format!(
            "{}: read-only transaction cannot be written",
            self.device
        ))
    }

    fn not_readable(&self) -> ServiceError {
        ServiceError::ReadFailed(format!("{}: write-only transaction cannot be read", self.device))
    }

    async fn apply_write(&mut self, message: Message) {
        let result = match &self.tx {
            TxHandle::WriteOnly(tx) => write_with(tx.as_ref(), message).await,
            TxHandle::ReadWrite(tx) => write_with(tx.as_ref(), message).await,
            TxHandle::ReadOnly(_) => Err(self.not_writable()),
        };
        if let Err(e) = result {
            warn!(device = %self.device, error = %e, "transaction write failed");
            self.failed_write.get_or_insert(e);
        }
    }

    async fn commit(&self) -> ServiceResult<()> {
        match &self.tx {
            TxHandle::WriteOnly(tx) => tx.commit().await,
            TxHandle::ReadWrite(tx) => tx.commit().await,
            TxHandle::ReadOnly(_) => Err(self.not_writable()),
        }
    }

    async fn cancel(&self) -> bool {
        match &self.tx {
            TxHandle::WriteOnly(tx) => tx.cancel().await,
            TxHandle::ReadWrite(tx) => tx.cancel().await,
            TxHandle::ReadOnly(_) => false,
        }
    }
}

fn read_reply(result: ServiceResult<Option<DataNode>>) -> Message {
    match result {
        Ok(Some(data)) => Message::NormalizedNode(data),
        Ok(None) => Message::EmptyReadResponse,
        Err(e) => Message::Failure(e),
    }
}

fn exists_reply(result: ServiceResult<bool>) -> Message {
    match result {
        Ok(exists) => Message::Exists(exists),
        Err(e) => Message::Failure(e),
    }
}

async fn write_with<T: WriteTransaction + ?Sized>(tx: &T, message: Message) -> ServiceResult<()> {
    match message {
        Message::PutRequest { store, path, data } => tx.put(store, &path, data).await,
        Message::MergeRequest { store, path, data } => tx.merge(store, &path, data).await,
        Message::DeleteRequest { store, path } => tx.delete(store, &path).await,
        _ => Ok(()),
    }
}

#[async_trait]
impl Endpoint<Message> for TransactionEndpoint {
    async fn handle(&mut self, ctx: &mut Context<Message>, message: Message, reply: Option<ReplyTo<Message>>) {
        match message {
            Message::ReadRequest { store, path } => match &self.tx {
                TxHandle::ReadOnly(tx) => {
                    let tx = Arc::clone(tx);
                    answer_later(reply, async move { read_reply(tx.read(store, &path).await) });
                }
                _ => respond(reply, read_reply(self.read(store, &path).await)),
            },
            Message::ExistsRequest { store, path } => match &self.tx {
                TxHandle::ReadOnly(tx) => {
                    let tx = Arc::clone(tx);
                    answer_later(reply, async move { exists_reply(tx.exists(store, &path).await) });
                }
                _ => respond(reply, exists_reply(self.exists(store, &path).await)),
            },
            message @ (Message::PutRequest { .. }
            | Message::MergeRequest { .. }
            | Message::DeleteRequest { .. }) => self.apply_write(message).await,
            Message::SubmitRequest => {
                let response = match self.failed_write.take() {
                    Some(e) => {
                        self.cancel().await;
                        Message::Failure(ServiceError::TransactionFailed(format!(
                            "{}: submit rejected after failed write: {e}",
                            self.device
                        )))
                    }
                    None => match self.commit().await {
                        Ok(()) => Message::Success(None),
                        Err(e) => Message::Failure(e),
                    },
                };
                debug!(device = %self.device, "transaction submitted");
                respond(reply, response);
                ctx.stop();
            }
            Message::CancelRequest => {
                let cancelled = self.cancel().await;
                respond(reply, Message::Cancelled(cancelled));
                ctx.stop();
            }
            other => debug!(device = %self.device, message = other.kind(), "unhandled transaction message"),
        }
    }

    async fn idle(&mut self, ctx: &mut Context<Message>) {
        warn!(
            device = %self.device,
            path = %ctx.myself().path(),
            "transaction idle for too long, cancelling"
        );
        self.cancel().await;
        ctx.stop();
    }
}
