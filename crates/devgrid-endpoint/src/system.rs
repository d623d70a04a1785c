//! Endpoint registry and addressing.
//!
//! An `EndpointSystem` is one node's view of the endpoint fabric. Systems
//! created with [`EndpointSystem::for_node`] share a registry, so endpoints
//! spawned by one node are reachable from every other node by path.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::endpoint::{Context, Endpoint, run_endpoint};
use crate::error::{AskError, EndpointError, EndpointResult};
use crate::path::EndpointPath;

/// Item delivered to an endpoint's mailbox.
pub(crate) enum Signal<M> {
    Deliver { message: M, reply: Option<ReplyTo<M>> },
    Stop,
}

pub(crate) type Mailbox<M> = mpsc::UnboundedSender<Signal<M>>;
pub(crate) type Registry<M> = Arc<DashMap<EndpointPath, Mailbox<M>>>;

/// One-shot reply handle carried alongside an asked message.
///
/// Forwarding a message together with its `ReplyTo` lets a third endpoint
/// answer the original asker.
pub struct ReplyTo<M> {
    tx: oneshot::Sender<M>,
}

impl<M> ReplyTo<M> {
    /// Complete the ask. A reply to an asker that gave up is dropped.
    pub fn send(self, message: M) {
        if self.tx.send(message).is_err() {
            debug!("reply dropped, asker no longer waiting");
        }
    }
}

impl<M> std::fmt::Debug for ReplyTo<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReplyTo")
    }
}

/// A node's handle on the shared endpoint fabric.
pub struct EndpointSystem<M> {
    address: String,
    registry: Registry<M>,
}

impl<M> Clone for EndpointSystem<M> {
    fn clone(&self) -> Self {
        Self {
            address: self.address.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<M: Send + 'static> EndpointSystem<M> {
    /// Create a fresh fabric with a single node.
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            registry: Arc::new(DashMap::new()),
        }
    }

    /// Another node on the same fabric.
    pub fn for_node(&self, address: &str) -> Self {
        Self {
            address: address.to_string(),
            registry: Arc::clone(&self.registry),
        }
    }

    /// Cluster address of this node.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Path of a top-level endpoint on this node.
    pub fn user_path(&self, name: &str) -> EndpointResult<EndpointPath> {
        EndpointPath::user(&self.address, name)
    }

    /// Spawn a top-level endpoint on this node.
    pub fn spawn<E: Endpoint<M>>(&self, name: &str, endpoint: E) -> EndpointResult<EndpointRef<M>> {
        let path = self.user_path(name)?;
        self.spawn_at(path, endpoint, None)
    }

    pub(crate) fn spawn_at<E: Endpoint<M>>(
        &self,
        path: EndpointPath,
        endpoint: E,
        receive_timeout: Option<Duration>,
    ) -> EndpointResult<EndpointRef<M>> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.registry.entry(path.clone()) {
            Entry::Occupied(mut slot) => {
                if !slot.get().is_closed() {
                    return Err(EndpointError::NameTaken(path.to_string()));
                }
                slot.insert(tx.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(tx.clone());
            }
        }

        let myself = EndpointRef {
            path: path.clone(),
            registry: Arc::clone(&self.registry),
        };
        let ctx = Context::new(myself.clone(), self.clone(), tx, receive_timeout);
        tokio::spawn(run_endpoint(endpoint, ctx, rx));
        debug!(%path, "endpoint spawned");
        Ok(myself)
    }

    /// Reference to whatever endpoint lives (or will live) at `path`.
    pub fn resolve(&self, path: EndpointPath) -> EndpointRef<M> {
        EndpointRef {
            path,
            registry: Arc::clone(&self.registry),
        }
    }

    pub(crate) fn registry_remove_if_same(&self, path: &EndpointPath, mailbox: &Mailbox<M>) {
        self.registry.remove_if(path, |_, tx| tx.same_channel(mailbox));
    }

    /// Number of live endpoints on the whole fabric.
    pub fn live_endpoints(&self) -> usize {
        self.registry.iter().filter(|e| !e.value().is_closed()).count()
    }
}

/// Addressable handle on an endpoint, resolved on every send.
pub struct EndpointRef<M> {
    path: EndpointPath,
    registry: Registry<M>,
}

impl<M> Clone for EndpointRef<M> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<M> std::fmt::Debug for EndpointRef<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EndpointRef").field(&self.path).finish()
    }
}

impl<M> PartialEq for EndpointRef<M> {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl<M> Eq for EndpointRef<M> {}

impl<M: Send + 'static> EndpointRef<M> {
    pub fn path(&self) -> &EndpointPath {
        &self.path
    }

    /// Whether a running endpoint currently answers at this path.
    pub fn is_alive(&self) -> bool {
        self.registry
            .get(&self.path)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Fire-and-forget send.
    pub fn tell(&self, message: M) {
        self.deliver(Signal::Deliver {
            message,
            reply: None,
        });
    }

    /// Send `message` on behalf of someone else; the target answers `reply`.
    pub fn forward(&self, message: M, reply: Option<ReplyTo<M>>) {
        self.deliver(Signal::Deliver { message, reply });
    }

    /// Request-reply with a deadline.
    ///
    /// A request that cannot be delivered, or that the target drops without
    /// answering, still waits out the full deadline before failing.
    pub async fn ask(&self, message: M, timeout: Duration) -> Result<M, AskError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        self.deliver(Signal::Deliver {
            message,
            reply: Some(ReplyTo { tx }),
        });

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                tokio::time::sleep_until(deadline).await;
                Err(self.timeout_error(timeout))
            }
            Err(_) => Err(self.timeout_error(timeout)),
        }
    }

    /// Stop the endpoint after the message it is currently processing.
    ///
    /// The path is released immediately; later sends to it are dead letters
    /// until a new endpoint is spawned there.
    pub fn stop(&self) {
        if let Some((_, tx)) = self.registry.remove(&self.path) {
            if tx.send(Signal::Stop).is_err() {
                debug!(path = %self.path, "stop sent to terminated endpoint");
            }
        }
    }

    fn deliver(&self, signal: Signal<M>) {
        let sent = match self.registry.get(&self.path) {
            Some(tx) => tx.send(signal).is_ok(),
            None => false,
        };
        if !sent {
            debug!(path = %self.path, "dead letter");
        }
    }

    fn timeout_error(&self, after: Duration) -> AskError {
        AskError::Timeout {
            path: self.path.to_string(),
            after,
        }
    }
}
