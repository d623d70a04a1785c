//! Endpoint behaviour and the per-endpoint processing loop.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{EndpointError, EndpointResult};
use crate::system::{EndpointRef, EndpointSystem, Mailbox, ReplyTo, Signal};

/// Behaviour of a mailbox endpoint.
///
/// Messages are handled one at a time, in arrival order. `reply` is present
/// when the sender asked (or forwarded an ask) and expects an answer.
#[async_trait]
pub trait Endpoint<M: Send + 'static>: Send + 'static {
    async fn handle(&mut self, ctx: &mut Context<M>, message: M, reply: Option<ReplyTo<M>>);

    /// Called when no message arrived within the receive timeout.
    async fn idle(&mut self, _ctx: &mut Context<M>) {}

    /// Called once after the endpoint stopped and its children were told to stop.
    async fn stopped(&mut self, _ctx: &mut Context<M>) {}
}

/// Runtime view an endpoint gets while handling a message.
pub struct Context<M> {
    myself: EndpointRef<M>,
    system: EndpointSystem<M>,
    own_mailbox: Mailbox<M>,
    children: Vec<EndpointRef<M>>,
    receive_timeout: Option<Duration>,
    next_child_id: u64,
    stopping: bool,
}

impl<M: Send + 'static> Context<M> {
    pub(crate) fn new(
        myself: EndpointRef<M>,
        system: EndpointSystem<M>,
        own_mailbox: Mailbox<M>,
        receive_timeout: Option<Duration>,
    ) -> Self {
        Self {
            myself,
            system,
            own_mailbox,
            children: Vec::new(),
            receive_timeout,
            next_child_id: 0,
            stopping: false,
        }
    }

    /// Reference to the endpoint being run.
    pub fn myself(&self) -> &EndpointRef<M> {
        &self.myself
    }

    pub fn system(&self) -> &EndpointSystem<M> {
        &self.system
    }

    /// Spawn a child endpoint named `{prefix}-{n}`, unique under this parent.
    ///
    /// Children are stopped when the parent stops. `receive_timeout` arms the
    /// child's `idle` hook.
    pub fn spawn_child<E: Endpoint<M>>(
        &mut self,
        prefix: &str,
        endpoint: E,
        receive_timeout: Option<Duration>,
    ) -> EndpointResult<EndpointRef<M>> {
        if self.stopping {
            return Err(EndpointError::Stopped(self.myself.path().to_string()));
        }
        self.next_child_id += 1;
        let name = format!("{prefix}-{}", self.next_child_id);
        let path = self.myself.path().child(&name)?;
        let child = self.system.spawn_at(path, endpoint, receive_timeout)?;
        self.children.retain(|c| c.is_alive());
        self.children.push(child.clone());
        Ok(child)
    }

    /// Arm or disarm the idle timer for this endpoint.
    pub fn set_receive_timeout(&mut self, timeout: Option<Duration>) {
        self.receive_timeout = timeout;
    }

    /// Stop this endpoint once the current message has been handled.
    pub fn stop(&mut self) {
        self.stopping = true;
    }

    fn release_path(&self) {
        self.system
            .registry_remove_if_same(self.myself.path(), &self.own_mailbox);
    }
}

pub(crate) async fn run_endpoint<M, E>(
    mut endpoint: E,
    mut ctx: Context<M>,
    mut mailbox: mpsc::UnboundedReceiver<Signal<M>>,
) where
    M: Send + 'static,
    E: Endpoint<M>,
{
    loop {
        let signal = match ctx.receive_timeout {
            Some(idle_after) => match tokio::time::timeout(idle_after, mailbox.recv()).await {
                Ok(signal) => signal,
                Err(_) => {
                    endpoint.idle(&mut ctx).await;
                    if ctx.stopping {
                        break;
                    }
                    continue;
                }
            },
            None => mailbox.recv().await,
        };

        match signal {
            Some(Signal::Deliver { message, reply }) => {
                endpoint.handle(&mut ctx, message, reply).await;
                if ctx.stopping {
                    break;
                }
            }
            Some(Signal::Stop) | None => break,
        }
    }

    ctx.stopping = true;
    ctx.release_path();
    for child in ctx.children.drain(..) {
        child.stop();
    }
    endpoint.stopped(&mut ctx).await;
    debug!(path = %ctx.myself.path(), "endpoint stopped");
}
