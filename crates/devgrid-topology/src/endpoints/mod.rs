//! Endpoints run by the owner and follower for one device.
//!
//! [`NodeEndpoint`] is the per-device endpoint: on the owner it answers
//! mount, RPC, action, schema and transaction requests; on a follower it
//! receives the mount authorization. Transactions and bulk data tree
//! sessions get their own child endpoints.

mod data_tree;
mod node;
mod transaction;

pub use data_tree::DataTreeEndpoint;
pub use node::NodeEndpoint;
pub use transaction::TransactionEndpoint;

use devgrid_endpoint::ReplyTo;
use tracing::debug;

use crate::messages::Message;

/// Answer a request if the sender expects a reply.
pub(crate) fn respond(reply: Option<ReplyTo<Message>>, message: Message) {
    match reply {
        Some(reply) => reply.send(message),
        None => debug!(reply = message.kind(), "no reply expected"),
    }
}

/// Run a device call off the mailbox and answer when it completes.
pub(crate) fn answer_later<F>(reply: Option<ReplyTo<Message>>, call: F)
where
    F: Future<Output = Message> + Send + 'static,
{
    tokio::spawn(async move {
        let response = call.await;
        respond(reply, response);
    });
}

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use devgrid_endpoint::{Context, Endpoint, ReplyTo};
    use parking_lot::Mutex;

    use super::respond;
    use crate::messages::Message;

    /// Stands in for a device endpoint and keeps the ask timeout of every
    /// setup pushed to it. Master data requests are acknowledged.
    #[derive(Default)]
    pub(crate) struct SetupRecorder {
        pub timeouts: Arc<Mutex<Vec<Duration>>>,
    }

    #[async_trait]
    impl Endpoint<Message> for SetupRecorder {
        async fn handle(&mut self, _ctx: &mut Context<Message>, message: Message, reply: Option<ReplyTo<Message>>) {
            match message {
                Message::RefreshSlaveActor { ask_timeout, .. } => self.timeouts.lock().push(ask_timeout),
                Message::RefreshSetupMasterActorData { setup } => {
                    self.timeouts.lock().push(setup.ask_timeout());
                    respond(reply, Message::MasterActorDataInitialized);
                }
                Message::CreateInitialMasterActorData { .. } => respond(reply, Message::MasterActorDataInitialized),
                _ => {}
            }
        }
    }
}
