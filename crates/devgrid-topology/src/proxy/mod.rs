//! Proxy services used by followers.
//!
//! Each proxy turns a local service call into a request to the owner
//! endpoint (or a sub-endpoint it handed out) and maps the reply back:
//!
//! - a `Failure` reply or a timeout becomes the proxy's domain error, unless
//!   the cause already is that domain error;
//! - a timeout is reported as "master is down";
//! - an explicit empty sentinel becomes an absent payload, not an error.

mod action;
mod data_broker;
mod data_tree;
mod rpc;
mod schema;

use std::sync::Arc;
use std::time::Duration;

use devgrid_endpoint::AskError;
use devgrid_state::DeviceIdentity;

use crate::error::ServiceError;
use crate::messages::{DeviceEndpointRef, Message};
use crate::services::DeviceServices;

pub use action::ProxyActionService;
pub use data_broker::{ProxyDataBroker, ProxyTransaction};
pub use data_tree::ProxyDataTreeService;
pub use rpc::ProxyRpcService;
pub use schema::ProxySchemaSourceProvider;

/// Error family a proxy reports failures in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorDomain {
    Rpc,
    Action,
    Read,
    Transaction,
    DataTree,
    Schema,
}

impl ErrorDomain {
    pub(crate) fn error(self, message: String) -> ServiceError {
        match self {
            ErrorDomain::Rpc => ServiceError::Rpc(message),
            ErrorDomain::Action => ServiceError::Action(message),
            ErrorDomain::Read => ServiceError::ReadFailed(message),
            ErrorDomain::Transaction => ServiceError::TransactionFailed(message),
            ErrorDomain::DataTree => ServiceError::DataTree(message),
            ErrorDomain::Schema => ServiceError::SchemaSource(message),
        }
    }

    fn owns(self, error: &ServiceError) -> bool {
        matches!(
            (self, error),
            (ErrorDomain::Rpc, ServiceError::Rpc(_))
                | (ErrorDomain::Action, ServiceError::Action(_))
                | (ErrorDomain::Read, ServiceError::ReadFailed(_))
                | (ErrorDomain::Transaction, ServiceError::TransactionFailed(_))
                | (ErrorDomain::DataTree, ServiceError::DataTree(_))
                | (ErrorDomain::Schema, ServiceError::SchemaSource(_))
        )
    }

    /// Wrap `cause` in this domain unless it already belongs to it.
    pub(crate) fn wrap(self, cause: ServiceError) -> ServiceError {
        if self.owns(&cause) {
            cause
        } else {
            self.error(cause.to_string())
        }
    }
}

/// Ask plumbing shared by all proxies of one mount.
pub(crate) struct OwnerClient {
    pub(crate) owner: DeviceEndpointRef,
    pub(crate) device: DeviceIdentity,
    pub(crate) ask_timeout: Duration,
}

impl OwnerClient {
    /// Ask `target` and classify the outcome in `domain`.
    ///
    /// Returns every non-`Failure` reply for the caller to interpret.
    pub(crate) async fn ask(
        &self,
        target: &DeviceEndpointRef,
        message: Message,
        domain: ErrorDomain,
    ) -> Result<Message, ServiceError> {
        match target.ask(message, self.ask_timeout).await {
            Ok(Message::Failure(cause)) => Err(domain.wrap(cause)),
            Ok(reply) => Ok(reply),
            Err(AskError::Timeout { .. }) => {
                Err(domain.wrap(ServiceError::MasterDown(self.device.to_string())))
            }
        }
    }

    pub(crate) fn unexpected(&self, domain: ErrorDomain, operation: &str, reply: &Message) -> ServiceError {
        domain.error(format!(
            "{}: {operation} returned unexpected reply {}",
            self.device,
            reply.kind()
        ))
    }
}

/// Build the five proxy services for a follower mount.
pub fn proxy_services(owner: DeviceEndpointRef, device: DeviceIdentity, ask_timeout: Duration) -> DeviceServices {
    let client = Arc::new(OwnerClient {
        owner,
        device,
        ask_timeout,
    });
    DeviceServices {
        data_broker: Arc::new(ProxyDataBroker::new(Arc::clone(&client))),
        rpc: Arc::new(ProxyRpcService::new(Arc::clone(&client))),
        action: Arc::new(ProxyActionService::new(Arc::clone(&client))),
        data_tree: Arc::new(ProxyDataTreeService::new(Arc::clone(&client))),
        schema: Arc::new(ProxySchemaSourceProvider::new(client)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_keeps_same_domain_errors() {
        let cause = ServiceError::Rpc("device said no".to_string());
        assert_eq!(ErrorDomain::Rpc.wrap(cause.clone()), cause);
    }

    #[test]
    fn wrap_converts_foreign_errors() {
        let wrapped = ErrorDomain::Action.wrap(ServiceError::MasterDown("RemoteDevice{dev-1}".to_string()));
        match wrapped {
            ServiceError::Action(message) => assert!(message.contains("master is down")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
