use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devgrid_endpoint::AskError;
use devgrid_state::{ConnectionStatus, DeviceIdentity, OperationalStatusRecord, StateStore};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::DeviceFacade;
use crate::error::{TopologyError, TopologyResult};
use crate::messages::{DeviceEndpointRef, Message};
use crate::mount::{MountPointService, MountRegistration, MountRole};
use crate::payload::{DeviceNotification, DeviceSession};
use crate::services::DeviceServices;

/// Facade used on the node that holds the device connection.
///
/// On connect it hands the services to its own owner endpoint, publishes
/// them as the mount and records `Connected` with this node as leader.
pub struct OwnerFacade {
    identity: DeviceIdentity,
    node_address: String,
    owner: DeviceEndpointRef,
    ask_timeout: Mutex<Duration>,
    store: StateStore,
    mount: MountRegistration,
}

impl OwnerFacade {
    pub fn new(
        identity: DeviceIdentity,
        node_address: &str,
        owner: DeviceEndpointRef,
        ask_timeout: Duration,
        store: StateStore,
        mounts: Arc<dyn MountPointService>,
    ) -> Self {
        Self {
            mount: MountRegistration::new(identity.clone(), mounts),
            identity,
            node_address: node_address.to_string(),
            owner,
            ask_timeout: Mutex::new(ask_timeout),
            store,
        }
    }

    pub fn set_ask_timeout(&self, ask_timeout: Duration) {
        *self.ask_timeout.lock() = ask_timeout;
    }

    pub fn is_mounted(&self) -> bool {
        self.mount.is_registered()
    }

    /// Withdraw the owner mount, leaving the operational record alone.
    pub fn withdraw(&self) {
        if self.mount.unregister() {
            debug!(device = %self.identity, "owner mount point withdrawn");
        }
    }

    fn record(&self, status: ConnectionStatus) -> OperationalStatusRecord {
        OperationalStatusRecord {
            status,
            leader_address: Some(self.node_address.clone()),
            ..OperationalStatusRecord::connecting(&self.identity)
        }
    }

    fn publish(&self, record: OperationalStatusRecord) {
        let status = record.status;
        match self.store.put_oper(&record) {
            Ok(()) => debug!(device = %self.identity, ?status, "operational status written"),
            Err(e) => error!(device = %self.identity, ?status, error = %e, "failed to write operational status"),
        }
    }
}

#[async_trait]
impl DeviceFacade for OwnerFacade {
    async fn on_device_connected(&self, session: DeviceSession, services: DeviceServices) {
        let ask_timeout = *self.ask_timeout.lock();
        let request = Message::CreateInitialMasterActorData {
            services: services.clone(),
            source_ids: session.source_ids.clone(),
        };
        match self.owner.ask(request, ask_timeout).await {
            Ok(Message::MasterActorDataInitialized) => {}
            Ok(Message::Failure(e)) => {
                error!(device = %self.identity, error = %e, "owner endpoint rejected device services");
                return;
            }
            Ok(other) => {
                error!(device = %self.identity, reply = other.kind(), "unexpected reply to master data");
                return;
            }
            Err(AskError::Timeout { after, .. }) => {
                error!(device = %self.identity, ?after, "owner endpoint did not acknowledge device services");
                return;
            }
        }

        self.mount
            .register(MountRole::Owner, services, session.source_ids.clone());
        self.publish(OperationalStatusRecord {
            session_id: Some(session.session_id),
            available_capabilities: session.available_capabilities,
            unavailable_capabilities: session.unavailable_capabilities,
            ..self.record(ConnectionStatus::Connected)
        });
        info!(
            device = %self.identity,
            leader = %self.node_address,
            session = session.session_id,
            "device connected"
        );
    }

    async fn on_device_disconnected(&self) {
        self.mount.unregister();
        self.publish(self.record(ConnectionStatus::Connecting));
        info!(device = %self.identity, "device disconnected, reconnecting");
    }

    async fn on_device_failed(&self, cause: String) {
        self.mount.unregister();
        warn!(device = %self.identity, %cause, "device connection failed");
        self.publish(OperationalStatusRecord {
            connected_message: Some(cause),
            ..self.record(ConnectionStatus::UnableToConnect)
        });
    }

    fn on_notification(&self, notification: DeviceNotification) {
        self.mount.notify(notification);
    }

    async fn close(&self) -> TopologyResult<()> {
        self.mount.unregister();
        let removed = self
            .store
            .delete_oper_if_leader(&self.identity.name, &self.node_address)
            .map_err(|e| TopologyError::Shutdown {
                device: self.identity.name.clone(),
                reason: e.to_string(),
            })?;
        debug!(device = %self.identity, removed, "owner facade closed");
        Ok(())
    }
}
