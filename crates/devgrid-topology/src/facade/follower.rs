use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devgrid_state::DeviceIdentity;
use tracing::{debug, info};

use super::DeviceFacade;
use crate::error::TopologyResult;
use crate::messages::DeviceEndpointRef;
use crate::mount::{MountPointService, MountRegistration, MountRole};
use crate::payload::{DeviceNotification, DeviceSession, SourceIdentifier};
use crate::proxy::proxy_services;
use crate::services::DeviceServices;

/// Facade used on nodes that reach the device through its owner.
pub struct FollowerFacade {
    identity: DeviceIdentity,
    mount: MountRegistration,
}

impl FollowerFacade {
    pub fn new(identity: DeviceIdentity, mounts: Arc<dyn MountPointService>) -> Self {
        Self {
            mount: MountRegistration::new(identity.clone(), mounts),
            identity,
        }
    }

    /// Publish proxies to `owner`, replacing any previous follower mount.
    pub fn register_slave_mount_point(
        &self,
        owner: DeviceEndpointRef,
        source_ids: Vec<SourceIdentifier>,
        ask_timeout: Duration,
    ) -> bool {
        self.mount.unregister();
        let services = proxy_services(owner.clone(), self.identity.clone(), ask_timeout);
        let registered = self.mount.register(MountRole::Follower, services, source_ids);
        if registered {
            info!(device = %self.identity, owner = %owner.path(), "follower mount point registered");
        }
        registered
    }

    pub fn unregister_slave_mount_point(&self) -> bool {
        let removed = self.mount.unregister();
        if removed {
            debug!(device = %self.identity, "follower mount point withdrawn");
        }
        removed
    }

    pub fn is_mounted(&self) -> bool {
        self.mount.is_registered()
    }
}

#[async_trait]
impl DeviceFacade for FollowerFacade {
    async fn on_device_connected(&self, session: DeviceSession, services: DeviceServices) {
        self.mount.unregister();
        self.mount
            .register(MountRole::Follower, services, session.source_ids);
    }

    async fn on_device_disconnected(&self) {
        self.unregister_slave_mount_point();
    }

    async fn on_device_failed(&self, cause: String) {
        debug!(device = %self.identity, %cause, "owner reported device failure");
        self.unregister_slave_mount_point();
    }

    fn on_notification(&self, notification: DeviceNotification) {
        self.mount.notify(notification);
    }

    async fn close(&self) -> TopologyResult<()> {
        self.unregister_slave_mount_point();
        Ok(())
    }
}
