//! Published per-device interfaces ("mounts").
//!
//! A [`MountPointService`] is the node-local registry other components use
//! to reach a device. [`MountRegistration`] is the guarded handle a facade
//! holds: registering twice or unregistering while unregistered is a no-op.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use devgrid_state::DeviceIdentity;

use crate::payload::{DeviceNotification, SourceIdentifier};
use crate::services::DeviceServices;

const NOTIFICATION_CAPACITY: usize = 256;

/// Which kind of facade published a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountRole {
    /// Backed by the live device connection.
    Owner,
    /// Backed by proxies to the owner.
    Follower,
}

/// One published device interface.
#[derive(Clone)]
pub struct MountPoint {
    pub identity: DeviceIdentity,
    pub role: MountRole,
    pub services: DeviceServices,
    pub source_ids: Vec<SourceIdentifier>,
    notifications: broadcast::Sender<DeviceNotification>,
}

impl MountPoint {
    pub fn new(
        identity: DeviceIdentity,
        role: MountRole,
        services: DeviceServices,
        source_ids: Vec<SourceIdentifier>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            identity,
            role,
            services,
            source_ids,
            notifications,
        }
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<DeviceNotification> {
        self.notifications.subscribe()
    }

    fn publish_notification(&self, notification: DeviceNotification) {
        if self.notifications.send(notification).is_err() {
            debug!(device = %self.identity, "notification dropped, no subscribers");
        }
    }
}

impl std::fmt::Debug for MountPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountPoint")
            .field("identity", &self.identity)
            .field("role", &self.role)
            .field("source_ids", &self.source_ids)
            .finish()
    }
}

/// Node-local registry of published device interfaces.
pub trait MountPointService: Send + Sync {
    fn register(&self, mount: MountPoint);

    fn unregister(&self, device: &str);
}

/// In-memory [`MountPointService`] with lookup by device name.
#[derive(Default)]
pub struct LocalMountRegistry {
    mounts: DashMap<String, MountPoint>,
    registrations: AtomicU64,
}

impl LocalMountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, device: &str) -> Option<MountPoint> {
        self.mounts.get(device).map(|m| m.value().clone())
    }

    pub fn is_mounted(&self, device: &str) -> bool {
        self.mounts.contains_key(device)
    }

    /// Names of all mounted devices, sorted.
    pub fn mounted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mounts.iter().map(|m| m.key().clone()).collect();
        names.sort();
        names
    }

    /// Total number of registrations ever accepted.
    pub fn registration_count(&self) -> u64 {
        self.registrations.load(Ordering::SeqCst)
    }
}

impl MountPointService for LocalMountRegistry {
    fn register(&self, mount: MountPoint) {
        let name = mount.identity.name.clone();
        let role = mount.role;
        if self.mounts.insert(name.clone(), mount).is_some() {
            warn!(device = %name, ?role, "replaced an existing mount point");
        }
        self.registrations.fetch_add(1, Ordering::SeqCst);
        info!(device = %name, ?role, "mount point registered");
    }

    fn unregister(&self, device: &str) {
        if self.mounts.remove(device).is_some() {
            info!(%device, "mount point unregistered");
        }
    }
}

/// Guarded handle on this node's mount for one device.
pub struct MountRegistration {
    identity: DeviceIdentity,
    mounts: Arc<dyn MountPointService>,
    current: Mutex<Option<MountPoint>>,
}

impl MountRegistration {
    pub fn new(identity: DeviceIdentity, mounts: Arc<dyn MountPointService>) -> Self {
        Self {
            identity,
            mounts,
            current: Mutex::new(None),
        }
    }

    /// Publish the mount. Returns false if one is already registered.
    pub fn register(
        &self,
        role: MountRole,
        services: DeviceServices,
        source_ids: Vec<SourceIdentifier>,
    ) -> bool {
        let mut current = self.current.lock();
        if current.is_some() {
            debug!(device = %self.identity, "mount point already registered");
            return false;
        }
        let mount = MountPoint::new(self.identity.clone(), role, services, source_ids);
        self.mounts.register(mount.clone());
        *current = Some(mount);
        true
    }

    /// Withdraw the mount. Returns false if nothing was registered.
    pub fn unregister(&self) -> bool {
        let mut current = self.current.lock();
        if current.take().is_none() {
            return false;
        }
        self.mounts.unregister(&self.identity.name);
        true
    }

    pub fn is_registered(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Deliver a device notification to the mount's subscribers.
    pub fn notify(&self, notification: DeviceNotification) {
        match self.current.lock().as_ref() {
            Some(mount) => mount.publish_notification(notification),
            None => debug!(device = %self.identity, "notification without mount point"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedDevice;

    fn registration(registry: &Arc<LocalMountRegistry>) -> MountRegistration {
        MountRegistration::new(
            DeviceIdentity::new("dev-1", "10.0.0.1", 830),
            Arc::clone(registry) as Arc<dyn MountPointService>,
        )
    }

    #[test]
    fn double_register_publishes_once() {
        let registry = Arc::new(LocalMountRegistry::new());
        let reg = registration(&registry);
        let services = SimulatedDevice::new("dev-1").services();

        assert!(reg.register(MountRole::Owner, services.clone(), vec![]));
        assert!(!reg.register(MountRole::Owner, services, vec![]));
        assert_eq!(registry.registration_count(), 1);
        assert!(registry.is_mounted("dev-1"));
    }

    #[test]
    fn unregister_when_unregistered_is_noop() {
        let registry = Arc::new(LocalMountRegistry::new());
        let reg = registration(&registry);

        assert!(!reg.unregister());
        reg.register(MountRole::Follower, SimulatedDevice::new("dev-1").services(), vec![]);
        assert!(reg.unregister());
        assert!(!reg.unregister());
        assert!(registry.mounted().is_empty());
    }

    #[test]
    fn notifications_reach_subscribers() {
        let registry = Arc::new(LocalMountRegistry::new());
        let reg = registration(&registry);
        reg.register(MountRole::Owner, SimulatedDevice::new("dev-1").services(), vec![]);

        let mut rx = registry.lookup("dev-1").unwrap().subscribe_notifications();
        reg.notify(DeviceNotification {
            name: crate::payload::QName::new("ietf-netconf-notifications", "netconf-config-change"),
            body: serde_json::json!({"changed-by": "admin"}),
        });
        assert_eq!(rx.try_recv().unwrap().body["changed-by"], "admin");
    }
}
