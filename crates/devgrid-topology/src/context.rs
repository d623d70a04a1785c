//! Per-device role state machine.
//!
//! `Unstarted -> {Leader, Follower} -> Closed`, with any number of
//! `Leader <-> Follower` switches in between. Transitions for one device are
//! serialized by a single async mutex.

use std::sync::Arc;

use async_trait::async_trait;
use devgrid_state::{DeviceConfig, DeviceIdentity};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::connector::DeviceConnection;
use crate::election::SingletonService;
use crate::endpoints::NodeEndpoint;
use crate::error::TopologyResult;
use crate::facade::{DeviceFacade, OwnerFacade};
use crate::messages::{DeviceEndpointRef, Message};
use crate::node_manager::NodeManager;
use crate::setup::{DeviceSetup, NodeResources, owner_endpoint_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Unstarted,
    Leader,
    Follower,
    Closed,
}

struct ContextState {
    role: DeviceRole,
    setup: DeviceSetup,
    owner: Option<DeviceEndpointRef>,
    /// Kept after losing leadership so `close` can release what it published.
    owner_facade: Option<Arc<OwnerFacade>>,
    connection: Option<Box<dyn DeviceConnection>>,
    node_manager: Option<Arc<NodeManager>>,
}

impl ContextState {
    fn stop_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.stop();
        }
    }

    fn close_node_manager(&mut self) {
        if let Some(manager) = self.node_manager.take() {
            manager.close();
        }
    }
}

pub struct DeviceContext {
    identity: DeviceIdentity,
    group: String,
    resources: NodeResources,
    state: Mutex<ContextState>,
}

impl DeviceContext {
    pub fn new(setup: DeviceSetup, resources: NodeResources) -> Arc<Self> {
        Arc::new(Self {
            identity: setup.identity(),
            group: format!("{}/{}", setup.topology_id, setup.device_name()),
            resources,
            state: Mutex::new(ContextState {
                role: DeviceRole::Unstarted,
                setup,
                owner: None,
                owner_facade: None,
                connection: None,
                node_manager: None,
            }),
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub async fn role(&self) -> DeviceRole {
        self.state.lock().await.role
    }

    pub async fn setup(&self) -> DeviceSetup {
        self.state.lock().await.setup.clone()
    }

    pub async fn owner_endpoint(&self) -> Option<DeviceEndpointRef> {
        self.state.lock().await.owner.clone()
    }

    pub async fn node_manager(&self) -> Option<Arc<NodeManager>> {
        self.state.lock().await.node_manager.clone()
    }

    /// Take ownership: spawn the owner endpoint and connect to the device.
    pub async fn become_leader(&self) {
        let mut state = self.state.lock().await;
        match state.role {
            DeviceRole::Closed => return,
            DeviceRole::Leader if state.owner.as_ref().is_some_and(|o| o.is_alive()) => {
                debug!(device = %self.identity, "already leader");
                return;
            }
            _ => {}
        }
        info!(device = %self.identity, node = %self.resources.node_address(), "becoming leader");

        state.close_node_manager();
        state.stop_connection();

        let system = &self.resources.system;
        let name = owner_endpoint_name(&self.identity.name, system.address());
        if let Some(previous) = state.owner.take() {
            previous.stop();
        }
        match system.user_path(&name) {
            Ok(path) => {
                let stale = system.resolve(path);
                if stale.is_alive() {
                    warn!(device = %self.identity, path = %stale.path(), "stopping previous owner endpoint");
                    stale.stop();
                }
            }
            Err(e) => {
                error!(device = %self.identity, error = %e, "invalid owner endpoint name");
                return;
            }
        }

        let owner = match system.spawn(&name, NodeEndpoint::owner(state.setup.clone())) {
            Ok(owner) => owner,
            Err(e) => {
                error!(device = %self.identity, error = %e, "failed to spawn owner endpoint");
                return;
            }
        };

        if let Some(previous) = state.owner_facade.take() {
            previous.withdraw();
        }
        let facade = Arc::new(OwnerFacade::new(
            self.identity.clone(),
            system.address(),
            owner.clone(),
            state.setup.ask_timeout(),
            self.resources.store.clone(),
            Arc::clone(&self.resources.mounts),
        ));
        let connection = self
            .resources
            .connector
            .start(&state.setup, Arc::clone(&facade) as Arc<dyn DeviceFacade>);

        state.owner = Some(owner);
        state.owner_facade = Some(facade);
        state.connection = Some(connection);
        state.role = DeviceRole::Leader;
    }

    /// Follow another node: drop any ownership and watch the owner's status.
    pub async fn become_follower(&self) {
        let mut state = self.state.lock().await;
        if state.role == DeviceRole::Closed {
            return;
        }
        info!(device = %self.identity, node = %self.resources.node_address(), "becoming follower");

        state.stop_connection();
        if let Some(owner) = state.owner.take() {
            owner.stop();
        }
        if let Some(facade) = state.owner_facade.as_ref() {
            facade.withdraw();
        }
        state.close_node_manager();

        let manager = NodeManager::new(state.setup.clone(), self.resources.clone());
        manager.register_listener();
        state.node_manager = Some(manager);
        state.role = DeviceRole::Follower;
    }

    /// Apply a new configuration record without changing role.
    pub async fn refresh(&self, config: DeviceConfig) {
        let mut state = self.state.lock().await;
        if state.role == DeviceRole::Closed {
            return;
        }
        state.setup = state.setup.with_config(config);
        debug!(device = %self.identity, role = ?state.role, "refreshing device setup");

        match state.role {
            DeviceRole::Leader => {
                let setup = state.setup.clone();
                if let Some(owner) = state.owner.clone() {
                    let device = self.identity.clone();
                    let ask_timeout = setup.ask_timeout();
                    let request = Message::RefreshSetupMasterActorData { setup: setup.clone() };
                    tokio::spawn(async move {
                        match owner.ask(request, ask_timeout).await {
                            Ok(Message::MasterActorDataInitialized) => {
                                debug!(%device, "owner endpoint accepted new setup");
                            }
                            Ok(other) => warn!(%device, reply = other.kind(), "owner endpoint rejected new setup"),
                            Err(e) => warn!(%device, error = %e, "failed to refresh owner endpoint setup"),
                        }
                    });
                }

                state.stop_connection();
                if let Some(facade) = state.owner_facade.clone() {
                    facade.set_ask_timeout(setup.ask_timeout());
                    facade.on_device_disconnected().await;
                    let connection = self
                        .resources
                        .connector
                        .start(&setup, facade as Arc<dyn DeviceFacade>);
                    state.connection = Some(connection);
                }
            }
            DeviceRole::Follower => {
                if let Some(manager) = state.node_manager.as_ref() {
                    manager.refresh_device(state.setup.clone());
                }
            }
            DeviceRole::Unstarted | DeviceRole::Closed => {}
        }
    }

    /// Release everything held for this device.
    ///
    /// Fails only when the owner facade cannot release what it published.
    pub async fn close(&self) -> TopologyResult<()> {
        let mut state = self.state.lock().await;
        if state.role == DeviceRole::Closed {
            return Ok(());
        }
        state.role = DeviceRole::Closed;
        state.close_node_manager();
        state.stop_connection();

        let result = match state.owner_facade.take() {
            Some(facade) => facade.close().await,
            None => Ok(()),
        };
        if let Some(owner) = state.owner.take() {
            owner.stop();
        }

        match &result {
            Ok(()) => info!(device = %self.identity, "device context closed"),
            Err(e) => error!(device = %self.identity, error = %e, "device context closed with error"),
        }
        result
    }
}

#[async_trait]
impl SingletonService for DeviceContext {
    fn group(&self) -> String {
        self.group.clone()
    }

    async fn become_leader(&self) {
        DeviceContext::become_leader(self).await;
    }

    async fn become_follower(&self) {
        DeviceContext::become_follower(self).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::connector::DeviceConnector;
    use crate::endpoints::recording::SetupRecorder;
    use crate::error::TopologyError;
    use crate::mount::{LocalMountRegistry, MountPointService, MountRole};
    use crate::setup::TopologySettings;
    use crate::simulated::SimulatedConnector;
    use devgrid_endpoint::EndpointSystem;
    use devgrid_state::{ConnectionStatus, OperationalStatusRecord, StateStore};

    struct Node {
        resources: NodeResources,
        mounts: Arc<LocalMountRegistry>,
        connector: Arc<SimulatedConnector>,
    }

    fn node(address: &str) -> Node {
        let mounts = Arc::new(LocalMountRegistry::new());
        let connector = Arc::new(SimulatedConnector::new());
        Node {
            resources: NodeResources {
                system: EndpointSystem::new(address),
                store: StateStore::open_in_memory().unwrap(),
                mounts: Arc::clone(&mounts) as Arc<dyn MountPointService>,
                connector: Arc::clone(&connector) as Arc<dyn DeviceConnector>,
            },
            mounts,
            connector,
        }
    }

    fn context(node: &Node) -> Arc<DeviceContext> {
        let setup = DeviceSetup::new(
            &TopologySettings::default(),
            DeviceConfig::new("dev-1", "192.0.2.1", 830),
        );
        DeviceContext::new(setup, node.resources.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn leader_publishes_connected_status() {
        let node = node("node-1");
        let ctx = context(&node);
        ctx.become_leader().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let record = node.resources.store.get_oper("dev-1").unwrap().unwrap();
        assert_eq!(record.status, ConnectionStatus::Connected);
        assert_eq!(record.leader_address.as_deref(), Some("node-1"));
        assert!(record.session_id.is_some());
        assert_eq!(node.mounts.lookup("dev-1").unwrap().role, MountRole::Owner);
        assert_eq!(ctx.role().await, DeviceRole::Leader);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_become_leader_keeps_one_endpoint() {
        let node = node("node-1");
        let ctx = context(&node);
        ctx.become_leader().await;
        let first = ctx.owner_endpoint().await.unwrap();
        ctx.become_leader().await;
        let second = ctx.owner_endpoint().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(first, second);
        assert!(second.is_alive());
        assert_eq!(node.mounts.registration_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_device_records_failure() {
        let node = node("node-1");
        node.connector.set_unreachable("dev-1", "connection refused");
        let ctx = context(&node);
        ctx.become_leader().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let record = node.resources.store.get_oper("dev-1").unwrap().unwrap();
        assert_eq!(record.status, ConnectionStatus::UnableToConnect);
        assert_eq!(record.connected_message.as_deref(), Some("connection refused"));
        assert!(!node.mounts.is_mounted("dev-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn becoming_follower_stops_owner_side() {
        let node = node("node-1");
        let ctx = context(&node);
        ctx.become_leader().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let owner = ctx.owner_endpoint().await.unwrap();

        ctx.become_follower().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!owner.is_alive());
        assert!(!node.connector.is_connected("dev-1"));
        assert!(!node.mounts.is_mounted("dev-1"));
        assert!(ctx.node_manager().await.is_some());
        assert_eq!(ctx.role().await, DeviceRole::Follower);
    }

    #[tokio::test(start_paused = true)]
    async fn close_removes_own_operational_record() {
        let node = node("node-1");
        let ctx = context(&node);
        ctx.become_leader().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        ctx.close().await.unwrap();
        assert!(node.resources.store.get_oper("dev-1").unwrap().is_none());
        assert!(!node.mounts.is_mounted("dev-1"));
        assert_eq!(ctx.role().await, DeviceRole::Closed);

        // closed contexts ignore later transitions
        ctx.become_leader().await;
        assert!(ctx.owner_endpoint().await.is_none());
        ctx.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_while_leader_reconnects() {
        let node = node("node-1");
        let ctx = context(&node);
        ctx.become_leader().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let first = node.resources.store.get_oper("dev-1").unwrap().unwrap();

        let mut config = DeviceConfig::new("dev-1", "192.0.2.1", 830);
        config.actor_response_wait_time_secs = Some(9);
        ctx.refresh(config).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = node.resources.store.get_oper("dev-1").unwrap().unwrap();
        assert_eq!(second.status, ConnectionStatus::Connected);
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(ctx.setup().await.ask_timeout(), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_while_leader_pushes_setup_to_owner_endpoint() {
        let node = node("node-1");
        let ctx = context(&node);
        ctx.become_leader().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        ctx.owner_endpoint().await.unwrap().stop();
        let recorder = SetupRecorder::default();
        let timeouts = Arc::clone(&recorder.timeouts);
        node.resources
            .system
            .spawn(&owner_endpoint_name("dev-1", "node-1"), recorder)
            .unwrap();

        let mut config = DeviceConfig::new("dev-1", "192.0.2.1", 830);
        config.actor_response_wait_time_secs = Some(9);
        ctx.refresh(config).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*timeouts.lock(), vec![Duration::from_secs(9)]);
        let record = node.resources.store.get_oper("dev-1").unwrap().unwrap();
        assert_eq!(record.status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_while_follower_updates_node_manager() {
        let node = node("node-1");
        let ctx = context(&node);
        let record = OperationalStatusRecord {
            status: ConnectionStatus::Connected,
            leader_address: Some("node-2".to_string()),
            ..OperationalStatusRecord::connecting(&ctx.setup().await.identity())
        };
        node.resources.store.put_oper(&record).unwrap();
        ctx.become_follower().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut config = DeviceConfig::new("dev-1", "192.0.2.1", 830);
        config.actor_response_wait_time_secs = Some(9);
        ctx.refresh(config).await;

        let manager = ctx.node_manager().await.unwrap();
        assert_eq!(manager.setup().ask_timeout(), Duration::from_secs(9));
        assert_eq!(ctx.role().await, DeviceRole::Follower);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_owner_shutdown_is_fatal() {
        let node = node("node-1");
        let ctx = context(&node);
        ctx.become_leader().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        node.resources.store.close();
        let result = ctx.close().await;

        assert!(matches!(
            result,
            Err(TopologyError::Shutdown { ref device, .. }) if device == "dev-1"
        ));
        assert_eq!(ctx.role().await, DeviceRole::Closed);
        assert!(!node.mounts.is_mounted("dev-1"));
        assert!(ctx.owner_endpoint().await.is_none());
        // the record could not be withdrawn
        assert!(node.resources.store.get_oper("dev-1").unwrap().is_some());
    }

    #[tokio::test]
    async fn refresh_while_unstarted_only_stores_setup() {
        let node = node("node-1");
        let ctx = context(&node);
        let mut config = DeviceConfig::new("dev-1", "192.0.2.9", 830);
        config.keepalive_delay_secs = Some(10);
        ctx.refresh(config).await;

        assert_eq!(ctx.role().await, DeviceRole::Unstarted);
        assert_eq!(ctx.setup().await.config.host, "192.0.2.9");
        assert!(node.resources.store.get_oper("dev-1").unwrap().is_none());
    }
}
