//! Cluster integration tests.
//!
//! Multi-node scenarios run in one process: every node gets its own mount
//! registry and topology manager, while the endpoint fabric, the election
//! and the state store are shared, as they would be across a real cluster.
//! Time is paused so ask deadlines advance deterministically.

use std::sync::Arc;
use std::time::Duration;

use devgrid_endpoint::EndpointSystem;
use devgrid_state::{ConnectionStatus, DeviceConfig, OperationalStatusRecord, StateStore};
use devgrid_topology::payload::QName;
use devgrid_topology::services::RpcService;
use devgrid_topology::*;

struct Node {
    manager: Arc<TopologyManager>,
    mounts: Arc<LocalMountRegistry>,
}

struct Cluster {
    store: StateStore,
    fabric: DeviceEndpointSystem,
    election: InProcessElection,
    connector: Arc<SimulatedConnector>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            store: StateStore::open_in_memory().unwrap(),
            fabric: EndpointSystem::new("node-1"),
            election: InProcessElection::new("node-1"),
            connector: Arc::new(SimulatedConnector::new()),
        }
    }

    fn resources(&self, address: &str) -> (NodeResources, Arc<LocalMountRegistry>) {
        let mounts = Arc::new(LocalMountRegistry::new());
        let resources = NodeResources {
            system: self.fabric.for_node(address),
            store: self.store.clone(),
            mounts: Arc::clone(&mounts) as Arc<dyn MountPointService>,
            connector: Arc::clone(&self.connector) as Arc<dyn DeviceConnector>,
        };
        (resources, mounts)
    }

    async fn start_node(&self, address: &str) -> Node {
        let (resources, mounts) = self.resources(address);
        let election = Arc::new(self.election.for_node(address)) as Arc<dyn ElectionProvider>;
        let manager = TopologyManager::new(TopologySettings::default(), resources, election);
        manager.start().await.unwrap();
        Node { manager, mounts }
    }

    /// A bare device context on `address`, driven by the test instead of an election.
    fn context(&self, address: &str) -> (Arc<DeviceContext>, Arc<LocalMountRegistry>) {
        let (resources, mounts) = self.resources(address);
        let setup = DeviceSetup::new(&TopologySettings::default(), dev1());
        (DeviceContext::new(setup, resources), mounts)
    }

    fn oper(&self, device: &str) -> Option<OperationalStatusRecord> {
        self.store.get_oper(device).unwrap()
    }
}

fn dev1() -> DeviceConfig {
    DeviceConfig::new("dev-1", "192.0.2.1", 830)
}

fn connected_to(leader: &str) -> OperationalStatusRecord {
    OperationalStatusRecord {
        status: ConnectionStatus::Connected,
        leader_address: Some(leader.to_string()),
        ..OperationalStatusRecord::connecting(&dev1().identity())
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn single_node_leader_publishes_connected() {
    let cluster = Cluster::new();
    let node = cluster.start_node("node-1").await;

    cluster.store.put_config(&dev1()).unwrap();
    settle().await;

    let context = node.manager.context("dev-1").unwrap();
    assert_eq!(context.role().await, DeviceRole::Leader);

    let record = cluster.oper("dev-1").unwrap();
    assert_eq!(record.status, ConnectionStatus::Connected);
    assert_eq!(record.leader_address.as_deref(), Some("node-1"));
    assert!(record.session_id.is_some());
    assert!(!record.available_capabilities.is_empty());

    let mount = node.mounts.lookup("dev-1").unwrap();
    assert_eq!(mount.role, MountRole::Owner);
    assert!(
        cluster
            .store
            .get_topology("topology-netconf")
            .unwrap()
            .is_some()
    );
}

#[tokio::test(start_paused = true)]
async fn follower_mounts_proxies_to_the_owner() {
    let cluster = Cluster::new();
    cluster.store.put_config(&dev1()).unwrap();
    let leader = cluster.start_node("node-1").await;
    let follower = cluster.start_node("node-2").await;
    settle().await;

    assert_eq!(
        follower.manager.context("dev-1").unwrap().role().await,
        DeviceRole::Follower
    );
    let mount = follower.mounts.lookup("dev-1").unwrap();
    assert_eq!(mount.role, MountRole::Follower);
    assert_eq!(leader.mounts.lookup("dev-1").unwrap().role, MountRole::Owner);

    let device = cluster.connector.device("dev-1");
    device.set_rpc_reply("reset", CannedReply::Reply(None));
    let result = mount
        .services
        .rpc
        .invoke_rpc(&QName::new("dev-ops", "reset"), None)
        .await
        .unwrap();
    assert!(result.is_none());
    assert_eq!(device.rpc_invocations(), 1);

    assert!(matches!(
        mount.services.data_broker.create_transaction_chain(),
        Err(ServiceError::Unsupported(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn follower_takes_over_when_leader_leaves() {
    let cluster = Cluster::new();
    cluster.store.put_config(&dev1()).unwrap();
    let leader = cluster.start_node("node-1").await;
    let follower = cluster.start_node("node-2").await;
    settle().await;
    assert_eq!(follower.mounts.lookup("dev-1").unwrap().role, MountRole::Follower);

    leader.manager.close().await;
    settle().await;

    assert!(!leader.mounts.is_mounted("dev-1"));
    assert_eq!(
        follower.manager.context("dev-1").unwrap().role().await,
        DeviceRole::Leader
    );
    assert_eq!(follower.mounts.lookup("dev-1").unwrap().role, MountRole::Owner);
    let record = cluster.oper("dev-1").unwrap();
    assert_eq!(record.status, ConnectionStatus::Connected);
    assert_eq!(record.leader_address.as_deref(), Some("node-2"));
}

#[tokio::test(start_paused = true)]
async fn follower_waits_for_a_late_owner() {
    let cluster = Cluster::new();
    cluster.store.put_oper(&connected_to("node-2")).unwrap();
    let (follower, follower_mounts) = cluster.context("node-1");
    follower.become_follower().await;

    // asks go out every 5s into nothing until node-2 takes ownership
    tokio::time::sleep(Duration::from_secs(47)).await;
    let (owner, _) = cluster.context("node-2");
    owner.become_leader().await;
    tokio::time::sleep(Duration::from_secs(13)).await;

    let stats = follower.node_manager().await.unwrap().stats();
    // attempt 10 was in flight when the owner rewrote the record
    assert_eq!(stats.asks_sent, 11);
    assert_eq!(stats.timeouts, 9);
    assert_eq!(stats.warnings_logged, 5);
    assert_eq!(stats.stale_discarded, 1);
    assert_eq!(stats.mounts_authorized, 1);
    assert_eq!(follower_mounts.lookup("dev-1").unwrap().role, MountRole::Follower);
}

#[tokio::test(start_paused = true)]
async fn leader_switch_restarts_the_retry_chain() {
    let cluster = Cluster::new();
    cluster.store.put_oper(&connected_to("node-2")).unwrap();
    let (follower, follower_mounts) = cluster.context("node-1");
    follower.become_follower().await;

    // attempt 7 goes out at t=30s and is still pending at t=32s
    tokio::time::sleep(Duration::from_secs(32)).await;
    let manager = follower.node_manager().await.unwrap();
    assert_eq!(manager.stats().asks_sent, 7);

    let (owner, _) = cluster.context("node-3");
    owner.become_leader().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let stats = manager.stats();
    assert_eq!(stats.asks_sent, 8);
    assert_eq!(stats.stale_discarded, 1);
    assert_eq!(stats.mounts_authorized, 1);
    assert_eq!(stats.warnings_logged, 5);
    assert!(follower_mounts.is_mounted("dev-1"));
    assert_eq!(
        cluster.oper("dev-1").unwrap().leader_address.as_deref(),
        Some("node-3")
    );
}

#[tokio::test(start_paused = true)]
async fn deleted_configuration_closes_the_context() {
    let cluster = Cluster::new();
    let node = cluster.start_node("node-1").await;
    cluster.store.put_config(&dev1()).unwrap();
    settle().await;
    let context = node.manager.context("dev-1").unwrap();
    assert!(cluster.oper("dev-1").is_some());

    cluster.store.delete_config("dev-1").unwrap();
    settle().await;

    assert!(!node.manager.is_managed("dev-1"));
    assert_eq!(context.role().await, DeviceRole::Closed);
    assert!(!node.mounts.is_mounted("dev-1"));
    assert!(cluster.oper("dev-1").is_none());
    assert!(!cluster.connector.is_connected("dev-1"));
}

#[tokio::test(start_paused = true)]
async fn stopping_a_leader_reports_a_clean_close() {
    let cluster = Cluster::new();
    let node = cluster.start_node("node-1").await;
    cluster.store.put_config(&dev1()).unwrap();
    settle().await;

    node.manager.stop_device("dev-1").await.unwrap();
    assert!(!node.manager.is_managed("dev-1"));
    // a second stop finds nothing to close
    node.manager.stop_device("dev-1").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn exhausted_registration_never_mounts() {
    let cluster = Cluster::new();
    let node = cluster.start_node("node-1").await;
    cluster.store.put_config(&dev1()).unwrap();
    settle().await;

    cluster.election.set_fail_registrations(REGISTRATION_ATTEMPTS as usize);
    cluster
        .store
        .put_config(&DeviceConfig::new("dev-2", "192.0.2.2", 830))
        .unwrap();
    settle().await;

    assert!(node.manager.context("dev-2").is_none());
    assert!(!node.mounts.is_mounted("dev-2"));
    assert!(cluster.oper("dev-2").is_none());
    assert_eq!(node.manager.managed(), vec!["dev-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn unreachable_device_is_reported_by_its_leader() {
    let cluster = Cluster::new();
    cluster.connector.set_unreachable("dev-1", "connection refused");
    let node = cluster.start_node("node-1").await;
    cluster.store.put_config(&dev1()).unwrap();
    settle().await;

    let record = cluster.oper("dev-1").unwrap();
    assert_eq!(record.status, ConnectionStatus::UnableToConnect);
    assert_eq!(record.connected_message.as_deref(), Some("connection refused"));
    assert!(!node.mounts.is_mounted("dev-1"));
}
