//! Follower-side mount negotiation for one device.
//!
//! The manager watches the device's operational record. Whenever it names a
//! leader on another node, the manager asks that leader's owner endpoint to
//! authorize a mount on the local follower endpoint, retrying timed-out asks
//! with no delay. Every observation bumps a generation counter; an ask that
//! completes under an older generation is dropped without a trace.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use devgrid_endpoint::AskError;
use devgrid_state::{DeviceIdentity, OperationalStatusRecord};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::endpoints::NodeEndpoint;
use crate::facade::FollowerFacade;
use crate::messages::{DeviceEndpointRef, Message};
use crate::setup::{DeviceSetup, NodeResources, follower_endpoint_name, owner_endpoint_path};

/// Whether a timed-out attempt is worth a warning.
///
/// Attempts 1 to 5 always warn; after that only every tenth attempt does.
pub fn should_log_retry(attempt: u64) -> bool {
    attempt <= 5 || attempt % 10 == 0
}

/// Counters describing the mount negotiation so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub asks_sent: u64,
    pub timeouts: u64,
    pub warnings_logged: u64,
    pub stale_discarded: u64,
    pub mounts_authorized: u64,
}

#[derive(Default)]
struct RetryCounters {
    asks_sent: AtomicU64,
    timeouts: AtomicU64,
    warnings_logged: AtomicU64,
    stale_discarded: AtomicU64,
    mounts_authorized: AtomicU64,
}

impl RetryCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RetryStats {
        RetryStats {
            asks_sent: self.asks_sent.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            warnings_logged: self.warnings_logged.load(Ordering::Relaxed),
            stale_discarded: self.stale_discarded.load(Ordering::Relaxed),
            mounts_authorized: self.mounts_authorized.load(Ordering::Relaxed),
        }
    }
}

struct ManagerState {
    setup: DeviceSetup,
    follower: Option<DeviceEndpointRef>,
    generation: u64,
    closed: bool,
    listener: Option<JoinHandle<()>>,
}

pub struct NodeManager {
    identity: DeviceIdentity,
    resources: NodeResources,
    facade: Arc<FollowerFacade>,
    state: Mutex<ManagerState>,
    counters: RetryCounters,
}

impl NodeManager {
    pub fn new(setup: DeviceSetup, resources: NodeResources) -> Arc<Self> {
        let identity = setup.identity();
        let facade = Arc::new(FollowerFacade::new(identity.clone(), Arc::clone(&resources.mounts)));
        Arc::new(Self {
            identity,
            resources,
            facade,
            state: Mutex::new(ManagerState {
                setup,
                follower: None,
                generation: 0,
                closed: false,
                listener: None,
            }),
            counters: RetryCounters::default(),
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn stats(&self) -> RetryStats {
        self.counters.snapshot()
    }

    pub fn setup(&self) -> DeviceSetup {
        self.state.lock().setup.clone()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether this node currently publishes a proxy mount for the device.
    pub fn is_mounted(&self) -> bool {
        self.facade.is_mounted()
    }

    /// Start following the device's operational record.
    ///
    /// The current record, if any, is processed first.
    pub fn register_listener(self: &Arc<Self>) {
        let mut changes = self.resources.store.subscribe_oper();
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.replay_current();
            loop {
                match changes.recv().await {
                    Ok(change) if change.key == manager.identity.name => {
                        manager.on_operational_status_changed(change.after.as_ref());
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(device = %manager.identity, skipped, "operational changes lagged, re-reading record");
                        manager.replay_current();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(device = %manager.identity, "operational listener finished");
        });

        let mut state = self.state.lock();
        if state.closed {
            handle.abort();
            return;
        }
        if let Some(previous) = state.listener.replace(handle) {
            previous.abort();
        }
    }

    fn replay_current(self: &Arc<Self>) {
        match self.resources.store.get_oper(&self.identity.name) {
            Ok(Some(record)) => self.on_operational_status_changed(Some(&record)),
            Ok(None) => debug!(device = %self.identity, "no operational record yet"),
            Err(e) => error!(device = %self.identity, error = %e, "failed to read operational record"),
        }
    }

    /// React to a new (or deleted) operational record.
    pub fn on_operational_status_changed(self: &Arc<Self>, record: Option<&OperationalStatusRecord>) {
        let own_address = self.resources.node_address();
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.generation += 1;
        let generation = state.generation;

        let leader = record
            .filter(|r| r.is_connected())
            .and_then(|r| r.leader_address.as_deref())
            .filter(|leader| *leader != own_address);
        let Some(leader) = leader else {
            debug!(device = %self.identity, generation, "device not connected to another node");
            if let Some(follower) = state.follower.as_ref() {
                follower.tell(Message::UnregisterSlaveMountPoint);
            }
            return;
        };

        let ask_timeout = state.setup.ask_timeout();
        let follower = match state.follower.clone() {
            Some(follower) => {
                follower.tell(Message::RefreshSlaveActor {
                    setup: state.setup.clone(),
                    ask_timeout,
                });
                follower
            }
            None => {
                let name = follower_endpoint_name(&self.identity.name);
                let endpoint = NodeEndpoint::follower(state.setup.clone(), Arc::clone(&self.facade));
                match self.resources.system.spawn(&name, endpoint) {
                    Ok(follower) => {
                        state.follower = Some(follower.clone());
                        follower
                    }
                    Err(e) => {
                        error!(device = %self.identity, error = %e, "failed to start follower endpoint");
                        return;
                    }
                }
            }
        };

        let owner = match owner_endpoint_path(&self.identity.name, leader) {
            Ok(path) => self.resources.system.resolve(path),
            Err(e) => {
                error!(device = %self.identity, %leader, error = %e, "invalid owner endpoint path");
                return;
            }
        };
        drop(state);

        info!(device = %self.identity, owner = %owner.path(), generation, "requesting mount from owner");
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager
                .send_ask_with_retries(owner, follower, 1, generation, ask_timeout)
                .await;
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.state.lock();
        !state.closed && state.generation == generation
    }

    async fn send_ask_with_retries(
        &self,
        owner: DeviceEndpointRef,
        follower: DeviceEndpointRef,
        mut attempt: u64,
        generation: u64,
        ask_timeout: Duration,
    ) {
        loop {
            RetryCounters::bump(&self.counters.asks_sent);
            let request = Message::AskForMasterMountPoint {
                follower: follower.clone(),
            };
            let result = owner.ask(request, ask_timeout).await;

            if !self.is_current(generation) {
                RetryCounters::bump(&self.counters.stale_discarded);
                return;
            }

            match result {
                Ok(Message::Success(_)) => {
                    RetryCounters::bump(&self.counters.mounts_authorized);
                    info!(device = %self.identity, owner = %owner.path(), attempt, "mount point authorized by owner");
                    return;
                }
                Ok(Message::Failure(e)) => {
                    error!(device = %self.identity, owner = %owner.path(), attempt, error = %e, "owner refused mount point");
                    return;
                }
                Ok(other) => {
                    error!(device = %self.identity, attempt, reply = other.kind(), "unexpected reply to mount request");
                    return;
                }
                Err(AskError::Timeout { after, .. }) => {
                    RetryCounters::bump(&self.counters.timeouts);
                    if should_log_retry(attempt) {
                        RetryCounters::bump(&self.counters.warnings_logged);
                        warn!(
                            device = %self.identity,
                            owner = %owner.path(),
                            attempt,
                            ?after,
                            "owner did not answer mount request, retrying"
                        );
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Apply a new device configuration without changing role.
    pub fn refresh_device(&self, setup: DeviceSetup) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if let Some(follower) = state.follower.as_ref() {
            follower.tell(Message::RefreshSlaveActor {
                setup: setup.clone(),
                ask_timeout: setup.ask_timeout(),
            });
        }
        state.setup = setup;
    }

    pub fn close(&self) {
        let (follower, listener) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.generation += 1;
            (state.follower.take(), state.listener.take())
        };

        if let Some(listener) = listener {
            listener.abort();
        }
        self.facade.unregister_slave_mount_point();
        if let Some(follower) = follower {
            follower.stop();
        }
        debug!(device = %self.identity, "node manager closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::DeviceConnector;
    use crate::endpoints::recording::SetupRecorder;
    use crate::mount::{LocalMountRegistry, MountPointService};
    use crate::setup::{TopologySettings, owner_endpoint_name};
    use crate::simulated::{SimulatedConnector, SimulatedDevice};
    use devgrid_endpoint::EndpointSystem;
    use devgrid_state::{ConnectionStatus, DeviceConfig, StateStore};

    struct Fixture {
        resources: NodeResources,
        mounts: Arc<LocalMountRegistry>,
        setup: DeviceSetup,
    }

    fn fixture() -> Fixture {
        let mounts = Arc::new(LocalMountRegistry::new());
        let resources = NodeResources {
            system: EndpointSystem::new("node-1"),
            store: StateStore::open_in_memory().unwrap(),
            mounts: Arc::clone(&mounts) as Arc<dyn MountPointService>,
            connector: Arc::new(SimulatedConnector::new()) as Arc<dyn DeviceConnector>,
        };
        let setup = DeviceSetup::new(
            &TopologySettings::default(),
            DeviceConfig::new("dev-1", "192.0.2.1", 830),
        );
        Fixture {
            resources,
            mounts,
            setup,
        }
    }

    fn connected_to(setup: &DeviceSetup, leader: &str) -> OperationalStatusRecord {
        OperationalStatusRecord {
            status: ConnectionStatus::Connected,
            leader_address: Some(leader.to_string()),
            ..OperationalStatusRecord::connecting(&setup.identity())
        }
    }

    /// Spawn an initialized owner endpoint for dev-1 on `node`.
    fn spawn_owner(fixture: &Fixture, node: &str) -> DeviceEndpointRef {
        let system = fixture.resources.system.for_node(node);
        let owner = system
            .spawn(
                &owner_endpoint_name("dev-1", node),
                NodeEndpoint::owner(fixture.setup.clone()),
            )
            .unwrap();
        let device = SimulatedDevice::new("dev-1");
        owner.tell(Message::CreateInitialMasterActorData {
            services: device.services(),
            source_ids: device.source_ids(),
        });
        owner
    }

    #[test]
    fn retry_warnings_are_thresholded() {
        let warned: Vec<u64> = (1..=40).filter(|a| should_log_retry(*a)).collect();
        assert_eq!(warned, vec![1, 2, 3, 4, 5, 10, 20, 30, 40]);
    }

    #[tokio::test(start_paused = true)]
    async fn mount_installed_after_owner_appears() {
        let fixture = fixture();
        fixture
            .resources
            .store
            .put_oper(&connected_to(&fixture.setup, "node-2"))
            .unwrap();

        let manager = NodeManager::new(fixture.setup.clone(), fixture.resources.clone());
        manager.register_listener();

        tokio::time::sleep(Duration::from_secs(47)).await;
        let _owner = spawn_owner(&fixture, "node-2");
        tokio::time::sleep(Duration::from_secs(13)).await;

        let stats = manager.stats();
        assert_eq!(stats.asks_sent, 11);
        assert_eq!(stats.timeouts, 10);
        assert_eq!(stats.warnings_logged, 6);
        assert_eq!(stats.mounts_authorized, 1);
        assert!(manager.is_mounted());
        assert!(fixture.mounts.is_mounted("dev-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn leader_change_discards_stale_chain() {
        let fixture = fixture();
        let _node3 = spawn_owner(&fixture, "node-3");
        fixture
            .resources
            .store
            .put_oper(&connected_to(&fixture.setup, "node-2"))
            .unwrap();

        let manager = NodeManager::new(fixture.setup.clone(), fixture.resources.clone());
        manager.register_listener();

        // attempt 7 goes out at t=30s
        tokio::time::sleep(Duration::from_secs(32)).await;
        assert_eq!(manager.stats().asks_sent, 7);
        fixture
            .resources
            .store
            .put_oper(&connected_to(&fixture.setup, "node-3"))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let stats = manager.stats();
        assert_eq!(stats.stale_discarded, 1);
        assert_eq!(stats.mounts_authorized, 1);
        assert_eq!(stats.asks_sent, 8);
        assert_eq!(stats.warnings_logged, 5);
        assert!(fixture.mounts.is_mounted("dev-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn own_leadership_withdraws_follower_mount() {
        let fixture = fixture();
        let _owner = spawn_owner(&fixture, "node-2");
        let manager = NodeManager::new(fixture.setup.clone(), fixture.resources.clone());
        manager.register_listener();

        fixture
            .resources
            .store
            .put_oper(&connected_to(&fixture.setup, "node-2"))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(manager.is_mounted());

        fixture
            .resources
            .store
            .put_oper(&connected_to(&fixture.setup, "node-1"))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!manager.is_mounted());
        assert!(!fixture.mounts.is_mounted("dev-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn owner_refusal_stops_retrying() {
        let fixture = fixture();
        // spawned but never initialized, so it answers NotOwner
        let system = fixture.resources.system.for_node("node-2");
        let _owner = system
            .spawn(
                &owner_endpoint_name("dev-1", "node-2"),
                NodeEndpoint::owner(fixture.setup.clone()),
            )
            .unwrap();

        let manager = NodeManager::new(fixture.setup.clone(), fixture.resources.clone());
        manager.on_operational_status_changed(Some(&connected_to(&fixture.setup, "node-2")));
        tokio::time::sleep(Duration::from_secs(30)).await;

        let stats = manager.stats();
        assert_eq!(stats.asks_sent, 1);
        assert_eq!(stats.mounts_authorized, 0);
        assert!(!manager.is_mounted());
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_discards_inflight() {
        let fixture = fixture();
        let manager = NodeManager::new(fixture.setup.clone(), fixture.resources.clone());
        manager.on_operational_status_changed(Some(&connected_to(&fixture.setup, "node-2")));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let before = manager.generation();
        manager.close();
        manager.close();
        assert!(manager.is_closed());
        assert_eq!(manager.generation(), before + 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let stats = manager.stats();
        assert_eq!(stats.asks_sent, 1);
        assert_eq!(stats.stale_discarded, 1);

        manager.on_operational_status_changed(Some(&connected_to(&fixture.setup, "node-2")));
        assert_eq!(manager.generation(), before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_reaches_follower_endpoint() {
        let fixture = fixture();
        let manager = NodeManager::new(fixture.setup.clone(), fixture.resources.clone());
        manager.on_operational_status_changed(Some(&connected_to(&fixture.setup, "node-2")));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let follower = manager.state.lock().follower.clone().unwrap();
        follower.stop();
        let recorder = SetupRecorder::default();
        let timeouts = Arc::clone(&recorder.timeouts);
        fixture
            .resources
            .system
            .spawn(&follower_endpoint_name("dev-1"), recorder)
            .unwrap();

        let mut config = DeviceConfig::new("dev-1", "192.0.2.1", 830);
        config.actor_response_wait_time_secs = Some(9);
        manager.refresh_device(fixture.setup.with_config(config));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(manager.setup().ask_timeout(), Duration::from_secs(9));
        assert_eq!(*timeouts.lock(), vec![Duration::from_secs(9)]);

        // later owner changes carry the refreshed setup
        manager.on_operational_status_changed(Some(&connected_to(&fixture.setup, "node-3")));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            *timeouts.lock(),
            vec![Duration::from_secs(9), Duration::from_secs(9)]
        );
    }
}
