//! One device context per configured device.
//!
//! The manager follows the configuration records, registers a context with
//! the election provider for every new device and tears it down when the
//! record goes away.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use devgrid_state::{ChangeKind, DeviceConfig, RecordChange};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::DeviceContext;
use crate::election::{ElectionProvider, ElectionRegistration, SingletonService};
use crate::error::{TopologyError, TopologyResult};
use crate::setup::{DeviceSetup, NodeResources, TopologySettings};

/// Election registration attempts before a device is left unmanaged.
pub const REGISTRATION_ATTEMPTS: u32 = 3;

pub struct TopologyManager {
    settings: TopologySettings,
    resources: NodeResources,
    election: Arc<dyn ElectionProvider>,
    contexts: DashMap<String, Arc<DeviceContext>>,
    registrations: DashMap<String, Box<dyn ElectionRegistration>>,
    shutdown_tx: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl TopologyManager {
    pub fn new(
        settings: TopologySettings,
        resources: NodeResources,
        election: Arc<dyn ElectionProvider>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            resources,
            election,
            contexts: DashMap::new(),
            registrations: DashMap::new(),
            shutdown_tx,
            listener: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &TopologySettings {
        &self.settings
    }

    pub fn resources(&self) -> &NodeResources {
        &self.resources
    }

    /// Initialize the topology, manage the devices already configured and
    /// follow configuration changes until [`close`](Self::close).
    pub async fn start(self: &Arc<Self>) -> TopologyResult<()> {
        if *self.shutdown_tx.borrow() {
            return Err(TopologyError::Closed(self.settings.topology_id.clone()));
        }
        let store = &self.resources.store;
        if let Err(e) = store.ensure_topology(&self.settings.topology_id) {
            error!(topology = %self.settings.topology_id, error = %e, "failed to initialize topology");
        }

        let mut changes = store.subscribe_config();
        for config in store.list_configs()? {
            self.on_config_changed(RecordChange {
                key: config.name.clone(),
                kind: ChangeKind::Write,
                before: None,
                after: Some(config),
            })
            .await;
        }

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Ok(change) => manager.on_config_changed(change).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "configuration changes lagged, resynchronizing");
                            manager.resync().await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => {
                        debug!("configuration listener shutting down");
                        break;
                    }
                }
            }
        });
        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }

        info!(
            topology = %self.settings.topology_id,
            node = %self.resources.node_address(),
            devices = self.contexts.len(),
            "topology manager started"
        );
        Ok(())
    }

    /// Apply one configuration change.
    pub async fn on_config_changed(&self, change: RecordChange<DeviceConfig>) {
        match change.kind {
            ChangeKind::Write | ChangeKind::SubtreeModified => {
                let Some(config) = change.after else {
                    warn!(device = %change.key, "configuration change without a record");
                    return;
                };
                let existing = self.contexts.get(&change.key).map(|c| Arc::clone(c.value()));
                match existing {
                    Some(context) => context.refresh(config).await,
                    None => {
                        if let Err(e) = self.start_device(config).await {
                            error!(device = %change.key, error = %e, "device left unmanaged");
                        }
                    }
                }
            }
            ChangeKind::Delete => {
                if let Err(e) = self.stop_device(&change.key).await {
                    error!(device = %change.key, error = %e, "failed to stop device");
                }
            }
        }
    }

    /// Create a context for `config` and register it for election.
    ///
    /// Registration is attempted up to [`REGISTRATION_ATTEMPTS`] times; on
    /// exhaustion the new context is closed and never becomes managed.
    pub async fn start_device(&self, config: DeviceConfig) -> TopologyResult<()> {
        let setup = DeviceSetup::new(&self.settings, config);
        let name = setup.device_name().to_string();
        let context = DeviceContext::new(setup, self.resources.clone());

        let mut attempt = 1;
        let failure = loop {
            let service = Arc::clone(&context) as Arc<dyn SingletonService>;
            match self.election.register(service) {
                Ok(registration) => {
                    self.registrations.insert(name.clone(), registration);
                    self.contexts.insert(name.clone(), context);
                    info!(device = %name, attempt, "device registered for election");
                    return Ok(());
                }
                Err(e) if attempt < REGISTRATION_ATTEMPTS => {
                    warn!(device = %name, attempt, error = %e, "election registration failed, retrying");
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        error!(device = %name, attempts = attempt, error = %failure, "election registration failed");
        if let Err(e) = context.close().await {
            error!(device = %name, error = %e, "failed to close unregistered device context");
        }
        Err(TopologyError::Registration {
            device: name,
            source: failure,
        })
    }

    /// Leave the election for `name` and close its context.
    pub async fn stop_device(&self, name: &str) -> TopologyResult<()> {
        if let Some((_, registration)) = self.registrations.remove(name) {
            if let Err(e) = registration.close() {
                error!(device = %name, error = %e, "failed to leave election");
            }
        }
        match self.contexts.remove(name) {
            Some((_, context)) => {
                info!(device = %name, "stopping device");
                context.close().await
            }
            None => {
                debug!(device = %name, "delete for unmanaged device");
                Ok(())
            }
        }
    }

    /// Re-read all configuration records after missing changes.
    async fn resync(&self) {
        let configs = match self.resources.store.list_configs() {
            Ok(configs) => configs,
            Err(e) => {
                error!(error = %e, "failed to list configuration records");
                return;
            }
        };
        let present: HashSet<String> = configs.iter().map(|c| c.name.clone()).collect();
        for name in self.managed() {
            if !present.contains(&name) {
                if let Err(e) = self.stop_device(&name).await {
                    error!(device = %name, error = %e, "failed to stop device");
                }
            }
        }
        for config in configs {
            self.on_config_changed(RecordChange {
                key: config.name.clone(),
                kind: ChangeKind::Write,
                before: None,
                after: Some(config),
            })
            .await;
        }
    }

    /// Stop following configuration and release every device.
    ///
    /// Per-device failures are logged and do not stop the sweep.
    pub async fn close(&self) {
        self.shutdown_tx.send_replace(true);
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }

        let names: Vec<String> = self.registrations.iter().map(|r| r.key().clone()).collect();
        for name in names {
            if let Some((_, registration)) = self.registrations.remove(&name) {
                if let Err(e) = registration.close() {
                    error!(device = %name, error = %e, "failed to leave election");
                }
            }
        }

        let names: Vec<String> = self.contexts.iter().map(|c| c.key().clone()).collect();
        for name in names {
            if let Some((_, context)) = self.contexts.remove(&name) {
                if let Err(e) = context.close().await {
                    error!(device = %name, error = %e, "failed to close device context");
                }
            }
        }
        info!(topology = %self.settings.topology_id, "topology manager closed");
    }

    pub fn context(&self, name: &str) -> Option<Arc<DeviceContext>> {
        self.contexts.get(name).map(|c| Arc::clone(c.value()))
    }

    /// Names of managed devices, sorted.
    pub fn managed(&self) -> Vec<String> {
        let mut names: Vec<String> = self.contexts.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    pub fn contexts(&self) -> Vec<Arc<DeviceContext>> {
        self.contexts.iter().map(|c| Arc::clone(c.value())).collect()
    }

    pub fn is_managed(&self, name: &str) -> bool {
        self.contexts.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::connector::DeviceConnector;
    use crate::context::DeviceRole;
    use crate::election::InProcessElection;
    use crate::mount::{LocalMountRegistry, MountPointService};
    use crate::simulated::SimulatedConnector;
    use devgrid_endpoint::EndpointSystem;
    use devgrid_state::StateStore;

    fn manager(election: &InProcessElection) -> (Arc<TopologyManager>, Arc<LocalMountRegistry>) {
        let mounts = Arc::new(LocalMountRegistry::new());
        let resources = NodeResources {
            system: EndpointSystem::new(election.local_address()),
            store: StateStore::open_in_memory().unwrap(),
            mounts: Arc::clone(&mounts) as Arc<dyn MountPointService>,
            connector: Arc::new(SimulatedConnector::new()) as Arc<dyn DeviceConnector>,
        };
        let manager = TopologyManager::new(
            TopologySettings::default(),
            resources,
            Arc::new(election.clone()) as Arc<dyn ElectionProvider>,
        );
        (manager, mounts)
    }

    #[tokio::test(start_paused = true)]
    async fn configured_device_gets_a_leader() {
        let election = InProcessElection::new("node-1");
        let (manager, mounts) = manager(&election);
        manager.start().await.unwrap();

        let store = &manager.resources().store;
        store.put_config(&DeviceConfig::new("dev-1", "192.0.2.1", 830)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(manager.is_managed("dev-1"));
        let context = manager.context("dev-1").unwrap();
        assert_eq!(context.role().await, DeviceRole::Leader);
        assert!(mounts.is_mounted("dev-1"));
        assert!(store.get_topology("topology-netconf").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn existing_records_are_replayed_on_start() {
        let election = InProcessElection::new("node-1");
        let (manager, _) = manager(&election);
        let store = &manager.resources().store;
        store.put_config(&DeviceConfig::new("dev-1", "192.0.2.1", 830)).unwrap();
        store.put_config(&DeviceConfig::new("dev-2", "192.0.2.2", 830)).unwrap();

        manager.start().await.unwrap();
        assert_eq!(manager.managed(), vec!["dev-1".to_string(), "dev-2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn registration_gives_up_after_three_failures() {
        let election = InProcessElection::new("node-1");
        let (manager, mounts) = manager(&election);
        manager.start().await.unwrap();
        election.set_fail_registrations(3);

        let result = manager
            .start_device(DeviceConfig::new("dev-2", "192.0.2.2", 830))
            .await;
        assert!(matches!(result, Err(TopologyError::Registration { .. })));
        assert!(!manager.is_managed("dev-2"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!mounts.is_mounted("dev-2"));
        assert!(election.leader_of("topology-netconf/dev-2").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn registration_recovers_within_attempt_budget() {
        let election = InProcessElection::new("node-1");
        let (manager, _) = manager(&election);
        election.set_fail_registrations(2);

        manager
            .start_device(DeviceConfig::new("dev-1", "192.0.2.1", 830))
            .await
            .unwrap();
        assert!(manager.is_managed("dev-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_closes_context() {
        let election = InProcessElection::new("node-1");
        let (manager, mounts) = manager(&election);
        manager.start().await.unwrap();
        let store = &manager.resources().store;
        store.put_config(&DeviceConfig::new("dev-1", "192.0.2.1", 830)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let context = manager.context("dev-1").unwrap();

        store.delete_config("dev-1").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!manager.is_managed("dev-1"));
        assert_eq!(context.role().await, DeviceRole::Closed);
        assert!(!mounts.is_mounted("dev-1"));
        assert!(store.get_oper("dev-1").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn subtree_change_refreshes_existing_context() {
        let election = InProcessElection::new("node-1");
        let (manager, _) = manager(&election);
        manager.start().await.unwrap();
        let store = &manager.resources().store;
        store.put_config(&DeviceConfig::new("dev-1", "192.0.2.1", 830)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let context = manager.context("dev-1").unwrap();

        let mut updated = DeviceConfig::new("dev-1", "192.0.2.1", 830);
        updated.actor_response_wait_time_secs = Some(12);
        store.merge_config(&updated).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(Arc::ptr_eq(&context, &manager.context("dev-1").unwrap()));
        assert_eq!(context.setup().await.ask_timeout(), Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn close_sweeps_every_device() {
        let election = InProcessElection::new("node-1");
        let (manager, mounts) = manager(&election);
        manager.start().await.unwrap();
        let store = &manager.resources().store;
        store.put_config(&DeviceConfig::new("dev-1", "192.0.2.1", 830)).unwrap();
        store.put_config(&DeviceConfig::new("dev-2", "192.0.2.2", 830)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        manager.close().await;
        assert!(manager.managed().is_empty());
        assert!(mounts.mounted().is_empty());
        assert!(manager.start().await.is_err());

        // changes after close are ignored
        store.put_config(&DeviceConfig::new("dev-3", "192.0.2.3", 830)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!manager.is_managed("dev-3"));
    }
}
