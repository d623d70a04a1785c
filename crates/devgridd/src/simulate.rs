//! Simulate mode: several topology nodes in one process.
//!
//! The nodes share one endpoint fabric, one election and one state store,
//! so ownership, follower mounts and failover behave as in a cluster while
//! the devices themselves are simulated.

use std::sync::Arc;
use std::time::Duration;

use devgrid_endpoint::EndpointSystem;
use devgrid_state::{DeviceConfig, StateStore};
use devgrid_topology::{
    DeviceConnector, ElectionProvider, InProcessElection, LocalMountRegistry, MountPointService,
    NodeResources, SimulatedConnector, TopologyManager, TopologySettings,
};
use tracing::{info, warn};

struct SimulatedNode {
    manager: Arc<TopologyManager>,
    mounts: Arc<LocalMountRegistry>,
}

/// Run `nodes` nodes managing `devices` simulated devices until CTRL+C.
pub async fn run_simulation(nodes: usize, devices: usize, report_interval: u64) -> anyhow::Result<()> {
    if nodes == 0 {
        anyhow::bail!("at least one node is required");
    }
    info!(nodes, devices, "devgrid daemon starting in simulate mode");

    // ── Shared fabric ──────────────────────────────────────────

    let store = StateStore::open_in_memory()?;
    let fabric = EndpointSystem::new(&node_address(1));
    let election = InProcessElection::new(&node_address(1));
    let connector = Arc::new(SimulatedConnector::new());
    let settings = TopologySettings::default();

    // ── Start nodes ────────────────────────────────────────────

    let mut cluster = Vec::with_capacity(nodes);
    for index in 1..=nodes {
        let address = node_address(index);
        let mounts = Arc::new(LocalMountRegistry::new());
        let resources = NodeResources {
            system: fabric.for_node(&address),
            store: store.clone(),
            mounts: Arc::clone(&mounts) as Arc<dyn MountPointService>,
            connector: Arc::clone(&connector) as Arc<dyn DeviceConnector>,
        };
        let election = Arc::new(election.for_node(&address)) as Arc<dyn ElectionProvider>;
        let manager = TopologyManager::new(settings.clone(), resources, election);
        manager.start().await?;
        info!(node = %address, "node started");
        cluster.push(SimulatedNode { manager, mounts });
    }

    for index in 1..=devices {
        let name = format!("dev-{index}");
        let port = u16::try_from(index).map_or(u16::MAX, |i| 17830u16.saturating_add(i));
        store.put_config(&DeviceConfig::new(&name, "127.0.0.1", port))?;
    }

    // ── Report until shutdown ──────────────────────────────────

    let mut ticker = tokio::time::interval(Duration::from_secs(report_interval.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => report(&store, &cluster),
            signal = &mut shutdown => {
                signal.expect("failed to install CTRL+C handler");
                info!("shutdown signal received");
                break;
            }
        }
    }

    for node in cluster.iter().rev() {
        node.manager.close().await;
    }
    store.close();
    info!("devgrid simulation stopped");
    Ok(())
}

fn node_address(index: usize) -> String {
    format!("node-{index}")
}

fn report(store: &StateStore, cluster: &[SimulatedNode]) {
    match store.list_opers() {
        Ok(records) => {
            for record in records {
                match serde_json::to_string(&record) {
                    Ok(json) => info!(device = %record.name, status = %json, "operational status"),
                    Err(e) => warn!(device = %record.name, error = %e, "failed to render status"),
                }
            }
        }
        Err(e) => warn!(error = %e, "failed to list operational status"),
    }
    for node in cluster {
        info!(
            node = %node.manager.resources().node_address(),
            mounted = ?node.mounts.mounted(),
            "mount points"
        );
    }
}
