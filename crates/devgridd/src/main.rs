//! devgridd: the devgrid daemon.
//!
//! Runs one topology node: follows the configured devices, takes part in
//! the per-device ownership election and mounts every device either from
//! its live connection (owner) or through proxies to the owner (follower).
//!
//! # Usage
//!
//! ```text
//! devgridd init --address node-1 --output devgrid.toml
//! devgridd standalone --config devgrid.toml --data-dir /var/lib/devgrid
//! devgridd simulate --nodes 3 --devices 4
//! ```

mod simulate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use devgrid_core::DaemonConfig;
use devgrid_endpoint::EndpointSystem;
use devgrid_state::StateStore;
use devgrid_topology::setup::device_config_from_entry;
use devgrid_topology::{
    DeviceConnector, ElectionProvider, InProcessElection, LocalMountRegistry, MountPointService,
    NodeResources, SimulatedConnector, TopologyManager, TopologySettings,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "devgridd", about = "devgrid topology daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a minimal devgrid.toml for a single node.
    Init {
        /// Cluster address of the node.
        #[arg(long, default_value = "node-1")]
        address: String,

        /// Where to write the configuration.
        #[arg(long, default_value = "devgrid.toml")]
        output: PathBuf,
    },

    /// Run a single node against simulated devices.
    Standalone {
        /// Path to devgrid.toml.
        #[arg(long, default_value = "devgrid.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/devgrid")]
        data_dir: PathBuf,
    },

    /// Run several nodes in one process sharing election and state.
    Simulate {
        /// Number of cluster nodes.
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Number of simulated devices.
        #[arg(long, default_value = "2")]
        devices: usize,

        /// Status report interval in seconds.
        #[arg(long, default_value = "10")]
        report_interval: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,devgridd=debug,devgrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Init { address, output } => run_init(&address, &output),
        Command::Standalone { config, data_dir } => run_standalone(config, data_dir).await,
        Command::Simulate {
            nodes,
            devices,
            report_interval,
        } => simulate::run_simulation(nodes, devices, report_interval).await,
    }
}

fn run_init(address: &str, output: &Path) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }
    let config = DaemonConfig::scaffold(address);
    std::fs::write(output, config.to_toml_string()?)?;
    info!(path = %output.display(), %address, "configuration written");
    Ok(())
}

async fn run_standalone(config_path: PathBuf, data_dir: PathBuf) -> anyhow::Result<()> {
    let config = DaemonConfig::from_file(&config_path)?;
    info!(
        node = %config.node.address,
        topology = config.topology_id(),
        "devgrid daemon starting in standalone mode"
    );

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("devgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    sync_device_configs(&store, &config)?;

    let resources = NodeResources {
        system: EndpointSystem::new(&config.node.address),
        store,
        mounts: Arc::new(LocalMountRegistry::new()) as Arc<dyn MountPointService>,
        connector: Arc::new(SimulatedConnector::new()) as Arc<dyn DeviceConnector>,
    };
    let election = Arc::new(InProcessElection::new(&config.node.address)) as Arc<dyn ElectionProvider>;
    let manager = TopologyManager::new(TopologySettings::from_config(&config), resources, election);

    // ── Start topology ─────────────────────────────────────────

    manager.start().await?;
    info!(devices = manager.managed().len(), "topology running");

    // ── Shutdown signal ────────────────────────────────────────

    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("shutdown signal received");

    manager.close().await;
    manager.resources().store.close();
    info!("devgrid daemon stopped");
    Ok(())
}

/// Make the stored configuration records match the devices in `config`.
fn sync_device_configs(store: &StateStore, config: &DaemonConfig) -> anyhow::Result<()> {
    for entry in config.devices() {
        let record = device_config_from_entry(entry);
        if store.get_config(&record.name)?.as_ref() != Some(&record) {
            store.put_config(&record)?;
        }
    }
    for stored in store.list_configs()? {
        if !config.devices().iter().any(|d| d.name == stored.name) {
            warn!(device = %stored.name, "device no longer configured, removing");
            store.delete_config(&stored.name)?;
        }
    }
    Ok(())
}
