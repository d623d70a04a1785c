//! devgrid-core: daemon configuration shared by the devgrid crates.

pub mod config;

pub use config::{
    DEFAULT_ASK_TIMEOUT_SECS, DEFAULT_TOPOLOGY_ID, DaemonConfig, DeviceEntry, NodeSection,
    TimeoutSection,
};
