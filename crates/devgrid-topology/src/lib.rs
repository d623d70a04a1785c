//! devgrid-topology: clustered device ownership for devgrid.
//!
//! For every configured device exactly one node owns the live connection;
//! every other node reaches the device through proxies that forward each
//! call to the owner's endpoint.
//!
//! # Architecture
//!
//! ```text
//! TopologyManager (one per node)
//!   ├── follows configuration records
//!   └── DeviceContext (one per device), registered for election
//!       ├── Leader
//!       │   ├── owner NodeEndpoint  "{device}_master_{node}"
//!       │   │   ├── TransactionEndpoint children
//!       │   │   └── DataTreeEndpoint children
//!       │   ├── OwnerFacade → real services mounted, status record written
//!       │   └── DeviceConnection
//!       └── Follower
//!           └── NodeManager
//!               ├── follows the operational record
//!               ├── asks the owner for a mount (retried on timeout)
//!               └── follower NodeEndpoint "{device}_follower"
//!                   └── FollowerFacade → proxy services mounted
//! ```
//!
//! Election, the device connection and the mount registry are traits so the
//! same machinery runs against in-process stand-ins
//! ([`InProcessElection`], [`SimulatedConnector`], [`LocalMountRegistry`]).

pub mod connector;
pub mod context;
pub mod election;
pub mod endpoints;
pub mod error;
pub mod facade;
pub mod messages;
pub mod mount;
pub mod node_manager;
pub mod payload;
pub mod proxy;
pub mod services;
pub mod setup;
pub mod simulated;
pub mod topology;

pub use connector::{DeviceConnection, DeviceConnector};
pub use context::{DeviceContext, DeviceRole};
pub use election::{ElectionProvider, ElectionRegistration, InProcessElection, SingletonService};
pub use error::{ElectionError, ServiceError, ServiceResult, TopologyError, TopologyResult};
pub use facade::{DeviceFacade, FollowerFacade, OwnerFacade};
pub use messages::{DeviceEndpointRef, DeviceEndpointSystem, Message};
pub use mount::{LocalMountRegistry, MountPoint, MountPointService, MountRegistration, MountRole};
pub use node_manager::{NodeManager, RetryStats, should_log_retry};
pub use proxy::proxy_services;
pub use services::DeviceServices;
pub use setup::{DeviceSetup, NodeResources, TopologySettings};
pub use simulated::{CannedReply, SimulatedConnector, SimulatedDevice};
pub use topology::{REGISTRATION_ATTEMPTS, TopologyManager};
