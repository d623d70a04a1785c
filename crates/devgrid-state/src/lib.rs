//! devgrid-state: configuration and operational record store for devgrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for device configuration records and the operational status
//! records that device owners publish to the rest of the cluster.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns,
//! keyed by device name. Every committed change is also published on a
//! broadcast channel so listeners (the topology manager for configuration,
//! node managers for operational status) observe modifications in commit
//! order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` and can be shared across
//! async tasks; clones share both the database and the change channels.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
