//! redb table definitions for the devgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Device configuration records keyed by device name.
pub const CONFIG_NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("config_nodes");

/// Operational status records keyed by device name.
pub const OPER_NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("oper_nodes");

/// Operational topology containers keyed by topology id.
pub const TOPOLOGIES: TableDefinition<&str, &[u8]> = TableDefinition::new("topologies");
