//! StateStore: redb-backed record persistence for devgrid.
//!
//! Provides typed CRUD operations over device configuration records,
//! operational status records and topology containers. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! Writes to configuration and operational records are published to
//! subscribers after commit. A store-wide write lock keeps publication
//! order identical to commit order.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Buffered change notifications per channel before slow subscribers lag.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Thread-safe record store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    write_lock: Arc<Mutex<()>>,
    closed: Arc<AtomicBool>,
    config_changes: broadcast::Sender<RecordChange<DeviceConfig>>,
    oper_changes: broadcast::Sender<RecordChange<OperationalStatusRecord>>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_database(db: Database) -> Self {
        let (config_changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (oper_changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
            closed: Arc::new(AtomicBool::new(false)),
            config_changes,
            oper_changes,
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CONFIG_NODES).map_err(map_err!(Table))?;
        txn.open_table(OPER_NODES).map_err(map_err!(Table))?;
        txn.open_table(TOPOLOGIES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Refuse every later write on this store and all its clones.
    ///
    /// Reads keep working. Writes already committed are unaffected.
    pub fn close(&self) {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("state store closed for writes");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ── Configuration records ──────────────────────────────────────

    /// Replace (or create) a device configuration record.
    pub fn put_config(&self, config: &DeviceConfig) -> StateResult<()> {
        let _guard = self.lock_writes()?;
        let before = self.insert_record(CONFIG_NODES, &config.name, config)?;
        debug!(device = %config.name, "config record written");
        publish(
            &self.config_changes,
            RecordChange {
                key: config.name.clone(),
                kind: ChangeKind::Write,
                before,
                after: Some(config.clone()),
            },
        );
        Ok(())
    }

    /// Update an existing configuration record in place.
    ///
    /// Published as `SubtreeModified` when the record existed and as
    /// `Write` when it is created by this call.
    pub fn merge_config(&self, config: &DeviceConfig) -> StateResult<()> {
        let _guard = self.lock_writes()?;
        let before = self.insert_record(CONFIG_NODES, &config.name, config)?;
        let kind = if before.is_some() {
            ChangeKind::SubtreeModified
        } else {
            ChangeKind::Write
        };
        debug!(device = %config.name, ?kind, "config record merged");
        publish(
            &self.config_changes,
            RecordChange {
                key: config.name.clone(),
                kind,
                before,
                after: Some(config.clone()),
            },
        );
        Ok(())
    }

    /// Get a configuration record by device name.
    pub fn get_config(&self, name: &str) -> StateResult<Option<DeviceConfig>> {
        self.get_record(CONFIG_NODES, name)
    }

    /// List all configuration records.
    pub fn list_configs(&self) -> StateResult<Vec<DeviceConfig>> {
        self.list_records(CONFIG_NODES)
    }

    /// Delete a configuration record. Returns true if it existed.
    pub fn delete_config(&self, name: &str) -> StateResult<bool> {
        let _guard = self.lock_writes()?;
        let before: Option<DeviceConfig> = self.remove_record(CONFIG_NODES, name)?;
        let existed = before.is_some();
        debug!(device = %name, existed, "config record deleted");
        if existed {
            publish(
                &self.config_changes,
                RecordChange {
                    key: name.to_string(),
                    kind: ChangeKind::Delete,
                    before,
                    after: None,
                },
            );
        }
        Ok(existed)
    }

    /// Subscribe to configuration changes committed after this call.
    pub fn subscribe_config(&self) -> broadcast::Receiver<RecordChange<DeviceConfig>> {
        self.config_changes.subscribe()
    }

    // ── Operational records ────────────────────────────────────────

    /// Replace (or create) an operational status record.
    pub fn put_oper(&self, record: &OperationalStatusRecord) -> StateResult<()> {
        let _guard = self.lock_writes()?;
        let before = self.insert_record(OPER_NODES, &record.name, record)?;
        debug!(
            device = %record.name,
            status = ?record.status,
            leader = ?record.leader_address,
            "operational record written"
        );
        publish(
            &self.oper_changes,
            RecordChange {
                key: record.name.clone(),
                kind: ChangeKind::Write,
                before,
                after: Some(record.clone()),
            },
        );
        Ok(())
    }

    /// Get an operational record by device name.
    pub fn get_oper(&self, name: &str) -> StateResult<Option<OperationalStatusRecord>> {
        self.get_record(OPER_NODES, name)
    }

    /// List all operational records.
    pub fn list_opers(&self) -> StateResult<Vec<OperationalStatusRecord>> {
        self.list_records(OPER_NODES)
    }

    /// Delete an operational record. Returns true if it existed.
    pub fn delete_oper(&self, name: &str) -> StateResult<bool> {
        let _guard = self.lock_writes()?;
        self.delete_oper_locked(name)
    }

    /// Delete an operational record only if it still names `leader_address`.
    ///
    /// Lets a departing owner clean up without clobbering a record its
    /// successor has already written. Returns true if a record was removed.
    pub fn delete_oper_if_leader(&self, name: &str, leader_address: &str) -> StateResult<bool> {
        let _guard = self.lock_writes()?;
        match self.get_record::<OperationalStatusRecord>(OPER_NODES, name)? {
            Some(record) if record.leader_address.as_deref() == Some(leader_address) => {
                self.delete_oper_locked(name)
            }
            _ => Ok(false),
        }
    }

    fn delete_oper_locked(&self, name: &str) -> StateResult<bool> {
        let before: Option<OperationalStatusRecord> = self.remove_record(OPER_NODES, name)?;
        let existed = before.is_some();
        debug!(device = %name, existed, "operational record deleted");
        if existed {
            publish(
                &self.oper_changes,
                RecordChange {
                    key: name.to_string(),
                    kind: ChangeKind::Delete,
                    before,
                    after: None,
                },
            );
        }
        Ok(existed)
    }

    /// Subscribe to operational changes committed after this call.
    pub fn subscribe_oper(&self) -> broadcast::Receiver<RecordChange<OperationalStatusRecord>> {
        self.oper_changes.subscribe()
    }

    // ── Topologies ─────────────────────────────────────────────────

    /// Merge an (empty) topology container into the operational records.
    ///
    /// Idempotent; an existing container is left untouched.
    pub fn ensure_topology(&self, topology_id: &str) -> StateResult<()> {
        let _guard = self.lock_writes()?;
        if self
            .get_record::<TopologyRecord>(TOPOLOGIES, topology_id)?
            .is_none()
        {
            let record = TopologyRecord {
                topology_id: topology_id.to_string(),
            };
            self.insert_record(TOPOLOGIES, topology_id, &record)?;
            debug!(%topology_id, "topology container created");
        }
        Ok(())
    }

    /// Get a topology container by id.
    pub fn get_topology(&self, topology_id: &str) -> StateResult<Option<TopologyRecord>> {
        self.get_record(TOPOLOGIES, topology_id)
    }

    // ── Record helpers ─────────────────────────────────────────────

    fn lock_writes(&self) -> StateResult<std::sync::MutexGuard<'_, ()>> {
        let guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.closed.load(Ordering::SeqCst) {
            return Err(StateError::Closed);
        }
        Ok(guard)
    }

    /// Insert a record, returning the value it replaced.
    fn insert_record<T: Serialize + DeserializeOwned>(
        &self,
        table_def: RecordTable,
        key: &str,
        value: &T,
    ) -> StateResult<Option<T>> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let before = {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            let previous = table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
            match previous {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(before)
    }

    /// Remove a record, returning the value it held.
    fn remove_record<T: DeserializeOwned>(
        &self,
        table_def: RecordTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let before = {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            let removed = table.remove(key).map_err(map_err!(Write))?;
            match removed {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(before)
    }

    fn get_record<T: DeserializeOwned>(
        &self,
        table_def: RecordTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_records<T: DeserializeOwned>(&self, table_def: RecordTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }
}

/// Publish a change; having no subscribers is not an error.
fn publish<T>(sender: &broadcast::Sender<RecordChange<T>>, change: RecordChange<T>) {
    if sender.send(change).is_err() {
        debug!("no change subscribers");
    }
}
