//! StateStore: redb-backed entity store for the fleet.
//!
//! One function per access pattern; there is no query builder. Reads run in
//! a read transaction, and every write runs in exactly one write
//! transaction opened by [`StateStore::write`]. Multi-row units (an
//! ownership phase, a VM removal) are a single closure over that
//! transaction, so nothing they do is visible until commit.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, Table, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

mod cluster;
mod host;
mod mshost;
mod ownership;
mod vm;

pub use host::HostTransitionContext;
pub use ownership::AdoptOutcome;
pub use vm::VmTransitionContext;

/// An entity table opened inside a write transaction.
pub(crate) type Rows<'txn> = Table<'txn, u64, &'static [u8]>;

/// Thread-safe entity store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "entity store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory entity store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        self.write(|txn| {
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(HOSTS).map_err(map_err!(Table))?;
            txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            txn.open_table(VMS).map_err(map_err!(Table))?;
            txn.open_table(MSHOSTS).map_err(map_err!(Table))?;
            txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            Ok(())
        })
    }

    /// Run `unit` inside one write transaction and commit it.
    ///
    /// An error from `unit` drops the transaction, which aborts it.
    pub(crate) fn write<T>(
        &self,
        unit: impl FnOnce(&WriteTransaction) -> StateResult<T>,
    ) -> StateResult<T> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let out = unit(&txn)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(out)
    }

    pub(crate) fn read<T>(
        &self,
        query: impl FnOnce(&ReadTransaction) -> StateResult<T>,
    ) -> StateResult<T> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        query(&txn)
    }
}

// ── Row codec ──────────────────────────────────────────────────────

pub(crate) fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

pub(crate) fn get_row<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: u64,
) -> StateResult<Option<T>> {
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

pub(crate) fn put_row<T: Serialize>(table: &mut Rows<'_>, id: u64, row: &T) -> StateResult<()> {
    let value = encode(row)?;
    table
        .insert(id, value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Every row of `table` matching `keep`, in ascending id order.
pub(crate) fn scan<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    mut keep: impl FnMut(&T) -> bool,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let row: T = decode(value.value())?;
        if keep(&row) {
            results.push(row);
        }
    }
    Ok(results)
}

/// Allocate the next id for `kind` from the sequence table.
pub(crate) fn next_id(txn: &WriteTransaction, kind: &str) -> StateResult<u64> {
    let mut seq = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let next = seq
        .get(kind)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0)
        + 1;
    seq.insert(kind, next).map_err(map_err!(Write))?;
    Ok(next)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::types::*;

    use super::StateStore;

    pub fn managed_cluster(store: &StateStore, name: &str) -> ClusterId {
        store
            .create_cluster(name, ManagedState::Managed, 1)
            .unwrap()
            .id
    }

    pub fn new_host(guid: &str, cluster_id: ClusterId) -> NewHost {
        NewHost {
            guid: guid.to_string(),
            name: format!("host-{guid}"),
            host_type: HostType::Routing,
            hypervisor: "kvm".to_string(),
            private_ip: Some("10.0.0.10".to_string()),
            cluster_id,
        }
    }
}
