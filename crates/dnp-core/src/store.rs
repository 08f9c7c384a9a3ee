//! Persistent storage for enforcement state using redb.
//!
//! # Table design
//!
//! Every table maps a string key to a JSON-encoded record. Keys that need an
//! ordering carry a zero-padded numeric suffix so byte order equals logical
//! order:
//! ```text
//! items   "{batch_id}:{position:08}"   submission order within a batch
//! ledger  "{run_id}:{sequence:010}"    append order within a run
//! ```
//! A prefix range scan (`"{id}:"..."{id};"`) returns one batch or run in order.
//!
//! redb serializes write transactions, so every read-modify-write done inside
//! [`EnforcementDb::write`] is atomic with respect to every other worker that
//! shares the database handle.

use std::fmt::Display;
use std::path::Path;

use redb::{
    Database, ReadTransaction, ReadableTable, Table, TableDefinition, WriteTransaction,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{EnforceError, Result};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

pub(crate) type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// batch_id → ActionBatch
pub(crate) const BATCHES: JsonTable = TableDefinition::new("batches");
/// batch idempotency_key → batch_id
pub(crate) const BATCH_KEYS: JsonTable = TableDefinition::new("batch_keys");
/// "{batch_id}:{position:08}" → ActionItem
pub(crate) const ITEMS: JsonTable = TableDefinition::new("items");
/// item uniqueness tuple → item key
pub(crate) const ITEM_KEYS: JsonTable = TableDefinition::new("item_keys");
/// batch_id → BatchCheckpoint
pub(crate) const CHECKPOINTS: JsonTable = TableDefinition::new("checkpoints");
/// provider → ProviderRateState
pub(crate) const RATE_STATE: JsonTable = TableDefinition::new("rate_state");
/// provider → CircuitBreakerState
pub(crate) const CIRCUIT_STATE: JsonTable = TableDefinition::new("circuit_state");
/// "{run_id}:{sequence:010}" → EnforcementAction
pub(crate) const LEDGER: JsonTable = TableDefinition::new("ledger");
/// ledger idempotency_key → ledger key
pub(crate) const LEDGER_KEYS: JsonTable = TableDefinition::new("ledger_keys");
/// Same keys as LEDGER, for entries past the rollback window.
pub(crate) const LEDGER_ARCHIVE: JsonTable = TableDefinition::new("ledger_archive");
/// run_id → archived_at
pub(crate) const ARCHIVED_RUNS: JsonTable = TableDefinition::new("archived_runs");

const ALL_TABLES: [JsonTable; 11] = [
    BATCHES,
    BATCH_KEYS,
    ITEMS,
    ITEM_KEYS,
    CHECKPOINTS,
    RATE_STATE,
    CIRCUIT_STATE,
    LEDGER,
    LEDGER_KEYS,
    LEDGER_ARCHIVE,
    ARCHIVED_RUNS,
];

pub(crate) fn db_err(e: impl Display) -> EnforceError {
    EnforceError::Store(e.to_string())
}

// ---------------------------------------------------------------------------
// EnforcementDb
// ---------------------------------------------------------------------------

/// Durable store for batches, items, checkpoints, provider state and ledger.
pub struct EnforcementDb {
    db: Database,
}

impl EnforcementDb {
    /// Open or create the redb database at `path`.
    ///
    /// Creates every table if it doesn't already exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        for table in ALL_TABLES {
            wt.open_table(table).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    /// Run `f` inside one write transaction and commit if it returns `Ok`.
    ///
    /// On error the transaction is dropped, which aborts it.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&WriteTransaction) -> Result<T>) -> Result<T> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let out = f(&wt)?;
        wt.commit().map_err(db_err)?;
        Ok(out)
    }

    pub(crate) fn read<T>(&self, f: impl FnOnce(&ReadTransaction) -> Result<T>) -> Result<T> {
        let rt = self.db.begin_read().map_err(db_err)?;
        f(&rt)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

pub(crate) fn get_json<T, R>(table: &R, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(db_err)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

pub(crate) fn put_json<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    table.insert(key, bytes.as_slice()).map_err(db_err)?;
    Ok(())
}

/// Index tables store a plain string key as their value.
pub(crate) fn get_index<R>(table: &R, key: &str) -> Result<Option<String>>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(db_err)? {
        Some(guard) => Ok(Some(String::from_utf8_lossy(guard.value()).into_owned())),
        None => Ok(None),
    }
}

pub(crate) fn put_index(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    target: &str,
) -> Result<()> {
    table.insert(key, target.as_bytes()).map_err(db_err)?;
    Ok(())
}

/// Half-open key range covering every key that starts with `"{id}:"`.
pub(crate) fn prefix_bounds(id: &str) -> (String, String) {
    (format!("{id}:"), format!("{id};"))
}

/// All `(key, record)` pairs whose key starts with `"{id}:"`, in key order.
pub(crate) fn scan_prefix<T, R>(table: &R, id: &str) -> Result<Vec<(String, T)>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let (lo, hi) = prefix_bounds(id);
    let mut out = Vec::new();
    for entry in table
        .range(lo.as_str()..hi.as_str())
        .map_err(db_err)?
    {
        let (k, v) = entry.map_err(db_err)?;
        out.push((k.value().to_string(), serde_json::from_slice(v.value())?));
    }
    Ok(out)
}

pub(crate) fn scan_all<T, R>(table: &R) -> Result<Vec<(String, T)>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut out = Vec::new();
    for entry in table.iter().map_err(db_err)? {
        let (k, v) = entry.map_err(db_err)?;
        out.push((k.value().to_string(), serde_json::from_slice(v.value())?));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
