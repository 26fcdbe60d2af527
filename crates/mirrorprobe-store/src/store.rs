//! ResultStore — redb-backed persistence for result envelopes.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata};
use tracing::debug;

use mirrorprobe_core::{BoxFuture, Cache, CacheError, History, ResultEnvelope};

use crate::error::{StoreError, StoreResult};
use crate::tables::RESULTS;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Thread-safe result store backed by redb.
#[derive(Clone)]
pub struct ResultStore {
    db: Arc<Database>,
}

impl ResultStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "result store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory result store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(RESULTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or overwrite an envelope under `key`.
    pub fn put(&self, key: &str, envelope: &ResultEnvelope) -> StoreResult<()> {
        let value = serde_json::to_vec(envelope).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RESULTS).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "result stored");
        Ok(())
    }

    /// Get an envelope by key.
    pub fn get(&self, key: &str) -> StoreResult<Option<ResultEnvelope>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESULTS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let envelope: ResultEnvelope =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(envelope))
            }
            None => Ok(None),
        }
    }

    /// Every envelope of `probe` against `registry`, ascending by start time.
    pub fn history(&self, registry: &str, probe: &str) -> StoreResult<Vec<ResultEnvelope>> {
        let prefix = format!("{registry}/{probe}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESULTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let envelope: ResultEnvelope =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(envelope);
        }
        // Keys sort lexicographically, not numerically.
        results.sort_by_key(|e| e.start);
        Ok(results)
    }

    /// Number of stored envelopes.
    pub fn len(&self) -> StoreResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESULTS).map_err(map_err!(Table))?;
        table.len().map_err(map_err!(Read))
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl Cache for ResultStore {
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a ResultEnvelope,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.put(key, value).map_err(CacheError::from)
        })
    }
}

impl History for ResultStore {
    fn history(&self, registry: &str, probe: &str) -> Result<Vec<ResultEnvelope>, CacheError> {
        ResultStore::history(self, registry, probe).map_err(CacheError::from)
    }
}
