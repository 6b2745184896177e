//! Cached query results.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    common::time::timestamper::Timestamp,
    entry::CacheValue,
    stats::{RegionStats, StatsCounter},
    storage::StorageAccess,
    timestamps::TimestampsRegion,
    transaction::CacheTransaction,
    Result,
};

/// Identifies a query execution: the SQL, its bound parameters and the
/// requested row window.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryKey {
    sql: String,
    parameters: Vec<CacheValue>,
    first_row: Option<u32>,
    max_rows: Option<u32>,
    tenant: Option<String>,
}

impl QueryKey {
    pub fn new(sql: impl Into<String>, parameters: Vec<CacheValue>) -> Self {
        Self {
            sql: sql.into(),
            parameters,
            first_row: None,
            max_rows: None,
            tenant: None,
        }
    }

    pub fn with_row_window(self, first_row: Option<u32>, max_rows: Option<u32>) -> Self {
        Self {
            first_row,
            max_rows,
            ..self
        }
    }

    pub fn with_tenant(self, tenant: impl Into<String>) -> Self {
        Self {
            tenant: Some(tenant.into()),
            ..self
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn parameters(&self) -> &[CacheValue] {
        &self.parameters
    }

    pub(crate) fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.sql.len()
            + self.parameters.iter().map(CacheValue::estimated_size).sum::<usize>()
            + self.tenant.as_ref().map_or(0, String::len)
    }
}

/// A query result together with the start timestamp of the transaction that
/// produced it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct CachedQueryResult {
    timestamp: Timestamp,
    rows: Vec<Vec<CacheValue>>,
}

impl CachedQueryResult {
    pub(crate) fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .rows
                .iter()
                .flatten()
                .map(CacheValue::estimated_size)
                .sum::<usize>()
    }
}

pub(crate) type QueryStorage = Arc<dyn StorageAccess<QueryKey, CachedQueryResult>>;

/// Caches query results and serves them only while the table spaces they
/// were read from have not been modified since.
pub struct QueryResultsCache {
    name: String,
    storage: QueryStorage,
    timestamps: Arc<TimestampsRegion>,
    stats: Arc<StatsCounter>,
}

impl QueryResultsCache {
    pub(crate) fn new(
        name: String,
        storage: QueryStorage,
        timestamps: Arc<TimestampsRegion>,
        stats: Arc<StatsCounter>,
    ) -> Self {
        Self {
            name,
            storage,
            timestamps,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Caches the rows `tx` read for `key`. Returns `false` when the provider
    /// failed.
    pub fn put(
        &self,
        key: QueryKey,
        rows: Vec<Vec<CacheValue>>,
        tx: &CacheTransaction,
    ) -> Result<bool> {
        let result = CachedQueryResult {
            timestamp: tx.start_timestamp(),
            rows,
        };
        log::debug!("Caching query results at {}: {}", result.timestamp, key.sql);
        match self.storage.put(key, result) {
            Ok(()) => {
                self.stats.record_put();
                Ok(true)
            }
            Err(e) if e.is_recoverable() => {
                log::warn!("Caching query results in region `{}` failed: {e}", self.name);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Returns the cached rows for `key`, unless one of `spaces` was
    /// modified at or after the time they were cached.
    pub fn get<S: AsRef<str>>(
        &self,
        key: &QueryKey,
        spaces: &[S],
        _tx: &CacheTransaction,
    ) -> Result<Option<Vec<Vec<CacheValue>>>> {
        let cached = match self.storage.get(key) {
            Ok(cached) => cached,
            Err(e) if e.is_recoverable() => {
                log::warn!("Reading query results in region `{}` failed: {e}", self.name);
                None
            }
            Err(e) => return Err(e),
        };
        let rows = match cached {
            Some(result) if self.timestamps.is_up_to_date(spaces, result.timestamp) => {
                Some(result.rows)
            }
            Some(_) => {
                log::debug!("Cached query results are stale: {}", key.sql);
                None
            }
            None => None,
        };
        if rows.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        Ok(rows)
    }

    pub fn clear(&self) -> Result<()> {
        self.storage.clear()
    }

    pub fn statistics(&self) -> RegionStats {
        let mut stats = self.stats.snapshot(&self.name);
        stats.set_memory(
            self.storage.element_count_in_memory(),
            self.storage.size_in_memory(),
        );
        stats
    }

    /// Releases the storage. Failures are logged.
    pub fn destroy(&self) {
        if let Err(e) = self.storage.destroy() {
            log::error!("Failed to destroy query results region `{}`: {e}", self.name);
        }
    }
}

impl fmt::Debug for QueryResultsCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResultsCache")
            .field("name", &self.name)
            .field("timestamps", &self.timestamps.name())
            .finish()
    }
}
