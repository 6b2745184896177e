//! Last-modification timestamps of table spaces.

use std::{fmt, sync::Arc, time::Duration};

use crate::{
    common::time::{timestamper::Timestamp, Timestamper},
    stats::{RegionStats, StatsCounter},
    storage::StorageAccess,
    Result,
};

pub(crate) type TimestampsStorage = Arc<dyn StorageAccess<String, Timestamp>>;

/// Records when each table space was last modified, so cached query results
/// can be checked for staleness.
///
/// A bulk statement first [pre-invalidates](#method.pre_invalidate) the
/// spaces it touches, which marks them as modified until the lock timeout
/// has passed. When the transaction completes the spaces are
/// [invalidated](#method.invalidate) with the current timestamp. Query
/// results cached at or before a space's timestamp are stale.
pub struct TimestampsRegion {
    name: String,
    storage: TimestampsStorage,
    timestamper: Arc<Timestamper>,
    lock_timeout: Duration,
    stats: Arc<StatsCounter>,
}

impl TimestampsRegion {
    pub(crate) fn new(
        name: String,
        storage: TimestampsStorage,
        timestamper: Arc<Timestamper>,
        lock_timeout: Duration,
        stats: Arc<StatsCounter>,
    ) -> Self {
        Self {
            name,
            storage,
            timestamper,
            lock_timeout,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Marks `spaces` as being modified by a statement still in flight.
    pub fn pre_invalidate<S: AsRef<str>>(&self, spaces: &[S]) -> Result<()> {
        let ts = self.timestamper.next() + Timestamper::span_of(self.lock_timeout);
        self.set_all(spaces, ts, "pre-invalidate")
    }

    /// Records that `spaces` were modified now.
    pub fn invalidate<S: AsRef<str>>(&self, spaces: &[S]) -> Result<()> {
        let ts = self.timestamper.next();
        self.set_all(spaces, ts, "invalidate")
    }

    pub fn last_update(&self, space: &str) -> Result<Option<Timestamp>> {
        self.storage.get(&space.to_string())
    }

    /// Returns `true` when none of `spaces` was modified at or after
    /// `timestamp`. A space that was never modified is up to date. When the
    /// timestamps cannot be read the result counts as stale.
    pub fn is_up_to_date<S: AsRef<str>>(&self, spaces: &[S], timestamp: Timestamp) -> bool {
        for space in spaces {
            let space = space.as_ref();
            match self.last_update(space) {
                Ok(None) => self.stats.record_miss(),
                Ok(Some(last)) => {
                    self.stats.record_hit();
                    if last >= timestamp {
                        log::debug!(
                            "Table space `{space}` modified at {last}, after the result"
                        );
                        return false;
                    }
                }
                Err(e) => {
                    log::warn!("Reading the timestamp of `{space}` failed: {e}");
                    return false;
                }
            }
        }
        true
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
            log::error!("Failed to destroy timestamps region `{}`: {e}", self.name);
        }
    }

    fn set_all<S: AsRef<str>>(&self, spaces: &[S], ts: Timestamp, operation: &str) -> Result<()> {
        for space in spaces {
            let space = space.as_ref();
            log::debug!("{operation} table space `{space}` at {ts}");
            match self.storage.put(space.to_string(), ts) {
                Ok(()) => self.stats.record_put(),
                Err(e) if e.is_recoverable() => {
                    log::warn!("Failed to {operation} table space `{space}`: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TimestampsRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimestampsRegion")
            .field("name", &self.name)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}
