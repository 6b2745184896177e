use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    common::time::{timestamper::Timestamp, Timestamper},
    key::CacheKey,
};

/// How long a removal is remembered. A load that started earlier than this
/// before the removal is not expected to still be in flight.
pub(crate) const NAKED_PUT_INVALIDATION_PERIOD: Duration = Duration::from_secs(20);

/// Refuses loads that read the database before a concurrent removal.
///
/// Strategies without soft locks evict a key when it is written. A
/// transaction that read the old row before the eviction could otherwise put
/// the stale state back afterwards. The validator remembers when each key was
/// last removed, and when the whole region was last invalidated, and only
/// admits loads from transactions that started later.
pub(crate) struct PutFromLoadValidator {
    recent_removals: Mutex<HashMap<CacheKey, Timestamp>>,
    region_invalidated: AtomicU64,
    retention: Timestamp,
}

impl Default for PutFromLoadValidator {
    fn default() -> Self {
        Self::new(NAKED_PUT_INVALIDATION_PERIOD)
    }
}

impl PutFromLoadValidator {
    pub(crate) fn new(retention: Duration) -> Self {
        Self {
            recent_removals: Mutex::default(),
            region_invalidated: AtomicU64::new(0),
            retention: Timestamper::span_of(retention),
        }
    }

    pub(crate) fn record_removal(&self, key: &CacheKey, now: Timestamp) {
        let mut removals = self.recent_removals.lock();
        self.purge(&mut removals, now);
        let ts = removals.entry(key.clone()).or_insert(now);
        *ts = (*ts).max(now);
    }

    pub(crate) fn invalidate_region(&self, now: Timestamp) {
        self.region_invalidated.fetch_max(now, Ordering::AcqRel);
        // Older per-key removals are superseded by the region timestamp.
        self.recent_removals.lock().retain(|_, ts| *ts > now);
    }

    pub(crate) fn is_put_valid(&self, key: &CacheKey, tx_start: Timestamp) -> bool {
        if tx_start <= self.region_invalidated.load(Ordering::Acquire) {
            return false;
        }
        match self.recent_removals.lock().get(key) {
            Some(removed) => tx_start > *removed,
            None => true,
        }
    }

    fn purge(&self, removals: &mut HashMap<CacheKey, Timestamp>, now: Timestamp) {
        let horizon = now.saturating_sub(self.retention);
        removals.retain(|_, ts| *ts >= horizon);
    }

    #[cfg(test)]
    pub(crate) fn tracked_keys(&self) -> usize {
        self.recent_removals.lock().len()
    }
}
