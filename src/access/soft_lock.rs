use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    common::time::timestamper::Timestamp,
    entry::{CacheEntry, Version},
};

/// What a domain region stores in a slot: a cached entry or a soft lock.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum Lockable {
    Item(Item),
    Lock(SoftLockState),
}

impl Lockable {
    pub(crate) fn is_readable(&self, tx_timestamp: Timestamp) -> bool {
        match self {
            Self::Item(item) => item.is_readable(tx_timestamp),
            Self::Lock(_) => false,
        }
    }

    pub(crate) fn is_writeable(
        &self,
        tx_timestamp: Timestamp,
        new_version: Option<Version>,
    ) -> bool {
        match self {
            Self::Item(item) => item.is_writeable(tx_timestamp, new_version),
            Self::Lock(lock) => lock.is_writeable(tx_timestamp, new_version),
        }
    }

    pub(crate) fn estimated_size(&self) -> usize {
        match self {
            Self::Item(item) => std::mem::size_of::<Self>() + item.value.estimated_size(),
            Self::Lock(_) => std::mem::size_of::<Self>(),
        }
    }
}

/// A committed entry together with the time it was cached.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Item {
    pub(crate) value: CacheEntry,
    pub(crate) version: Option<Version>,
    pub(crate) timestamp: Timestamp,
}

impl Item {
    pub(crate) fn new(value: CacheEntry, version: Option<Version>, timestamp: Timestamp) -> Self {
        Self {
            value,
            version,
            timestamp,
        }
    }

    /// Only transactions that started after the entry was cached may read it.
    pub(crate) fn is_readable(&self, tx_timestamp: Timestamp) -> bool {
        tx_timestamp > self.timestamp
    }

    /// A load may replace the entry when it carries a newer version or, for
    /// unversioned data, when the loading transaction started after the entry
    /// was cached (last writer wins by timestamp).
    pub(crate) fn is_writeable(
        &self,
        tx_timestamp: Timestamp,
        new_version: Option<Version>,
    ) -> bool {
        match (self.version, new_version) {
            (Some(current), Some(new)) => current < new,
            _ => tx_timestamp > self.timestamp,
        }
    }
}

/// The lock record kept in a slot while one or more transactions write the
/// item.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct SoftLockState {
    source: Uuid,
    lock_id: u64,
    version: Option<Version>,
    /// The lock is ignored once a transaction starts after this timestamp.
    timeout: Timestamp,
    concurrent: bool,
    multiplicity: u32,
    unlock_timestamp: Timestamp,
}

impl SoftLockState {
    pub(crate) fn new(
        source: Uuid,
        lock_id: u64,
        version: Option<Version>,
        timeout: Timestamp,
    ) -> Self {
        Self {
            source,
            lock_id,
            version,
            timeout,
            concurrent: false,
            multiplicity: 1,
            unlock_timestamp: 0,
        }
    }

    /// A lock left behind by a session that never unlocked it, already
    /// released as of `timestamp`. Loads of transactions started before then
    /// are refused.
    pub(crate) fn released_at(source: Uuid, lock_id: u64, timestamp: Timestamp) -> Self {
        Self {
            source,
            lock_id,
            version: None,
            timeout: timestamp,
            concurrent: false,
            multiplicity: 0,
            unlock_timestamp: timestamp,
        }
    }

    pub(crate) fn is_writeable(
        &self,
        tx_timestamp: Timestamp,
        new_version: Option<Version>,
    ) -> bool {
        if self.is_expired(tx_timestamp) {
            return true;
        }
        if self.multiplicity > 0 {
            return false;
        }
        match (self.version, new_version) {
            (Some(current), Some(new)) => current < new,
            _ => tx_timestamp > self.unlock_timestamp,
        }
    }

    pub(crate) fn is_expired(&self, timestamp: Timestamp) -> bool {
        timestamp > self.timeout
    }

    pub(crate) fn is_unlockable(&self, lock: &SoftLock) -> bool {
        self.source == lock.source && self.lock_id == lock.lock_id
    }

    /// Another transaction locks the same key while this lock is held.
    pub(crate) fn relock(&mut self, timeout: Timestamp) {
        self.concurrent = true;
        self.multiplicity += 1;
        self.timeout = timeout;
    }

    /// Returns `false` when the lock was already fully released.
    pub(crate) fn unlock(&mut self, timestamp: Timestamp) -> bool {
        if self.multiplicity == 0 {
            return false;
        }
        self.multiplicity -= 1;
        if self.multiplicity == 0 {
            self.unlock_timestamp = timestamp;
        }
        true
    }

    pub(crate) fn was_locked_concurrently(&self) -> bool {
        self.concurrent
    }

    pub(crate) fn multiplicity(&self) -> u32 {
        self.multiplicity
    }

    /// A handle to this lock, handed out by the region `issuer`.
    pub(crate) fn handle(&self, issuer: Uuid) -> SoftLock {
        SoftLock {
            issuer,
            source: self.source,
            lock_id: self.lock_id,
        }
    }
}

/// Proof that the holder locked a cache slot with
/// [`Region::lock_item`][lock-item].
///
/// A `SoftLock` is handed back to the region exactly once, through
/// `unlock_item` or `after_update`, which consume it.
///
/// [lock-item]: ./struct.Region.html#method.lock_item
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(Clone))]
pub struct SoftLock {
    issuer: Uuid,
    source: Uuid,
    lock_id: u64,
}

impl SoftLock {
    pub(crate) fn issuer(&self) -> Uuid {
        self.issuer
    }

    pub fn lock_id(&self) -> u64 {
        self.lock_id
    }
}
