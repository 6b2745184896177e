//! Named partitions of cache storage.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use uuid::Uuid;

use crate::{
    access::{
        put_from_load::PutFromLoadValidator,
        soft_lock::{Item, Lockable, SoftLockState},
        AccessStrategy, AccessType, DataAccess, SoftLock,
    },
    common::{
        key_lock::{KeyLock, KeyLockMap},
        time::{timestamper::Timestamp, Timestamper},
    },
    entry::{CacheEntry, Version},
    key::CacheKey,
    stats::{RegionStats, StatsCounter},
    storage::StorageAccess,
    transaction::CacheTransaction,
    Result,
};

/// The category of data a region holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Entity,
    Collection,
    NaturalId,
    QueryResults,
    Timestamps,
}

impl RegionKind {
    /// Entity, collection and natural-id regions hold domain data and are
    /// governed by an [`AccessType`].
    pub fn is_domain(&self) -> bool {
        matches!(self, Self::Entity | Self::Collection | Self::NaturalId)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Collection => "collection",
            Self::NaturalId => "natural-id",
            Self::QueryResults => "query-results",
            Self::Timestamps => "timestamps",
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) type DomainStorage = Arc<dyn StorageAccess<CacheKey, Lockable>>;

/// Everything needed to build a domain [`Region`].
pub(crate) struct RegionParts {
    pub(crate) name: String,
    pub(crate) kind: RegionKind,
    pub(crate) access_type: AccessType,
    pub(crate) storage: DomainStorage,
    pub(crate) stats: Arc<StatsCounter>,
    pub(crate) timestamper: Arc<Timestamper>,
    pub(crate) lock_timeout: Duration,
    pub(crate) minimal_puts: bool,
}

/// The state a region's access strategy works on.
pub(crate) struct RegionCore {
    name: String,
    kind: RegionKind,
    // Identifies the soft locks this region hands out.
    uuid: Uuid,
    storage: DomainStorage,
    stats: Arc<StatsCounter>,
    timestamper: Arc<Timestamper>,
    lock_timeout: Duration,
    minimal_puts: bool,
    // Serializes the read-modify-write sequences on a key, including
    // evictions.
    key_locks: KeyLockMap<CacheKey>,
    validator: PutFromLoadValidator,
    next_lock_id: AtomicU64,
    destroyed: AtomicBool,
}

impl RegionCore {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub(crate) fn next_timestamp(&self) -> Timestamp {
        self.timestamper.next()
    }

    /// The lock timeout on the timestamp line.
    pub(crate) fn lock_timeout_span(&self) -> Timestamp {
        Timestamper::span_of(self.lock_timeout)
    }

    pub(crate) fn next_lock_id(&self) -> u64 {
        self.next_lock_id.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn validator(&self) -> &PutFromLoadValidator {
        &self.validator
    }

    pub(crate) fn key_lock(&self, key: &CacheKey) -> KeyLock<'_, CacheKey> {
        self.key_locks.key_lock(key)
    }

    /// Reads a slot. A provider failure reads as an empty slot.
    pub(crate) fn read(&self, key: &CacheKey) -> Result<Option<Lockable>> {
        self.absorb("get", key, self.storage.get(key), None)
    }

    /// Caches an entry. Returns `false` when the provider failed.
    pub(crate) fn put_item(&self, key: CacheKey, item: Item) -> Result<bool> {
        let written = self.write(key, Lockable::Item(item))?;
        if written {
            self.stats.record_put();
        }
        Ok(written)
    }

    /// Caches state loaded by a transaction that started at `tx_start`. The
    /// caller holds the key lock and has checked the validator.
    ///
    /// Region invalidations do not take key locks, so the validator is asked
    /// again once the entry is stored. An invalidation that slipped in between
    /// takes the entry back out.
    pub(crate) fn put_loaded(
        &self,
        key: &CacheKey,
        item: Item,
        tx_start: Timestamp,
    ) -> Result<bool> {
        if !self.put_item(key.clone(), item)? {
            return Ok(false);
        }
        if !self.validator.is_put_valid(key, tx_start) {
            log::debug!("Withdrawing put of {key}: the region was invalidated meanwhile");
            self.discard(key)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Places a soft lock. Returns `false` when the provider failed.
    pub(crate) fn put_lock(&self, key: CacheKey, lock: SoftLockState) -> Result<bool> {
        self.write(key, Lockable::Lock(lock))
    }

    /// Removes a slot without telling the put-from-load validator.
    pub(crate) fn discard(&self, key: &CacheKey) -> Result<()> {
        self.absorb("remove", key, self.storage.remove(key), ())
    }

    /// Removes a slot and refuses loads of the key by transactions that
    /// started before now. A live soft lock stays in place: the write it
    /// guards publishes or releases it.
    ///
    /// Takes the key lock, so the caller must not hold it.
    pub(crate) fn evict_key(&self, key: &CacheKey) -> Result<()> {
        let kl = self.key_lock(key);
        let _guard = kl.lock();

        self.validator.record_removal(key, self.next_timestamp());
        match self.read(key)? {
            Some(Lockable::Lock(lock)) if !lock.is_expired(self.next_timestamp()) => {
                log::debug!("Keeping the soft lock on {key} in region `{}`", self.name);
                Ok(())
            }
            _ => self.discard(key),
        }
    }

    fn write(&self, key: CacheKey, value: Lockable) -> Result<bool> {
        match self.storage.put(key.clone(), value) {
            Ok(()) => Ok(true),
            Err(e) if e.is_recoverable() => {
                log::warn!("Cache put of {key} in region `{}` failed: {e}", self.name);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn absorb<T>(
        &self,
        operation: &str,
        key: &CacheKey,
        result: Result<T>,
        fallback: T,
    ) -> Result<T> {
        match result {
            Err(e) if e.is_recoverable() => {
                log::warn!(
                    "Cache {operation} of {key} in region `{}` failed, treating it as a miss: {e}",
                    self.name
                );
                Ok(fallback)
            }
            other => other,
        }
    }

    fn clear(&self) -> Result<()> {
        self.validator.invalidate_region(self.next_timestamp());
        match self.storage.clear() {
            Err(e) if e.is_recoverable() => {
                log::warn!("Clearing cache region `{}` failed: {e}", self.name);
                Ok(())
            }
            other => other,
        }
    }
}

/// A named cache partition holding entities, collections or natural ids.
///
/// A region combines a storage engine with the [`AccessType`] chosen when it
/// was built. All session-facing operations go through the region, which
/// dispatches them to its strategy:
///
/// - Reads (`get`, `put_from_load`) take the transaction that performs them,
///   whose start timestamp decides which cached data it may see or replace.
/// - Writes follow the entity's life cycle. An update calls `lock_item`
///   before the database write and `after_update` once the transaction
///   committed, or `unlock_item` when it rolled back. An insert calls
///   `insert`, then `after_insert` on commit.
///
/// Failures of the storage provider are logged and degrade to misses or
/// refused puts. Only broken invariants, such as updating read-only data or
/// releasing a soft lock twice, are returned as errors.
pub struct Region {
    core: Arc<RegionCore>,
    access: AccessStrategy,
}

impl Region {
    pub(crate) fn new(parts: RegionParts) -> Self {
        let core = RegionCore {
            name: parts.name,
            kind: parts.kind,
            uuid: Uuid::new_v4(),
            storage: parts.storage,
            stats: parts.stats,
            timestamper: parts.timestamper,
            lock_timeout: parts.lock_timeout,
            minimal_puts: parts.minimal_puts,
            key_locks: KeyLockMap::default(),
            validator: PutFromLoadValidator::default(),
            next_lock_id: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        };
        Self {
            core: Arc::new(core),
            access: AccessStrategy::new(parts.access_type),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn kind(&self) -> RegionKind {
        self.core.kind
    }

    pub fn access_type(&self) -> AccessType {
        self.access.access_type()
    }

    /// The soft-lock timeout of this region.
    pub fn lock_timeout(&self) -> Duration {
        self.core.lock_timeout
    }

    /// Returns the cached entry for `key` if transaction `tx` may see it.
    pub fn get(&self, key: &CacheKey, tx: &CacheTransaction) -> Result<Option<CacheEntry>> {
        let entry = self.policy().get(&self.core, key, tx)?;
        if entry.is_some() {
            self.core.stats.record_hit();
        } else {
            self.core.stats.record_miss();
        }
        Ok(entry)
    }

    /// Caches state that `tx` just loaded from the database.
    ///
    /// Returns `false` when the put was skipped or refused: the key is being
    /// written by another transaction, the cached entry is newer than the
    /// load, or `minimal_put_override` (or the factory's minimal-puts
    /// setting) is on and the key is already cached.
    pub fn put_from_load(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        tx: &CacheTransaction,
        version: Option<Version>,
        minimal_put_override: bool,
    ) -> Result<bool> {
        let minimal_put = minimal_put_override || self.core.minimal_puts;
        self.policy()
            .put_from_load(&self.core, key, entry, tx, version, minimal_put)
    }

    /// Soft-locks `key` before its database row is written. Strategies that
    /// do not lock return `None`.
    pub fn lock_item(
        &self,
        key: &CacheKey,
        version: Option<Version>,
        tx: &CacheTransaction,
    ) -> Result<Option<SoftLock>> {
        self.policy().lock_item(&self.core, key, version, tx)
    }

    /// Releases a lock obtained from [`lock_item`](#method.lock_item), when
    /// the write was rolled back or the entity was removed.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::IllegalLockState` when `lock` was issued by
    /// another region or was already released.
    pub fn unlock_item(&self, key: &CacheKey, lock: Option<SoftLock>) -> Result<()> {
        self.policy().unlock_item(&self.core, key, lock)
    }

    pub fn insert(&self, key: &CacheKey, entry: CacheEntry, tx: &CacheTransaction) -> Result<bool> {
        self.policy().insert(&self.core, key, entry, tx)
    }

    pub fn after_insert(&self, key: &CacheKey, entry: CacheEntry) -> Result<bool> {
        self.policy().after_insert(&self.core, key, entry)
    }

    /// # Errors
    ///
    /// Returns `CacheError::ReadOnlyUpdate` for read-only regions.
    pub fn update(&self, key: &CacheKey, entry: CacheEntry, tx: &CacheTransaction) -> Result<bool> {
        self.policy().update(&self.core, key, entry, tx)
    }

    /// Publishes the committed state of an updated entity and releases the
    /// soft lock taken for the update.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::ReadOnlyUpdate` for read-only regions and
    /// `CacheError::IllegalLockState` when `lock` was issued by another
    /// region or was already released.
    pub fn after_update(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        lock: Option<SoftLock>,
    ) -> Result<bool> {
        self.policy().after_update(&self.core, key, entry, lock)
    }

    /// Called when the entity is deleted.
    pub fn remove(&self, key: &CacheKey, tx: &CacheTransaction) -> Result<()> {
        self.policy().remove(&self.core, key, tx)
    }

    /// Called when every row of the underlying table may have changed.
    pub fn remove_all(&self) -> Result<()> {
        self.core.clear()
    }

    /// Drops the cached data of `key`, whatever the strategy. Loads that
    /// started before the eviction are refused afterwards, and a soft lock
    /// held by a write in flight is kept.
    pub fn evict(&self, key: &CacheKey) -> Result<()> {
        self.core.evict_key(key)
    }

    /// Drops every entry of the region. Loads that started before the
    /// eviction are refused afterwards.
    pub fn evict_all(&self) -> Result<()> {
        log::debug!("Evicting all entries of region `{}`", self.core.name);
        self.core.clear()
    }

    /// Returns `true` when an entry (not a soft lock) is cached for `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        matches!(self.core.read(key), Ok(Some(Lockable::Item(_))))
    }

    pub fn statistics(&self) -> RegionStats {
        let mut stats = self.core.stats.snapshot(&self.core.name);
        stats.set_memory(self.element_count_in_memory(), self.size_in_memory());
        stats
    }

    pub fn element_count_in_memory(&self) -> u64 {
        self.core.storage.element_count_in_memory()
    }

    pub fn size_in_memory(&self) -> u64 {
        self.core.storage.size_in_memory()
    }

    /// Releases the storage of the region. Failures are logged.
    pub fn destroy(&self) {
        if self.core.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.core.storage.destroy() {
            Ok(()) => log::debug!("Destroyed cache region `{}`", self.core.name),
            Err(e) => log::error!("Failed to destroy cache region `{}`: {e}", self.core.name),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.destroyed.load(Ordering::Acquire)
    }

    fn policy(&self) -> &dyn DataAccess {
        self.access.policy()
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.core.name)
            .field("kind", &self.core.kind)
            .field("access_type", &self.access_type())
            .field("lock_timeout", &self.core.lock_timeout)
            .finish()
    }
}
