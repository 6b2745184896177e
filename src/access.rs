//! Concurrency strategies governing how sessions read and write a domain
//! region.

use std::{fmt, str::FromStr, sync::Arc};

use crate::{
    common::time::timestamper::Timestamp,
    entry::{CacheEntry, Version},
    key::CacheKey,
    region::RegionCore,
    transaction::CacheTransaction,
    CacheError, Result,
};

pub(crate) mod nonstrict;
pub(crate) mod put_from_load;
pub(crate) mod read_only;
pub(crate) mod read_write;
pub(crate) mod soft_lock;
pub(crate) mod transactional;

pub use soft_lock::SoftLock;

use self::{
    nonstrict::NonstrictReadWriteAccess,
    read_only::ReadOnlyAccess,
    read_write::ReadWriteAccess,
    soft_lock::{Item, Lockable},
    transactional::TransactionalAccess,
};

/// The concurrency strategy of a domain region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessType {
    /// Data is never updated once cached. Updates are rejected.
    ReadOnly,
    /// Writes evict the cached entry without locking. Readers may briefly see
    /// stale data.
    NonstrictReadWrite,
    /// Writes soft-lock the cached entry until the transaction completes.
    /// Readers never see data that is being overwritten.
    ReadWrite,
    /// Writes are staged in the cache transaction and applied on commit.
    Transactional,
}

impl AccessType {
    /// The name used in configuration files.
    pub fn external_name(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read-only",
            Self::NonstrictReadWrite => "nonstrict-read-write",
            Self::ReadWrite => "read-write",
            Self::Transactional => "transactional",
        }
    }
}

impl FromStr for AccessType {
    type Err = CacheError;

    /// Parses an external name. Upper case and underscores are accepted too,
    /// so `READ_WRITE` parses as [`AccessType::ReadWrite`].
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "read-only" => Ok(Self::ReadOnly),
            "nonstrict-read-write" => Ok(Self::NonstrictReadWrite),
            "read-write" => Ok(Self::ReadWrite),
            "transactional" => Ok(Self::Transactional),
            _ => Err(CacheError::UnknownAccessType(s.to_string())),
        }
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.external_name())
    }
}

/// The session-facing operations every strategy implements.
///
/// Recoverable storage failures never reach the caller: they are logged by
/// the region core and turned into misses or refused puts.
pub(crate) trait DataAccess: Send + Sync {
    fn get(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        tx: &CacheTransaction,
    ) -> Result<Option<CacheEntry>>;

    /// Caches state just read from the database. `minimal_put` skips the put
    /// when the key is already cached.
    fn put_from_load(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        entry: CacheEntry,
        tx: &CacheTransaction,
        version: Option<Version>,
        minimal_put: bool,
    ) -> Result<bool>;

    fn lock_item(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        version: Option<Version>,
        tx: &CacheTransaction,
    ) -> Result<Option<SoftLock>>;

    fn unlock_item(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        lock: Option<SoftLock>,
    ) -> Result<()>;

    /// Called when the entity is inserted, before the transaction completes.
    fn insert(
        &self,
        _core: &Arc<RegionCore>,
        _key: &CacheKey,
        _entry: CacheEntry,
        _tx: &CacheTransaction,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Called after the inserting transaction committed.
    fn after_insert(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        entry: CacheEntry,
    ) -> Result<bool>;

    /// Called when the entity is updated, before the transaction completes.
    fn update(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        entry: CacheEntry,
        tx: &CacheTransaction,
    ) -> Result<bool>;

    /// Called after the updating transaction committed.
    fn after_update(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        entry: CacheEntry,
        lock: Option<SoftLock>,
    ) -> Result<bool>;

    fn remove(&self, core: &Arc<RegionCore>, key: &CacheKey, tx: &CacheTransaction)
        -> Result<()>;
}

/// The strategy of a region, chosen when the region is built.
pub(crate) enum AccessStrategy {
    ReadOnly(ReadOnlyAccess),
    NonstrictReadWrite(NonstrictReadWriteAccess),
    ReadWrite(ReadWriteAccess),
    Transactional(TransactionalAccess),
}

impl AccessStrategy {
    pub(crate) fn new(access_type: AccessType) -> Self {
        match access_type {
            AccessType::ReadOnly => Self::ReadOnly(ReadOnlyAccess),
            AccessType::NonstrictReadWrite => Self::NonstrictReadWrite(NonstrictReadWriteAccess),
            AccessType::ReadWrite => Self::ReadWrite(ReadWriteAccess),
            AccessType::Transactional => Self::Transactional(TransactionalAccess),
        }
    }

    pub(crate) fn access_type(&self) -> AccessType {
        match self {
            Self::ReadOnly(_) => AccessType::ReadOnly,
            Self::NonstrictReadWrite(_) => AccessType::NonstrictReadWrite,
            Self::ReadWrite(_) => AccessType::ReadWrite,
            Self::Transactional(_) => AccessType::Transactional,
        }
    }

    pub(crate) fn policy(&self) -> &dyn DataAccess {
        match self {
            Self::ReadOnly(a) => a,
            Self::NonstrictReadWrite(a) => a,
            Self::ReadWrite(a) => a,
            Self::Transactional(a) => a,
        }
    }
}

/// The cached entry of a slot, ignoring its timestamp. Used by the strategies
/// that do not soft-lock.
pub(crate) fn cached_value(slot: Option<Lockable>) -> Option<CacheEntry> {
    match slot {
        Some(Lockable::Item(item)) => Some(item.value),
        _ => None,
    }
}

/// Put-from-load for the strategies that evict instead of locking.
///
/// The load is refused when the validator saw a removal of the key (or an
/// invalidation of the region) after the loading transaction started, or when
/// the slot already holds newer data.
pub(crate) fn validated_put_from_load(
    core: &RegionCore,
    key: &CacheKey,
    entry: CacheEntry,
    tx_start: Timestamp,
    version: Option<Version>,
    minimal_put: bool,
) -> Result<bool> {
    let kl = core.key_lock(key);
    let _guard = kl.lock();

    let existing = core.read(key)?;
    if minimal_put && existing.is_some() {
        log::debug!("Skipping put of {key}: already cached (minimal puts)");
        return Ok(false);
    }
    if !core.validator().is_put_valid(key, tx_start) {
        log::debug!("Refusing put of {key}: removed after the loading transaction started");
        return Ok(false);
    }
    if matches!(&existing, Some(slot) if !slot.is_writeable(tx_start, version)) {
        log::debug!("Refusing put of {key}: the cached entry is newer");
        return Ok(false);
    }
    core.put_loaded(key, Item::new(entry, version, core.next_timestamp()), tx_start)
}
