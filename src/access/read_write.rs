use std::sync::Arc;

use super::{
    soft_lock::{Item, Lockable, SoftLockState},
    DataAccess, SoftLock,
};
use crate::{
    entry::{CacheEntry, Version},
    key::CacheKey,
    region::RegionCore,
    transaction::CacheTransaction,
    CacheError, Result,
};

/// Soft-locking strategy.
///
/// An update locks the slot before the database write; the lock makes the
/// key unreadable and refuses loads until the writing transaction publishes
/// its state in `after_update` or releases the lock. Every read-modify-write
/// of a slot runs under the region's per-key mutex, so overlapping lockers
/// share one lock record and count themselves in its multiplicity.
pub(crate) struct ReadWriteAccess;

impl ReadWriteAccess {
    fn check_issuer(core: &RegionCore, key: &CacheKey, lock: Option<&SoftLock>) -> Result<()> {
        match lock {
            Some(lock) if lock.issuer() != core.uuid() => Err(CacheError::IllegalLockState {
                region: core.name().to_string(),
                message: format!("soft lock on {key} was issued by another region"),
            }),
            _ => Ok(()),
        }
    }

    fn released_twice(core: &RegionCore, key: &CacheKey) -> CacheError {
        CacheError::IllegalLockState {
            region: core.name().to_string(),
            message: format!("soft lock on {key} was already released"),
        }
    }

    /// The lock was lost (evicted, expired and replaced) while the write was
    /// in flight. The slot is blocked with a released lock so that loads of
    /// transactions older than the write cannot cache stale state until the
    /// lock timeout passes.
    fn handle_lock_expiry(core: &RegionCore, key: &CacheKey) -> Result<()> {
        log::warn!(
            "Cache {key} in region `{}` soft-locked with a lock that has expired or was lost",
            core.name()
        );
        let ts = core.next_timestamp() + core.lock_timeout_span();
        let lock = SoftLockState::released_at(core.uuid(), core.next_lock_id(), ts);
        core.put_lock(key.clone(), lock)?;
        Ok(())
    }

    fn remove_expired_lock(core: &RegionCore, key: &CacheKey) -> Result<()> {
        let kl = core.key_lock(key);
        let _guard = kl.lock();
        if let Some(Lockable::Lock(lock)) = core.read(key)? {
            if lock.is_expired(core.next_timestamp()) {
                log::debug!("Removing expired soft lock on {key} in region `{}`", core.name());
                core.discard(key)?;
            }
        }
        Ok(())
    }
}

impl DataAccess for ReadWriteAccess {
    fn get(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        tx: &CacheTransaction,
    ) -> Result<Option<CacheEntry>> {
        match core.read(key)? {
            Some(Lockable::Item(item)) if item.is_readable(tx.start_timestamp()) => {
                Ok(Some(item.value))
            }
            Some(Lockable::Lock(lock)) if lock.is_expired(core.next_timestamp()) => {
                Self::remove_expired_lock(core, key)?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn put_from_load(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        entry: CacheEntry,
        tx: &CacheTransaction,
        version: Option<Version>,
        minimal_put: bool,
    ) -> Result<bool> {
        let kl = core.key_lock(key);
        let _guard = kl.lock();

        if !core.validator().is_put_valid(key, tx.start_timestamp()) {
            log::debug!("Refusing put of {key}: evicted after the loading transaction started");
            return Ok(false);
        }
        match core.read(key)? {
            Some(Lockable::Item(_)) if minimal_put => {
                log::debug!("Skipping put of {key}: already cached (minimal puts)");
                Ok(false)
            }
            Some(slot) if !slot.is_writeable(tx.start_timestamp(), version) => {
                log::debug!("Refusing put of {key}: locked or newer in the cache");
                Ok(false)
            }
            _ => {
                let item = Item::new(entry, version, core.next_timestamp());
                core.put_loaded(key, item, tx.start_timestamp())
            }
        }
    }

    fn lock_item(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        version: Option<Version>,
        _tx: &CacheTransaction,
    ) -> Result<Option<SoftLock>> {
        let kl = core.key_lock(key);
        let _guard = kl.lock();

        let now = core.next_timestamp();
        let timeout = now + core.lock_timeout_span();
        let lock = match core.read(key)? {
            Some(Lockable::Lock(mut lock)) if !lock.is_expired(now) => {
                lock.relock(timeout);
                lock
            }
            _ => SoftLockState::new(core.uuid(), core.next_lock_id(), version, timeout),
        };
        let handle = lock.handle(core.uuid());
        if !core.put_lock(key.clone(), lock)? {
            // Without the lock in place the old entry must not stay readable.
            core.discard(key)?;
        }
        log::debug!("Soft-locked {key} in region `{}`", core.name());
        Ok(Some(handle))
    }

    fn unlock_item(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        lock: Option<SoftLock>,
    ) -> Result<()> {
        Self::check_issuer(core, key, lock.as_ref())?;
        let kl = core.key_lock(key);
        let _guard = kl.lock();

        match (core.read(key)?, lock) {
            (Some(Lockable::Lock(mut state)), Some(lock)) if state.is_unlockable(&lock) => {
                if !state.unlock(core.next_timestamp()) {
                    return Err(Self::released_twice(core, key));
                }
                core.put_lock(key.clone(), state)?;
                Ok(())
            }
            _ => Self::handle_lock_expiry(core, key),
        }
    }

    fn after_insert(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        entry: CacheEntry,
    ) -> Result<bool> {
        let kl = core.key_lock(key);
        let _guard = kl.lock();

        if core.read(key)?.is_some() {
            return Ok(false);
        }
        let version = entry.version();
        core.put_item(key.clone(), Item::new(entry, version, core.next_timestamp()))
    }

    fn update(
        &self,
        _core: &Arc<RegionCore>,
        _key: &CacheKey,
        _entry: CacheEntry,
        _tx: &CacheTransaction,
    ) -> Result<bool> {
        Ok(false)
    }

    fn after_update(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        entry: CacheEntry,
        lock: Option<SoftLock>,
    ) -> Result<bool> {
        Self::check_issuer(core, key, lock.as_ref())?;
        let kl = core.key_lock(key);
        let _guard = kl.lock();

        match (core.read(key)?, lock) {
            (Some(Lockable::Lock(mut state)), Some(lock)) if state.is_unlockable(&lock) => {
                if state.multiplicity() == 0 {
                    return Err(Self::released_twice(core, key));
                }
                if state.was_locked_concurrently() {
                    // Another writer still holds the lock; the state it
                    // publishes may differ from ours.
                    state.unlock(core.next_timestamp());
                    core.put_lock(key.clone(), state)?;
                    Ok(false)
                } else {
                    let version = entry.version();
                    core.put_item(key.clone(), Item::new(entry, version, core.next_timestamp()))
                }
            }
            _ => {
                Self::handle_lock_expiry(core, key)?;
                Ok(false)
            }
        }
    }

    fn remove(&self, core: &Arc<RegionCore>, key: &CacheKey, _tx: &CacheTransaction) -> Result<()> {
        let kl = core.key_lock(key);
        let _guard = kl.lock();

        // A locked slot is released by the unlock that follows the removal.
        match core.read(key)? {
            Some(Lockable::Lock(_)) => Ok(()),
            _ => core.discard(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        access::{soft_lock::Lockable, AccessType},
        entry::{CacheEntry, Version},
        key::CacheKey,
        region::test_support::TestRegion,
        storage::LocalStorage,
        CacheError,
    };

    use std::{
        sync::{Arc, Barrier},
        thread,
        time::Duration,
    };

    fn entry(name: &str, version: i64) -> CacheEntry {
        CacheEntry::new(vec![name.into()], Some(Version(version)))
    }

    fn cached(t: &TestRegion, key: &CacheKey, name: &str, version: i64) {
        let tx = t.begin();
        assert!(t
            .region
            .put_from_load(key, entry(name, version), &tx, Some(Version(version)), false)
            .unwrap());
    }

    #[test]
    fn entries_are_visible_to_later_transactions_only() {
        let t = TestRegion::new(AccessType::ReadWrite);
        let key = CacheKey::new("Item", 1);
        let early = t.begin();
        cached(&t, &key, "widget", 1);

        assert_eq!(t.region.get(&key, &early).unwrap(), None);
        let late = t.begin();
        assert_eq!(t.region.get(&key, &late).unwrap(), Some(entry("widget", 1)));
    }

    #[test]
    fn locked_entries_are_never_read() {
        let t = TestRegion::new(AccessType::ReadWrite);
        let region = &t.region;
        let key = CacheKey::new("Item", 1);
        cached(&t, &key, "widget", 1);

        let reader = t.begin();
        let writer = t.begin();
        let lock = region.lock_item(&key, Some(Version(1)), &writer).unwrap();
        assert!(lock.is_some());
        assert!(!region.update(&key, entry("gadget", 2), &writer).unwrap());

        assert_eq!(region.get(&key, &reader).unwrap(), None);
        assert_eq!(region.get(&key, &t.begin()).unwrap(), None);
        // Nor can anybody cache the old row meanwhile.
        assert!(!region
            .put_from_load(&key, entry("widget", 1), &reader, Some(Version(1)), false)
            .unwrap());

        assert!(region.after_update(&key, entry("gadget", 2), lock).unwrap());
        assert_eq!(region.get(&key, &reader).unwrap(), None);
        assert_eq!(region.get(&key, &t.begin()).unwrap(), Some(entry("gadget", 2)));
    }

    #[test]
    fn concurrent_lockers_share_one_lock() {
        let t = TestRegion::new(AccessType::ReadWrite);
        let region = &t.region;
        let key = CacheKey::new("Item", 1);
        cached(&t, &key, "widget", 1);

        let tx1 = t.begin();
        let tx2 = t.begin();
        let lock1 = region.lock_item(&key, Some(Version(1)), &tx1).unwrap();
        let lock2 = region.lock_item(&key, Some(Version(1)), &tx2).unwrap();
        assert_eq!(lock1, lock2);

        // The first writer to finish cannot publish: the other one may
        // commit different state.
        assert!(!region.after_update(&key, entry("gadget", 2), lock1).unwrap());
        assert_eq!(region.get(&key, &t.begin()).unwrap(), None);

        region.unlock_item(&key, lock2).unwrap();
        assert_eq!(region.get(&key, &t.begin()).unwrap(), None);

        // Loads by transactions started after the release are admitted.
        let reader = t.begin();
        assert!(region
            .put_from_load(&key, entry("gizmo", 3), &reader, Some(Version(3)), false)
            .unwrap());
    }

    #[test]
    fn rollback_releases_the_lock() {
        let t = TestRegion::new(AccessType::ReadWrite);
        let region = &t.region;
        let key = CacheKey::new("Item", 1);
        cached(&t, &key, "widget", 1);

        let old_reader = t.begin();
        let writer = t.begin();
        let lock = region.lock_item(&key, Some(Version(1)), &writer).unwrap();
        region.unlock_item(&key, lock).unwrap();

        assert!(!region
            .put_from_load(&key, entry("widget", 1), &old_reader, None, false)
            .unwrap());
        let reader = t.begin();
        assert!(region
            .put_from_load(&key, entry("widget", 1), &reader, None, false)
            .unwrap());
        assert_eq!(region.get(&key, &t.begin()).unwrap(), Some(entry("widget", 1)));
    }

    #[test]
    fn remove_keeps_the_lock_until_unlock() {
        let t = TestRegion::new(AccessType::ReadWrite);
        let region = &t.region;
        let key = CacheKey::new("Item", 1);
        cached(&t, &key, "widget", 1);

        let writer = t.begin();
        let lock = region.lock_item(&key, Some(Version(1)), &writer).unwrap();
        region.remove(&key, &writer).unwrap();
        assert!(!region
            .put_from_load(&key, entry("widget", 1), &t.begin(), None, false)
            .unwrap());
        region.unlock_item(&key, lock).unwrap();
        assert_eq!(region.get(&key, &t.begin()).unwrap(), None);

        // Without a lock the slot is simply removed.
        cached(&t, &key, "gadget", 2);
        region.remove(&key, &t.begin()).unwrap();
        assert!(!region.contains(&key));
    }

    #[test]
    fn double_unlock_is_illegal() {
        let t = TestRegion::new(AccessType::ReadWrite);
        let region = &t.region;
        let key = CacheKey::new("Item", 1);
        let writer = t.begin();

        let lock = region.lock_item(&key, None, &writer).unwrap().unwrap();
        let copy = lock.clone();
        region.unlock_item(&key, Some(lock)).unwrap();
        let err = region.unlock_item(&key, Some(copy)).unwrap_err();
        assert!(matches!(err, CacheError::IllegalLockState { .. }));
        assert!(!err.is_recoverable());

        // Relocking the released lock makes it a concurrent lock.
        let lock = region.lock_item(&key, None, &writer).unwrap().unwrap();
        let copy = lock.clone();
        assert!(!region.after_update(&key, entry("x", 1), Some(lock)).unwrap());
        assert!(matches!(
            region.after_update(&key, entry("x", 1), Some(copy)),
            Err(CacheError::IllegalLockState { .. })
        ));
    }

    #[test]
    fn locks_from_other_regions_are_rejected() {
        let a = TestRegion::new(AccessType::ReadWrite);
        let b = TestRegion::new(AccessType::ReadWrite);
        let key = CacheKey::new("Item", 1);

        let lock = a.region.lock_item(&key, None, &a.begin()).unwrap();
        let err = b.region.unlock_item(&key, lock).unwrap_err();
        assert!(matches!(err, CacheError::IllegalLockState { .. }));
    }

    #[test]
    fn lost_lock_blocks_the_key_until_the_timeout() {
        let t = TestRegion::new(AccessType::ReadWrite);
        let region = &t.region;
        let key = CacheKey::new("Item", 1);
        cached(&t, &key, "widget", 1);

        let writer = t.begin();
        let lock = region.lock_item(&key, Some(Version(1)), &writer).unwrap();
        // Somebody clears the region while the write is in flight.
        region.evict_all().unwrap();

        assert!(!region.after_update(&key, entry("gadget", 2), lock).unwrap());
        assert!(!region
            .put_from_load(&key, entry("gadget", 2), &t.begin(), Some(Version(2)), false)
            .unwrap());

        t.advance(Duration::from_secs(61));
        assert!(region
            .put_from_load(&key, entry("gadget", 2), &t.begin(), Some(Version(2)), false)
            .unwrap());
    }

    #[test]
    fn evicting_a_locked_key_keeps_the_lock() {
        let t = TestRegion::new(AccessType::ReadWrite);
        let region = &t.region;
        let key = CacheKey::new("Item", 1);
        cached(&t, &key, "widget", 1);

        let writer = t.begin();
        let lock = region.lock_item(&key, Some(Version(1)), &writer).unwrap();
        region.evict(&key).unwrap();
        assert_eq!(region.element_count_in_memory(), 1);

        // A load that read the old row after the eviction is still refused.
        assert!(!region
            .put_from_load(&key, entry("widget", 1), &t.begin(), Some(Version(1)), false)
            .unwrap());
        assert!(region.after_update(&key, entry("gadget", 2), lock).unwrap());
        assert_eq!(region.get(&key, &t.begin()).unwrap(), Some(entry("gadget", 2)));
    }

    #[test]
    fn bounded_regions_keep_locks_over_their_bound() {
        let t = TestRegion::with_storage(AccessType::ReadWrite, |clock| {
            Arc::new(
                LocalStorage::builder("item")
                    .num_segments(1)
                    .max_entries(1)
                    .pinned(|v: &Lockable| matches!(v, Lockable::Lock(_)))
                    .clock(clock)
                    .build(),
            )
        });
        let region = &t.region;
        let a = CacheKey::new("Item", 1);
        let b = CacheKey::new("Item", 2);
        cached(&t, &a, "widget", 1);

        let writer = t.begin();
        let lock = region.lock_item(&a, Some(Version(1)), &writer).unwrap();
        // Caching another key pushes the region over its bound.
        cached(&t, &b, "gadget", 1);

        assert!(!region
            .put_from_load(&a, entry("widget", 1), &t.begin(), Some(Version(1)), false)
            .unwrap());
        assert_eq!(region.get(&a, &t.begin()).unwrap(), None);

        assert!(region.after_update(&a, entry("widget", 2), lock).unwrap());
        assert_eq!(region.get(&a, &t.begin()).unwrap(), Some(entry("widget", 2)));
    }

    #[test]
    fn expired_lock_reads_as_a_miss_and_is_removed() {
        let t = TestRegion::new(AccessType::ReadWrite);
        let region = &t.region;
        let key = CacheKey::new("Item", 1);
        cached(&t, &key, "widget", 1);

        // Locked at t=0 by a session that never comes back.
        let crashed = t.begin();
        let _lock = region.lock_item(&key, Some(Version(1)), &crashed).unwrap();

        t.advance(Duration::from_secs(30));
        assert_eq!(region.get(&key, &t.begin()).unwrap(), None);
        assert_eq!(region.element_count_in_memory(), 1);

        t.advance(Duration::from_secs(31));
        assert_eq!(region.get(&key, &t.begin()).unwrap(), None);
        assert_eq!(region.element_count_in_memory(), 0);

        let reader = t.begin();
        assert!(region
            .put_from_load(&key, entry("widget", 1), &reader, Some(Version(1)), false)
            .unwrap());
        assert_eq!(region.get(&key, &t.begin()).unwrap(), Some(entry("widget", 1)));
    }

    #[test]
    fn relocking_an_expired_lock_starts_afresh() {
        let t = TestRegion::new(AccessType::ReadWrite);
        let region = &t.region;
        let key = CacheKey::new("Item", 1);

        let crashed = region.lock_item(&key, None, &t.begin()).unwrap();
        t.advance(Duration::from_secs(61));
        let lock = region.lock_item(&key, None, &t.begin()).unwrap();
        assert_ne!(crashed, lock);

        // Not locked concurrently, so the update is published.
        assert!(region.after_update(&key, entry("gadget", 2), lock).unwrap());
    }

    #[test]
    fn lockers_on_many_threads_share_one_lock() {
        let t = Arc::new(TestRegion::new(AccessType::ReadWrite));
        let key = CacheKey::new("Item", 1);
        let num_threads = 8;
        let barrier = Arc::new(Barrier::new(num_threads));

        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let t = Arc::clone(&t);
                let key = key.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let tx = t.begin();
                    let lock = t.region.lock_item(&key, None, &tx).unwrap().unwrap();
                    barrier.wait();
                    lock
                })
            })
            .collect();

        let locks: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("Thread failed"))
            .collect();
        assert!(locks.windows(2).all(|w| w[0] == w[1]));

        // Only the release of the last holder makes the key cacheable again.
        let mut locks = locks.into_iter();
        for lock in locks.by_ref().take(num_threads - 1) {
            t.region.unlock_item(&key, Some(lock)).unwrap();
            assert!(!t
                .region
                .put_from_load(&key, entry("widget", 1), &t.begin(), None, false)
                .unwrap());
        }
        t.region.unlock_item(&key, locks.next()).unwrap();
        assert!(t
            .region
            .put_from_load(&key, entry("widget", 1), &t.begin(), None, false)
            .unwrap());
    }
}
