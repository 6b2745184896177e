use std::sync::Arc;

use super::{cached_value, validated_put_from_load, DataAccess, SoftLock};
use crate::{
    entry::{CacheEntry, Version},
    key::CacheKey,
    region::RegionCore,
    transaction::CacheTransaction,
    Result,
};

/// Writes evict the cached entry; nothing is locked. Another session may read
/// the old state until the eviction happens.
pub(crate) struct NonstrictReadWriteAccess;

impl DataAccess for NonstrictReadWriteAccess {
    fn get(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        _tx: &CacheTransaction,
    ) -> Result<Option<CacheEntry>> {
        Ok(cached_value(core.read(key)?))
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
        validated_put_from_load(core, key, entry, tx.start_timestamp(), version, minimal_put)
    }

    fn lock_item(
        &self,
        _core: &Arc<RegionCore>,
        _key: &CacheKey,
        _version: Option<Version>,
        _tx: &CacheTransaction,
    ) -> Result<Option<SoftLock>> {
        Ok(None)
    }

    fn unlock_item(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        _lock: Option<SoftLock>,
    ) -> Result<()> {
        core.evict_key(key)
    }

    fn after_insert(
        &self,
        _core: &Arc<RegionCore>,
        _key: &CacheKey,
        _entry: CacheEntry,
    ) -> Result<bool> {
        Ok(false)
    }

    fn update(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        _entry: CacheEntry,
        _tx: &CacheTransaction,
    ) -> Result<bool> {
        core.evict_key(key)?;
        Ok(false)
    }

    fn after_update(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        _entry: CacheEntry,
        _lock: Option<SoftLock>,
    ) -> Result<bool> {
        core.evict_key(key)?;
        Ok(false)
    }

    fn remove(&self, core: &Arc<RegionCore>, key: &CacheKey, _tx: &CacheTransaction) -> Result<()> {
        core.evict_key(key)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        access::AccessType,
        entry::{CacheEntry, Version},
        key::CacheKey,
        region::test_support::TestRegion,
    };

    fn entry(name: &str, version: i64) -> CacheEntry {
        CacheEntry::new(vec![name.into()], Some(Version(version)))
    }

    #[test]
    fn update_evicts() {
        let t = TestRegion::new(AccessType::NonstrictReadWrite);
        let region = &t.region;
        let key = CacheKey::new("Item", 1);

        let tx = t.begin();
        assert!(region
            .put_from_load(&key, entry("widget", 1), &tx, Some(Version(1)), false)
            .unwrap());
        assert_eq!(region.get(&key, &tx).unwrap(), Some(entry("widget", 1)));

        let writer = t.begin();
        assert!(region.lock_item(&key, Some(Version(1)), &writer).unwrap().is_none());
        assert!(!region.update(&key, entry("gadget", 2), &writer).unwrap());
        assert_eq!(region.get(&key, &tx).unwrap(), None);
        assert!(!region.after_update(&key, entry("gadget", 2), None).unwrap());
        assert_eq!(region.get(&key, &tx).unwrap(), None);
    }

    #[test]
    fn late_stale_load_does_not_clobber_a_newer_write() {
        let t = TestRegion::new(AccessType::NonstrictReadWrite);
        let region = &t.region;
        let key = CacheKey::new("Item", 1);

        // The reader loads version 1 from the database, then stalls.
        let reader = t.begin();

        let writer = t.begin();
        region.update(&key, entry("gadget", 2), &writer).unwrap();
        region.after_update(&key, entry("gadget", 2), None).unwrap();

        // The stale load arrives after the write and is refused.
        assert!(!region
            .put_from_load(&key, entry("widget", 1), &reader, Some(Version(1)), false)
            .unwrap());
        assert!(!region.contains(&key));

        let fresh = t.begin();
        assert!(region
            .put_from_load(&key, entry("gadget", 2), &fresh, Some(Version(2)), false)
            .unwrap());
    }

    #[test]
    fn newer_versions_win() {
        let t = TestRegion::new(AccessType::NonstrictReadWrite);
        let region = &t.region;
        let key = CacheKey::new("Item", 1);
        let old = t.begin();
        let new = t.begin();

        assert!(region
            .put_from_load(&key, entry("gadget", 2), &new, Some(Version(2)), false)
            .unwrap());
        assert!(!region
            .put_from_load(&key, entry("widget", 1), &old, Some(Version(1)), false)
            .unwrap());
        assert!(region
            .put_from_load(&key, entry("gizmo", 3), &old, Some(Version(3)), false)
            .unwrap());
        assert_eq!(region.get(&key, &new).unwrap(), Some(entry("gizmo", 3)));
    }

    #[test]
    fn minimal_puts_skip_cached_keys() {
        let t = TestRegion::new(AccessType::NonstrictReadWrite);
        let region = &t.region;
        let key = CacheKey::new("Item", 1);

        let tx = t.begin();
        assert!(region.put_from_load(&key, entry("widget", 1), &tx, None, true).unwrap());
        let tx = t.begin();
        assert!(!region.put_from_load(&key, entry("widget", 1), &tx, None, true).unwrap());
        assert!(region.put_from_load(&key, entry("widget", 1), &tx, None, false).unwrap());
    }

    #[test]
    fn insert_does_not_cache() {
        let t = TestRegion::new(AccessType::NonstrictReadWrite);
        let region = &t.region;
        let key = CacheKey::new("Item", 1);
        let tx = t.begin();

        assert!(!region.insert(&key, entry("widget", 1), &tx).unwrap());
        assert!(!region.after_insert(&key, entry("widget", 1)).unwrap());
        assert!(!region.contains(&key));
    }
}
