use std::sync::Arc;

use super::{
    cached_value,
    soft_lock::{Item, Lockable},
    DataAccess, SoftLock,
};
use crate::{
    entry::{CacheEntry, Version},
    key::CacheKey,
    region::RegionCore,
    transaction::CacheTransaction,
    CacheError, Result,
};

/// For data that never changes once written. Cached entries are never
/// replaced; updating one is an error.
pub(crate) struct ReadOnlyAccess;

impl ReadOnlyAccess {
    fn update_error(core: &RegionCore, key: &CacheKey) -> CacheError {
        log::debug!("Rejecting update of {key} in read-only region `{}`", core.name());
        CacheError::ReadOnlyUpdate {
            region: core.name().to_string(),
        }
    }
}

impl DataAccess for ReadOnlyAccess {
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
        _minimal_put: bool,
    ) -> Result<bool> {
        let kl = core.key_lock(key);
        let _guard = kl.lock();

        if core.read(key)?.is_some() {
            return Ok(false);
        }
        if !core.validator().is_put_valid(key, tx.start_timestamp()) {
            log::debug!("Refusing put of {key}: removed after the loading transaction started");
            return Ok(false);
        }
        let item = Item::new(entry, version, core.next_timestamp());
        core.put_loaded(key, item, tx.start_timestamp())
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
        core: &Arc<RegionCore>,
        key: &CacheKey,
        entry: CacheEntry,
    ) -> Result<bool> {
        let kl = core.key_lock(key);
        let _guard = kl.lock();

        if matches!(core.read(key)?, Some(Lockable::Item(_))) {
            return Ok(false);
        }
        let version = entry.version();
        core.put_item(key.clone(), Item::new(entry, version, core.next_timestamp()))
    }

    fn update(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        _entry: CacheEntry,
        _tx: &CacheTransaction,
    ) -> Result<bool> {
        Err(Self::update_error(core, key))
    }

    fn after_update(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        _entry: CacheEntry,
        _lock: Option<SoftLock>,
    ) -> Result<bool> {
        Err(Self::update_error(core, key))
    }

    fn remove(&self, core: &Arc<RegionCore>, key: &CacheKey, _tx: &CacheTransaction) -> Result<()> {
        core.evict_key(key)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        access::AccessType, entry::CacheEntry, key::CacheKey, region::test_support::TestRegion,
        CacheError,
    };

    fn entry(name: &str) -> CacheEntry {
        CacheEntry::new(vec![name.into()], None)
    }

    #[test]
    fn first_put_wins() {
        let t = TestRegion::new(AccessType::ReadOnly);
        let region = &t.region;
        let key = CacheKey::new("Country", "NZ");

        let tx = t.begin();
        assert_eq!(region.get(&key, &tx).unwrap(), None);
        assert!(region.put_from_load(&key, entry("New Zealand"), &tx, None, false).unwrap());
        assert!(!region.put_from_load(&key, entry("Aotearoa"), &tx, None, false).unwrap());
        // Read-only data is visible to the transaction that cached it.
        assert_eq!(region.get(&key, &tx).unwrap(), Some(entry("New Zealand")));
    }

    #[test]
    fn updates_are_rejected() {
        let t = TestRegion::new(AccessType::ReadOnly);
        let region = &t.region;
        let key = CacheKey::new("Country", "NZ");
        let tx = t.begin();

        assert!(region.lock_item(&key, None, &tx).unwrap().is_none());
        assert!(matches!(
            region.update(&key, entry("x"), &tx),
            Err(CacheError::ReadOnlyUpdate { region }) if region == "item"
        ));
        let err = region.after_update(&key, entry("x"), None).unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn insert_then_remove() {
        let t = TestRegion::new(AccessType::ReadOnly);
        let region = &t.region;
        let key = CacheKey::new("Country", "NZ");

        let tx = t.begin();
        assert!(!region.insert(&key, entry("New Zealand"), &tx).unwrap());
        assert!(region.after_insert(&key, entry("New Zealand")).unwrap());
        assert!(!region.after_insert(&key, entry("Aotearoa")).unwrap());
        assert!(region.contains(&key));

        region.remove(&key, &tx).unwrap();
        assert!(!region.contains(&key));
        // The removing transaction cannot put the row back.
        assert!(!region.put_from_load(&key, entry("New Zealand"), &tx, None, false).unwrap());
    }
}
