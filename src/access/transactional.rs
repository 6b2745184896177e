use std::sync::Arc;

use super::{cached_value, soft_lock::Item, validated_put_from_load, DataAccess, SoftLock};
use crate::{
    entry::{CacheEntry, Version},
    key::CacheKey,
    region::RegionCore,
    transaction::CacheTransaction,
    Result,
};

/// Writes are staged in the [`CacheTransaction`] and applied only when it
/// commits, so the cache changes together with the database. Nothing is
/// applied on rollback.
pub(crate) struct TransactionalAccess;

impl TransactionalAccess {
    fn stage_put(
        core: &Arc<RegionCore>,
        key: &CacheKey,
        entry: CacheEntry,
        tx: &CacheTransaction,
    ) {
        let core = Arc::clone(core);
        let key = key.clone();
        tx.register_synchronization(move |success: bool| {
            if !success {
                log::debug!("Discarding staged put of {key} in region `{}`", core.name());
                return;
            }
            let kl = core.key_lock(&key);
            let _guard = kl.lock();
            let version = entry.version();
            let item = Item::new(entry, version, core.next_timestamp());
            if let Err(e) = core.put_item(key.clone(), item) {
                log::warn!(
                    "Applying staged put of {key} in region `{}` failed: {e}",
                    core.name()
                );
            }
        });
    }
}

impl DataAccess for TransactionalAccess {
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
        _core: &Arc<RegionCore>,
        _key: &CacheKey,
        _lock: Option<SoftLock>,
    ) -> Result<()> {
        Ok(())
    }

    fn insert(
        &self,
        core: &Arc<RegionCore>,
        key: &CacheKey,
        entry: CacheEntry,
        tx: &CacheTransaction,
    ) -> Result<bool> {
        Self::stage_put(core, key, entry, tx);
        Ok(true)
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
        entry: CacheEntry,
        tx: &CacheTransaction,
    ) -> Result<bool> {
        Self::stage_put(core, key, entry, tx);
        Ok(true)
    }

    fn after_update(
        &self,
        _core: &Arc<RegionCore>,
        _key: &CacheKey,
        _entry: CacheEntry,
        _lock: Option<SoftLock>,
    ) -> Result<bool> {
        Ok(false)
    }

    fn remove(&self, core: &Arc<RegionCore>, key: &CacheKey, tx: &CacheTransaction) -> Result<()> {
        let core = Arc::clone(core);
        let key = key.clone();
        tx.register_synchronization(move |success: bool| {
            if success {
                if let Err(e) = core.evict_key(&key) {
                    log::warn!(
                        "Applying staged removal of {key} in region `{}` failed: {e}",
                        core.name()
                    );
                }
            }
        });
        Ok(())
    }
}
