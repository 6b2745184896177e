use orm_cache::{
    AccessType, CacheEntry, CacheError, CacheKey, Region, RegionFactory, RegionKind, Version,
};

use std::{
    sync::{Arc, Barrier},
    thread,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn region(factory: &RegionFactory, access_type: AccessType) -> Arc<Region> {
    factory
        .build_domain_region(RegionKind::Entity, "Item", Some(access_type))
        .expect("Failed to build the region")
}

fn entry(name: &str, version: Option<i64>) -> CacheEntry {
    CacheEntry::new(vec![name.into()], version.map(Version))
}

fn cached_name(region: &Region, key: &CacheKey, factory: &RegionFactory) -> Option<String> {
    let tx = factory.begin_transaction();
    let entry = region.get(key, &tx).expect("get failed")?;
    entry.values()[0].as_text().map(str::to_string)
}

#[test]
fn stale_load_cannot_overwrite_a_concurrent_update() -> anyhow::Result<()> {
    init_logger();
    let factory = RegionFactory::builder().build();
    let items = region(&factory, AccessType::ReadWrite);
    let key = CacheKey::new("Item", 1);

    // S1 misses and goes to the database, reading version 1.
    let s1 = factory.begin_transaction();
    assert!(items.get(&key, &s1)?.is_none());

    // Meanwhile S2 updates the row to version 2 and commits.
    let s2 = factory.begin_transaction();
    let lock = items.lock_item(&key, Some(Version(1)), &s2)?;
    items.update(&key, entry("v2", Some(2)), &s2)?;
    s2.complete(true);
    assert!(items.after_update(&key, entry("v2", Some(2)), lock)?);

    // S1 finally tries to cache what it read.
    assert!(!items.put_from_load(&key, entry("v1", Some(1)), &s1, Some(Version(1)), false)?);
    s1.complete(true);

    assert_eq!(cached_name(&items, &key, &factory).as_deref(), Some("v2"));
    Ok(())
}

#[test]
fn rolled_back_update_refuses_older_loads() -> anyhow::Result<()> {
    init_logger();
    let factory = RegionFactory::builder().build();
    let items = region(&factory, AccessType::ReadWrite);
    let key = CacheKey::new("Item", 1);

    let reader = factory.begin_transaction();
    let writer = factory.begin_transaction();
    let lock = items.lock_item(&key, None, &writer)?;
    assert!(lock.is_some());
    writer.complete(false);
    items.unlock_item(&key, lock)?;

    // Started before the rollback: may have read uncommitted state.
    assert!(!items.put_from_load(&key, entry("dirty", None), &reader, None, false)?);

    let later = factory.begin_transaction();
    assert!(items.put_from_load(&key, entry("clean", None), &later, None, false)?);
    assert_eq!(cached_name(&items, &key, &factory).as_deref(), Some("clean"));
    Ok(())
}

#[test]
fn locks_are_released_by_the_region_that_issued_them() -> anyhow::Result<()> {
    let factory = RegionFactory::builder().build();
    let items = region(&factory, AccessType::ReadWrite);
    let others =
        factory.build_domain_region(RegionKind::Entity, "Order", Some(AccessType::ReadWrite))?;
    let key = CacheKey::new("Item", 1);

    let tx = factory.begin_transaction();
    let lock = items.lock_item(&key, None, &tx)?;
    assert!(matches!(
        others.unlock_item(&key, lock),
        Err(CacheError::IllegalLockState { .. })
    ));
    Ok(())
}

#[test]
fn concurrent_writers_share_one_lock() -> anyhow::Result<()> {
    init_logger();
    const WRITERS: usize = 8;

    let factory = Arc::new(RegionFactory::builder().build());
    let items = region(&factory, AccessType::ReadWrite);
    let key = CacheKey::new("Item", 1);
    let locked = Arc::new(Barrier::new(WRITERS + 1));
    let updated = Arc::new(Barrier::new(WRITERS + 1));

    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let (factory, items, key) = (Arc::clone(&factory), Arc::clone(&items), key.clone());
            let (locked, updated) = (Arc::clone(&locked), Arc::clone(&updated));
            thread::spawn(move || {
                let tx = factory.begin_transaction();
                let lock = items.lock_item(&key, None, &tx).expect("lock failed");
                locked.wait();
                updated.wait();
                tx.complete(true);
                items
                    .after_update(&key, entry(&format!("writer {i}"), None), lock)
                    .expect("after_update failed")
            })
        })
        .collect();

    locked.wait();
    // Every writer holds the lock: nobody reads or caches the key.
    let reader = factory.begin_transaction();
    assert!(items.get(&key, &reader)?.is_none());
    assert!(!items.put_from_load(&key, entry("stale", None), &reader, None, false)?);
    updated.wait();

    let published: Vec<bool> = handles
        .into_iter()
        .map(|h| h.join().expect("writer panicked"))
        .collect();
    // None of the overlapping writers knows its state is the last one.
    assert!(published.iter().all(|p| !p));
    assert!(items.get(&key, &factory.begin_transaction())?.is_none());

    let loader = factory.begin_transaction();
    assert!(items.put_from_load(&key, entry("fresh", None), &loader, None, false)?);
    assert_eq!(cached_name(&items, &key, &factory).as_deref(), Some("fresh"));
    Ok(())
}

#[test]
fn nonstrict_updates_evict() -> anyhow::Result<()> {
    init_logger();
    let factory = RegionFactory::builder().build();
    let items = region(&factory, AccessType::NonstrictReadWrite);
    let key = CacheKey::new("Item", 1);

    let loader = factory.begin_transaction();
    assert!(items.put_from_load(&key, entry("v1", Some(1)), &loader, Some(Version(1)), false)?);
    let slow_loader = factory.begin_transaction();

    let writer = factory.begin_transaction();
    items.lock_item(&key, Some(Version(1)), &writer)?;
    items.update(&key, entry("v2", Some(2)), &writer)?;
    writer.complete(true);
    items.after_update(&key, entry("v2", Some(2)), None)?;
    assert_eq!(cached_name(&items, &key, &factory), None);

    // Read before the update, cached after it.
    assert!(!items.put_from_load(
        &key,
        entry("v1", Some(1)),
        &slow_loader,
        Some(Version(1)),
        false
    )?);
    assert_eq!(cached_name(&items, &key, &factory), None);
    Ok(())
}

#[test]
fn transactional_writes_apply_on_commit() -> anyhow::Result<()> {
    init_logger();
    let factory = RegionFactory::builder().build();
    let items = region(&factory, AccessType::Transactional);
    let committed = CacheKey::new("Item", 1);
    let rolled_back = CacheKey::new("Item", 2);

    let tx = factory.begin_transaction();
    assert!(items.insert(&committed, entry("kept", None), &tx)?);
    assert_eq!(cached_name(&items, &committed, &factory), None);
    tx.complete(true);
    assert_eq!(cached_name(&items, &committed, &factory).as_deref(), Some("kept"));

    let tx = factory.begin_transaction();
    items.insert(&rolled_back, entry("dropped", None), &tx)?;
    items.remove(&committed, &tx)?;
    tx.complete(false);
    assert_eq!(cached_name(&items, &rolled_back, &factory), None);
    assert_eq!(cached_name(&items, &committed, &factory).as_deref(), Some("kept"));
    Ok(())
}

#[test]
fn read_only_regions_reject_updates() -> anyhow::Result<()> {
    let factory = RegionFactory::builder().build();
    let countries =
        factory.build_domain_region(RegionKind::Entity, "Country", Some(AccessType::ReadOnly))?;
    let key = CacheKey::new("Country", "CH");

    let tx = factory.begin_transaction();
    assert!(countries.put_from_load(&key, entry("Switzerland", None), &tx, None, false)?);
    assert!(matches!(
        countries.update(&key, entry("Helvetia", None), &tx),
        Err(CacheError::ReadOnlyUpdate { .. })
    ));
    assert_eq!(cached_name(&countries, &key, &factory).as_deref(), Some("Switzerland"));
    Ok(())
}

#[test]
fn minimal_puts_skip_cached_keys() -> anyhow::Result<()> {
    let factory = RegionFactory::builder().use_minimal_puts(true).build();
    let items = region(&factory, AccessType::ReadWrite);
    let key = CacheKey::new("Item", 1);

    let tx = factory.begin_transaction();
    assert!(items.put_from_load(&key, entry("first", None), &tx, None, false)?);
    let tx = factory.begin_transaction();
    assert!(!items.put_from_load(&key, entry("second", None), &tx, None, false)?);
    assert_eq!(cached_name(&items, &key, &factory).as_deref(), Some("first"));
    Ok(())
}
