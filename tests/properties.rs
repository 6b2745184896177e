use orm_cache::{AccessType, CacheEntry, CacheKey, RegionFactory, RegionKind};

use proptest::prelude::*;

fn entry(name: &str) -> CacheEntry {
    CacheEntry::new(vec![name.into()], None)
}

fn unlock_orders() -> impl Strategy<Value = Vec<usize>> {
    (1usize..8).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
}

proptest! {
    #[test]
    fn timestamps_strictly_increase(n in 1usize..2_000) {
        let factory = RegionFactory::builder().build();
        let mut prev = factory.next_timestamp();
        for _ in 0..n {
            let ts = factory.begin_transaction().start_timestamp();
            prop_assert!(ts > prev);
            prev = ts;
        }
    }

    #[test]
    fn key_stays_locked_until_every_locker_released(order in unlock_orders()) {
        let factory = RegionFactory::builder().build();
        let region = factory
            .build_domain_region(RegionKind::Entity, "Item", Some(AccessType::ReadWrite))
            .unwrap();
        let key = CacheKey::new("Item", 42);

        let mut locks: Vec<_> = order
            .iter()
            .map(|_| {
                let tx = factory.begin_transaction();
                Some(region.lock_item(&key, None, &tx).unwrap())
            })
            .collect();

        let (last, rest) = order.split_last().unwrap();
        for &i in rest {
            region.unlock_item(&key, locks[i].take().flatten()).unwrap();
            let tx = factory.begin_transaction();
            prop_assert!(region.get(&key, &tx).unwrap().is_none());
            prop_assert!(!region.put_from_load(&key, entry("early"), &tx, None, false).unwrap());
        }

        let before_release = factory.begin_transaction();
        region.unlock_item(&key, locks[*last].take().flatten()).unwrap();
        prop_assert!(!region
            .put_from_load(&key, entry("stale"), &before_release, None, false)
            .unwrap());

        let after_release = factory.begin_transaction();
        prop_assert!(region
            .put_from_load(&key, entry("fresh"), &after_release, None, false)
            .unwrap());
        let reader = factory.begin_transaction();
        prop_assert_eq!(region.get(&key, &reader).unwrap(), Some(entry("fresh")));
    }
}
