use std::{
    collections::{hash_map::RandomState, HashMap},
    hash::{BuildHasher, Hash, Hasher},
};

use parking_lot::{Mutex, MutexGuard};
use triomphe::Arc as TrioArc;

const LOCK_MAP_NUM_SEGMENTS: usize = 64;

type Segment<K> = Mutex<HashMap<K, TrioArc<Mutex<()>>>>;

/// A per-key lock. The entry in the lock map is dropped together with the last
/// `KeyLock` referring to it.
pub(crate) struct KeyLock<'a, K>
where
    K: Eq + Hash,
{
    segment: &'a Segment<K>,
    key: K,
    lock: TrioArc<Mutex<()>>,
}

impl<'a, K> Drop for KeyLock<'a, K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if TrioArc::count(&self.lock) <= 2 {
            let mut segment = self.segment.lock();
            // Re-check under the segment lock; another thread may have cloned
            // the lock in the meantime.
            if matches!(segment.get(&self.key), Some(v) if TrioArc::count(v) <= 2) {
                segment.remove(&self.key);
            }
        }
    }
}

impl<'a, K> KeyLock<'a, K>
where
    K: Eq + Hash,
{
    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }
}

/// Serializes read-modify-write sequences on a single cache key without taking
/// a region-wide lock.
pub(crate) struct KeyLockMap<K, S = RandomState> {
    segments: Box<[Segment<K>]>,
    build_hasher: S,
}

impl<K> Default for KeyLockMap<K, RandomState>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::with_hasher(RandomState::default())
    }
}

impl<K, S> KeyLockMap<K, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher,
{
    pub(crate) fn with_hasher(build_hasher: S) -> Self {
        let segments = std::iter::repeat_with(Default::default)
            .take(LOCK_MAP_NUM_SEGMENTS)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            segments,
            build_hasher,
        }
    }

    pub(crate) fn key_lock(&self, key: &K) -> KeyLock<'_, K> {
        let segment = &self.segments[self.segment_index(key)];
        let lock = TrioArc::clone(
            segment
                .lock()
                .entry(key.clone())
                .or_insert_with(|| TrioArc::new(Mutex::new(()))),
        );
        KeyLock {
            segment,
            key: key.clone(),
            lock,
        }
    }

    #[inline]
    fn segment_index(&self, key: &K) -> usize {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.segments.len()
    }
}

#[cfg(test)]
impl<K, S> KeyLockMap<K, S> {
    pub(crate) fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.lock().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::KeyLockMap;

    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    #[test]
    fn entries_are_removed_with_the_last_guard() {
        let map = KeyLockMap::<String>::default();
        {
            let kl1 = map.key_lock(&"a".to_string());
            let kl2 = map.key_lock(&"a".to_string());
            let _g = kl1.lock();
            drop(kl2);
            assert!(!map.is_empty());
        }
        assert!(map.is_empty());
    }

    #[test]
    fn excludes_concurrent_holders_of_the_same_key() {
        let map = Arc::new(KeyLockMap::<u32>::default());
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = Arc::clone(&map);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let kl = map.key_lock(&7);
                        let _guard = kl.lock();
                        assert_eq!(inside.fetch_add(1, Ordering::AcqRel), 0);
                        inside.fetch_sub(1, Ordering::AcqRel);
                    }
                })
            })
            .collect();

        handles
            .into_iter()
            .for_each(|h| h.join().expect("Thread failed"));
        assert!(map.is_empty());
    }
}
