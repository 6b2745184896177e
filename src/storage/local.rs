use std::{
    collections::{hash_map::RandomState, HashMap, VecDeque},
    hash::{BuildHasher, Hash, Hasher},
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::RwLock;

use super::{EvictionListener, Pinned, RemovalCause, StorageAccess, Weigher};
use crate::{
    common::time::{Clock, Instant},
    Result,
};

const DEFAULT_NUM_SEGMENTS: usize = 16;

/// Builds a [`LocalStorage`](./struct.LocalStorage.html).
///
/// # Examples
///
/// ```rust
/// use orm_cache::storage::{LocalStorage, StorageAccess};
/// use std::time::Duration;
///
/// let storage: LocalStorage<u32, String> = LocalStorage::builder("item")
///     // Up to 10,000 entries.
///     .max_entries(10_000)
///     // Entries expire 30 minutes after they were written.
///     .time_to_live(Duration::from_secs(30 * 60))
///     .build();
///
/// storage.put(1, "one".to_string()).unwrap();
/// assert_eq!(storage.get(&1).unwrap(), Some("one".to_string()));
/// ```
pub struct LocalStorageBuilder<K, V> {
    name: String,
    max_entries: Option<u64>,
    time_to_live: Option<Duration>,
    num_segments: usize,
    weigher: Option<Weigher<K, V>>,
    pinned: Option<Pinned<V>>,
    eviction_listener: Option<EvictionListener<K>>,
    clock: Option<Clock>,
    storage_type: PhantomData<(K, V)>,
}

impl<K, V> LocalStorageBuilder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_entries: None,
            time_to_live: None,
            num_segments: DEFAULT_NUM_SEGMENTS,
            weigher: None,
            pinned: None,
            eviction_listener: None,
            clock: None,
            storage_type: PhantomData,
        }
    }

    /// Bounds the number of entries. The bound is enforced per internal
    /// segment, so it is approximate.
    pub fn max_entries(self, max_entries: u64) -> Self {
        Self {
            max_entries: Some(max_entries.max(1)),
            ..self
        }
    }

    /// An entry expires after the given duration past from its last `put`.
    pub fn time_to_live(self, duration: Duration) -> Self {
        Self {
            time_to_live: Some(duration),
            ..self
        }
    }

    pub fn num_segments(self, num_segments: usize) -> Self {
        Self {
            num_segments: num_segments.max(1),
            ..self
        }
    }

    pub fn weigher(self, weigher: impl Fn(&K, &V) -> u32 + Send + Sync + 'static) -> Self {
        Self {
            weigher: Some(std::sync::Arc::new(weigher)),
            ..self
        }
    }

    /// Values matching `pinned` are neither evicted nor expired, even when
    /// that keeps a segment over its bound.
    pub fn pinned(self, pinned: impl Fn(&V) -> bool + Send + Sync + 'static) -> Self {
        Self {
            pinned: Some(std::sync::Arc::new(pinned)),
            ..self
        }
    }

    pub fn eviction_listener(
        self,
        listener: impl Fn(&K, RemovalCause) + Send + Sync + 'static,
    ) -> Self {
        Self {
            eviction_listener: Some(std::sync::Arc::new(listener)),
            ..self
        }
    }

    pub(crate) fn clock(self, clock: Clock) -> Self {
        Self {
            clock: Some(clock),
            ..self
        }
    }

    pub fn build(self) -> LocalStorage<K, V> {
        let num_segments = match self.max_entries {
            Some(max) => self.num_segments.min(max as usize).max(1),
            None => self.num_segments,
        };
        let max_entries_per_segment = self
            .max_entries
            .map(|max| ((max as usize) + num_segments - 1) / num_segments);
        let segments = std::iter::repeat_with(|| RwLock::new(Segment::default()))
            .take(num_segments)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        LocalStorage {
            name: self.name,
            segments,
            build_hasher: RandomState::default(),
            max_entries_per_segment,
            time_to_live: self.time_to_live,
            weigher: self.weigher,
            pinned: self.pinned,
            eviction_listener: self.eviction_listener,
            clock: self.clock.unwrap_or_default(),
            next_seq: AtomicU64::new(0),
            entry_count: AtomicU64::new(0),
            weighted_size: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        }
    }
}

enum EvictionStep {
    Keep,
    Remove(RemovalCause),
    Stale,
}

struct ValueEntry<V> {
    value: V,
    last_modified: Instant,
    weight: u32,
    seq: u64,
}

struct Segment<K, V> {
    map: HashMap<K, ValueEntry<V>>,
    // Keys in the order they were written. A record is stale once the key was
    // rewritten (its sequence number no longer matches) or removed.
    write_order: VecDeque<(K, u64)>,
}

impl<K, V> Default for Segment<K, V> {
    fn default() -> Self {
        Self {
            map: HashMap::default(),
            write_order: VecDeque::default(),
        }
    }
}

/// An in-process storage made of independently locked hash map segments.
///
/// Reads of different keys never contend with each other; reads and writes of
/// keys in the same segment take the segment's read-write lock. When a size
/// bound is configured, the oldest written entries of a segment are evicted
/// first. Entries past their time to live are treated as absent and dropped
/// lazily.
pub struct LocalStorage<K, V> {
    name: String,
    segments: Box<[RwLock<Segment<K, V>>]>,
    build_hasher: RandomState,
    max_entries_per_segment: Option<usize>,
    time_to_live: Option<Duration>,
    weigher: Option<Weigher<K, V>>,
    pinned: Option<Pinned<V>>,
    eviction_listener: Option<EvictionListener<K>>,
    clock: Clock,
    next_seq: AtomicU64,
    entry_count: AtomicU64,
    weighted_size: AtomicU64,
    destroyed: AtomicBool,
}

impl<K, V> LocalStorage<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn builder(name: impl Into<String>) -> LocalStorageBuilder<K, V> {
        LocalStorageBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_entries(&self) -> Option<u64> {
        self.max_entries_per_segment
            .map(|n| (n * self.segments.len()) as u64)
    }

    pub fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

//
// private
//
impl<K, V> LocalStorage<K, V>
where
    K: Eq + Hash + Clone,
{
    #[inline]
    fn segment(&self, key: &K) -> &RwLock<Segment<K, V>> {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        &self.segments[(hasher.finish() as usize) % self.segments.len()]
    }

    #[inline]
    fn is_expired(&self, entry: &ValueEntry<V>, now: Option<Instant>) -> bool {
        match (self.time_to_live, now) {
            (Some(ttl), Some(now)) => {
                entry.last_modified.saturating_add(ttl) <= now && !self.is_pinned(&entry.value)
            }
            _ => false,
        }
    }

    #[inline]
    fn is_pinned(&self, value: &V) -> bool {
        self.pinned.as_ref().map_or(false, |p| p(value))
    }

    fn weigh(&self, key: &K, value: &V) -> u32 {
        self.weigher.as_ref().map_or(1, |w| w(key, value))
    }

    fn remove_entry(&self, segment: &mut Segment<K, V>, key: &K, cause: Option<RemovalCause>) {
        if let Some(entry) = segment.map.remove(key) {
            self.entry_count.fetch_sub(1, Ordering::AcqRel);
            self.weighted_size
                .fetch_sub(entry.weight as u64, Ordering::AcqRel);
            if let (Some(listener), Some(cause)) = (&self.eviction_listener, cause) {
                listener(key, cause);
            }
        }
    }

    /// Drops expired entries from the head of the write order, then evicts the
    /// oldest entries while the segment is over its bound. Pinned entries are
    /// moved to the back of the write order.
    fn evict(&self, segment: &mut Segment<K, V>, now: Option<Instant>) {
        // Each record is looked at once at most, so a segment holding only
        // pinned entries cannot loop.
        let mut budget = segment.write_order.len();
        while budget > 0 {
            let Some((key, seq)) = segment.write_order.front() else {
                break;
            };
            budget -= 1;
            let step = match segment.map.get(key) {
                Some(e) if e.seq == *seq => {
                    if self.is_pinned(&e.value) {
                        EvictionStep::Keep
                    } else if self.is_expired(e, now) {
                        EvictionStep::Remove(RemovalCause::Expired)
                    } else if self
                        .max_entries_per_segment
                        .map_or(false, |max| segment.map.len() > max)
                    {
                        EvictionStep::Remove(RemovalCause::Size)
                    } else {
                        break;
                    }
                }
                _ => EvictionStep::Stale,
            };
            if let Some(record) = segment.write_order.pop_front() {
                match step {
                    EvictionStep::Keep => segment.write_order.push_back(record),
                    EvictionStep::Remove(cause) => {
                        self.remove_entry(segment, &record.0, Some(cause))
                    }
                    EvictionStep::Stale => {}
                }
            }
        }

        if segment.write_order.len() > segment.map.len() * 2 + 32 {
            let Segment { map, write_order } = segment;
            write_order.retain(|(k, s)| map.get(k).map_or(false, |e| e.seq == *s));
        }
    }

    fn now_if_expiring(&self) -> Option<Instant> {
        self.time_to_live.map(|_| self.clock.now())
    }
}

impl<K, V> StorageAccess<K, V> for LocalStorage<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Result<Option<V>> {
        if self.is_destroyed() {
            return Ok(None);
        }
        let now = self.now_if_expiring();
        let segment = self.segment(key);
        {
            let seg = segment.read();
            match seg.map.get(key) {
                None => return Ok(None),
                Some(entry) if !self.is_expired(entry, now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        let mut seg = segment.write();
        if matches!(seg.map.get(key), Some(e) if self.is_expired(e, now)) {
            self.remove_entry(&mut seg, key, Some(RemovalCause::Expired));
        }
        Ok(None)
    }

    fn put(&self, key: K, value: V) -> Result<()> {
        if self.is_destroyed() {
            log::debug!("Dropping a put into destroyed storage `{}`", self.name);
            return Ok(());
        }
        let weight = self.weigh(&key, &value);
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        let now = self.clock.now();
        let entry = ValueEntry {
            value,
            last_modified: now,
            weight,
            seq,
        };

        let mut seg = self.segment(&key).write();
        match seg.map.insert(key.clone(), entry) {
            Some(old) => {
                self.weighted_size
                    .fetch_sub(old.weight as u64, Ordering::AcqRel);
            }
            None => {
                self.entry_count.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.weighted_size
            .fetch_add(weight as u64, Ordering::AcqRel);
        seg.write_order.push_back((key, seq));
        self.evict(&mut seg, self.time_to_live.map(|_| now));
        Ok(())
    }

    fn remove(&self, key: &K) -> Result<()> {
        let mut seg = self.segment(key).write();
        self.remove_entry(&mut seg, key, None);
        Ok(())
    }

    fn contains(&self, key: &K) -> Result<bool> {
        if self.is_destroyed() {
            return Ok(false);
        }
        let now = self.now_if_expiring();
        let seg = self.segment(key).read();
        Ok(matches!(seg.map.get(key), Some(e) if !self.is_expired(e, now)))
    }

    fn clear(&self) -> Result<()> {
        for segment in self.segments.iter() {
            let mut seg = segment.write();
            let count = seg.map.len() as u64;
            let weight: u64 = seg.map.values().map(|e| e.weight as u64).sum();
            seg.map.clear();
            seg.write_order.clear();
            self.entry_count.fetch_sub(count, Ordering::AcqRel);
            self.weighted_size.fetch_sub(weight, Ordering::AcqRel);
        }
        Ok(())
    }

    fn element_count_in_memory(&self) -> u64 {
        self.entry_count.load(Ordering::Acquire)
    }

    fn size_in_memory(&self) -> u64 {
        self.weighted_size.load(Ordering::Acquire)
    }

    fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.clear()?;
        log::debug!("Destroyed local storage `{}`", self.name);
        Ok(())
    }
}

impl<K, V> std::fmt::Debug for LocalStorage<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStorage")
            .field("name", &self.name)
            .field("entry_count", &self.entry_count.load(Ordering::Acquire))
            .field("max_entries_per_segment", &self.max_entries_per_segment)
            .field("time_to_live", &self.time_to_live)
            .finish()
    }
}
