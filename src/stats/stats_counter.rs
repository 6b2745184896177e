use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::{atomic::AtomicCell, CachePadded};
use once_cell::sync::Lazy;

use super::RegionStats;

static NUM_COUNTERS: Lazy<usize> = Lazy::new(|| crate::common::num_cpus() * 2);

/// Striped, saturating hit/miss/put/eviction counters of one region.
///
/// Each thread updates its own padded stripe so that counting never contends
/// on a single cache line; a snapshot sums the stripes.
pub(crate) struct StatsCounter {
    request_counters: Box<[CachePadded<RequestCounter>]>,
    eviction_count: CachePadded<AtomicCell<u64>>,
}

#[derive(Default)]
struct RequestCounter {
    hit_count: AtomicCell<u64>,
    miss_count: AtomicCell<u64>,
    put_count: AtomicCell<u64>,
}

impl Default for StatsCounter {
    fn default() -> Self {
        let request_counters = std::iter::repeat_with(Default::default)
            .take(*NUM_COUNTERS)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            request_counters,
            eviction_count: Default::default(),
        }
    }
}

impl StatsCounter {
    pub(crate) fn record_hit(&self) {
        saturating_add(&self.request_counter().hit_count, 1);
    }

    pub(crate) fn record_miss(&self) {
        saturating_add(&self.request_counter().miss_count, 1);
    }

    pub(crate) fn record_put(&self) {
        saturating_add(&self.request_counter().put_count, 1);
    }

    pub(crate) fn record_eviction(&self) {
        saturating_add(&self.eviction_count, 1);
    }

    pub(crate) fn snapshot(&self, region_name: &str) -> RegionStats {
        let hit_count = self.sum_counters(|c| c.hit_count.load());
        let miss_count = self.sum_counters(|c| c.miss_count.load());
        let put_count = self.sum_counters(|c| c.put_count.load());

        let mut stats = RegionStats::new(region_name);
        stats
            .set_req_counts(hit_count, miss_count)
            .set_write_counts(put_count, self.eviction_count.load());
        stats
    }

    fn request_counter(&self) -> &RequestCounter {
        thread_local! { static INDEX: usize = next_index() };
        INDEX.with(|i| &self.request_counters[*i])
    }

    fn sum_counters(&self, mut selector: impl FnMut(&RequestCounter) -> u64) -> u64 {
        self.request_counters
            .iter()
            .fold(0, |acc, counter| acc.saturating_add(selector(counter)))
    }
}

fn saturating_add(counter: &AtomicCell<u64>, value: u64) {
    let mut v0 = counter.load();
    loop {
        let v1 = v0.saturating_add(value);
        match counter.compare_exchange(v0, v1) {
            Ok(_) => break,
            Err(v2) => v0 = v2,
        }
    }
}

static INDEX: Lazy<AtomicUsize> = Lazy::new(Default::default);

fn next_index() -> usize {
    let mut i0 = INDEX.load(Ordering::Acquire);
    loop {
        let mut i1 = i0 + 1;
        if i1 >= *NUM_COUNTERS {
            i1 = 0;
        }
        match INDEX.compare_exchange_weak(i0, i1, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => return i0,
            Err(i2) => i0 = i2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{saturating_add, StatsCounter};

    use crossbeam_utils::atomic::AtomicCell;
    use std::{sync::Arc, thread};

    #[test]
    fn saturates_instead_of_wrapping() {
        let cell = AtomicCell::new(u64::MAX - 1);
        saturating_add(&cell, 5);
        assert_eq!(cell.load(), u64::MAX);
    }

    #[test]
    fn snapshot_sums_all_threads() {
        let counter = Arc::new(StatsCounter::default());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..100 {
                        counter.record_hit();
                        counter.record_miss();
                    }
                    counter.record_put();
                })
            })
            .collect();
        handles
            .into_iter()
            .for_each(|h| h.join().expect("Thread failed"));
        counter.record_eviction();

        let stats = counter.snapshot("item");
        assert_eq!(stats.hit_count(), 400);
        assert_eq!(stats.miss_count(), 400);
        assert_eq!(stats.put_count(), 4);
        assert_eq!(stats.eviction_count(), 1);
    }
}
