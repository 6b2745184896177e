//! Per-region cache statistics.

pub(crate) mod stats_counter;

pub(crate) use stats_counter::StatsCounter;

/// A point-in-time snapshot of a region's statistics.
///
/// Obtained from [`Region::statistics`][region-stats]. Counters saturate at
/// `u64::MAX` instead of wrapping around.
///
/// [region-stats]: ./struct.Region.html#method.statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionStats {
    region_name: String,
    hit_count: u64,
    miss_count: u64,
    put_count: u64,
    eviction_count: u64,
    element_count_in_memory: u64,
    size_in_memory: u64,
}

impl RegionStats {
    pub(crate) fn new(region_name: impl Into<String>) -> Self {
        Self {
            region_name: region_name.into(),
            ..Default::default()
        }
    }

    pub(crate) fn set_req_counts(&mut self, hit_count: u64, miss_count: u64) -> &mut Self {
        self.hit_count = hit_count;
        self.miss_count = miss_count;
        self
    }

    pub(crate) fn set_write_counts(&mut self, put_count: u64, eviction_count: u64) -> &mut Self {
        self.put_count = put_count;
        self.eviction_count = eviction_count;
        self
    }

    pub(crate) fn set_memory(&mut self, element_count: u64, size: u64) -> &mut Self {
        self.element_count_in_memory = element_count;
        self.size_in_memory = size;
        self
    }

    pub fn region_name(&self) -> &str {
        &self.region_name
    }

    pub fn request_count(&self) -> u64 {
        self.hit_count.saturating_add(self.miss_count)
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    /// Returns the ratio of hits to requests, or `1.0` when nothing was
    /// requested yet.
    pub fn hit_rate(&self) -> f64 {
        let req_count = self.request_count();
        if req_count == 0 {
            1.0
        } else {
            self.hit_count as f64 / req_count as f64
        }
    }

    pub fn miss_count(&self) -> u64 {
        self.miss_count
    }

    pub fn put_count(&self) -> u64 {
        self.put_count
    }

    /// Entries dropped by the storage because of its size bound or TTL.
    pub fn eviction_count(&self) -> u64 {
        self.eviction_count
    }

    pub fn element_count_in_memory(&self) -> u64 {
        self.element_count_in_memory
    }

    /// Estimated bytes held by the region's in-process tier.
    pub fn size_in_memory(&self) -> u64 {
        self.size_in_memory
    }
}

#[cfg(test)]
mod tests {
    use super::RegionStats;

    #[test]
    fn hit_rate_of_an_idle_region_is_one() {
        let stats = RegionStats::new("item");
        assert_eq!(stats.request_count(), 0);
        assert_eq!(stats.hit_rate(), 1.0);
    }

    #[test]
    fn hit_rate() {
        let mut stats = RegionStats::new("item");
        stats.set_req_counts(3, 1);
        assert_eq!(stats.request_count(), 4);
        assert_eq!(stats.hit_rate(), 0.75);
    }
}
