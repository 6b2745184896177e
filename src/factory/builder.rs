use super::RegionFactory;
use crate::{
    access::AccessType,
    common::time::Clock,
    config::{CacheSettings, RegionConfig},
    storage::RemoteStore,
};

use std::{sync::Arc, time::Duration};

/// Builds a [`RegionFactory`][factory-struct] with various configuration
/// knobs.
///
/// [factory-struct]: ./struct.RegionFactory.html
///
/// # Examples
///
/// ```rust
/// use orm_cache::{AccessType, RegionConfig, RegionFactory};
///
/// use std::time::Duration;
///
/// let factory = RegionFactory::builder()
///     // Soft locks left behind by crashed writers expire after 30 seconds.
///     .lock_timeout(Duration::from_secs(30))
///     // Every region name gets this prefix.
///     .region_prefix("shop")
///     // Regions hold up to 10,000 entries unless configured otherwise.
///     .max_entries(10_000)
///     .use_query_cache(true)
///     // Reference data never changes.
///     .region(
///         RegionConfig::builder("Country")
///             .access_type(AccessType::ReadOnly)
///             .build(),
///     )
///     // Create the factory.
///     .build();
///
/// assert!(factory.query_results_cache().is_ok());
/// ```
///
#[must_use]
pub struct RegionFactoryBuilder {
    settings: CacheSettings,
    remote: Option<Arc<dyn RemoteStore>>,
    nonstop_timeout: Option<Duration>,
    clock: Option<Clock>,
}

impl Default for RegionFactoryBuilder {
    fn default() -> Self {
        Self {
            settings: CacheSettings::default(),
            remote: None,
            nonstop_timeout: None,
            clock: None,
        }
    }
}

impl RegionFactoryBuilder {
    /// Starts from settings read with
    /// [`CacheSettings::from_properties`][from-properties].
    ///
    /// [from-properties]: ./struct.CacheSettings.html#method.from_properties
    pub fn settings(self, settings: CacheSettings) -> Self {
        Self { settings, ..self }
    }

    /// Sets how long a soft lock stays valid. Defaults to 60 seconds.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.settings.lock_timeout = timeout;
        self
    }

    pub fn region_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.settings.region_prefix = Some(prefix.into()).filter(|p| !p.is_empty());
        self
    }

    /// The access type of regions built without one. Defaults to
    /// `AccessType::ReadWrite`.
    pub fn default_access_type(mut self, access_type: AccessType) -> Self {
        self.settings.default_access_type = access_type;
        self
    }

    /// Skips a put-from-load when the key is already cached.
    pub fn use_minimal_puts(mut self, enabled: bool) -> Self {
        self.settings.use_minimal_puts = enabled;
        self
    }

    /// Builds the query results cache and the timestamps region.
    pub fn use_query_cache(mut self, enabled: bool) -> Self {
        self.settings.use_query_cache = enabled;
        self
    }

    /// Bounds every region without its own bound.
    pub fn max_entries(mut self, max_entries: u64) -> Self {
        self.settings.max_entries = Some(max_entries);
        self
    }

    /// Expires the entries of every region without its own time to live.
    /// The timestamps region never expires.
    pub fn time_to_live(mut self, duration: Duration) -> Self {
        self.settings.time_to_live = Some(duration);
        self
    }

    /// Overrides the settings of one region. The name is unprefixed.
    pub fn region(mut self, config: RegionConfig) -> Self {
        self.settings.add_region(config);
        self
    }

    /// Backs every region with a [`TieredStorage`][tiered] over `remote`, so
    /// that factories sharing the store see each other's writes.
    ///
    /// [tiered]: ./storage/struct.TieredStorage.html
    pub fn remote(self, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            remote: Some(remote),
            ..self
        }
    }

    /// Bounds every call to the remote store. Only used with
    /// [`remote`](#method.remote).
    pub fn nonstop_timeout(self, timeout: Duration) -> Self {
        Self {
            nonstop_timeout: Some(timeout),
            ..self
        }
    }

    #[cfg(test)]
    pub(crate) fn clock(self, clock: Clock) -> Self {
        Self {
            clock: Some(clock),
            ..self
        }
    }

    pub fn build(self) -> RegionFactory {
        RegionFactory::with_everything(
            self.settings,
            self.remote,
            self.nonstop_timeout,
            self.clock.unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::RegionFactoryBuilder;
    use crate::{access::AccessType, config::RegionConfig};

    use std::time::Duration;

    #[test]
    fn build_factory() {
        let factory = RegionFactoryBuilder::default()
            .lock_timeout(Duration::from_secs(5))
            .region_prefix("shop")
            .default_access_type(AccessType::NonstrictReadWrite)
            .use_minimal_puts(true)
            .max_entries(100)
            .time_to_live(Duration::from_secs(60))
            .region(RegionConfig::builder("Item").max_entries(10).build())
            .build();

        let settings = factory.settings();
        assert_eq!(settings.lock_timeout(), Duration::from_secs(5));
        assert_eq!(settings.region_prefix(), Some("shop"));
        assert_eq!(settings.default_access_type(), AccessType::NonstrictReadWrite);
        assert!(settings.use_minimal_puts());
        assert!(!settings.use_query_cache());
        assert_eq!(settings.region("Item").and_then(|r| r.max_entries()), Some(10));

        assert!(factory.query_results_cache().is_err());
        assert!(factory.timestamps_region().is_err());
    }

    #[test]
    fn empty_prefix_means_no_prefix() {
        let factory = RegionFactoryBuilder::default().region_prefix("").build();
        assert_eq!(factory.settings().qualify("Item"), "Item");
    }
}
