//! Cache configuration.

use std::{collections::HashMap, time::Duration};

use crate::{access::AccessType, CacheError, Result};

pub(crate) const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

const PROPERTY_PREFIX: &str = "hibernate.cache.";
const REGION_PROPERTY_PREFIX: &str = "hibernate.cache.region.";

/// Settings of a single region, overriding the factory defaults.
///
/// # Examples
///
/// ```rust
/// use orm_cache::{AccessType, RegionConfig};
/// use std::time::Duration;
///
/// let config = RegionConfig::builder("Item")
///     .access_type(AccessType::NonstrictReadWrite)
///     .max_entries(10_000)
///     .time_to_live(Duration::from_secs(30 * 60))
///     .build();
/// assert_eq!(config.name(), "Item");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionConfig {
    name: String,
    access_type: Option<AccessType>,
    max_entries: Option<u64>,
    time_to_live: Option<Duration>,
}

impl RegionConfig {
    pub fn builder(name: impl Into<String>) -> RegionConfigBuilder {
        RegionConfigBuilder {
            config: RegionConfig {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn access_type(&self) -> Option<AccessType> {
        self.access_type
    }

    pub fn max_entries(&self) -> Option<u64> {
        self.max_entries
    }

    pub fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live
    }
}

/// Builds a [`RegionConfig`].
#[derive(Clone, Debug)]
pub struct RegionConfigBuilder {
    config: RegionConfig,
}

impl RegionConfigBuilder {
    pub fn access_type(mut self, access_type: AccessType) -> Self {
        self.config.access_type = Some(access_type);
        self
    }

    pub fn max_entries(mut self, max_entries: u64) -> Self {
        self.config.max_entries = Some(max_entries);
        self
    }

    pub fn time_to_live(mut self, duration: Duration) -> Self {
        self.config.time_to_live = Some(duration);
        self
    }

    pub fn build(self) -> RegionConfig {
        self.config
    }
}

/// Factory-wide cache settings.
///
/// Usually populated through [`RegionFactoryBuilder`][builder]; can also be
/// read from Hibernate-style properties with
/// [`from_properties`](#method.from_properties).
///
/// [builder]: ./struct.RegionFactoryBuilder.html
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheSettings {
    pub(crate) region_prefix: Option<String>,
    pub(crate) default_access_type: AccessType,
    pub(crate) use_minimal_puts: bool,
    pub(crate) use_query_cache: bool,
    pub(crate) lock_timeout: Duration,
    pub(crate) max_entries: Option<u64>,
    pub(crate) time_to_live: Option<Duration>,
    pub(crate) regions: HashMap<String, RegionConfig>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            region_prefix: None,
            default_access_type: AccessType::ReadWrite,
            use_minimal_puts: false,
            use_query_cache: false,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            max_entries: None,
            time_to_live: None,
            regions: HashMap::default(),
        }
    }
}

impl CacheSettings {
    /// Reads the settings from `hibernate.cache.*` properties. Other
    /// properties are ignored.
    ///
    /// | Property | Value |
    /// |---|---|
    /// | `hibernate.cache.default_cache_concurrency_strategy` | an [`AccessType`] name |
    /// | `hibernate.cache.region_prefix` | prepended to every region name |
    /// | `hibernate.cache.use_minimal_puts` | `true` / `false` |
    /// | `hibernate.cache.use_query_cache` | `true` / `false` |
    /// | `hibernate.cache.lock_timeout` | milliseconds |
    /// | `hibernate.cache.max_entries` | default bound of every region |
    /// | `hibernate.cache.ttl` | default time to live, seconds |
    /// | `hibernate.cache.region.<name>.strategy` | an [`AccessType`] name |
    /// | `hibernate.cache.region.<name>.max_entries` | entry bound |
    /// | `hibernate.cache.region.<name>.ttl` | time to live, seconds |
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidConfiguration` for malformed values and
    /// `CacheError::UnknownAccessType` for unknown strategies.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use orm_cache::{AccessType, CacheSettings};
    ///
    /// let settings = CacheSettings::from_properties([
    ///     ("hibernate.cache.use_query_cache", "true"),
    ///     ("hibernate.cache.region.Country.strategy", "read-only"),
    /// ])
    /// .unwrap();
    /// assert!(settings.use_query_cache());
    /// assert_eq!(
    ///     settings.region("Country").and_then(|r| r.access_type()),
    ///     Some(AccessType::ReadOnly)
    /// );
    /// ```
    pub fn from_properties<I, K, V>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut settings = Self::default();
        for (key, value) in properties {
            let (key, value) = (key.as_ref().trim(), value.as_ref().trim());
            if let Some(rest) = key.strip_prefix(REGION_PROPERTY_PREFIX) {
                settings.apply_region_property(key, rest, value)?;
                continue;
            }
            let Some(name) = key.strip_prefix(PROPERTY_PREFIX) else {
                continue;
            };
            match name {
                "default_cache_concurrency_strategy" => {
                    settings.default_access_type = value.parse()?;
                }
                "region_prefix" => {
                    settings.region_prefix = Some(value.to_string()).filter(|p| !p.is_empty());
                }
                "use_minimal_puts" => settings.use_minimal_puts = parse_bool(key, value)?,
                "use_query_cache" => settings.use_query_cache = parse_bool(key, value)?,
                "lock_timeout" => {
                    settings.lock_timeout = Duration::from_millis(parse_u64(key, value)?);
                }
                "max_entries" => settings.max_entries = Some(parse_u64(key, value)?),
                "ttl" => settings.time_to_live = Some(Duration::from_secs(parse_u64(key, value)?)),
                _ => log::debug!("Ignoring unknown cache property `{key}`"),
            }
        }
        Ok(settings)
    }

    pub fn region_prefix(&self) -> Option<&str> {
        self.region_prefix.as_deref()
    }

    pub fn default_access_type(&self) -> AccessType {
        self.default_access_type
    }

    pub fn use_minimal_puts(&self) -> bool {
        self.use_minimal_puts
    }

    pub fn use_query_cache(&self) -> bool {
        self.use_query_cache
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// The overrides configured for the region `name` (unprefixed).
    pub fn region(&self, name: &str) -> Option<&RegionConfig> {
        self.regions.get(name)
    }

    /// Prepends the region prefix, if any, to `name`.
    pub fn qualify(&self, name: &str) -> String {
        match &self.region_prefix {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.to_string(),
        }
    }

    pub(crate) fn add_region(&mut self, config: RegionConfig) {
        self.regions.insert(config.name.clone(), config);
    }

    fn apply_region_property(&mut self, key: &str, rest: &str, value: &str) -> Result<()> {
        // Region names may contain dots; the setting is the last segment.
        let Some((name, setting)) = rest.rsplit_once('.') else {
            return Err(invalid(key, value, "expected `<region>.<setting>`"));
        };
        let region = self
            .regions
            .entry(name.to_string())
            .or_insert_with(|| RegionConfig {
                name: name.to_string(),
                ..Default::default()
            });
        match setting {
            "strategy" => region.access_type = Some(value.parse()?),
            "max_entries" => region.max_entries = Some(parse_u64(key, value)?),
            "ttl" => region.time_to_live = Some(Duration::from_secs(parse_u64(key, value)?)),
            _ => return Err(invalid(key, value, "unknown region setting")),
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> CacheError {
    CacheError::InvalidConfiguration(format!("`{key}` = `{value}`: {reason}"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(key, value, "expected `true` or `false`")),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| invalid(key, value, "expected a non-negative integer"))
}
