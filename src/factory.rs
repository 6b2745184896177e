//! The registry owning every cache region of a session factory.

mod builder;

pub use builder::RegionFactoryBuilder;

use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use smallvec::SmallVec;

use crate::{
    access::{soft_lock::Lockable, AccessType},
    common::time::{timestamper::Timestamp, Clock, Timestamper},
    config::CacheSettings,
    key::{CacheKey, Identifier},
    persister::{EntityPersister, PersisterMetadata},
    query::{CachedQueryResult, QueryKey, QueryResultsCache},
    region::{Region, RegionKind, RegionParts},
    stats::{RegionStats, StatsCounter},
    storage::{LocalStorage, RemoteStore, StorageAccess, TieredStorage},
    timestamps::TimestampsRegion,
    transaction::CacheTransaction,
    CacheError, Result,
};

const QUERY_RESULTS_REGION: &str = "default-query-results-region";
const TIMESTAMPS_REGION: &str = "default-update-timestamps-region";

type RegionVec = SmallVec<[Arc<Region>; 8]>;

/// Where the data of an entity type or collection role is cached.
struct Registration {
    region: Arc<Region>,
    // The role cache keys are built from: the root entity name or the
    // collection role.
    key_role: String,
    table_spaces: Vec<String>,
}

impl Registration {
    fn touches<S: AsRef<str>>(&self, spaces: &[S]) -> bool {
        spaces.is_empty()
            || spaces
                .iter()
                .any(|s| self.table_spaces.iter().any(|t| t == s.as_ref()))
    }
}

#[derive(Default)]
struct Registrations {
    entities: HashMap<String, Registration>,
    natural_ids: HashMap<String, Registration>,
    collections: HashMap<String, Registration>,
}

impl Registrations {
    fn all(&self) -> impl Iterator<Item = &Registration> {
        self.entities
            .values()
            .chain(self.natural_ids.values())
            .chain(self.collections.values())
    }
}

/// Builds, owns and destroys the cache regions of one session factory.
///
/// A `RegionFactory` is constructed explicitly (see
/// [`RegionFactory::builder`]) and passed to whatever needs the cache; there
/// is no global state. Persisters are registered against the domain regions
/// built through [`build_domain_region`](#method.build_domain_region), after
/// which the factory can route evictions by entity name or collection role
/// and clean up after bulk statements.
///
/// # Examples
///
/// ```rust
/// use orm_cache::{
///     AccessType, CacheEntry, CacheKey, RegionFactory, RegionKind,
/// };
///
/// let factory = RegionFactory::builder().build();
/// let region = factory
///     .build_domain_region(RegionKind::Entity, "Item", Some(AccessType::ReadWrite))
///     .unwrap();
///
/// let key = CacheKey::new("Item", 1);
/// let tx = factory.begin_transaction();
/// region
///     .put_from_load(&key, CacheEntry::new(vec!["widget".into()], None), &tx, None, false)
///     .unwrap();
/// tx.complete(true);
///
/// let tx = factory.begin_transaction();
/// assert!(region.get(&key, &tx).unwrap().is_some());
/// ```
pub struct RegionFactory {
    settings: CacheSettings,
    remote: Option<Arc<dyn RemoteStore>>,
    nonstop_timeout: Option<Duration>,
    clock: Clock,
    timestamper: Arc<Timestamper>,
    regions: RwLock<HashMap<String, Arc<Region>>>,
    registrations: RwLock<Registrations>,
    query_results: Option<Arc<QueryResultsCache>>,
    timestamps: Option<Arc<TimestampsRegion>>,
    shut_down: AtomicBool,
}

impl RegionFactory {
    /// Returns a [`RegionFactoryBuilder`](./struct.RegionFactoryBuilder.html).
    pub fn builder() -> RegionFactoryBuilder {
        RegionFactoryBuilder::default()
    }

    pub(crate) fn with_everything(
        settings: CacheSettings,
        remote: Option<Arc<dyn RemoteStore>>,
        nonstop_timeout: Option<Duration>,
        clock: Clock,
    ) -> Self {
        let timestamper = Arc::new(Timestamper::new(clock.clone()));
        let mut factory = Self {
            settings,
            remote,
            nonstop_timeout,
            clock,
            timestamper,
            regions: RwLock::new(HashMap::default()),
            registrations: RwLock::new(Registrations::default()),
            query_results: None,
            timestamps: None,
            shut_down: AtomicBool::new(false),
        };
        if factory.settings.use_query_cache {
            let timestamps = Arc::new(factory.build_timestamps_region());
            factory.query_results = Some(Arc::new(
                factory.build_query_results_cache(Arc::clone(&timestamps)),
            ));
            factory.timestamps = Some(timestamps);
        }
        factory
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Returns a timestamp greater than every timestamp returned before.
    pub fn next_timestamp(&self) -> Timestamp {
        self.timestamper.next()
    }

    /// Starts a cache transaction at [`next_timestamp`](#method.next_timestamp).
    /// Complete it with [`CacheTransaction::complete`] once the database
    /// transaction committed or rolled back.
    ///
    /// [`CacheTransaction::complete`]: ./struct.CacheTransaction.html#method.complete
    pub fn begin_transaction(&self) -> CacheTransaction {
        CacheTransaction::new(self.timestamper.next())
    }

    /// Builds the entity, collection or natural-id region `name`, or returns
    /// it when it was built before.
    ///
    /// The access type is taken from `access_type`, then from the region's
    /// configuration, then from the factory default.
    ///
    /// # Errors
    ///
    /// - `CacheError::InvalidConfiguration` when `kind` is not a domain kind,
    ///   or when the region exists with another kind or access type.
    /// - `CacheError::RegionDestroyed` after [`shutdown`](#method.shutdown).
    pub fn build_domain_region(
        &self,
        kind: RegionKind,
        name: &str,
        access_type: Option<AccessType>,
    ) -> Result<Arc<Region>> {
        if !kind.is_domain() {
            return Err(CacheError::InvalidConfiguration(format!(
                "`{name}`: {kind} regions are built by the factory itself"
            )));
        }
        let qualified = self.settings.qualify(name);
        if self.is_shut_down() {
            return Err(CacheError::RegionDestroyed(qualified));
        }
        let config = self.settings.region(name);
        let resolved = access_type
            .or_else(|| config.and_then(|c| c.access_type()))
            .unwrap_or(self.settings.default_access_type);

        let mut regions = self.regions.write();
        if let Some(existing) = regions.get(&qualified) {
            if existing.kind() != kind {
                return Err(CacheError::InvalidConfiguration(format!(
                    "region `{qualified}` already holds {} data, not {kind} data",
                    existing.kind()
                )));
            }
            if access_type.map_or(false, |a| a != existing.access_type()) {
                return Err(CacheError::InvalidConfiguration(format!(
                    "region `{qualified}` already uses the {} access type",
                    existing.access_type()
                )));
            }
            return Ok(Arc::clone(existing));
        }

        let stats = Arc::new(StatsCounter::default());
        let storage = self.storage(
            &qualified,
            config.and_then(|c| c.max_entries()).or(self.settings.max_entries),
            config.and_then(|c| c.time_to_live()).or(self.settings.time_to_live),
            &stats,
            |k: &CacheKey, v: &Lockable| k.estimated_size() + v.estimated_size(),
            // Soft locks guard writes in flight.
            |v: &Lockable| matches!(v, Lockable::Lock(_)),
        );
        let region = Arc::new(Region::new(RegionParts {
            name: qualified.clone(),
            kind,
            access_type: resolved,
            storage,
            stats,
            timestamper: Arc::clone(&self.timestamper),
            lock_timeout: self.settings.lock_timeout,
            minimal_puts: self.settings.use_minimal_puts,
        }));
        log::debug!("Built {kind} region `{qualified}` ({resolved})");
        regions.insert(qualified, Arc::clone(&region));
        Ok(region)
    }

    /// Returns the domain region `name` (unprefixed).
    ///
    /// # Errors
    ///
    /// `CacheError::RegionNotFound` when no such region was built and
    /// `CacheError::RegionDestroyed` after [`shutdown`](#method.shutdown).
    pub fn region(&self, name: &str) -> Result<Arc<Region>> {
        let qualified = self.settings.qualify(name);
        if self.is_shut_down() {
            return Err(CacheError::RegionDestroyed(qualified));
        }
        self.regions
            .read()
            .get(&qualified)
            .cloned()
            .ok_or(CacheError::RegionNotFound(qualified))
    }

    /// The names of the domain regions, sorted.
    pub fn region_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.regions.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// # Errors
    ///
    /// `CacheError::InvalidConfiguration` when the query cache is disabled.
    pub fn query_results_cache(&self) -> Result<Arc<QueryResultsCache>> {
        self.query_results
            .clone()
            .ok_or_else(query_cache_disabled)
    }

    /// # Errors
    ///
    /// `CacheError::InvalidConfiguration` when the query cache is disabled.
    pub fn timestamps_region(&self) -> Result<Arc<TimestampsRegion>> {
        self.timestamps.clone().ok_or_else(query_cache_disabled)
    }

    /// Caches the entities of `persister` in `region`.
    ///
    /// # Errors
    ///
    /// `CacheError::InvalidConfiguration` unless `region` is an entity region.
    pub fn register_entity<P>(&self, persister: &P, region: &Arc<Region>) -> Result<()>
    where
        P: EntityPersister + ?Sized,
    {
        let registration = registration(
            region,
            RegionKind::Entity,
            persister.root_entity_name(),
            persister,
        )?;
        let name = persister.entity_name().to_string();
        log::debug!("Caching entity `{name}` in region `{}`", region.name());
        self.registrations.write().entities.insert(name, registration);
        Ok(())
    }

    /// Caches the natural-id resolutions of `persister` in `region`.
    ///
    /// # Errors
    ///
    /// `CacheError::InvalidConfiguration` unless `region` is a natural-id
    /// region.
    pub fn register_natural_id<P>(&self, persister: &P, region: &Arc<Region>) -> Result<()>
    where
        P: EntityPersister + ?Sized,
    {
        let registration = registration(
            region,
            RegionKind::NaturalId,
            persister.root_entity_name(),
            persister,
        )?;
        let name = persister.entity_name().to_string();
        self.registrations
            .write()
            .natural_ids
            .insert(name, registration);
        Ok(())
    }

    /// Caches the collection role of `persister` in `region`.
    ///
    /// # Errors
    ///
    /// `CacheError::InvalidConfiguration` unless `region` is a collection
    /// region.
    pub fn register_collection(
        &self,
        persister: &(impl PersisterMetadata + ?Sized),
        region: &Arc<Region>,
    ) -> Result<()> {
        let role = persister.role();
        let registration = registration(region, RegionKind::Collection, role, persister)?;
        log::debug!("Caching collection `{role}` in region `{}`", region.name());
        self.registrations
            .write()
            .collections
            .insert(role.to_string(), registration);
        Ok(())
    }

    /// The region caching `entity_name`, if it is cached.
    pub fn entity_access(&self, entity_name: &str) -> Option<Arc<Region>> {
        lookup(&self.registrations.read().entities, entity_name)
    }

    pub fn natural_id_access(&self, entity_name: &str) -> Option<Arc<Region>> {
        lookup(&self.registrations.read().natural_ids, entity_name)
    }

    pub fn collection_access(&self, role: &str) -> Option<Arc<Region>> {
        lookup(&self.registrations.read().collections, role)
    }

    /// Returns `true` when the entity is cached. Soft-locked entities are not.
    pub fn contains_entity(&self, entity_name: &str, id: impl Into<Identifier>) -> bool {
        let registrations = self.registrations.read();
        registrations
            .entities
            .get(entity_name)
            .map_or(false, |r| r.region.contains(&CacheKey::new(&*r.key_role, id)))
    }

    /// Drops the cached state of one entity. Does nothing when the entity
    /// type is not cached.
    pub fn evict_entity(&self, entity_name: &str, id: impl Into<Identifier>) -> Result<()> {
        let target = self
            .registrations
            .read()
            .entities
            .get(entity_name)
            .map(|r| (Arc::clone(&r.region), CacheKey::new(&*r.key_role, id)));
        match target {
            Some((region, key)) => {
                log::debug!("Evicting {key} from region `{}`", region.name());
                region.evict(&key)
            }
            None => Ok(()),
        }
    }

    /// Drops the cached state and natural-id resolutions of every entity of
    /// type `entity_name`.
    pub fn evict_entity_data(&self, entity_name: &str) -> Result<()> {
        let regions: RegionVec = {
            let registrations = self.registrations.read();
            [&registrations.entities, &registrations.natural_ids]
                .into_iter()
                .filter_map(|m| m.get(entity_name))
                .map(|r| Arc::clone(&r.region))
                .collect()
        };
        for region in regions {
            region.evict_all()?;
        }
        Ok(())
    }

    pub fn evict_natural_id_data(&self, entity_name: &str) -> Result<()> {
        match self.natural_id_access(entity_name) {
            Some(region) => region.evict_all(),
            None => Ok(()),
        }
    }

    /// Drops the cached elements of one collection.
    pub fn evict_collection(&self, role: &str, owner_id: impl Into<Identifier>) -> Result<()> {
        match self.collection_access(role) {
            Some(region) => region.evict(&CacheKey::new(role, owner_id)),
            None => Ok(()),
        }
    }

    pub fn evict_collection_data(&self, role: &str) -> Result<()> {
        match self.collection_access(role) {
            Some(region) => region.evict_all(),
            None => Ok(()),
        }
    }

    /// Drops every cached query result.
    pub fn evict_query_regions(&self) -> Result<()> {
        match &self.query_results {
            Some(query_results) => {
                log::debug!("Evicting all cached query results");
                query_results.clear()
            }
            None => Ok(()),
        }
    }

    /// Drops the contents of every domain region and the cached query
    /// results. Table-space timestamps are kept.
    pub fn evict_all(&self) -> Result<()> {
        let regions: RegionVec = self.regions.read().values().cloned().collect();
        for region in regions {
            region.evict_all()?;
        }
        self.evict_query_regions()
    }

    /// Keeps the cache consistent around a bulk statement (an HQL or native
    /// update or delete) that modifies `spaces` within `tx`.
    ///
    /// Before the statement runs, the spaces are pre-invalidated so that no
    /// query result is cached for them, and every region whose persister
    /// touches them is emptied along with the query results. When `tx`
    /// completes the regions are emptied again, which removes what
    /// concurrent transactions loaded in the meantime, and the spaces are
    /// invalidated. An empty `spaces` slice stands for an unknown set of
    /// tables and affects every region.
    ///
    /// Failed evictions are logged and do not fail the statement.
    pub fn coordinate_shared_cache_cleanup<S: AsRef<str>>(
        &self,
        spaces: &[S],
        tx: &CacheTransaction,
    ) -> Result<()> {
        if let Some(timestamps) = &self.timestamps {
            timestamps.pre_invalidate(spaces)?;
        }
        let affected = self.regions_touching(spaces);
        evict_all_logged(&affected);
        if let Some(query_results) = &self.query_results {
            if let Err(e) = query_results.clear() {
                log::warn!("Failed to evict query results for a bulk statement: {e}");
            }
        }

        let spaces: Vec<String> = spaces.iter().map(|s| s.as_ref().to_string()).collect();
        let timestamps = self.timestamps.clone();
        tx.register_synchronization(move |success: bool| {
            log::debug!("Bulk statement finished (success: {success}); evicting again");
            evict_all_logged(&affected);
            if let Some(timestamps) = timestamps {
                if let Err(e) = timestamps.invalidate(&spaces) {
                    log::warn!("Failed to invalidate table spaces {spaces:?}: {e}");
                }
            }
        });
        Ok(())
    }

    /// Marks the table spaces of `entity_name` as changing while `tx` writes
    /// an entity of that type, so that query results over them are neither
    /// cached nor read until `tx` completes. On completion the spaces are
    /// invalidated, whatever the outcome.
    ///
    /// Does nothing when the query cache is disabled or the entity type is
    /// not registered.
    pub fn invalidate_entity_spaces(&self, entity_name: &str, tx: &CacheTransaction) -> Result<()> {
        let Some(timestamps) = self.timestamps.clone() else {
            return Ok(());
        };
        let spaces = match self.registrations.read().entities.get(entity_name) {
            Some(registration) => registration.table_spaces.clone(),
            None => return Ok(()),
        };
        timestamps.pre_invalidate(&spaces)?;
        tx.register_synchronization(move |success: bool| {
            log::debug!("Write of {spaces:?} finished (success: {success})");
            if let Err(e) = timestamps.invalidate(&spaces) {
                log::warn!("Failed to invalidate table spaces {spaces:?}: {e}");
            }
        });
        Ok(())
    }

    /// # Errors
    ///
    /// `CacheError::RegionNotFound` when no region is named `name`.
    pub fn statistics(&self, name: &str) -> Result<RegionStats> {
        let qualified = self.settings.qualify(name);
        if let Some(region) = self.regions.read().get(&qualified) {
            return Ok(region.statistics());
        }
        match (&self.query_results, &self.timestamps) {
            (Some(q), _) if q.name() == qualified => Ok(q.statistics()),
            (_, Some(t)) if t.name() == qualified => Ok(t.statistics()),
            _ => Err(CacheError::RegionNotFound(qualified)),
        }
    }

    /// Destroys every region. Calling it again does nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("Shutting down the region factory");
        for region in self.regions.read().values() {
            region.destroy();
        }
        if let Some(query_results) = &self.query_results {
            query_results.destroy();
        }
        if let Some(timestamps) = &self.timestamps {
            timestamps.destroy();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn regions_touching<S: AsRef<str>>(&self, spaces: &[S]) -> RegionVec {
        let registrations = self.registrations.read();
        let mut affected = RegionVec::new();
        for registration in registrations.all().filter(|r| r.touches(spaces)) {
            if !affected.iter().any(|r| Arc::ptr_eq(r, &registration.region)) {
                affected.push(Arc::clone(&registration.region));
            }
        }
        affected
    }

    fn build_timestamps_region(&self) -> TimestampsRegion {
        let name = self.settings.qualify(TIMESTAMPS_REGION);
        let stats = Arc::new(StatsCounter::default());
        // Never bounded nor expired: a lost timestamp would make stale query
        // results look fresh.
        let storage = self.storage(
            &name,
            None,
            None,
            &stats,
            |space: &String, _: &Timestamp| space.len() + std::mem::size_of::<Timestamp>(),
            |_: &Timestamp| false,
        );
        TimestampsRegion::new(
            name,
            storage,
            Arc::clone(&self.timestamper),
            self.settings.lock_timeout,
            stats,
        )
    }

    fn build_query_results_cache(&self, timestamps: Arc<TimestampsRegion>) -> QueryResultsCache {
        let name = self.settings.qualify(QUERY_RESULTS_REGION);
        let config = self.settings.region(QUERY_RESULTS_REGION);
        let stats = Arc::new(StatsCounter::default());
        let storage = self.storage(
            &name,
            config.and_then(|c| c.max_entries()).or(self.settings.max_entries),
            config.and_then(|c| c.time_to_live()).or(self.settings.time_to_live),
            &stats,
            |k: &QueryKey, v: &CachedQueryResult| k.estimated_size() + v.estimated_size(),
            |_: &CachedQueryResult| false,
        );
        QueryResultsCache::new(name, storage, timestamps, stats)
    }

    fn storage<K, V>(
        &self,
        name: &str,
        max_entries: Option<u64>,
        time_to_live: Option<Duration>,
        stats: &Arc<StatsCounter>,
        weigh: fn(&K, &V) -> usize,
        pinned: fn(&V) -> bool,
    ) -> Arc<dyn StorageAccess<K, V>>
    where
        K: Eq + Hash + Clone + Serialize + Send + Sync + 'static,
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let weigher = move |k: &K, v: &V| u32::try_from(weigh(k, v)).unwrap_or(u32::MAX);
        let stats = Arc::clone(stats);
        let listener = move |_: &K, _| stats.record_eviction();

        match &self.remote {
            Some(remote) => {
                let mut builder = TieredStorage::builder(name, Arc::clone(remote))
                    .weigher(weigher)
                    .pinned(pinned)
                    .eviction_listener(listener)
                    .clock(self.clock.clone());
                if let Some(max) = max_entries {
                    builder = builder.max_entries(max);
                }
                if let Some(ttl) = time_to_live {
                    builder = builder.time_to_live(ttl);
                }
                if let Some(timeout) = self.nonstop_timeout {
                    builder = builder.nonstop_timeout(timeout);
                }
                Arc::new(builder.build())
            }
            None => {
                let mut builder = LocalStorage::builder(name)
                    .weigher(weigher)
                    .pinned(pinned)
                    .eviction_listener(listener)
                    .clock(self.clock.clone());
                if let Some(max) = max_entries {
                    builder = builder.max_entries(max);
                }
                if let Some(ttl) = time_to_live {
                    builder = builder.time_to_live(ttl);
                }
                Arc::new(builder.build())
            }
        }
    }
}

impl Drop for RegionFactory {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for RegionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionFactory")
            .field("settings", &self.settings)
            .field("regions", &self.region_names())
            .field("distributed", &self.remote.is_some())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn registration(
    region: &Arc<Region>,
    expected: RegionKind,
    key_role: &str,
    persister: &(impl PersisterMetadata + ?Sized),
) -> Result<Registration> {
    if region.kind() != expected {
        return Err(CacheError::InvalidConfiguration(format!(
            "`{}` cannot be cached in {} region `{}`",
            persister.role(),
            region.kind(),
            region.name()
        )));
    }
    Ok(Registration {
        region: Arc::clone(region),
        key_role: key_role.to_string(),
        table_spaces: persister.table_spaces().to_vec(),
    })
}

fn lookup(registrations: &HashMap<String, Registration>, name: &str) -> Option<Arc<Region>> {
    registrations.get(name).map(|r| Arc::clone(&r.region))
}

fn evict_all_logged(regions: &[Arc<Region>]) {
    for region in regions {
        if let Err(e) = region.evict_all() {
            log::warn!("Failed to evict region `{}` for a bulk statement: {e}", region.name());
        }
    }
}

fn query_cache_disabled() -> CacheError {
    CacheError::InvalidConfiguration("the query cache is disabled".into())
}
