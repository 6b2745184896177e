use std::{
    hash::Hash,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{
    local::{LocalStorage, LocalStorageBuilder},
    remote::{RemoteError, RemoteStore},
    RemovalCause, StorageAccess,
};
use crate::{common::time::Clock, CacheError, Result};

const DEFAULT_NONSTOP_TIMEOUT: Duration = Duration::from_millis(500);

/// Bounds the time spent in remote calls.
///
/// A call that fails with [`RemoteError::TimedOut`] or answers later than the
/// configured timeout is reported as [`CacheError::Nonstop`]. Reads that end
/// this way are logged by [`handle`](#method.handle) and treated as misses.
#[derive(Clone, Debug)]
pub struct NonstopHandler {
    timeout: Duration,
}

impl Default for NonstopHandler {
    fn default() -> Self {
        Self::new(DEFAULT_NONSTOP_TIMEOUT)
    }
}

impl NonstopHandler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn call<T>(
        &self,
        clock: &Clock,
        region: &str,
        operation: &'static str,
        f: impl FnOnce() -> std::result::Result<T, RemoteError>,
    ) -> Result<T> {
        let started = clock.now();
        let result = f();
        let elapsed = clock.now().saturating_duration_since(started);
        match result {
            Err(RemoteError::TimedOut) => Err(self.nonstop(operation)),
            Err(RemoteError::Unavailable(message)) => Err(CacheError::provider(region, message)),
            Ok(_) if elapsed > self.timeout => Err(self.nonstop(operation)),
            Ok(value) => Ok(value),
        }
    }

    /// Logs a nonstop failure. The caller carries on as if the cache missed.
    pub fn handle(&self, region: &str, error: &CacheError) {
        log::warn!("Treating slow cache call in region `{region}` as a miss: {error}");
    }

    fn nonstop(&self, operation: &'static str) -> CacheError {
        CacheError::Nonstop {
            operation,
            timeout: self.timeout,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RemoteRecord<V> {
    stamp: u64,
    value: V,
}

#[derive(Clone)]
struct LocalRecord<V> {
    stamp: u64,
    value: V,
}

/// Builds a [`TieredStorage`](./struct.TieredStorage.html).
pub struct TieredStorageBuilder<K, V> {
    name: String,
    remote: Arc<dyn RemoteStore>,
    local: LocalStorageBuilder<K, LocalRecord<V>>,
    nonstop: NonstopHandler,
    clock: Option<Clock>,
    storage_type: PhantomData<(K, V)>,
}

impl<K, V> TieredStorageBuilder<K, V>
where
    K: Eq + Hash + Clone + Serialize + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Bounds the number of entries of the local tier.
    pub fn max_entries(self, max_entries: u64) -> Self {
        Self {
            local: self.local.max_entries(max_entries),
            ..self
        }
    }

    /// Expires local copies; the remote copy is kept.
    pub fn time_to_live(self, duration: Duration) -> Self {
        Self {
            local: self.local.time_to_live(duration),
            ..self
        }
    }

    pub fn weigher(self, weigher: impl Fn(&K, &V) -> u32 + Send + Sync + 'static) -> Self {
        Self {
            local: self
                .local
                .weigher(move |k, record: &LocalRecord<V>| weigher(k, &record.value)),
            ..self
        }
    }

    /// Keeps matching values in the local tier regardless of its bounds.
    pub fn pinned(self, pinned: impl Fn(&V) -> bool + Send + Sync + 'static) -> Self {
        Self {
            local: self
                .local
                .pinned(move |record: &LocalRecord<V>| pinned(&record.value)),
            ..self
        }
    }

    /// Notified when the local tier drops an entry on its own.
    pub fn eviction_listener(
        self,
        listener: impl Fn(&K, RemovalCause) + Send + Sync + 'static,
    ) -> Self {
        Self {
            local: self.local.eviction_listener(listener),
            ..self
        }
    }

    pub fn nonstop_timeout(self, timeout: Duration) -> Self {
        Self {
            nonstop: NonstopHandler::new(timeout),
            ..self
        }
    }

    pub(crate) fn clock(self, clock: Clock) -> Self {
        Self {
            local: self.local.clock(clock.clone()),
            clock: Some(clock),
            ..self
        }
    }

    pub fn build(self) -> TieredStorage<K, V> {
        let namespace = format!("{}:", self.name);
        TieredStorage {
            keys_prefix: format!("{namespace}k:"),
            seq_key: format!("{namespace}seq"),
            name: self.name,
            local: self.local.build(),
            remote: self.remote,
            nonstop: self.nonstop,
            clock: self.clock.unwrap_or_default(),
            destroyed: AtomicBool::new(false),
        }
    }
}

/// A process-local map mirroring a distributed [`RemoteStore`].
///
/// Every write takes a fresh stamp from a region-wide remote counter and
/// stores it twice: inside the value record and under a small per-key stamp
/// key. A read fetches only the stamp and serves the local copy when the
/// stamps agree. Otherwise another process wrote (or removed) the key since,
/// the local copy is discarded, and the value is read through from the remote
/// store. A remote record whose stamp disagrees with the stamp key belongs to
/// a write still in flight and is reported as a miss.
pub struct TieredStorage<K, V> {
    name: String,
    keys_prefix: String,
    seq_key: String,
    local: LocalStorage<K, LocalRecord<V>>,
    remote: Arc<dyn RemoteStore>,
    nonstop: NonstopHandler,
    clock: Clock,
    destroyed: AtomicBool,
}

impl<K, V> TieredStorage<K, V>
where
    K: Eq + Hash + Clone + Serialize + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn builder(
        name: impl Into<String>,
        remote: Arc<dyn RemoteStore>,
    ) -> TieredStorageBuilder<K, V> {
        let name = name.into();
        TieredStorageBuilder {
            local: LocalStorageBuilder::new(format!("{name}.local")),
            name,
            remote,
            nonstop: NonstopHandler::default(),
            clock: None,
            storage_type: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compares the local copy's stamp with the remote stamp. Returns the
    /// local value when it is still current and drops it otherwise.
    pub(crate) fn validate_entry_based_on_timestamp(
        &self,
        key: &K,
        remote_stamp: Option<u64>,
    ) -> Result<Option<V>> {
        let local = self.local.get(key)?;
        match (local, remote_stamp) {
            (Some(local), Some(stamp)) if local.stamp == stamp => Ok(Some(local.value)),
            (Some(_), _) => {
                log::debug!(
                    "Discarding local copy in region `{}`; remote stamp is {:?}",
                    self.name,
                    remote_stamp
                );
                self.local.remove(key)?;
                Ok(None)
            }
            (None, _) => Ok(None),
        }
    }

    fn remote_key(&self, kind: &str, key: &K) -> Result<String> {
        let encoded = serde_json::to_string(key)?;
        Ok(format!("{}{}:{}", self.keys_prefix, kind, encoded))
    }

    fn call<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce() -> std::result::Result<T, RemoteError>,
    ) -> Result<T> {
        self.nonstop.call(&self.clock, &self.name, operation, f)
    }

    fn read(&self, key: &K) -> Result<Option<V>> {
        let stamp_key = self.remote_key("t", key)?;
        let remote_stamp = self
            .call("get", || self.remote.get(&stamp_key))?
            .and_then(|bytes| std::str::from_utf8(&bytes).ok()?.parse::<u64>().ok());

        if let Some(value) = self.validate_entry_based_on_timestamp(key, remote_stamp)? {
            return Ok(Some(value));
        }
        let Some(stamp) = remote_stamp else {
            return Ok(None);
        };

        let value_key = self.remote_key("v", key)?;
        let Some(bytes) = self.call("get", || self.remote.get(&value_key))? else {
            return Ok(None);
        };
        let record: RemoteRecord<V> = serde_json::from_slice(&bytes)?;
        if record.stamp != stamp {
            return Ok(None);
        }
        self.local.put(
            key.clone(),
            LocalRecord {
                stamp,
                value: record.value.clone(),
            },
        )?;
        Ok(Some(record.value))
    }

    fn write(&self, key: &K, value: &V) -> Result<u64> {
        let stamp = self.call("increment", || self.remote.increment(&self.seq_key))?;
        let bytes = serde_json::to_vec(&RemoteRecord { stamp, value })?;
        let value_key = self.remote_key("v", key)?;
        self.call("set", || self.remote.set(&value_key, bytes))?;
        let stamp_key = self.remote_key("t", key)?;
        self.call("set", || {
            self.remote.set(&stamp_key, stamp.to_string().into_bytes())
        })?;
        Ok(stamp)
    }
}

impl<K, V> StorageAccess<K, V> for TieredStorage<K, V>
where
    K: Eq + Hash + Clone + Serialize + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Result<Option<V>> {
        if self.destroyed.load(Ordering::Acquire) {
            return Ok(None);
        }
        match self.read(key) {
            Err(e @ CacheError::Nonstop { .. }) => {
                self.nonstop.handle(&self.name, &e);
                Ok(None)
            }
            other => other,
        }
    }

    fn put(&self, key: K, value: V) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.write(&key, &value) {
            Ok(stamp) => self.local.put(key, LocalRecord { stamp, value }),
            Err(e) => {
                // The remote copy is unknown now; never serve the local one.
                self.local.remove(&key)?;
                Err(e)
            }
        }
    }

    fn remove(&self, key: &K) -> Result<()> {
        self.local.remove(key)?;
        let value_key = self.remote_key("v", key)?;
        self.call("delete", || self.remote.delete(&value_key))?;
        let stamp_key = self.remote_key("t", key)?;
        self.call("delete", || self.remote.delete(&stamp_key))
    }

    fn clear(&self) -> Result<()> {
        self.local.clear()?;
        let removed = self.call("delete_prefix", || {
            self.remote.delete_prefix(&self.keys_prefix)
        })?;
        log::debug!("Cleared {removed} remote keys of region `{}`", self.name);
        Ok(())
    }

    fn element_count_in_memory(&self) -> u64 {
        self.local.element_count_in_memory()
    }

    fn size_in_memory(&self) -> u64 {
        self.local.size_in_memory()
    }

    /// Releases the local tier. Remote data is shared with other processes
    /// and stays in place.
    fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.local.destroy()?;
        log::debug!("Destroyed tiered storage `{}`", self.name);
        Ok(())
    }
}
