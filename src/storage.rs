//! Storage engines behind cache regions.
//!
//! Every region reaches its data through a [`StorageAccess`] implementation:
//!
//! - [`LocalStorage`] keeps entries in process memory, optionally bounded by
//!   entry count and time to live.
//! - [`TieredStorage`] keeps a local copy in front of a [`RemoteStore`] shared
//!   by several processes and validates the local copy against the remote write
//!   stamp on every read.

use std::sync::Arc;

use crate::Result;

pub(crate) mod local;
pub(crate) mod remote;
pub(crate) mod tiered;

pub use local::{LocalStorage, LocalStorageBuilder};
pub use remote::{InMemoryRemoteStore, RemoteError, RemoteStore};
pub use tiered::{NonstopHandler, TieredStorage, TieredStorageBuilder};

/// Uniform access to the storage of a region.
///
/// Implementations must be safe to share between threads. Failures of the
/// underlying provider are reported as recoverable [`CacheError`]s; callers in
/// this crate turn them into cache misses.
///
/// [`CacheError`]: ../enum.CacheError.html
pub trait StorageAccess<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Result<Option<V>>;

    fn put(&self, key: K, value: V) -> Result<()>;

    fn remove(&self, key: &K) -> Result<()>;

    fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Removes every entry.
    fn clear(&self) -> Result<()>;

    fn element_count_in_memory(&self) -> u64;

    /// Estimated bytes held in process memory.
    fn size_in_memory(&self) -> u64;

    /// Releases the underlying resources. Calling it again, or concurrently
    /// with other operations, is harmless: reads after destruction miss and
    /// writes are dropped.
    fn destroy(&self) -> Result<()>;
}

/// Why the storage dropped an entry on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalCause {
    /// The entry outlived the storage's time to live.
    Expired,
    /// The entry was evicted to honor the storage's size bound.
    Size,
}

/// Computes the relative size of an entry, used for `size_in_memory`.
pub type Weigher<K, V> = Arc<dyn Fn(&K, &V) -> u32 + Send + Sync + 'static>;

/// Selects the values a storage must keep regardless of its bounds.
pub type Pinned<V> = Arc<dyn Fn(&V) -> bool + Send + Sync + 'static>;

/// Notified when the storage drops an entry on its own. Called while the
/// storage holds internal locks, so it must not call back into the storage.
pub type EvictionListener<K> = Arc<dyn Fn(&K, RemovalCause) + Send + Sync + 'static>;
