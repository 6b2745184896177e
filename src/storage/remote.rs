use std::{
    collections::BTreeMap,
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use parking_lot::{Mutex, RwLock};

/// The failure of a call to a [`RemoteStore`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("remote store call timed out")]
    TimedOut,
}

/// A byte-oriented key-value store shared by several processes, in the style
/// of Redis. It is the authority that [`TieredStorage`] validates its local
/// copies against.
///
/// [`TieredStorage`]: ./struct.TieredStorage.html
pub trait RemoteStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError>;

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), RemoteError>;

    fn delete(&self, key: &str) -> Result<(), RemoteError>;

    /// Deletes every key starting with `prefix` and returns how many were
    /// deleted.
    fn delete_prefix(&self, prefix: &str) -> Result<u64, RemoteError>;

    /// Atomically increments the counter stored at `key` (missing counts as
    /// zero) and returns the new value.
    fn increment(&self, key: &str) -> Result<u64, RemoteError>;
}

/// A [`RemoteStore`] kept in process memory.
///
/// Sharing one instance between several region factories behaves like
/// several processes sharing one remote server. Outages and slow responses can
/// be simulated with [`set_available`](#method.set_available) and
/// [`set_latency`](#method.set_latency).
#[derive(Default)]
pub struct InMemoryRemoteStore {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
    latency: RwLock<Option<Duration>>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Release);
    }

    /// Every subsequent call sleeps for `latency` before answering.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    fn round_trip(&self) -> Result<(), RemoteError> {
        if let Some(latency) = *self.latency.read() {
            thread::sleep(latency);
        }
        if self.unavailable.load(Ordering::Acquire) {
            return Err(RemoteError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

impl RemoteStore for InMemoryRemoteStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        self.round_trip()?;
        Ok(self.data.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), RemoteError> {
        self.round_trip()?;
        self.data.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), RemoteError> {
        self.round_trip()?;
        self.data.lock().remove(key);
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<u64, RemoteError> {
        self.round_trip()?;
        let mut data = self.data.lock();
        let doomed: Vec<String> = data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            data.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    fn increment(&self, key: &str) -> Result<u64, RemoteError> {
        self.round_trip()?;
        let mut data = self.data.lock();
        let current = data
            .get(key)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        data.insert(key.to_string(), next.to_string().into_bytes());
        Ok(next)
    }
}

impl fmt::Debug for InMemoryRemoteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRemoteStore")
            .field("keys", &self.len())
            .field("available", &!self.unavailable.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemoryRemoteStore, RemoteError, RemoteStore};

    #[test]
    fn delete_prefix_only_touches_the_prefix() {
        let store = InMemoryRemoteStore::new();
        store.set("item:v:1", b"a".to_vec()).unwrap();
        store.set("item:v:2", b"b".to_vec()).unwrap();
        store.set("itemx:v:1", b"c".to_vec()).unwrap();
        store.set("order:v:1", b"d".to_vec()).unwrap();

        assert_eq!(store.delete_prefix("item:").unwrap(), 2);
        assert_eq!(store.get("item:v:1").unwrap(), None);
        assert_eq!(store.get("itemx:v:1").unwrap(), Some(b"c".to_vec()));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn increment_counts_from_zero() {
        let store = InMemoryRemoteStore::new();
        assert_eq!(store.increment("seq").unwrap(), 1);
        assert_eq!(store.increment("seq").unwrap(), 2);
    }

    #[test]
    fn outage() {
        let store = InMemoryRemoteStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("k"),
            Err(RemoteError::Unavailable(_))
        ));
        store.set_available(true);
        assert_eq!(store.get("k").unwrap(), None);
    }
}
