//! The cache's view of a database transaction.

use std::fmt;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::common::time::timestamper::Timestamp;

/// A callback run once the surrounding transaction has committed or rolled
/// back.
///
/// Closures taking the outcome (`true` on commit) implement this trait.
pub trait TransactionSynchronization: Send {
    fn after_completion(self: Box<Self>, success: bool);
}

impl<F> TransactionSynchronization for F
where
    F: FnOnce(bool) + Send,
{
    fn after_completion(self: Box<Self>, success: bool) {
        (*self)(success)
    }
}

/// A unit of work as seen by the cache.
///
/// Created by [`RegionFactory::begin_transaction`][begin-tx], which stamps it
/// with the factory's next timestamp. Access strategies compare cached data
/// against this start timestamp, and the transactional strategy registers its
/// pending writes as synchronizations.
///
/// Call [`complete`](#method.complete) with the outcome of the database
/// transaction. A transaction dropped without completion is treated as rolled
/// back.
///
/// [begin-tx]: ./struct.RegionFactory.html#method.begin_transaction
pub struct CacheTransaction {
    id: Uuid,
    start_timestamp: Timestamp,
    synchronizations: Mutex<Vec<Box<dyn TransactionSynchronization>>>,
}

impl CacheTransaction {
    pub(crate) fn new(start_timestamp: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            start_timestamp,
            synchronizations: Mutex::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn start_timestamp(&self) -> Timestamp {
        self.start_timestamp
    }

    pub fn register_synchronization(&self, sync: impl TransactionSynchronization + 'static) {
        self.synchronizations.lock().push(Box::new(sync));
    }

    /// Runs the registered synchronizations in registration order.
    pub fn complete(self, success: bool) {
        self.run_synchronizations(success);
    }

    fn run_synchronizations(&self, success: bool) {
        let syncs = std::mem::take(&mut *self.synchronizations.lock());
        if !syncs.is_empty() {
            log::debug!(
                "Completing cache transaction {} (success: {success}), {} synchronization(s)",
                self.id,
                syncs.len()
            );
        }
        for sync in syncs {
            sync.after_completion(success);
        }
    }
}

impl Drop for CacheTransaction {
    fn drop(&mut self) {
        self.run_synchronizations(false);
    }
}

impl fmt::Debug for CacheTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheTransaction")
            .field("id", &self.id)
            .field("start_timestamp", &self.start_timestamp)
            .field("pending", &self.synchronizations.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::CacheTransaction;

    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn synchronizations_run_once_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tx = CacheTransaction::new(10);
        for i in 0..3 {
            let log = Arc::clone(&log);
            tx.register_synchronization(move |success| log.lock().push((i, success)));
        }

        tx.complete(true);
        assert_eq!(*log.lock(), vec![(0, true), (1, true), (2, true)]);
    }

    #[test]
    fn dropping_rolls_back() {
        let outcome = Arc::new(Mutex::new(None));
        {
            let tx = CacheTransaction::new(10);
            let outcome = Arc::clone(&outcome);
            tx.register_synchronization(move |success| *outcome.lock() = Some(success));
        }
        assert_eq!(*outcome.lock(), Some(false));
    }
}
