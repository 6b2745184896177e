use std::time::Duration;

/// A specialized `Result` type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// The error type for the second-level cache.
///
/// Errors fall into two groups, see [`CacheError::is_recoverable`]:
///
/// - Failures of the underlying cache provider (`Provider`, `Serialization`,
///   `Nonstop`). Access strategies absorb these and degrade to a cache miss or a
///   no-op, so that a misbehaving cache never fails the database transaction.
/// - Violations of the cache's bookkeeping invariants (an update of a read-only
///   entity, an unlock without a matching lock, an unknown region). These are
///   returned to the caller as they indicate a bug in the session layer.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// The underlying storage failed (native library fault, lost connection to
    /// a distributed cache, ...).
    #[error("cache provider failure in region `{region}`: {message}")]
    Provider { region: String, message: String },

    /// A key or value could not be converted to or from its stored form.
    #[error("cache serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A bounded-time operation against a distributed cache ran out of time.
    #[error("nonstop cache operation `{operation}` exceeded its timeout of {timeout:?}")]
    Nonstop {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("no cache region named `{0}`")]
    RegionNotFound(String),

    #[error("cache region `{0}` has been destroyed")]
    RegionDestroyed(String),

    #[error("cannot update an entity cached in read-only region `{region}`")]
    ReadOnlyUpdate { region: String },

    /// An unlock did not match the lock held in the slot (e.g. released twice).
    #[error("illegal soft-lock state in region `{region}`: {message}")]
    IllegalLockState { region: String, message: String },

    #[error("unknown cache access type `{0}`")]
    UnknownAccessType(String),

    #[error("invalid cache configuration: {0}")]
    InvalidConfiguration(String),
}

impl CacheError {
    pub(crate) fn provider(region: &str, message: impl Into<String>) -> Self {
        Self::Provider {
            region: region.to_string(),
            message: message.into(),
        }
    }

    /// Returns `true` when the failure came from the cache provider and the
    /// caller may carry on as if the cache had missed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Provider { .. } | Self::Serialization(_) | Self::Nonstop { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::CacheError;
    use std::time::Duration;

    #[test]
    fn provider_failures_are_recoverable() {
        assert!(CacheError::provider("item", "connection reset").is_recoverable());
        assert!(CacheError::Nonstop {
            operation: "get",
            timeout: Duration::from_millis(50)
        }
        .is_recoverable());
    }

    #[test]
    fn invariant_violations_are_fatal() {
        assert!(!CacheError::ReadOnlyUpdate {
            region: "item".into()
        }
        .is_recoverable());
        assert!(!CacheError::RegionNotFound("nope".into()).is_recoverable());
        assert_eq!(
            CacheError::RegionNotFound("nope".into()).to_string(),
            "no cache region named `nope`"
        );
    }
}
