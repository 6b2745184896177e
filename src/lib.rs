#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! A second-level cache for object-relational mappers.
//!
//! The cache sits between an ORM session and the database. It keeps the
//! disassembled state of entities, the elements of collections, natural-id
//! resolutions and query results in named *regions*, and decides under which
//! concurrency rules a transaction may read or replace them.
//!
//! # Regions and access types
//!
//! Every domain region is built by a [`RegionFactory`] with one of four
//! [`AccessType`]s:
//!
//! - `ReadOnly`: data that is never updated. Updates are rejected.
//! - `NonstrictReadWrite`: writes evict the cached entry. A reader may see
//!   stale data for the duration of a concurrent transaction.
//! - `ReadWrite`: writes place a *soft lock* in the cache until the
//!   transaction completes. Locked entries are never served, and a load that
//!   started before the last write of a key can no longer overwrite it.
//! - `Transactional`: writes are staged in the [`CacheTransaction`] and
//!   applied only when it commits.
//!
//! Timestamps come from one strictly increasing clock per factory (see
//! [`RegionFactory::next_timestamp`]), so "started before" is a plain
//! comparison of [`Timestamp`]s.
//!
//! # Query cache
//!
//! When enabled, query results are cached in a [`QueryResultsCache`] together
//! with the start timestamp of the transaction that read them. A
//! [`TimestampsRegion`] records when each table space was last modified;
//! results older than a modification of one of their spaces are stale.
//!
//! # Storage
//!
//! Regions keep their data in process memory ([`storage::LocalStorage`]), or
//! in a local tier in front of a store shared with other processes
//! ([`storage::TieredStorage`]). Failures of the storage are logged and read
//! as cache misses, so that a broken cache never fails a database
//! transaction.
//!
//! # Example
//!
//! ```rust
//! use orm_cache::{AccessType, CacheEntry, CacheKey, RegionFactory, RegionKind, Version};
//!
//! let factory = RegionFactory::builder().build();
//! let items = factory
//!     .build_domain_region(RegionKind::Entity, "Item", Some(AccessType::ReadWrite))
//!     .unwrap();
//! let key = CacheKey::new("Item", 1);
//!
//! // A session loads the entity from the database and caches it.
//! let tx = factory.begin_transaction();
//! let loaded = CacheEntry::new(vec!["widget".into()], Some(Version(1)));
//! items.put_from_load(&key, loaded, &tx, Some(Version(1)), false).unwrap();
//! tx.complete(true);
//!
//! // Another session updates it. While the update is in flight the entry
//! // is locked and nobody reads it from the cache.
//! let writer = factory.begin_transaction();
//! let lock = items.lock_item(&key, Some(Version(1)), &writer).unwrap();
//! let reader = factory.begin_transaction();
//! assert!(items.get(&key, &reader).unwrap().is_none());
//!
//! let updated = CacheEntry::new(vec!["gadget".into()], Some(Version(2)));
//! items.update(&key, updated.clone(), &writer).unwrap();
//! writer.complete(true);
//! items.after_update(&key, updated, lock).unwrap();
//!
//! let reader = factory.begin_transaction();
//! let cached = items.get(&key, &reader).unwrap().unwrap();
//! assert_eq!(cached.values()[0].as_text(), Some("gadget"));
//! ```

pub(crate) mod access;
pub(crate) mod common;
pub(crate) mod config;
pub(crate) mod entry;
pub(crate) mod factory;
pub(crate) mod key;
pub(crate) mod persister;
pub(crate) mod query;
pub(crate) mod region;
pub(crate) mod stats;
pub mod storage;
pub(crate) mod timestamps;
pub(crate) mod transaction;

pub use access::{AccessType, SoftLock};
pub use common::{
    error::{CacheError, Result},
    time::timestamper::Timestamp,
};
pub use config::{CacheSettings, RegionConfig, RegionConfigBuilder};
pub use entry::{CacheEntry, CacheValue, Version};
pub use factory::{RegionFactory, RegionFactoryBuilder};
pub use key::{CacheKey, CacheKeysFactory, Identifier, KeyId};
pub use persister::{EntityPersister, PersisterMetadata, PropertyAccess};
pub use query::{QueryKey, QueryResultsCache};
pub use region::{Region, RegionKind};
pub use stats::RegionStats;
pub use timestamps::TimestampsRegion;
pub use transaction::{CacheTransaction, TransactionSynchronization};
