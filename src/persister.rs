//! Contracts the cache consumes from the persistence layer.
//!
//! The cache never inspects entities reflectively. Each entity type provides a
//! [`PropertyAccess`] implementation (usually generated alongside the mapping)
//! that reads and writes its persistent properties by position, and a
//! [`EntityPersister`] that describes the type.

use crate::{entry::CacheValue, entry::Version, key::Identifier};

/// Positional access to the persistent properties of an entity.
///
/// Indexes run from `0` to `property_count() - 1` in the order reported by
/// [`EntityPersister::property_names`].
pub trait PropertyAccess {
    fn property_count(&self) -> usize;

    fn get(&self, index: usize) -> CacheValue;

    fn set(&mut self, index: usize, value: CacheValue);
}

/// The type-independent part of a persister, used by the region factory to
/// route evictions.
pub trait PersisterMetadata: Send + Sync {
    /// The entity name or collection role.
    fn role(&self) -> &str;

    /// The tables the entity or collection is stored in. Bulk statements and
    /// query invalidation are expressed in terms of these.
    fn table_spaces(&self) -> &[String];
}

/// Describes an entity type to the cache.
pub trait EntityPersister: PersisterMetadata {
    type Entity: PropertyAccess;

    fn entity_name(&self) -> &str {
        self.role()
    }

    /// The root of the inheritance hierarchy. All subclasses share the root's
    /// cache keys.
    fn root_entity_name(&self) -> &str {
        self.entity_name()
    }

    fn property_names(&self) -> &[String];

    fn identifier(&self, entity: &Self::Entity) -> Identifier;

    fn version(&self, _entity: &Self::Entity) -> Option<Version> {
        None
    }

    /// The concrete subclass of `entity` when it differs from the persister's
    /// own entity name.
    fn subclass(&self, _entity: &Self::Entity) -> Option<String> {
        None
    }
}
