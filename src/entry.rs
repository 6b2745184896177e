//! Cache-safe snapshots of entity and collection state.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::{
    key::Identifier,
    persister::{EntityPersister, PropertyAccess},
    CacheError, Result,
};

/// A single disassembled property value.
///
/// Floats compare and hash by their bit pattern so that `CacheValue` can take
/// part in keys (natural ids, query parameters).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CacheValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// A reference to another entity, held by identifier only.
    Id(Identifier),
    List(Vec<CacheValue>),
}

impl CacheValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn estimated_size(&self) -> usize {
        let inline = std::mem::size_of::<Self>();
        match self {
            Self::Text(s) => inline + s.len(),
            Self::Bytes(b) => inline + b.len(),
            Self::Id(id) => inline + id.estimated_size(),
            Self::List(vs) => inline + vs.iter().map(Self::estimated_size).sum::<usize>(),
            _ => inline,
        }
    }
}

impl PartialEq for CacheValue {
    fn eq(&self, other: &Self) -> bool {
        use CacheValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (Text(a), Text(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Id(a), Id(b)) => a == b,
            (List(a), List(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for CacheValue {}

impl Hash for CacheValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(n) => n.hash(state),
            Self::Float(f) => f.to_bits().hash(state),
            Self::Text(s) => s.hash(state),
            Self::Bytes(b) => b.hash(state),
            Self::Id(id) => id.hash(state),
            Self::List(vs) => vs.hash(state),
        }
    }
}

impl From<bool> for CacheValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for CacheValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for CacheValue {
    fn from(n: i32) -> Self {
        Self::Int(n.into())
    }
}

impl From<f64> for CacheValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for CacheValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Identifier> for CacheValue {
    fn from(id: Identifier) -> Self {
        Self::Id(id)
    }
}

impl<T: Into<CacheValue>> From<Option<T>> for CacheValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// An entity version. Greater is newer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub i64);

/// The disassembled, cache-safe state of an entity or a collection.
///
/// An entry holds no reference to a live object: property values are copied
/// into [`CacheValue`]s in the persister's property order, so mutating the
/// entity after caching never changes what other sessions read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    values: Vec<CacheValue>,
    version: Option<Version>,
    subclass: Option<String>,
}

impl CacheEntry {
    pub fn new(values: Vec<CacheValue>, version: Option<Version>) -> Self {
        Self {
            values,
            version,
            subclass: None,
        }
    }

    pub fn with_subclass(self, subclass: impl Into<String>) -> Self {
        Self {
            subclass: Some(subclass.into()),
            ..self
        }
    }

    /// Copies the state of `entity` out through the persister's accessors.
    pub fn disassemble<P>(persister: &P, entity: &P::Entity) -> Self
    where
        P: EntityPersister + ?Sized,
    {
        let values = (0..entity.property_count())
            .map(|i| entity.get(i))
            .collect();
        Self {
            values,
            version: persister.version(entity),
            subclass: persister.subclass(entity),
        }
    }

    /// Writes the cached state back into `entity`.
    ///
    /// Fails when the entry was written for a different property layout, in
    /// which case the caller should treat the entry as a miss.
    pub fn assemble<P>(&self, persister: &P, entity: &mut P::Entity) -> Result<()>
    where
        P: EntityPersister + ?Sized,
    {
        let expected = persister.property_names().len();
        if self.values.len() != expected || entity.property_count() != expected {
            return Err(CacheError::provider(
                persister.root_entity_name(),
                format!(
                    "cached state of `{}` has {} properties, expected {}",
                    persister.entity_name(),
                    self.values.len(),
                    expected
                ),
            ));
        }
        for (i, value) in self.values.iter().enumerate() {
            entity.set(i, value.clone());
        }
        Ok(())
    }

    pub fn values(&self) -> &[CacheValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<CacheValue> {
        self.values
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn subclass(&self) -> Option<&str> {
        self.subclass.as_deref()
    }

    pub(crate) fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.values.iter().map(CacheValue::estimated_size).sum::<usize>()
            + self.subclass.as_ref().map_or(0, String::len)
    }
}
