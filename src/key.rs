//! Cache keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    entry::CacheValue,
    persister::{EntityPersister, PersisterMetadata},
};

/// An entity or collection-owner identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identifier {
    Long(i64),
    Text(String),
    Uuid(Uuid),
    Composite(Vec<Identifier>),
}

impl Identifier {
    pub(crate) fn estimated_size(&self) -> usize {
        let inline = std::mem::size_of::<Self>();
        match self {
            Self::Text(s) => inline + s.len(),
            Self::Composite(ids) => inline + ids.iter().map(Self::estimated_size).sum::<usize>(),
            _ => inline,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Composite(ids) => {
                f.write_str("(")?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{id}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<i64> for Identifier {
    fn from(n: i64) -> Self {
        Self::Long(n)
    }
}

impl From<i32> for Identifier {
    fn from(n: i32) -> Self {
        Self::Long(n.into())
    }
}

impl From<&str> for Identifier {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Identifier {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Uuid> for Identifier {
    fn from(u: Uuid) -> Self {
        Self::Uuid(u)
    }
}

/// What a [`CacheKey`] identifies within its role.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyId {
    /// A primary key (entities) or owner key (collections).
    Id(Identifier),
    /// The values of an entity's natural-id properties, in mapping order.
    NaturalId(Vec<CacheValue>),
}

/// The key of an entity, collection or natural-id cache slot.
///
/// Two keys are equal when they name the same role, identifier and tenant.
/// Keys contain only owned data and serialize to a stable form, so they can
/// be shipped to a distributed store and compared after the round trip.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    role: String,
    id: KeyId,
    tenant: Option<String>,
}

impl CacheKey {
    pub fn new(role: impl Into<String>, id: impl Into<Identifier>) -> Self {
        Self {
            role: role.into(),
            id: KeyId::Id(id.into()),
            tenant: None,
        }
    }

    pub fn with_tenant(self, tenant: impl Into<String>) -> Self {
        Self {
            tenant: Some(tenant.into()),
            ..self
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn id(&self) -> &KeyId {
        &self.id
    }

    /// The identifier of an entity or collection key, `None` for natural-id
    /// keys.
    pub fn identifier(&self) -> Option<&Identifier> {
        match &self.id {
            KeyId::Id(id) => Some(id),
            KeyId::NaturalId(_) => None,
        }
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    pub(crate) fn estimated_size(&self) -> usize {
        let id = match &self.id {
            KeyId::Id(id) => id.estimated_size(),
            KeyId::NaturalId(vs) => vs.iter().map(CacheValue::estimated_size).sum(),
        };
        std::mem::size_of::<Self>()
            + self.role.len()
            + id
            + self.tenant.as_ref().map_or(0, String::len)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            KeyId::Id(id) => write!(f, "{}#{}", self.role, id)?,
            KeyId::NaturalId(values) => write!(f, "{}##NaturalId{:?}", self.role, values)?,
        }
        if let Some(tenant) = &self.tenant {
            write!(f, "@{tenant}")?;
        }
        Ok(())
    }
}

/// Builds keys the way the session layer expects them.
///
/// Entity keys use the root entity name, so an entity cached through a
/// subclass persister is found through the root persister and vice versa.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheKeysFactory;

impl CacheKeysFactory {
    pub fn create_entity_key<P>(
        id: impl Into<Identifier>,
        persister: &P,
        tenant: Option<&str>,
    ) -> CacheKey
    where
        P: EntityPersister + ?Sized,
    {
        Self::with_tenant(CacheKey::new(persister.root_entity_name(), id), tenant)
    }

    pub fn create_collection_key(
        owner_id: impl Into<Identifier>,
        persister: &(impl PersisterMetadata + ?Sized),
        tenant: Option<&str>,
    ) -> CacheKey {
        Self::with_tenant(CacheKey::new(persister.role(), owner_id), tenant)
    }

    pub fn create_natural_id_key<P>(
        values: Vec<CacheValue>,
        persister: &P,
        tenant: Option<&str>,
    ) -> CacheKey
    where
        P: EntityPersister + ?Sized,
    {
        let key = CacheKey {
            role: persister.root_entity_name().to_string(),
            id: KeyId::NaturalId(values),
            tenant: None,
        };
        Self::with_tenant(key, tenant)
    }

    fn with_tenant(key: CacheKey, tenant: Option<&str>) -> CacheKey {
        match tenant {
            Some(t) => key.with_tenant(t),
            None => key,
        }
    }
}
