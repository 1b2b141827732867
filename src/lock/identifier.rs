use crate::catalog::schema::{AllocationId, EntityId, NamespaceId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Local transaction id, unique within one manager.
pub type TxId = u64;

/// Reserved id for the catalog-wide lock. Never handed out by a catalog.
pub const GLOBAL_ENTITY_ID: EntityId = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NamespaceLevel {
    /// Whole namespace, used for graph namespaces which have no sub-entity
    /// partitioning.
    Namespace,
    Entity,
}

/// One lockable unit: a logical entity, one allocation of it, or a whole
/// namespace.
///
/// Identity is `(entity_id, allocation_id)`; `level` is carried along but does
/// not take part in equality, hashing or ordering. A namespace and an entity
/// sharing a numeric id therefore map to the same lock.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EntityIdentifier {
    pub entity_id: EntityId,
    pub allocation_id: AllocationId,
    pub level: NamespaceLevel,
}

impl EntityIdentifier {
    pub fn new(entity_id: EntityId, allocation_id: AllocationId, level: NamespaceLevel) -> Self {
        Self {
            entity_id,
            allocation_id,
            level,
        }
    }

    pub fn entity(entity_id: EntityId, allocation_id: AllocationId) -> Self {
        Self::new(entity_id, allocation_id, NamespaceLevel::Entity)
    }

    pub fn namespace(namespace_id: NamespaceId) -> Self {
        Self::new(namespace_id, 0, NamespaceLevel::Namespace)
    }

    pub fn global() -> Self {
        Self::new(GLOBAL_ENTITY_ID, 0, NamespaceLevel::Namespace)
    }

    pub fn is_global(&self) -> bool {
        self.entity_id == GLOBAL_ENTITY_ID && self.allocation_id == 0
    }

    fn key(&self) -> (EntityId, AllocationId) {
        (self.entity_id, self.allocation_id)
    }
}

impl PartialEq for EntityIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for EntityIdentifier {}

impl Hash for EntityIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for EntityIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntityIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for EntityIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_global() {
            return write!(f, "global");
        }
        match self.level {
            NamespaceLevel::Namespace => write!(f, "namespace {}", self.entity_id),
            NamespaceLevel::Entity => {
                write!(f, "entity {}.{}", self.entity_id, self.allocation_id)
            }
        }
    }
}
