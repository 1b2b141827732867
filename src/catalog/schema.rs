use serde::{Deserialize, Serialize};

pub type NamespaceId = u64;
pub type EntityId = u64;
pub type AllocationId = u64;
pub type AdapterId = u64;

/// Data model a namespace (and every entity in it) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataModel {
    Relational,
    Document,
    Graph,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceDef {
    pub id: NamespaceId,
    pub name: String,
    pub model: DataModel,
}

/// Physical placement of (part of) a logical entity on one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationDef {
    pub id: AllocationId,
    pub entity_id: EntityId,
    pub adapter_id: AdapterId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub columns: Vec<String>,
    pub references_entity: EntityId,
    pub references_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDef {
    pub id: EntityId,
    pub namespace_id: NamespaceId,
    pub name: String,
    pub model: DataModel,
    pub allocations: Vec<AllocationId>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl EntityDef {
    pub fn new(
        id: EntityId,
        namespace_id: NamespaceId,
        name: impl Into<String>,
        model: DataModel,
    ) -> Self {
        Self {
            id,
            namespace_id,
            name: name.into(),
            model,
            allocations: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Entities this one points at through its foreign keys, deduplicated.
    pub fn referenced_entities(&self) -> Vec<EntityId> {
        let mut out: Vec<EntityId> = self
            .foreign_keys
            .iter()
            .map(|fk| fk.references_entity)
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}
