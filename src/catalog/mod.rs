pub mod schema;

use crate::catalog::schema::{
    AdapterId, AllocationDef, AllocationId, EntityDef, EntityId, NamespaceDef, NamespaceId,
};
use crate::error::TxError;
use im::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metadata store the transaction layer commits and rolls back alongside the
/// adapters. Snapshots are immutable and cheap to clone.
pub trait Catalog: Send + Sync {
    fn commit(&self) -> Result<(), TxError>;
    fn rollback(&self) -> Result<(), TxError>;
    fn snapshot(&self) -> Arc<CatalogSnapshot>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSnapshot {
    pub namespaces: HashMap<NamespaceId, NamespaceDef>,
    pub entities: HashMap<EntityId, EntityDef>,
    pub allocations: HashMap<AllocationId, AllocationDef>,
}

impl CatalogSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_namespace(&mut self, namespace: NamespaceDef) {
        self.namespaces.insert(namespace.id, namespace);
    }

    /// Registers an entity. Allocations listed on the definition that are not
    /// yet known stay dangling until `add_allocation` supplies them.
    pub fn add_entity(&mut self, entity: EntityDef) {
        self.entities.insert(entity.id, entity);
    }

    pub fn add_allocation(&mut self, allocation: AllocationDef) -> Result<(), TxError> {
        let Some(entity) = self.entities.get_mut(&allocation.entity_id) else {
            return Err(TxError::UnknownEntity(allocation.entity_id));
        };
        if !entity.allocations.contains(&allocation.id) {
            entity.allocations.push(allocation.id);
        }
        self.allocations.insert(allocation.id, allocation);
        Ok(())
    }

    pub fn drop_entity(&mut self, entity_id: EntityId) -> Option<EntityDef> {
        let entity = self.entities.remove(&entity_id)?;
        for allocation_id in &entity.allocations {
            self.allocations.remove(allocation_id);
        }
        Some(entity)
    }

    pub fn entity(&self, entity_id: EntityId) -> Option<&EntityDef> {
        self.entities.get(&entity_id)
    }

    pub fn namespace(&self, namespace_id: NamespaceId) -> Option<&NamespaceDef> {
        self.namespaces.get(&namespace_id)
    }

    pub fn allocation(&self, allocation_id: AllocationId) -> Option<&AllocationDef> {
        self.allocations.get(&allocation_id)
    }

    pub fn allocations_of(&self, entity_id: EntityId) -> Result<Vec<AllocationId>, TxError> {
        self.entity(entity_id)
            .map(|entity| entity.allocations.clone())
            .ok_or(TxError::UnknownEntity(entity_id))
    }

    pub fn adapter_of(&self, allocation_id: AllocationId) -> Option<AdapterId> {
        self.allocation(allocation_id).map(|a| a.adapter_id)
    }

    /// Adapters hosting any allocation of the entity.
    pub fn adapters_of_entity(&self, entity_id: EntityId) -> BTreeSet<AdapterId> {
        self.entity(entity_id)
            .map(|entity| {
                entity
                    .allocations
                    .iter()
                    .filter_map(|id| self.adapter_of(*id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Adapters hosting any allocation of any entity in the namespace.
    pub fn adapters_of_namespace(&self, namespace_id: NamespaceId) -> BTreeSet<AdapterId> {
        self.entities
            .values()
            .filter(|entity| entity.namespace_id == namespace_id)
            .flat_map(|entity| self.adapters_of_entity(entity.id))
            .collect()
    }
}

/// In-process catalog. Changes are staged against a pending snapshot and only
/// become visible through `snapshot()` once committed.
pub struct MemoryCatalog {
    committed: Mutex<Arc<CatalogSnapshot>>,
    pending: Mutex<Option<CatalogSnapshot>>,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new(CatalogSnapshot::default())
    }
}

impl MemoryCatalog {
    pub fn new(initial: CatalogSnapshot) -> Self {
        Self {
            committed: Mutex::new(Arc::new(initial)),
            pending: Mutex::new(None),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        }
    }

    /// Applies `change` to the pending snapshot, starting one from the
    /// committed state if nothing is staged yet.
    pub fn stage<F>(&self, change: F) -> Result<(), TxError>
    where
        F: FnOnce(&mut CatalogSnapshot) -> Result<(), TxError>,
    {
        let mut pending = self.pending.lock();
        let mut working = match pending.as_ref() {
            Some(staged) => staged.clone(),
            None => (**self.committed.lock()).clone(),
        };
        // a failed change leaves the staged snapshot as it was
        change(&mut working)?;
        *pending = Some(working);
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn rollback_count(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }
}

impl Catalog for MemoryCatalog {
    fn commit(&self) -> Result<(), TxError> {
        if let Some(staged) = self.pending.lock().take() {
            *self.committed.lock() = Arc::new(staged);
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback(&self) -> Result<(), TxError> {
        self.pending.lock().take();
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.committed.lock())
    }
}
