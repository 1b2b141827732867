use crate::config::TxConfig;
use crate::error::TxError;
use crate::lock::entity_lock::{Grant, Lock, LockMode};
use crate::lock::table::LockTable;
use crate::lock::wait_graph::WaitForGraph;
use crate::lock::{EntityIdentifier, TxId};
use std::time::Duration;
use tracing::debug;

/// The concurrency-control service: fine-grained entity locks, the
/// catalog-wide lock, and the wait-for graph both kinds report into.
///
/// Every entity request first takes the catalog lock shared, so a transaction
/// holding it exclusive (DDL) shuts out all entity-level work until it ends.
/// Built explicitly and shared by `Arc`; there is no process-wide instance.
pub struct ConcurrencyControl {
    table: LockTable,
    catalog_lock: Lock,
    waits: WaitForGraph,
    timeout: Duration,
}

impl ConcurrencyControl {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: LockTable::new(),
            catalog_lock: Lock::new(EntityIdentifier::global()),
            waits: WaitForGraph::new(),
            timeout,
        }
    }

    pub fn from_config(config: &TxConfig) -> Self {
        Self::new(config.lock_wait_timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn wait_graph(&self) -> &WaitForGraph {
        &self.waits
    }

    /// Blocks until `tx` holds `entity` in at least `mode`.
    ///
    /// Fails with `Deadlock` or `LockTimeout` when the wait cannot finish; the
    /// caller owns the decision to roll back.
    pub fn lock(
        &self,
        tx: TxId,
        mode: LockMode,
        entity: EntityIdentifier,
    ) -> Result<Grant, TxError> {
        if entity.is_global() {
            return self
                .catalog_lock
                .acquire(tx, mode, &self.waits, self.timeout);
        }
        self.catalog_lock
            .acquire(tx, LockMode::Shared, &self.waits, self.timeout)?;
        self.table.lock(tx, mode, entity, &self.waits, self.timeout)
    }

    /// Releases every lock `tx` holds and drops it from the wait-for graph.
    /// The graph removal happens even when a release fails.
    pub fn unlock_all(&self, tx: TxId) -> Result<(), TxError> {
        let table_result = self.table.unlock_all(tx);
        let catalog_result = if self.catalog_lock.mode_of(tx).is_some() {
            self.catalog_lock.release(tx)
        } else {
            Ok(())
        };
        self.waits.remove(tx);
        debug!(tx, "released all locks");
        table_result.and(catalog_result)
    }

    pub fn owners(&self, entity: &EntityIdentifier) -> Vec<TxId> {
        if entity.is_global() {
            return self.catalog_lock.owners();
        }
        self.table.owners(entity)
    }

    pub fn mode_of(&self, tx: TxId, entity: &EntityIdentifier) -> Option<LockMode> {
        if entity.is_global() {
            return self.catalog_lock.mode_of(tx);
        }
        self.table.mode_of(tx, entity)
    }

    pub fn waiting(&self, entity: &EntityIdentifier) -> usize {
        if entity.is_global() {
            return self.catalog_lock.waiting();
        }
        self.table.waiting(entity)
    }

    /// Entities `tx` holds, the catalog lock included when held.
    pub fn held_by(&self, tx: TxId) -> Vec<EntityIdentifier> {
        let mut out = self.table.held_by(tx);
        if self.catalog_lock.mode_of(tx).is_some() {
            out.push(EntityIdentifier::global());
        }
        out
    }

    pub fn lock_count(&self) -> usize {
        self.table.lock_count()
    }
}
