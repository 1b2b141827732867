use crate::access::{AllocationRouting, EntityAccessMap, PlanNode};
use crate::error::TxError;
use crate::lock::{EntityIdentifier, LockMode};
use crate::txn::transaction::Transaction;
use tracing::debug;

/// One query executed inside a transaction.
#[derive(Debug)]
pub struct Statement<'a> {
    tx: &'a Transaction,
    id: u64,
    access: Option<EntityAccessMap>,
}

impl<'a> Statement<'a> {
    pub(crate) fn new(tx: &'a Transaction, id: u64) -> Self {
        Self {
            tx,
            id,
            access: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transaction(&self) -> &'a Transaction {
        self.tx
    }

    /// Access map from the last successful `acquire_locks`.
    pub fn access_map(&self) -> Option<&EntityAccessMap> {
        self.access.as_ref()
    }

    /// Classifies `plan` and blocks until every lock it needs is held.
    ///
    /// The catalog-wide lock is taken shared before the catalog is read, so
    /// the snapshot the access map is built from cannot change under a
    /// concurrent DDL commit. Entity locks follow in identifier order.
    /// Adapters owning touched allocations join the transaction before any
    /// entity lock is requested, so a rollback triggered by a failed wait
    /// reaches them too.
    pub fn acquire_locks(
        &mut self,
        plan: &PlanNode,
        routing: &AllocationRouting,
    ) -> Result<&EntityAccessMap, TxError> {
        if plan.binds_any() {
            self.tx
                .lock(LockMode::Shared, EntityIdentifier::global())?;
        }

        let shared = self.tx.shared();
        let snapshot = shared.catalog.snapshot();
        let map = EntityAccessMap::build(
            plan,
            routing,
            &snapshot,
            shared.config.foreign_key_enforcement,
        )?;

        for adapter_id in map.adapters() {
            let adapter = shared.adapter(*adapter_id).ok_or_else(|| TxError::Adapter {
                adapter: adapter_id.to_string(),
                message: "adapter is not registered".to_string(),
            })?;
            self.tx.register_involved_adapter(adapter);
        }

        for (entity, mode) in map.lock_modes() {
            self.tx.lock(*mode, *entity)?;
        }
        self.tx.merge_access(map.aggregate());
        debug!(
            tx = self.tx.id(),
            statement = self.id,
            entities = map.len(),
            "statement locks acquired"
        );
        Ok(self.access.insert(map))
    }
}
