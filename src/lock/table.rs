use crate::error::TxError;
use crate::lock::entity_lock::{Grant, Lock, LockMode};
use crate::lock::wait_graph::WaitForGraph;
use crate::lock::{EntityIdentifier, TxId};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Per-entity lock registry plus an inventory of what each transaction holds.
///
/// Lock order is registry, then entity lock, then wait-for graph. Waiters hold
/// an `Arc` to their entity lock, which keeps it from being dropped from the
/// registry while they are queued.
#[derive(Default)]
pub struct LockTable {
    locks: Mutex<HashMap<EntityIdentifier, Arc<Lock>>>,
    held: Mutex<HashMap<TxId, BTreeSet<EntityIdentifier>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, entity: EntityIdentifier) -> Arc<Lock> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(entity)
                .or_insert_with(|| Arc::new(Lock::new(entity))),
        )
    }

    pub fn lock(
        &self,
        tx: TxId,
        mode: LockMode,
        entity: EntityIdentifier,
        waits: &WaitForGraph,
        timeout: Duration,
    ) -> Result<Grant, TxError> {
        let lock = self.lock_for(entity);
        let result = lock.acquire(tx, mode, waits, timeout);
        match &result {
            Ok(grant) if grant.is_new() => {
                self.held.lock().entry(tx).or_default().insert(entity);
            }
            Ok(_) => {}
            Err(_) => {
                drop(lock);
                self.drop_if_idle(entity);
            }
        }
        result
    }

    /// Releases everything `tx` holds. Keeps going past individual failures so
    /// one broken entry cannot strand the rest; the first failure is returned.
    pub fn unlock_all(&self, tx: TxId) -> Result<(), TxError> {
        let Some(entities) = self.held.lock().remove(&tx) else {
            return Ok(());
        };
        let mut first_err = None;
        let mut locks = self.locks.lock();
        for entity in entities {
            let Some(lock) = locks.get(&entity).cloned() else {
                error!(tx, %entity, "held lock missing from registry");
                first_err.get_or_insert(TxError::LockInvariantViolation(format!(
                    "transaction {tx} held {entity} but the registry has no lock for it"
                )));
                continue;
            };
            if let Err(err) = lock.release(tx) {
                first_err.get_or_insert(err);
            }
            drop(lock);
            Self::remove_if_idle(&mut locks, entity);
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn drop_if_idle(&self, entity: EntityIdentifier) {
        let mut locks = self.locks.lock();
        Self::remove_if_idle(&mut locks, entity);
    }

    fn remove_if_idle(
        locks: &mut HashMap<EntityIdentifier, Arc<Lock>>,
        entity: EntityIdentifier,
    ) {
        let idle = locks
            .get(&entity)
            .is_some_and(|lock| Arc::strong_count(lock) == 1 && lock.is_idle());
        if idle {
            locks.remove(&entity);
        }
    }

    pub fn owners(&self, entity: &EntityIdentifier) -> Vec<TxId> {
        self.locks
            .lock()
            .get(entity)
            .map(|lock| lock.owners())
            .unwrap_or_default()
    }

    pub fn mode_of(&self, tx: TxId, entity: &EntityIdentifier) -> Option<LockMode> {
        self.locks.lock().get(entity).and_then(|lock| lock.mode_of(tx))
    }

    pub fn waiting(&self, entity: &EntityIdentifier) -> usize {
        self.locks
            .lock()
            .get(entity)
            .map(|lock| lock.waiting())
            .unwrap_or(0)
    }

    pub fn held_by(&self, tx: TxId) -> Vec<EntityIdentifier> {
        self.held
            .lock()
            .get(&tx)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of entity locks currently registered.
    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }
}
