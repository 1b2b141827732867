use crate::access::AccessMode;
use crate::catalog::schema::{AdapterId, NamespaceId};
use crate::error::{TxError, TxErrorCode};
use crate::lock::{EntityIdentifier, Grant, LockMode, TxId};
use crate::txn::hooks::{Adapter, ConstraintCheck, TransactionEvent};
use crate::txn::manager::ManagerShared;
use crate::txn::statement::Statement;
use crate::txn::xid::Xid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxState {
    Active,
    Committing,
    RollingBack,
    Committed,
    RolledBack,
}

impl TxState {
    pub fn is_terminated(self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxState::Active => "active",
            TxState::Committing => "committing",
            TxState::RollingBack => "rolling_back",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work spanning any number of statements and adapters.
///
/// Locks are strict two-phase: acquired by statements as they run and held
/// until `commit` or `rollback` returns. Both are idempotent once the
/// transaction has left `Active`.
///
/// The manager keeps every transaction alive until it terminates, so dropping
/// the handle does not release anything. Callers must end every transaction;
/// [`TransactionManager::abort`](crate::txn::TransactionManager::abort)
/// rolls back one whose handle was lost.
pub struct Transaction {
    shared: Arc<ManagerShared>,
    id: TxId,
    xid: Xid,
    user_id: u64,
    namespace: NamespaceId,
    analyze: bool,
    origin: String,
    state: Mutex<TxState>,
    adapters: Mutex<Vec<Arc<dyn Adapter>>>,
    access: Mutex<AccessMode>,
    deferred: Mutex<Vec<Arc<dyn ConstraintCheck>>>,
    statements: AtomicU64,
    released: AtomicBool,
}

/// Releases locks and leaves the active table on every exit from `commit`,
/// including early returns and panics inside adapter callbacks.
struct ReleaseGuard<'a> {
    tx: &'a Transaction,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.tx.release();
    }
}

impl Transaction {
    pub(crate) fn new(
        shared: Arc<ManagerShared>,
        id: TxId,
        xid: Xid,
        user_id: u64,
        namespace: NamespaceId,
        analyze: bool,
        origin: String,
    ) -> Self {
        Self {
            shared,
            id,
            xid,
            user_id,
            namespace,
            analyze,
            origin,
            state: Mutex::new(TxState::Active),
            adapters: Mutex::new(Vec::new()),
            access: Mutex::new(AccessMode::NoAccess),
            deferred: Mutex::new(Vec::new()),
            statements: AtomicU64::new(0),
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }

    pub fn is_analyze(&self) -> bool {
        self.analyze
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn state(&self) -> TxState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TxState::Active
    }

    /// Merge of every access mode this transaction's statements requested.
    pub fn access_mode(&self) -> AccessMode {
        *self.access.lock()
    }

    pub fn is_read_only(&self) -> bool {
        !self.access_mode().writes()
    }

    pub fn involved_adapters(&self) -> Vec<AdapterId> {
        self.adapters.lock().iter().map(|a| a.id()).collect()
    }

    pub fn locked_entities(&self) -> Vec<EntityIdentifier> {
        self.shared.cc.held_by(self.id)
    }

    pub fn statement_count(&self) -> u64 {
        self.statements.load(Ordering::Relaxed)
    }

    pub fn create_statement(&self) -> Result<Statement<'_>, TxError> {
        self.ensure_active()?;
        let seq = self.statements.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Statement::new(self, seq))
    }

    /// Adds `adapter` to the participants of prepare and commit. Registering
    /// the same adapter id twice is a no-op.
    pub fn register_involved_adapter(&self, adapter: Arc<dyn Adapter>) {
        let mut adapters = self.adapters.lock();
        if adapters.iter().any(|existing| existing.id() == adapter.id()) {
            return;
        }
        debug!(tx = self.id, adapter = adapter.name(), "adapter joined transaction");
        adapters.push(adapter);
    }

    /// Queues a check that runs at commit when foreign key enforcement is on.
    pub fn defer_constraint(&self, check: Arc<dyn ConstraintCheck>) {
        self.deferred.lock().push(check);
    }

    /// Takes the catalog-wide lock exclusively, as schema changes must.
    pub fn lock_catalog_exclusive(&self) -> Result<Grant, TxError> {
        let grant = self.lock(LockMode::Exclusive, EntityIdentifier::global())?;
        self.merge_access(AccessMode::Write);
        Ok(grant)
    }

    pub(crate) fn shared(&self) -> &Arc<ManagerShared> {
        &self.shared
    }

    pub(crate) fn merge_access(&self, mode: AccessMode) {
        let mut access = self.access.lock();
        *access = access.merge(mode);
    }

    /// Acquires a single lock. A deadlock or timeout rolls the transaction
    /// back before the error is returned.
    pub(crate) fn lock(
        &self,
        mode: LockMode,
        entity: EntityIdentifier,
    ) -> Result<Grant, TxError> {
        self.ensure_active()?;
        match self.shared.cc.lock(self.id, mode, entity) {
            Ok(grant) => Ok(grant),
            Err(err) if err.is_abort() => {
                let counter = match err {
                    TxError::Deadlock { .. } => &self.shared.counters.deadlocks,
                    _ => &self.shared.counters.lock_timeouts,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                warn!(tx = self.id, %entity, error = %err, "aborting transaction");
                if let Err(rollback_err) = self.rollback_with_reason(Some(err.code())) {
                    error!(tx = self.id, error = %rollback_err, "rollback after abort failed");
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Two-phase commit across every involved adapter.
    ///
    /// Any prepare refusal or constraint violation rolls every participant
    /// back and returns the cause. Failures after the commit point are
    /// reported but cannot undo adapters that already committed.
    pub fn commit(&self) -> Result<(), TxError> {
        if !self.begin_termination(TxState::Committing) {
            return Ok(());
        }
        let guard = ReleaseGuard { tx: self };
        let adapters = self.adapters.lock().clone();

        if self.shared.config.two_pc_mode {
            for adapter in &adapters {
                let prepared = match adapter.prepare(&self.xid) {
                    Ok(vote) => vote,
                    Err(err) => {
                        warn!(tx = self.id, adapter = adapter.name(), error = %err, "prepare failed");
                        false
                    }
                };
                if !prepared {
                    warn!(tx = self.id, adapter = adapter.name(), "prepare refused");
                    let err = TxError::AdapterPrepareFailure {
                        adapter: adapter.name().to_string(),
                    };
                    return Err(self.abort_commit(&adapters, err));
                }
            }
        }

        if self.shared.config.foreign_key_enforcement {
            let checks = self.deferred.lock().clone();
            for check in &checks {
                if let Err(message) = check.check(&self.xid) {
                    let err = TxError::ConstraintViolation {
                        constraint: check.name().to_string(),
                        message,
                    };
                    return Err(self.abort_commit(&adapters, err));
                }
            }
        }

        let mut first_error = None;
        for (index, adapter) in adapters.iter().enumerate() {
            if let Err(err) = adapter.commit(&self.xid) {
                // Nothing is visible yet when the first adapter fails without a
                // prepare phase, so the transaction can still roll back cleanly.
                if index == 0 && !self.shared.config.two_pc_mode {
                    return Err(self.abort_commit(&adapters, err));
                }
                error!(tx = self.id, adapter = adapter.name(), error = %err, "commit failed after commit point");
                first_error.get_or_insert(err);
            }
        }
        if self.owns_catalog()
            && let Err(err) = self.shared.catalog.commit()
        {
            error!(tx = self.id, error = %err, "catalog commit failed");
            first_error.get_or_insert(err);
        }

        *self.state.lock() = TxState::Committed;
        self.shared.counters.committed.fetch_add(1, Ordering::Relaxed);
        let entities = self.locked_entities();
        drop(guard);
        info!(tx = self.id, xid = %self.xid, adapters = adapters.len(), "transaction committed");
        self.shared.notify(&TransactionEvent::Committed {
            tx: self.id,
            xid: self.xid.clone(),
            access: self.access_mode(),
            adapters: adapters.iter().map(|a| a.id()).collect(),
            entities,
        });
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Rolls back every involved adapter, and the catalog when this
    /// transaction holds it exclusively. A second call, or a call after
    /// commit, does nothing.
    pub fn rollback(&self) -> Result<(), TxError> {
        self.rollback_with_reason(None)
    }

    fn rollback_with_reason(&self, reason: Option<TxErrorCode>) -> Result<(), TxError> {
        if !self.begin_termination(TxState::RollingBack) {
            return Ok(());
        }
        let guard = ReleaseGuard { tx: self };
        let adapters = self.adapters.lock().clone();
        let result = self.roll_back_participants(&adapters);
        self.finish_rollback(guard, reason);
        result
    }

    fn abort_commit(&self, adapters: &[Arc<dyn Adapter>], cause: TxError) -> TxError {
        *self.state.lock() = TxState::RollingBack;
        if let Err(err) = self.roll_back_participants(adapters) {
            error!(tx = self.id, error = %err, "rollback after failed commit incomplete");
        }
        self.finish_rollback(ReleaseGuard { tx: self }, Some(cause.code()));
        cause
    }

    fn roll_back_participants(&self, adapters: &[Arc<dyn Adapter>]) -> Result<(), TxError> {
        let mut first_error = None;
        for adapter in adapters {
            if let Err(err) = adapter.rollback(&self.xid) {
                error!(tx = self.id, adapter = adapter.name(), error = %err, "adapter rollback failed");
                first_error.get_or_insert(err);
            }
        }
        if self.owns_catalog()
            && let Err(err) = self.shared.catalog.rollback()
        {
            error!(tx = self.id, error = %err, "catalog rollback failed");
            first_error.get_or_insert(err);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn finish_rollback(&self, guard: ReleaseGuard<'_>, reason: Option<TxErrorCode>) {
        *self.state.lock() = TxState::RolledBack;
        self.shared.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
        let entities = self.locked_entities();
        drop(guard);
        info!(tx = self.id, xid = %self.xid, reason = reason.map(|r| r.as_str()), "transaction rolled back");
        self.shared.notify(&TransactionEvent::RolledBack {
            tx: self.id,
            xid: self.xid.clone(),
            reason,
            entities,
        });
    }

    /// Staged catalog changes belong to whoever holds the catalog lock
    /// exclusively; only that transaction may publish or discard them. Must be
    /// asked before locks are released.
    fn owns_catalog(&self) -> bool {
        self.shared.cc.mode_of(self.id, &EntityIdentifier::global()) == Some(LockMode::Exclusive)
    }

    fn begin_termination(&self, next: TxState) -> bool {
        let mut state = self.state.lock();
        if *state != TxState::Active {
            debug!(tx = self.id, state = state.as_str(), "termination requested twice");
            return false;
        }
        *state = next;
        true
    }

    fn ensure_active(&self) -> Result<(), TxError> {
        let state = self.state();
        if state == TxState::Active {
            return Ok(());
        }
        Err(TxError::NotActive {
            xid: self.xid.to_string(),
            state: state.to_string(),
        })
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.shared.cc.unlock_all(self.id) {
            error!(tx = self.id, error = %err, "releasing locks failed");
        }
        self.shared.active.write().remove(&self.xid);
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("xid", &self.xid)
            .field("state", &self.state())
            .field("access", &self.access_mode())
            .finish()
    }
}
