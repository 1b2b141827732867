use crate::access::AccessMode;
use crate::catalog::schema::AdapterId;
use crate::error::{TxError, TxErrorCode};
use crate::lock::{EntityIdentifier, TxId};
use crate::txn::Xid;

/// A storage engine taking part in transactions. Refusing `prepare` is the
/// only legal way for an adapter to veto a commit.
pub trait Adapter: Send + Sync {
    fn id(&self) -> AdapterId;
    fn name(&self) -> &str;
    fn prepare(&self, xid: &Xid) -> Result<bool, TxError>;
    fn commit(&self, xid: &Xid) -> Result<(), TxError>;
    fn rollback(&self, xid: &Xid) -> Result<(), TxError>;
}

/// Constraint validation deferred to commit time, typically a query over the
/// logical plan that looks for violating rows. `Err` carries the message shown
/// to the user.
pub trait ConstraintCheck: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self, xid: &Xid) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    Committed {
        tx: TxId,
        xid: Xid,
        access: AccessMode,
        adapters: Vec<AdapterId>,
        entities: Vec<EntityIdentifier>,
    },
    RolledBack {
        tx: TxId,
        xid: Xid,
        reason: Option<TxErrorCode>,
        entities: Vec<EntityIdentifier>,
    },
}

/// Monitoring and materialized-view maintenance subscribe here. Called after
/// the transaction has released its locks.
pub trait TransactionListener: Send + Sync {
    fn on_event(&self, event: &TransactionEvent);
}
