use crate::lock::{EntityIdentifier, TxId};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxErrorCode {
    Deadlock,
    LockTimeout,
    LockInvariantViolation,
    ConstraintViolation,
    AdapterPrepareFailure,
    AdapterFailure,
    CatalogFailure,
    NotActive,
    UnknownEntity,
    UnknownAllocation,
    InvalidConfig,
}

impl TxErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            TxErrorCode::Deadlock => "deadlock",
            TxErrorCode::LockTimeout => "lock_timeout",
            TxErrorCode::LockInvariantViolation => "lock_invariant_violation",
            TxErrorCode::ConstraintViolation => "constraint_violation",
            TxErrorCode::AdapterPrepareFailure => "adapter_prepare_failure",
            TxErrorCode::AdapterFailure => "adapter_failure",
            TxErrorCode::CatalogFailure => "catalog_failure",
            TxErrorCode::NotActive => "not_active",
            TxErrorCode::UnknownEntity => "unknown_entity",
            TxErrorCode::UnknownAllocation => "unknown_allocation",
            TxErrorCode::InvalidConfig => "invalid_config",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TxError {
    #[error("deadlock detected: transaction {tx} chosen as victim")]
    Deadlock { tx: TxId },
    #[error("transaction {tx} timed out after {waited_ms}ms waiting for lock on {entity}")]
    LockTimeout {
        tx: TxId,
        entity: EntityIdentifier,
        waited_ms: u64,
    },
    #[error("lock invariant violated: {0}")]
    LockInvariantViolation(String),
    #[error("constraint '{constraint}' violated: {message}")]
    ConstraintViolation { constraint: String, message: String },
    #[error("adapter '{adapter}' refused to prepare")]
    AdapterPrepareFailure { adapter: String },
    #[error("adapter '{adapter}' failed: {message}")]
    Adapter { adapter: String, message: String },
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("transaction {xid} is not active (state: {state})")]
    NotActive { xid: String, state: String },
    #[error("entity {0} is not known to the catalog")]
    UnknownEntity(u64),
    #[error("allocation {allocation} does not belong to entity {entity}")]
    UnknownAllocation { entity: u64, allocation: u64 },
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
}

impl TxError {
    pub fn code(&self) -> TxErrorCode {
        match self {
            TxError::Deadlock { .. } => TxErrorCode::Deadlock,
            TxError::LockTimeout { .. } => TxErrorCode::LockTimeout,
            TxError::LockInvariantViolation(_) => TxErrorCode::LockInvariantViolation,
            TxError::ConstraintViolation { .. } => TxErrorCode::ConstraintViolation,
            TxError::AdapterPrepareFailure { .. } => TxErrorCode::AdapterPrepareFailure,
            TxError::Adapter { .. } => TxErrorCode::AdapterFailure,
            TxError::Catalog(_) => TxErrorCode::CatalogFailure,
            TxError::NotActive { .. } => TxErrorCode::NotActive,
            TxError::UnknownEntity(_) => TxErrorCode::UnknownEntity,
            TxError::UnknownAllocation { .. } => TxErrorCode::UnknownAllocation,
            TxError::InvalidConfig { .. } => TxErrorCode::InvalidConfig,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Deadlock victims and lock-wait timeouts. Both leave the transaction
    /// with no way forward except a full rollback.
    pub fn is_abort(&self) -> bool {
        matches!(self, TxError::Deadlock { .. } | TxError::LockTimeout { .. })
    }
}
