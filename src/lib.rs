//! Lock-based concurrency control and two-phase commit for a polystore
//! whose tables, collections and graphs live on independent storage
//! adapters.
//!
//! A [`TransactionManager`] hands out [`Transaction`]s. Each statement
//! classifies its plan into an [`EntityAccessMap`], locks every touched
//! entity through the shared [`ConcurrencyControl`] and holds those locks
//! until commit or rollback.

pub mod access;
pub mod catalog;
pub mod config;
pub mod error;
pub mod lock;
pub mod txn;

pub use access::{AccessMode, AllocationRouting, EntityAccessMap, PlanNode};
pub use catalog::{Catalog, CatalogSnapshot, MemoryCatalog};
pub use config::TxConfig;
pub use error::{TxError, TxErrorCode};
pub use lock::{ConcurrencyControl, EntityIdentifier, LockMode, TxId};
pub use txn::{
    Adapter, ConstraintCheck, ManagerMetrics, Statement, Transaction, TransactionEvent,
    TransactionListener, TransactionManager, TxState, Xid,
};
