//! Lock-based concurrency control.
//!
//! [`Lock`] is the per-entity monitor, [`LockTable`] the registry of entity
//! locks, [`WaitForGraph`] the deadlock detector, and [`ConcurrencyControl`]
//! the service that ties them together with the catalog-wide lock.

pub mod entity_lock;
pub mod identifier;
pub mod service;
pub mod table;
pub mod wait_graph;

pub use entity_lock::{Grant, Lock, LockMode, LockState};
pub use identifier::{EntityIdentifier, GLOBAL_ENTITY_ID, NamespaceLevel, TxId};
pub use service::ConcurrencyControl;
pub use table::LockTable;
pub use wait_graph::WaitForGraph;
