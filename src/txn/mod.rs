//! Transaction lifecycle: statements acquire locks, commit runs two-phase
//! commit across the adapters a transaction touched.

pub mod hooks;
pub mod manager;
pub mod statement;
pub mod transaction;
pub mod xid;

pub use hooks::{Adapter, ConstraintCheck, TransactionEvent, TransactionListener};
pub use manager::{ManagerMetrics, TransactionManager};
pub use statement::Statement;
pub use transaction::{Transaction, TxState};
pub use xid::Xid;
