use serde::{Deserialize, Serialize};
use std::fmt;

/// Globally unique transaction identifier handed to adapters for
/// prepare/commit/rollback. Stable for the life of the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid {
    pub node_id: String,
    pub user_id: u64,
    pub connection_id: u64,
    pub sequence: u64,
}

impl Xid {
    pub fn new(
        node_id: impl Into<String>,
        user_id: u64,
        connection_id: u64,
        sequence: u64,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            user_id,
            connection_id,
            sequence,
        }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.node_id, self.user_id, self.connection_id, self.sequence
        )
    }
}
