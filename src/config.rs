use crate::error::TxError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime configuration for the transaction core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxConfig {
    /// Identifies this coordinator inside every xid it hands out.
    pub node_id: String,
    /// Locks entities referenced by foreign keys on writes and runs deferred
    /// constraint checks at commit.
    pub foreign_key_enforcement: bool,
    /// Asks every involved adapter to prepare before any of them commits.
    pub two_pc_mode: bool,
    /// Upper bound on a single lock wait. Exceeding it aborts like a deadlock.
    pub locking_max_timeout_secs: u64,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            foreign_key_enforcement: false,
            two_pc_mode: false,
            locking_max_timeout_secs: 30,
        }
    }
}

impl TxConfig {
    pub fn strict() -> Self {
        Self {
            foreign_key_enforcement: true,
            two_pc_mode: true,
            ..Self::default()
        }
    }

    pub fn relaxed() -> Self {
        Self {
            foreign_key_enforcement: false,
            two_pc_mode: false,
            ..Self::default()
        }
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_foreign_key_enforcement(mut self, enabled: bool) -> Self {
        self.foreign_key_enforcement = enabled;
        self
    }

    pub fn with_two_pc_mode(mut self, enabled: bool) -> Self {
        self.two_pc_mode = enabled;
        self
    }

    pub fn with_lock_timeout_secs(mut self, secs: u64) -> Self {
        self.locking_max_timeout_secs = secs;
        self
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.locking_max_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), TxError> {
        if self.node_id.trim().is_empty() {
            return Err(TxError::InvalidConfig {
                message: "node_id must not be empty".into(),
            });
        }
        if self.locking_max_timeout_secs == 0 {
            return Err(TxError::InvalidConfig {
                message: "locking_max_timeout_secs must be at least 1".into(),
            });
        }
        Ok(())
    }
}
