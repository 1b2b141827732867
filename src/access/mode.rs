use crate::lock::LockMode;
use serde::{Deserialize, Serialize};

/// How a plan touches an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AccessMode {
    #[default]
    NoAccess,
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    /// Commutative merge: `NoAccess` is the identity, equal modes stay, any
    /// two different real modes become `ReadWrite`.
    pub fn merge(self, other: AccessMode) -> AccessMode {
        match (self, other) {
            (AccessMode::NoAccess, mode) | (mode, AccessMode::NoAccess) => mode,
            (a, b) if a == b => a,
            _ => AccessMode::ReadWrite,
        }
    }

    pub fn lock_mode(self) -> Option<LockMode> {
        match self {
            AccessMode::NoAccess => None,
            AccessMode::Read => Some(LockMode::Shared),
            AccessMode::Write | AccessMode::ReadWrite => Some(LockMode::Exclusive),
        }
    }

    pub fn writes(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}
