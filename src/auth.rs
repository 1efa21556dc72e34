//! Principals and permission levels for privileged ledger operations
//!
//! Callers are authenticated by the boundary (API layer, signer, operator CLI)
//! and hand the ledger an explicit [`Principal`]; nothing is inferred from
//! ambient call context.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LedgerError, Result};

/// Permission levels for ledger operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum PermissionLevel {
    /// Unauthenticated - snapshots only
    #[default]
    Public = 0,
    /// Authenticated wallet owner - may submit requests for itself
    Authenticated = 1,
    /// Vault operator - processes requests and rolls epochs
    Admin = 2,
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionLevel::Public => write!(f, "PUBLIC"),
            PermissionLevel::Authenticated => write!(f, "AUTHENTICATED"),
            PermissionLevel::Admin => write!(f, "ADMIN"),
        }
    }
}

/// Privileged ledger operations and the level each requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ProcessRequest,
    BatchProcess,
    CloseEpoch,
    RecordKycStatus,
    ArchiveUser,
    RequeueEvent,
}

impl Operation {
    pub fn required_level(self) -> PermissionLevel {
        match self {
            Operation::ProcessRequest
            | Operation::BatchProcess
            | Operation::CloseEpoch
            | Operation::RequeueEvent
            | Operation::ArchiveUser
            | Operation::RecordKycStatus => PermissionLevel::Admin,
        }
    }
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub level: PermissionLevel,
}

impl Principal {
    pub fn new(id: impl Into<String>, level: PermissionLevel) -> Self {
        Self {
            id: id.into(),
            level,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id, PermissionLevel::Admin)
    }

    /// Identity used by the reconciliation sync when replaying on-chain facts
    pub fn system() -> Self {
        Self::admin("system:reconciliation")
    }

    pub fn can(&self, op: Operation) -> bool {
        self.level >= op.required_level()
    }

    pub fn require(&self, op: Operation) -> Result<()> {
        if self.can(op) {
            Ok(())
        } else {
            Err(LedgerError::Unauthorized(format!(
                "{} ({}) may not perform {:?}",
                self.id, self.level, op
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_ordering() {
        assert!(PermissionLevel::Admin > PermissionLevel::Authenticated);
        assert!(PermissionLevel::Authenticated > PermissionLevel::Public);
    }

    #[test]
    fn test_default_level_is_public() {
        assert_eq!(PermissionLevel::default(), PermissionLevel::Public);
        assert_eq!(serde_json::to_string(&PermissionLevel::Admin).unwrap(), "\"ADMIN\"");
    }

    #[test]
    fn test_require() {
        let user = Principal::new("0xalice", PermissionLevel::Authenticated);
        assert!(matches!(
            user.require(Operation::ProcessRequest),
            Err(LedgerError::Unauthorized(_))
        ));
        assert!(Principal::system().require(Operation::CloseEpoch).is_ok());
    }
}
