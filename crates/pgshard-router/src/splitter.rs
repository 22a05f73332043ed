use crate::statement::{Access, Analysis, StatementKind};
use pgshard_core::{ProxyError, Role};

/// What the session knows about its open transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionRoles {
    /// Access mode given on BEGIN, if any.
    pub access: Option<Access>,
    /// Role the transaction already ran on; it stays there.
    pub pinned: Option<Role>,
}

/// Chooses primary or replica for each statement.
#[derive(Debug, Clone, Copy)]
pub struct ReadWriteSplitter {
    enabled: bool,
}

impl ReadWriteSplitter {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn classify(&self, txn: &TransactionRoles, analysis: &Analysis) -> Result<Role, ProxyError> {
        let write = analysis.is_write();
        let violation = || ProxyError::ReadOnlyTransactionViolation {
            command: analysis.command.clone(),
        };
        match txn.access {
            Some(Access::ReadOnly) if write => return Err(violation()),
            Some(Access::ReadOnly) => return Ok(self.read_role()),
            Some(Access::ReadWrite) => return Ok(Role::Primary),
            None => {}
        }
        match txn.pinned {
            Some(Role::Primary) => Ok(Role::Primary),
            Some(Role::Replica) if write => Err(violation()),
            Some(Role::Replica) => Ok(Role::Replica),
            None if analysis.kind == StatementKind::Read => Ok(self.read_role()),
            None => Ok(Role::Primary),
        }
    }

    fn read_role(&self) -> Role {
        if self.enabled {
            Role::Replica
        } else {
            Role::Primary
        }
    }
}
