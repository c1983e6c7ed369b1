//! Batch Operations
//!
//! Per-item workers for the orchestrator, one module per operation:
//! - `refresh` - Mint new short credentials from refresh credentials
//! - `convert` - Exchange long-lived artifacts for session credentials
//! - `bind` - Bind a pooled payment resource through a [`BindingAgent`]

pub mod bind;
pub mod convert;
pub mod refresh;

use std::fmt;

use crate::types::account::Account;

pub use bind::{bind_worker, BindOutcome, BindingAgent, CommandBindingAgent};
pub use convert::convert_worker;
pub use refresh::refresh_worker;

/// Bulk operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Refresh,
    Convert,
    Bind,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Refresh => "refresh",
            Operation::Convert => "convert",
            Operation::Bind => "bind",
        }
    }

    /// Whether `account` is a target of this operation
    pub fn targets(&self, account: &Account) -> bool {
        match self {
            Operation::Refresh => refresh::is_target(account),
            Operation::Convert => convert::is_target(account),
            Operation::Bind => bind::is_target(account),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
