//! Session manager error types.

use relaybox_protocol::TransferState;

use crate::types::TransferId;

/// Errors returned by [`TransferManager`](crate::TransferManager) operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("transfer {0} not found")]
    NotFound(TransferId),

    #[error("cannot {action} transfer {id} while {state}")]
    InvalidTransition {
        id: TransferId,
        state: TransferState,
        action: &'static str,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transfer manager is closed")]
    Closed,
}
