use crate::finish::TransactionKind;

/// Core error type.
///
/// Used both as the reason a message was not delivered and as the error a
/// transaction completor reports, so callers handle both the same way.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),

    #[error("{kind} transaction: {reason}")]
    Transaction {
        kind: TransactionKind,
        reason: String,
    },

    #[error("{0} transaction completor is not configured")]
    CleanupNotConfigured(TransactionKind),

    #[error("finisher has no outcome: mark it sent or failed before running")]
    MissingOutcome,
}

impl Error {
    pub fn transaction(kind: TransactionKind, reason: impl Into<String>) -> Self {
        Self::Transaction {
            kind,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
