use crate::ExecutionKey;

/// Error returned by provider operations, with retry classification.
///
/// The runtime retries an operation while [`is_retryable`](Self::is_retryable)
/// holds (database busy, pool timeouts). `Conflict` is recovered by the
/// decision dispatcher by abandoning its lease and replaying against fresh
/// history; the other variants are reported to the caller.
///
/// ```rust,no_run
/// use reprise::providers::ProviderError;
///
/// # fn example() -> Result<(), ProviderError> {
/// return Err(ProviderError::retryable("fetch", "database is locked"));
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The history no longer ends at the sequence number the writer read.
    #[error("conflict on {key}: expected last seq {expected}, found {actual}")]
    Conflict {
        key: ExecutionKey,
        expected: u64,
        actual: u64,
    },

    #[error("execution {0} already exists and is not terminal")]
    AlreadyExists(ExecutionKey),

    #[error("execution {0} not found")]
    NotFound(ExecutionKey),

    /// Append attempted after a terminal event.
    #[error("execution {0} is closed")]
    ExecutionClosed(ExecutionKey),

    #[error("{operation}: {message}")]
    Storage {
        operation: String,
        message: String,
        retryable: bool,
    },

    #[error("serialization: {0}")]
    Serialization(String),
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Storage {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Storage {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Storage { retryable: true, .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ProviderError::Conflict { .. })
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Serialization(e.to_string())
    }
}
