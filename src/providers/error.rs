/// Provider error with retry classification.
///
/// Retryable errors (I/O contention, transient storage failures) are retried
/// by the dispatchers; permanent errors (corruption, invalid input) are not.
/// `conflict` marks an optimistic-concurrency loss: the caller's
/// `expected_last_event_id` no longer matched, meaning another worker advanced
/// the workflow first. Conflicts are not storage failures — the losing turn is
/// simply discarded and the work re-fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g. "ack_workflow_task").
    pub operation: String,
    pub message: String,
    pub retryable: bool,
    /// Optimistic-lock loss on `expected_last_event_id`.
    pub conflict: bool,
}

impl ProviderError {
    /// Transient error: might succeed on retry.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
            conflict: false,
        }
    }

    /// Permanent error: retrying will not help.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
            conflict: false,
        }
    }

    /// Optimistic-concurrency loss against the event cursor.
    pub fn concurrent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
            conflict: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn is_conflict(&self) -> bool {
        self.conflict
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}
