use thiserror::Error;

use crate::ids::{DomainId, RunId, WorkflowId};

/// Replication hints attached to a retryable cross-branch conflict.
///
/// Tells the caller which run and which event range must arrive through
/// replication before the operation can be attempted again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryTaskHint {
    pub message: String,
    pub domain_id: DomainId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub start_event_id: Option<i64>,
    pub start_event_version: Option<i64>,
    pub end_event_id: Option<i64>,
    pub end_event_version: Option<i64>,
}

impl std::fmt::Display for RetryTaskHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (domain={}, workflow={}, run={}",
            self.message, self.domain_id, self.workflow_id, self.run_id
        )?;
        if let (Some(id), Some(version)) = (self.start_event_id, self.start_event_version) {
            write!(f, ", start=({}, {})", id, version)?;
        }
        if let (Some(id), Some(version)) = (self.end_event_id, self.end_event_version) {
            write!(f, ", end=({}, {})", id, version)?;
        }
        write!(f, ")")
    }
}

/// Errors from history reconciliation and reset operations.
#[derive(Error, Debug)]
pub enum HistoryError {
    /// The requested events live on a branch that has not replicated yet.
    #[error("retry task: {0}")]
    RetryTask(Box<RetryTaskHint>),

    #[error("version history item not found: event_id={event_id}, version={version}")]
    VersionHistoryItemNotFound { event_id: i64, version: i64 },

    #[error("version history index {index} out of bounds (len {len})")]
    VersionHistoryIndexOutOfBounds { index: usize, len: usize },

    /// Persisted metadata violates an invariant the core relies on.
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("entity not exists: {0}")]
    EntityNotExists(String),

    #[error("condition failed: {0}")]
    ConditionFailed(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("operation {operation} cancelled")]
    Cancelled { operation: &'static str },

    #[error("operation {operation} exceeded its deadline")]
    DeadlineExceeded { operation: &'static str },

    #[error("internal error: {0}")]
    Internal(String),
}

impl HistoryError {
    /// Build the conflict error carrying replication hints.
    pub fn retry_task(hint: RetryTaskHint) -> Self {
        HistoryError::RetryTask(Box::new(hint))
    }

    /// Whether the caller may attempt the operation again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HistoryError::RetryTask(_)
                | HistoryError::Cancelled { .. }
                | HistoryError::DeadlineExceeded { .. }
        )
    }

    pub fn retry_hint(&self) -> Option<&RetryTaskHint> {
        match self {
            HistoryError::RetryTask(hint) => Some(hint),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for HistoryError {
    fn from(e: serde_json::Error) -> Self {
        HistoryError::Serialization(e.to_string())
    }
}

/// Result type for history operations.
pub type HistoryResult<T> = std::result::Result<T, HistoryError>;
