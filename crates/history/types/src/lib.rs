//! Core type definitions for workflow history reconciliation.
//!
//! This crate provides the shared history types. No storage and no
//! orchestration: just identifiers, branch tokens, version histories,
//! events, mutable state, the error type and the request context.

pub mod branch;
pub mod context;
pub mod error;
pub mod event;
pub mod ids;
pub mod mutable_state;
pub mod version_history;

// Re-export primary types at crate root for ergonomic use.
pub use branch::BranchToken;
pub use context::{CancelHandle, RequestContext};
pub use error::{HistoryError, HistoryResult, RetryTaskHint};
pub use event::{EventAttributes, EventType, HistoryEvent};
pub use ids::{DomainId, RunId, WorkflowId, WorkflowIdentifier};
pub use mutable_state::{
    ActivityInfo, CloseStatus, DecisionInfo, ExecutionInfo, MutableState, TimerInfo,
    WorkflowState,
};
pub use version_history::{
    VersionHistories, VersionHistory, VersionHistoryItem, EMPTY_EVENT_ID, FIRST_EVENT_ID,
};
