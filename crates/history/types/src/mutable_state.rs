//! Mutable state: the materialized snapshot of a workflow execution.
//!
//! Mutable state is derived by replaying history events in order. It is
//! owned by the execution context holding it; the reset path only reads a
//! base run's state and builds a brand-new one for the target run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::branch::BranchToken;
use crate::error::{HistoryError, HistoryResult};
use crate::ids::WorkflowIdentifier;
use crate::version_history::{VersionHistories, VersionHistory, EMPTY_EVENT_ID, FIRST_EVENT_ID};

/// Lifecycle state of a workflow execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Created,
    Running,
    Completed,
}

/// How a closed workflow ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseStatus {
    None,
    Completed,
    Failed,
    Canceled,
    Terminated,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub identifier: WorkflowIdentifier,
    pub workflow_type: String,
    pub task_list: String,
    pub state: WorkflowState,
    pub close_status: CloseStatus,
    pub start_timestamp: DateTime<Utc>,
    pub last_updated_timestamp: DateTime<Utc>,
    /// Id the next appended event must carry.
    pub next_event_id: i64,
    /// First event id of the last applied batch.
    pub last_first_event_id: i64,
    pub create_request_id: String,
    /// Branch token for executions without version histories.
    pub branch_token: BranchToken,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub activity_id: String,
    pub activity_type: String,
    pub scheduled_event_id: i64,
    pub started_event_id: Option<i64>,
    pub version: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerInfo {
    pub timer_id: String,
    pub started_event_id: i64,
    pub version: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionInfo {
    pub scheduled_event_id: i64,
    pub started_event_id: Option<i64>,
    pub attempt: i64,
    pub version: i64,
}

/// Materialized snapshot of one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutableState {
    pub execution_info: ExecutionInfo,
    pub version_histories: Option<VersionHistories>,
    /// Pending activities keyed by scheduled event id.
    pub pending_activities: BTreeMap<i64, ActivityInfo>,
    /// Pending timers keyed by timer id.
    pub pending_timers: BTreeMap<String, TimerInfo>,
    pub pending_decision: Option<DecisionInfo>,
    pub signal_count: i64,
}

impl MutableState {
    /// Empty state for a run about to be built from history.
    ///
    /// The state starts with a single empty version history; the branch
    /// token is filled in once the history branch exists.
    pub fn new(identifier: WorkflowIdentifier, now: DateTime<Utc>) -> Self {
        Self {
            execution_info: ExecutionInfo {
                identifier,
                workflow_type: String::new(),
                task_list: String::new(),
                state: WorkflowState::Created,
                close_status: CloseStatus::None,
                start_timestamp: now,
                last_updated_timestamp: now,
                next_event_id: FIRST_EVENT_ID,
                last_first_event_id: EMPTY_EVENT_ID,
                create_request_id: String::new(),
                branch_token: BranchToken::empty(),
            },
            version_histories: Some(VersionHistories::new(VersionHistory::default())),
            pending_activities: BTreeMap::new(),
            pending_timers: BTreeMap::new(),
            pending_decision: None,
            signal_count: 0,
        }
    }

    pub fn identifier(&self) -> &WorkflowIdentifier {
        &self.execution_info.identifier
    }

    pub fn version_histories(&self) -> Option<&VersionHistories> {
        self.version_histories.as_ref()
    }

    pub fn version_histories_mut(&mut self) -> Option<&mut VersionHistories> {
        self.version_histories.as_mut()
    }

    /// Token of the branch this run currently appends to.
    pub fn current_branch_token(&self) -> HistoryResult<BranchToken> {
        match &self.version_histories {
            Some(histories) => Ok(histories.current_version_history()?.branch_token().clone()),
            None => Ok(self.execution_info.branch_token.clone()),
        }
    }

    pub fn set_current_branch_token(&mut self, branch_token: BranchToken) -> HistoryResult<()> {
        match &mut self.version_histories {
            Some(histories) => {
                histories
                    .current_version_history_mut()?
                    .set_branch_token(branch_token);
            }
            None => self.execution_info.branch_token = branch_token,
        }
        Ok(())
    }

    /// Number of events applied so far.
    pub fn replayed_event_count(&self) -> i64 {
        self.execution_info.next_event_id - FIRST_EVENT_ID
    }

    pub fn next_event_id(&self) -> i64 {
        self.execution_info.next_event_id
    }

    pub fn is_workflow_execution_running(&self) -> bool {
        self.execution_info.state != WorkflowState::Completed
    }

    /// Reject states whose version histories break their invariants.
    pub fn validate(&self) -> HistoryResult<()> {
        if let Some(histories) = &self.version_histories {
            histories.validate()?;
        }
        if self.execution_info.next_event_id < FIRST_EVENT_ID {
            return Err(HistoryError::DataIntegrity(format!(
                "next event id {} below first event id",
                self.execution_info.next_event_id
            )));
        }
        Ok(())
    }
}
