//! State builder: applies history events to mutable state.
//!
//! Events must arrive in order and without gaps. Each applied event is
//! recorded into the current version history, so a rebuilt state carries
//! the watermarks of exactly the events it replayed.

use history_types::{
    ActivityInfo, CloseStatus, DecisionInfo, EventAttributes, HistoryError, HistoryEvent,
    HistoryResult, MutableState, TimerInfo, VersionHistoryItem, WorkflowState, FIRST_EVENT_ID,
};

/// Replays event batches into a [`MutableState`].
pub struct StateBuilder {
    mutable_state: MutableState,
}

impl StateBuilder {
    /// Create a builder replaying onto `mutable_state`.
    pub fn new(mutable_state: MutableState) -> Self {
        Self { mutable_state }
    }

    pub fn mutable_state(&self) -> &MutableState {
        &self.mutable_state
    }

    pub fn mutable_state_mut(&mut self) -> &mut MutableState {
        &mut self.mutable_state
    }

    pub fn into_mutable_state(self) -> MutableState {
        self.mutable_state
    }

    /// Apply one batch. `request_id` becomes the create request id when the
    /// batch starts the run.
    pub fn apply_events(&mut self, request_id: &str, events: &[HistoryEvent]) -> HistoryResult<()> {
        let Some(first) = events.first() else {
            return Err(HistoryError::BadRequest("cannot apply an empty batch".to_string()));
        };
        let first_event_id = first.event_id;

        for event in events {
            self.apply_event(request_id, event)?;
        }
        self.mutable_state.execution_info.last_first_event_id = first_event_id;
        Ok(())
    }

    fn apply_event(&mut self, request_id: &str, event: &HistoryEvent) -> HistoryResult<()> {
        let state = &mut self.mutable_state;
        let next_event_id = state.execution_info.next_event_id;
        if event.event_id != next_event_id {
            return Err(HistoryError::BadRequest(format!(
                "event {} is not contiguous, expected {}",
                event.event_id, next_event_id
            )));
        }
        let following_event_id = event.event_id.checked_add(1).ok_or_else(|| {
            HistoryError::BadRequest(format!("event id {} is out of range", event.event_id))
        })?;
        if state.execution_info.state == WorkflowState::Completed {
            return Err(HistoryError::BadRequest(format!(
                "event {} applied to a closed workflow",
                event.event_id
            )));
        }
        let is_start = matches!(event.attributes, EventAttributes::WorkflowExecutionStarted { .. });
        if is_start != (event.event_id == FIRST_EVENT_ID) {
            return Err(HistoryError::BadRequest(format!(
                "workflow started event must be event {}, got {:?} at {}",
                FIRST_EVENT_ID,
                event.event_type(),
                event.event_id
            )));
        }

        if let Some(histories) = state.version_histories_mut() {
            histories
                .current_version_history_mut()?
                .add_or_update_item(VersionHistoryItem::new(event.event_id, event.version))?;
        }

        match &event.attributes {
            EventAttributes::WorkflowExecutionStarted {
                workflow_type,
                task_list,
                ..
            } => {
                let info = &mut state.execution_info;
                info.workflow_type = workflow_type.clone();
                info.task_list = task_list.clone();
                info.state = WorkflowState::Running;
                info.create_request_id = request_id.to_string();
            }
            EventAttributes::WorkflowExecutionCompleted { .. } => close(state, CloseStatus::Completed),
            EventAttributes::WorkflowExecutionFailed { .. } => close(state, CloseStatus::Failed),
            EventAttributes::WorkflowExecutionTerminated { .. } => {
                close(state, CloseStatus::Terminated)
            }
            EventAttributes::WorkflowExecutionCanceled => close(state, CloseStatus::Canceled),
            EventAttributes::WorkflowExecutionSignaled { .. } => state.signal_count += 1,

            EventAttributes::DecisionTaskScheduled { attempt, .. } => {
                if let Some(pending) = &state.pending_decision {
                    return Err(HistoryError::BadRequest(format!(
                        "decision scheduled at {} while decision {} is pending",
                        event.event_id, pending.scheduled_event_id
                    )));
                }
                state.pending_decision = Some(DecisionInfo {
                    scheduled_event_id: event.event_id,
                    started_event_id: None,
                    attempt: *attempt,
                    version: event.version,
                });
            }
            EventAttributes::DecisionTaskStarted {
                scheduled_event_id, ..
            } => {
                let decision = pending_decision(state, *scheduled_event_id)?;
                decision.started_event_id = Some(event.event_id);
                decision.version = event.version;
            }
            EventAttributes::DecisionTaskCompleted {
                scheduled_event_id, ..
            }
            | EventAttributes::DecisionTaskFailed {
                scheduled_event_id, ..
            }
            | EventAttributes::DecisionTaskTimedOut {
                scheduled_event_id, ..
            } => {
                pending_decision(state, *scheduled_event_id)?;
                state.pending_decision = None;
            }

            EventAttributes::ActivityTaskScheduled {
                activity_id,
                activity_type,
                ..
            } => {
                state.pending_activities.insert(
                    event.event_id,
                    ActivityInfo {
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        scheduled_event_id: event.event_id,
                        started_event_id: None,
                        version: event.version,
                    },
                );
            }
            EventAttributes::ActivityTaskStarted {
                scheduled_event_id, ..
            } => {
                let activity = state
                    .pending_activities
                    .get_mut(scheduled_event_id)
                    .ok_or_else(|| unknown_activity(*scheduled_event_id))?;
                activity.started_event_id = Some(event.event_id);
                activity.version = event.version;
            }
            EventAttributes::ActivityTaskCompleted {
                scheduled_event_id, ..
            }
            | EventAttributes::ActivityTaskFailed {
                scheduled_event_id, ..
            } => {
                state
                    .pending_activities
                    .remove(scheduled_event_id)
                    .ok_or_else(|| unknown_activity(*scheduled_event_id))?;
            }

            EventAttributes::TimerStarted { timer_id, .. } => {
                if state.pending_timers.contains_key(timer_id) {
                    return Err(HistoryError::BadRequest(format!(
                        "timer {} already started",
                        timer_id
                    )));
                }
                state.pending_timers.insert(
                    timer_id.clone(),
                    TimerInfo {
                        timer_id: timer_id.clone(),
                        started_event_id: event.event_id,
                        version: event.version,
                    },
                );
            }
            EventAttributes::TimerFired { timer_id, .. }
            | EventAttributes::TimerCanceled { timer_id, .. } => {
                state.pending_timers.remove(timer_id).ok_or_else(|| {
                    HistoryError::BadRequest(format!("timer {} is not pending", timer_id))
                })?;
            }

            EventAttributes::MarkerRecorded { .. } => {}
        }

        state.execution_info.next_event_id = following_event_id;
        state.execution_info.last_updated_timestamp = event.timestamp;
        Ok(())
    }
}

fn close(state: &mut MutableState, status: CloseStatus) {
    state.execution_info.state = WorkflowState::Completed;
    state.execution_info.close_status = status;
    state.pending_decision = None;
}

fn pending_decision(state: &mut MutableState, scheduled_event_id: i64) -> HistoryResult<&mut DecisionInfo> {
    match state.pending_decision.as_mut() {
        Some(decision) if decision.scheduled_event_id == scheduled_event_id => Ok(decision),
        _ => Err(HistoryError::BadRequest(format!(
            "decision {} is not pending",
            scheduled_event_id
        ))),
    }
}

fn unknown_activity(scheduled_event_id: i64) -> HistoryError {
    HistoryError::BadRequest(format!("activity {} is not pending", scheduled_event_id))
}
