use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A history event, the atomic unit of workflow progress.
///
/// Events are immutable once appended. `event_id` is dense and starts at
/// [`FIRST_EVENT_ID`](crate::FIRST_EVENT_ID); `version` identifies the
/// cluster/epoch that wrote the event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    pub version: i64,
    pub task_id: i64,
    pub timestamp: DateTime<Utc>,
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    /// Create an event stamped with the current time and no task id.
    pub fn new(event_id: i64, version: i64, attributes: EventAttributes) -> Self {
        Self {
            event_id,
            version,
            task_id: 0,
            timestamp: Utc::now(),
            attributes,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.attributes.event_type()
    }
}

/// Event kinds, without payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    WorkflowExecutionStarted,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    WorkflowExecutionTerminated,
    WorkflowExecutionCanceled,
    WorkflowExecutionSignaled,
    DecisionTaskScheduled,
    DecisionTaskStarted,
    DecisionTaskCompleted,
    DecisionTaskFailed,
    DecisionTaskTimedOut,
    ActivityTaskScheduled,
    ActivityTaskStarted,
    ActivityTaskCompleted,
    ActivityTaskFailed,
    TimerStarted,
    TimerFired,
    TimerCanceled,
    MarkerRecorded,
}

/// Event payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventAttributes {
    WorkflowExecutionStarted {
        workflow_type: String,
        task_list: String,
        input: Vec<u8>,
    },
    WorkflowExecutionCompleted {
        result: Vec<u8>,
    },
    WorkflowExecutionFailed {
        reason: String,
    },
    WorkflowExecutionTerminated {
        reason: String,
    },
    WorkflowExecutionCanceled,
    WorkflowExecutionSignaled {
        signal_name: String,
        input: Vec<u8>,
    },
    DecisionTaskScheduled {
        task_list: String,
        attempt: i64,
    },
    DecisionTaskStarted {
        scheduled_event_id: i64,
        identity: String,
    },
    DecisionTaskCompleted {
        scheduled_event_id: i64,
        started_event_id: i64,
    },
    DecisionTaskFailed {
        scheduled_event_id: i64,
        started_event_id: i64,
        cause: String,
    },
    DecisionTaskTimedOut {
        scheduled_event_id: i64,
        started_event_id: i64,
    },
    ActivityTaskScheduled {
        activity_id: String,
        activity_type: String,
        task_list: String,
    },
    ActivityTaskStarted {
        scheduled_event_id: i64,
        attempt: i64,
    },
    ActivityTaskCompleted {
        scheduled_event_id: i64,
        started_event_id: i64,
        result: Vec<u8>,
    },
    ActivityTaskFailed {
        scheduled_event_id: i64,
        started_event_id: i64,
        reason: String,
    },
    TimerStarted {
        timer_id: String,
        fire_after_secs: i64,
    },
    TimerFired {
        timer_id: String,
        started_event_id: i64,
    },
    TimerCanceled {
        timer_id: String,
        started_event_id: i64,
    },
    MarkerRecorded {
        marker_name: String,
    },
}

impl EventAttributes {
    pub fn event_type(&self) -> EventType {
        match self {
            EventAttributes::WorkflowExecutionStarted { .. } => EventType::WorkflowExecutionStarted,
            EventAttributes::WorkflowExecutionCompleted { .. } => {
                EventType::WorkflowExecutionCompleted
            }
            EventAttributes::WorkflowExecutionFailed { .. } => EventType::WorkflowExecutionFailed,
            EventAttributes::WorkflowExecutionTerminated { .. } => {
                EventType::WorkflowExecutionTerminated
            }
            EventAttributes::WorkflowExecutionCanceled => EventType::WorkflowExecutionCanceled,
            EventAttributes::WorkflowExecutionSignaled { .. } => {
                EventType::WorkflowExecutionSignaled
            }
            EventAttributes::DecisionTaskScheduled { .. } => EventType::DecisionTaskScheduled,
            EventAttributes::DecisionTaskStarted { .. } => EventType::DecisionTaskStarted,
            EventAttributes::DecisionTaskCompleted { .. } => EventType::DecisionTaskCompleted,
            EventAttributes::DecisionTaskFailed { .. } => EventType::DecisionTaskFailed,
            EventAttributes::DecisionTaskTimedOut { .. } => EventType::DecisionTaskTimedOut,
            EventAttributes::ActivityTaskScheduled { .. } => EventType::ActivityTaskScheduled,
            EventAttributes::ActivityTaskStarted { .. } => EventType::ActivityTaskStarted,
            EventAttributes::ActivityTaskCompleted { .. } => EventType::ActivityTaskCompleted,
            EventAttributes::ActivityTaskFailed { .. } => EventType::ActivityTaskFailed,
            EventAttributes::TimerStarted { .. } => EventType::TimerStarted,
            EventAttributes::TimerFired { .. } => EventType::TimerFired,
            EventAttributes::TimerCanceled { .. } => EventType::TimerCanceled,
            EventAttributes::MarkerRecorded { .. } => EventType::MarkerRecorded,
        }
    }

    /// Whether the event closes the workflow execution.
    pub fn is_close_event(&self) -> bool {
        matches!(
            self,
            EventAttributes::WorkflowExecutionCompleted { .. }
                | EventAttributes::WorkflowExecutionFailed { .. }
                | EventAttributes::WorkflowExecutionTerminated { .. }
                | EventAttributes::WorkflowExecutionCanceled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_serialize_with_type_tag() {
        let event = HistoryEvent::new(
            3,
            1,
            EventAttributes::TimerStarted {
                timer_id: "t1".into(),
                fire_after_secs: 30,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["attributes"]["type"], "TimerStarted");

        let decoded: HistoryEvent = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.event_type(), EventType::TimerStarted);
    }

    #[test]
    fn close_events() {
        assert!(EventAttributes::WorkflowExecutionCanceled.is_close_event());
        assert!(!EventAttributes::MarkerRecorded {
            marker_name: "m".into()
        }
        .is_close_event());
    }
}
