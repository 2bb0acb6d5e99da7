//! Execution store: durable mutable state per workflow run.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use history_types::{HistoryError, HistoryResult, MutableState, WorkflowIdentifier};

/// Persistence of mutable state snapshots.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn get_mutable_state(&self, identifier: &WorkflowIdentifier) -> HistoryResult<MutableState>;

    async fn put_mutable_state(&self, state: &MutableState) -> HistoryResult<()>;
}

/// In-memory execution store.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    executions: Arc<DashMap<WorkflowIdentifier, MutableState>>,
}

impl InMemoryExecutionStore {
    /// Create a new in-memory execution store.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn get_mutable_state(&self, identifier: &WorkflowIdentifier) -> HistoryResult<MutableState> {
        self.executions
            .get(identifier)
            .map(|state| state.clone())
            .ok_or_else(|| {
                HistoryError::EntityNotExists(format!("workflow execution {} not found", identifier))
            })
    }

    async fn put_mutable_state(&self, state: &MutableState) -> HistoryResult<()> {
        self.executions
            .insert(state.identifier().clone(), state.clone());
        Ok(())
    }
}
