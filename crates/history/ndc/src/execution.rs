//! Execution context: the in-memory holder of one run's mutable state.
//!
//! Exclusive access is provided by the execution cache lock, not by the
//! context itself; the inner lock only makes the context shareable.

use std::sync::{Arc, PoisonError, RwLock};

use history_types::{MutableState, WorkflowIdentifier};

/// Holder of one run's mutable state and history size.
pub trait ExecutionContext: Send + Sync {
    fn identifier(&self) -> &WorkflowIdentifier;

    /// Drop the cached mutable state and reset the history size.
    fn clear(&self);

    fn set_history_size(&self, size: i64);

    fn history_size(&self) -> i64;

    fn mutable_state(&self) -> Option<Arc<MutableState>>;

    fn set_mutable_state(&self, state: Arc<MutableState>);
}

#[derive(Debug, Default)]
struct ContextInner {
    mutable_state: Option<Arc<MutableState>>,
    history_size: i64,
}

/// Default [`ExecutionContext`].
#[derive(Debug)]
pub struct WorkflowContext {
    identifier: WorkflowIdentifier,
    inner: RwLock<ContextInner>,
}

impl WorkflowContext {
    /// Create an empty context for `identifier`.
    pub fn new(identifier: WorkflowIdentifier) -> Self {
        Self {
            identifier,
            inner: RwLock::new(ContextInner::default()),
        }
    }
}

// The inner data is plain values, so a poisoned lock is still consistent.
impl ExecutionContext for WorkflowContext {
    fn identifier(&self) -> &WorkflowIdentifier {
        &self.identifier
    }

    fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.mutable_state = None;
        inner.history_size = 0;
    }

    fn set_history_size(&self, size: i64) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .history_size = size;
    }

    fn history_size(&self) -> i64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history_size
    }

    fn mutable_state(&self) -> Option<Arc<MutableState>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .mutable_state
            .clone()
    }

    fn set_mutable_state(&self, state: Arc<MutableState>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .mutable_state = Some(state);
    }
}
