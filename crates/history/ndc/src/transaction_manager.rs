//! Transaction manager: loads runs under exclusive, auto-released handles.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use history_types::{HistoryError, HistoryResult, MutableState, RequestContext, WorkflowIdentifier};

use crate::cache::{ExecutionCache, ReleaseFn};
use crate::execution::ExecutionContext;
use crate::shard::ShardContext;

/// A run loaded under exclusive access.
///
/// Call [`NdcWorkflow::release`] with the outcome of the work done while
/// holding it. A handle dropped without release is released from `Drop`,
/// with an internal error if the thread is panicking.
pub struct NdcWorkflow {
    context: Arc<dyn ExecutionContext>,
    mutable_state: Arc<MutableState>,
    release_fn: Option<ReleaseFn>,
}

impl NdcWorkflow {
    /// Wrap a loaded run; `release_fn` runs exactly once.
    pub fn new(
        context: Arc<dyn ExecutionContext>,
        mutable_state: Arc<MutableState>,
        release_fn: ReleaseFn,
    ) -> Self {
        Self {
            context,
            mutable_state,
            release_fn: Some(release_fn),
        }
    }

    pub fn context(&self) -> &Arc<dyn ExecutionContext> {
        &self.context
    }

    pub fn mutable_state(&self) -> &MutableState {
        &self.mutable_state
    }

    /// Release the run with the outcome of the work done while holding it.
    pub fn release(mut self, err: Option<&HistoryError>) {
        if let Some(release) = self.release_fn.take() {
            release(err);
        }
    }
}

impl Drop for NdcWorkflow {
    fn drop(&mut self) {
        let Some(release) = self.release_fn.take() else {
            return;
        };
        if std::thread::panicking() {
            let err = HistoryError::Internal(format!(
                "workflow {} released while panicking",
                self.context.identifier()
            ));
            warn!(error = %err, "Releasing workflow from drop");
            release(Some(&err));
        } else {
            release(None);
        }
    }
}

/// Loads and persists runs on behalf of the reset path.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Load the run with exclusive access. The caller must release the
    /// returned handle; dropping it also releases.
    async fn load_ndc_workflow(
        &self,
        ctx: &RequestContext,
        identifier: &WorkflowIdentifier,
    ) -> HistoryResult<NdcWorkflow>;
}

/// Transaction manager backed by the shard's execution store and an
/// [`ExecutionCache`].
pub struct NdcTransactionManager {
    shard: Arc<dyn ShardContext>,
    cache: Arc<ExecutionCache>,
}

impl NdcTransactionManager {
    /// Create a manager loading through `cache` and the shard's execution store.
    pub fn new(shard: Arc<dyn ShardContext>, cache: Arc<ExecutionCache>) -> Self {
        Self { shard, cache }
    }

    async fn load_mutable_state(
        &self,
        ctx: &RequestContext,
        context: &dyn ExecutionContext,
    ) -> HistoryResult<Arc<MutableState>> {
        if let Some(state) = context.mutable_state() {
            return Ok(state);
        }

        let store = self.shard.execution_store();
        let state = ctx
            .run("load mutable state", store.get_mutable_state(context.identifier()))
            .await?;
        if self.shard.config().validate_version_histories {
            state.validate()?;
        }

        debug!(workflow = %context.identifier(), next_event_id = state.next_event_id(), "Loaded mutable state");
        let state = Arc::new(state);
        context.set_mutable_state(Arc::clone(&state));
        Ok(state)
    }
}

#[async_trait]
impl TransactionManager for NdcTransactionManager {
    #[instrument(skip(self, ctx, identifier), fields(workflow = %identifier))]
    async fn load_ndc_workflow(
        &self,
        ctx: &RequestContext,
        identifier: &WorkflowIdentifier,
    ) -> HistoryResult<NdcWorkflow> {
        let (context, release) = self
            .cache
            .get_or_create_workflow_execution(ctx, identifier)
            .await?;

        match self.load_mutable_state(ctx, context.as_ref()).await {
            Ok(state) => Ok(NdcWorkflow::new(context, state, release)),
            Err(err) => {
                release(Some(&err));
                Err(err)
            }
        }
    }
}
