//! Workflow resetter: builds a new run from an agreed point of a base run.
//!
//! ```text
//! base run ──load──▶ branch containing (base_last_event_id, version)
//!                       │ not found: RetryTask with replication hints
//!                       ▼
//!              rebuild [1, base_last_event_id] ──▶ fork at base_last_event_id + 1
//!                       │                              (on first batch)
//!                       ▼
//!              clear target context, set history size, return new state
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use history_persistence::{build_history_garbage_cleanup_info, ForkHistoryBranchRequest};
use history_types::{
    BranchToken, DomainId, HistoryError, HistoryResult, MutableState, RequestContext,
    RetryTaskHint, RunId, VersionHistoryItem, WorkflowId, WorkflowIdentifier,
};

use crate::execution::ExecutionContext;
use crate::shard::ShardContext;
use crate::state_rebuilder::{BranchTokenProvider, NdcStateRebuilder, StateRebuilder};
use crate::transaction_manager::TransactionManager;

/// Message carried by the conflict error when the base event is on a branch
/// this cluster has not received yet.
pub const RESEND_ON_RESET_WORKFLOW_MESSAGE: &str = "Resend events due to reset workflow";

/// Resets a workflow onto a new run.
#[async_trait]
pub trait WorkflowResetter: Send + Sync {
    /// Build the new run from the base run's history up to and including
    /// `(base_last_event_id, base_last_event_version)`.
    ///
    /// `incoming_first_event_*` identify the first replicated event that
    /// triggered the reset; they become the resend hint on conflict.
    async fn reset_workflow(
        &self,
        ctx: &RequestContext,
        now: DateTime<Utc>,
        base_last_event_id: i64,
        base_last_event_version: i64,
        incoming_first_event_id: i64,
        incoming_first_event_version: i64,
    ) -> HistoryResult<MutableState>;
}

/// [`WorkflowResetter`] for one base run and one new run.
pub struct NdcWorkflowResetter {
    shard: Arc<dyn ShardContext>,
    transaction_manager: Arc<dyn TransactionManager>,
    state_rebuilder: Arc<dyn StateRebuilder>,

    domain_id: DomainId,
    workflow_id: WorkflowId,
    /// Run whose history is replayed.
    base_run_id: RunId,
    /// Context of the new run; cleared once the rebuild succeeds.
    new_context: Arc<dyn ExecutionContext>,
    new_run_id: RunId,
}

impl NdcWorkflowResetter {
    /// Create a resetter using an [`NdcStateRebuilder`] over `shard`.
    pub fn new(
        shard: Arc<dyn ShardContext>,
        transaction_manager: Arc<dyn TransactionManager>,
        domain_id: DomainId,
        workflow_id: WorkflowId,
        base_run_id: RunId,
        new_context: Arc<dyn ExecutionContext>,
        new_run_id: RunId,
    ) -> Self {
        let state_rebuilder = Arc::new(NdcStateRebuilder::new(Arc::clone(&shard)));
        Self {
            shard,
            transaction_manager,
            state_rebuilder,
            domain_id,
            workflow_id,
            base_run_id,
            new_context,
            new_run_id,
        }
    }

    /// Replace the state rebuilder.
    pub fn with_state_rebuilder(mut self, state_rebuilder: Arc<dyn StateRebuilder>) -> Self {
        self.state_rebuilder = state_rebuilder;
        self
    }

    fn base_identifier(&self) -> WorkflowIdentifier {
        WorkflowIdentifier::new(
            self.domain_id.clone(),
            self.workflow_id.clone(),
            self.base_run_id.clone(),
        )
    }

    fn new_identifier(&self) -> WorkflowIdentifier {
        WorkflowIdentifier::new(
            self.domain_id.clone(),
            self.workflow_id.clone(),
            self.new_run_id.clone(),
        )
    }

    async fn get_base_branch_token(
        &self,
        ctx: &RequestContext,
        base_last_event_id: i64,
        base_last_event_version: i64,
        incoming_first_event_id: i64,
        incoming_first_event_version: i64,
    ) -> HistoryResult<BranchToken> {
        let base_workflow = self
            .transaction_manager
            .load_ndc_workflow(ctx, &self.base_identifier())
            .await?;

        let result = self.select_base_branch(
            base_workflow.mutable_state(),
            base_last_event_id,
            base_last_event_version,
            incoming_first_event_id,
            incoming_first_event_version,
        );
        base_workflow.release(result.as_ref().err());
        result
    }

    fn select_base_branch(
        &self,
        mutable_state: &MutableState,
        base_last_event_id: i64,
        base_last_event_version: i64,
        incoming_first_event_id: i64,
        incoming_first_event_version: i64,
    ) -> HistoryResult<BranchToken> {
        let branch_token = mutable_state.current_branch_token()?;
        let Some(histories) = mutable_state.version_histories() else {
            return Ok(branch_token);
        };

        let item = VersionHistoryItem::new(base_last_event_id, base_last_event_version);
        match histories.find_first_version_history_by_item(&item) {
            Ok((index, history)) => {
                debug!(
                    index,
                    current = histories.current_version_history_index(),
                    "Found base branch"
                );
                Ok(history.branch_token().clone())
            }
            Err(_) => {
                // Base and incoming events are on different branches; only the
                // gap on the incoming branch is resent.
                warn!(
                    base = %item,
                    incoming = %VersionHistoryItem::new(incoming_first_event_id, incoming_first_event_version),
                    "Base event not found in any version history"
                );
                Err(HistoryError::retry_task(RetryTaskHint {
                    message: RESEND_ON_RESET_WORKFLOW_MESSAGE.to_string(),
                    domain_id: self.domain_id.clone(),
                    workflow_id: self.workflow_id.clone(),
                    run_id: self.new_run_id.clone(),
                    start_event_id: None,
                    start_event_version: None,
                    end_event_id: Some(incoming_first_event_id),
                    end_event_version: Some(incoming_first_event_version),
                }))
            }
        }
    }

    async fn get_reset_branch_token(
        &self,
        ctx: &RequestContext,
        base_branch_token: &BranchToken,
        base_last_event_id: i64,
    ) -> HistoryResult<BranchToken> {
        let fork_node_id = base_last_event_id.checked_add(1).ok_or_else(|| {
            HistoryError::BadRequest(format!(
                "cannot fork after event {}",
                base_last_event_id
            ))
        })?;
        let shard_id = self.shard.shard_id();
        let directory = self.shard.domain_directory();
        let domain_name = ctx
            .run("get domain name", directory.get_domain_name(&self.domain_id))
            .await?;

        let request = ForkHistoryBranchRequest {
            fork_branch_token: base_branch_token.clone(),
            fork_node_id,
            info: build_history_garbage_cleanup_info(
                &self.domain_id,
                &self.workflow_id,
                &self.new_run_id,
            ),
            shard_id: Some(shard_id),
            domain_name,
        };
        let store = self.shard.history_store();
        let response = ctx
            .run("fork history branch", store.fork_history_branch(&request))
            .await?;

        debug!(fork_node_id = request.fork_node_id, "Forked reset branch");
        Ok(response.new_branch_token)
    }
}

#[async_trait]
impl WorkflowResetter for NdcWorkflowResetter {
    #[instrument(skip(self, ctx, now))]
    async fn reset_workflow(
        &self,
        ctx: &RequestContext,
        now: DateTime<Utc>,
        base_last_event_id: i64,
        base_last_event_version: i64,
        incoming_first_event_id: i64,
        incoming_first_event_version: i64,
    ) -> HistoryResult<MutableState> {
        debug!(
            base = %self.base_identifier(),
            new_run = %self.new_run_id,
            "Resetting workflow"
        );
        let base_branch_token = self
            .get_base_branch_token(
                ctx,
                base_last_event_id,
                base_last_event_version,
                incoming_first_event_id,
                incoming_first_event_version,
            )
            .await?;

        let base_branch = &base_branch_token;
        let reset_branch_fn: BranchTokenProvider<'_> = Box::new(move || {
            self.get_reset_branch_token(ctx, base_branch, base_last_event_id)
                .boxed()
        });

        let request_id = Uuid::new_v4().to_string();
        let (state, history_size) = self
            .state_rebuilder
            .rebuild(
                ctx,
                now,
                &self.base_identifier(),
                &base_branch_token,
                base_last_event_id,
                base_last_event_version,
                &self.new_identifier(),
                reset_branch_fn,
                &request_id,
            )
            .await?;

        self.new_context.clear();
        self.new_context.set_history_size(history_size);
        debug!(history_size, "Reset workflow rebuilt");
        Ok(state)
    }
}
