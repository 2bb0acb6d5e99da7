//! Workflow reset end to end over the in-memory stores.
//!
//! The history store and transaction manager are wrapped so tests can see
//! every fork request and every release of the base run.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use history_ndc::{
    BranchTokenProvider, ExecutionCache, ExecutionContext, NdcConfig, NdcTransactionManager,
    NdcWorkflow, NdcWorkflowResetter, ShardContextImpl, StateBuilder, StateRebuilder,
    TransactionManager, WorkflowContext, WorkflowResetter, RESEND_ON_RESET_WORKFLOW_MESSAGE,
};
use history_persistence::{
    AppendHistoryNodesRequest, AppendHistoryNodesResponse, DeleteHistoryBranchRequest,
    ExecutionStore, ForkHistoryBranchRequest, ForkHistoryBranchResponse, HistoryStore,
    InMemoryDomainCache, InMemoryExecutionStore, InMemoryHistoryStore,
    ReadHistoryBranchByBatchResponse, ReadHistoryBranchRequest,
};
use history_types::{
    BranchToken, DomainId, EventAttributes, HistoryError, HistoryEvent, HistoryResult,
    MutableState, RequestContext, RunId, VersionHistories, VersionHistory, VersionHistoryItem,
    WorkflowId, WorkflowIdentifier,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const SHARD_ID: i32 = 7;
const DOMAIN_NAME: &str = "orders";

fn domain_id() -> DomainId {
    DomainId::new("domain-id")
}

fn workflow_id() -> WorkflowId {
    WorkflowId::new("wf")
}

fn base_identifier() -> WorkflowIdentifier {
    WorkflowIdentifier::new(domain_id(), workflow_id(), RunId::new("base-run"))
}

fn new_run_id() -> RunId {
    RunId::new("new-run")
}

fn event(event_id: i64, version: i64) -> HistoryEvent {
    let attributes = if event_id == 1 {
        EventAttributes::WorkflowExecutionStarted {
            workflow_type: "checkout".to_string(),
            task_list: "tl".to_string(),
            input: vec![],
        }
    } else {
        EventAttributes::WorkflowExecutionSignaled {
            signal_name: format!("s{}", event_id),
            input: vec![],
        }
    };
    HistoryEvent::new(event_id, version, attributes)
}

/// History store that records fork requests and can be told to fail forks
/// or to hang on every page after the first.
#[derive(Default)]
struct RecordingHistoryStore {
    inner: InMemoryHistoryStore,
    forks: Mutex<Vec<ForkHistoryBranchRequest>>,
    fail_forks: AtomicBool,
    stall_later_pages: AtomicBool,
    stalled: Notify,
}

impl RecordingHistoryStore {
    fn forks(&self) -> Vec<ForkHistoryBranchRequest> {
        self.forks.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoryStore for RecordingHistoryStore {
    async fn new_history_branch(&self, tree_id: Option<Uuid>) -> HistoryResult<BranchToken> {
        self.inner.new_history_branch(tree_id).await
    }

    async fn append_history_nodes(
        &self,
        request: &AppendHistoryNodesRequest,
    ) -> HistoryResult<AppendHistoryNodesResponse> {
        self.inner.append_history_nodes(request).await
    }

    async fn read_history_branch_by_batch(
        &self,
        request: &ReadHistoryBranchRequest,
    ) -> HistoryResult<ReadHistoryBranchByBatchResponse> {
        if request.next_page_token.is_some() && self.stall_later_pages.load(Ordering::SeqCst) {
            self.stalled.notify_one();
            return futures::future::pending().await;
        }
        self.inner.read_history_branch_by_batch(request).await
    }

    async fn fork_history_branch(
        &self,
        request: &ForkHistoryBranchRequest,
    ) -> HistoryResult<ForkHistoryBranchResponse> {
        self.forks.lock().unwrap().push(request.clone());
        if self.fail_forks.load(Ordering::SeqCst) {
            return Err(HistoryError::Storage("fork unavailable".to_string()));
        }
        self.inner.fork_history_branch(request).await
    }

    async fn delete_history_branch(&self, request: &DeleteHistoryBranchRequest) -> HistoryResult<()> {
        self.inner.delete_history_branch(request).await
    }

    async fn branch_info(&self, branch_token: &BranchToken) -> HistoryResult<String> {
        self.inner.branch_info(branch_token).await
    }
}

/// Loads straight from the execution store and records every release.
struct RecordingTransactionManager {
    executions: Arc<InMemoryExecutionStore>,
    releases: Arc<Mutex<Vec<Option<String>>>>,
}

#[async_trait]
impl TransactionManager for RecordingTransactionManager {
    async fn load_ndc_workflow(
        &self,
        ctx: &RequestContext,
        identifier: &WorkflowIdentifier,
    ) -> HistoryResult<NdcWorkflow> {
        ctx.check("load workflow")?;
        let state = self.executions.get_mutable_state(identifier).await?;
        let releases = Arc::clone(&self.releases);
        Ok(NdcWorkflow::new(
            Arc::new(WorkflowContext::new(identifier.clone())),
            Arc::new(state),
            Box::new(move |err| {
                releases
                    .lock()
                    .unwrap()
                    .push(err.map(|e| e.to_string()));
            }),
        ))
    }
}

/// Rebuilder that fails without ever asking for the target branch.
struct FailingStateRebuilder;

#[async_trait]
impl StateRebuilder for FailingStateRebuilder {
    async fn rebuild<'a>(
        &self,
        _ctx: &RequestContext,
        _now: DateTime<Utc>,
        _base_identifier: &WorkflowIdentifier,
        _base_branch_token: &BranchToken,
        _base_last_event_id: i64,
        _base_last_event_version: i64,
        _target_identifier: &WorkflowIdentifier,
        _target_branch_fn: BranchTokenProvider<'a>,
        _request_id: &str,
    ) -> HistoryResult<(MutableState, i64)> {
        Err(HistoryError::Storage("history read failed".to_string()))
    }
}

struct Harness {
    history: Arc<RecordingHistoryStore>,
    executions: Arc<InMemoryExecutionStore>,
    shard: Arc<ShardContextImpl>,
    releases: Arc<Mutex<Vec<Option<String>>>>,
    new_context: Arc<WorkflowContext>,
}

impl Harness {
    fn new() -> Self {
        let history = Arc::new(RecordingHistoryStore::default());
        let executions = Arc::new(InMemoryExecutionStore::new());
        let domains = Arc::new(InMemoryDomainCache::new());
        domains.register(domain_id(), DOMAIN_NAME);
        let config = NdcConfig {
            rebuild_page_size: 2,
            ..NdcConfig::default()
        };
        let shard = Arc::new(ShardContextImpl::new(
            SHARD_ID,
            history.clone(),
            executions.clone(),
            domains,
            config,
        ));

        // The target context starts out holding stale state.
        let new_context = Arc::new(WorkflowContext::new(WorkflowIdentifier::new(
            domain_id(),
            workflow_id(),
            new_run_id(),
        )));
        new_context.set_mutable_state(Arc::new(MutableState::new(
            base_identifier().with_run_id(new_run_id()),
            Utc::now(),
        )));
        new_context.set_history_size(999);

        Self {
            history,
            executions,
            shard,
            releases: Arc::new(Mutex::new(Vec::new())),
            new_context,
        }
    }

    fn recording_manager(&self) -> Arc<dyn TransactionManager> {
        Arc::new(RecordingTransactionManager {
            executions: Arc::clone(&self.executions),
            releases: Arc::clone(&self.releases),
        })
    }

    fn resetter_with(&self, manager: Arc<dyn TransactionManager>) -> NdcWorkflowResetter {
        NdcWorkflowResetter::new(
            self.shard.clone(),
            manager,
            domain_id(),
            workflow_id(),
            RunId::new("base-run"),
            self.new_context.clone(),
            new_run_id(),
        )
    }

    fn resetter(&self) -> NdcWorkflowResetter {
        self.resetter_with(self.recording_manager())
    }

    fn releases(&self) -> Vec<Option<String>> {
        self.releases.lock().unwrap().clone()
    }

    async fn append(&self, token: &BranchToken, ids: RangeInclusive<i64>, version: i64) -> Vec<HistoryEvent> {
        let events: Vec<HistoryEvent> = ids.map(|id| event(id, version)).collect();
        self.history
            .append_history_nodes(&AppendHistoryNodesRequest {
                branch_token: token.clone(),
                events: events.clone(),
                transaction_id: events[0].event_id,
                shard_id: Some(SHARD_ID),
                domain_name: DOMAIN_NAME.to_string(),
            })
            .await
            .unwrap();
        events
    }

    /// Base run whose single branch holds batches [1-2] [3-5] at version 1.
    async fn single_branch_base(&self) -> BranchToken {
        let token = self.history.new_history_branch(None).await.unwrap();
        self.append(&token, 1..=2, 1).await;
        self.append(&token, 3..=5, 1).await;

        let mut state = MutableState::new(base_identifier(), Utc::now());
        state.version_histories = Some(VersionHistories::new(VersionHistory::new(
            token.clone(),
            vec![VersionHistoryItem::new(1, 1), VersionHistoryItem::new(5, 1)],
        )));
        state.execution_info.next_event_id = 6;
        self.executions.put_mutable_state(&state).await.unwrap();
        token
    }

    /// Base run with batches [1-2] [3-4] [5-6] at version 1, two pages at
    /// the harness page size.
    async fn two_page_base(&self) -> BranchToken {
        let token = self.history.new_history_branch(None).await.unwrap();
        self.append(&token, 1..=2, 1).await;
        self.append(&token, 3..=4, 1).await;
        self.append(&token, 5..=6, 1).await;

        let mut state = MutableState::new(base_identifier(), Utc::now());
        state.version_histories = Some(VersionHistories::new(VersionHistory::new(
            token.clone(),
            vec![VersionHistoryItem::new(6, 1)],
        )));
        state.execution_info.next_event_id = 7;
        self.executions.put_mutable_state(&state).await.unwrap();
        token
    }

    fn assert_target_untouched(&self) {
        assert_eq!(self.new_context.history_size(), 999);
        assert!(self.new_context.mutable_state().is_some());
    }
}

fn signal_count(events: &[HistoryEvent]) -> i64 {
    events
        .iter()
        .filter(|e| matches!(e.attributes, EventAttributes::WorkflowExecutionSignaled { .. }))
        .count() as i64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reset_forks_after_the_agreed_event_and_rebuilds() {
    let harness = Harness::new();
    let base_token = harness.single_branch_base().await;
    let now = Utc::now();

    let state = harness
        .resetter()
        .reset_workflow(&RequestContext::background(), now, 5, 1, 6, 2)
        .await
        .unwrap();

    let forks = harness.history.forks();
    assert_eq!(forks.len(), 1);
    assert_eq!(forks[0].fork_branch_token, base_token);
    assert_eq!(forks[0].fork_node_id, 6);
    assert_eq!(forks[0].info, "domain-id:wf:new-run");
    assert_eq!(forks[0].shard_id, Some(SHARD_ID));
    assert_eq!(forks[0].domain_name, DOMAIN_NAME);

    assert_eq!(state.identifier().run_id, new_run_id());
    assert_eq!(state.replayed_event_count(), 5);
    assert_eq!(state.execution_info.start_timestamp, now);
    assert!(Uuid::parse_str(&state.execution_info.create_request_id).is_ok());

    let new_token = state.current_branch_token().unwrap();
    assert_ne!(new_token, base_token);
    assert_eq!(harness.history.branch_info(&new_token).await.unwrap(), "domain-id:wf:new-run");
    let shared = harness
        .history
        .read_history_branch(&new_token, 1, 100, DOMAIN_NAME)
        .await
        .unwrap();
    assert_eq!(shared.len(), 5);
    assert_eq!(state.signal_count, signal_count(&shared));

    let replayed_size = harness
        .history
        .read_history_branch_by_batch(&ReadHistoryBranchRequest {
            branch_token: base_token,
            min_event_id: 1,
            max_event_id: 6,
            page_size: 100,
            next_page_token: None,
            shard_id: Some(SHARD_ID),
            domain_name: DOMAIN_NAME.to_string(),
        })
        .await
        .unwrap()
        .size;
    assert_eq!(harness.releases(), vec![None]);
    assert!(harness.new_context.mutable_state().is_none());
    assert!(replayed_size > 0);
    assert_eq!(harness.new_context.history_size(), replayed_size);
}

#[tokio::test]
async fn base_event_on_unknown_branch_asks_for_resend() {
    let harness = Harness::new();
    harness.single_branch_base().await;

    let err = harness
        .resetter()
        .reset_workflow(&RequestContext::background(), Utc::now(), 5, 2, 6, 2)
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    let hint = err.retry_hint().unwrap();
    assert_eq!(hint.message, RESEND_ON_RESET_WORKFLOW_MESSAGE);
    assert_eq!(hint.domain_id, domain_id());
    assert_eq!(hint.workflow_id, workflow_id());
    assert_eq!(hint.run_id, new_run_id());
    assert_eq!(hint.start_event_id, None);
    assert_eq!(hint.start_event_version, None);
    assert_eq!(hint.end_event_id, Some(6));
    assert_eq!(hint.end_event_version, Some(2));

    assert!(harness.history.forks().is_empty());
    let releases = harness.releases();
    assert_eq!(releases.len(), 1);
    assert!(releases[0].as_deref().unwrap().contains(RESEND_ON_RESET_WORKFLOW_MESSAGE));
    harness.assert_target_untouched();
}

#[tokio::test]
async fn reset_uses_the_branch_holding_the_event_even_if_not_current() {
    let harness = Harness::new();

    // Branch A: [1-3] [4-5] at v1. Branch B forks A at 4 and holds [4-6] at v2.
    let branch_a = harness.history.new_history_branch(None).await.unwrap();
    harness.append(&branch_a, 1..=3, 1).await;
    harness.append(&branch_a, 4..=5, 1).await;
    let branch_b = harness
        .history
        .fork_history_branch(&ForkHistoryBranchRequest {
            fork_branch_token: branch_a.clone(),
            fork_node_id: 4,
            info: String::new(),
            shard_id: Some(SHARD_ID),
            domain_name: DOMAIN_NAME.to_string(),
        })
        .await
        .unwrap()
        .new_branch_token;
    harness.append(&branch_b, 4..=6, 2).await;

    let mut state = MutableState::new(base_identifier(), Utc::now());
    state.version_histories = Some(
        VersionHistories::from_histories(
            0,
            vec![
                VersionHistory::new(
                    branch_b.clone(),
                    vec![VersionHistoryItem::new(3, 1), VersionHistoryItem::new(6, 2)],
                ),
                VersionHistory::new(branch_a.clone(), vec![VersionHistoryItem::new(5, 1)]),
            ],
        )
        .unwrap(),
    );
    state.execution_info.next_event_id = 7;
    harness.executions.put_mutable_state(&state).await.unwrap();

    let rebuilt = harness
        .resetter()
        .reset_workflow(&RequestContext::background(), Utc::now(), 5, 1, 6, 3)
        .await
        .unwrap();

    // One fork by the setup, one by the reset.
    let forks = harness.history.forks();
    assert_eq!(forks.len(), 2);
    assert_eq!(forks[1].fork_branch_token, branch_a);
    assert_eq!(forks[1].fork_node_id, 6);

    assert_eq!(rebuilt.replayed_event_count(), 5);
    let current = rebuilt
        .version_histories()
        .unwrap()
        .current_version_history()
        .unwrap();
    assert_eq!(current.last_item().unwrap(), VersionHistoryItem::new(5, 1));
    assert_eq!(harness.releases(), vec![None]);
}

#[tokio::test]
async fn run_without_version_histories_resets_from_its_branch_token() {
    let harness = Harness::new();
    let token = harness.history.new_history_branch(None).await.unwrap();
    harness.append(&token, 1..=3, 1).await;

    let mut state = MutableState::new(base_identifier(), Utc::now());
    state.version_histories = None;
    state.execution_info.branch_token = token.clone();
    state.execution_info.next_event_id = 4;
    harness.executions.put_mutable_state(&state).await.unwrap();

    let rebuilt = harness
        .resetter()
        .reset_workflow(&RequestContext::background(), Utc::now(), 3, 1, 4, 1)
        .await
        .unwrap();

    assert_eq!(rebuilt.replayed_event_count(), 3);
    assert_eq!(harness.history.forks()[0].fork_branch_token, token);
}

#[tokio::test]
async fn rebuild_failure_skips_fork_and_releases_once() {
    let harness = Harness::new();
    harness.single_branch_base().await;

    let err = harness
        .resetter()
        .with_state_rebuilder(Arc::new(FailingStateRebuilder))
        .reset_workflow(&RequestContext::background(), Utc::now(), 5, 1, 6, 2)
        .await
        .unwrap_err();

    assert!(matches!(err, HistoryError::Storage(_)));
    assert!(harness.history.forks().is_empty());
    assert_eq!(harness.releases(), vec![None]);
    harness.assert_target_untouched();
}

#[tokio::test]
async fn fork_failure_propagates_unchanged() {
    let harness = Harness::new();
    harness.single_branch_base().await;
    harness.history.fail_forks.store(true, Ordering::SeqCst);

    let err = harness
        .resetter()
        .reset_workflow(&RequestContext::background(), Utc::now(), 5, 1, 6, 2)
        .await
        .unwrap_err();

    assert!(matches!(err, HistoryError::Storage(ref msg) if msg == "fork unavailable"));
    assert_eq!(harness.history.forks().len(), 1);
    assert_eq!(harness.releases().len(), 1);
    harness.assert_target_untouched();
}

#[tokio::test]
async fn watermark_inside_a_batch_is_rejected() {
    let harness = Harness::new();
    harness.single_branch_base().await;

    let err = harness
        .resetter()
        .reset_workflow(&RequestContext::background(), Utc::now(), 4, 1, 5, 2)
        .await
        .unwrap_err();

    assert!(matches!(err, HistoryError::BadRequest(_)));
    harness.assert_target_untouched();
}

#[tokio::test]
async fn cancelled_request_leaves_everything_untouched() {
    let harness = Harness::new();
    harness.single_branch_base().await;
    let (ctx, cancel) = RequestContext::background().with_cancel();
    cancel.cancel();

    let err = harness
        .resetter()
        .reset_workflow(&ctx, Utc::now(), 5, 1, 6, 2)
        .await
        .unwrap_err();

    assert!(matches!(err, HistoryError::Cancelled { .. }));
    assert!(harness.history.forks().is_empty());
    assert!(harness.releases().is_empty());
    harness.assert_target_untouched();
}

#[tokio::test]
async fn missing_base_run_fails_without_leaking_its_lock() {
    let harness = Harness::new();
    let manager: Arc<dyn TransactionManager> = Arc::new(NdcTransactionManager::new(
        harness.shard.clone(),
        Arc::new(ExecutionCache::new()),
    ));
    let resetter = harness.resetter_with(manager);

    let err = resetter
        .reset_workflow(&RequestContext::background(), Utc::now(), 5, 1, 6, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, HistoryError::EntityNotExists(_)));

    harness.single_branch_base().await;
    let state = resetter
        .reset_workflow(&RequestContext::background(), Utc::now(), 5, 1, 6, 2)
        .await
        .unwrap();
    assert_eq!(state.replayed_event_count(), 5);
}

#[tokio::test]
async fn conflict_through_the_cache_clears_the_base_context() {
    let harness = Harness::new();
    let token = harness.history.new_history_branch(None).await.unwrap();
    let mut builder = StateBuilder::new(MutableState::new(base_identifier(), Utc::now()));
    builder.apply_events("seed", &harness.append(&token, 1..=2, 1).await).unwrap();
    builder.apply_events("seed", &harness.append(&token, 3..=4, 3).await).unwrap();
    builder.mutable_state_mut().set_current_branch_token(token).unwrap();
    harness
        .executions
        .put_mutable_state(builder.mutable_state())
        .await
        .unwrap();

    let cache = Arc::new(ExecutionCache::new());
    let manager: Arc<dyn TransactionManager> =
        Arc::new(NdcTransactionManager::new(harness.shard.clone(), Arc::clone(&cache)));
    let resetter = harness.resetter_with(Arc::clone(&manager));

    let err = resetter
        .reset_workflow(&RequestContext::background(), Utc::now(), 4, 2, 5, 4)
        .await
        .unwrap_err();
    assert!(matches!(err, HistoryError::RetryTask(_)));

    // Released with the error: the cached base state was dropped, and the
    // lock is free for the next holder.
    let (context, release) = cache
        .get_or_create_workflow_execution(&RequestContext::background(), &base_identifier())
        .await
        .unwrap();
    assert!(context.mutable_state().is_none());
    release(None);

    let state = resetter
        .reset_workflow(&RequestContext::background(), Utc::now(), 4, 3, 5, 4)
        .await
        .unwrap();
    assert_eq!(state.replayed_event_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn deadline_during_paged_reads_leaves_target_untouched() {
    let harness = Harness::new();
    harness.two_page_base().await;
    harness.history.stall_later_pages.store(true, Ordering::SeqCst);
    let ctx = RequestContext::with_timeout(Duration::from_secs(5));

    let err = harness
        .resetter()
        .reset_workflow(&ctx, Utc::now(), 6, 1, 7, 2)
        .await
        .unwrap_err();

    assert!(matches!(err, HistoryError::DeadlineExceeded { .. }));
    // The fork happened on the first page; the second page never arrived.
    let forks = harness.history.forks();
    assert_eq!(forks.len(), 1);
    assert_eq!(forks[0].fork_node_id, 7);
    assert_eq!(harness.releases(), vec![None]);
    harness.assert_target_untouched();
}

#[tokio::test]
async fn cancel_during_paged_reads_leaves_target_untouched() {
    let harness = Harness::new();
    harness.two_page_base().await;
    harness.history.stall_later_pages.store(true, Ordering::SeqCst);
    let (ctx, cancel) = RequestContext::background().with_cancel();
    let resetter = harness.resetter();

    let (result, _) = tokio::join!(
        resetter.reset_workflow(&ctx, Utc::now(), 6, 1, 7, 2),
        async {
            harness.history.stalled.notified().await;
            cancel.cancel();
        }
    );

    assert!(matches!(result.unwrap_err(), HistoryError::Cancelled { .. }));
    assert_eq!(harness.history.forks().len(), 1);
    assert_eq!(harness.releases(), vec![None]);
    harness.assert_target_untouched();
}

#[tokio::test]
async fn base_event_id_at_the_limit_is_rejected() {
    let harness = Harness::new();
    let token = harness.history.new_history_branch(None).await.unwrap();
    harness.append(&token, 1..=3, 1).await;

    let mut state = MutableState::new(base_identifier(), Utc::now());
    state.version_histories = None;
    state.execution_info.branch_token = token;
    state.execution_info.next_event_id = 4;
    harness.executions.put_mutable_state(&state).await.unwrap();

    let err = harness
        .resetter()
        .reset_workflow(&RequestContext::background(), Utc::now(), i64::MAX, 1, 1, 1)
        .await
        .unwrap_err();

    assert!(matches!(err, HistoryError::BadRequest(_)));
    assert!(harness.history.forks().is_empty());
    assert_eq!(harness.releases(), vec![None]);
    harness.assert_target_untouched();
}
