//! State rebuilder: replays a branch prefix into a fresh mutable state.
//!
//! The target branch token is produced lazily. It is requested once the
//! first batch has been applied, so a rebuild that fails on its first read
//! never forks a branch.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::{debug, instrument};

use history_persistence::{HistoryStore, ReadHistoryBranchRequest};
use history_types::{
    BranchToken, HistoryError, HistoryEvent, HistoryResult, MutableState, RequestContext,
    VersionHistoryItem, WorkflowIdentifier, EMPTY_EVENT_ID, FIRST_EVENT_ID,
};

use crate::shard::ShardContext;
use crate::state_builder::StateBuilder;

/// Produces the branch token of the rebuilt run. Called at most once.
pub type BranchTokenProvider<'a> =
    Box<dyn FnOnce() -> BoxFuture<'a, HistoryResult<BranchToken>> + Send + 'a>;

/// Rebuilds mutable state for a new run from an existing branch.
#[async_trait]
pub trait StateRebuilder: Send + Sync {
    /// Replay events `[1, base_last_event_id]` of `base_branch_token` into a
    /// new state for `target_identifier`.
    ///
    /// Returns the rebuilt state and the byte size of the replayed history.
    #[allow(clippy::too_many_arguments)]
    async fn rebuild<'a>(
        &self,
        ctx: &RequestContext,
        now: DateTime<Utc>,
        base_identifier: &WorkflowIdentifier,
        base_branch_token: &BranchToken,
        base_last_event_id: i64,
        base_last_event_version: i64,
        target_identifier: &WorkflowIdentifier,
        target_branch_fn: BranchTokenProvider<'a>,
        request_id: &str,
    ) -> HistoryResult<(MutableState, i64)>;
}

/// Pages through a branch one batch at a time.
struct HistoryBatchIterator<'a> {
    ctx: &'a RequestContext,
    store: Arc<dyn HistoryStore>,
    request: ReadHistoryBranchRequest,
    pending: VecDeque<Vec<HistoryEvent>>,
    exhausted: bool,
    size: i64,
}

impl<'a> HistoryBatchIterator<'a> {
    fn new(ctx: &'a RequestContext, store: Arc<dyn HistoryStore>, request: ReadHistoryBranchRequest) -> Self {
        Self {
            ctx,
            store,
            request,
            pending: VecDeque::new(),
            exhausted: false,
            size: 0,
        }
    }

    async fn next_batch(&mut self) -> HistoryResult<Option<Vec<HistoryEvent>>> {
        loop {
            if let Some(batch) = self.pending.pop_front() {
                return Ok(Some(batch));
            }
            if self.exhausted {
                return Ok(None);
            }

            let response = self
                .ctx
                .run(
                    "read history branch",
                    self.store.read_history_branch_by_batch(&self.request),
                )
                .await?;
            self.size += response.size;
            self.exhausted = response.next_page_token.is_none();
            self.request.next_page_token = response.next_page_token;
            self.pending.extend(response.history);
        }
    }

    /// Bytes read so far.
    fn size(&self) -> i64 {
        self.size
    }
}

/// [`StateRebuilder`] reading through the shard's history store.
pub struct NdcStateRebuilder {
    shard: Arc<dyn ShardContext>,
}

impl NdcStateRebuilder {
    /// Create a rebuilder reading from the shard's history store.
    pub fn new(shard: Arc<dyn ShardContext>) -> Self {
        Self { shard }
    }
}

#[async_trait]
impl StateRebuilder for NdcStateRebuilder {
    #[instrument(
        skip(self, ctx, now, base_identifier, base_branch_token, target_identifier, target_branch_fn),
        fields(base = %base_identifier, target = %target_identifier)
    )]
    async fn rebuild<'a>(
        &self,
        ctx: &RequestContext,
        now: DateTime<Utc>,
        base_identifier: &WorkflowIdentifier,
        base_branch_token: &BranchToken,
        base_last_event_id: i64,
        base_last_event_version: i64,
        target_identifier: &WorkflowIdentifier,
        target_branch_fn: BranchTokenProvider<'a>,
        request_id: &str,
    ) -> HistoryResult<(MutableState, i64)> {
        let max_event_id = base_last_event_id.checked_add(1).ok_or_else(|| {
            HistoryError::BadRequest(format!(
                "base last event id {} is out of range",
                base_last_event_id
            ))
        })?;
        let directory = self.shard.domain_directory();
        let domain_name = ctx
            .run("get domain name", directory.get_domain_name(&target_identifier.domain_id))
            .await?;

        let mut batches = HistoryBatchIterator::new(
            ctx,
            self.shard.history_store(),
            ReadHistoryBranchRequest {
                branch_token: base_branch_token.clone(),
                min_event_id: FIRST_EVENT_ID,
                max_event_id,
                page_size: self.shard.config().rebuild_page_size,
                next_page_token: None,
                shard_id: Some(self.shard.shard_id()),
                domain_name,
            },
        );

        let mut builder = StateBuilder::new(MutableState::new(target_identifier.clone(), now));
        let mut target_branch_fn = Some(target_branch_fn);
        let mut last_event_id = EMPTY_EVENT_ID;

        while let Some(batch) = batches.next_batch().await? {
            builder.apply_events(request_id, &batch)?;
            if let Some(last) = batch.last() {
                last_event_id = last.event_id;
            }

            if let Some(branch_fn) = target_branch_fn.take() {
                let target_branch_token = branch_fn().await?;
                builder
                    .mutable_state_mut()
                    .set_current_branch_token(target_branch_token)?;
            }
        }

        if target_branch_fn.is_some() {
            return Err(HistoryError::BadRequest(format!(
                "unable to rebuild mutable state from {}: no history events",
                base_identifier
            )));
        }
        if last_event_id != base_last_event_id {
            return Err(HistoryError::BadRequest(format!(
                "unable to rebuild mutable state to event ID: {}, last replayed event ID: {}, this event must be at the boundary",
                base_last_event_id, last_event_id
            )));
        }

        let mut state = builder.into_mutable_state();
        let expected = VersionHistoryItem::new(base_last_event_id, base_last_event_version);
        if let Some(histories) = state.version_histories() {
            let last_item = histories.current_version_history()?.last_item()?;
            if last_item != expected {
                return Err(HistoryError::BadRequest(format!(
                    "unable to rebuild mutable state to {}, rebuilt last item is {}, this event must be at the boundary",
                    expected, last_item
                )));
            }
        }

        state.execution_info.start_timestamp = now;
        let size = batches.size();
        debug!(
            replayed = state.replayed_event_count(),
            history_size = size,
            "Rebuilt mutable state"
        );
        Ok((state, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NdcConfig;
    use futures::FutureExt;
    use crate::shard::ShardContextImpl;
    use history_persistence::{
        AppendHistoryNodesRequest, InMemoryDomainCache, InMemoryExecutionStore,
        InMemoryHistoryStore,
    };
    use history_types::{DomainId, EventAttributes, RunId, WorkflowId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        shard: Arc<ShardContextImpl>,
        store: Arc<InMemoryHistoryStore>,
        token: BranchToken,
    }

    fn identifier(run: &str) -> WorkflowIdentifier {
        WorkflowIdentifier::new(DomainId::new("d"), WorkflowId::new("w"), RunId::new(run))
    }

    fn event(event_id: i64, version: i64) -> HistoryEvent {
        let attributes = if event_id == FIRST_EVENT_ID {
            EventAttributes::WorkflowExecutionStarted {
                workflow_type: "wf".into(),
                task_list: "tl".into(),
                input: vec![],
            }
        } else {
            EventAttributes::MarkerRecorded {
                marker_name: format!("m{}", event_id),
            }
        };
        HistoryEvent::new(event_id, version, attributes)
    }

    /// Branch with one node per `(first, last, version)` batch.
    async fn fixture(batches: &[(i64, i64, i64)], page_size: usize) -> Fixture {
        let store = Arc::new(InMemoryHistoryStore::new());
        let domains = Arc::new(InMemoryDomainCache::new());
        domains.register(DomainId::new("d"), "domain");
        let token = store.new_history_branch(None).await.unwrap();
        for (first, last, version) in batches {
            store
                .append_history_nodes(&AppendHistoryNodesRequest {
                    branch_token: token.clone(),
                    events: (*first..=*last).map(|id| event(id, *version)).collect(),
                    transaction_id: *first,
                    shard_id: Some(3),
                    domain_name: "domain".into(),
                })
                .await
                .unwrap();
        }
        let config = NdcConfig {
            rebuild_page_size: page_size,
            ..NdcConfig::default()
        };
        let shard = Arc::new(ShardContextImpl::new(
            3,
            store.clone(),
            Arc::new(InMemoryExecutionStore::new()),
            domains,
            config,
        ));
        Fixture { shard, store, token }
    }

    fn provider<'a>(calls: &'a AtomicUsize, token: BranchToken) -> BranchTokenProvider<'a> {
        Box::new(move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(token)
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn rebuilds_across_pages() {
        let fx = fixture(&[(1, 2, 1), (3, 3, 1), (4, 5, 2), (6, 7, 2)], 1).await;
        let rebuilder = NdcStateRebuilder::new(fx.shard.clone());
        let calls = AtomicUsize::new(0);
        let new_token = BranchToken::from_bytes(b"target".to_vec());
        let now = Utc::now();

        let (state, size) = rebuilder
            .rebuild(
                &RequestContext::background(),
                now,
                &identifier("base"),
                &fx.token,
                5,
                2,
                &identifier("new"),
                provider(&calls, new_token.clone()),
                "req",
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.identifier(), &identifier("new"));
        assert_eq!(state.replayed_event_count(), 5);
        assert_eq!(state.current_branch_token().unwrap(), new_token);
        assert_eq!(state.execution_info.start_timestamp, now);
        assert_eq!(state.execution_info.create_request_id, "req");
        assert!(size > 0);

        let full = fx.store.read_history_branch(&fx.token, 1, 6, "domain").await.unwrap();
        assert_eq!(full.len(), 5);
    }

    #[tokio::test]
    async fn watermark_inside_a_batch_is_rejected() {
        let fx = fixture(&[(1, 2, 1), (3, 5, 1)], 10).await;
        let rebuilder = NdcStateRebuilder::new(fx.shard.clone());
        let calls = AtomicUsize::new(0);

        let err = rebuilder
            .rebuild(
                &RequestContext::background(),
                Utc::now(),
                &identifier("base"),
                &fx.token,
                4,
                1,
                &identifier("new"),
                provider(&calls, BranchToken::from_bytes(vec![1])),
                "req",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::BadRequest(_)));
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let fx = fixture(&[(1, 3, 1)], 10).await;
        let rebuilder = NdcStateRebuilder::new(fx.shard.clone());
        let calls = AtomicUsize::new(0);

        let err = rebuilder
            .rebuild(
                &RequestContext::background(),
                Utc::now(),
                &identifier("base"),
                &fx.token,
                3,
                2,
                &identifier("new"),
                provider(&calls, BranchToken::from_bytes(vec![1])),
                "req",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::BadRequest(_)));
    }

    #[tokio::test]
    async fn failed_first_read_never_requests_a_token() {
        let fx = fixture(&[], 10).await;
        let rebuilder = NdcStateRebuilder::new(fx.shard.clone());
        let calls = AtomicUsize::new(0);

        let err = rebuilder
            .rebuild(
                &RequestContext::background(),
                Utc::now(),
                &identifier("base"),
                &fx.token,
                3,
                1,
                &identifier("new"),
                provider(&calls, BranchToken::from_bytes(vec![1])),
                "req",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::EntityNotExists(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_target_domain_fails_before_reading() {
        let fx = fixture(&[(1, 3, 1)], 10).await;
        let rebuilder = NdcStateRebuilder::new(fx.shard.clone());
        let calls = AtomicUsize::new(0);
        let target = WorkflowIdentifier::new(DomainId::new("other"), WorkflowId::new("w"), RunId::new("new"));

        let err = rebuilder
            .rebuild(
                &RequestContext::background(),
                Utc::now(),
                &identifier("base"),
                &fx.token,
                3,
                1,
                &target,
                provider(&calls, BranchToken::from_bytes(vec![1])),
                "req",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::EntityNotExists(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
