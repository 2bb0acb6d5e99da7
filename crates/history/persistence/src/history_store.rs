//! History store boundary.
//!
//! The store persists event batches ("nodes") on branches of a history tree.
//! A node id is the id of the first event of the batch.

use async_trait::async_trait;

use history_types::{BranchToken, DomainId, HistoryEvent, HistoryResult, RunId, WorkflowId};

/// Page size used by [`HistoryStore::read_history_branch`].
pub const DEFAULT_READ_PAGE_SIZE: usize = 100;

/// Garbage-cleanup info stored with a branch so abandoned branches can be
/// traced back to the run that created them.
pub fn build_history_garbage_cleanup_info(
    domain_id: &DomainId,
    workflow_id: &WorkflowId,
    run_id: &RunId,
) -> String {
    format!("{}:{}:{}", domain_id, workflow_id, run_id)
}

#[derive(Clone, Debug)]
pub struct AppendHistoryNodesRequest {
    pub branch_token: BranchToken,
    /// One batch; its first event id becomes the node id.
    pub events: Vec<HistoryEvent>,
    pub transaction_id: i64,
    pub shard_id: Option<i32>,
    pub domain_name: String,
}

#[derive(Clone, Debug)]
pub struct AppendHistoryNodesResponse {
    /// Serialized size of the appended batch in bytes.
    pub size: i64,
}

#[derive(Clone, Debug)]
pub struct ReadHistoryBranchRequest {
    pub branch_token: BranchToken,
    /// Inclusive.
    pub min_event_id: i64,
    /// Exclusive.
    pub max_event_id: i64,
    /// Maximum number of batches per page.
    pub page_size: usize,
    pub next_page_token: Option<Vec<u8>>,
    pub shard_id: Option<i32>,
    pub domain_name: String,
}

#[derive(Clone, Debug, Default)]
pub struct ReadHistoryBranchByBatchResponse {
    pub history: Vec<Vec<HistoryEvent>>,
    /// `None` once the range is exhausted.
    pub next_page_token: Option<Vec<u8>>,
    /// Serialized size of the returned batches in bytes.
    pub size: i64,
    pub last_first_event_id: i64,
}

#[derive(Clone, Debug)]
pub struct ForkHistoryBranchRequest {
    pub fork_branch_token: BranchToken,
    /// First node that is NOT shared with the fork source.
    pub fork_node_id: i64,
    pub info: String,
    pub shard_id: Option<i32>,
    pub domain_name: String,
}

#[derive(Clone, Debug)]
pub struct ForkHistoryBranchResponse {
    pub new_branch_token: BranchToken,
}

#[derive(Clone, Debug)]
pub struct DeleteHistoryBranchRequest {
    pub branch_token: BranchToken,
    pub shard_id: Option<i32>,
    pub domain_name: String,
}

/// Durable storage of event history branches.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create an empty root branch, in `tree_id` or a fresh tree.
    async fn new_history_branch(&self, tree_id: Option<uuid::Uuid>) -> HistoryResult<BranchToken>;

    /// Append one batch of events as a new node.
    async fn append_history_nodes(
        &self,
        request: &AppendHistoryNodesRequest,
    ) -> HistoryResult<AppendHistoryNodesResponse>;

    /// Read one page of batches in `[min_event_id, max_event_id)`.
    async fn read_history_branch_by_batch(
        &self,
        request: &ReadHistoryBranchRequest,
    ) -> HistoryResult<ReadHistoryBranchByBatchResponse>;

    /// Fork a branch: the new branch shares nodes before `fork_node_id`.
    async fn fork_history_branch(
        &self,
        request: &ForkHistoryBranchRequest,
    ) -> HistoryResult<ForkHistoryBranchResponse>;

    /// Delete a branch, keeping nodes other branches still read.
    async fn delete_history_branch(&self, request: &DeleteHistoryBranchRequest) -> HistoryResult<()>;

    /// Garbage-cleanup info recorded when the branch was created.
    async fn branch_info(&self, branch_token: &BranchToken) -> HistoryResult<String>;

    /// Read all events in `[min_event_id, max_event_id)`, following pages.
    async fn read_history_branch(
        &self,
        branch_token: &BranchToken,
        min_event_id: i64,
        max_event_id: i64,
        domain_name: &str,
    ) -> HistoryResult<Vec<HistoryEvent>> {
        let mut events = Vec::new();
        let mut next_page_token = None;
        loop {
            let response = self
                .read_history_branch_by_batch(&ReadHistoryBranchRequest {
                    branch_token: branch_token.clone(),
                    min_event_id,
                    max_event_id,
                    page_size: DEFAULT_READ_PAGE_SIZE,
                    next_page_token: next_page_token.take(),
                    shard_id: None,
                    domain_name: domain_name.to_string(),
                })
                .await?;
            events.extend(response.history.into_iter().flatten());
            match response.next_page_token {
                Some(token) => next_page_token = Some(token),
                None => break,
            }
        }
        Ok(events)
    }
}
