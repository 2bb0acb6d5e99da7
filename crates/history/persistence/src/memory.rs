//! In-memory history store for development and testing.
//!
//! Implements the full branch/ancestor layout of [`HistoryBranch`] so forks
//! read their shared prefix from the source branch. Not suitable for
//! production use.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use history_types::{BranchToken, HistoryError, HistoryEvent, HistoryResult, FIRST_EVENT_ID};

use crate::branch::HistoryBranch;
use crate::history_store::{
    AppendHistoryNodesRequest, AppendHistoryNodesResponse, DeleteHistoryBranchRequest,
    ForkHistoryBranchRequest, ForkHistoryBranchResponse, HistoryStore,
    ReadHistoryBranchByBatchResponse, ReadHistoryBranchRequest,
};

#[derive(Clone, Debug)]
struct StoredNode {
    events: Vec<HistoryEvent>,
    size: i64,
    /// Appends to a branch must carry increasing transaction ids.
    transaction_id: i64,
}

#[derive(Debug)]
struct BranchRecord {
    branch: HistoryBranch,
    info: String,
    /// Nodes this branch appended itself, keyed by node id.
    nodes: BTreeMap<i64, StoredNode>,
    /// Deleted but still holding nodes read by other branches.
    deleted: bool,
}

/// In-memory history store implementation.
pub struct InMemoryHistoryStore {
    branches: Arc<DashMap<Uuid, BranchRecord>>,
}

impl InMemoryHistoryStore {
    /// Create a new in-memory history store.
    pub fn new() -> Self {
        Self {
            branches: Arc::new(DashMap::new()),
        }
    }

    /// Number of live (not deleted) branches.
    pub fn branch_count(&self) -> usize {
        self.branches.iter().filter(|r| !r.deleted).count()
    }

    fn decode_live(&self, token: &BranchToken) -> HistoryResult<HistoryBranch> {
        let branch = HistoryBranch::from_token(token)?;
        match self.branches.get(&branch.branch_id) {
            Some(record) if !record.deleted => Ok(branch),
            _ => Err(HistoryError::EntityNotExists(format!(
                "history branch {} not found",
                branch.branch_id
            ))),
        }
    }

    /// Clone every node of `branch` with node id in `[min_node_id, max_node_id)`.
    fn collect_nodes(
        &self,
        branch: &HistoryBranch,
        min_node_id: i64,
        max_node_id: i64,
    ) -> HistoryResult<Vec<(i64, StoredNode)>> {
        let mut nodes = Vec::new();
        for segment in branch.read_plan(min_node_id, max_node_id) {
            let record = self.branches.get(&segment.branch_id).ok_or_else(|| {
                HistoryError::EntityNotExists(format!(
                    "ancestor branch {} not found",
                    segment.branch_id
                ))
            })?;
            nodes.extend(
                record
                    .nodes
                    .range(segment.min_node_id..segment.max_node_id)
                    .map(|(id, node)| (*id, node.clone())),
            );
        }
        Ok(nodes)
    }

    /// Drop deleted records no live branch reads from anymore.
    fn sweep_unreferenced(&self, tree_id: Uuid) {
        let referenced: Vec<Uuid> = self
            .branches
            .iter()
            .filter(|r| r.branch.tree_id == tree_id && !r.deleted)
            .flat_map(|r| {
                r.branch
                    .ancestors
                    .iter()
                    .map(|a| a.branch_id)
                    .collect::<Vec<_>>()
            })
            .collect();
        self.branches.retain(|id, record| {
            record.branch.tree_id != tree_id || !record.deleted || referenced.contains(id)
        });
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_page_token(next_node_id: i64) -> Vec<u8> {
    next_node_id.to_be_bytes().to_vec()
}

fn decode_page_token(token: &[u8]) -> HistoryResult<i64> {
    let bytes: [u8; 8] = token
        .try_into()
        .map_err(|_| HistoryError::BadRequest("malformed next page token".to_string()))?;
    Ok(i64::from_be_bytes(bytes))
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn new_history_branch(&self, tree_id: Option<Uuid>) -> HistoryResult<BranchToken> {
        let branch = HistoryBranch::new_root(tree_id.unwrap_or_else(Uuid::new_v4));
        let token = branch.to_token()?;
        self.branches.insert(
            branch.branch_id,
            BranchRecord {
                branch,
                info: String::new(),
                nodes: BTreeMap::new(),
                deleted: false,
            },
        );
        Ok(token)
    }

    async fn append_history_nodes(
        &self,
        request: &AppendHistoryNodesRequest,
    ) -> HistoryResult<AppendHistoryNodesResponse> {
        let Some(first) = request.events.first() else {
            return Err(HistoryError::BadRequest("cannot append an empty batch".to_string()));
        };
        let node_id = first.event_id;
        for (offset, event) in request.events.iter().enumerate() {
            if event.event_id.checked_sub(node_id) != Some(offset as i64) {
                return Err(HistoryError::BadRequest(format!(
                    "batch event ids are not contiguous at event {}",
                    event.event_id
                )));
            }
        }

        let branch = self.decode_live(&request.branch_token)?;
        let size = serde_json::to_vec(&request.events)?.len() as i64;

        let mut record = self.branches.get_mut(&branch.branch_id).ok_or_else(|| {
            HistoryError::EntityNotExists(format!("history branch {} not found", branch.branch_id))
        })?;

        let last_node = record.nodes.values().next_back();
        let expected = match last_node.and_then(|node| node.events.last()) {
            Some(last) => last.event_id.checked_add(1).ok_or_else(|| {
                HistoryError::BadRequest(format!(
                    "branch {} cannot grow past event {}",
                    branch.branch_id, last.event_id
                ))
            })?,
            None => branch.own_begin_node_id(),
        };
        if node_id < expected {
            return Err(HistoryError::ConditionFailed(format!(
                "node {} already exists on branch {}",
                node_id, branch.branch_id
            )));
        }
        if node_id > expected {
            return Err(HistoryError::BadRequest(format!(
                "node {} leaves a gap on branch {}, expected {}",
                node_id, branch.branch_id, expected
            )));
        }
        if let Some(last) = last_node {
            if request.transaction_id <= last.transaction_id {
                return Err(HistoryError::ConditionFailed(format!(
                    "stale transaction {} on branch {}, last appended {}",
                    request.transaction_id, branch.branch_id, last.transaction_id
                )));
            }
        }

        record.nodes.insert(
            node_id,
            StoredNode {
                events: request.events.clone(),
                size,
                transaction_id: request.transaction_id,
            },
        );
        Ok(AppendHistoryNodesResponse { size })
    }

    async fn read_history_branch_by_batch(
        &self,
        request: &ReadHistoryBranchRequest,
    ) -> HistoryResult<ReadHistoryBranchByBatchResponse> {
        if request.min_event_id < FIRST_EVENT_ID || request.max_event_id <= request.min_event_id {
            return Err(HistoryError::BadRequest(format!(
                "invalid read range [{}, {})",
                request.min_event_id, request.max_event_id
            )));
        }
        let branch = self.decode_live(&request.branch_token)?;
        let start = match &request.next_page_token {
            Some(token) => decode_page_token(token)?,
            None => request.min_event_id,
        };
        let nodes = self.collect_nodes(&branch, start, request.max_event_id)?;
        if nodes.is_empty() && request.next_page_token.is_none() {
            return Err(HistoryError::EntityNotExists(format!(
                "no history in [{}, {}) on branch {}",
                request.min_event_id, request.max_event_id, branch.branch_id
            )));
        }

        let page_size = request.page_size.max(1);
        let mut response = ReadHistoryBranchByBatchResponse::default();
        for (node_id, node) in nodes.iter().take(page_size) {
            response.size += node.size;
            response.last_first_event_id = *node_id;
            response.history.push(node.events.clone());
        }
        if let Some((next_node_id, _)) = nodes.get(page_size) {
            response.next_page_token = Some(encode_page_token(*next_node_id));
        }
        Ok(response)
    }

    async fn fork_history_branch(
        &self,
        request: &ForkHistoryBranchRequest,
    ) -> HistoryResult<ForkHistoryBranchResponse> {
        let source = self.decode_live(&request.fork_branch_token)?;
        let forked = source.fork_at(request.fork_node_id, Uuid::new_v4())?;

        let prefix = self.collect_nodes(&source, FIRST_EVENT_ID, request.fork_node_id)?;
        let last_shared = prefix
            .last()
            .and_then(|(_, node)| node.events.last())
            .map(|e| e.event_id);
        // fork_at rejects fork ids at or below the first event.
        if last_shared != Some(request.fork_node_id - 1) {
            return Err(HistoryError::BadRequest(format!(
                "fork node {} is not at a batch boundary of branch {}",
                request.fork_node_id, source.branch_id
            )));
        }

        let token = forked.to_token()?;
        debug!(
            tree_id = %forked.tree_id,
            source = %source.branch_id,
            branch = %forked.branch_id,
            fork_node_id = request.fork_node_id,
            domain = %request.domain_name,
            "Forked history branch"
        );
        self.branches.insert(
            forked.branch_id,
            BranchRecord {
                branch: forked,
                info: request.info.clone(),
                nodes: BTreeMap::new(),
                deleted: false,
            },
        );
        Ok(ForkHistoryBranchResponse {
            new_branch_token: token,
        })
    }

    async fn delete_history_branch(&self, request: &DeleteHistoryBranchRequest) -> HistoryResult<()> {
        let branch = self.decode_live(&request.branch_token)?;

        // Highest node of this branch other live branches still read.
        let referenced_end = self
            .branches
            .iter()
            .filter(|r| {
                !r.deleted
                    && r.branch.tree_id == branch.tree_id
                    && r.branch.branch_id != branch.branch_id
            })
            .flat_map(|r| {
                r.branch
                    .ancestors
                    .iter()
                    .filter(|a| a.branch_id == branch.branch_id)
                    .map(|a| a.end_node_id)
                    .collect::<Vec<_>>()
            })
            .max();

        match referenced_end {
            None => {
                self.branches.remove(&branch.branch_id);
            }
            Some(end) => {
                if let Some(mut record) = self.branches.get_mut(&branch.branch_id) {
                    record.deleted = true;
                    record.nodes.retain(|node_id, _| *node_id < end);
                }
            }
        }
        self.sweep_unreferenced(branch.tree_id);

        debug!(branch = %branch.branch_id, "Deleted history branch");
        Ok(())
    }

    async fn branch_info(&self, branch_token: &BranchToken) -> HistoryResult<String> {
        let branch = self.decode_live(branch_token)?;
        self.branches
            .get(&branch.branch_id)
            .map(|r| r.info.clone())
            .ok_or_else(|| {
                HistoryError::EntityNotExists(format!("history branch {} not found", branch.branch_id))
            })
    }
}
