//! Branch layout inside a history tree.
//!
//! A tree holds every branch of one workflow execution. A branch owns the
//! nodes it appended itself and borrows older nodes from its ancestors:
//!
//! ```text
//! B1: [1 ............ 9]
//! B2:  ancestors [B1: 1..6)  own [6 ... 8]
//! B3:  ancestors [B1: 1..6) [B2: 6..8)  own [8 ...]
//! ```
//!
//! The layout is encoded into the opaque [`BranchToken`] handed to callers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use history_types::{BranchToken, HistoryError, HistoryResult, FIRST_EVENT_ID};

/// Half-open node range `[begin_node_id, end_node_id)` read from an ancestor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryBranchRange {
    pub branch_id: Uuid,
    pub begin_node_id: i64,
    pub end_node_id: i64,
}

/// Decoded form of a branch token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryBranch {
    pub tree_id: Uuid,
    pub branch_id: Uuid,
    pub ancestors: Vec<HistoryBranchRange>,
}

/// Contiguous node range to read from one branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadSegment {
    pub branch_id: Uuid,
    pub min_node_id: i64,
    pub max_node_id: i64,
}

impl HistoryBranch {
    /// A root branch in a (possibly new) tree.
    pub fn new_root(tree_id: Uuid) -> Self {
        Self {
            tree_id,
            branch_id: Uuid::new_v4(),
            ancestors: Vec::new(),
        }
    }

    /// Encode this layout as an opaque branch token.
    pub fn to_token(&self) -> HistoryResult<BranchToken> {
        Ok(BranchToken::from_bytes(serde_json::to_vec(self)?))
    }

    /// Decode a token produced by [`HistoryBranch::to_token`].
    pub fn from_token(token: &BranchToken) -> HistoryResult<Self> {
        if token.is_empty() {
            return Err(HistoryError::BadRequest("branch token is empty".to_string()));
        }
        serde_json::from_slice(token.as_bytes())
            .map_err(|e| HistoryError::BadRequest(format!("malformed branch token: {}", e)))
    }

    /// First node id this branch owns.
    pub fn own_begin_node_id(&self) -> i64 {
        self.ancestors
            .last()
            .map(|a| a.end_node_id)
            .unwrap_or(FIRST_EVENT_ID)
    }

    /// Segments covering `[min_node_id, max_node_id)`, oldest first.
    pub fn read_plan(&self, min_node_id: i64, max_node_id: i64) -> Vec<ReadSegment> {
        let mut plan = Vec::new();
        for ancestor in &self.ancestors {
            let lo = ancestor.begin_node_id.max(min_node_id);
            let hi = ancestor.end_node_id.min(max_node_id);
            if lo < hi {
                plan.push(ReadSegment {
                    branch_id: ancestor.branch_id,
                    min_node_id: lo,
                    max_node_id: hi,
                });
            }
        }
        let lo = self.own_begin_node_id().max(min_node_id);
        if lo < max_node_id {
            plan.push(ReadSegment {
                branch_id: self.branch_id,
                min_node_id: lo,
                max_node_id,
            });
        }
        plan
    }

    /// Layout of a new branch sharing nodes `[1, fork_node_id)` with this one.
    pub fn fork_at(&self, fork_node_id: i64, new_branch_id: Uuid) -> HistoryResult<HistoryBranch> {
        if fork_node_id <= FIRST_EVENT_ID {
            return Err(HistoryError::BadRequest(format!(
                "fork node id {} must be greater than {}",
                fork_node_id, FIRST_EVENT_ID
            )));
        }

        let mut ancestors = Vec::new();
        for ancestor in &self.ancestors {
            if ancestor.begin_node_id >= fork_node_id {
                break;
            }
            if ancestor.end_node_id >= fork_node_id {
                ancestors.push(HistoryBranchRange {
                    end_node_id: fork_node_id,
                    ..ancestor.clone()
                });
                return Ok(HistoryBranch {
                    tree_id: self.tree_id,
                    branch_id: new_branch_id,
                    ancestors,
                });
            }
            ancestors.push(ancestor.clone());
        }

        let begin = self.own_begin_node_id();
        if fork_node_id > begin {
            ancestors.push(HistoryBranchRange {
                branch_id: self.branch_id,
                begin_node_id: begin,
                end_node_id: fork_node_id,
            });
        }
        Ok(HistoryBranch {
            tree_id: self.tree_id,
            branch_id: new_branch_id,
            ancestors,
        })
    }
}
