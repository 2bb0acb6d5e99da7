//! Version histories: per-branch (event id, version) watermarks.
//!
//! Every branch of a workflow execution carries a [`VersionHistory`]. Each
//! item `(e, v)` marks the last event `e` written at version `v`, so the
//! items partition the branch into version ranges:
//!
//! ```text
//! items: (3, 1) (7, 4) (9, 6)
//! events 1..=3 -> v1, 4..=7 -> v4, 8..=9 -> v6
//! ```
//!
//! Branches of the same execution share a prefix up to their lowest common
//! ancestor (LCA) item and are collected in [`VersionHistories`].

use serde::{Deserialize, Serialize};

use crate::branch::BranchToken;
use crate::error::{HistoryError, HistoryResult};

/// Id of the first event of every run.
pub const FIRST_EVENT_ID: i64 = 1;

/// Sentinel for "no event".
pub const EMPTY_EVENT_ID: i64 = 0;

/// A watermark: the branch contains events up to `event_id` at `version`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    pub event_id: i64,
    pub version: i64,
}

impl VersionHistoryItem {
    /// Create a watermark for `event_id` written at `version`.
    pub fn new(event_id: i64, version: i64) -> Self {
        Self { event_id, version }
    }
}

impl std::fmt::Display for VersionHistoryItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.event_id, self.version)
    }
}

/// Watermarks of a single branch plus the token of that branch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistory {
    branch_token: BranchToken,
    items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    /// Create a history over `items` for the branch `branch_token`.
    pub fn new(branch_token: BranchToken, items: Vec<VersionHistoryItem>) -> Self {
        Self {
            branch_token,
            items,
        }
    }

    /// Deep copy of this history.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// Copy of this history truncated at `lca`, with an empty branch token.
    pub fn duplicate_until_lca_item(&self, lca: VersionHistoryItem) -> HistoryResult<Self> {
        let mut history = VersionHistory::default();
        for item in &self.items {
            if item.version < lca.version {
                history.add_or_update_item(*item)?;
            } else if item.version == lca.version {
                if lca.event_id > item.event_id {
                    break;
                }
                history.add_or_update_item(lca)?;
                return Ok(history);
            } else {
                break;
            }
        }
        Err(HistoryError::BadRequest(format!(
            "version history does not contain the LCA item {}",
            lca
        )))
    }

    pub fn branch_token(&self) -> &BranchToken {
        &self.branch_token
    }

    pub fn set_branch_token(&mut self, branch_token: BranchToken) {
        self.branch_token = branch_token;
    }

    pub fn items(&self) -> &[VersionHistoryItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Record that `item.event_id` was written at `item.version`.
    ///
    /// Extends the last watermark when the version is unchanged, appends a
    /// new one when the version increases, rejects anything going backwards.
    pub fn add_or_update_item(&mut self, item: VersionHistoryItem) -> HistoryResult<()> {
        let Some(last) = self.items.last_mut() else {
            self.items.push(item);
            return Ok(());
        };

        if item.version < last.version {
            return Err(HistoryError::BadRequest(format!(
                "cannot update version history with a lower version {}, last version: {}",
                item.version, last.version
            )));
        }
        if item.event_id <= last.event_id {
            return Err(HistoryError::BadRequest(format!(
                "cannot add version history with a lower event id {}, last event id: {}",
                item.event_id, last.event_id
            )));
        }

        if item.version > last.version {
            self.items.push(item);
        } else {
            last.event_id = item.event_id;
        }
        Ok(())
    }

    /// Whether the branch holds event `item.event_id` written at `item.version`.
    pub fn contains_item(&self, item: &VersionHistoryItem) -> bool {
        let mut prev_event_id = FIRST_EVENT_ID - 1;
        for current in &self.items {
            if item.version == current.version {
                if prev_event_id < item.event_id && item.event_id <= current.event_id {
                    return true;
                }
            } else if item.version < current.version {
                return false;
            }
            prev_event_id = current.event_id;
        }
        false
    }

    /// Lowest common ancestor item shared with `remote`.
    pub fn find_lca_item(&self, remote: &VersionHistory) -> HistoryResult<VersionHistoryItem> {
        let mut local_index = self.items.len();
        let mut remote_index = remote.items.len();

        while local_index > 0 && remote_index > 0 {
            let local = self.items[local_index - 1];
            let other = remote.items[remote_index - 1];
            if local.version == other.version {
                return Ok(if local.event_id > other.event_id {
                    other
                } else {
                    local
                });
            } else if local.version > other.version {
                local_index -= 1;
            } else {
                remote_index -= 1;
            }
        }

        Err(HistoryError::BadRequest(
            "version history is malformed, no joint point found".to_string(),
        ))
    }

    /// Events can be appended directly when the LCA is this branch's tip.
    pub fn is_lca_appendable(&self, lca: &VersionHistoryItem) -> HistoryResult<bool> {
        Ok(self.last_item()? == *lca)
    }

    pub fn first_item(&self) -> HistoryResult<VersionHistoryItem> {
        self.items
            .first()
            .copied()
            .ok_or_else(|| HistoryError::BadRequest("version history is empty".to_string()))
    }

    pub fn last_item(&self) -> HistoryResult<VersionHistoryItem> {
        self.items
            .last()
            .copied()
            .ok_or_else(|| HistoryError::BadRequest("version history is empty".to_string()))
    }

    /// Version at which `event_id` was written on this branch.
    pub fn event_version(&self, event_id: i64) -> HistoryResult<i64> {
        let last = self.last_item()?;
        if event_id < FIRST_EVENT_ID || event_id > last.event_id {
            return Err(HistoryError::BadRequest(format!(
                "event id {} is not in range [{}, {}]",
                event_id, FIRST_EVENT_ID, last.event_id
            )));
        }
        self.items
            .iter()
            .find(|item| event_id <= item.event_id)
            .map(|item| item.version)
            .ok_or_else(|| {
                HistoryError::BadRequest(format!("event id {} is not in range", event_id))
            })
    }

    /// Check that event ids strictly increase and versions never decrease.
    pub fn validate(&self) -> HistoryResult<()> {
        let mut prev: Option<VersionHistoryItem> = None;
        for item in &self.items {
            if item.event_id < FIRST_EVENT_ID {
                return Err(HistoryError::DataIntegrity(format!(
                    "version history item {} has an invalid event id",
                    item
                )));
            }
            if let Some(prev) = prev {
                if item.event_id <= prev.event_id {
                    return Err(HistoryError::DataIntegrity(format!(
                        "version history event ids not increasing: {} after {}",
                        item, prev
                    )));
                }
                if item.version < prev.version {
                    return Err(HistoryError::DataIntegrity(format!(
                        "version history versions decreasing: {} after {}",
                        item, prev
                    )));
                }
            }
            prev = Some(*item);
        }
        Ok(())
    }
}

/// All retained branches of one execution; exactly one is current.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistories {
    current_version_history_index: usize,
    histories: Vec<VersionHistory>,
}

impl VersionHistories {
    /// Create a collection holding `version_history` as current.
    pub fn new(version_history: VersionHistory) -> Self {
        Self {
            current_version_history_index: 0,
            histories: vec![version_history],
        }
    }

    /// Ingest histories loaded from outside the core, validating invariants.
    pub fn from_histories(
        current_version_history_index: usize,
        histories: Vec<VersionHistory>,
    ) -> HistoryResult<Self> {
        let histories = Self {
            current_version_history_index,
            histories,
        };
        histories.validate()?;
        Ok(histories)
    }

    pub fn validate(&self) -> HistoryResult<()> {
        if self.histories.is_empty() {
            return Err(HistoryError::DataIntegrity(
                "version histories contain no branch".to_string(),
            ));
        }
        if self.current_version_history_index >= self.histories.len() {
            return Err(HistoryError::DataIntegrity(format!(
                "current version history index {} out of bounds (len {})",
                self.current_version_history_index,
                self.histories.len()
            )));
        }
        for history in &self.histories {
            history.validate()?;
        }
        Ok(())
    }

    pub fn histories(&self) -> &[VersionHistory] {
        &self.histories
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }

    pub fn get_version_history(&self, index: usize) -> HistoryResult<&VersionHistory> {
        self.histories
            .get(index)
            .ok_or(HistoryError::VersionHistoryIndexOutOfBounds {
                index,
                len: self.histories.len(),
            })
    }

    pub fn current_version_history_index(&self) -> usize {
        self.current_version_history_index
    }

    pub fn set_current_version_history_index(&mut self, index: usize) -> HistoryResult<()> {
        if index >= self.histories.len() {
            return Err(HistoryError::VersionHistoryIndexOutOfBounds {
                index,
                len: self.histories.len(),
            });
        }
        self.current_version_history_index = index;
        Ok(())
    }

    pub fn current_version_history(&self) -> HistoryResult<&VersionHistory> {
        self.get_version_history(self.current_version_history_index)
    }

    pub fn current_version_history_mut(&mut self) -> HistoryResult<&mut VersionHistory> {
        let len = self.histories.len();
        let index = self.current_version_history_index;
        self.histories
            .get_mut(index)
            .ok_or(HistoryError::VersionHistoryIndexOutOfBounds { index, len })
    }

    /// Add a branch. Returns whether it became current, and its index.
    ///
    /// The new branch becomes current when its last version is higher than
    /// the current branch's last version.
    pub fn add_version_history(&mut self, history: VersionHistory) -> HistoryResult<(bool, usize)> {
        let current = self.current_version_history()?;
        let incoming_first = history.first_item()?;
        let current_first = current.first_item()?;
        if incoming_first.version != current_first.version {
            return Err(HistoryError::BadRequest(
                "version history first item does not match".to_string(),
            ));
        }
        let current_last = current.last_item()?;
        let incoming_last = history.last_item()?;

        self.histories.push(history);
        let index = self.histories.len() - 1;

        let changed = incoming_last.version > current_last.version;
        if changed {
            self.current_version_history_index = index;
        }
        Ok((changed, index))
    }

    /// The local branch sharing the deepest LCA with `incoming`.
    ///
    /// Ties on the LCA event id go to the shorter local branch.
    pub fn find_lca_version_history_index_and_item(
        &self,
        incoming: &VersionHistory,
    ) -> HistoryResult<(usize, VersionHistoryItem)> {
        let mut best: Option<(usize, usize, VersionHistoryItem)> = None;
        for (index, local) in self.histories.iter().enumerate() {
            let item = local.find_lca_item(incoming)?;
            let replace = match best {
                None => true,
                Some((_, best_len, best_item)) => {
                    item.event_id > best_item.event_id
                        || (item.event_id == best_item.event_id && local.items.len() < best_len)
                }
            };
            if replace {
                best = Some((index, local.items.len(), item));
            }
        }
        best.map(|(index, _, item)| (index, item))
            .ok_or_else(|| HistoryError::BadRequest("version histories are empty".to_string()))
    }

    /// First branch, in stored order, containing `item`.
    pub fn find_first_version_history_by_item(
        &self,
        item: &VersionHistoryItem,
    ) -> HistoryResult<(usize, &VersionHistory)> {
        self.histories
            .iter()
            .enumerate()
            .find(|(_, history)| history.contains_item(item))
            .ok_or(HistoryError::VersionHistoryItemNotFound {
                event_id: item.event_id,
                version: item.version,
            })
    }
}
