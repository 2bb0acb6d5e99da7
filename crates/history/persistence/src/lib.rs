//! Persistence boundaries for workflow history.
//!
//! Three storage seams, each an async trait with an in-memory backend:
//!
//! - [`HistoryStore`]: event batches on forkable branches of a history tree
//! - [`DomainDirectory`]: domain id / name lookup
//! - [`ExecutionStore`]: mutable state snapshots per run

pub mod branch;
pub mod domain;
pub mod execution_store;
pub mod history_store;
pub mod memory;

pub use branch::{HistoryBranch, HistoryBranchRange, ReadSegment};
pub use domain::{DomainDirectory, InMemoryDomainCache};
pub use execution_store::{ExecutionStore, InMemoryExecutionStore};
pub use history_store::{
    build_history_garbage_cleanup_info, AppendHistoryNodesRequest, AppendHistoryNodesResponse,
    DeleteHistoryBranchRequest, ForkHistoryBranchRequest, ForkHistoryBranchResponse, HistoryStore,
    ReadHistoryBranchByBatchResponse, ReadHistoryBranchRequest, DEFAULT_READ_PAGE_SIZE,
};
pub use memory::InMemoryHistoryStore;
