//! Reset and rebuild of workflow executions across divergent history branches.
//!
//! When a replicated event conflicts with the locally recorded history, the
//! [`WorkflowResetter`] finds the branch holding the last agreed event, forks
//! a new branch right after it, and replays the shared prefix into a fresh
//! run through the [`StateRebuilder`].
//!
//! # Architecture
//!
//! ```text
//! WorkflowResetter
//!   ├─ TransactionManager ── ExecutionCache ── ExecutionStore
//!   ├─ StateRebuilder ────── StateBuilder
//!   └─ ShardContext ──────── HistoryStore, DomainDirectory, NdcConfig
//! ```

pub mod cache;
pub mod config;
pub mod execution;
pub mod shard;
pub mod state_builder;
pub mod state_rebuilder;
pub mod telemetry;
pub mod transaction_manager;
pub mod workflow_resetter;

pub use cache::{ExecutionCache, ReleaseFn};
pub use config::{
    NdcConfig, TelemetryConfig, DEFAULT_EXECUTION_CACHE_CAPACITY, DEFAULT_REBUILD_PAGE_SIZE,
};
pub use execution::{ExecutionContext, WorkflowContext};
pub use shard::{ShardContext, ShardContextImpl};
pub use state_builder::StateBuilder;
pub use state_rebuilder::{BranchTokenProvider, NdcStateRebuilder, StateRebuilder};
pub use telemetry::init_tracing;
pub use transaction_manager::{NdcTransactionManager, NdcWorkflow, TransactionManager};
pub use workflow_resetter::{NdcWorkflowResetter, WorkflowResetter, RESEND_ON_RESET_WORKFLOW_MESSAGE};
