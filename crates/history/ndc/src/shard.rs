//! Shard context: the collaborators owned by one history shard.

use std::sync::Arc;

use history_persistence::{DomainDirectory, ExecutionStore, HistoryStore};

use crate::config::NdcConfig;

/// Access to the shard's stores and configuration.
pub trait ShardContext: Send + Sync {
    fn shard_id(&self) -> i32;

    fn history_store(&self) -> Arc<dyn HistoryStore>;

    fn execution_store(&self) -> Arc<dyn ExecutionStore>;

    fn domain_directory(&self) -> Arc<dyn DomainDirectory>;

    fn config(&self) -> &NdcConfig;
}

/// Shard context over explicitly supplied collaborators.
pub struct ShardContextImpl {
    shard_id: i32,
    history_store: Arc<dyn HistoryStore>,
    execution_store: Arc<dyn ExecutionStore>,
    domain_directory: Arc<dyn DomainDirectory>,
    config: NdcConfig,
}

impl ShardContextImpl {
    /// Create a shard context over the given stores.
    pub fn new(
        shard_id: i32,
        history_store: Arc<dyn HistoryStore>,
        execution_store: Arc<dyn ExecutionStore>,
        domain_directory: Arc<dyn DomainDirectory>,
        config: NdcConfig,
    ) -> Self {
        Self {
            shard_id,
            history_store,
            execution_store,
            domain_directory,
            config,
        }
    }
}

impl ShardContext for ShardContextImpl {
    fn shard_id(&self) -> i32 {
        self.shard_id
    }

    fn history_store(&self) -> Arc<dyn HistoryStore> {
        Arc::clone(&self.history_store)
    }

    fn execution_store(&self) -> Arc<dyn ExecutionStore> {
        Arc::clone(&self.execution_store)
    }

    fn domain_directory(&self) -> Arc<dyn DomainDirectory> {
        Arc::clone(&self.domain_directory)
    }

    fn config(&self) -> &NdcConfig {
        &self.config
    }
}
