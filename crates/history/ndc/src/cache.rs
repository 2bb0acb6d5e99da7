//! Execution cache: one context and one exclusive lock per run.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use history_types::{HistoryError, HistoryResult, RequestContext, WorkflowIdentifier};

use crate::config::{NdcConfig, DEFAULT_EXECUTION_CACHE_CAPACITY};
use crate::execution::{ExecutionContext, WorkflowContext};

/// Releases a loaded run. Called exactly once with the in-flight error, if any.
pub type ReleaseFn = Box<dyn FnOnce(Option<&HistoryError>) + Send>;

struct CacheEntry {
    context: Arc<WorkflowContext>,
    lock: Arc<Mutex<()>>,
}

impl CacheEntry {
    /// Neither held nor awaited by anyone outside the map.
    fn is_idle(self: &Arc<Self>) -> bool {
        Arc::strong_count(self) == 1 && self.lock.try_lock().is_ok()
    }
}

/// Cache of execution contexts keyed by run.
///
/// Holds at most `capacity` runs once the excess is idle; held runs and
/// runs with waiters stay cached.
pub struct ExecutionCache {
    entries: DashMap<WorkflowIdentifier, Arc<CacheEntry>>,
    capacity: usize,
}

impl ExecutionCache {
    /// Create a cache with [`DEFAULT_EXECUTION_CACHE_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EXECUTION_CACHE_CAPACITY)
    }

    /// Create a cache evicting idle runs beyond `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Create a cache sized by `execution_cache_capacity`.
    pub fn from_config(config: &NdcConfig) -> Self {
        Self::with_capacity(config.execution_cache_capacity)
    }

    /// Number of cached runs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Acquire exclusive access to the run's context.
    ///
    /// Waits for the current holder to release. A release with an error
    /// clears the cached mutable state so the next holder reloads it.
    pub async fn get_or_create_workflow_execution(
        &self,
        ctx: &RequestContext,
        identifier: &WorkflowIdentifier,
    ) -> HistoryResult<(Arc<dyn ExecutionContext>, ReleaseFn)> {
        let entry = {
            let slot = self.entries.entry(identifier.clone()).or_insert_with(|| {
                Arc::new(CacheEntry {
                    context: Arc::new(WorkflowContext::new(identifier.clone())),
                    lock: Arc::new(Mutex::new(())),
                })
            });
            Arc::clone(slot.value())
        };
        self.evict_idle();

        let lock = Arc::clone(&entry.lock);
        let guard = ctx
            .run("acquire workflow lock", async move { Ok(lock.lock_owned().await) })
            .await?;

        let context: Arc<dyn ExecutionContext> = entry.context.clone();
        let held = Arc::clone(&context);
        let release: ReleaseFn = Box::new(move |err| {
            if let Some(err) = err {
                debug!(workflow = %held.identifier(), error = %err, "Clearing execution context after failure");
                held.clear();
            }
            drop(guard);
        });
        Ok((context, release))
    }

    /// Drop idle runs until the cache is back within capacity.
    fn evict_idle(&self) {
        let excess = self.entries.len().saturating_sub(self.capacity);
        if excess == 0 {
            return;
        }
        let idle: Vec<WorkflowIdentifier> = self
            .entries
            .iter()
            .filter(|slot| slot.value().is_idle())
            .map(|slot| slot.key().clone())
            .take(excess)
            .collect();
        for identifier in &idle {
            self.entries.remove_if(identifier, |_, entry| entry.is_idle());
        }
        debug!(evicted = idle.len(), cached = self.entries.len(), "Evicted idle executions");
    }
}

impl Default for ExecutionCache {
    fn default() -> Self {
        Self::new()
    }
}
