//! Domain directory: maps domain ids to names and back.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use history_types::{DomainId, HistoryError, HistoryResult};

/// Domain metadata lookup.
#[async_trait]
pub trait DomainDirectory: Send + Sync {
    async fn get_domain_name(&self, domain_id: &DomainId) -> HistoryResult<String>;

    async fn get_domain_id(&self, name: &str) -> HistoryResult<DomainId>;
}

/// In-memory domain cache.
#[derive(Default)]
pub struct InMemoryDomainCache {
    by_id: Arc<DashMap<DomainId, String>>,
    by_name: Arc<DashMap<String, DomainId>>,
}

impl InMemoryDomainCache {
    /// Create an empty domain cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a domain, replacing any previous name for the id.
    pub fn register(&self, domain_id: DomainId, name: impl Into<String>) {
        let name = name.into();
        if let Some((_, old)) = self.by_id.remove(&domain_id) {
            self.by_name.remove(&old);
        }
        self.by_name.insert(name.clone(), domain_id.clone());
        self.by_id.insert(domain_id, name);
    }
}

#[async_trait]
impl DomainDirectory for InMemoryDomainCache {
    async fn get_domain_name(&self, domain_id: &DomainId) -> HistoryResult<String> {
        self.by_id
            .get(domain_id)
            .map(|name| name.clone())
            .ok_or_else(|| HistoryError::EntityNotExists(format!("domain {} not found", domain_id)))
    }

    async fn get_domain_id(&self, name: &str) -> HistoryResult<DomainId> {
        self.by_name
            .get(name)
            .map(|id| id.clone())
            .ok_or_else(|| HistoryError::EntityNotExists(format!("domain name {} not found", name)))
    }
}
