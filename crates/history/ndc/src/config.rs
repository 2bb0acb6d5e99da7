//! Configuration for the reset and rebuild path.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use history_types::{HistoryError, HistoryResult, RequestContext};

/// Batches read per page while rebuilding state.
pub const DEFAULT_REBUILD_PAGE_SIZE: usize = 100;

/// Runs kept in the execution cache before idle ones are evicted.
pub const DEFAULT_EXECUTION_CACHE_CAPACITY: usize = 1024;

/// Complete reset-path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NdcConfig {
    /// Batches requested per history page during a rebuild.
    pub rebuild_page_size: usize,

    /// Validate version histories of every execution loaded from storage.
    pub validate_version_histories: bool,

    /// Timeout applied by [`NdcConfig::request_context`]; `None` means no deadline.
    pub default_operation_timeout_ms: Option<u64>,

    /// Soft bound on cached runs; runs still held or awaited are never evicted.
    pub execution_cache_capacity: usize,

    pub telemetry: TelemetryConfig,
}

impl Default for NdcConfig {
    fn default() -> Self {
        Self {
            rebuild_page_size: DEFAULT_REBUILD_PAGE_SIZE,
            validate_version_histories: true,
            default_operation_timeout_ms: Some(30_000),
            execution_cache_capacity: DEFAULT_EXECUTION_CACHE_CAPACITY,
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl NdcConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> HistoryResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the reset path cannot run with.
    pub fn validate(&self) -> HistoryResult<()> {
        if self.rebuild_page_size == 0 {
            return Err(HistoryError::BadRequest(
                "rebuild_page_size must be positive".to_string(),
            ));
        }
        if self.execution_cache_capacity == 0 {
            return Err(HistoryError::BadRequest(
                "execution_cache_capacity must be positive".to_string(),
            ));
        }
        if self.default_operation_timeout_ms == Some(0) {
            return Err(HistoryError::BadRequest(
                "default_operation_timeout_ms must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    /// A fresh request context carrying the default operation timeout.
    pub fn request_context(&self) -> RequestContext {
        match self.default_operation_timeout_ms {
            Some(ms) => RequestContext::with_timeout(Duration::from_millis(ms)),
            None => RequestContext::background(),
        }
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub log_level: String,
    pub json_format: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_format: false,
        }
    }
}
