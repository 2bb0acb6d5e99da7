//! Tracing subscriber setup.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use history_types::{HistoryError, HistoryResult};

use crate::config::TelemetryConfig;

/// Install the global subscriber. `RUST_LOG` overrides `config.log_level`.
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(config: &TelemetryConfig) -> HistoryResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let subscriber = tracing_subscriber::registry().with(env_filter);

    let result = if config.json_format {
        subscriber
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        subscriber.with(fmt::layer().with_target(true)).try_init()
    };
    result.map_err(|e| HistoryError::Internal(format!("failed to install tracing subscriber: {}", e)))
}
