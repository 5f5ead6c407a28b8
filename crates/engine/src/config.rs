use std::time::Duration;

use jarindex_core::Settings;

use crate::retry::RetryPolicy;

/// Tuning shared by every stream worker.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sleep between polls once a stream has caught up.
    pub poll_interval: Duration,
    /// Backoff for transient store and log-source failures.
    pub retry: RetryPolicy,
    /// Re-read/re-project attempts when a commit loses an optimistic race.
    pub max_conflict_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            retry: RetryPolicy::default(),
            max_conflict_retries: 8,
        }
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            ..Self::default()
        }
    }
}
