//! Bounded exponential backoff for transient store and log-source failures.

use std::collections::hash_map::RandomState;
use std::fmt::Display;
use std::future::Future;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

use jarindex_core::SourceError;
use jarindex_storage::StoreError;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` disables retrying.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// Spread each delay over `[0.75, 1.25]` of its nominal value.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            initial_backoff_ms: 250,
            backoff_multiplier: 2.0,
            max_backoff_ms: 15_000,
            jitter: true,
        }
    }
}

/// Delay before retry number `attempt` (1-indexed).
///
/// Starts at `initial_backoff_ms` and grows by `backoff_multiplier` per
/// retry until it reaches `max_backoff_ms`.
#[must_use]
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let cap = policy.max_backoff_ms;
    let mut delay = policy.initial_backoff_ms.min(cap);
    for _ in 1..attempt {
        let grown = ((delay as f64) * policy.backoff_multiplier).min(cap as f64) as u64;
        if grown <= delay {
            break;
        }
        delay = grown;
    }
    Duration::from_millis(if policy.jitter { spread(delay) } else { delay })
}

/// A value in `[3/4 * ms, 5/4 * ms]`, seeded per call from the std hasher keys.
fn spread(ms: u64) -> u64 {
    let seed = RandomState::new().build_hasher().finish();
    ms - ms / 4 + seed % (ms / 2 + 1)
}

/// Errors that may succeed when the same call is repeated.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        StoreError::is_transient(self)
    }
}

impl Transient for SourceError {
    fn is_transient(&self) -> bool {
        SourceError::is_transient(self)
    }
}

/// Call `op` until it succeeds, fails permanently or the policy is spent.
/// The last error is returned on exhaustion.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    E: Transient + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() || attempt >= policy.max_retries => return Err(err),
            Err(err) => {
                attempt += 1;
                let delay = compute_backoff(policy, attempt);
                tracing::warn!(
                    what,
                    attempt,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
