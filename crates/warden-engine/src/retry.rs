//! Bounded retry with exponential backoff and jitter.
//!
//! Only [`Error::is_transient`] failures are retried. When the attempt
//! budget is exhausted the last transient cause is surfaced as
//! `ExternalFatal` with the attempt count attached. Non-transient errors
//! pass through untouched on the first occurrence.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Retry policy for transient external failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Upper bound on any single delay (before jitter).
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Total attempts, including the first (must be at least 1).
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Computes the delay before retry number `attempt` (1-indexed).
///
/// Doubles from `base_delay`, capped at `max_delay`, plus jitter.
#[must_use]
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let scaled = config.base_delay.saturating_mul(1 << exp);
    scaled.min(config.max_delay) + Duration::from_millis(rand_jitter())
}

/// Generates random jitter for backoff (0-50ms).
fn rand_jitter() -> u64 {
    // Simple linear congruential generator for jitter
    // (avoids full rand dependency for this simple case)
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % 50
}

/// Runs `call`, retrying transient failures up to the configured budget.
///
/// # Errors
///
/// Returns the first non-transient error unchanged, or `ExternalFatal`
/// when the attempt budget is exhausted by transient failures.
pub async fn retry_transient<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                crate::metrics::EngineMetrics::new().record_retry(operation);
                let delay = backoff_delay(config, attempt);
                tracing::debug!(
                    operation,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(operation, attempts = attempt, error = %err, "retry budget exhausted");
                return Err(Error::ExternalFatal {
                    message: format!("{operation}: {err}"),
                    attempts: attempt,
                });
            }
            Err(err) => return Err(err),
        }
    }
}
