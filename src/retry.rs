use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff policy for optimistic-concurrency conflicts on update.
///
/// The defaults mirror the conventional Kubernetes client policy: five
/// attempts, 10ms apart, no growth.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt
    pub backoff_factor: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 10,
            max_delay_ms: 10,
            backoff_factor: 1.0,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0) as f64;
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_delay_ms as f64 * factor.powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms.max(self.initial_delay_ms) as f64) as u64)
    }
}

/// Runs `operation` until it succeeds, fails with an error `is_conflict`
/// rejects, or `max_attempts` is used up. The last error is returned as is.
pub async fn retry_on_conflict<T, E, F, Fut>(
    config: &RetryConfig,
    is_conflict: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Err(e) if is_conflict(&e) && attempt < max_attempts => {
                let delay = config.delay_after(attempt);
                warn!(
                    "Conflict on attempt {}/{}, retrying in {:?}",
                    attempt, max_attempts, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
