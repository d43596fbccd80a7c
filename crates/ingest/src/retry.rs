//! Linear retry policy for remote appends.

use std::future::Future;
use std::time::Duration;
use tusblob_core::RetryConfig;
use tusblob_storage::{StorageError, StorageResult};

/// Fixed-delay retry with a bounded number of attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between attempts.
    pub delay: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

/// Failure of a retried operation.
#[derive(Debug)]
pub struct RetryFailure {
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Whether the attempt budget ran out on transient errors.
    pub exhausted: bool,
    /// The last error observed.
    pub error: StorageError,
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Run `op` until it succeeds, fails non-transiently, or the budget is spent.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.max_attempts => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = self.delay.as_millis() as u64,
                        error = %error,
                        "Transient remote failure, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                }
                Err(error) => {
                    return Err(RetryFailure {
                        attempts: attempt,
                        exhausted: error.is_transient(),
                        error,
                    });
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.delay(), config.max_attempts)
    }
}
