//! Retry policy for outbound chain calls
//!
//! Every call carries a timeout. Timeouts and transient chain errors are
//! retried with exponential backoff `min(base * 2^attempt, max)`; anything
//! else fails immediately.

use crate::config::RelayerConfig;
use crate::error::{RelayerError, RelayerResult};

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RelayerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        }
    }

    /// Delay before the retry following failure number `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn should_retry(&self, error: &RelayerError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_retries
    }

    /// One attempt bounded by the call timeout
    pub async fn call<T, Fut>(&self, operation: &str, fut: Fut) -> RelayerResult<T>
    where
        Fut: Future<Output = RelayerResult<T>>,
    {
        match timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RelayerError::Timeout {
                operation: operation.to_string(),
            }),
        }
    }

    /// Run `op` until it succeeds, fails permanently or retries run out
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> RelayerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayerResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match self.call(operation, op()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if !self.should_retry(&e, attempt) {
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        operation, attempt, self.max_retries, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChainId;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            call_timeout: Duration::from_millis(50),
        }
    }

    fn transient() -> RelayerError {
        RelayerError::TransientChain {
            chain: ChainId::Evm,
            message: "503".into(),
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .retry("submit", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(transient())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: RelayerResult<()> = fast()
            .retry("submit", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: RelayerResult<()> = fast()
            .retry("submit", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(RelayerError::PermanentChain {
                        chain: ChainId::Ton,
                        message: "reverted".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_count_as_transient() {
        let result: RelayerResult<()> = fast()
            .call("slow submit", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, RelayerError::Timeout { .. }));
        assert!(err.is_retryable());
    }
}
