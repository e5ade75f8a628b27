//! Retry policy for node RPC calls.
//!
//! Only failures that say nothing about the chain are retried: transport
//! errors, rate limiting, 5xx/408 from the node's HTTP front and unreadable
//! bodies. A JSON-RPC error object is an answer from the node and is final.
//! Task-level failures are never retried in-process; the next invocation
//! resumes the failed task instead.

use crate::config::DeployConfig;
use crate::error::{DeployError, Result};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff parameters plus an attempt budget
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    /// Retries allowed after the first attempt
    pub max_retries: usize,
    /// First backoff interval
    pub initial_delay: Duration,
    /// Cap on a single backoff interval
    pub max_delay: Duration,
    /// Growth factor between intervals
    pub multiplier: f64,
}

/// How a failed node call should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Give up and surface the error
    Never,
    /// Try again after the next backoff interval
    Backoff,
    /// Try again after the delay the node asked for
    After(Duration),
}

impl Retry {
    /// Classify an error returned by a node call
    pub fn classify(error: &DeployError) -> Self {
        match error {
            DeployError::NetworkError(e) if e.is_builder() => Retry::Never,
            DeployError::NetworkError(_) => Retry::Backoff,
            DeployError::RateLimitExceeded(0) => Retry::Backoff,
            DeployError::RateLimitExceeded(secs) => Retry::After(Duration::from_secs(*secs)),
            DeployError::HttpStatus { status, .. } if *status >= 500 || *status == 408 => {
                Retry::Backoff
            }
            DeployError::InvalidResponse(_) => Retry::Backoff,
            _ => Retry::Never,
        }
    }
}

impl RetryStrategy {
    /// Strategy using the retry settings of `config`
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            multiplier: config.retry_multiplier,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        // the attempt budget bounds the loop, not elapsed time
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay)
            .with_multiplier(self.multiplier)
            .with_max_elapsed_time(None)
            .build()
    }

    fn verdict(&self, error: DeployError, attempt: usize) -> backoff::Error<DeployError> {
        let retry_after = match Retry::classify(&error) {
            Retry::Never => return backoff::Error::permanent(error),
            Retry::Backoff => None,
            Retry::After(delay) => Some(delay),
        };
        if attempt > self.max_retries {
            warn!(
                "Giving up after {} attempts, last error: {}",
                attempt, error
            );
            return backoff::Error::permanent(DeployError::MaxRetriesExceeded(self.max_retries));
        }
        backoff::Error::Transient {
            err: error,
            retry_after,
        }
    }

    /// Run `operation` until it succeeds, fails permanently or the attempt
    /// budget is spent (`MaxRetriesExceeded`)
    pub async fn retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        backoff::future::retry_notify(
            self.backoff(),
            || {
                attempts += 1;
                let attempt = attempts;
                let call = operation();
                async move { call.await.map_err(|error| self.verdict(error, attempt)) }
            },
            |error: DeployError, delay: Duration| {
                warn!("Node call failed: {}. Retrying in {:?}", error, delay);
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Layer;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_case::test_case;

    fn strategy(max_retries: usize) -> RetryStrategy {
        RetryStrategy {
            max_retries,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
        }
    }

    fn http(status: u16) -> DeployError {
        DeployError::HttpStatus {
            status,
            message: String::new(),
        }
    }

    #[test_case(http(503) => Retry::Backoff; "node unavailable")]
    #[test_case(http(408) => Retry::Backoff; "request timeout")]
    #[test_case(http(404) => Retry::Never; "wrong endpoint")]
    #[test_case(DeployError::RateLimitExceeded(0) => Retry::Backoff; "rate limited")]
    #[test_case(DeployError::RateLimitExceeded(2) => Retry::After(Duration::from_secs(2)); "retry after")]
    #[test_case(DeployError::InvalidResponse("truncated".into()) => Retry::Backoff; "truncated body")]
    #[test_case(DeployError::RpcError("execution reverted (code: -32000)".into()) => Retry::Never; "rpc error")]
    #[test_case(DeployError::TransactionReverted("0xabc".into()) => Retry::Never; "reverted")]
    #[test_case(DeployError::SequenceViolation { layer: Layer::Layer1, attempted: 1, expected: 0 } => Retry::Never; "sequencing")]
    fn test_classify(error: DeployError) -> Retry {
        Retry::classify(&error)
    }

    #[test]
    fn test_strategy_from_config() {
        let config = DeployConfig::default().with_max_retries(7);
        let strategy = RetryStrategy::from_config(&config);
        assert_eq!(strategy.max_retries, 7);
        assert_eq!(
            strategy.initial_delay,
            Duration::from_millis(config.retry_initial_delay_ms)
        );
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = AtomicUsize::new(0);
        let result = strategy(3)
            .retry(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(http(502))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_is_attempts_not_time() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = strategy(2)
            .retry(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DeployError::RateLimitExceeded(0))
            })
            .await;

        assert_matches!(result, Err(DeployError::MaxRetriesExceeded(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_node_answer_is_final() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = strategy(3)
            .retry(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DeployError::RpcError("nonce too low (code: -32000)".into()))
            })
            .await;

        assert_matches!(result, Err(DeployError::RpcError(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
