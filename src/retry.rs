//! Bounded retry around a single HTTP call.
//!
//! Transport failures (including timeouts) are retried with fixed or exponential
//! backoff up to `max_attempts`. HTTP 429 escalates the provider's [`Throttle`] and is
//! retried against its own, larger budget. Any other non-success status is returned
//! immediately. Every wait races the cancellation token, and no request is sent once
//! the token is cancelled.
use crate::error::IngestError;
use crate::http::{HttpResponse, Throttle, TransportError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Exponential,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub rate_limit_step_ms: u64,
    pub max_rate_limit_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::Exponential,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            rate_limit_step_ms: 10,
            max_rate_limit_retries: 50,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryError {
    #[error("HTTP status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        last_error: TransportError,
    },

    #[error("still rate limited after {retries} retries")]
    RateLimited { retries: u32 },

    #[error("cancelled before the request was sent")]
    Cancelled,
}

impl From<RetryError> for IngestError {
    fn from(e: RetryError) -> Self {
        match e {
            RetryError::Status { status, message } => {
                IngestError::skipped(format!("HTTP {status}"), message)
            }
            RetryError::Exhausted {
                attempts,
                last_error,
            } => IngestError::TransientNetwork {
                attempts,
                reason: last_error.to_string(),
            },
            RetryError::RateLimited { retries } => IngestError::RateLimited { retries },
            RetryError::Cancelled => IngestError::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_ms;
        let millis = match self.config.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
        };
        Duration::from_millis(millis.min(self.config.max_delay_ms))
    }

    pub async fn execute<F, Fut>(
        &self,
        throttle: &Throttle,
        cancel: &CancellationToken,
        mut request_fn: F,
    ) -> Result<HttpResponse, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<HttpResponse, TransportError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;
        let mut rate_limited = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = throttle.wait() => {}
            }
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            match request_fn().await {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) if response.is_rate_limited() => {
                    rate_limited += 1;
                    if rate_limited > self.config.max_rate_limit_retries {
                        return Err(RetryError::RateLimited {
                            retries: rate_limited - 1,
                        });
                    }
                    let step = Duration::from_millis(self.config.rate_limit_step_ms);
                    let delay = throttle.escalate(step).await;
                    warn!(
                        "rate limited ({rate_limited}/{}), throttle now {} ms",
                        self.config.max_rate_limit_retries,
                        delay.as_millis()
                    );
                    pause(cancel, delay).await?;
                }
                Ok(response) => {
                    return Err(RetryError::Status {
                        status: response.status,
                        message: response.snippet(),
                    })
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= max_attempts {
                        return Err(RetryError::Exhausted {
                            attempts,
                            last_error: e,
                        });
                    }
                    let delay = self.delay_for(attempts);
                    debug!("attempt {attempts}/{max_attempts} failed ({e}), retry in {delay:?}");
                    pause(cancel, delay).await?;
                }
            }
        }
    }
}

async fn pause(cancel: &CancellationToken, delay: Duration) -> Result<(), RetryError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RetryError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::stub::{ok_json, status};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            backoff: Backoff::Fixed,
            base_delay_ms: 1,
            max_delay_ms: 5,
            rate_limit_step_ms: 1,
            max_rate_limit_retries: 3,
        })
    }

    #[tokio::test]
    async fn test_fails_twice_then_succeeds() {
        let policy = fast_policy(5);
        let throttle = Throttle::new(Duration::ZERO);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = policy
            .execute(&throttle, &CancellationToken::new(), move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= 2 {
                    Err(TransportError::Timeout)
                } else {
                    ok_json(serde_json::json!({"ok": true}))
                }
            })
            .await;

        assert!(result.unwrap().is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_always_failing_exhausts_budget() {
        let policy = fast_policy(5);
        let throttle = Throttle::new(Duration::ZERO);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = policy
            .execute(&throttle, &CancellationToken::new(), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Network("connection refused".into()))
            })
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 5, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_other_status_is_not_retried() {
        let policy = fast_policy(5);
        let throttle = Throttle::new(Duration::ZERO);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = policy
            .execute(&throttle, &CancellationToken::new(), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                status(500)
            })
            .await;

        assert!(matches!(result, Err(RetryError::Status { status: 500, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_escalates_throttle_and_recovers() {
        let policy = fast_policy(1);
        let throttle = Throttle::new(Duration::ZERO);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = policy
            .execute(&throttle, &CancellationToken::new(), move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= 2 {
                    status(429)
                } else {
                    ok_json(serde_json::json!([]))
                }
            })
            .await;

        // two 429s do not consume the single transport attempt
        assert!(result.is_ok());
        assert_eq!(throttle.interval().await, Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_rate_limit_budget_is_bounded() {
        let policy = fast_policy(5);
        let throttle = Throttle::new(Duration::ZERO);

        let result = policy
            .execute(&throttle, &CancellationToken::new(), || async { status(429) })
            .await;
        assert_eq!(result, Err(RetryError::RateLimited { retries: 3 }));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::new(RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            ..RetryConfig::default()
        });
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(200), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            backoff: Backoff::Fixed,
            base_delay_ms: 60_000,
            ..RetryConfig::default()
        });
        let throttle = Throttle::new(Duration::ZERO);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            policy.execute(&throttle, &cancel, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Timeout)
            }),
        )
        .await
        .unwrap();

        assert_eq!(result, Err(RetryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_sends_nothing() {
        let policy = fast_policy(5);
        let throttle = Throttle::new(Duration::ZERO);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = policy
            .execute(&throttle, &cancel, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                status(200)
            })
            .await;
        assert_eq!(result, Err(RetryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
