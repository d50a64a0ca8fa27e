//! Automatic retry with exponential backoff and jitter.
//!
//! Rate-limited and transient model failures are retried with
//! `base_delay * multiplier^attempt` plus a random jitter. Fatal failures are
//! returned on first occurrence. The policy is an explicit value owned by each
//! call site, never global state.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use super::client::{AsyncModelClient, ErrorClass, ModelClient, ModelError};
use super::types::{Completion, ModelRequest};

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = a single attempt).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Backoff multiplier (typically 2.0).
    pub multiplier: f64,
    /// Upper bound for the exponential part of the delay.
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub jitter: Duration,
    /// Maps an error to retryable or fatal.
    pub classifier: fn(&ModelError) -> ErrorClass,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: Duration::from_millis(250),
            classifier: ModelError::classify,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given retry count and default timing
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Policy that retries immediately (tests, local stubs)
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Exponential part of the delay for a 0-indexed attempt, without jitter.
    ///
    /// Capped at `max_delay`; a negative product (negative multiplier) means no wait.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(Duration::ZERO)
    }

    /// Full wait before retrying `attempt`, honouring a server-suggested retry-after.
    pub fn backoff(&self, attempt: u32, error: &ModelError) -> Duration {
        let mut delay = self.delay_for_attempt(attempt);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms > 0 {
            delay += Duration::from_millis(rand::rng().random_range(0..=jitter_ms));
        }
        match error.retry_after() {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }

    /// Decide what to do with a failed attempt. `None` means give up and return the error.
    fn next_delay(&self, attempt: u32, error: &ModelError) -> Option<Duration> {
        if (self.classifier)(error) == ErrorClass::Fatal {
            log::debug!("Fatal model error, not retrying: {}", error);
            return None;
        }
        if attempt >= self.max_retries {
            tracing::warn!(
                attempts = attempt + 1,
                error = %error,
                "Retries exhausted"
            );
            return None;
        }
        let delay = self.backoff(attempt, error);
        tracing::warn!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            rate_limited = error.is_rate_limit(),
            error = %error,
            "Retryable model error, backing off"
        );
        Some(delay)
    }
}

/// Run a blocking operation under `policy`, sleeping the current thread between attempts.
pub fn retry_blocking<T, F>(policy: &RetryPolicy, mut op: F) -> Result<T, ModelError>
where
    F: FnMut() -> Result<T, ModelError>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(error) => match policy.next_delay(attempt, &error) {
                Some(delay) => {
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                None => return Err(error),
            },
        }
    }
}

/// Run an async operation under `policy`, yielding to the scheduler between attempts.
pub async fn retry_async<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, ModelError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ModelError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => match policy.next_delay(attempt, &error) {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(error),
            },
        }
    }
}

/// Wraps a raw model client with uniform retry semantics.
///
/// Only the attempt that returns a completion contributes usage; failed attempts
/// never reach the caller's counters.
#[derive(Debug)]
pub struct ResilientClient<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C> ResilientClient<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: ModelClient> ModelClient for ResilientClient<C> {
    fn call(&self, request: &ModelRequest) -> Result<Completion, ModelError> {
        retry_blocking(&self.policy, || self.inner.call(request))
    }
}

#[async_trait]
impl<C: AsyncModelClient> AsyncModelClient for ResilientClient<C> {
    async fn call(&self, request: &ModelRequest) -> Result<Completion, ModelError> {
        retry_async(&self.policy, || self.inner.call(request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedClient;

    fn transient() -> ModelError {
        ModelError::Transient("HTTP 503".to_string())
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.multiplier, 2.0);
    }

    #[test]
    fn test_delay_increases_exponentially() {
        let policy = RetryPolicy::with_retries(5);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(5),
            ..RetryPolicy::with_retries(10)
        };
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_negative_multiplier_never_panics() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(10),
            multiplier: -2.0,
            ..RetryPolicy::immediate(3)
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.backoff(1, &transient()), Duration::ZERO);
        let even = policy.delay_for_attempt(2);
        assert!(even > Duration::from_millis(39) && even < Duration::from_millis(41));
    }

    #[test]
    fn test_non_finite_multiplier_is_capped() {
        let policy = RetryPolicy {
            multiplier: f64::INFINITY,
            max_delay: Duration::from_secs(5),
            ..RetryPolicy::with_retries(3)
        };
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(5));

        let policy = RetryPolicy {
            multiplier: f64::NAN,
            max_delay: Duration::from_secs(5),
            ..RetryPolicy::with_retries(3)
        };
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            jitter: Duration::from_millis(50),
            ..RetryPolicy::default()
        };
        for _ in 0..20 {
            let delay = policy.backoff(0, &transient());
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_backoff_honours_retry_after() {
        let policy = RetryPolicy::immediate(3);
        let err = ModelError::RateLimited {
            message: "429".to_string(),
            retry_after: Some(Duration::from_millis(20)),
        };
        assert_eq!(policy.backoff(0, &err), Duration::from_millis(20));
    }

    #[test]
    fn test_succeeds_after_k_failures() {
        let stub = ScriptedClient::new();
        stub.push_err(transient());
        stub.push_err(ModelError::rate_limited("429"));
        stub.push_ok(Completion::new("done", 7, 3));

        let client = ResilientClient::new(stub, RetryPolicy::immediate(3));
        let completion = ModelClient::call(&client, &ModelRequest::new("")).unwrap();

        assert_eq!(completion.text, "done");
        assert_eq!(completion.usage, crate::llm::TokenUsage::new(7, 3));
        assert_eq!(client.inner().calls(), 3);
    }

    #[test]
    fn test_fails_after_max_retries_plus_one() {
        let stub = ScriptedClient::new();
        for _ in 0..10 {
            stub.push_err(transient());
        }

        let client = ResilientClient::new(stub, RetryPolicy::immediate(4));
        let result = ModelClient::call(&client, &ModelRequest::new(""));

        assert_eq!(result, Err(transient()));
        assert_eq!(client.inner().calls(), 5);
    }

    #[test]
    fn test_fatal_not_retried() {
        let stub = ScriptedClient::new();
        stub.push_err(ModelError::Fatal("invalid x-api-key".to_string()));
        stub.push_ok(Completion::new("never", 1, 1));

        let client = ResilientClient::new(stub, RetryPolicy::immediate(3));
        let result = ModelClient::call(&client, &ModelRequest::new(""));

        assert!(matches!(result, Err(ModelError::Fatal(_))));
        assert_eq!(client.inner().calls(), 1);
    }

    #[test]
    fn test_zero_retries_single_attempt() {
        let stub = ScriptedClient::new();
        stub.push_err(transient());
        let client = ResilientClient::new(stub, RetryPolicy::immediate(0));
        assert!(ModelClient::call(&client, &ModelRequest::new("")).is_err());
        assert_eq!(client.inner().calls(), 1);
    }

    #[test]
    fn test_custom_classifier() {
        fn everything_fatal(_: &ModelError) -> ErrorClass {
            ErrorClass::Fatal
        }
        let stub = ScriptedClient::new();
        stub.push_err(transient());
        let policy = RetryPolicy {
            classifier: everything_fatal,
            ..RetryPolicy::immediate(5)
        };
        let client = ResilientClient::new(stub, policy);
        assert!(ModelClient::call(&client, &ModelRequest::new("")).is_err());
        assert_eq!(client.inner().calls(), 1);
    }

    #[tokio::test]
    async fn test_async_succeeds_after_k_failures() {
        let stub = ScriptedClient::new();
        stub.push_err(transient());
        stub.push_ok(Completion::new("async done", 2, 2));

        let client = ResilientClient::new(stub, RetryPolicy::immediate(2));
        let completion = AsyncModelClient::call(&client, &ModelRequest::new("")).await.unwrap();

        assert_eq!(completion.text, "async done");
        assert_eq!(client.inner().calls(), 2);
    }

    #[tokio::test]
    async fn test_async_exhaustion() {
        let stub = ScriptedClient::new();
        for _ in 0..3 {
            stub.push_err(ModelError::rate_limited("429"));
        }
        let client = ResilientClient::new(stub, RetryPolicy::immediate(2));
        let result = AsyncModelClient::call(&client, &ModelRequest::new("")).await;
        assert!(matches!(result, Err(ModelError::RateLimited { .. })));
        assert_eq!(client.inner().calls(), 3);
    }
}
