//! Core model client trait definitions and error classification

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::types::{Completion, ModelRequest};

/// Blocking model client - the call occupies the calling thread until complete
pub trait ModelClient: Send + Sync {
    fn call(&self, request: &ModelRequest) -> Result<Completion, ModelError>;
}

/// Suspending model client - the call yields to the scheduler while waiting
#[async_trait]
pub trait AsyncModelClient: Send + Sync {
    async fn call(&self, request: &ModelRequest) -> Result<Completion, ModelError>;
}

impl<T: ModelClient + ?Sized> ModelClient for Arc<T> {
    fn call(&self, request: &ModelRequest) -> Result<Completion, ModelError> {
        (**self).call(request)
    }
}

#[async_trait]
impl<T: AsyncModelClient + ?Sized> AsyncModelClient for Arc<T> {
    async fn call(&self, request: &ModelRequest) -> Result<Completion, ModelError> {
        (**self).call(request).await
    }
}

/// Blocking view of a suspending client.
///
/// Each call runs on a small runtime owned by the adapter while the calling
/// thread waits, so `AnthropicClient` can drive `QueryLoop::run_blocking`.
/// The adapter must be dropped outside any async context.
pub struct BlockingAdapter<C> {
    inner: Arc<C>,
    runtime: tokio::runtime::Runtime,
}

impl<C> BlockingAdapter<C> {
    pub fn new(inner: C) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("rlm-model")
            .enable_all()
            .build()?;
        Ok(Self {
            inner: Arc::new(inner),
            runtime,
        })
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: AsyncModelClient + 'static> ModelClient for BlockingAdapter<C> {
    fn call(&self, request: &ModelRequest) -> Result<Completion, ModelError> {
        let inner = Arc::clone(&self.inner);
        let request = request.clone();
        let task = self
            .runtime
            .spawn(async move { AsyncModelClient::call(inner.as_ref(), &request).await });
        futures::executor::block_on(task)
            .unwrap_or_else(|e| Err(ModelError::Fatal(format!("Model call task failed: {}", e))))
    }
}

impl<C> std::fmt::Debug for BlockingAdapter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingAdapter").finish_non_exhaustive()
    }
}

/// Errors that can occur during a model call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Retry classification of a model error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

impl ModelError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        ModelError::RateLimited {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ModelError::RateLimited { .. })
    }

    /// Default classification: rate limits and transient failures retry, everything else is fatal
    pub fn classify(&self) -> ErrorClass {
        match self {
            ModelError::RateLimited { .. } | ModelError::Transient(_) => ErrorClass::Retryable,
            ModelError::Fatal(_) => ErrorClass::Fatal,
        }
    }

    /// Server-suggested wait before the next attempt, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ModelError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Scripted client that replays a fixed sequence of outcomes.
///
/// Implements both the blocking and the suspending trait so the same script can drive
/// either query-loop variant. Once the script runs dry every call fails fatally.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Result<Completion, ModelError>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a client that answers with each text in order, charging `(10, 5)` tokens per call
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::new();
        for text in responses {
            client.push_ok(Completion::new(text, 10, 5));
        }
        client
    }

    pub fn push_ok(&self, completion: Completion) {
        self.lock_script().push_back(Ok(completion));
    }

    pub fn push_err(&self, error: ModelError) {
        self.lock_script().push_back(Err(error));
    }

    /// Number of calls made so far
    pub fn calls(&self) -> usize {
        self.lock_requests().len()
    }

    /// Every request received, in order
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.lock_requests().clone()
    }

    fn next(&self, request: &ModelRequest) -> Result<Completion, ModelError> {
        self.lock_requests().push(request.clone());
        self.lock_script()
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Fatal("script exhausted".to_string())))
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<Completion, ModelError>>> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_requests(&self) -> std::sync::MutexGuard<'_, Vec<ModelRequest>> {
        self.requests.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ModelClient for ScriptedClient {
    fn call(&self, request: &ModelRequest) -> Result<Completion, ModelError> {
        self.next(request)
    }
}

#[async_trait]
impl AsyncModelClient for ScriptedClient {
    async fn call(&self, request: &ModelRequest) -> Result<Completion, ModelError> {
        self.next(request)
    }
}
