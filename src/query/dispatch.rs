//! Sub-query dispatch: answers IPC requests from the sandbox with model calls.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::ipc::{IpcRequest, SubQueryHandler};
use crate::llm::{AsyncModelClient, Completion, ModelClient, ModelError, ModelRequest, TokenUsage};
use crate::query::machine::SubQueryUsage;
use crate::query::parser::clip_chars;
use crate::query::prompts;

/// How a dispatcher reaches the sub-model.
pub trait SubModel: Send + Sync + 'static {
    fn complete(&self, request: ModelRequest) -> impl Future<Output = Result<Completion, ModelError>> + Send;
}

/// Sub-model backed by an [`AsyncModelClient`].
pub struct Suspending<C>(pub Arc<C>);

impl<C: AsyncModelClient + 'static> SubModel for Suspending<C> {
    fn complete(&self, request: ModelRequest) -> impl Future<Output = Result<Completion, ModelError>> + Send {
        async move { AsyncModelClient::call(self.0.as_ref(), &request).await }
    }
}

/// Sub-model backed by a blocking [`ModelClient`], run on the blocking pool.
pub struct Blocking<C>(pub Arc<C>);

impl<C: ModelClient + 'static> SubModel for Blocking<C> {
    fn complete(&self, request: ModelRequest) -> impl Future<Output = Result<Completion, ModelError>> + Send {
        let client = Arc::clone(&self.0);
        async move {
            tokio::task::spawn_blocking(move || ModelClient::call(client.as_ref(), &request))
                .await
                .unwrap_or_else(|e| Err(ModelError::Fatal(format!("Sub-query task failed: {}", e))))
        }
    }
}

/// Per-query sub-query budget, shared by every invocation of that query.
#[derive(Debug)]
pub struct SubCallBudget {
    used: AtomicUsize,
    limit: usize,
}

impl SubCallBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit,
        }
    }

    /// Reserve one call. `false` once the limit is reached.
    pub fn try_acquire(&self) -> bool {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| (used < self.limit).then_some(used + 1))
            .is_ok()
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Settings shared by all sub-queries of a query
#[derive(Debug, Clone)]
pub struct SubQuerySettings {
    pub model: String,
    pub max_tokens: u32,
    /// Characters of context a sub-query may see
    pub context_limit: usize,
}

/// Handler for one sandbox invocation's IPC server.
pub struct SubQueryDispatcher<M> {
    model: M,
    context: Arc<str>,
    settings: Arc<SubQuerySettings>,
    budget: Arc<SubCallBudget>,
    calls: AtomicUsize,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl<M: SubModel> SubQueryDispatcher<M> {
    pub fn new(model: M, context: Arc<str>, settings: Arc<SubQuerySettings>, budget: Arc<SubCallBudget>) -> Self {
        Self {
            model,
            context,
            settings,
            budget,
            calls: AtomicUsize::new(0),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
        }
    }

    /// Calls answered and tokens spent so far by this dispatcher
    pub fn usage(&self) -> SubQueryUsage {
        SubQueryUsage {
            calls: self.calls.load(Ordering::SeqCst),
            usage: TokenUsage::new(
                self.input_tokens.load(Ordering::SeqCst),
                self.output_tokens.load(Ordering::SeqCst),
            ),
        }
    }

    fn build_request(&self, request: &IpcRequest) -> ModelRequest {
        let slice = request.context_slice.as_deref().unwrap_or(&self.context);
        let slice = clip_chars(slice, self.settings.context_limit);
        ModelRequest::new(prompts::sub_system_prompt(&request.prompt, slice))
            .with_user_message(prompts::SUB_QUERY_INSTRUCTION)
            .with_model(self.settings.model.clone())
            .with_max_tokens(self.settings.max_tokens)
    }
}

impl<M: SubModel> SubQueryHandler for SubQueryDispatcher<M> {
    fn handle(&self, request: IpcRequest) -> impl Future<Output = Result<String, String>> + Send {
        async move {
            if !self.budget.try_acquire() {
                log::warn!("Sub-query budget of {} exhausted", self.budget.limit());
                return Err(format!(
                    "Maximum sub-calls ({}) exceeded. Use code to analyze remaining data.",
                    self.budget.limit()
                ));
            }

            let model_request = self.build_request(&request);
            match self.model.complete(model_request).await {
                Ok(completion) => {
                    self.calls.fetch_add(1, Ordering::SeqCst);
                    self.input_tokens
                        .fetch_add(completion.usage.input_tokens, Ordering::SeqCst);
                    self.output_tokens
                        .fetch_add(completion.usage.output_tokens, Ordering::SeqCst);
                    log::debug!(
                        "Sub-query #{}: {}",
                        self.budget.used(),
                        clip_chars(&request.prompt, 100)
                    );
                    Ok(completion.text)
                }
                Err(e) => {
                    log::warn!("Sub-query failed: {}", e);
                    Err(e.to_string())
                }
            }
        }
    }
}
