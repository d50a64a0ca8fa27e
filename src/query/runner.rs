//! Query runners - carry out the actions a [`QueryMachine`] emits.
//!
//! `QueryLoop::run` is the suspending variant: the root model call is its only
//! suspension point and each sandbox invocation runs on its own tokio task so
//! the IPC listener stays responsive. `QueryLoop::run_blocking` occupies the
//! calling thread for model calls and drives sandbox invocations through a
//! runtime owned by the loop. Both feed the same machine.

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, Runtime};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RlmError};
use crate::ipc::{IpcServer, IpcServerConfig};
use crate::llm::{AsyncModelClient, ModelClient, anthropic};
use crate::middleware::MiddlewareChain;
use crate::query::dispatch::{Blocking, SubCallBudget, SubModel, SubQueryDispatcher, SubQuerySettings, Suspending};
use crate::query::machine::{Action, QueryMachine, SubQueryUsage};
use crate::query::result::QueryResult;
use crate::sandbox::{Sandbox, SandboxResult, StateSnapshot};

/// Model answering sub-queries unless configured otherwise
pub const DEFAULT_SUB_MODEL: &str = "claude-haiku-4-5-20251001";

/// Per-query limits and model choices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub max_iterations: usize,
    pub root_model: String,
    pub root_max_tokens: u32,
    pub sub_model: String,
    pub sub_max_tokens: u32,
    /// Sub-queries allowed across the whole query
    pub max_sub_calls: usize,
    /// Characters of context a single sub-query may see
    pub sub_call_context_limit: usize,
    pub save_trajectory: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            root_model: anthropic::DEFAULT_MODEL.to_string(),
            root_max_tokens: 16384,
            sub_model: DEFAULT_SUB_MODEL.to_string(),
            sub_max_tokens: 4096,
            max_sub_calls: 50,
            sub_call_context_limit: 100_000,
            save_trajectory: true,
        }
    }
}

impl QueryConfig {
    fn sub_query_settings(&self) -> SubQuerySettings {
        SubQuerySettings {
            model: self.sub_model.clone(),
            max_tokens: self.sub_max_tokens,
            context_limit: self.sub_call_context_limit,
        }
    }
}

/// Answers questions about a document by iterating a root model against a sandbox.
pub struct QueryLoop<C> {
    client: Arc<C>,
    sandbox: Sandbox,
    config: QueryConfig,
    ipc: IpcServerConfig,
    middleware: MiddlewareChain,
    /// Drives sandbox invocations for `run_blocking`; built on first use
    runtime: OnceLock<Runtime>,
}

impl<C> QueryLoop<C> {
    pub fn new(client: Arc<C>, sandbox: Sandbox) -> Self {
        Self {
            client,
            sandbox,
            config: QueryConfig::default(),
            ipc: IpcServerConfig::default(),
            middleware: MiddlewareChain::new(),
            runtime: OnceLock::new(),
        }
    }

    pub fn with_config(mut self, config: QueryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_ipc_config(mut self, ipc: IpcServerConfig) -> Self {
        self.ipc = ipc;
        self
    }

    pub fn with_middleware(mut self, middleware: MiddlewareChain) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// INIT work shared by both variants: pre-query middleware, then a fresh machine.
    fn prepare(&self, question: &str, context: &str) -> Result<Prepared> {
        let (question, context) = self
            .middleware
            .run_pre(question.to_string(), context.to_string())?;
        let context: Arc<str> = Arc::from(context);
        let machine = QueryMachine::new(
            question,
            Arc::clone(&context),
            &self.config,
            self.sandbox.config().interpreter,
        );
        Ok(Prepared {
            machine,
            context,
            settings: Arc::new(self.config.sub_query_settings()),
            budget: Arc::new(SubCallBudget::new(self.config.max_sub_calls)),
        })
    }

    fn invocation<M: SubModel>(&self, code: String, prepared: &Prepared, model: M) -> Invocation<M> {
        let dispatcher = SubQueryDispatcher::new(
            model,
            Arc::clone(&prepared.context),
            Arc::clone(&prepared.settings),
            Arc::clone(&prepared.budget),
        );
        Invocation {
            sandbox: self.sandbox.clone(),
            ipc: self.ipc.clone(),
            code,
            context: Arc::clone(&prepared.context),
            state: prepared.machine.snapshot(),
            dispatcher: Arc::new(dispatcher),
        }
    }
}

impl<C: AsyncModelClient + 'static> QueryLoop<C> {
    /// Answer one question about `context`.
    pub async fn run(&self, question: &str, context: &str) -> Result<QueryResult> {
        self.run_with_cancel(question, context, &CancellationToken::new())
            .await
    }

    /// Like [`QueryLoop::run`]; cancelling `cancel` kills any running sandbox
    /// child, closes its listener and returns `RlmError::Cancelled`.
    pub async fn run_with_cancel(&self, question: &str, context: &str, cancel: &CancellationToken) -> Result<QueryResult> {
        let mut prepared = self.prepare(question, context)?;
        let mut action = prepared.machine.start()?;

        loop {
            if cancel.is_cancelled() {
                prepared.machine.fail("cancelled");
                return Err(RlmError::Cancelled);
            }

            action = match action {
                Action::CallModel(request) => {
                    let completion = tokio::select! {
                        completion = AsyncModelClient::call(self.client.as_ref(), &request) => {
                            completion.map_err(RlmError::from)
                        }
                        _ = cancel.cancelled() => Err(RlmError::Cancelled),
                    };
                    match completion {
                        Ok(completion) => prepared.machine.on_completion(completion)?,
                        Err(e) => {
                            prepared.machine.fail(&e.to_string());
                            return Err(e);
                        }
                    }
                }
                Action::Delegate(code) => {
                    let invocation = self.invocation(code, &prepared, Suspending(Arc::clone(&self.client)));
                    match spawn_invocation(invocation, cancel).await {
                        Ok((result, usage)) => prepared.machine.on_execution(result, usage)?,
                        Err(e) => {
                            prepared.machine.fail(&e.to_string());
                            return Err(e);
                        }
                    }
                }
                Action::Finish(result) => return self.middleware.run_post(result),
            };
        }
    }

    /// Answer several questions about one document, one after another.
    ///
    /// A model failure on one question is recorded as a `Failed` result, which
    /// still passes through post-query middleware, and the batch continues. Any
    /// other error aborts the batch.
    pub async fn run_batch<I, S>(&self, questions: I, context: &str) -> Result<Vec<QueryResult>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut results = Vec::new();
        for question in questions {
            match self.run(question.as_ref(), context).await {
                Ok(result) => results.push(result),
                Err(RlmError::Model(e)) => {
                    log::warn!("Batch question failed: {}", e);
                    results.push(self.middleware.run_post(QueryResult::failed(e.to_string()))?);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }
}

impl<C: ModelClient + 'static> QueryLoop<C> {
    /// Blocking counterpart of [`QueryLoop::run`].
    ///
    /// Must not be called from inside a tokio runtime.
    pub fn run_blocking(&self, question: &str, context: &str) -> Result<QueryResult> {
        if Handle::try_current().is_ok() {
            return Err(RlmError::InvalidState(
                "run_blocking called from inside a tokio runtime; use run instead".to_string(),
            ));
        }
        let runtime = self.runtime()?;

        let mut prepared = self.prepare(question, context)?;
        let mut action = prepared.machine.start()?;

        loop {
            action = match action {
                Action::CallModel(request) => match ModelClient::call(self.client.as_ref(), &request) {
                    Ok(completion) => prepared.machine.on_completion(completion)?,
                    Err(e) => {
                        prepared.machine.fail(&e.to_string());
                        return Err(e.into());
                    }
                },
                Action::Delegate(code) => {
                    let invocation = self.invocation(code, &prepared, Blocking(Arc::clone(&self.client)));
                    match runtime.block_on(spawn_invocation(invocation, &CancellationToken::new())) {
                        Ok((result, usage)) => prepared.machine.on_execution(result, usage)?,
                        Err(e) => {
                            prepared.machine.fail(&e.to_string());
                            return Err(e);
                        }
                    }
                }
                Action::Finish(result) => return self.middleware.run_post(result),
            };
        }
    }

    fn runtime(&self) -> Result<&Runtime> {
        if let Some(runtime) = self.runtime.get() {
            return Ok(runtime);
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("rlm-sandbox")
            .enable_all()
            .build()?;
        Ok(self.runtime.get_or_init(|| runtime))
    }
}

struct Prepared {
    machine: QueryMachine,
    context: Arc<str>,
    settings: Arc<SubQuerySettings>,
    budget: Arc<SubCallBudget>,
}

/// Everything one sandbox invocation needs, owned so it can run on its own task.
struct Invocation<M> {
    sandbox: Sandbox,
    ipc: IpcServerConfig,
    code: String,
    context: Arc<str>,
    state: StateSnapshot,
    dispatcher: Arc<SubQueryDispatcher<M>>,
}

impl<M: SubModel> Invocation<M> {
    async fn run(self, cancel: CancellationToken) -> Result<(SandboxResult, SubQueryUsage)> {
        let server = IpcServer::bind(Arc::clone(&self.dispatcher), self.ipc).await?;
        let executed = self
            .sandbox
            .execute_with_cancel(&self.code, &self.context, &self.state, server.port(), &cancel)
            .await;
        server.shutdown().await;
        Ok((executed?, self.dispatcher.usage()))
    }
}

async fn spawn_invocation<M: SubModel>(
    invocation: Invocation<M>,
    cancel: &CancellationToken,
) -> Result<(SandboxResult, SubQueryUsage)> {
    let child = cancel.child_token();
    // Dropping the caller's future must still stop the sandbox child
    let guard = child.clone().drop_guard();
    let joined = tokio::spawn(invocation.run(child)).await;
    guard.disarm();
    joined.map_err(|e| RlmError::Sandbox(format!("Sandbox task failed: {}", e)))?
}
