//! The query state machine.
//!
//! `QueryMachine` owns every transition rule of a query and performs no I/O.
//! It emits [`Action`]s; a runner carries each one out (blocking or
//! suspending) and feeds the outcome back. Because both runners drive the
//! same machine, the same model responses always yield the same messages and
//! trajectory.
//!
//! ```text
//! INIT -> ITERATING -> { DELEGATING -> ITERATING } -> ANSWERED | EXHAUSTED | FAILED
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, RlmError};
use crate::llm::{Completion, Message, ModelRequest, TokenUsage};
use crate::query::parser::{extract_repl_blocks, has_final_answer, parse_final_answer, truncate_output};
use crate::query::prompts;
use crate::query::result::{Confidence, Outcome, QueryResult};
use crate::query::state::{QueryState, TrajectoryStep};
use crate::query::QueryConfig;
use crate::sandbox::{Interpreter, SandboxResult, StateSnapshot};

/// Verification label for answers delivered by the sandbox.
pub const SANDBOX_VERIFICATION: &str = "FINAL() from code";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Iterating,
    Delegating,
    Answered,
    Exhausted,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Answered | Phase::Exhausted | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "INIT",
            Phase::Iterating => "ITERATING",
            Phase::Delegating => "DELEGATING",
            Phase::Answered => "ANSWERED",
            Phase::Exhausted => "EXHAUSTED",
            Phase::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

/// Work the runner must perform next.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Call the root model and pass the completion to [`QueryMachine::on_completion`]
    CallModel(ModelRequest),
    /// Run one instruction in the sandbox and pass the result to [`QueryMachine::on_execution`]
    Delegate(String),
    /// The query is over; post-query middleware still applies
    Finish(QueryResult),
}

/// Sub-query spend during one sandbox invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubQueryUsage {
    pub calls: usize,
    pub usage: TokenUsage,
}

/// Transition logic for one query.
#[derive(Debug)]
pub struct QueryMachine {
    state: QueryState,
    phase: Phase,
    iteration: usize,
    max_iterations: usize,
    save_trajectory: bool,
    interpreter: Interpreter,
    template: ModelRequest,
    pending: VecDeque<String>,
    in_flight: Option<String>,
    /// Tokens of the turn that authored the queued instructions, charged to the first step
    authoring_usage: Option<TokenUsage>,
    observations: Vec<String>,
}

impl QueryMachine {
    pub fn new(question: impl Into<String>, context: Arc<str>, config: &QueryConfig, interpreter: Interpreter) -> Self {
        let system = prompts::root_system_prompt(&context, interpreter, config.max_sub_calls);
        let template = ModelRequest::new(system)
            .with_model(config.root_model.clone())
            .with_max_tokens(config.root_max_tokens);

        Self {
            state: QueryState::new(question, context),
            phase: Phase::Init,
            iteration: 0,
            max_iterations: config.max_iterations,
            save_trajectory: config.save_trajectory,
            interpreter,
            template,
            pending: VecDeque::new(),
            in_flight: None,
            authoring_usage: None,
            observations: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &QueryState {
        &self.state
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Buffers and findings to hand to the next sandbox invocation
    pub fn snapshot(&self) -> StateSnapshot {
        self.state.snapshot()
    }

    /// INIT: seed the conversation and request the first model turn.
    pub fn start(&mut self) -> Result<Action> {
        self.require_phase(Phase::Init, "start")?;
        let turn = prompts::initial_turn(&self.state.question, self.interpreter);
        self.state.messages.push(Message::user(turn));
        self.phase = Phase::Iterating;
        log::info!("Query started: {}", self.state.question);
        self.next_turn()
    }

    /// ITERATING: consume one root-model completion.
    pub fn on_completion(&mut self, completion: Completion) -> Result<Action> {
        self.require_phase(Phase::Iterating, "on_completion")?;
        self.iteration += 1;
        self.state.add_usage(&completion.usage);
        self.state.messages.push(Message::assistant(completion.text.clone()));

        if has_final_answer(&completion.text) {
            let parsed = parse_final_answer(&completion.text);
            let mut result = self.result(Outcome::Answered, parsed.answer);
            result.evidence = parsed.evidence.into_iter().collect();
            result.confidence = parsed.confidence;
            result.verification = parsed.verification;
            log::info!("Answered after {} iterations", self.iteration);
            return Ok(self.finish(Phase::Answered, result));
        }

        let blocks = extract_repl_blocks(&completion.text);
        if blocks.is_empty() {
            log::debug!("Iteration {} produced no instruction", self.iteration);
            self.state.messages.push(Message::user(prompts::NO_CODE_TURN));
            return self.next_turn();
        }

        log::debug!("Iteration {} produced {} instructions", self.iteration, blocks.len());
        self.pending = blocks.into();
        self.authoring_usage = Some(completion.usage);
        self.observations.clear();
        self.phase = Phase::Delegating;
        self.delegate_next()
    }

    /// DELEGATING: record one sandbox invocation.
    pub fn on_execution(&mut self, result: SandboxResult, sub: SubQueryUsage) -> Result<Action> {
        self.require_phase(Phase::Delegating, "on_execution")?;
        let code = self
            .in_flight
            .take()
            .ok_or_else(|| RlmError::InvalidState("sandbox result without an instruction in flight".into()))?;

        let mut tokens = self.authoring_usage.take().unwrap_or_default();
        tokens.add(&sub.usage);
        self.state.add_usage(&sub.usage);
        self.state.sub_usage.add(&sub.usage);
        self.state.sub_calls += sub.calls;
        self.state.absorb(&result);

        self.state.trajectory.push(TrajectoryStep {
            iteration: self.iteration,
            code,
            output: result.output.clone(),
            timed_out: result.timed_out,
            terminated: result.terminated,
            error: result.error.clone(),
            sub_calls: sub.calls,
            input_tokens: tokens.input_tokens,
            output_tokens: tokens.output_tokens,
        });

        if result.terminated {
            let answer = result.final_answer.unwrap_or_default();
            let mut query_result = self.result(Outcome::Answered, answer);
            query_result.evidence = self.state.findings.clone();
            query_result.verification = Some(SANDBOX_VERIFICATION.to_string());
            self.pending.clear();
            log::info!("Sandbox signalled completion after {} iterations", self.iteration);
            return Ok(self.finish(Phase::Answered, query_result));
        }

        if !result.output.is_empty() {
            self.observations.push(result.output);
        }

        if !self.pending.is_empty() {
            return self.delegate_next();
        }

        let combined = self.observations.join("\n");
        self.observations.clear();
        let turn = if combined.is_empty() {
            prompts::NO_CODE_TURN.to_string()
        } else {
            prompts::observation_turn(&truncate_output(&combined))
        };
        self.state.messages.push(Message::user(turn));
        self.phase = Phase::Iterating;
        self.next_turn()
    }

    /// Mark the query failed; the runner surfaces the error itself.
    pub fn fail(&mut self, reason: &str) {
        log::warn!("Query failed in {}: {}", self.phase, reason);
        self.phase = Phase::Failed;
    }

    fn next_turn(&mut self) -> Result<Action> {
        if self.iteration >= self.max_iterations {
            let reason = format!(
                "Reached the iteration limit ({}) without a final answer",
                self.max_iterations
            );
            let mut result = self.result(
                Outcome::Exhausted,
                format!("No final answer after {} iterations", self.iteration),
            );
            result.evidence = self.state.findings.clone();
            result.confidence = Confidence::Low;
            result.reason = Some(reason);
            log::info!("Query exhausted after {} iterations", self.iteration);
            return Ok(self.finish(Phase::Exhausted, result));
        }

        log::debug!("Iteration {}/{}", self.iteration + 1, self.max_iterations);
        Ok(Action::CallModel(
            self.template.clone().with_messages(self.state.messages.clone()),
        ))
    }

    fn delegate_next(&mut self) -> Result<Action> {
        let code = self
            .pending
            .pop_front()
            .ok_or_else(|| RlmError::InvalidState("no instruction to delegate".into()))?;
        self.in_flight = Some(code.clone());
        Ok(Action::Delegate(code))
    }

    fn result(&self, outcome: Outcome, answer: String) -> QueryResult {
        QueryResult {
            outcome,
            answer,
            evidence: Vec::new(),
            confidence: Confidence::Unknown,
            verification: None,
            reason: None,
            iterations: self.iteration,
            sub_calls: self.state.sub_calls,
            root_usage: self.state.root_usage(),
            sub_usage: self.state.sub_usage,
            trajectory: self.save_trajectory.then(|| self.state.trajectory.clone()),
        }
    }

    fn finish(&mut self, phase: Phase, result: QueryResult) -> Action {
        self.phase = phase;
        Action::Finish(result)
    }

    fn require_phase(&mut self, phase: Phase, operation: &str) -> Result<()> {
        if self.phase == phase {
            return Ok(());
        }
        let message = format!("{} called in {} (expected {})", operation, self.phase, phase);
        self.fail(&message);
        Err(RlmError::InvalidState(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn machine(max_iterations: usize) -> QueryMachine {
        let config = QueryConfig {
            max_iterations,
            ..Default::default()
        };
        QueryMachine::new("What was Q3 revenue?", Arc::from("Q3 revenue: $1.8M"), &config, Interpreter::Python)
    }

    fn executed(output: &str) -> SandboxResult {
        SandboxResult {
            output: output.to_string(),
            timed_out: false,
            terminated: false,
            elapsed: Duration::from_millis(5),
            error: None,
            buffers: BTreeMap::new(),
            findings: Vec::new(),
            final_answer: None,
        }
    }

    fn expect_call(action: Action) -> ModelRequest {
        match action {
            Action::CallModel(request) => request,
            other => panic!("expected CallModel, got {:?}", other),
        }
    }

    fn expect_finish(action: Action) -> QueryResult {
        match action {
            Action::Finish(result) => result,
            other => panic!("expected Finish, got {:?}", other),
        }
    }

    #[test]
    fn test_start_seeds_initial_turn() {
        let mut m = machine(5);
        let request = expect_call(m.start().unwrap());

        assert_eq!(m.phase(), Phase::Iterating);
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, Role::User);
        assert!(request.messages[0].content.starts_with("Answer this query: What was Q3 revenue?"));
        assert_eq!(request.model.as_deref(), Some("claude-sonnet-4-5-20250929"));
        assert_eq!(request.max_tokens, Some(16384));
        assert!(request.system.contains("17 characters"));
    }

    #[test]
    fn test_final_answer_in_prose() {
        let mut m = machine(5);
        m.start().unwrap();
        let action = m
            .on_completion(Completion::new("FINAL_ANSWER: $1.8M\nCONFIDENCE: high", 100, 20))
            .unwrap();
        let result = expect_finish(action);

        assert_eq!(m.phase(), Phase::Answered);
        assert_eq!(result.outcome, Outcome::Answered);
        assert_eq!(result.answer, "$1.8M");
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.iterations, 1);
        assert_eq!(result.root_usage, TokenUsage::new(100, 20));
        assert_eq!(result.trajectory, Some(Vec::new()));
    }

    #[test]
    fn test_code_then_answer() {
        let mut m = machine(5);
        m.start().unwrap();

        let action = m
            .on_completion(Completion::new("```repl\nprint(context)\n```", 50, 10))
            .unwrap();
        assert_eq!(action, Action::Delegate("print(context)".to_string()));
        assert_eq!(m.phase(), Phase::Delegating);

        let sub = SubQueryUsage {
            calls: 1,
            usage: TokenUsage::new(7, 3),
        };
        let request = expect_call(m.on_execution(executed("Q3 revenue: $1.8M"), sub).unwrap());
        let observation = &request.messages.last().unwrap().content;
        assert!(observation.starts_with("Code execution output:\n```\nQ3 revenue: $1.8M\n```"));

        let result = expect_finish(m.on_completion(Completion::new("FINAL_ANSWER: $1.8M", 60, 5)).unwrap());
        let trajectory = result.trajectory.unwrap();
        assert_eq!(trajectory.len(), 1);
        assert_eq!(trajectory[0].usage(), TokenUsage::new(57, 13));
        assert_eq!(trajectory[0].sub_calls, 1);
        assert_eq!(result.root_usage, TokenUsage::new(110, 15));
        assert_eq!(result.sub_usage, TokenUsage::new(7, 3));
        assert_eq!(result.sub_calls, 1);
        assert_eq!(m.state().total_usage(), TokenUsage::new(117, 18));
    }

    #[test]
    fn test_authoring_tokens_charged_to_first_block_only() {
        let mut m = machine(5);
        m.start().unwrap();
        m.on_completion(Completion::new("```repl\na\n```\n```repl\nb\n```", 40, 8))
            .unwrap();

        let next = m.on_execution(executed("one"), SubQueryUsage::default()).unwrap();
        assert_eq!(next, Action::Delegate("b".to_string()));
        let request = expect_call(m.on_execution(executed("two"), SubQueryUsage::default()).unwrap());

        let steps = &m.state().trajectory;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].usage(), TokenUsage::new(40, 8));
        assert_eq!(steps[1].usage(), TokenUsage::default());
        assert!(request.messages.last().unwrap().content.contains("one\ntwo"));
    }

    #[test]
    fn test_sandbox_termination_answers() {
        let mut m = machine(5);
        m.start().unwrap();
        m.on_completion(Completion::new("```repl\nFINAL('x')\n```\n```repl\nnever()\n```", 1, 1))
            .unwrap();

        let mut done = executed("");
        done.terminated = true;
        done.final_answer = Some("$1.8M".to_string());
        done.findings = vec!["Q3 revenue: $1.8M".to_string()];

        let result = expect_finish(m.on_execution(done, SubQueryUsage::default()).unwrap());
        assert_eq!(result.answer, "$1.8M");
        assert_eq!(result.evidence, vec!["Q3 revenue: $1.8M".to_string()]);
        assert_eq!(result.verification.as_deref(), Some(SANDBOX_VERIFICATION));
        assert_eq!(result.trajectory.unwrap().len(), 1);
    }

    #[test]
    fn test_no_code_turn_then_exhausted() {
        let mut m = machine(2);
        m.start().unwrap();

        let request = expect_call(m.on_completion(Completion::new("Let me think.", 1, 1)).unwrap());
        assert_eq!(request.messages.last().unwrap().content, prompts::NO_CODE_TURN);

        let result = expect_finish(m.on_completion(Completion::new("Still thinking.", 1, 1)).unwrap());
        assert_eq!(m.phase(), Phase::Exhausted);
        assert_eq!(result.outcome, Outcome::Exhausted);
        assert_eq!(result.confidence, Confidence::Low);
        assert!(result.reason.unwrap().contains("iteration limit (2)"));
    }

    #[test]
    fn test_exhausted_carries_findings() {
        let mut m = machine(1);
        m.start().unwrap();
        m.on_completion(Completion::new("```repl\nfindings.append('page 2')\n```", 1, 1))
            .unwrap();

        let mut ran = executed("");
        ran.findings = vec!["page 2".to_string()];
        let result = expect_finish(m.on_execution(ran, SubQueryUsage::default()).unwrap());

        assert_eq!(result.outcome, Outcome::Exhausted);
        assert_eq!(result.evidence, vec!["page 2".to_string()]);
    }

    #[test]
    fn test_zero_iterations_exhausts_immediately() {
        let mut m = machine(0);
        let result = expect_finish(m.start().unwrap());
        assert_eq!(result.outcome, Outcome::Exhausted);
        assert_eq!(result.iterations, 0);
    }

    #[test]
    fn test_empty_output_asks_for_code() {
        let mut m = machine(5);
        m.start().unwrap();
        m.on_completion(Completion::new("```repl\nx = 1\n```", 1, 1)).unwrap();
        let request = expect_call(m.on_execution(executed(""), SubQueryUsage::default()).unwrap());
        assert_eq!(request.messages.last().unwrap().content, prompts::NO_CODE_TURN);
    }

    #[test]
    fn test_invalid_transition() {
        let mut m = machine(5);
        let err = m.on_completion(Completion::new("hi", 1, 1)).unwrap_err();
        assert!(matches!(err, RlmError::InvalidState(_)));
        assert_eq!(m.phase(), Phase::Failed);
    }

    #[test]
    fn test_trajectory_not_saved() {
        let config = QueryConfig {
            save_trajectory: false,
            ..Default::default()
        };
        let mut m = QueryMachine::new("q", Arc::from(""), &config, Interpreter::Shell);
        m.start().unwrap();
        let result = expect_finish(m.on_completion(Completion::new("FINAL_ANSWER: a", 1, 1)).unwrap());
        assert_eq!(result.trajectory, None);
    }
}
