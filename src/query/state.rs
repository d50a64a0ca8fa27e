//! Per-query state owned by the query machine.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::llm::{Message, TokenUsage};
use crate::sandbox::{SandboxResult, StateSnapshot};

/// One sandbox invocation, as recorded in the trajectory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrajectoryStep {
    /// Model turn (1-based) that authored the instruction
    pub iteration: usize,
    pub code: String,
    pub output: String,
    pub timed_out: bool,
    pub terminated: bool,
    pub error: Option<String>,
    /// Sub-queries answered during this invocation
    pub sub_calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TrajectoryStep {
    pub fn usage(&self) -> TokenUsage {
        TokenUsage::new(self.input_tokens, self.output_tokens)
    }
}

/// Mutable state of a single query. Never shared between queries.
#[derive(Debug, Clone)]
pub struct QueryState {
    pub question: String,
    pub context: Arc<str>,
    pub buffers: BTreeMap<String, String>,
    pub findings: Vec<String>,
    pub trajectory: Vec<TrajectoryStep>,
    pub messages: Vec<Message>,
    /// Running totals over root turns and sub-queries
    pub in_tokens: u64,
    pub out_tokens: u64,
    /// Portion of the totals spent on sub-queries
    pub sub_usage: TokenUsage,
    pub sub_calls: usize,
}

impl QueryState {
    pub fn new(question: impl Into<String>, context: Arc<str>) -> Self {
        Self {
            question: question.into(),
            context,
            buffers: BTreeMap::new(),
            findings: Vec::new(),
            trajectory: Vec::new(),
            messages: Vec::new(),
            in_tokens: 0,
            out_tokens: 0,
            sub_usage: TokenUsage::default(),
            sub_calls: 0,
        }
    }

    pub fn add_usage(&mut self, usage: &TokenUsage) {
        self.in_tokens += usage.input_tokens;
        self.out_tokens += usage.output_tokens;
    }

    pub fn total_usage(&self) -> TokenUsage {
        TokenUsage::new(self.in_tokens, self.out_tokens)
    }

    pub fn root_usage(&self) -> TokenUsage {
        TokenUsage::new(
            self.in_tokens - self.sub_usage.input_tokens,
            self.out_tokens - self.sub_usage.output_tokens,
        )
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::new(self.buffers.clone(), self.findings.clone())
    }

    /// Adopt the buffers and findings a sandbox invocation left behind.
    pub fn absorb(&mut self, result: &SandboxResult) {
        self.buffers = result.buffers.clone();
        // Findings are append-only; the sandbox already merged them
        if result.findings.starts_with(&self.findings) {
            self.findings = result.findings.clone();
        } else {
            let merged = self.snapshot().merged_with(result.state());
            self.findings = merged.findings;
        }
    }
}
