//! Final query results.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::llm::TokenUsage;
use crate::query::state::TrajectoryStep;

/// Terminal state of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Answered,
    Exhausted,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Answered => write!(f, "answered"),
            Outcome::Exhausted => write!(f, "exhausted"),
            Outcome::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
    Unknown,
}

impl Confidence {
    /// Parse a self-reported confidence word; anything unrecognised is `Unknown`.
    pub fn parse(word: &str) -> Self {
        match word.trim().to_ascii_lowercase().as_str() {
            "high" => Confidence::High,
            "medium" => Confidence::Medium,
            "low" => Confidence::Low,
            _ => Confidence::Unknown,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::High => write!(f, "high"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::Low => write!(f, "low"),
            Confidence::Unknown => write!(f, "unknown"),
        }
    }
}

/// What a query produced, plus its accounting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub outcome: Outcome,
    pub answer: String,
    pub evidence: Vec<String>,
    pub confidence: Confidence,
    pub verification: Option<String>,
    /// Why the query is not `Answered`
    pub reason: Option<String>,
    pub iterations: usize,
    pub sub_calls: usize,
    pub root_usage: TokenUsage,
    pub sub_usage: TokenUsage,
    pub trajectory: Option<Vec<TrajectoryStep>>,
}

impl QueryResult {
    /// An answered result with no accounting attached yet.
    pub fn answered(answer: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Answered,
            answer: answer.into(),
            evidence: Vec::new(),
            confidence: Confidence::Unknown,
            verification: None,
            reason: None,
            iterations: 0,
            sub_calls: 0,
            root_usage: TokenUsage::default(),
            sub_usage: TokenUsage::default(),
            trajectory: None,
        }
    }

    /// A failed result, used where a batch keeps going past one bad question.
    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            outcome: Outcome::Failed,
            answer: String::new(),
            confidence: Confidence::Unknown,
            reason: Some(reason),
            ..Self::answered("")
        }
    }

    pub fn is_answered(&self) -> bool {
        self.outcome == Outcome::Answered
    }

    pub fn total_usage(&self) -> TokenUsage {
        let mut total = self.root_usage;
        total.add(&self.sub_usage);
        total
    }

    /// Estimated spend given the models used for root turns and sub-queries.
    pub fn cost_usd(&self, root_model: &str, sub_model: &str) -> f64 {
        self.root_usage.cost_usd(root_model) + self.sub_usage.cost_usd(sub_model)
    }
}
