//! Query Loop - iterates a root model against a sandbox until it answers
//!
//! This module provides:
//! - QueryMachine: the pure transition logic shared by both runners
//! - QueryLoop: blocking (`run_blocking`) and suspending (`run`) runners
//! - SubQueryDispatcher: answers sandbox sub-queries with the sub-model
//! - Response parsing, prompts and the result types

pub mod dispatch;
pub mod machine;
pub mod parser;
pub mod prompts;
pub mod result;
pub mod runner;
pub mod state;

pub use dispatch::{Blocking, SubCallBudget, SubModel, SubQueryDispatcher, SubQuerySettings, Suspending};
pub use machine::{Action, Phase, QueryMachine, SANDBOX_VERIFICATION, SubQueryUsage};
pub use parser::{FINAL_ANSWER_MARKER, MAX_OUTPUT_CHARS, ParsedAnswer, extract_repl_blocks, parse_final_answer};
pub use result::{Confidence, Outcome, QueryResult};
pub use runner::{DEFAULT_SUB_MODEL, QueryConfig, QueryLoop};
pub use state::{QueryState, TrajectoryStep};
