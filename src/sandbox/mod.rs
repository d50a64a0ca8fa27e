//! Sandbox - isolated, time-boxed execution of model-authored instructions
//!
//! This module provides:
//! - Child-process executor with deadline and cancellation
//! - Signaling files for context, state and explicit termination
//! - Interpreter selection (Python prelude or plain shell)

pub mod executor;
pub mod interpreter;
pub mod signals;

pub use executor::{Sandbox, SandboxConfig, SandboxResult};
pub use interpreter::{Interpreter, PYTHON_PRELUDE};
pub use signals::{SignalFiles, StateSnapshot, TerminationRecord};
