//! rlm-engine - recursive query execution over long documents
//!
//! A root model answers questions about a document it never sees in full. It
//! writes code that runs in an isolated, time-boxed sandbox; the sandbox may
//! ask a smaller model about slices of the document through a size-bounded
//! IPC channel back to the controlling process.

pub mod best_effort;
pub mod document;
pub mod domain;
pub mod error;
pub mod ipc;
pub mod llm;
pub mod middleware;
pub mod query;
pub mod sandbox;

pub use error::{Result, RlmError};
