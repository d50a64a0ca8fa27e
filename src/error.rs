//! Error types for rlm-engine
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

use crate::llm::ModelError;

/// All error types that can surface to the caller of a query
#[derive(Debug, Error)]
pub enum RlmError {
    /// Model call failed after the retry policy gave up, or failed fatally
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Every document-extraction strategy failed
    #[error("Extraction failed for {path}: {reasons}")]
    ExtractionFailed { path: String, reasons: String },

    /// A middleware hook rejected the query or its result
    #[error("Middleware error: {0}")]
    Middleware(String),

    /// IPC communication error (client side or listener setup)
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Sandbox could not be prepared or spawned
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Query was aborted by its caller
    #[error("Query cancelled")]
    Cancelled,

    /// Invalid state transition or operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Document lookup failed
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for rlm-engine operations
pub type Result<T> = std::result::Result<T, RlmError>;
