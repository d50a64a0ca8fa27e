//! IPC message types for sandbox sub-queries.
//!
//! Request: `{"prompt": "...", "context_slice": "..."?}`
//! Response: exactly one of `{"response": "..."}` or `{"error": "..."}`

use serde::{Deserialize, Serialize};

/// A sub-query issued by the sandboxed child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcRequest {
    pub prompt: String,
    /// Text the sub-query should focus on instead of the whole document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_slice: Option<String>,
}

impl IpcRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context_slice: None,
        }
    }

    pub fn with_context_slice(mut self, slice: impl Into<String>) -> Self {
        self.context_slice = Some(slice.into());
        self
    }

    /// Validate a raw frame payload. The error string is sent back verbatim.
    pub fn parse(payload: &[u8]) -> Result<Self, String> {
        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| format!("Invalid JSON: {}", e))?;

        if value.get("prompt").is_none() {
            return Err("Invalid request: missing field `prompt`".to_string());
        }

        serde_json::from_value(value).map_err(|e| format!("Invalid request: {}", e))
    }
}

/// Controller's answer to one sub-query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpcResponse {
    Response(String),
    Error(String),
}

impl IpcResponse {
    pub fn is_error(&self) -> bool {
        matches!(self, IpcResponse::Error(_))
    }

    pub fn into_result(self) -> Result<String, String> {
        match self {
            IpcResponse::Response(text) => Ok(text),
            IpcResponse::Error(message) => Err(message),
        }
    }
}

impl From<Result<String, String>> for IpcResponse {
    fn from(result: Result<String, String>) -> Self {
        match result {
            Ok(text) => IpcResponse::Response(text),
            Err(message) => IpcResponse::Error(message),
        }
    }
}
