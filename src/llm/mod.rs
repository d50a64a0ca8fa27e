//! LLM Client Layer - model abstraction, retry wrapper, and Anthropic integration
//!
//! This module provides:
//! - Message types for model communication
//! - ModelClient / AsyncModelClient traits for blocking and suspending calls
//! - BlockingAdapter, a blocking view of any suspending client
//! - ResilientClient retry wrapper driven by an explicit RetryPolicy
//! - AnthropicClient implementation

pub mod anthropic;
pub mod client;
pub mod retry;
pub mod types;

pub use anthropic::{AnthropicClient, AnthropicConfig};
pub use client::{AsyncModelClient, BlockingAdapter, ErrorClass, ModelClient, ModelError, ScriptedClient};
pub use retry::{ResilientClient, RetryPolicy, retry_async, retry_blocking};
pub use types::{Completion, Message, ModelRequest, Role, TokenUsage};
