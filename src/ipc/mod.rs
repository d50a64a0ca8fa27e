//! IPC Layer - loopback TCP channel between the sandbox and the controller
//!
//! This module provides:
//! - Message types for sub-query requests and responses
//! - Length-prefixed frame codec
//! - Per-invocation server answering sub-queries
//! - Client used by the child-side `sub-query` command

pub mod client;
pub mod codec;
pub mod messages;
pub mod server;

pub use client::{IpcClientConfig, sub_query};
pub use codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec, FrameError};
pub use messages::{IpcRequest, IpcResponse};
pub use server::{CallbackHandler, IpcServer, IpcServerConfig, SubQueryHandler};
