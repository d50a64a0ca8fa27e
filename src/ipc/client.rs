//! IPC client used by the sandboxed child to reach the controller.
//!
//! Each sub-query opens its own connection, sends one framed request and
//! reads one framed response.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::error::{Result, RlmError};
use crate::ipc::codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec};
use crate::ipc::messages::{IpcRequest, IpcResponse};

/// Configuration for IPC client.
#[derive(Debug, Clone)]
pub struct IpcClientConfig {
    /// Controller port on the loopback interface
    pub port: u16,
    /// Time allowed for the whole exchange, including the sub-model call
    pub request_timeout: Duration,
    pub max_frame_length: usize,
}

impl IpcClientConfig {
    /// Create config for the given port.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            request_timeout: Duration::from_secs(300),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Send a sub-query using the default client settings.
pub async fn sub_query(port: u16, request: &IpcRequest) -> Result<IpcResponse> {
    send(&IpcClientConfig::with_port(port), request).await
}

/// Send one request and wait for its response.
pub async fn send(config: &IpcClientConfig, request: &IpcRequest) -> Result<IpcResponse> {
    tokio::time::timeout(config.request_timeout, exchange(config, request))
        .await
        .map_err(|_| RlmError::Ipc(format!("Request timed out after {:?}", config.request_timeout)))?
}

async fn exchange(config: &IpcClientConfig, request: &IpcRequest) -> Result<IpcResponse> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.port));
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| RlmError::Ipc(format!("Failed to connect to {}: {}", addr, e)))?;

    let mut framed = Framed::new(stream, FrameCodec::with_max_length(config.max_frame_length));

    let payload = serde_json::to_vec(request)?;
    framed
        .send(Bytes::from(payload))
        .await
        .map_err(|e| RlmError::Ipc(format!("Failed to send request: {}", e)))?;

    let frame = framed
        .next()
        .await
        .ok_or_else(|| RlmError::Ipc("Connection closed before response".into()))?
        .map_err(|e| RlmError::Ipc(format!("Failed to read response: {}", e)))?;

    Ok(serde_json::from_slice(&frame)?)
}
