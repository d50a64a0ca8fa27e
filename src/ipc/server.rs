//! IPC Server - loopback TCP server answering sandbox sub-queries
//!
//! Provides:
//! - Ephemeral-port listener bound before the sandbox child is spawned
//! - One request/response exchange per connection
//! - Strictly sequential handling: a second connection waits for the first
//! - Error frames for malformed or oversized requests, never a crash

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::best_effort::BestEffort;
use crate::error::{Result, RlmError};
use crate::ipc::codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec, FrameError};
use crate::ipc::messages::{IpcRequest, IpcResponse};

/// Configuration for the IPC server
#[derive(Debug, Clone)]
pub struct IpcServerConfig {
    /// Largest request payload accepted
    pub max_frame_length: usize,
    /// How long a connected client may take to deliver its request
    pub read_timeout: Duration,
}

impl Default for IpcServerConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            read_timeout: Duration::from_secs(30),
        }
    }
}

impl IpcServerConfig {
    /// Set max frame length
    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    /// Set read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Handler trait for processing sub-queries
pub trait SubQueryHandler: Send + Sync {
    /// Answer a sub-query. `Err` is sent back as an error frame.
    fn handle(&self, request: IpcRequest) -> impl Future<Output = std::result::Result<String, String>> + Send;
}

/// Simple handler that routes to a callback
pub struct CallbackHandler<F>
where
    F: Fn(IpcRequest) -> std::result::Result<String, String> + Send + Sync,
{
    callback: F,
}

impl<F> CallbackHandler<F>
where
    F: Fn(IpcRequest) -> std::result::Result<String, String> + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> SubQueryHandler for CallbackHandler<F>
where
    F: Fn(IpcRequest) -> std::result::Result<String, String> + Send + Sync,
{
    fn handle(&self, request: IpcRequest) -> impl Future<Output = std::result::Result<String, String>> + Send {
        let result = (self.callback)(request);
        async move { result }
    }
}

/// A bound IPC listener serving one sandbox invocation.
///
/// Dropping the server (or calling [`IpcServer::shutdown`]) closes the listener.
pub struct IpcServer {
    port: u16,
    served: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl IpcServer {
    /// Bind an ephemeral loopback port and start serving.
    pub async fn bind<H: SubQueryHandler + 'static>(handler: Arc<H>, config: IpcServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .map_err(|e| RlmError::Ipc(format!("Failed to bind listener: {}", e)))?;
        let port = listener.local_addr()?.port();

        let served = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(accept_loop(
            listener,
            handler,
            config,
            Arc::clone(&served),
            shutdown.clone(),
        ));

        log::debug!("IPC server listening on 127.0.0.1:{}", port);
        Ok(Self {
            port,
            served,
            shutdown,
            task: Some(task),
        })
    }

    /// Port the sandbox child should connect to
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of connections fully handled so far
    pub fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    /// Stop accepting and wait for the listener task to finish
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::debug!("IPC server task ended abnormally: {}", e);
            }
        }
        log::debug!("IPC server on port {} closed after {} requests", self.port, self.served());
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop<H: SubQueryHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    config: IpcServerConfig,
    served: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, addr)) => {
                        log::debug!("IPC connection from {}", addr);
                        // Served inline: the next accept waits until this exchange is done
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = handle_connection(stream, handler.as_ref(), &config) => {
                                served.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("IPC accept error: {}", e);
                    }
                }
            }
        }
    }
}

/// Handle a single request/response exchange, then close the connection
async fn handle_connection<H: SubQueryHandler>(stream: TcpStream, handler: &H, config: &IpcServerConfig) {
    let mut framed = Framed::new(stream, FrameCodec::with_max_length(config.max_frame_length));

    let response = match tokio::time::timeout(config.read_timeout, framed.next()).await {
        Err(_) => IpcResponse::Error(format!(
            "Timed out after {:?} waiting for request",
            config.read_timeout
        )),
        Ok(None) => {
            log::debug!("IPC client closed before sending a request");
            return;
        }
        Ok(Some(Err(FrameError::Io(e)))) => {
            log::debug!("IPC read failed: {}", e);
            return;
        }
        Ok(Some(Err(e @ FrameError::TooLarge { .. }))) => {
            log::warn!("Rejecting IPC request: {}", e);
            IpcResponse::Error(e.to_string())
        }
        Ok(Some(Ok(frame))) => match IpcRequest::parse(&frame) {
            Ok(request) => handler.handle(request).await.into(),
            Err(message) => {
                log::debug!("Malformed IPC request: {}", message);
                IpcResponse::Error(message)
            }
        },
    };

    let write = write_response(&mut framed, &response).await;
    if let BestEffort::Fallback { reason, .. } = write {
        log::debug!("IPC response dropped: {}", reason);
    }
}

async fn write_response(framed: &mut Framed<TcpStream, FrameCodec>, response: &IpcResponse) -> BestEffort<()> {
    let payload = match serde_json::to_vec(response) {
        Ok(payload) => payload,
        Err(e) => return BestEffort::fallback("IPC response encoding", (), e),
    };
    BestEffort::from_result("IPC response write", framed.send(Bytes::from(payload)).await, ())
}
