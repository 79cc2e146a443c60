//! Reference agent worker
//!
//! A small server speaking the worker side of the RPC protocol. It answers
//! messages with an echo, so fleets can be exercised end to end without a
//! model provider. A few message prefixes change its behaviour:
//!
//! - `sleep:<ms> <text>` waits before answering
//! - `fail:<reason>` fails the message with an internal error
//! - `tool:<name> <json>` asks the caller to run a tool and waits for the result
//!
//! The `ganglion-worker` binary wraps [`WorkerServer`].

mod handler;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::rpc::protocol::{self, Frame, ResponseFrame, RpcError, codes};
use handler::{Outbound, WorkerState};

/// Reference worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub host: String,
    /// Listening port, `0` for an ephemeral one
    pub port: u16,
    /// Model reported by new sessions
    pub model: String,
    pub provider: String,
    pub working_directory: PathBuf,
    pub max_frame_length: usize,
    /// Characters per streamed chunk
    pub chunk_size: usize,
    #[serde(with = "humantime_serde")]
    pub chunk_delay: Duration,
    /// How long a tool call waits for its result
    #[serde(with = "humantime_serde")]
    pub tool_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            model: "echo".to_string(),
            provider: "local".to_string(),
            working_directory: PathBuf::from("."),
            max_frame_length: 8 * 1024 * 1024,
            chunk_size: 8,
            chunk_delay: Duration::from_millis(2),
            tool_timeout: Duration::from_secs(60),
        }
    }
}

/// Bound reference worker, not yet serving
pub struct WorkerServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<WorkerState>,
    max_frame_length: usize,
    shutdown: CancellationToken,
}

impl WorkerServer {
    /// Bind the listening socket
    pub async fn bind(config: WorkerConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            max_frame_length: config.max_frame_length,
            state: Arc::new(WorkerState::new(config)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `tcp://host:port` of the listening socket
    pub fn endpoint(&self) -> String {
        protocol::endpoint_for(&self.local_addr.ip().to_string(), self.local_addr.port())
    }

    /// Token that stops [`serve`](Self::serve) when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shut down
    pub async fn serve(self) -> Result<()> {
        info!("Worker listening on {}", self.endpoint());

        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            debug!("Connection from {}", peer);
            let state = self.state.clone();
            let token = self.shutdown.child_token();
            let max = self.max_frame_length;
            tokio::spawn(async move {
                serve_connection(stream, state, max, token).await;
                debug!("Connection from {} closed", peer);
            });
        }

        self.state.shutdown();
        info!("Worker on {} stopped", self.endpoint());
        Ok(())
    }

    /// Serve on a background task
    pub fn spawn(self) -> WorkerHandle {
        let endpoint = self.endpoint();
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(self.serve());
        WorkerHandle {
            endpoint,
            shutdown,
            task: Some(task),
        }
    }
}

/// A worker serving in the background. Dropping it stops the server.
pub struct WorkerHandle {
    endpoint: String,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl WorkerHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stop accepting, drop every connection and wait for the server task
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(Err(e)) => warn!("Worker exited with error: {}", e),
                Err(e) => warn!("Worker task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve_connection(
    stream: TcpStream,
    state: Arc<WorkerState>,
    max_frame_length: usize,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, protocol::codec(max_frame_length));
    let mut writer = FramedWrite::new(write_half, protocol::codec(max_frame_length));
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let write_token = shutdown.clone();
    let write_task = tokio::spawn(async move {
        loop {
            let line = tokio::select! {
                biased;
                _ = write_token.cancelled() => break,
                line = rx.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
            };
            if let Err(e) = writer.send(line).await {
                debug!("Write failed: {}", e);
                break;
            }
        }
    });

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = reader.next() => next,
        };

        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                reply(&tx, ResponseFrame::err(
                    0,
                    None,
                    RpcError::new(codes::INVALID_REQUEST, "frame too long"),
                ));
                continue;
            }
            Some(Err(e)) => {
                debug!("Read failed: {}", e);
                break;
            }
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        match Frame::decode(&line) {
            Ok(Frame::Request(request)) => {
                let state = state.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let out = Outbound::new(tx.clone(), request.id, request.session_id.clone());
                    let response = state.handle(request, out).await;
                    reply(&tx, response);
                });
            }
            Ok(other) => debug!("Ignoring unexpected frame {:?}", other),
            Err(e) => reply(
                &tx,
                ResponseFrame::err(0, None, RpcError::new(codes::PARSE_ERROR, e.to_string())),
            ),
        }
    }

    // Closing the socket is how clients learn the worker went away
    write_task.abort();
}

fn reply(tx: &mpsc::UnboundedSender<String>, response: ResponseFrame) {
    match Frame::Response(response).encode() {
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(e) => warn!("Cannot encode response: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::rpc::Client;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = WorkerServer::bind(WorkerConfig::default()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.endpoint().starts_with("tcp://127.0.0.1:"));
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_parse_error() {
        let server = WorkerServer::bind(WorkerConfig::default()).await.unwrap();
        let addr = server.local_addr();
        let handle = server.spawn();

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"{not json}\n").await.unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        match Frame::decode(&line).unwrap() {
            Frame::Response(r) => assert_eq!(r.error.unwrap().code, codes::PARSE_ERROR),
            other => panic!("unexpected frame {:?}", other),
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_clients() {
        let server = WorkerServer::bind(WorkerConfig::default()).await.unwrap();
        let handle = server.spawn();

        let client = Client::connect_to(handle.endpoint(), ClientConfig::default())
            .await
            .unwrap();
        client.ping().await.unwrap();

        handle.shutdown().await;
        assert!(client.ping().await.is_err());
    }
}
