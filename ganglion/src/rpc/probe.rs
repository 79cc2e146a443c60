//! One-shot liveness probe: connect, `ping`, disconnect

use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::protocol::{self, Frame, RequestFrame, methods};
use crate::error::{Error, Result};

const PROBE_ID: u64 = 0;
const PROBE_FRAME_LIMIT: usize = 64 * 1024;

/// Ping a worker endpoint on a fresh connection.
///
/// Returns the round-trip latency. The whole exchange, connect included, is
/// bounded by `limit`.
pub async fn ping(endpoint: &str, limit: Duration) -> Result<Duration> {
    let addr = protocol::socket_addr(endpoint)?;
    let started = Instant::now();

    tokio::time::timeout(limit, exchange(&addr))
        .await
        .map_err(|_| Error::timeout(format!("ping {}", endpoint), limit))??;

    Ok(started.elapsed())
}

async fn exchange(addr: &str) -> Result<()> {
    let stream = TcpStream::connect(addr).await.map_err(|e| Error::Connection {
        endpoint: addr.to_string(),
        attempts: 1,
        reason: e.to_string(),
    })?;
    let mut framed = Framed::new(stream, protocol::codec(PROBE_FRAME_LIMIT));

    let request = Frame::Request(RequestFrame {
        id: PROBE_ID,
        session_id: None,
        method: methods::PING.to_string(),
        params: json!({}),
    });
    framed
        .send(request.encode()?)
        .await
        .map_err(|e| Error::Disconnected(e.to_string()))?;

    while let Some(line) = framed.next().await {
        let line = line.map_err(|e| Error::Protocol(e.to_string()))?;
        if let Frame::Response(response) = Frame::decode(&line)? {
            if response.id == PROBE_ID {
                response.into_result()?;
                return Ok(());
            }
        }
    }

    Err(Error::Disconnected(format!("{} closed before answering ping", addr)))
}
