//! Persistent RPC client for one worker endpoint
//!
//! A [`Client`] owns one TCP connection with a single writer task (frames are
//! written in the order calls are issued) and a reader task that routes
//! responses and notifications to the pending call they belong to. Clones
//! share the connection.
//!
//! Outcomes of a call are kept distinct:
//!
//! - the worker answered with an error: [`Error::Remote`] / [`Error::SessionNotFound`]
//! - the deadline passed: [`Error::Timeout`]
//! - the connection dropped: [`Error::Disconnected`]
//! - the session was killed or closed locally, or the worker process was
//!   stopped by its supervisor: [`Error::Cancelled`]

use async_stream::try_stream;
use dashmap::DashMap;
use futures::stream::Stream;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{self, Frame, NotificationEvent, RequestFrame, methods};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::session::{
    ConversationTree, MessageResponse, Session, SessionConfig, SessionInit, SessionStatusReport,
    StreamChunk, ToolCallRequest,
};
use crate::types::{CallId, InstanceId, NodeId, SessionId};

/// Stream returned by [`Client::send_message_stream`]
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send + 'static>>;

const TOOL_CALL_CHANNEL_CAPACITY: usize = 256;

/// Event delivered to a pending call
enum CallEvent {
    Chunk(String),
    Done(Result<Value>),
}

struct PendingCall {
    method: String,
    tx: mpsc::UnboundedSender<CallEvent>,
}

struct Connection {
    writer: mpsc::UnboundedSender<String>,
    generation: u64,
    cancel: CancellationToken,
}

struct ClientInner {
    endpoint: String,
    instance_id: InstanceId,
    config: ClientConfig,
    next_id: AtomicU64,
    generation: AtomicU64,
    pending: DashMap<u64, PendingCall>,
    sessions: DashMap<SessionId, Session>,
    session_tokens: DashMap<SessionId, CancellationToken>,
    tool_calls: DashMap<CallId, Option<SessionId>>,
    tool_tx: broadcast::Sender<ToolCallRequest>,
    /// Cancelled when the worker behind the endpoint is being stopped
    scope: CancellationToken,
    connection: Mutex<Option<Connection>>,
    heartbeat: Mutex<Option<CancellationToken>>,
    connect_lock: tokio::sync::Mutex<()>,
}

/// Removes the pending entry when the call finishes or is abandoned
struct PendingGuard {
    inner: Arc<ClientInner>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.id);
    }
}

/// RPC client for one worker endpoint
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a disconnected client. The endpoint doubles as instance id.
    pub fn new(endpoint: impl Into<String>, config: ClientConfig) -> Self {
        let endpoint = endpoint.into();
        let instance_id = InstanceId::new(endpoint.clone());
        Self::for_instance(instance_id, endpoint, config)
    }

    /// Create a disconnected client for a registry instance
    pub fn for_instance(
        instance_id: InstanceId,
        endpoint: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        Self::scoped(instance_id, endpoint, config, CancellationToken::new())
    }

    /// Create a disconnected client whose outstanding and future calls fail
    /// with [`Error::Cancelled`] once `scope` is cancelled
    pub fn scoped(
        instance_id: InstanceId,
        endpoint: impl Into<String>,
        config: ClientConfig,
        scope: CancellationToken,
    ) -> Self {
        let (tool_tx, _) = broadcast::channel(TOOL_CALL_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ClientInner {
                endpoint: endpoint.into(),
                instance_id,
                config,
                next_id: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                pending: DashMap::new(),
                sessions: DashMap::new(),
                session_tokens: DashMap::new(),
                tool_calls: DashMap::new(),
                tool_tx,
                scope,
                connection: Mutex::new(None),
                heartbeat: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Create and connect in one step
    pub async fn connect_to(endpoint: impl Into<String>, config: ClientConfig) -> Result<Self> {
        let client = Self::new(endpoint, config);
        client.connect().await?;
        Ok(client)
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.inner.instance_id
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.lock().is_some()
    }

    /// Calls currently waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Tool calls raised by the worker and not yet answered
    pub fn open_tool_calls(&self) -> usize {
        self.inner.tool_calls.len()
    }

    /// Sessions created through this client and not yet closed
    pub fn sessions(&self) -> Vec<Session> {
        self.inner.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn session(&self, id: &SessionId) -> Option<Session> {
        self.inner.sessions.get(id).map(|e| e.value().clone())
    }

    // ========================================================================
    // Connection management
    // ========================================================================

    /// Connect with exponential backoff and start the heartbeat.
    ///
    /// Connecting an already connected client is a no-op.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.establish().await?;
        self.start_heartbeat();
        Ok(())
    }

    /// Drop the current connection and open a new one.
    ///
    /// Calls pending on the old connection are left to their own deadlines.
    pub async fn reconnect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        if let Some(old) = self.inner.connection.lock().take() {
            old.cancel.cancel();
        }
        self.establish().await
    }

    /// Close the connection. Pending calls fail with [`Error::Disconnected`].
    /// Safe to call at any time, including repeatedly.
    pub async fn disconnect(&self) {
        let _guard = self.inner.connect_lock.lock().await;
        if let Some(heartbeat) = self.inner.heartbeat.lock().take() {
            heartbeat.cancel();
        }
        let had_connection = match self.inner.connection.lock().take() {
            Some(conn) => {
                conn.cancel.cancel();
                true
            }
            None => false,
        };
        self.inner.fail_pending("client disconnected");
        if had_connection {
            info!("Disconnected from {}", self.inner.endpoint);
        }
    }

    async fn establish(&self) -> Result<()> {
        let addr = protocol::socket_addr(&self.inner.endpoint)?;
        let policy = &self.inner.config.connect_retry;
        let mut last_error = String::new();

        for attempt in 1..=policy.max_attempts {
            let connect = tokio::time::timeout(
                self.inner.config.request_timeout,
                TcpStream::connect(&addr),
            )
            .await;

            match connect {
                Ok(Ok(stream)) => {
                    self.install(stream);
                    info!(
                        "Connected to {} (attempt {})",
                        self.inner.endpoint, attempt
                    );
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "connect timed out".to_string(),
            }

            debug!(
                "Connect attempt {}/{} to {} failed: {}",
                attempt, policy.max_attempts, self.inner.endpoint, last_error
            );
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.calculate_delay(attempt)).await;
            }
        }

        warn!(
            "Giving up on {} after {} attempts",
            self.inner.endpoint, policy.max_attempts
        );
        Err(Error::Connection {
            endpoint: self.inner.endpoint.clone(),
            attempts: policy.max_attempts,
            reason: last_error,
        })
    }

    fn install(&self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let codec = protocol::codec(self.inner.config.max_frame_length);
        let mut sink = FramedWrite::new(write_half, codec.clone());
        let mut frames = FramedRead::new(read_half, codec);

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let (writer, mut writer_rx) = mpsc::unbounded_channel::<String>();

        // Spawn frame writer task
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    line = writer_rx.recv() => match line {
                        Some(line) => {
                            if let Err(e) = sink.send(line).await {
                                warn!("Failed to write frame: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        // Spawn frame reader task
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => return,
                    frame = frames.next() => match frame {
                        Some(Ok(line)) => match weak.upgrade() {
                            Some(inner) => inner.dispatch(&line),
                            None => return,
                        },
                        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                            warn!("Dropping oversized frame");
                        }
                        Some(Err(LinesCodecError::Io(e))) => break format!("read failed: {}", e),
                        None => break "connection closed by worker".to_string(),
                    },
                }
            };
            if let Some(inner) = weak.upgrade() {
                inner.connection_lost(generation, &reason);
            }
        });

        *self.inner.connection.lock() = Some(Connection {
            writer,
            generation,
            cancel,
        });
    }

    fn start_heartbeat(&self) {
        let token = CancellationToken::new();
        if let Some(old) = self.inner.heartbeat.lock().replace(token.clone()) {
            old.cancel();
        }

        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.heartbeat_interval;
        let max_missed = self.inner.config.max_missed_heartbeats;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            let mut missed = 0u32;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                if inner.scope.is_cancelled() {
                    break;
                }
                let client = Client { inner };

                match client.call(methods::PING, None, json!({}), interval).await {
                    Ok(_) => missed = 0,
                    Err(e) => {
                        missed += 1;
                        debug!(
                            "Heartbeat to {} missed ({}/{}): {}",
                            client.endpoint(), missed, max_missed, e
                        );
                    }
                }

                // disconnect() may have run while the ping was in flight
                if token.is_cancelled() || client.inner.scope.is_cancelled() {
                    break;
                }
                if missed >= max_missed {
                    warn!(
                        "{} missed {} heartbeats, reconnecting",
                        client.endpoint(),
                        missed
                    );
                    match client.reconnect().await {
                        Ok(()) => missed = 0,
                        Err(e) => {
                            error!("Reconnect to {} failed: {}", client.endpoint(), e);
                            if let Some(conn) = client.inner.connection.lock().take() {
                                conn.cancel.cancel();
                            }
                            client.inner.fail_pending("reconnect failed");
                            break;
                        }
                    }
                }
            }
        });
    }

    // ========================================================================
    // Call plumbing
    // ========================================================================

    fn start_call(
        &self,
        method: &str,
        session_id: Option<&SessionId>,
        params: Value,
    ) -> Result<(PendingGuard, mpsc::UnboundedReceiver<CallEvent>)> {
        let writer = self
            .inner
            .connection
            .lock()
            .as_ref()
            .map(|c| c.writer.clone())
            .ok_or_else(|| Error::Disconnected(format!("not connected to {}", self.endpoint())))?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );
        let guard = PendingGuard {
            inner: self.inner.clone(),
            id,
        };

        let line = Frame::Request(RequestFrame {
            id,
            session_id: session_id.cloned(),
            method: method.to_string(),
            params,
        })
        .encode()?;
        writer
            .send(line)
            .map_err(|_| Error::Disconnected(format!("writer for {} closed", self.endpoint())))?;

        Ok((guard, rx))
    }

    async fn invoke(
        &self,
        method: &str,
        session_id: Option<&SessionId>,
        params: Value,
        deadline: Duration,
        token: CancellationToken,
    ) -> Result<Value> {
        let (guard, mut rx) = self.start_call(method, session_id, params)?;

        let wait = async {
            loop {
                match rx.recv().await {
                    Some(CallEvent::Done(result)) => return result,
                    Some(CallEvent::Chunk(_)) => continue,
                    None => return Err(Error::Disconnected("call abandoned".into())),
                }
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = self.inner.scope.cancelled() => Err(self.inner.stopped()),
            _ = token.cancelled() => Err(Error::Cancelled(match session_id {
                Some(id) => format!("session {} was closed", id),
                None => format!("{} cancelled", method),
            })),
            result = tokio::time::timeout(deadline, wait) => {
                result.unwrap_or_else(|_| Err(Error::timeout(method, deadline)))
            }
        };
        drop(guard);
        outcome
    }

    async fn call(
        &self,
        method: &str,
        session_id: Option<&SessionId>,
        params: Value,
        deadline: Duration,
    ) -> Result<Value> {
        let token = session_id
            .map(|id| self.session_token(id))
            .unwrap_or_default();
        self.invoke(method, session_id, params, deadline, token).await
    }

    async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        session_id: Option<&SessionId>,
        params: Value,
    ) -> Result<T> {
        let value = self
            .call(method, session_id, params, self.inner.config.request_timeout)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Token of a known session; unknown sessions get one nothing cancels
    fn session_token(&self, id: &SessionId) -> CancellationToken {
        self.inner
            .session_tokens
            .get(id)
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    /// Send an arbitrary request and return the raw result
    pub async fn request(
        &self,
        method: &str,
        session_id: Option<&SessionId>,
        params: Value,
    ) -> Result<Value> {
        self.call(method, session_id, params, self.inner.config.request_timeout)
            .await
    }

    /// Round-trip a `ping` on the existing connection
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        self.request(methods::PING, None, json!({})).await?;
        Ok(started.elapsed())
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Create a session on the worker
    pub async fn init_session(&self, config: SessionConfig) -> Result<Session> {
        let init: SessionInit = self
            .call_as(methods::INIT_SESSION, None, serde_json::to_value(&config)?)
            .await?;
        let session = Session::from_init(init, self.inner.instance_id.clone());
        self.inner
            .session_tokens
            .insert(session.id.clone(), CancellationToken::new());
        self.inner.sessions.insert(session.id.clone(), session.clone());
        debug!("Session {} opened on {}", session.id, self.endpoint());
        Ok(session)
    }

    /// Close a session. Unknown sessions are a no-op; outstanding calls on
    /// the session fail with [`Error::Cancelled`].
    pub async fn close_session(&self, id: &SessionId) -> Result<()> {
        self.cancel_session_calls(id);
        match self.request(methods::CLOSE_SESSION, Some(id), json!({})).await {
            Ok(_) | Err(Error::SessionNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Abort a session on the worker. Outstanding calls fail with
    /// [`Error::Cancelled`].
    pub async fn kill_session(&self, id: &SessionId) -> Result<()> {
        self.cancel_session_calls(id);
        self.request(methods::KILL_SESSION, Some(id), json!({}))
            .await
            .map(|_| ())
    }

    /// Fail every outstanding call of a session locally and forget it.
    ///
    /// Returns `true` if the session was known to this client.
    pub fn cancel_session_calls(&self, id: &SessionId) -> bool {
        let known = self.inner.sessions.remove(id).is_some();
        if let Some((_, token)) = self.inner.session_tokens.remove(id) {
            token.cancel();
        }
        self.inner
            .tool_calls
            .retain(|_, session| session.as_ref() != Some(id));
        known
    }

    /// Send a message and wait for the final response, tool calls included
    pub async fn send_message(
        &self,
        id: &SessionId,
        message: impl Into<String>,
    ) -> Result<MessageResponse> {
        let token = self.session_token(id);
        let value = self
            .invoke(
                methods::SEND_MESSAGE,
                Some(id),
                json!({ "message": message.into(), "stream": false }),
                self.inner.config.message_timeout,
                token,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a message and receive the answer incrementally.
    ///
    /// Nothing is sent until the stream is first polled. The stream ends
    /// after [`StreamChunk::Complete`], or with an error if the connection
    /// drops, the deadline passes or the session is killed.
    pub fn send_message_stream(&self, id: &SessionId, message: impl Into<String>) -> MessageStream {
        Box::pin(message_stream(self.clone(), id.clone(), message.into()))
    }

    /// Status of a session as the worker sees it
    pub async fn get_status(&self, id: &SessionId) -> Result<SessionStatusReport> {
        self.call_as(methods::GET_STATUS, Some(id), json!({})).await
    }

    /// Use `model` for subsequent messages of the session
    pub async fn switch_model(&self, id: &SessionId, model: impl Into<String>) -> Result<()> {
        let model = model.into();
        self.request(methods::SWITCH_MODEL, Some(id), json!({ "model": model }))
            .await?;
        if let Some(mut session) = self.inner.sessions.get_mut(id) {
            session.model = model;
        }
        Ok(())
    }

    /// Use `provider` for subsequent messages of the session
    pub async fn switch_provider(&self, id: &SessionId, provider: impl Into<String>) -> Result<()> {
        let provider = provider.into();
        self.request(
            methods::SWITCH_PROVIDER,
            Some(id),
            json!({ "provider": provider }),
        )
        .await?;
        if let Some(mut session) = self.inner.sessions.get_mut(id) {
            session.provider = provider;
        }
        Ok(())
    }

    // ========================================================================
    // Conversation tree
    // ========================================================================

    /// Fetch and validate the session's conversation tree
    pub async fn get_tree(&self, id: &SessionId) -> Result<ConversationTree> {
        let tree: ConversationTree = self.call_as(methods::GET_TREE, Some(id), json!({})).await?;
        tree.validate()?;
        Ok(tree)
    }

    /// Fork the conversation at `from_node`; returns the new branch node
    pub async fn create_branch(&self, id: &SessionId, from_node: &NodeId) -> Result<NodeId> {
        let value = self
            .request(
                methods::CREATE_BRANCH,
                Some(id),
                json!({ "from_node": from_node }),
            )
            .await?;
        node_field(&value, "node_id")
    }

    /// Collapse root..=`upto` into one summary node; returns the summary node
    pub async fn compact_history(&self, id: &SessionId, upto: &NodeId) -> Result<NodeId> {
        let value = self
            .request(methods::COMPACT_HISTORY, Some(id), json!({ "upto": upto }))
            .await?;
        node_field(&value, "summary_id")
    }

    // ========================================================================
    // Tool calls
    // ========================================================================

    /// Receive tool calls raised by the worker during message calls
    pub fn subscribe_tool_calls(&self) -> broadcast::Receiver<ToolCallRequest> {
        self.inner.tool_tx.subscribe()
    }

    /// Answer a tool call. The message call that raised it keeps waiting for
    /// the worker's final response.
    pub async fn submit_tool_result(&self, call_id: &CallId, result: Value) -> Result<()> {
        let session_id = self
            .inner
            .tool_calls
            .remove(call_id)
            .and_then(|(_, session)| session);
        self.request(
            methods::TOOL_RESULT,
            session_id.as_ref(),
            json!({ "call_id": call_id, "result": result }),
        )
        .await
        .map(|_| ())
    }
}

fn message_stream(
    client: Client,
    session_id: SessionId,
    message: String,
) -> impl Stream<Item = Result<StreamChunk>> + Send + 'static {
    try_stream! {
        let token = client.session_token(&session_id);
        let (guard, mut rx) = client.start_call(
            methods::SEND_MESSAGE,
            Some(&session_id),
            json!({ "message": message, "stream": true }),
        )?;
        let limit = client.inner.config.message_timeout;
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        loop {
            let step = tokio::select! {
                biased;
                _ = client.inner.scope.cancelled() => StreamStep::Stopped,
                _ = token.cancelled() => StreamStep::Cancelled,
                _ = &mut deadline => StreamStep::TimedOut,
                event = rx.recv() => StreamStep::Event(event),
            };

            match step {
                StreamStep::Stopped => {
                    Err(client.inner.stopped())?;
                }
                StreamStep::Cancelled => {
                    Err(Error::Cancelled(format!("session {} was closed", session_id)))?;
                }
                StreamStep::TimedOut => {
                    Err(Error::timeout(methods::SEND_MESSAGE, limit))?;
                }
                StreamStep::Event(Some(CallEvent::Chunk(text))) => {
                    yield StreamChunk::Delta { text };
                }
                StreamStep::Event(Some(CallEvent::Done(result))) => {
                    let response: MessageResponse = serde_json::from_value(result?)?;
                    yield StreamChunk::Complete(response);
                    break;
                }
                StreamStep::Event(None) => {
                    Err(Error::Disconnected("stream abandoned".into()))?;
                }
            }
        }
        drop(guard);
    }
}

enum StreamStep {
    Stopped,
    Cancelled,
    TimedOut,
    Event(Option<CallEvent>),
}

fn node_field(value: &Value, field: &str) -> Result<NodeId> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(NodeId::new)
        .ok_or_else(|| Error::Protocol(format!("response is missing {}", field)))
}

impl ClientInner {
    fn stopped(&self) -> Error {
        Error::Cancelled(format!("worker at {} was stopped", self.endpoint))
    }

    fn dispatch(&self, line: &str) {
        let frame = match Frame::decode(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping frame from {}: {}", self.endpoint, e);
                return;
            }
        };

        match frame {
            Frame::Response(response) => match self.pending.remove(&response.id) {
                Some((_, call)) => {
                    let _ = call.tx.send(CallEvent::Done(response.into_result()));
                }
                None => debug!("Response for unknown request {}", response.id),
            },
            Frame::Notification(notification) => match notification.event {
                NotificationEvent::Chunk => {
                    let text = notification
                        .data
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    if let Some(call) = self.pending.get(&notification.id) {
                        let _ = call.tx.send(CallEvent::Chunk(text));
                    }
                }
                NotificationEvent::ToolCall => {
                    let mut request: ToolCallRequest =
                        match serde_json::from_value(notification.data) {
                            Ok(request) => request,
                            Err(e) => {
                                warn!("Malformed tool call from {}: {}", self.endpoint, e);
                                return;
                            }
                        };
                    if request.session_id.is_none() {
                        request.session_id = notification.session_id;
                    }
                    debug!(
                        "Tool call {} ({}) requested by {}",
                        request.call_id, request.name, self.endpoint
                    );
                    self.tool_calls
                        .insert(request.call_id.clone(), request.session_id.clone());
                    if self.tool_tx.send(request).is_err() {
                        warn!("Tool call from {} has no subscriber", self.endpoint);
                    }
                }
            },
            Frame::Request(request) => {
                warn!(
                    "Ignoring unexpected request {} from {}",
                    request.method, self.endpoint
                );
            }
        }
    }

    fn connection_lost(&self, generation: u64, reason: &str) {
        let current = {
            let mut slot = self.connection.lock();
            match slot.as_ref() {
                Some(conn) if conn.generation == generation => slot.take(),
                _ => None,
            }
        };
        if let Some(conn) = current {
            conn.cancel.cancel();
            warn!("Lost connection to {}: {}", self.endpoint, reason);
            self.fail_pending(reason);
        }
    }

    fn fail_pending(&self, reason: &str) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                debug!("Failing pending {} ({})", call.method, reason);
                let _ = call
                    .tx
                    .send(CallEvent::Done(Err(Error::Disconnected(reason.to_string()))));
            }
        }
        // Open tool calls belonged to the calls just failed
        self.tool_calls.clear();
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.get_mut().take() {
            conn.cancel.cancel();
        }
        if let Some(heartbeat) = self.heartbeat.get_mut().take() {
            heartbeat.cancel();
        }
    }
}
