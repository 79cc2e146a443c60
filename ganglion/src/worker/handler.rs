//! Method handlers of the reference worker

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::WorkerConfig;
use crate::error::Error;
use crate::rpc::protocol::{
    Frame, NotificationEvent, NotificationFrame, RequestFrame, ResponseFrame, RpcError, codes,
    methods,
};
use crate::session::{
    ConversationTree, MessageResponse, NodePayload, SessionConfig, SessionInit, SessionStatus,
    SessionStatusReport,
};
use crate::types::{CallId, NodeId, SessionId};

type Reply = std::result::Result<Value, RpcError>;

struct SessionData {
    model: String,
    provider: String,
    status: SessionStatus,
    tree: ConversationTree,
    message_count: u64,
}

struct WorkerSession {
    id: SessionId,
    data: Mutex<SessionData>,
    cancel: CancellationToken,
    /// Serializes messages within the session
    turn: tokio::sync::Mutex<()>,
}

/// Notification sink bound to one request
pub(crate) struct Outbound {
    tx: mpsc::UnboundedSender<String>,
    request_id: u64,
    session_id: Option<SessionId>,
}

impl Outbound {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<String>,
        request_id: u64,
        session_id: Option<SessionId>,
    ) -> Self {
        Self {
            tx,
            request_id,
            session_id,
        }
    }

    fn notify(&self, event: NotificationEvent, data: Value) {
        let frame = Frame::Notification(NotificationFrame {
            id: self.request_id,
            session_id: self.session_id.clone(),
            event,
            data,
        });
        match frame.encode() {
            Ok(line) => {
                let _ = self.tx.send(line);
            }
            Err(e) => warn!("Cannot encode notification: {}", e),
        }
    }
}

/// Sessions and pending tool calls shared by every connection
pub(crate) struct WorkerState {
    config: WorkerConfig,
    sessions: DashMap<SessionId, Arc<WorkerSession>>,
    tool_waiters: DashMap<CallId, oneshot::Sender<Value>>,
    started: Instant,
}

impl WorkerState {
    pub(crate) fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            tool_waiters: DashMap::new(),
            started: Instant::now(),
        }
    }

    /// Abort every session
    pub(crate) fn shutdown(&self) {
        for entry in self.sessions.iter() {
            entry.value().cancel.cancel();
        }
        self.sessions.clear();
        self.tool_waiters.clear();
    }

    pub(crate) async fn handle(&self, request: RequestFrame, out: Outbound) -> ResponseFrame {
        let RequestFrame {
            id,
            session_id,
            method,
            params,
        } = request;
        debug!("-> {} (id {})", method, id);

        let sid = session_id.as_ref();
        let reply = match method.as_str() {
            methods::PING => Ok(json!({
                "pong": true,
                "sessions": self.sessions.len(),
                "uptime_ms": self.started.elapsed().as_millis() as u64,
            })),
            methods::INIT_SESSION => self.init_session(params),
            methods::CLOSE_SESSION => self.end_session(sid, "closed"),
            methods::KILL_SESSION => self.end_session(sid, "killed"),
            methods::SEND_MESSAGE => self.send_message(sid, params, &out).await,
            methods::GET_STATUS => self.get_status(sid),
            methods::SWITCH_MODEL => self.switch_model(sid, params),
            methods::SWITCH_PROVIDER => self.switch_provider(sid, params),
            methods::GET_TREE => self.get_tree(sid),
            methods::CREATE_BRANCH => self.create_branch(sid, params),
            methods::COMPACT_HISTORY => self.compact_history(sid, params),
            methods::TOOL_RESULT => self.tool_result(params),
            other => Err(RpcError::new(
                codes::METHOD_NOT_FOUND,
                format!("unknown method {}", other),
            )),
        };

        match reply {
            Ok(result) => ResponseFrame::ok(id, session_id, result),
            Err(error) => {
                debug!("<- {} failed: {}", method, error.message);
                ResponseFrame::err(id, session_id, error)
            }
        }
    }

    fn session(&self, id: Option<&SessionId>) -> std::result::Result<Arc<WorkerSession>, RpcError> {
        let id = id.ok_or_else(|| RpcError::new(codes::INVALID_REQUEST, "session_id is required"))?;
        self.sessions
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                RpcError::new(codes::SESSION_NOT_FOUND, format!("unknown session {}", id))
            })
    }

    fn init_session(&self, params: Value) -> Reply {
        let config: SessionConfig = parse(params)?;
        let id = config.session_id.unwrap_or_else(SessionId::generate);
        if self.sessions.contains_key(&id) {
            return Err(RpcError::new(
                codes::INVALID_PARAMS,
                format!("session {} already exists", id),
            ));
        }

        let cwd: PathBuf = config
            .working_directory
            .unwrap_or_else(|| self.config.working_directory.clone());
        let tree = ConversationTree::new();
        let init = SessionInit {
            session_id: id.clone(),
            model: config.model.unwrap_or_else(|| self.config.model.clone()),
            provider: config
                .provider
                .unwrap_or_else(|| self.config.provider.clone()),
            root: tree.root().clone(),
        };

        self.sessions.insert(
            id.clone(),
            Arc::new(WorkerSession {
                id: id.clone(),
                data: Mutex::new(SessionData {
                    model: init.model.clone(),
                    provider: init.provider.clone(),
                    status: SessionStatus::Pending,
                    tree,
                    message_count: 0,
                }),
                cancel: CancellationToken::new(),
                turn: tokio::sync::Mutex::new(()),
            }),
        );
        info!(
            "Session {} opened ({} / {}) in {}",
            id,
            init.model,
            init.provider,
            cwd.display()
        );
        to_value(&init)
    }

    fn end_session(&self, id: Option<&SessionId>, how: &str) -> Reply {
        let session = self.session(id)?;
        self.sessions.remove(&session.id);
        session.cancel.cancel();
        session.data.lock().status = SessionStatus::Stopped;
        info!("Session {} {}", session.id, how);
        Ok(json!({ "session_id": session.id, "action": how }))
    }

    async fn send_message(&self, id: Option<&SessionId>, params: Value, out: &Outbound) -> Reply {
        #[derive(Deserialize)]
        struct SendParams {
            message: String,
            #[serde(default)]
            stream: bool,
        }

        let session = self.session(id)?;
        let params: SendParams = parse(params)?;

        let _turn = tokio::select! {
            _ = session.cancel.cancelled() => return Err(killed(&session.id)),
            guard = session.turn.lock() => guard,
        };

        {
            let mut data = session.data.lock();
            data.status = SessionStatus::Running;
            data.tree.append(NodePayload::User {
                text: params.message.clone(),
            });
        }

        let (text, tool_calls) = match self.respond(&session, &params.message, out).await {
            Ok(answer) => answer,
            Err(e) => {
                session.data.lock().status = SessionStatus::Error;
                return Err(e);
            }
        };

        if params.stream {
            for piece in chunks(&text, self.config.chunk_size) {
                if session.cancel.is_cancelled() {
                    return Err(killed(&session.id));
                }
                out.notify(NotificationEvent::Chunk, json!({ "text": piece }));
                if !self.config.chunk_delay.is_zero() {
                    tokio::time::sleep(self.config.chunk_delay).await;
                }
            }
        }

        let response = {
            let mut data = session.data.lock();
            let node_id = data.tree.append(NodePayload::Assistant { text: text.clone() });
            data.message_count += 1;
            data.status = SessionStatus::Pending;
            MessageResponse {
                session_id: session.id.clone(),
                node_id,
                text,
                model: data.model.clone(),
                provider: data.provider.clone(),
                tool_calls,
            }
        };
        to_value(&response)
    }

    /// Produce the answer text, honouring the `sleep:`, `fail:` and `tool:` directives
    async fn respond(
        &self,
        session: &WorkerSession,
        message: &str,
        out: &Outbound,
    ) -> std::result::Result<(String, u32), RpcError> {
        if let Some(rest) = message.strip_prefix("sleep:") {
            let (millis, tail) = rest.split_once(' ').unwrap_or((rest, ""));
            let millis: u64 = millis.trim().parse().map_err(|_| {
                RpcError::new(codes::INVALID_PARAMS, format!("bad sleep duration {}", millis))
            })?;
            tokio::select! {
                _ = session.cancel.cancelled() => return Err(killed(&session.id)),
                _ = tokio::time::sleep(std::time::Duration::from_millis(millis)) => {}
            }
            let echoed = if tail.is_empty() { message } else { tail };
            return Ok((format!("echo: {}", echoed), 0));
        }

        if let Some(reason) = message.strip_prefix("fail:") {
            return Err(RpcError::new(codes::INTERNAL_ERROR, reason.trim().to_string()));
        }

        if let Some(rest) = message.strip_prefix("tool:") {
            let (name, raw) = rest.split_once(' ').unwrap_or((rest, ""));
            let arguments = if raw.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
            };
            let result = self.call_tool(session, name, arguments, out).await?;
            return Ok((format!("tool {} returned {}", name, result), 1));
        }

        Ok((format!("echo: {}", message), 0))
    }

    async fn call_tool(
        &self,
        session: &WorkerSession,
        name: &str,
        arguments: Value,
        out: &Outbound,
    ) -> Reply {
        let call_id = CallId::generate();
        let (tx, rx) = oneshot::channel();
        self.tool_waiters.insert(call_id.clone(), tx);

        debug!("Requesting tool {} as call {}", name, call_id);
        out.notify(
            NotificationEvent::ToolCall,
            json!({ "call_id": call_id, "name": name, "arguments": arguments }),
        );

        let outcome = tokio::select! {
            _ = session.cancel.cancelled() => Err(killed(&session.id)),
            result = tokio::time::timeout(self.config.tool_timeout, rx) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(_)) => Err(RpcError::new(codes::INTERNAL_ERROR, "tool call abandoned")),
                Err(_) => Err(RpcError::new(
                    codes::INTERNAL_ERROR,
                    format!("tool {} timed out", name),
                )),
            },
        };
        self.tool_waiters.remove(&call_id);
        outcome
    }

    fn tool_result(&self, params: Value) -> Reply {
        #[derive(Deserialize)]
        struct ToolResultParams {
            call_id: CallId,
            #[serde(default)]
            result: Value,
        }

        let params: ToolResultParams = parse(params)?;
        let (_, waiter) = self.tool_waiters.remove(&params.call_id).ok_or_else(|| {
            RpcError::new(
                codes::TOOL_CALL_NOT_FOUND,
                format!("unknown tool call {}", params.call_id),
            )
        })?;
        let _ = waiter.send(params.result);
        Ok(json!({ "accepted": true }))
    }

    fn get_status(&self, id: Option<&SessionId>) -> Reply {
        let session = self.session(id)?;
        let report = {
            let data = session.data.lock();
            SessionStatusReport {
                session_id: session.id.clone(),
                status: data.status,
                model: data.model.clone(),
                provider: data.provider.clone(),
                message_count: data.message_count,
                node_count: data.tree.len(),
                head: data.tree.head().clone(),
            }
        };
        to_value(&report)
    }

    fn switch_model(&self, id: Option<&SessionId>, params: Value) -> Reply {
        #[derive(Deserialize)]
        struct Params {
            model: String,
        }
        let session = self.session(id)?;
        let params: Params = parse(params)?;
        session.data.lock().model = params.model.clone();
        debug!("Session {} now uses model {}", session.id, params.model);
        Ok(json!({ "model": params.model }))
    }

    fn switch_provider(&self, id: Option<&SessionId>, params: Value) -> Reply {
        #[derive(Deserialize)]
        struct Params {
            provider: String,
        }
        let session = self.session(id)?;
        let params: Params = parse(params)?;
        session.data.lock().provider = params.provider.clone();
        debug!("Session {} now uses provider {}", session.id, params.provider);
        Ok(json!({ "provider": params.provider }))
    }

    fn get_tree(&self, id: Option<&SessionId>) -> Reply {
        let session = self.session(id)?;
        let tree = session.data.lock().tree.clone();
        to_value(&tree)
    }

    fn create_branch(&self, id: Option<&SessionId>, params: Value) -> Reply {
        #[derive(Deserialize)]
        struct Params {
            from_node: NodeId,
            #[serde(default)]
            label: Option<String>,
        }
        let session = self.session(id)?;
        let params: Params = parse(params)?;
        let node_id = session
            .data
            .lock()
            .tree
            .create_branch(&params.from_node, params.label)
            .map_err(tree_error)?;
        Ok(json!({ "node_id": node_id }))
    }

    fn compact_history(&self, id: Option<&SessionId>, params: Value) -> Reply {
        #[derive(Deserialize)]
        struct Params {
            upto: NodeId,
        }
        let session = self.session(id)?;
        let params: Params = parse(params)?;

        let mut data = session.data.lock();
        let chain = data.tree.path_to(&params.upto).map_err(tree_error)?;
        let summary = summarize(&data.tree, &chain);
        let summary_id = data
            .tree
            .compact(&params.upto, summary)
            .map_err(tree_error)?;
        Ok(json!({ "summary_id": summary_id, "compacted": chain.len() }))
    }
}

/// Join the text of the collapsed nodes
fn summarize(tree: &ConversationTree, chain: &[NodeId]) -> String {
    let texts: Vec<&str> = chain
        .iter()
        .filter_map(|id| tree.get(id))
        .filter_map(|node| match &node.payload {
            NodePayload::User { text }
            | NodePayload::Assistant { text }
            | NodePayload::Summary { text, .. } => Some(text.as_str()),
            NodePayload::Root | NodePayload::Branch { .. } => None,
        })
        .collect();
    format!("[{} nodes] {}", chain.len(), texts.join(" | "))
}

fn chunks(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

fn killed(id: &SessionId) -> RpcError {
    RpcError::new(codes::INTERNAL_ERROR, format!("session {} was killed", id))
}

fn tree_error(error: Error) -> RpcError {
    match error {
        Error::NotFound { id, .. } => {
            RpcError::new(codes::NODE_NOT_FOUND, format!("unknown node {}", id))
        }
        other => RpcError::new(codes::INVALID_PARAMS, other.to_string()),
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> std::result::Result<T, RpcError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params)
        .map_err(|e| RpcError::new(codes::INVALID_PARAMS, format!("invalid params: {}", e)))
}

fn to_value<T: serde::Serialize>(value: &T) -> Reply {
    serde_json::to_value(value).map_err(|e| RpcError::new(codes::INTERNAL_ERROR, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> WorkerState {
        WorkerState::new(WorkerConfig::default())
    }

    fn request(id: u64, session: Option<&SessionId>, method: &str, params: Value) -> RequestFrame {
        RequestFrame {
            id,
            session_id: session.cloned(),
            method: method.to_string(),
            params,
        }
    }

    async fn call(
        state: &WorkerState,
        session: Option<&SessionId>,
        method: &str,
        params: Value,
    ) -> (ResponseFrame, Vec<Frame>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let response = state
            .handle(
                request(1, session, method, params),
                Outbound::new(tx, 1, session.cloned()),
            )
            .await;
        let mut notes = Vec::new();
        while let Ok(line) = rx.try_recv() {
            notes.push(Frame::decode(&line).unwrap());
        }
        (response, notes)
    }

    async fn open(state: &WorkerState) -> SessionId {
        let (response, _) = call(state, None, methods::INIT_SESSION, json!({})).await;
        let init: SessionInit = serde_json::from_value(response.result.unwrap()).unwrap();
        init.session_id
    }

    #[tokio::test]
    async fn test_echo_and_status() {
        let state = state();
        let sid = open(&state).await;

        let (response, _) = call(
            &state,
            Some(&sid),
            methods::SEND_MESSAGE,
            json!({ "message": "hello" }),
        )
        .await;
        let answer: MessageResponse = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(answer.text, "echo: hello");

        let (response, _) = call(&state, Some(&sid), methods::GET_STATUS, json!({})).await;
        let report: SessionStatusReport =
            serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(report.message_count, 1);
        assert_eq!(report.node_count, 3);
        assert_eq!(report.head, answer.node_id);
        assert_eq!(report.status, SessionStatus::Pending);
    }

    #[tokio::test]
    async fn test_streaming_emits_chunks() {
        let state = state();
        let sid = open(&state).await;

        let (response, notes) = call(
            &state,
            Some(&sid),
            methods::SEND_MESSAGE,
            json!({ "message": "a somewhat longer message", "stream": true }),
        )
        .await;
        assert!(response.error.is_none());
        assert!(notes.len() > 1);

        let joined: String = notes
            .iter()
            .map(|f| match f {
                Frame::Notification(n) => n.data["text"].as_str().unwrap().to_string(),
                other => panic!("unexpected frame {:?}", other),
            })
            .collect();
        assert_eq!(joined, "echo: a somewhat longer message");
    }

    #[tokio::test]
    async fn test_unknown_session_and_method() {
        let state = state();
        let ghost = SessionId::new("ghost");

        let (response, _) = call(&state, Some(&ghost), methods::GET_STATUS, json!({})).await;
        assert_eq!(response.error.unwrap().code, codes::SESSION_NOT_FOUND);

        let (response, _) = call(&state, None, "teleport", json!({})).await;
        assert_eq!(response.error.unwrap().code, codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fail_directive_is_remote_error() {
        let state = state();
        let sid = open(&state).await;
        let (response, _) = call(
            &state,
            Some(&sid),
            methods::SEND_MESSAGE,
            json!({ "message": "fail: quota exceeded" }),
        )
        .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, codes::INTERNAL_ERROR);
        assert_eq!(error.message, "quota exceeded");
    }

    #[tokio::test]
    async fn test_branch_and_compact() {
        let state = state();
        let sid = open(&state).await;
        for text in ["one", "two"] {
            call(
                &state,
                Some(&sid),
                methods::SEND_MESSAGE,
                json!({ "message": text }),
            )
            .await;
        }

        let (response, _) = call(&state, Some(&sid), methods::GET_TREE, json!({})).await;
        let tree: ConversationTree = serde_json::from_value(response.result.unwrap()).unwrap();
        let nodes = tree.nodes();
        let first_answer = nodes[2].id.clone();

        let (response, _) = call(
            &state,
            Some(&sid),
            methods::CREATE_BRANCH,
            json!({ "from_node": first_answer }),
        )
        .await;
        assert!(response.result.unwrap()["node_id"].is_string());

        let (response, _) = call(
            &state,
            Some(&sid),
            methods::COMPACT_HISTORY,
            json!({ "upto": first_answer }),
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["compacted"], 3);

        let (response, _) = call(&state, Some(&sid), methods::GET_TREE, json!({})).await;
        let tree: ConversationTree = serde_json::from_value(response.result.unwrap()).unwrap();
        tree.validate().unwrap();
        assert_eq!(tree.root().as_str(), result["summary_id"].as_str().unwrap());

        let (response, _) = call(
            &state,
            Some(&sid),
            methods::CREATE_BRANCH,
            json!({ "from_node": "nope" }),
        )
        .await;
        assert_eq!(response.error.unwrap().code, codes::NODE_NOT_FOUND);
    }

    #[test]
    fn test_chunks_split_on_chars() {
        assert_eq!(chunks("héllo", 2), vec!["hé", "ll", "o"]);
        assert!(chunks("", 4).is_empty());
    }
}
