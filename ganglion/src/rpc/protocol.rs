//! Wire protocol between the core and worker processes
//!
//! One TCP connection carries newline-delimited JSON frames. Each frame has a
//! `type` tag:
//!
//! ```text
//! {"type":"request","id":7,"session_id":"s-1","method":"send_message","params":{...}}
//! {"type":"notification","id":7,"session_id":"s-1","event":"chunk","data":{"text":"He"}}
//! {"type":"response","id":7,"session_id":"s-1","result":{...}}
//! {"type":"response","id":8,"error":{"code":-32001,"message":"unknown session"}}
//! ```
//!
//! Notifications carry the id of the request they belong to.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::LinesCodec;
use url::Url;

use crate::error::{Error, Result};
use crate::types::SessionId;

/// Method names understood by workers
pub mod methods {
    pub const PING: &str = "ping";
    pub const INIT_SESSION: &str = "init_session";
    pub const CLOSE_SESSION: &str = "close_session";
    pub const KILL_SESSION: &str = "kill_session";
    pub const SEND_MESSAGE: &str = "send_message";
    pub const GET_STATUS: &str = "get_status";
    pub const SWITCH_MODEL: &str = "switch_model";
    pub const SWITCH_PROVIDER: &str = "switch_provider";
    pub const GET_TREE: &str = "get_tree";
    pub const CREATE_BRANCH: &str = "create_branch";
    pub const COMPACT_HISTORY: &str = "compact_history";
    pub const TOOL_RESULT: &str = "tool_result";
}

/// Error codes carried in response frames
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SESSION_NOT_FOUND: i64 = -32001;
    pub const TOOL_CALL_NOT_FOUND: i64 = -32002;
    pub const NODE_NOT_FOUND: i64 = -32003;
}

/// Kind of out-of-band event attached to a pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    /// Partial response text
    Chunk,
    /// The worker needs the caller to run a tool
    ToolCall,
}

/// A single frame on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
    Notification(NotificationFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationFrame {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub event: NotificationEvent,
    #[serde(default)]
    pub data: Value,
}

/// Error payload of a response frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl Frame {
    /// Serialize to one line (without the trailing newline)
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one line
    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::Protocol(format!("Malformed frame: {}", e)))
    }
}

impl ResponseFrame {
    /// Successful response
    pub fn ok(id: u64, session_id: Option<SessionId>, result: Value) -> Self {
        Self {
            id,
            session_id,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response
    pub fn err(id: u64, session_id: Option<SessionId>, error: RpcError) -> Self {
        Self {
            id,
            session_id,
            result: None,
            error: Some(error),
        }
    }

    /// Convert into the call outcome.
    ///
    /// `SESSION_NOT_FOUND` becomes [`Error::SessionNotFound`]; every other
    /// worker error becomes [`Error::Remote`].
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(error) if error.code == codes::SESSION_NOT_FOUND => {
                let id = self
                    .session_id
                    .map(SessionId::into_inner)
                    .unwrap_or(error.message);
                Err(Error::SessionNotFound(id))
            }
            Some(error) => Err(Error::Remote {
                code: error.code,
                message: error.message,
                data: error.data,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Line codec bounded to `max_frame_length` bytes per frame
pub fn codec(max_frame_length: usize) -> LinesCodec {
    LinesCodec::new_with_max_length(max_frame_length)
}

/// Canonical endpoint string for a worker listening on `host:port`
pub fn endpoint_for(host: &str, port: u16) -> String {
    format!("tcp://{}:{}", host, port)
}

/// Resolve an endpoint (`tcp://host:port` or bare `host:port`) to a socket address string
pub fn socket_addr(endpoint: &str) -> Result<String> {
    if endpoint.contains("://") {
        let url = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("Invalid endpoint {}: {}", endpoint, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("Endpoint {} has no host", endpoint)))?;
        let port = url
            .port()
            .ok_or_else(|| Error::Config(format!("Endpoint {} has no port", endpoint)))?;
        Ok(format!("{}:{}", host, port))
    } else if endpoint.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
        Ok(endpoint.to_string())
    } else {
        Err(Error::Config(format!("Invalid endpoint {}", endpoint)))
    }
}
