//! Session data exchanged with workers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

use crate::types::{CallId, InstanceId, NodeId, SessionId};

/// Session lifecycle status as reported by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Idle, waiting for the next message
    #[default]
    Pending,
    /// A message is being processed
    Running,
    /// The last message failed
    Error,
    /// Closed or killed
    Stopped,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Parameters for `init_session`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Requested id; the worker generates one when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl SessionConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

/// What the worker returns from `init_session`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInit {
    pub session_id: SessionId,
    pub model: String,
    pub provider: String,
    pub root: NodeId,
}

/// A session hosted by one instance for its whole lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub instance_id: InstanceId,
    pub model: String,
    pub provider: String,
    /// Root of the conversation tree at creation time
    pub root: NodeId,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn from_init(init: SessionInit, instance_id: InstanceId) -> Self {
        Self {
            id: init.session_id,
            instance_id,
            model: init.model,
            provider: init.provider,
            root: init.root,
            status: SessionStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// Final answer to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub session_id: SessionId,
    /// Tree node holding the answer
    pub node_id: NodeId,
    pub text: String,
    pub model: String,
    pub provider: String,
    /// Tool calls resolved while producing the answer
    #[serde(default)]
    pub tool_calls: u32,
}

/// Item of a streamed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Partial text
    Delta { text: String },
    /// Final response; always the last item of a successful stream
    Complete(MessageResponse),
}

/// Tool invocation requested by a worker during a message call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: CallId,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Answer to `get_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatusReport {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub model: String,
    pub provider: String,
    pub message_count: u64,
    pub node_count: usize,
    pub head: NodeId,
}
