//! Sessions and their conversation trees

pub mod tree;
pub mod types;

pub use tree::{ConversationNode, ConversationTree, NodePayload};
pub use types::{
    MessageResponse, Session, SessionConfig, SessionInit, SessionStatus, SessionStatusReport,
    StreamChunk, ToolCallRequest,
};
