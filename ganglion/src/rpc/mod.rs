//! RPC layer: wire protocol, connection probe and the session client

pub mod client;
pub mod probe;
pub mod protocol;
pub mod retry;

pub use client::{Client, MessageStream};
pub use probe::ping;
pub use protocol::{Frame, NotificationEvent, RequestFrame, ResponseFrame, RpcError, codes, methods};
pub use retry::RetryPolicy;
