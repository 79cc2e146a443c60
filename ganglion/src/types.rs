//! Identifier newtypes shared across the crate

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string
            #[inline]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new random identifier (UUID v4)
            #[inline]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Borrow the identifier as a string slice
            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Convert into the inner string
            #[inline]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

define_id!(
    /// Identifier of a supervised worker process
    ProcessId
);

define_id!(
    /// Identifier of a registry instance
    InstanceId
);

define_id!(
    /// Identifier of a session hosted inside a worker
    SessionId
);

define_id!(
    /// Identifier of a conversation tree node
    NodeId
);

define_id!(
    /// Identifier of a tool call requested by a worker
    CallId
);

impl From<&ProcessId> for InstanceId {
    /// Auto-spawned instances reuse their process identifier
    fn from(id: &ProcessId) -> Self {
        Self(id.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_id_serializes_transparently() {
        let id = NodeId::new("n-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"n-1\"");
        let back: NodeId = serde_json::from_str("\"n-1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_instance_id_from_process_id() {
        let pid = ProcessId::new("proc-7");
        assert_eq!(InstanceId::from(&pid).as_str(), "proc-7");
    }
}
