//! Ganglion - supervision, routing and RPC core for fleets of AI agent workers
//!
//! Ganglion starts agent worker processes, keeps track of where they listen,
//! decides which one serves a new session, and talks to them over a
//! line-delimited JSON RPC protocol.
//!
//! # Architecture
//!
//! - `process` - port allocation and the process supervisor
//! - `rpc` - wire protocol and the session client
//! - `session` - session records and conversation trees
//! - `registry` - instance catalog, health monitoring and circuit breaking
//! - `runtime` - runtime abstraction over supervisors
//! - `worker` - reference worker implementing the protocol
//! - `fleet` - all of the above wired from one [`FleetConfig`]
//!
//! # Example
//!
//! ```rust,no_run
//! use ganglion::{Fleet, FleetConfig, SelectionCriteria, SessionConfig};
//!
//! # async fn example() -> ganglion::Result<()> {
//! let fleet = Fleet::new(FleetConfig::load_from_path("ganglion.toml")?)?;
//! fleet.start().await;
//!
//! let criteria = SelectionCriteria::default();
//! let (client, session) = fleet
//!     .registry()
//!     .acquire_session(&criteria, SessionConfig::default())
//!     .await?;
//! let reply = client.send_message(&session.id, "hello").await?;
//! println!("{}", reply.text);
//!
//! fleet.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod fleet;
pub mod process;
pub mod registry;
pub mod rpc;
pub mod runtime;
pub mod session;
pub mod telemetry;
pub mod types;
pub mod worker;

pub use config::FleetConfig;
pub use error::{Error, ErrorKind, Result};
pub use events::{EventBus, EventEnvelope, FleetEvent};
pub use fleet::Fleet;
pub use process::{PortAllocator, SpawnConfig, Supervisor, WorkerInfo};
pub use registry::{Instance, InstanceRegistry, InstanceSpec, SelectionCriteria};
pub use rpc::Client;
pub use runtime::{Runtime, RuntimeKind, RuntimeRegistry};
pub use session::{ConversationTree, MessageResponse, Session, SessionConfig};
pub use types::{CallId, InstanceId, NodeId, ProcessId, SessionId};
pub use worker::{WorkerConfig, WorkerServer};

/// Ganglion version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
