//! Fleet configuration
//!
//! All components are configured from one [`FleetConfig`], normally loaded
//! from a TOML file. Every section has defaults, so a partial file is valid:
//!
//! ```toml
//! [supervisor]
//! binary = "pi"
//! port_range = { start = 9100, end = 9199 }
//! max_instances = 8
//! grace_period = "5s"
//!
//! [health]
//! interval = "10s"
//!
//! [registry.auto_spawn]
//! enabled = true
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::rpc::RetryPolicy;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Process supervisor settings
    pub supervisor: SupervisorConfig,

    /// Health monitor settings
    pub health: HealthConfig,

    /// Per-instance circuit breaker settings
    pub circuit_breaker: CircuitBreakerConfig,

    /// RPC client settings
    pub client: ClientConfig,

    /// Instance registry settings
    pub registry: RegistryConfig,

    /// Runtime registry settings
    pub runtimes: RuntimesConfig,
}

impl FleetConfig {
    /// Load configuration from a TOML file
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config from {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component can work with
    pub fn validate(&self) -> Result<()> {
        let range = &self.supervisor.port_range;
        if range.start == 0 || range.start > range.end {
            return Err(Error::Config(format!(
                "Invalid port range {}-{}",
                range.start, range.end
            )));
        }
        if self.supervisor.port_attempts == 0 {
            return Err(Error::Config("supervisor.port_attempts must be > 0".into()));
        }
        if self.supervisor.max_instances == 0 {
            return Err(Error::Config("supervisor.max_instances must be > 0".into()));
        }
        if self.health.unreachable_after == 0 {
            return Err(Error::Config("health.unreachable_after must be > 0".into()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "circuit_breaker.failure_threshold must be > 0".into(),
            ));
        }
        if self.circuit_breaker.cooldown > self.circuit_breaker.max_cooldown {
            return Err(Error::Config(
                "circuit_breaker.cooldown exceeds max_cooldown".into(),
            ));
        }
        let retry = &self.client.connect_retry;
        if retry.max_attempts == 0 || retry.initial_backoff > retry.max_backoff {
            return Err(Error::Config("client.connect_retry is inconsistent".into()));
        }
        if self.client.max_missed_heartbeats == 0 {
            return Err(Error::Config(
                "client.max_missed_heartbeats must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Inclusive TCP port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// Create a new inclusive range
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Number of ports in the range
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    /// Whether the range holds no ports
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `port` lies inside the range
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 9100,
            end: 9199,
        }
    }
}

/// How the supervisor decides a freshly started worker is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessMode {
    /// Connect to the RPC endpoint and get a `ping` answered
    #[default]
    Rpc,

    /// The process is still alive once the settle delay has passed
    Liveness,
}

/// Process supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Worker executable
    pub binary: PathBuf,

    /// Argument template. `{port}`, `{model}`, `{provider}` and `{cwd}` are substituted.
    pub args: Vec<String>,

    /// Host the worker binds to and clients connect to
    pub host: String,

    /// Ports handed out to workers
    pub port_range: PortRange,

    /// Bind attempts before giving up on allocation
    pub port_attempts: usize,

    /// Maximum concurrently managed processes
    pub max_instances: usize,

    /// Deadline for a new worker to become ready
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,

    /// Time between the graceful stop signal and the forced kill
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// Captured output lines retained per process
    pub output_buffer_lines: usize,

    /// Readiness strategy
    pub readiness: ReadinessMode,

    /// Delay before a liveness readiness check
    #[serde(with = "humantime_serde")]
    pub liveness_settle: Duration,

    /// Model used when a spawn request does not name one
    pub default_model: String,

    /// Provider used when a spawn request does not name one
    pub default_provider: String,

    /// Working directory used when a spawn request does not name one
    pub working_directory: Option<PathBuf>,

    /// Environment variables passed to every worker
    pub environment: HashMap<String, String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("pi"),
            args: vec![
                "--mode".to_string(),
                "rpc".to_string(),
                "--port".to_string(),
                "{port}".to_string(),
                "--model".to_string(),
                "{model}".to_string(),
                "--provider".to_string(),
                "{provider}".to_string(),
            ],
            host: "127.0.0.1".to_string(),
            port_range: PortRange::default(),
            port_attempts: 32,
            max_instances: 10,
            startup_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(10),
            output_buffer_lines: 500,
            readiness: ReadinessMode::Rpc,
            liveness_settle: Duration::from_millis(200),
            default_model: "claude-sonnet-4".to_string(),
            default_provider: "anthropic".to_string(),
            working_directory: None,
            environment: HashMap::new(),
        }
    }
}

// ============================================================================
// Health & circuit breaker
// ============================================================================

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Probe interval per instance
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout of a single probe
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Consecutive failed probes before an instance is unreachable
    pub unreachable_after: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            unreachable_after: 3,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within `window` that open the circuit
    pub failure_threshold: u32,

    /// Rolling window for failure accounting
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Initial open period
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,

    /// Upper bound for the doubled open period
    #[serde(with = "humantime_serde")]
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// RPC client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for control calls (session init, status, tree operations)
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Deadline for a whole message exchange, tool-call round trips included
    #[serde(with = "humantime_serde")]
    pub message_timeout: Duration,

    /// Keepalive period
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Missed keepalive acknowledgements before reconnecting
    pub max_missed_heartbeats: u32,

    /// Backoff for `connect` and reconnects
    pub connect_retry: RetryPolicy,

    /// Maximum length of one frame in bytes
    pub max_frame_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            message_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(15),
            max_missed_heartbeats: 3,
            connect_retry: RetryPolicy::default(),
            max_frame_length: 8 * 1024 * 1024,
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Statically configured worker endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticInstance {
    pub id: String,
    pub endpoint: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// On-demand spawning when selection finds nothing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSpawnConfig {
    /// Whether selection may spawn a new worker
    pub enabled: bool,

    /// Model for spawned workers when the selection criteria name none
    pub model: Option<String>,

    /// Provider for spawned workers
    pub provider: Option<String>,
}

/// Instance registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Endpoints known up front
    pub static_instances: Vec<StaticInstance>,

    /// Gateway listing additional endpoints
    pub gateway_url: Option<String>,

    /// Timeout for the gateway query
    #[serde(with = "humantime_serde")]
    pub gateway_timeout: Duration,

    /// Auto-spawn behaviour
    pub auto_spawn: AutoSpawnConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            static_instances: Vec::new(),
            gateway_url: None,
            gateway_timeout: Duration::from_secs(5),
            auto_spawn: AutoSpawnConfig::default(),
        }
    }
}

/// Runtime registry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimesConfig {
    /// Runtime used by `default_runtime()`
    pub default: Option<String>,
}
