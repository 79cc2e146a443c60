//! Lifecycle event bus
//!
//! Components publish [`FleetEvent`]s on a shared [`EventBus`]; any number of
//! observers (the instance registry, logging, an excluded metrics layer)
//! subscribe independently. Delivery order between subscribers is not
//! guaranteed, and a subscriber that falls behind loses the oldest events
//! instead of slowing publishers down.

use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use crate::process::ProcessState;
use crate::registry::{CircuitState, HealthStatus, InstanceOrigin};
use crate::types::{InstanceId, ProcessId, SessionId};

/// Default capacity of the event channel
const DEFAULT_CAPACITY: usize = 1024;

/// Event emitted by the fleet core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    /// A worker process was forked and is starting
    ProcessStarted {
        process_id: ProcessId,
        pid: Option<u32>,
        port: u16,
    },

    /// A worker process passed its readiness check
    ProcessReady {
        process_id: ProcessId,
        endpoint: String,
        model: Option<String>,
        capabilities: Vec<String>,
        /// Readiness was an RPC round trip, so the endpoint accepts clients
        rpc: bool,
    },

    /// A worker process exited
    ProcessExited {
        process_id: ProcessId,
        code: Option<i32>,
        signal: Option<i32>,
        state: ProcessState,
    },

    /// An instance was added to the registry
    InstanceRegistered {
        instance_id: InstanceId,
        endpoint: String,
        origin: InstanceOrigin,
    },

    /// An instance was removed from the registry
    InstanceUnregistered { instance_id: InstanceId },

    /// An instance's health status changed
    HealthChanged {
        instance_id: InstanceId,
        from: HealthStatus,
        to: HealthStatus,
    },

    /// An instance's circuit breaker changed state
    CircuitChanged {
        instance_id: InstanceId,
        from: CircuitState,
        to: CircuitState,
    },

    /// A session was closed, explicitly or by cascade
    SessionClosed {
        session_id: SessionId,
        instance_id: InstanceId,
        reason: String,
    },
}

/// Event with its emission timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub emitted_at: DateTime<Utc>,
    pub event: FleetEvent,
}

/// Stream of events for one subscriber
pub type EventStream = Pin<Box<dyn Stream<Item = EventEnvelope> + Send + 'static>>;

/// Broadcast bus for [`FleetEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a bus with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus retaining up to `capacity` undelivered events per subscriber
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Publishing with no subscribers is not an error.
    pub fn publish(&self, event: FleetEvent) {
        let _ = self.tx.send(EventEnvelope {
            emitted_at: Utc::now(),
            event,
        });
    }

    /// Subscribe with a raw broadcast receiver
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Subscribe as a stream, skipping over lag gaps
    pub fn stream(&self) -> EventStream {
        let rx = self.tx.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|item| async move {
            match item {
                Ok(envelope) => Some(envelope),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    warn!("Event subscriber lagged by {} events", n);
                    None
                }
            }
        }))
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_events() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.stream();

        bus.publish(FleetEvent::InstanceUnregistered {
            instance_id: InstanceId::new("i-1"),
        });

        let from_a = a.recv().await.unwrap();
        let from_b = b.next().await.unwrap();
        assert!(matches!(from_a.event, FleetEvent::InstanceUnregistered { .. }));
        assert!(matches!(from_b.event, FleetEvent::InstanceUnregistered { .. }));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::with_capacity(4);
        bus.publish(FleetEvent::InstanceUnregistered {
            instance_id: InstanceId::new("nobody-listens"),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = FleetEvent::ProcessStarted {
            process_id: ProcessId::new("p"),
            pid: Some(42),
            port: 9100,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "process_started");
        assert_eq!(json["port"], 9100);
    }
}
