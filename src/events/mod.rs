//! Event bus broadcasting lifecycle and supervision events to internal
//! observers (the orchestrator's steady-state loop, log tooling, tests).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

/// A sandbox's position in its lifecycle state machine (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Created,
    Materialized,
    Starting,
    Running,
    Stopping,
    Dead,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Created => "created",
            LifecycleState::Materialized => "materialized",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        LifecycleState::Created
    }
}

/// An event broadcast to internal observers.
#[derive(Debug, Clone)]
pub enum Event {
    StateChange {
        service: String,
        state: LifecycleState,
    },
    ConsoleOutput {
        service: String,
        data: Vec<u8>,
    },
    ProcessExited {
        service: String,
        status: i32,
    },
    HealthProbeFailed {
        service: String,
        attempt: u32,
    },
}

/// Broadcast-channel-backed event bus. Clone re-subscribes so every
/// clone stays alive even with zero external subscribers.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    _receiver: broadcast::Receiver<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender, _receiver }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: Event) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn publish_state(&self, service: &str, state: LifecycleState) -> usize {
        let receivers = self.publish(Event::StateChange {
            service: service.to_string(),
            state,
        });
        info!(service, %state, receivers, "lifecycle state change");
        receivers
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _receiver: self.sender.subscribe(),
        }
    }
}
