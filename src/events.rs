/// Room event bus: broadcast fan-out to UI observers and internal consumers
use crate::model::{ConnectionState, DebatePhase, Message, ParticipantPresence};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events published by the core; the UI observes, never polls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    /// Connection state machine moved
    StateChanged {
        state: ConnectionState,
        reconnect_attempt: u32,
    },
    /// A connection-level error surfaced to the UI
    ConnectionError { message: String, retryable: bool },
    /// The ordered message list changed (insert, reconcile, status flip, reaction)
    MessageUpdated { message: Message },
    /// A participant's presence changed
    PresenceChanged { presence: ParticipantPresence },
    /// The set of typing participants changed
    TypingChanged { user_ids: Vec<String> },
    /// The debate moved to a new phase
    PhaseChanged { phase: DebatePhase },
}

/// Broadcast bus shared by all components of one room session
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RoomEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; a bus with no subscribers drops it silently
    pub fn publish(&self, event: RoomEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
