/// Shared domain types for the debate-room sync core
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Connection state of a room subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Attempting to connect (initial or during auto-retry)
    Connecting,
    /// Fully connected and ready
    Connected,
    /// Transport dropped; auto-retry in progress or pending
    Disconnected,
    /// Intentionally paused (backgrounded); resumable without a fresh handshake
    Suspended,
    /// Retry budget exhausted or non-retryable error; exits only via explicit reconnect
    Failed,
}

/// Debate phase a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebatePhase {
    Lobby,
    Opening,
    Rebuttal,
    CrossExamination,
    Closing,
}

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    System,
    AiCoaching,
}

/// Delivery status of a message in the local list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Optimistic entry, ack not yet received
    Sending,
    /// Acked by the server
    Delivered,
    /// Send timed out or errored; waiting for an explicit retry
    Failed,
}

/// A single emoji reaction on a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub user_id: String,
    pub timestamp_ms: i64,
}

/// One message in the ordered room list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned id; None while the entry is still optimistic
    pub id: Option<String>,
    /// Locally minted idempotency key; exactly one entry per client_id survives
    pub client_id: String,
    pub conversation_id: String,
    pub author_id: String,
    pub content: String,
    /// Server (or provisional local) timestamp, ms since epoch
    pub timestamp_ms: i64,
    pub phase: DebatePhase,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub is_optimistic: bool,
    pub reply_to_message_id: Option<String>,
    pub reactions: Vec<Reaction>,
}

impl Message {
    /// Create an optimistic local entry in `Sending` state
    pub fn optimistic(
        conversation_id: &str,
        author_id: &str,
        content: &str,
        phase: DebatePhase,
        reply_to_message_id: Option<String>,
    ) -> Self {
        Self {
            id: None,
            client_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            author_id: author_id.to_string(),
            content: content.to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            phase,
            kind: MessageKind::User,
            status: MessageStatus::Sending,
            is_optimistic: true,
            reply_to_message_id,
            reactions: Vec::new(),
        }
    }

    /// Ordering key giving a total order across observers even without
    /// synchronized clocks: timestamp first, client_id lexical tie-break.
    pub fn order_key(&self) -> (i64, &str) {
        (self.timestamp_ms, self.client_id.as_str())
    }

    /// Whether `key` refers to this message by server id or client id
    pub fn matches(&self, key: &str) -> bool {
        self.id.as_deref() == Some(key) || self.client_id == key
    }
}

/// Presence of one room participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantPresence {
    pub user_id: String,
    pub is_online: bool,
    pub is_typing: bool,
    /// Last heartbeat or signal from this participant, ms since epoch
    pub last_seen_ms: Option<i64>,
}

impl ParticipantPresence {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            is_online: false,
            is_typing: false,
            last_seen_ms: None,
        }
    }
}

/// Opaque continuation token for backward history pagination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaginationCursor(pub String);

impl PaginationCursor {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identity handed to the core by the auth layer
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub auth_token: String,
}

impl Identity {
    pub fn new(user_id: &str, auth_token: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            auth_token: auth_token.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimistic_message_starts_sending() {
        let msg = Message::optimistic("conv-1", "alice", "hello", DebatePhase::Opening, None);
        assert_eq!(msg.status, MessageStatus::Sending);
        assert!(msg.is_optimistic);
        assert!(msg.id.is_none());
        assert!(!msg.client_id.is_empty());
    }

    #[test]
    fn order_key_breaks_ties_by_client_id() {
        let mut a = Message::optimistic("c", "u", "a", DebatePhase::Lobby, None);
        let mut b = Message::optimistic("c", "u", "b", DebatePhase::Lobby, None);
        a.timestamp_ms = 100;
        b.timestamp_ms = 100;
        a.client_id = "aaa".into();
        b.client_id = "bbb".into();
        assert!(a.order_key() < b.order_key());
    }
}
