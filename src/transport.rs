/// Wire protocol and transport seams for the room streaming channel
///
/// The backend is an opaque message store reachable over one streaming
/// channel per conversation plus a paginated query API. Both are trait
/// seams so the core can be driven by a real gateway in production and by
/// `InMemoryServer` in tests and demos.
use crate::error::{Result, SyncError};
use crate::model::{
    DebatePhase, Identity, Message, MessageKind, MessageStatus, PaginationCursor, Reaction,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Outbound commands on the streaming channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientCommand {
    /// Send a new message (or re-send a failed one under the same client_id)
    #[serde(rename = "message.send")]
    MessageSend {
        client_id: String,
        content: String,
        phase: DebatePhase,
        reply_to_message_id: Option<String>,
    },

    /// Add an emoji reaction to a delivered message
    #[serde(rename = "reaction.add")]
    ReactionAdd { message_id: String, emoji: String },

    /// Periodic liveness signal; echoed back as heartbeat.ack
    #[serde(rename = "presence.heartbeat")]
    Heartbeat { sent_at_ms: i64 },

    /// Local typing state change
    #[serde(rename = "typing.set")]
    TypingSet { is_typing: bool },
}

impl ClientCommand {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(SyncError::Serialization)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(SyncError::Serialization)
    }

    /// Get command type as string
    pub fn command_type(&self) -> &'static str {
        match self {
            ClientCommand::MessageSend { .. } => "message.send",
            ClientCommand::ReactionAdd { .. } => "reaction.add",
            ClientCommand::Heartbeat { .. } => "presence.heartbeat",
            ClientCommand::TypingSet { .. } => "typing.set",
        }
    }
}

/// A server-confirmed message as it appears on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    pub id: String,
    /// Present when the message originated from a client send; used for
    /// optimistic reconciliation
    pub client_id: Option<String>,
    pub conversation_id: String,
    pub author_id: String,
    pub content: String,
    pub timestamp_ms: i64,
    pub phase: DebatePhase,
    pub kind: MessageKind,
    pub reply_to_message_id: Option<String>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

impl WireMessage {
    /// Convert into a delivered local list entry
    pub fn into_message(self) -> Message {
        Message {
            id: Some(self.id),
            client_id: self.client_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            conversation_id: self.conversation_id,
            author_id: self.author_id,
            content: self.content,
            timestamp_ms: self.timestamp_ms,
            phase: self.phase,
            kind: self.kind,
            status: MessageStatus::Delivered,
            is_optimistic: false,
            reply_to_message_id: self.reply_to_message_id,
            reactions: self.reactions,
        }
    }
}

/// Inbound events on the streaming channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// A message was committed to the store (our own ack or a peer's send)
    #[serde(rename = "message.created")]
    MessageCreated { message: WireMessage },

    /// A reaction was added to a message
    #[serde(rename = "message.reacted")]
    MessageReacted {
        message_id: String,
        emoji: String,
        user_id: String,
        timestamp_ms: i64,
    },

    /// A participant's online state changed
    #[serde(rename = "presence.update")]
    PresenceUpdate {
        user_id: String,
        is_online: bool,
        timestamp_ms: i64,
    },

    /// A participant started or stopped typing
    #[serde(rename = "typing.update")]
    TypingUpdate { user_id: String, is_typing: bool },

    /// The debate moved to a new phase
    #[serde(rename = "phase.changed")]
    PhaseChanged { phase: DebatePhase },

    /// Echo of our own heartbeat, used for round-trip latency
    #[serde(rename = "heartbeat.ack")]
    HeartbeatAck { sent_at_ms: i64 },

    /// Backend-surfaced failure (auth, permission)
    #[serde(rename = "error")]
    Error { category: String, message: String },
}

impl ServerEvent {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(SyncError::Serialization)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(SyncError::Serialization)
    }

    /// Get event type as string
    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::MessageCreated { .. } => "message.created",
            ServerEvent::MessageReacted { .. } => "message.reacted",
            ServerEvent::PresenceUpdate { .. } => "presence.update",
            ServerEvent::TypingUpdate { .. } => "typing.update",
            ServerEvent::PhaseChanged { .. } => "phase.changed",
            ServerEvent::HeartbeatAck { .. } => "heartbeat.ack",
            ServerEvent::Error { .. } => "error",
        }
    }
}

/// Live endpoints of one open streaming channel
pub struct TransportChannel {
    pub commands: mpsc::Sender<ClientCommand>,
    pub events: mpsc::Receiver<ServerEvent>,
}

/// Streaming-channel factory; one open channel per conversation
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, conversation_id: &str, identity: &Identity) -> Result<TransportChannel>;
}

/// One page of historical messages
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<PaginationCursor>,
    pub has_more: bool,
}

/// Paginated query API over the opaque message store
#[async_trait]
pub trait HistoryBackend: Send + Sync {
    /// Fetch a page backward from the cursor (or from the live tail)
    async fn history(
        &self,
        conversation_id: &str,
        cursor: Option<&PaginationCursor>,
        limit: usize,
    ) -> Result<HistoryPage>;

    /// Finite full-text match list
    async fn search(&self, conversation_id: &str, query: &str) -> Result<Vec<Message>>;

    /// Fetch the page surrounding one message (jump-to)
    async fn around(
        &self,
        conversation_id: &str,
        message_id: &str,
        limit: usize,
    ) -> Result<HistoryPage>;
}

// ─── In-memory loopback server ───────────────────────────────────────────────

struct ClientHook {
    user_id: String,
    events: mpsc::Sender<ServerEvent>,
}

struct ServerState {
    /// Committed messages per conversation, in (timestamp, id) order
    archive: HashMap<String, Vec<Message>>,
    /// Connected clients per conversation
    clients: HashMap<String, Vec<ClientHook>>,
    /// Scripted connect failures (consumed one per open attempt)
    fail_connects: u32,
    /// When false, message.send commands are swallowed (no ack)
    auto_ack: bool,
    /// Tokens rejected as expired
    rejected_tokens: Vec<String>,
    next_seq: u64,
}

/// Loopback backend implementing both transport seams, for tests and demos.
///
/// Commits sends to an in-memory archive and fans events out to every
/// connected client, including the sender (whose copy carries the
/// originating client_id for reconciliation).
#[derive(Clone)]
pub struct InMemoryServer {
    state: Arc<RwLock<ServerState>>,
}

impl Default for InMemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ServerState {
                archive: HashMap::new(),
                clients: HashMap::new(),
                fail_connects: 0,
                auto_ack: true,
                rejected_tokens: Vec::new(),
                next_seq: 1,
            })),
        }
    }

    /// Fail the next `n` open attempts with a network error
    pub async fn fail_next_connects(&self, n: u32) {
        self.state.write().await.fail_connects = n;
    }

    /// Swallow (true) or ack (false) subsequent message.send commands
    pub async fn set_drop_sends(&self, drop: bool) {
        self.state.write().await.auto_ack = !drop;
    }

    /// Reject this token on open with an auth error
    pub async fn reject_token(&self, token: &str) {
        self.state.write().await.rejected_tokens.push(token.to_string());
    }

    /// Sever every open channel for a conversation (simulated transport drop)
    pub async fn drop_connections(&self, conversation_id: &str) {
        let mut state = self.state.write().await;
        state.clients.remove(conversation_id);
    }

    /// Inject an event to all clients of a conversation
    pub async fn push_event(&self, conversation_id: &str, event: ServerEvent) {
        let state = self.state.read().await;
        if let Some(clients) = state.clients.get(conversation_id) {
            for client in clients {
                let _ = client.events.send(event.clone()).await;
            }
        }
    }

    /// Seed the archive directly (historical messages predating any client)
    pub async fn seed_archive(&self, conversation_id: &str, messages: Vec<Message>) {
        let mut state = self.state.write().await;
        let archive = state.archive.entry(conversation_id.to_string()).or_default();
        archive.extend(messages);
        archive.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
    }

    /// Number of committed messages for a conversation
    pub async fn archived_count(&self, conversation_id: &str) -> usize {
        let state = self.state.read().await;
        state.archive.get(conversation_id).map_or(0, |a| a.len())
    }

    async fn broadcast(&self, conversation_id: &str, event: ServerEvent) {
        debug!(
            conversation = conversation_id,
            event = event.event_type(),
            "loopback broadcast"
        );
        let mut state = self.state.write().await;
        if let Some(clients) = state.clients.get_mut(conversation_id) {
            clients.retain(|c| !c.events.is_closed());
            for client in clients {
                let _ = client.events.try_send(event.clone());
            }
        }
    }

    async fn handle_command(&self, conversation_id: &str, user_id: &str, command: ClientCommand) {
        match command {
            ClientCommand::MessageSend {
                client_id,
                content,
                phase,
                reply_to_message_id,
            } => {
                let auto_ack = self.state.read().await.auto_ack;
                if !auto_ack {
                    debug!("loopback: swallowing send {}", client_id);
                    return;
                }

                let wire = {
                    let mut state = self.state.write().await;
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    let wire = WireMessage {
                        id: format!("srv-{}", seq),
                        client_id: Some(client_id.clone()),
                        conversation_id: conversation_id.to_string(),
                        author_id: user_id.to_string(),
                        content,
                        timestamp_ms: chrono::Utc::now().timestamp_millis(),
                        phase,
                        kind: MessageKind::User,
                        reply_to_message_id,
                        reactions: Vec::new(),
                    };
                    let archive = state.archive.entry(conversation_id.to_string()).or_default();
                    // Idempotent commit: a retried client_id replaces, never duplicates
                    archive.retain(|m| m.client_id != client_id);
                    archive.push(wire.clone().into_message());
                    archive.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
                    wire
                };
                self.broadcast(conversation_id, ServerEvent::MessageCreated { message: wire })
                    .await;
            }
            ClientCommand::ReactionAdd { message_id, emoji } => {
                let timestamp_ms = chrono::Utc::now().timestamp_millis();
                {
                    let mut state = self.state.write().await;
                    if let Some(archive) = state.archive.get_mut(conversation_id) {
                        if let Some(msg) = archive.iter_mut().find(|m| m.matches(&message_id)) {
                            msg.reactions.push(Reaction {
                                emoji: emoji.clone(),
                                user_id: user_id.to_string(),
                                timestamp_ms,
                            });
                        }
                    }
                }
                self.broadcast(
                    conversation_id,
                    ServerEvent::MessageReacted {
                        message_id,
                        emoji,
                        user_id: user_id.to_string(),
                        timestamp_ms,
                    },
                )
                .await;
            }
            ClientCommand::Heartbeat { sent_at_ms } => {
                // Echo to the sender, fan presence out to everyone
                {
                    let state = self.state.read().await;
                    if let Some(clients) = state.clients.get(conversation_id) {
                        for client in clients.iter().filter(|c| c.user_id == user_id) {
                            let _ = client.events.try_send(ServerEvent::HeartbeatAck { sent_at_ms });
                        }
                    }
                }
                self.broadcast(
                    conversation_id,
                    ServerEvent::PresenceUpdate {
                        user_id: user_id.to_string(),
                        is_online: true,
                        timestamp_ms: chrono::Utc::now().timestamp_millis(),
                    },
                )
                .await;
            }
            ClientCommand::TypingSet { is_typing } => {
                self.broadcast(
                    conversation_id,
                    ServerEvent::TypingUpdate {
                        user_id: user_id.to_string(),
                        is_typing,
                    },
                )
                .await;
            }
        }
    }

    fn page_from_slice(
        archive: &[Message],
        end: usize,
        limit: usize,
    ) -> HistoryPage {
        let start = end.saturating_sub(limit);
        let messages = archive[start..end].to_vec();
        let has_more = start > 0;
        let next_cursor = messages
            .first()
            .filter(|_| has_more)
            .map(|m| PaginationCursor(format!("{}:{}", m.timestamp_ms, m.client_id)));
        HistoryPage {
            messages,
            next_cursor,
            has_more,
        }
    }
}

#[async_trait]
impl Transport for InMemoryServer {
    async fn open(&self, conversation_id: &str, identity: &Identity) -> Result<TransportChannel> {
        {
            let mut state = self.state.write().await;
            if state.rejected_tokens.contains(&identity.auth_token) {
                return Err(SyncError::Auth("token expired".to_string()));
            }
            if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(SyncError::Network("connection refused".to_string()));
            }
        }

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ClientCommand>(64);
        let (evt_tx, evt_rx) = mpsc::channel::<ServerEvent>(64);

        {
            let mut state = self.state.write().await;
            state
                .clients
                .entry(conversation_id.to_string())
                .or_default()
                .push(ClientHook {
                    user_id: identity.user_id.clone(),
                    events: evt_tx,
                });
        }

        let server = self.clone();
        let conversation_id = conversation_id.to_string();
        let user_id = identity.user_id.clone();
        tokio::spawn(async move {
            while let Some(command) = cmd_rx.recv().await {
                server.handle_command(&conversation_id, &user_id, command).await;
            }
        });

        Ok(TransportChannel {
            commands: cmd_tx,
            events: evt_rx,
        })
    }
}

#[async_trait]
impl HistoryBackend for InMemoryServer {
    async fn history(
        &self,
        conversation_id: &str,
        cursor: Option<&PaginationCursor>,
        limit: usize,
    ) -> Result<HistoryPage> {
        let state = self.state.read().await;
        let archive = state
            .archive
            .get(conversation_id)
            .map(|a| a.as_slice())
            .unwrap_or(&[]);

        let end = match cursor {
            None => archive.len(),
            Some(cursor) => {
                // Cursor bounds the page exclusively at the message it names;
                // replaying it yields the same messages (or a subset if the
                // named message was pruned).
                let (ts, cid) = parse_cursor(cursor)?;
                archive
                    .iter()
                    .position(|m| m.order_key() >= (ts, cid.as_str()))
                    .unwrap_or(archive.len())
            }
        };

        Ok(Self::page_from_slice(archive, end, limit))
    }

    async fn search(&self, conversation_id: &str, query: &str) -> Result<Vec<Message>> {
        let state = self.state.read().await;
        let needle = query.to_lowercase();
        Ok(state
            .archive
            .get(conversation_id)
            .map(|archive| {
                archive
                    .iter()
                    .filter(|m| m.content.to_lowercase().contains(&needle))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn around(
        &self,
        conversation_id: &str,
        message_id: &str,
        limit: usize,
    ) -> Result<HistoryPage> {
        let state = self.state.read().await;
        let archive = state
            .archive
            .get(conversation_id)
            .map(|a| a.as_slice())
            .unwrap_or(&[]);

        let pos = archive
            .iter()
            .position(|m| m.matches(message_id))
            .ok_or_else(|| SyncError::Validation(format!("unknown message: {}", message_id)))?;

        let half = limit / 2;
        let start = pos.saturating_sub(half);
        let end = (pos + half + 1).min(archive.len());
        let messages = archive[start..end].to_vec();
        let has_more = start > 0;
        let next_cursor = messages
            .first()
            .filter(|_| has_more)
            .map(|m| PaginationCursor(format!("{}:{}", m.timestamp_ms, m.client_id)));
        Ok(HistoryPage {
            messages,
            next_cursor,
            has_more,
        })
    }
}

fn parse_cursor(cursor: &PaginationCursor) -> Result<(i64, String)> {
    let (ts, cid) = cursor
        .as_str()
        .split_once(':')
        .ok_or_else(|| SyncError::Validation(format!("malformed cursor: {}", cursor.as_str())))?;
    let ts = ts
        .parse::<i64>()
        .map_err(|_| SyncError::Validation(format!("malformed cursor: {}", cursor.as_str())))?;
    Ok((ts, cid.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_json() {
        let cmd = ClientCommand::MessageSend {
            client_id: "c1".into(),
            content: "hello".into(),
            phase: DebatePhase::Opening,
            reply_to_message_id: None,
        };
        let bytes = cmd.to_bytes().unwrap();
        assert!(std::str::from_utf8(&bytes).unwrap().contains("message.send"));
        assert_eq!(ClientCommand::from_bytes(&bytes).unwrap(), cmd);
    }

    #[test]
    fn type_accessors_match_the_wire_tag() {
        let cmd = ClientCommand::Heartbeat { sent_at_ms: 1 };
        assert_eq!(cmd.command_type(), "presence.heartbeat");

        let evt = ServerEvent::HeartbeatAck { sent_at_ms: 1 };
        assert_eq!(evt.event_type(), "heartbeat.ack");
        let bytes = evt.to_bytes().unwrap();
        assert!(std::str::from_utf8(&bytes).unwrap().contains("heartbeat.ack"));
    }

    #[test]
    fn malformed_event_is_a_serialization_error() {
        let err = ServerEvent::from_bytes(b"{\"type\":\"nonsense\"}").unwrap_err();
        assert!(matches!(err, SyncError::Serialization(_)));
    }
}
