/// Message synchronizer: ordered list, optimistic sends, reconciliation
///
/// The UI appends through `send`/`reply` and reads back the ordered
/// snapshot; everything else happens through inbound envelopes. A message
/// is never duplicated: exactly one entry per client_id survives
/// reconciliation.
use crate::config::SyncConfig;
use crate::connection::ConnectionManager;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, RoomEvent};
use crate::model::{DebatePhase, Message, MessageStatus, Reaction};
use crate::transport::{ClientCommand, ServerEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

/// An inbound reaction whose target message has not arrived yet
struct BufferedReaction {
    message_id: String,
    reaction: Reaction,
    buffered_at: Instant,
}

struct SyncInner {
    /// Time-ordered list; ties broken by client_id lexical order
    messages: Vec<Message>,
    pending_reactions: Vec<BufferedReaction>,
    current_phase: DebatePhase,
    /// Current send generation per client_id; stale watchdogs stand down
    send_epochs: HashMap<String, u64>,
}

#[derive(Clone)]
pub struct MessageSynchronizer {
    conversation_id: String,
    author_id: String,
    config: SyncConfig,
    connection: ConnectionManager,
    bus: EventBus,
    inner: Arc<RwLock<SyncInner>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MessageSynchronizer {
    pub fn new(
        conversation_id: &str,
        author_id: &str,
        config: SyncConfig,
        connection: ConnectionManager,
        bus: EventBus,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            author_id: author_id.to_string(),
            config,
            connection,
            bus,
            inner: Arc::new(RwLock::new(SyncInner {
                messages: Vec::new(),
                pending_reactions: Vec::new(),
                current_phase: DebatePhase::Lobby,
                send_epochs: HashMap::new(),
            })),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn the inbound pump; call once per session
    pub async fn start(&self) {
        let mut inbound = self.connection.subscribe_inbound();
        let sync = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(event) => sync.handle_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(conversation = %sync.conversation_id, lagged = n, "sync pump lagged");
                        continue;
                    }
                    Err(_) => break,
                }
            }
        });
        self.tasks.lock().await.push(handle);
    }

    /// Abort the pump and any pending send watchdogs
    pub async fn close(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Ordered snapshot of the live list
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.read().await.messages.clone()
    }

    /// Find one message by server id or client id
    pub async fn get(&self, key: &str) -> Option<Message> {
        self.inner
            .read()
            .await
            .messages
            .iter()
            .find(|m| m.matches(key))
            .cloned()
    }

    pub async fn current_phase(&self) -> DebatePhase {
        self.inner.read().await.current_phase
    }

    /// Send a message. The optimistic entry is appended and returned before
    /// any I/O happens; failures only ever show up as `status = Failed`.
    pub async fn send(&self, content: &str, phase: DebatePhase) -> Message {
        let message = Message::optimistic(&self.conversation_id, &self.author_id, content, phase, None);
        self.insert_ordered(message.clone()).await;
        self.push_to_transport(&message).await;
        message
    }

    /// Reply to an existing message. Validates the target locally, then
    /// follows the same optimistic path as `send`.
    pub async fn reply(&self, target_key: &str, content: &str) -> Result<Message> {
        let target = self
            .get(target_key)
            .await
            .ok_or_else(|| SyncError::Validation(format!("unknown reply target: {}", target_key)))?;
        // Prefer the server id; fall back to client id for still-pending targets
        let reply_to = target.id.clone().unwrap_or_else(|| target.client_id.clone());
        let phase = self.current_phase().await;
        let message = Message::optimistic(
            &self.conversation_id,
            &self.author_id,
            content,
            phase,
            Some(reply_to),
        );
        self.insert_ordered(message.clone()).await;
        self.push_to_transport(&message).await;
        Ok(message)
    }

    /// Add a reaction to a delivered message. Unlike `send`, this may
    /// reject; the caller handles the error.
    pub async fn react(&self, message_key: &str, emoji: &str) -> Result<()> {
        let target = self
            .get(message_key)
            .await
            .ok_or_else(|| SyncError::Validation(format!("unknown message: {}", message_key)))?;
        let message_id = target
            .id
            .ok_or_else(|| SyncError::Validation("message not yet delivered".to_string()))?;
        self.connection
            .send(ClientCommand::ReactionAdd {
                message_id,
                emoji: emoji.to_string(),
            })
            .await
    }

    /// Re-send a failed message under its original client_id.
    ///
    /// Deliberate user action only; fails fast when the connection has
    /// moved to `Failed` instead of queueing indefinitely.
    pub async fn retry(&self, key: &str) -> Result<()> {
        let message = {
            let mut inner = self.inner.write().await;
            let entry = inner
                .messages
                .iter_mut()
                .find(|m| m.matches(key))
                .ok_or_else(|| SyncError::Validation(format!("unknown message: {}", key)))?;
            if entry.status != MessageStatus::Failed {
                return Err(SyncError::Validation(format!(
                    "message is not failed (status: {:?})",
                    entry.status
                )));
            }
            entry.status = MessageStatus::Sending;
            entry.clone()
        };
        self.bus.publish(RoomEvent::MessageUpdated {
            message: message.clone(),
        });

        if let Err(e) = self.try_send_command(&message).await {
            self.mark_failed(&message.client_id).await;
            return Err(e);
        }
        self.arm_watchdog(message.client_id).await;
        Ok(())
    }

    /// Splice a page of historical messages into the list, deduplicating by
    /// server id first, client id second. Returns how many were new.
    pub async fn merge_history(&self, messages: Vec<Message>) -> usize {
        let mut inserted = 0;
        for message in messages {
            let is_new = {
                let inner = self.inner.read().await;
                !inner.messages.iter().any(|m| {
                    (message.id.is_some() && m.id == message.id)
                        || m.client_id == message.client_id
                })
            };
            if is_new {
                self.insert_ordered(message).await;
                inserted += 1;
            }
        }
        inserted
    }

    /// Drop all loaded history, keeping only live (optimistic or newer than
    /// the given bound) entries. Used by jump-to, where gap-filling must be
    /// explicit.
    pub async fn discard_older_than(&self, timestamp_ms: i64) {
        let mut inner = self.inner.write().await;
        inner
            .messages
            .retain(|m| m.is_optimistic || m.timestamp_ms >= timestamp_ms);
    }

    // ─── Outbound path ───────────────────────────────────────────────────────

    async fn push_to_transport(&self, message: &Message) {
        if let Err(e) = self.try_send_command(message).await {
            debug!(
                conversation = %self.conversation_id,
                client_id = %message.client_id,
                error = %e,
                "optimistic send failed"
            );
            self.mark_failed(&message.client_id).await;
            return;
        }
        self.arm_watchdog(message.client_id.clone()).await;
    }

    async fn try_send_command(&self, message: &Message) -> Result<()> {
        self.connection
            .send(ClientCommand::MessageSend {
                client_id: message.client_id.clone(),
                content: message.content.clone(),
                phase: message.phase,
                reply_to_message_id: message.reply_to_message_id.clone(),
            })
            .await
    }

    /// Flip the entry to Failed if no ack arrives within send_timeout.
    ///
    /// Arming bumps the entry's send epoch, so a watchdog left over from an
    /// earlier send of the same client_id finds its epoch stale and stands
    /// down instead of failing the re-armed send early.
    async fn arm_watchdog(&self, client_id: String) {
        let epoch = {
            let mut inner = self.inner.write().await;
            let epoch = inner.send_epochs.entry(client_id.clone()).or_insert(0);
            *epoch += 1;
            *epoch
        };
        let sync = self.clone();
        let timeout = self.config.send_timeout;
        let handle = tokio::spawn(async move {
            sleep(timeout).await;
            let still_pending = {
                let inner = sync.inner.read().await;
                inner.send_epochs.get(&client_id).copied() == Some(epoch)
                    && inner
                        .messages
                        .iter()
                        .any(|m| m.client_id == client_id && m.status == MessageStatus::Sending)
            };
            if still_pending {
                warn!(client_id = %client_id, "send timed out");
                sync.mark_failed(&client_id).await;
            }
        });
        let mut tasks = self.tasks.lock().await;
        // Reap watchdogs that already fired or were superseded
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    async fn mark_failed(&self, client_id: &str) {
        let updated = {
            let mut inner = self.inner.write().await;
            match inner.messages.iter_mut().find(|m| m.client_id == client_id) {
                Some(entry) if entry.status == MessageStatus::Sending => {
                    entry.status = MessageStatus::Failed;
                    Some(entry.clone())
                }
                _ => None,
            }
        };
        if let Some(message) = updated {
            self.bus.publish(RoomEvent::MessageUpdated { message });
        }
    }

    // ─── Inbound path ────────────────────────────────────────────────────────

    async fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::MessageCreated { message } => {
                self.apply_created(message.into_message()).await;
            }
            ServerEvent::MessageReacted {
                message_id,
                emoji,
                user_id,
                timestamp_ms,
            } => {
                self.apply_reaction(
                    message_id,
                    Reaction {
                        emoji,
                        user_id,
                        timestamp_ms,
                    },
                )
                .await;
            }
            ServerEvent::PhaseChanged { phase } => {
                self.inner.write().await.current_phase = phase;
                self.bus.publish(RoomEvent::PhaseChanged { phase });
            }
            _ => {}
        }
        self.purge_stale_reactions().await;
    }

    async fn apply_created(&self, incoming: Message) {
        let updated = {
            let mut inner = self.inner.write().await;
            let updated = if let Some(entry) = inner
                .messages
                .iter_mut()
                .find(|m| m.client_id == incoming.client_id)
            {
                // Reconcile the optimistic entry in place, preserving its
                // position in the list
                let reactions = std::mem::take(&mut entry.reactions);
                *entry = incoming;
                for reaction in reactions {
                    if !entry.reactions.contains(&reaction) {
                        entry.reactions.push(reaction);
                    }
                }
                entry.clone()
            } else {
                let pos = inner
                    .messages
                    .partition_point(|m| m.order_key() < incoming.order_key());
                inner.messages.insert(pos, incoming.clone());
                incoming
            };
            // The ack settles the send; any armed watchdog is now moot
            inner.send_epochs.remove(&updated.client_id);
            updated
        };
        self.bus.publish(RoomEvent::MessageUpdated {
            message: updated.clone(),
        });
        self.flush_buffered_reactions(&updated).await;
    }

    async fn apply_reaction(&self, message_id: String, reaction: Reaction) {
        let updated = {
            let mut inner = self.inner.write().await;
            match inner.messages.iter_mut().find(|m| m.matches(&message_id)) {
                Some(entry) => {
                    if !entry.reactions.contains(&reaction) {
                        entry.reactions.push(reaction);
                    }
                    Some(entry.clone())
                }
                None => {
                    // Target not loaded yet; hold the reaction for a bounded
                    // window in case the message is in flight
                    debug!(message_id = %message_id, "buffering reaction for unknown message");
                    inner.pending_reactions.push(BufferedReaction {
                        message_id,
                        reaction,
                        buffered_at: Instant::now(),
                    });
                    None
                }
            }
        };
        if let Some(message) = updated {
            self.bus.publish(RoomEvent::MessageUpdated { message });
        }
    }

    /// Apply buffered reactions that were waiting for this message
    async fn flush_buffered_reactions(&self, target: &Message) {
        let updated = {
            let mut inner = self.inner.write().await;
            let mut matched = Vec::new();
            inner.pending_reactions.retain(|buffered| {
                if target.matches(&buffered.message_id) {
                    matched.push(buffered.reaction.clone());
                    false
                } else {
                    true
                }
            });
            if matched.is_empty() {
                None
            } else {
                inner
                    .messages
                    .iter_mut()
                    .find(|m| m.client_id == target.client_id)
                    .map(|entry| {
                        for reaction in matched {
                            if !entry.reactions.contains(&reaction) {
                                entry.reactions.push(reaction);
                            }
                        }
                        entry.clone()
                    })
            }
        };
        if let Some(message) = updated {
            self.bus.publish(RoomEvent::MessageUpdated { message });
        }
    }

    async fn purge_stale_reactions(&self) {
        let window = self.config.reaction_buffer_window;
        let mut inner = self.inner.write().await;
        let before = inner.pending_reactions.len();
        inner
            .pending_reactions
            .retain(|b| b.buffered_at.elapsed() < window);
        let dropped = before - inner.pending_reactions.len();
        if dropped > 0 {
            debug!(dropped, "discarded expired buffered reactions");
        }
    }

    async fn insert_ordered(&self, message: Message) {
        {
            let mut inner = self.inner.write().await;
            let pos = inner
                .messages
                .partition_point(|m| m.order_key() < message.order_key());
            inner.messages.insert(pos, message.clone());
        }
        self.bus.publish(RoomEvent::MessageUpdated { message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnectionState, Identity};
    use crate::transport::InMemoryServer;
    use std::time::Duration;

    async fn connected_sync(server: &InMemoryServer, config: SyncConfig) -> MessageSynchronizer {
        let bus = EventBus::default();
        let connection = ConnectionManager::new(
            "conv-1",
            Identity::new("alice", "tok-alice"),
            config.clone(),
            Arc::new(server.clone()),
            bus.clone(),
        );
        let sync = MessageSynchronizer::new("conv-1", "alice", config, connection.clone(), bus);
        sync.start().await;
        connection.connect().await.unwrap();
        for _ in 0..100 {
            if connection.state().await == ConnectionState::Connected {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        sync
    }

    #[tokio::test]
    async fn finished_watchdogs_are_reaped() {
        let server = InMemoryServer::new();
        let config = SyncConfig {
            send_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let sync = connected_sync(&server, config).await;

        for i in 0..20 {
            sync.send(&format!("point {}", i), DebatePhase::Opening).await;
        }
        sleep(Duration::from_millis(150)).await;

        // Arming the next watchdog reaps every handle that already finished,
        // leaving at most the inbound pump and the fresh watchdog
        sync.send("closing point", DebatePhase::Closing).await;
        let alive = sync.tasks.lock().await.len();
        assert!(alive <= 2, "dead watchdog handles retained: {}", alive);
        sync.close().await;
    }

    #[tokio::test]
    async fn stale_watchdog_cannot_fail_a_rearmed_send() {
        let server = InMemoryServer::new();
        let config = SyncConfig {
            send_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let sync = connected_sync(&server, config).await;

        server.set_drop_sends(true).await;
        let sent = sync.send("anyone there?", DebatePhase::Rebuttal).await;

        // Re-arm shortly before the first timer lapses, as retry does
        sleep(Duration::from_millis(60)).await;
        sync.arm_watchdog(sent.client_id.clone()).await;

        // First timer lapses; the superseded watchdog must stand down
        sleep(Duration::from_millis(80)).await;
        assert_eq!(
            sync.get(&sent.client_id).await.unwrap().status,
            MessageStatus::Sending
        );

        // The re-armed watchdog still bounds the wait
        sleep(Duration::from_millis(80)).await;
        assert_eq!(
            sync.get(&sent.client_id).await.unwrap().status,
            MessageStatus::Failed
        );
        sync.close().await;
    }
}
