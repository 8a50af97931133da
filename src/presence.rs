/// Presence tracker: heartbeats, liveness grace periods, typing timeouts
///
/// Peers are online while a heartbeat was seen within twice the heartbeat
/// interval, then flip offline without waiting for an explicit disconnect.
/// Typing auto-expires after `typing_timeout` whether or not a stop signal
/// ever arrives; lost stop-typing events must never leave a stale indicator.
use crate::config::SyncConfig;
use crate::connection::ConnectionManager;
use crate::events::{EventBus, RoomEvent};
use crate::model::{ConnectionState, ParticipantPresence};
use crate::transport::{ClientCommand, ServerEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

struct ParticipantEntry {
    presence: ParticipantPresence,
    last_heartbeat: Option<Instant>,
    typing_set_at: Option<Instant>,
}

struct PresenceInner {
    participants: HashMap<String, ParticipantEntry>,
    local_online: bool,
    local_typing: bool,
    local_typing_set_at: Option<Instant>,
}

#[derive(Clone)]
pub struct PresenceTracker {
    user_id: String,
    config: SyncConfig,
    connection: ConnectionManager,
    bus: EventBus,
    inner: Arc<RwLock<PresenceInner>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl PresenceTracker {
    pub fn new(
        user_id: &str,
        config: SyncConfig,
        connection: ConnectionManager,
        bus: EventBus,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            config,
            connection,
            bus,
            inner: Arc::new(RwLock::new(PresenceInner {
                participants: HashMap::new(),
                local_online: true,
                local_typing: false,
                local_typing_set_at: None,
            })),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn the heartbeat, sweep, and inbound tasks; call once per session
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;

        let tracker = self.clone();
        tasks.push(tokio::spawn(async move { tracker.run_heartbeat().await }));

        let tracker = self.clone();
        tasks.push(tokio::spawn(async move { tracker.run_sweep().await }));

        let tracker = self.clone();
        let inbound = self.connection.subscribe_inbound();
        tasks.push(tokio::spawn(async move { tracker.run_inbound(inbound).await }));
    }

    pub async fn close(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Set the local online state. Going online sends an immediate
    /// heartbeat; going offline simply stops heartbeating and lets peers
    /// age us out through the grace period.
    pub async fn update_presence(&self, is_online: bool) {
        self.inner.write().await.local_online = is_online;
        if is_online {
            self.send_heartbeat().await;
        }
    }

    /// Set the local typing state. Best effort on the wire: the timeout
    /// sweep guarantees expiry locally and remotely even if this signal is
    /// lost.
    pub async fn update_typing(&self, is_typing: bool) {
        {
            let mut inner = self.inner.write().await;
            inner.local_typing = is_typing;
            inner.local_typing_set_at = is_typing.then(Instant::now);
        }
        if let Err(e) = self
            .connection
            .send(ClientCommand::TypingSet { is_typing })
            .await
        {
            debug!(error = %e, "typing signal not sent");
        }
        self.publish_typing().await;
    }

    pub async fn participant(&self, user_id: &str) -> Option<ParticipantPresence> {
        self.inner
            .read()
            .await
            .participants
            .get(user_id)
            .map(|e| e.presence.clone())
    }

    pub async fn participants(&self) -> Vec<ParticipantPresence> {
        self.inner
            .read()
            .await
            .participants
            .values()
            .map(|e| e.presence.clone())
            .collect()
    }

    /// Everyone currently typing, the local user included
    pub async fn typing_users(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut users: Vec<String> = inner
            .participants
            .values()
            .filter(|e| e.presence.is_typing)
            .map(|e| e.presence.user_id.clone())
            .collect();
        if inner.local_typing && !users.iter().any(|u| u == &self.user_id) {
            users.push(self.user_id.clone());
        }
        users.sort();
        users
    }

    // ─── Tasks ───────────────────────────────────────────────────────────────

    async fn run_heartbeat(&self) {
        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let online = self.inner.read().await.local_online;
            if online && self.connection.state().await == ConnectionState::Connected {
                self.send_heartbeat().await;
            }
        }
    }

    async fn send_heartbeat(&self) {
        let command = ClientCommand::Heartbeat {
            sent_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.connection.send(command).await {
            debug!(error = %e, "heartbeat not sent");
        }
    }

    /// Expire stale peers and stale typing indicators
    async fn run_sweep(&self) {
        let stale_after = self.config.presence_stale_after();
        let typing_timeout = self.config.typing_timeout;
        let period = (typing_timeout.min(self.config.heartbeat_interval)) / 4;
        let mut ticker = interval(period.max(std::time::Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let mut presence_changes = Vec::new();
            let mut typing_changed = false;
            let mut local_typing_expired = false;
            {
                let mut inner = self.inner.write().await;
                for entry in inner.participants.values_mut() {
                    let heartbeat_stale = entry
                        .last_heartbeat
                        .map(|at| at.elapsed() > stale_after)
                        .unwrap_or(false);
                    if heartbeat_stale && entry.presence.is_online {
                        entry.presence.is_online = false;
                        if entry.presence.is_typing {
                            entry.presence.is_typing = false;
                            typing_changed = true;
                        }
                        presence_changes.push(entry.presence.clone());
                        continue;
                    }
                    let typing_stale = entry
                        .typing_set_at
                        .map(|at| at.elapsed() > typing_timeout)
                        .unwrap_or(false);
                    if typing_stale && entry.presence.is_typing {
                        entry.presence.is_typing = false;
                        entry.typing_set_at = None;
                        typing_changed = true;
                        presence_changes.push(entry.presence.clone());
                    }
                }

                let local_stale = inner
                    .local_typing_set_at
                    .map(|at| at.elapsed() > typing_timeout)
                    .unwrap_or(false);
                if inner.local_typing && local_stale {
                    inner.local_typing = false;
                    inner.local_typing_set_at = None;
                    typing_changed = true;
                    local_typing_expired = true;
                }
            }

            for presence in presence_changes {
                self.bus.publish(RoomEvent::PresenceChanged { presence });
            }
            if local_typing_expired {
                // Tell peers the local indicator expired; their own sweep
                // covers us if this is lost
                let _ = self
                    .connection
                    .send(ClientCommand::TypingSet { is_typing: false })
                    .await;
            }
            if typing_changed {
                self.publish_typing().await;
            }
        }
    }

    async fn run_inbound(
        &self,
        mut inbound: tokio::sync::broadcast::Receiver<ServerEvent>,
    ) {
        loop {
            match inbound.recv().await {
                Ok(ServerEvent::PresenceUpdate {
                    user_id,
                    is_online,
                    timestamp_ms,
                }) => {
                    self.apply_presence(&user_id, is_online, timestamp_ms).await;
                }
                Ok(ServerEvent::TypingUpdate { user_id, is_typing }) => {
                    self.apply_typing(&user_id, is_typing).await;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "presence pump lagged");
                }
                Err(_) => break,
            }
        }
    }

    async fn apply_presence(&self, user_id: &str, is_online: bool, timestamp_ms: i64) {
        let presence = {
            let mut inner = self.inner.write().await;
            let entry = inner
                .participants
                .entry(user_id.to_string())
                .or_insert_with(|| ParticipantEntry {
                    presence: ParticipantPresence::new(user_id),
                    last_heartbeat: None,
                    typing_set_at: None,
                });
            entry.presence.is_online = is_online;
            entry.presence.last_seen_ms = Some(timestamp_ms);
            if is_online {
                entry.last_heartbeat = Some(Instant::now());
            } else {
                // Offline implies not typing
                entry.presence.is_typing = false;
                entry.typing_set_at = None;
            }
            entry.presence.clone()
        };
        self.bus.publish(RoomEvent::PresenceChanged { presence });
    }

    async fn apply_typing(&self, user_id: &str, is_typing: bool) {
        {
            let mut inner = self.inner.write().await;
            let entry = inner
                .participants
                .entry(user_id.to_string())
                .or_insert_with(|| ParticipantEntry {
                    presence: ParticipantPresence::new(user_id),
                    last_heartbeat: None,
                    typing_set_at: None,
                });
            entry.presence.is_typing = is_typing;
            entry.typing_set_at = is_typing.then(Instant::now);
            if is_typing {
                // Typing implies online
                entry.presence.is_online = true;
                entry.last_heartbeat = Some(Instant::now());
            }
        }
        self.publish_typing().await;
    }

    async fn publish_typing(&self) {
        let user_ids = self.typing_users().await;
        self.bus.publish(RoomEvent::TypingChanged { user_ids });
    }
}
