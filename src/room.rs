/// Room session: composition root for one conversation subscription
///
/// Builds the connection, synchronizer, presence tracker, pager, and
/// notification dispatcher for one (conversation, identity) pair and owns
/// their teardown. Switching conversations means closing this session and
/// joining a new one; `close()` cancels every timer and pending fetch so no
/// state leaks across conversations.
use crate::config::SyncConfig;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::events::{EventBus, RoomEvent};
use crate::history::HistoryPager;
use crate::model::Identity;
use crate::notify::NotificationDispatcher;
use crate::presence::PresenceTracker;
use crate::sync::MessageSynchronizer;
use crate::transport::{HistoryBackend, Transport};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

pub struct RoomSession {
    conversation_id: String,
    bus: EventBus,
    connection: ConnectionManager,
    sync: MessageSynchronizer,
    presence: PresenceTracker,
    pager: HistoryPager,
    notifications: NotificationDispatcher,
}

impl RoomSession {
    /// Join a conversation: wire up all components and start their tasks
    pub async fn join(
        conversation_id: &str,
        identity: Identity,
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        history: Arc<dyn HistoryBackend>,
    ) -> Result<Self> {
        info!(conversation = conversation_id, user = %identity.user_id, "joining room");

        let bus = EventBus::default();
        let connection = ConnectionManager::new(
            conversation_id,
            identity.clone(),
            config.clone(),
            transport,
            bus.clone(),
        );
        let sync = MessageSynchronizer::new(
            conversation_id,
            &identity.user_id,
            config.clone(),
            connection.clone(),
            bus.clone(),
        );
        let presence = PresenceTracker::new(
            &identity.user_id,
            config.clone(),
            connection.clone(),
            bus.clone(),
        );
        let pager = HistoryPager::new(conversation_id, config.clone(), history, sync.clone());
        let notifications = NotificationDispatcher::new(config, bus.clone());

        // Subscribers first, then the connection, so no inbound event is
        // published before anyone listens
        sync.start().await;
        presence.start().await;
        notifications.start().await;
        connection.connect().await?;

        Ok(Self {
            conversation_id: conversation_id.to_string(),
            bus,
            connection,
            sync,
            presence,
            pager,
            notifications,
        })
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn sync(&self) -> &MessageSynchronizer {
        &self.sync
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn pager(&self) -> &HistoryPager {
        &self.pager
    }

    pub fn notifications(&self) -> &NotificationDispatcher {
        &self.notifications
    }

    /// Observe the room event stream
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.bus.subscribe()
    }

    /// Tear the session down: cancel timers, watchdogs, and pending
    /// fetches before the transport is released
    pub async fn close(&self) {
        info!(conversation = %self.conversation_id, "closing room session");
        self.pager.close().await;
        self.presence.close().await;
        self.sync.close().await;
        self.notifications.close().await;
        self.connection.disconnect().await;
    }
}
