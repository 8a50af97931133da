/// Notification dispatcher: projects room events into transient UI notices
///
/// Pure consumer of the event bus; holds no authoritative state. Connection
/// degradation stays visible until resolved; everything else auto-dismisses.
use crate::config::SyncConfig;
use crate::events::{EventBus, RoomEvent};
use crate::model::ConnectionState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub severity: Severity,
    pub text: String,
    /// Persistent notifications survive until dismissed or superseded
    pub persistent: bool,
    pub created_at_ms: i64,
}

/// Stable id for the single connection-quality notice so reconnect cycles
/// replace it instead of stacking duplicates
const CONNECTION_NOTICE_ID: &str = "connection";

struct ActiveNotification {
    notification: Notification,
    shown_at: Instant,
}

struct NotifyInner {
    active: Vec<ActiveNotification>,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    config: SyncConfig,
    bus: EventBus,
    inner: Arc<RwLock<NotifyInner>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl NotificationDispatcher {
    pub fn new(config: SyncConfig, bus: EventBus) -> Self {
        Self {
            config,
            bus,
            inner: Arc::new(RwLock::new(NotifyInner { active: Vec::new() })),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn the bus consumer and the auto-dismiss sweep
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;

        let dispatcher = self.clone();
        let mut events = self.bus.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => dispatcher.handle_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        }));

        let dispatcher = self.clone();
        tasks.push(tokio::spawn(async move { dispatcher.run_sweep().await }));
    }

    pub async fn close(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Currently visible notifications
    pub async fn active(&self) -> Vec<Notification> {
        self.inner
            .read()
            .await
            .active
            .iter()
            .map(|a| a.notification.clone())
            .collect()
    }

    /// Explicit user dismissal
    pub async fn dismiss(&self, id: &str) {
        self.inner
            .write()
            .await
            .active
            .retain(|a| a.notification.id != id);
    }

    async fn handle_event(&self, event: RoomEvent) {
        match event {
            RoomEvent::StateChanged { state, reconnect_attempt } => match state {
                ConnectionState::Disconnected => {
                    self.upsert(
                        CONNECTION_NOTICE_ID,
                        Severity::Warning,
                        "Connection lost, reconnecting…",
                        true,
                    )
                    .await;
                }
                ConnectionState::Connecting if reconnect_attempt > 0 => {
                    self.upsert(
                        CONNECTION_NOTICE_ID,
                        Severity::Warning,
                        &format!("Reconnecting (attempt {})…", reconnect_attempt),
                        true,
                    )
                    .await;
                }
                ConnectionState::Failed => {
                    self.upsert(
                        CONNECTION_NOTICE_ID,
                        Severity::Error,
                        "Connection failed. Retry to continue.",
                        true,
                    )
                    .await;
                }
                ConnectionState::Connected => {
                    let had_notice = self
                        .inner
                        .read()
                        .await
                        .active
                        .iter()
                        .any(|a| a.notification.id == CONNECTION_NOTICE_ID);
                    self.dismiss(CONNECTION_NOTICE_ID).await;
                    if had_notice {
                        self.push(Severity::Info, "Reconnected", false).await;
                    }
                }
                ConnectionState::Suspended | ConnectionState::Connecting => {}
            },
            RoomEvent::ConnectionError { message, retryable } => {
                if !retryable {
                    self.upsert(CONNECTION_NOTICE_ID, Severity::Error, &message, true)
                        .await;
                }
            }
            RoomEvent::PhaseChanged { phase } => {
                self.push(
                    Severity::Info,
                    &format!("Debate phase changed: {:?}", phase),
                    false,
                )
                .await;
            }
            _ => {}
        }
    }

    async fn push(&self, severity: Severity, text: &str, persistent: bool) {
        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            severity,
            text: text.to_string(),
            persistent,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        self.inner.write().await.active.push(ActiveNotification {
            notification,
            shown_at: Instant::now(),
        });
    }

    /// Replace-or-insert under a stable id
    async fn upsert(&self, id: &str, severity: Severity, text: &str, persistent: bool) {
        let notification = Notification {
            id: id.to_string(),
            severity,
            text: text.to_string(),
            persistent,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        let mut inner = self.inner.write().await;
        inner.active.retain(|a| a.notification.id != id);
        inner.active.push(ActiveNotification {
            notification,
            shown_at: Instant::now(),
        });
    }

    async fn run_sweep(&self) {
        let ttl = self.config.notification_ttl;
        let mut ticker = interval((ttl / 4).max(std::time::Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let mut inner = self.inner.write().await;
            inner
                .active
                .retain(|a| a.notification.persistent || a.shown_at.elapsed() < ttl);
        }
    }
}
