/// Connection manager: one transport channel per conversation
///
/// Owns the transport handle exclusively. Every other component sends
/// through `send()` and observes inbound envelopes via `subscribe_inbound()`;
/// reconnection policy lives here and nowhere else.
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, RoomEvent};
use crate::model::{ConnectionState, Identity};
use crate::transport::{ClientCommand, ServerEvent, Transport};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Control signals from the handle to the supervisor task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Suspend,
    Resume,
    Reconnect,
    Disconnect,
}

struct ConnInner {
    state: ConnectionState,
    /// Consecutive failed attempts since the last successful connect
    reconnect_attempt: u32,
    /// Round trip of the most recent heartbeat echo
    last_latency: Option<Duration>,
    command_tx: Option<mpsc::Sender<ClientCommand>>,
}

/// Per-conversation connection actor
#[derive(Clone)]
pub struct ConnectionManager {
    conversation_id: String,
    identity: Identity,
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    inbound: broadcast::Sender<ServerEvent>,
    inner: Arc<RwLock<ConnInner>>,
    control_tx: mpsc::Sender<Control>,
    control_rx: Arc<Mutex<Option<mpsc::Receiver<Control>>>>,
    supervisor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionManager {
    pub fn new(
        conversation_id: &str,
        identity: Identity,
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        bus: EventBus,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::channel(16);
        let (inbound, _) = broadcast::channel(256);
        Self {
            conversation_id: conversation_id.to_string(),
            identity,
            config,
            transport,
            bus,
            inbound,
            inner: Arc::new(RwLock::new(ConnInner {
                state: ConnectionState::Connecting,
                reconnect_attempt: 0,
                last_latency: None,
                command_tx: None,
            })),
            control_tx,
            control_rx: Arc::new(Mutex::new(Some(control_rx))),
            supervisor: Arc::new(Mutex::new(None)),
        }
    }

    /// Subscribe to raw inbound envelopes from the streaming channel
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<ServerEvent> {
        self.inbound.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.read().await.state
    }

    pub async fn reconnect_attempt(&self) -> u32 {
        self.inner.read().await.reconnect_attempt
    }

    pub async fn last_latency(&self) -> Option<Duration> {
        self.inner.read().await.last_latency
    }

    /// Queue a command onto the streaming channel.
    ///
    /// Fails fast when the connection is failed or torn down rather than
    /// queueing indefinitely.
    pub async fn send(&self, command: ClientCommand) -> Result<()> {
        let (tx, state) = {
            let inner = self.inner.read().await;
            (inner.command_tx.clone(), inner.state)
        };
        match tx {
            Some(tx) if state == ConnectionState::Connected => tx
                .send(command)
                .await
                .map_err(|_| SyncError::Network("streaming channel closed".to_string())),
            _ => {
                debug!(
                    conversation = %self.conversation_id,
                    command = command.command_type(),
                    ?state,
                    "command dropped; not connected"
                );
                match state {
                    ConnectionState::Failed => Err(SyncError::Closed(
                        "connection failed; manual reconnect required".to_string(),
                    )),
                    other => Err(SyncError::Network(format!(
                        "not connected (state: {:?})",
                        other
                    ))),
                }
            }
        }
    }

    /// Start the supervisor task; idempotent per manager instance
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.supervisor.lock().await;
        if guard.is_some() {
            return Err(SyncError::Validation("already connected".to_string()));
        }
        let control_rx = self
            .control_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| SyncError::Closed("connection already torn down".to_string()))?;
        let manager = self.clone();
        *guard = Some(tokio::spawn(async move {
            manager.run(control_rx).await;
        }));
        Ok(())
    }

    /// Manual reconnect: resets the attempt budget and skips any pending
    /// backoff delay. The only way out of `Failed`.
    pub async fn reconnect(&self) -> Result<()> {
        self.control_tx
            .send(Control::Reconnect)
            .await
            .map_err(|_| SyncError::Closed("connection torn down".to_string()))
    }

    /// Pause the transport (backgrounded tab); resumable without a handshake
    pub async fn suspend(&self) -> Result<()> {
        self.control_tx
            .send(Control::Suspend)
            .await
            .map_err(|_| SyncError::Closed("connection torn down".to_string()))
    }

    pub async fn resume(&self) -> Result<()> {
        self.control_tx
            .send(Control::Resume)
            .await
            .map_err(|_| SyncError::Closed("connection torn down".to_string()))
    }

    /// Tear down the subscription; cancels the supervisor and any pending
    /// backoff timer
    pub async fn disconnect(&self) {
        let _ = self.control_tx.send(Control::Disconnect).await;
        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let mut inner = self.inner.write().await;
        inner.command_tx = None;
    }

    async fn set_state(&self, state: ConnectionState) {
        let attempt = {
            let mut inner = self.inner.write().await;
            if inner.state == state {
                return;
            }
            inner.state = state;
            inner.reconnect_attempt
        };
        debug!(
            conversation = %self.conversation_id,
            ?state, attempt, "connection state changed"
        );
        self.bus.publish(RoomEvent::StateChanged {
            state,
            reconnect_attempt: attempt,
        });
    }

    /// Exponential backoff with full jitter, capped
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        let raw = self
            .config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.config.backoff_max);
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        raw.mul_f64(jitter)
    }

    /// Supervisor loop: the only place connection state ever transitions,
    /// which keeps transitions strictly sequential.
    async fn run(self, mut control_rx: mpsc::Receiver<Control>) {
        info!(conversation = %self.conversation_id, "subscribing to room");

        'outer: loop {
            self.set_state(ConnectionState::Connecting).await;
            let attempt = self.inner.read().await.reconnect_attempt;
            debug!(conversation = %self.conversation_id, attempt, "opening transport");

            match self
                .transport
                .open(&self.conversation_id, &self.identity)
                .await
            {
                Ok(mut channel) => {
                    {
                        let mut inner = self.inner.write().await;
                        inner.reconnect_attempt = 0;
                        inner.command_tx = Some(channel.commands.clone());
                    }
                    self.set_state(ConnectionState::Connected).await;
                    info!(conversation = %self.conversation_id, "connected");

                    // Pump inbound events until the transport drops or a
                    // control signal interrupts
                    let outcome = self.pump(&mut channel.events, &mut control_rx).await;
                    self.inner.write().await.command_tx = None;

                    match outcome {
                        PumpOutcome::Dropped => {
                            warn!(conversation = %self.conversation_id, "transport dropped");
                            self.set_state(ConnectionState::Disconnected).await;
                        }
                        PumpOutcome::AuthFailed => {
                            self.set_state(ConnectionState::Failed).await;
                            if !self.wait_for_manual_reconnect(&mut control_rx).await {
                                break 'outer;
                            }
                            continue 'outer;
                        }
                        PumpOutcome::Reconnect => {
                            self.inner.write().await.reconnect_attempt = 0;
                            continue 'outer;
                        }
                        PumpOutcome::Teardown => break 'outer,
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(conversation = %self.conversation_id, error = %e, "connect attempt failed");
                    self.bus.publish(RoomEvent::ConnectionError {
                        message: e.to_string(),
                        retryable: true,
                    });
                    self.set_state(ConnectionState::Disconnected).await;
                }
                Err(e) => {
                    // Auth and permission errors will not be fixed by retrying
                    error!(conversation = %self.conversation_id, error = %e, "non-retryable connect error");
                    self.bus.publish(RoomEvent::ConnectionError {
                        message: e.to_string(),
                        retryable: false,
                    });
                    self.set_state(ConnectionState::Failed).await;
                    if !self.wait_for_manual_reconnect(&mut control_rx).await {
                        break 'outer;
                    }
                    continue 'outer;
                }
            }

            // Retry path: consume one attempt, then back off or give up
            let attempts = {
                let mut inner = self.inner.write().await;
                inner.reconnect_attempt += 1;
                inner.reconnect_attempt
            };

            if attempts >= self.config.max_reconnect_attempts {
                error!(
                    conversation = %self.conversation_id,
                    attempts, "reconnect budget exhausted"
                );
                self.bus.publish(RoomEvent::ConnectionError {
                    message: format!("gave up after {} attempts", attempts),
                    retryable: false,
                });
                self.set_state(ConnectionState::Failed).await;
                if !self.wait_for_manual_reconnect(&mut control_rx).await {
                    break 'outer;
                }
                continue 'outer;
            }

            let delay = self.backoff_delay(attempts);
            debug!(conversation = %self.conversation_id, attempts, ?delay, "backing off");
            tokio::select! {
                _ = sleep(delay) => {}
                ctrl = control_rx.recv() => match ctrl {
                    Some(Control::Reconnect) => {
                        self.inner.write().await.reconnect_attempt = 0;
                    }
                    Some(Control::Suspend) => {
                        self.set_state(ConnectionState::Suspended).await;
                        if !self.wait_for_resume(&mut control_rx).await {
                            break 'outer;
                        }
                    }
                    Some(Control::Resume) => {}
                    Some(Control::Disconnect) | None => break 'outer,
                },
            }
        }

        self.set_state(ConnectionState::Disconnected).await;
        info!(conversation = %self.conversation_id, "room subscription closed");
    }

    /// Read-loop over the open channel; returns why it stopped
    async fn pump(
        &self,
        events: &mut mpsc::Receiver<ServerEvent>,
        control_rx: &mut mpsc::Receiver<Control>,
    ) -> PumpOutcome {
        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => {
                        if let Some(outcome) = self.handle_event(event).await {
                            return outcome;
                        }
                    }
                    None => return PumpOutcome::Dropped,
                },
                ctrl = control_rx.recv() => match ctrl {
                    Some(Control::Suspend) => {
                        // Keep the channel open; inbound events queue in the
                        // transport buffer until resume
                        self.set_state(ConnectionState::Suspended).await;
                        if !self.wait_for_resume(control_rx).await {
                            return PumpOutcome::Teardown;
                        }
                        self.set_state(ConnectionState::Connecting).await;
                        self.set_state(ConnectionState::Connected).await;
                    }
                    Some(Control::Reconnect) => return PumpOutcome::Reconnect,
                    Some(Control::Resume) => {}
                    Some(Control::Disconnect) | None => return PumpOutcome::Teardown,
                },
            }
        }
    }

    /// Handle one inbound envelope; Some(outcome) stops the pump
    async fn handle_event(&self, event: ServerEvent) -> Option<PumpOutcome> {
        match &event {
            ServerEvent::HeartbeatAck { sent_at_ms } => {
                let now = chrono::Utc::now().timestamp_millis();
                let rtt = Duration::from_millis(now.saturating_sub(*sent_at_ms).max(0) as u64);
                self.inner.write().await.last_latency = Some(rtt);
            }
            ServerEvent::Error { category, message } => {
                if category == "auth" || category == "permission" {
                    error!(
                        conversation = %self.conversation_id,
                        category = %category, message = %message, "backend rejected session"
                    );
                    self.bus.publish(RoomEvent::ConnectionError {
                        message: message.clone(),
                        retryable: false,
                    });
                    return Some(PumpOutcome::AuthFailed);
                }
                warn!(conversation = %self.conversation_id, category = %category, message = %message, "backend error");
                self.bus.publish(RoomEvent::ConnectionError {
                    message: message.clone(),
                    retryable: true,
                });
            }
            _ => {}
        }
        // Fan the envelope out to the synchronizer and presence tracker
        let _ = self.inbound.send(event);
        None
    }

    /// Park in `Failed` until a manual reconnect; false means teardown
    async fn wait_for_manual_reconnect(&self, control_rx: &mut mpsc::Receiver<Control>) -> bool {
        loop {
            match control_rx.recv().await {
                Some(Control::Reconnect) => {
                    self.inner.write().await.reconnect_attempt = 0;
                    return true;
                }
                Some(Control::Disconnect) | None => return false,
                Some(Control::Suspend) | Some(Control::Resume) => {}
            }
        }
    }

    /// Park in `Suspended` until resume; false means teardown
    async fn wait_for_resume(&self, control_rx: &mut mpsc::Receiver<Control>) -> bool {
        loop {
            match control_rx.recv().await {
                Some(Control::Resume) | Some(Control::Reconnect) => return true,
                Some(Control::Disconnect) | None => return false,
                Some(Control::Suspend) => {}
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpOutcome {
    /// Transport closed the event stream
    Dropped,
    /// Backend rejected the session; only manual reconnect helps
    AuthFailed,
    /// Manual reconnect requested while connected
    Reconnect,
    /// Explicit disconnect
    Teardown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryServer;

    fn manager(server: &InMemoryServer, config: SyncConfig) -> ConnectionManager {
        ConnectionManager::new(
            "conv-1",
            Identity::new("alice", "tok-alice"),
            config,
            Arc::new(server.clone()),
            EventBus::default(),
        )
    }

    #[tokio::test]
    async fn backoff_grows_and_caps() {
        let server = InMemoryServer::new();
        let config = SyncConfig {
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(800),
            ..Default::default()
        };
        let mgr = manager(&server, config);

        for attempt in 0..10 {
            let d = mgr.backoff_delay(attempt);
            // Full jitter keeps the delay within [0.5, 1.0] of the capped raw value
            assert!(d <= Duration::from_millis(800));
            assert!(d >= Duration::from_millis(50));
        }
        assert!(mgr.backoff_delay(0) <= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn send_fails_fast_before_connect() {
        let server = InMemoryServer::new();
        let mgr = manager(&server, SyncConfig::default());
        let err = mgr
            .send(ClientCommand::TypingSet { is_typing: true })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));
    }
}
