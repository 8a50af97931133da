/// Configuration for the sync core
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs for one room subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Presence heartbeat interval
    pub heartbeat_interval: Duration,

    /// Typing indicator auto-expiry (applies locally and to peers)
    pub typing_timeout: Duration,

    /// How long an optimistic send waits for its ack before flipping to failed
    pub send_timeout: Duration,

    /// Base reconnect backoff delay (attempt 0)
    pub backoff_base: Duration,

    /// Maximum reconnect backoff cap
    pub backoff_max: Duration,

    /// Reconnect attempts before the connection is marked failed
    pub max_reconnect_attempts: u32,

    /// How long an unmatched inbound reaction is buffered before being dropped
    pub reaction_buffer_window: Duration,

    /// Default history page size
    pub page_size: usize,

    /// Auto-dismiss delay for transient notifications
    pub notification_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            typing_timeout: Duration::from_secs(3),
            send_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            reaction_buffer_window: Duration::from_secs(30),
            page_size: 50,
            notification_ttl: Duration::from_secs(5),
        }
    }
}

impl SyncConfig {
    /// Peers missing heartbeats for longer than this are considered offline
    pub fn presence_stale_after(&self) -> Duration {
        self.heartbeat_interval * 2
    }

    /// Apply environment overrides (nice for scripts and demos)
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_ms("DEBATEROOM_HEARTBEAT_MS") {
            self.heartbeat_interval = ms;
        }
        if let Some(ms) = env_ms("DEBATEROOM_TYPING_TIMEOUT_MS") {
            self.typing_timeout = ms;
        }
        if let Some(ms) = env_ms("DEBATEROOM_SEND_TIMEOUT_MS") {
            self.send_timeout = ms;
        }
        if let Some(n) = std::env::var("DEBATEROOM_MAX_RECONNECTS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
        {
            self.max_reconnect_attempts = n;
        }
        self
    }
}

fn env_ms(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}
