#![allow(dead_code)]
// Shared helpers for integration tests
use debateroom_core::{
    ConnectionManager, ConnectionState, DebatePhase, Message, MessageKind, MessageStatus,
    MessageSynchronizer, SyncConfig,
};
use std::time::Duration;
use tokio::time::sleep;

/// Short durations so tests finish quickly while leaving generous margins
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        heartbeat_interval: Duration::from_millis(50),
        typing_timeout: Duration::from_millis(150),
        send_timeout: Duration::from_millis(200),
        backoff_base: Duration::from_millis(20),
        backoff_max: Duration::from_millis(40),
        max_reconnect_attempts: 3,
        reaction_buffer_window: Duration::from_millis(200),
        page_size: 20,
        notification_ttl: Duration::from_millis(200),
    }
}

/// Poll until the connection reaches `state`, up to `timeout_ms`
pub async fn wait_for_state(
    connection: &ConnectionManager,
    state: ConnectionState,
    timeout_ms: u64,
) -> bool {
    for _ in 0..(timeout_ms / 10).max(1) {
        if connection.state().await == state {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll until the message identified by `key` reaches `status`
pub async fn wait_for_status(
    sync: &MessageSynchronizer,
    key: &str,
    status: MessageStatus,
    timeout_ms: u64,
) -> bool {
    for _ in 0..(timeout_ms / 10).max(1) {
        if sync.get(key).await.map(|m| m.status) == Some(status) {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

/// A delivered historical message for seeding the loopback archive
pub fn archived(conversation_id: &str, seq: u32, timestamp_ms: i64, content: &str) -> Message {
    Message {
        id: Some(format!("hist-{}", seq)),
        client_id: format!("hc-{:06}", seq),
        conversation_id: conversation_id.to_string(),
        author_id: "carol".to_string(),
        content: content.to_string(),
        timestamp_ms,
        phase: DebatePhase::Opening,
        kind: MessageKind::User,
        status: MessageStatus::Delivered,
        is_optimistic: false,
        reply_to_message_id: None,
        reactions: Vec::new(),
    }
}
