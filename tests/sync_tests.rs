/// Optimistic pipeline, reconciliation, ordering, and reaction tests
mod common;

use common::{fast_config, wait_for_state, wait_for_status};
use debateroom_core::{
    ConnectionState, DebatePhase, Identity, InMemoryServer, MessageKind, MessageStatus,
    RoomSession, ServerEvent, SyncConfig, SyncError, WireMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

async fn join(server: &InMemoryServer, conversation: &str, user: &str) -> RoomSession {
    join_with(server, conversation, user, fast_config()).await
}

async fn join_with(
    server: &InMemoryServer,
    conversation: &str,
    user: &str,
    config: SyncConfig,
) -> RoomSession {
    let session = RoomSession::join(
        conversation,
        Identity::new(user, &format!("tok-{}", user)),
        config,
        Arc::new(server.clone()),
        Arc::new(server.clone()),
    )
    .await
    .unwrap();
    assert!(wait_for_state(session.connection(), ConnectionState::Connected, 1000).await);
    session
}

fn peer_message(conversation: &str, id: &str, client_id: &str, ts: i64, content: &str) -> ServerEvent {
    ServerEvent::MessageCreated {
        message: WireMessage {
            id: id.to_string(),
            client_id: Some(client_id.to_string()),
            conversation_id: conversation.to_string(),
            author_id: "peer".to_string(),
            content: content.to_string(),
            timestamp_ms: ts,
            phase: DebatePhase::Rebuttal,
            kind: MessageKind::User,
            reply_to_message_id: None,
            reactions: Vec::new(),
        },
    }
}

#[tokio::test]
async fn optimistic_send_reconciles_without_duplicates() {
    let server = InMemoryServer::new();
    let session = join(&server, "c-send", "alice").await;

    let sent = session.sync().send("hello", DebatePhase::Opening).await;
    // Instant feedback: the optimistic entry is visible before any ack
    let snapshot = session.sync().messages().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].status, MessageStatus::Sending);
    assert!(snapshot[0].is_optimistic);

    assert!(wait_for_status(session.sync(), &sent.client_id, MessageStatus::Delivered, 1000).await);

    let snapshot = session.sync().messages().await;
    assert_eq!(snapshot.len(), 1, "reconciliation must not duplicate");
    assert_eq!(snapshot[0].client_id, sent.client_id);
    assert!(snapshot[0].id.is_some());
    assert!(!snapshot[0].is_optimistic);

    session.close().await;
}

#[tokio::test]
async fn out_of_order_arrival_yields_timestamp_order() {
    let server = InMemoryServer::new();
    let session = join(&server, "c-order", "alice").await;

    // A sent at t=100 arrives first; B sent at t=99 arrives later
    server
        .push_event("c-order", peer_message("c-order", "srv-a", "ca", 100, "A"))
        .await;
    server
        .push_event("c-order", peer_message("c-order", "srv-b", "cb", 99, "B"))
        .await;

    sleep(Duration::from_millis(100)).await;
    let contents: Vec<String> = session
        .sync()
        .messages()
        .await
        .iter()
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(contents, vec!["B".to_string(), "A".to_string()]);

    session.close().await;
}

#[tokio::test]
async fn equal_timestamps_break_ties_by_client_id() {
    let server = InMemoryServer::new();
    let session = join(&server, "c-tie", "alice").await;

    server
        .push_event("c-tie", peer_message("c-tie", "srv-z", "zz", 500, "second"))
        .await;
    server
        .push_event("c-tie", peer_message("c-tie", "srv-a", "aa", 500, "first"))
        .await;

    sleep(Duration::from_millis(100)).await;
    let contents: Vec<String> = session
        .sync()
        .messages()
        .await
        .iter()
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(contents, vec!["first".to_string(), "second".to_string()]);

    session.close().await;
}

#[tokio::test]
async fn offline_send_fails_then_retry_delivers_with_same_client_id() {
    let server = InMemoryServer::new();
    server.fail_next_connects(1).await;
    let config = SyncConfig {
        max_reconnect_attempts: 1,
        ..fast_config()
    };

    let session = RoomSession::join(
        "c-offline",
        Identity::new("alice", "tok-alice"),
        config,
        Arc::new(server.clone()),
        Arc::new(server.clone()),
    )
    .await
    .unwrap();
    assert!(wait_for_state(session.connection(), ConnectionState::Failed, 2000).await);

    // Optimistic entry appears immediately, then flips to failed
    let sent = session.sync().send("Hello", DebatePhase::Opening).await;
    assert!(session.sync().get(&sent.client_id).await.is_some());
    assert!(wait_for_status(session.sync(), &sent.client_id, MessageStatus::Failed, 1000).await);

    // Retry while the connection is failed must reject fast
    let err = session.sync().retry(&sent.client_id).await.unwrap_err();
    assert!(matches!(err, SyncError::Closed(_) | SyncError::Network(_)));
    assert!(wait_for_status(session.sync(), &sent.client_id, MessageStatus::Failed, 500).await);

    // Reconnect, then the deliberate retry goes through
    session.connection().reconnect().await.unwrap();
    assert!(wait_for_state(session.connection(), ConnectionState::Connected, 2000).await);
    session.sync().retry(&sent.client_id).await.unwrap();
    assert!(wait_for_status(session.sync(), &sent.client_id, MessageStatus::Delivered, 1000).await);

    let snapshot = session.sync().messages().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].client_id, sent.client_id, "client id survives retry");

    session.close().await;
}

#[tokio::test]
async fn lost_ack_times_out_to_failed() {
    let server = InMemoryServer::new();
    let session = join(&server, "c-timeout", "alice").await;

    server.set_drop_sends(true).await;
    let sent = session.sync().send("anyone there?", DebatePhase::Rebuttal).await;
    assert_eq!(
        session.sync().get(&sent.client_id).await.unwrap().status,
        MessageStatus::Sending
    );
    // send_timeout is 200ms in the fast config
    assert!(wait_for_status(session.sync(), &sent.client_id, MessageStatus::Failed, 2000).await);

    server.set_drop_sends(false).await;
    session.sync().retry(&sent.client_id).await.unwrap();
    assert!(wait_for_status(session.sync(), &sent.client_id, MessageStatus::Delivered, 1000).await);
    assert_eq!(session.sync().messages().await.len(), 1);

    session.close().await;
}

#[tokio::test]
async fn reply_validates_target_and_carries_reference() {
    let server = InMemoryServer::new();
    let session = join(&server, "c-reply", "alice").await;

    let err = session.sync().reply("no-such-id", "hi").await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));

    let opener = session.sync().send("opening", DebatePhase::Opening).await;
    assert!(wait_for_status(session.sync(), &opener.client_id, MessageStatus::Delivered, 1000).await);
    let opener_id = session.sync().get(&opener.client_id).await.unwrap().id.unwrap();

    let reply = session.sync().reply(&opener.client_id, "counterpoint").await.unwrap();
    assert_eq!(reply.reply_to_message_id.as_deref(), Some(opener_id.as_str()));
    assert!(wait_for_status(session.sync(), &reply.client_id, MessageStatus::Delivered, 1000).await);

    session.close().await;
}

#[tokio::test]
async fn reactions_merge_into_target_message() {
    let server = InMemoryServer::new();
    let alice = join(&server, "c-react", "alice").await;
    let bob = join(&server, "c-react", "bob").await;

    let sent = alice.sync().send("react to me", DebatePhase::Opening).await;
    assert!(wait_for_status(alice.sync(), &sent.client_id, MessageStatus::Delivered, 1000).await);
    assert!(wait_for_status(bob.sync(), &sent.client_id, MessageStatus::Delivered, 1000).await);

    bob.sync().react(&sent.client_id, "🔥").await.unwrap();

    let mut merged = false;
    for _ in 0..100 {
        if let Some(m) = alice.sync().get(&sent.client_id).await {
            if m.reactions.iter().any(|r| r.emoji == "🔥" && r.user_id == "bob") {
                merged = true;
                break;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(merged);

    // Reacting to an unknown message rejects explicitly
    let err = bob.sync().react("missing", "👎").await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn unmatched_reaction_is_buffered_until_message_arrives() {
    let server = InMemoryServer::new();
    let session = join(&server, "c-buf", "alice").await;

    server
        .push_event(
            "c-buf",
            ServerEvent::MessageReacted {
                message_id: "srv-late".to_string(),
                emoji: "💡".to_string(),
                user_id: "peer".to_string(),
                timestamp_ms: 1000,
            },
        )
        .await;
    sleep(Duration::from_millis(50)).await;

    server
        .push_event("c-buf", peer_message("c-buf", "srv-late", "cl", 999, "late"))
        .await;

    let mut applied = false;
    for _ in 0..100 {
        if let Some(m) = session.sync().get("srv-late").await {
            if m.reactions.iter().any(|r| r.emoji == "💡") {
                applied = true;
                break;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(applied);

    session.close().await;
}

#[tokio::test]
async fn expired_buffered_reaction_is_discarded() {
    let server = InMemoryServer::new();
    let session = join(&server, "c-expire", "alice").await;

    server
        .push_event(
            "c-expire",
            ServerEvent::MessageReacted {
                message_id: "srv-never".to_string(),
                emoji: "⏰".to_string(),
                user_id: "peer".to_string(),
                timestamp_ms: 1000,
            },
        )
        .await;

    // The buffer window is 200ms in the fast config; let it lapse, then make
    // another event flow through so the purge runs
    sleep(Duration::from_millis(400)).await;
    server
        .push_event("c-expire", peer_message("c-expire", "srv-x", "cx", 1, "tick"))
        .await;
    sleep(Duration::from_millis(50)).await;

    server
        .push_event("c-expire", peer_message("c-expire", "srv-never", "cn", 2, "too late"))
        .await;
    sleep(Duration::from_millis(100)).await;

    let m = session.sync().get("srv-never").await.unwrap();
    assert!(m.reactions.is_empty(), "expired reaction must not apply");

    session.close().await;
}

#[tokio::test]
async fn phase_change_events_update_current_phase() {
    let server = InMemoryServer::new();
    let session = join(&server, "c-phase", "alice").await;
    assert_eq!(session.sync().current_phase().await, DebatePhase::Lobby);

    server
        .push_event(
            "c-phase",
            ServerEvent::PhaseChanged {
                phase: DebatePhase::CrossExamination,
            },
        )
        .await;

    let mut changed = false;
    for _ in 0..100 {
        if session.sync().current_phase().await == DebatePhase::CrossExamination {
            changed = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(changed);

    session.close().await;
}
