/// Presence, heartbeat staleness, and typing timeout tests
mod common;

use common::{fast_config, wait_for_state};
use debateroom_core::{ConnectionState, Identity, InMemoryServer, RoomSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

async fn join(server: &InMemoryServer, conversation: &str, user: &str) -> RoomSession {
    let session = RoomSession::join(
        conversation,
        Identity::new(user, &format!("tok-{}", user)),
        fast_config(),
        Arc::new(server.clone()),
        Arc::new(server.clone()),
    )
    .await
    .unwrap();
    assert!(wait_for_state(session.connection(), ConnectionState::Connected, 1000).await);
    session
}

#[tokio::test]
async fn heartbeats_mark_peers_online() {
    let server = InMemoryServer::new();
    let alice = join(&server, "p-online", "alice").await;
    let bob = join(&server, "p-online", "bob").await;

    // Heartbeat interval is 50ms in the fast config
    let mut online = false;
    for _ in 0..100 {
        if alice
            .presence()
            .participant("bob")
            .await
            .map(|p| p.is_online)
            .unwrap_or(false)
        {
            online = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(online);
    assert!(alice
        .presence()
        .participant("bob")
        .await
        .unwrap()
        .last_seen_ms
        .is_some());

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn silent_peer_flips_offline_after_grace_period() {
    let server = InMemoryServer::new();
    let alice = join(&server, "p-stale", "alice").await;
    let bob = join(&server, "p-stale", "bob").await;

    let mut online = false;
    for _ in 0..100 {
        if alice
            .presence()
            .participant("bob")
            .await
            .map(|p| p.is_online)
            .unwrap_or(false)
        {
            online = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(online);

    // Bob vanishes silently; no explicit disconnect signal is sent
    bob.close().await;

    // Grace period is 2x the 50ms heartbeat interval
    let mut offline = false;
    for _ in 0..100 {
        if !alice.presence().participant("bob").await.unwrap().is_online {
            offline = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(offline, "silent peer must age out through the grace period");

    alice.close().await;
}

#[tokio::test]
async fn typing_indicator_propagates_and_implies_online() {
    let server = InMemoryServer::new();
    let alice = join(&server, "p-typing", "alice").await;
    let bob = join(&server, "p-typing", "bob").await;

    bob.presence().update_typing(true).await;

    let mut typing = false;
    for _ in 0..100 {
        if alice.presence().typing_users().await.contains(&"bob".to_string()) {
            typing = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(typing);

    let bob_presence = alice.presence().participant("bob").await.unwrap();
    assert!(bob_presence.is_online, "typing implies online");
    assert!(bob_presence.is_typing);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn typing_auto_expires_without_stop_signal() {
    let server = InMemoryServer::new();
    let alice = join(&server, "p-expire", "alice").await;
    let bob = join(&server, "p-expire", "bob").await;

    bob.presence().update_typing(true).await;
    let mut typing = false;
    for _ in 0..100 {
        if alice.presence().typing_users().await.contains(&"bob".to_string()) {
            typing = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(typing);

    // Sever bob so no stop-typing signal can ever arrive
    bob.close().await;

    // typing_timeout is 150ms in the fast config; well within a second the
    // indicator must clear on its own
    let mut cleared = false;
    for _ in 0..100 {
        if !alice.presence().typing_users().await.contains(&"bob".to_string()) {
            cleared = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(cleared, "typing indicator must be bounded");

    alice.close().await;
}

#[tokio::test]
async fn explicit_stop_clears_typing_promptly() {
    let server = InMemoryServer::new();
    let alice = join(&server, "p-stop", "alice").await;
    let bob = join(&server, "p-stop", "bob").await;

    bob.presence().update_typing(true).await;
    let mut typing = false;
    for _ in 0..100 {
        if alice.presence().typing_users().await.contains(&"bob".to_string()) {
            typing = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(typing);

    bob.presence().update_typing(false).await;
    let mut cleared = false;
    for _ in 0..100 {
        if !alice.presence().typing_users().await.contains(&"bob".to_string()) {
            cleared = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(cleared);
    assert!(!bob.presence().typing_users().await.contains(&"bob".to_string()));

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn local_typing_expires_locally_too() {
    let server = InMemoryServer::new();
    let alice = join(&server, "p-local", "alice").await;

    alice.presence().update_typing(true).await;
    assert!(alice.presence().typing_users().await.contains(&"alice".to_string()));

    let mut cleared = false;
    for _ in 0..100 {
        if !alice.presence().typing_users().await.contains(&"alice".to_string()) {
            cleared = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(cleared);

    alice.close().await;
}
