/// DebateRoom Core demo - two users exchanging messages over the loopback
use debateroom_core::{
    DebatePhase, Identity, InMemoryServer, RoomSession, SyncConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SyncConfig::default().with_env_overrides();
    let server = InMemoryServer::new();
    let transport = Arc::new(server.clone());

    info!("🎙️ Starting DebateRoom core demo");

    let alice = RoomSession::join(
        "demo-debate",
        Identity::new("alice", "tok-alice"),
        config.clone(),
        transport.clone(),
        transport.clone(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("join error: {}", e))?;

    let bob = RoomSession::join(
        "demo-debate",
        Identity::new("bob", "tok-bob"),
        config,
        transport.clone(),
        transport,
    )
    .await
    .map_err(|e| anyhow::anyhow!("join error: {}", e))?;

    tokio::time::sleep(Duration::from_millis(200)).await;

    bob.presence().update_typing(true).await;
    let sent = alice
        .sync()
        .send("Opening statement: resolved, that Rust is a fine vehicle.", DebatePhase::Opening)
        .await;
    info!(client_id = %sent.client_id, "alice sent her opener");

    tokio::time::sleep(Duration::from_millis(200)).await;

    if let Some(delivered) = alice.sync().get(&sent.client_id).await {
        info!(status = ?delivered.status, id = ?delivered.id, "opener state");
        if let Err(e) = bob.sync().react(&sent.client_id, "👏").await {
            info!(error = %e, "bob's reaction rejected");
        }
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    for message in alice.sync().messages().await {
        info!(
            author = %message.author_id,
            content = %message.content,
            reactions = message.reactions.len(),
            "message"
        );
    }
    info!(typing = ?alice.presence().typing_users().await, "typing indicator");

    bob.close().await;
    alice.close().await;
    info!("Demo complete");
    Ok(())
}
