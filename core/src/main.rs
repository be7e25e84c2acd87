/// ChatSync demo - drives the engine against the in-process backend
use chatsync_core::{ChatEngine, Config, MemoryBackend, SessionIdentity};
use chatsync_core::model::{NotificationDigest, Role};
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn seed(backend: &MemoryBackend) {
    backend.add_user("me", "Ada", "Lovelace", Role::Admin);
    backend.add_user("grace", "Grace", "Hopper", Role::Member);
    backend.add_user("alan", "Alan", "Turing", Role::Member);
    backend.add_conversation("support", None, false, &["me", "grace"]);
    backend.add_conversation("team", Some("Team"), true, &["me", "grace", "alan"]);

    for line in ["Hi, the export is stuck again", "Same ticket as last week"] {
        backend.seed_message("support", "grace", line);
    }
    backend.seed_message("team", "alan", "Standup moved to 10:30");
    backend.set_notifications(
        "me",
        vec![
            NotificationDigest {
                conversation_id: "support".into(),
                unread: 2,
                updated_at: chrono::Utc::now(),
            },
            NotificationDigest {
                conversation_id: "team".into(),
                unread: 1,
                updated_at: chrono::Utc::now(),
            },
        ],
    );
    backend.set_echo_sends(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let backend = MemoryBackend::new();
    seed(&backend);
    let backend = Arc::new(backend);

    let session = SessionIdentity::new("me", "Ada")?;
    let engine = ChatEngine::new(session, config, backend.clone(), backend.clone(), backend)?;

    let report = engine.start().await?;
    info!("Directory loaded (complete: {})", report.is_complete());
    for conv in engine.conversations().await.conversations {
        info!("  {} [{:?}] unread={}", conv.name, conv.kind, conv.unread_count);
    }

    let page = engine.open_conversation("support").await?;
    info!("Opened support: {} messages, more pages: {}", page.added, page.meta.has_more());

    let sent = engine.send("support", "Looking into it now", vec![], None).await?;
    info!("Sent message {}", sent);
    engine.toggle_reaction("support", &sent, "👍").await?;

    for msg in engine.messages("support").await {
        info!("  {} {:?}: {}", msg.sender_id, msg.status, msg.content);
    }
    info!("Unread total: {}", engine.total_unread().await);

    let outcome = engine.enable_notifications().await;
    info!("Notifications: {}", outcome.message);

    engine.shutdown().await;
    Ok(())
}
