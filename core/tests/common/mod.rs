//! Shared fixtures for engine integration tests
#![allow(dead_code)]

use chatsync_core::model::{EngineEvent, NotificationDigest, Role};
use chatsync_core::{ChatEngine, Config, MemoryBackend, SessionIdentity};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const ME: &str = "me";

pub fn test_config() -> Config {
    Config {
        digest_poll_interval: None,
        ..Config::default()
    }
}

/// Two conversations: a direct one with grace and a group with grace and alan
pub fn seeded_backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.add_user(ME, "Ada", "Lovelace", Role::Admin);
    backend.add_user("grace", "Grace", "Hopper", Role::Member);
    backend.add_user("alan", "Alan", "Turing", Role::Member);
    backend.add_conversation("a", None, false, &[ME, "grace"]);
    backend.add_conversation("b", Some("Team"), true, &[ME, "grace", "alan"]);
    backend
}

pub fn engine(backend: &MemoryBackend) -> ChatEngine {
    engine_with(backend, test_config())
}

pub fn engine_with(backend: &MemoryBackend, config: Config) -> ChatEngine {
    let shared = Arc::new(backend.clone());
    ChatEngine::new(
        SessionIdentity::new(ME, "Ada").unwrap(),
        config,
        shared.clone(),
        shared.clone(),
        shared,
    )
    .unwrap()
}

pub fn digest(conversation_id: &str, unread: u32, updated_at: DateTime<Utc>) -> NotificationDigest {
    NotificationDigest {
        conversation_id: conversation_id.to_string(),
        unread,
        updated_at,
    }
}

pub fn seconds_ago(secs: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::seconds(secs)
}

/// Wait for the first event matching `pred`
pub async fn next_event<F>(rx: &mut broadcast::Receiver<EngineEvent>, pred: F) -> EngineEvent
where
    F: Fn(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for engine event")
}

/// Poll `check` until it holds
pub async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {}", what);
}
