/// Unread digest and push token tests
/// Read-after-digest guard, active conversation exemption, fetch coalescing and cooldowns
extern crate chatsync_core;

mod common;

use chatsync_core::digest::FetchOutcome;
use chatsync_core::model::EngineEvent;
use chatsync_core::{Config, SyncError};
use chrono::Utc;
use common::*;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_read_overrides_stale_digest() {
    let backend = seeded_backend();
    backend.set_notifications(ME, vec![digest("a", 3, seconds_ago(10))]);
    let engine = engine(&backend);
    engine.start().await.unwrap();
    assert_eq!(engine.unread("a").await, 3);

    engine.mark_read("a").await.unwrap();
    assert_eq!(engine.unread("a").await, 0);
    assert_eq!(engine.conversation("a").await.unwrap().unread_count, 0);

    // A digest produced before the read cannot raise the count again
    let mut events = engine.events();
    assert_eq!(backend.push_digest(ME, vec![digest("a", 5, seconds_ago(5))]), 1);
    next_event(&mut events, |e| matches!(e, EngineEvent::UnreadChanged { .. })).await;
    assert_eq!(engine.unread("a").await, 0);

    let later = Utc::now() + chrono::Duration::seconds(5);
    backend.push_digest(ME, vec![digest("a", 2, later)]);
    next_event(&mut events, |e| matches!(e, EngineEvent::UnreadChanged { total: 2 })).await;
    assert_eq!(engine.unread("a").await, 2);
    assert_eq!(engine.total_unread().await, 2);
}

#[tokio::test]
async fn test_active_conversation_is_exempt() {
    let backend = seeded_backend();
    backend.set_notifications(
        ME,
        vec![digest("a", 3, seconds_ago(10)), digest("b", 2, seconds_ago(10))],
    );
    let engine = engine(&backend);
    engine.start().await.unwrap();
    assert_eq!(engine.total_unread().await, 5);

    engine.set_active(Some("a")).await.unwrap();
    assert_eq!(engine.unread("a").await, 0);
    assert_eq!(engine.total_unread().await, 2);
    assert!(backend.read_marks().contains(&(ME.to_string(), "a".to_string())));

    // New messages in the viewed conversation stay at zero
    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut events = engine.events();
    backend.push_digest(ME, vec![digest("a", 4, Utc::now()), digest("b", 2, seconds_ago(10))]);
    next_event(&mut events, |e| matches!(e, EngineEvent::UnreadChanged { .. })).await;
    assert_eq!(engine.unread("a").await, 0);
    assert_eq!(engine.total_unread().await, 2);

    backend.push_digest(ME, vec![digest("a", 3, Utc::now()), digest("b", 0, Utc::now())]);
    next_event(&mut events, |e| matches!(e, EngineEvent::UnreadChanged { total: 0 })).await;
    assert_eq!(engine.unread("a").await, 0);
    assert_eq!(engine.unread("b").await, 0);

    // Messages seen while viewing do not come back as unread on leaving
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.set_active(None).await.unwrap();
    assert_eq!(engine.active_conversation().await, None);
    assert_eq!(engine.unread("a").await, 0);
    assert_eq!(engine.total_unread().await, 0);

    // Anything newer than leaving counts again
    let later = Utc::now() + chrono::Duration::seconds(5);
    backend.push_digest(ME, vec![digest("a", 2, later), digest("b", 0, later)]);
    next_event(&mut events, |e| matches!(e, EngineEvent::UnreadChanged { total: 2 })).await;
    assert_eq!(engine.unread("a").await, 2);
}

#[tokio::test]
async fn test_concurrent_fetches_share_one_request() {
    let backend = seeded_backend();
    backend.set_notifications(ME, vec![digest("a", 1, seconds_ago(10))]);
    let engine = engine(&backend);

    backend.hold("fetch_notifications");
    let release = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.open("fetch_notifications");
    };
    let (first, second, _) = tokio::join!(engine.refresh_unread(), engine.refresh_unread(), release);

    assert_eq!(first.unwrap(), FetchOutcome::Fetched(1));
    assert_eq!(second.unwrap(), FetchOutcome::Fetched(1));
    assert_eq!(backend.calls("fetch_notifications"), 1);
    assert_eq!(engine.unread("a").await, 1);

    // Within the cooldown no request is made
    assert_eq!(engine.refresh_unread().await.unwrap(), FetchOutcome::Skipped);
    assert_eq!(backend.calls("fetch_notifications"), 1);
}

#[tokio::test]
async fn test_failed_fetch_shows_cached_counts() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        data_dir: Some(temp_dir.path().to_path_buf()),
        digest_fetch_cooldown: Duration::ZERO,
        ..test_config()
    };

    let backend = seeded_backend();
    backend.set_notifications(ME, vec![digest("b", 2, seconds_ago(10))]);
    {
        let engine = engine_with(&backend, config.clone());
        engine.start().await.unwrap();
        assert_eq!(engine.unread("b").await, 2);
    }

    let offline = seeded_backend();
    offline.fail("fetch_notifications", SyncError::Network("offline".into()));
    let engine = engine_with(&offline, config);
    engine.start().await.unwrap();

    assert_eq!(offline.calls("fetch_notifications"), 1);
    assert_eq!(engine.unread("b").await, 2);
    assert_eq!(engine.conversation("b").await.unwrap().unread_count, 2);
    assert!(engine.refresh_unread().await.is_err());
    assert_eq!(engine.total_unread().await, 2);
}

#[tokio::test]
async fn test_enable_notifications_respects_cooldown() {
    let backend = seeded_backend();
    let engine = engine(&backend);
    engine.start().await.unwrap();

    assert!(engine.enable_notifications().await.success);
    assert!(engine.enable_notifications().await.success);
    assert_eq!(backend.calls("register_token"), 1);
    assert_eq!(backend.registered_tokens(), 1);
}

#[tokio::test]
async fn test_concurrent_enables_share_one_registration() {
    let backend = seeded_backend();
    let engine = engine(&backend);
    engine.start().await.unwrap();

    backend.hold("register_token");
    let release = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.open("register_token");
    };
    let (first, second, _) = tokio::join!(
        engine.enable_notifications(),
        engine.enable_notifications(),
        release
    );

    assert!(first.success && second.success);
    assert_eq!(backend.calls("register_token"), 1);
    assert_eq!(backend.registered_tokens(), 1);
}

#[tokio::test]
async fn test_failed_registration_is_reported() {
    let backend = seeded_backend();
    backend.fail("register_token", SyncError::Network("push service down".into()));
    let engine = engine(&backend);
    engine.start().await.unwrap();

    let outcome = engine.enable_notifications().await;
    assert!(!outcome.success);
    assert!(outcome.message.contains("push service down"));
    assert_eq!(backend.registered_tokens(), 0);
}
