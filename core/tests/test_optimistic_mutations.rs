/// Optimistic mutation tests
/// Send reconciliation races, retries, reactions, edits and deletes with rollback
extern crate chatsync_core;

mod common;

use chatsync_core::model::{DeliveryStatus, EngineEvent, MessageId};
use chatsync_core::{ChatEngine, MemoryBackend, SyncError};
use common::*;
use std::sync::Arc;
use std::time::Duration;

async fn opened(backend: &MemoryBackend) -> Arc<ChatEngine> {
    let engine = Arc::new(engine(backend));
    engine.start().await.unwrap();
    engine.open_conversation("a").await.unwrap();
    engine
}

#[tokio::test]
async fn test_send_reconciles_in_place() {
    let backend = seeded_backend();
    backend.seed_message("a", "grace", "question");
    let engine = opened(&backend).await;

    let id = engine.send("a", "answer", vec![], None).await.unwrap();
    assert!(!id.is_temp());

    let messages = engine.messages("a").await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].id, id);
    assert_eq!(messages[1].status, DeliveryStatus::Sent);
    assert!(messages[1].capabilities.editable);
    assert_eq!(backend.stored_messages("a").len(), 2);

    let summary = engine.conversation("a").await.unwrap().last_message.unwrap();
    assert_eq!(summary.content, "answer");
}

#[tokio::test]
async fn test_live_copy_before_response_yields_one_entry() {
    let backend = seeded_backend();
    backend.set_echo_sends(true);
    backend.hold("send_message");
    let engine = opened(&backend).await;

    let sending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.send("a", "race", vec![], None).await })
    };

    // The echoed snapshot lands while the response is still held
    eventually("live copy applied", || {
        let engine = engine.clone();
        async move {
            let messages = engine.messages("a").await;
            messages.len() == 1 && !messages[0].id.is_temp()
        }
    })
    .await;

    backend.release("send_message", 1);
    let id = sending.await.unwrap().unwrap();

    let messages = engine.messages("a").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, id);
    assert_eq!(messages[0].status, DeliveryStatus::Sent);
    assert_eq!(messages[0].content, "race");
}

#[tokio::test]
async fn test_back_to_back_sends_keep_order_and_reconcile_independently() {
    let backend = seeded_backend();
    backend.hold("send_message");
    let engine = opened(&backend).await;

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.send("a", "first", vec![], None).await })
    };
    eventually("first pending", || {
        let backend = backend.clone();
        async move { backend.calls("send_message") == 1 }
    })
    .await;
    let second = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.send("a", "second", vec![], None).await })
    };
    eventually("second pending", || {
        let backend = backend.clone();
        async move { backend.calls("send_message") == 2 }
    })
    .await;

    let pending = engine.messages("a").await;
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|m| m.status == DeliveryStatus::Sending && m.id.is_temp()));
    assert_eq!(pending[0].content, "first");
    assert_eq!(pending[1].content, "second");

    backend.release("send_message", 2);
    let first_id = first.await.unwrap().unwrap();
    let second_id = second.await.unwrap().unwrap();
    assert_ne!(first_id, second_id);

    let messages = engine.messages("a").await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, first_id);
    assert_eq!(messages[1].id, second_id);
    assert!(messages.iter().all(|m| m.status == DeliveryStatus::Sent));
}

#[tokio::test]
async fn test_failed_send_is_kept_and_can_be_retried() {
    let backend = seeded_backend();
    let engine = opened(&backend).await;
    let mut events = engine.events();

    backend.fail("send_message", SyncError::Network("offline".into()));
    let err = engine.send("a", "hello", vec![], None).await.unwrap_err();
    assert!(err.is_retryable());
    next_event(&mut events, |e| matches!(e, EngineEvent::SendFailed { .. })).await;

    let messages = engine.messages("a").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, DeliveryStatus::Failed);
    let temp_id = messages[0].id.clone();
    assert!(temp_id.is_temp());

    backend.recover("send_message");
    let id = engine.retry("a", &temp_id).await.unwrap();

    let messages = engine.messages("a").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, id);
    assert_eq!(messages[0].status, DeliveryStatus::Sent);
    assert_eq!(backend.stored_messages("a").len(), 1);

    // Only failed entries can be retried
    assert!(matches!(
        engine.retry("a", &id).await,
        Err(SyncError::Validation(_))
    ));
}

#[tokio::test]
async fn test_failed_send_can_be_discarded() {
    let backend = seeded_backend();
    let engine = opened(&backend).await;

    backend.fail("send_message", SyncError::Validation("blocked word".into()));
    let err = engine.send("a", "hello", vec![], None).await.unwrap_err();
    assert!(!err.is_retryable());

    let temp_id = engine.messages("a").await[0].id.clone();
    engine.discard("a", &temp_id).await.unwrap();
    assert!(engine.messages("a").await.is_empty());
    assert!(engine.discard("a", &temp_id).await.is_err());
}

#[tokio::test]
async fn test_empty_message_rejected_locally() {
    let backend = seeded_backend();
    let engine = opened(&backend).await;

    assert!(matches!(
        engine.send("a", "   ", vec![], None).await,
        Err(SyncError::Validation(_))
    ));
    assert!(engine.messages("a").await.is_empty());
    assert_eq!(backend.calls("send_message"), 0);
}

#[tokio::test]
async fn test_reaction_toggle_round_trip() {
    let backend = seeded_backend();
    let record = backend.seed_message("a", "grace", "ship it?");
    let engine = opened(&backend).await;
    let id = MessageId::server(record.id.as_str());

    assert!(engine.toggle_reaction("a", &id, "👍").await.unwrap());
    let reacted = engine.messages("a").await;
    assert_eq!(reacted[0].reaction_count("👍"), 1);
    assert!(reacted[0].has_reacted(ME, "👍"));

    assert!(!engine.toggle_reaction("a", &id, "👍").await.unwrap());
    assert!(engine.messages("a").await[0].reactions.is_empty());
    assert!(backend.stored_messages("a")[0].reactions.is_empty());
    assert_eq!(backend.calls("add_reaction"), 1);
    assert_eq!(backend.calls("remove_reaction"), 1);
}

#[tokio::test]
async fn test_rapid_double_toggle_settles_on_original_state() {
    let backend = seeded_backend();
    let record = backend.seed_message("a", "grace", "ship it?");
    let engine = opened(&backend).await;
    let id = MessageId::server(record.id.as_str());

    backend.hold("add_reaction");
    let release = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.open("add_reaction");
    };
    let (first, second, _) = tokio::join!(
        engine.toggle_reaction("a", &id, "🎉"),
        engine.toggle_reaction("a", &id, "🎉"),
        release
    );
    first.unwrap();
    second.unwrap();

    assert!(engine.messages("a").await[0].reactions.is_empty());
    assert!(backend.stored_messages("a")[0].reactions.is_empty());
}

#[tokio::test]
async fn test_failed_reaction_rolls_back() {
    let backend = seeded_backend();
    let record = backend.seed_message("a", "grace", "ship it?");
    let engine = opened(&backend).await;
    let id = MessageId::server(record.id.as_str());
    let mut events = engine.events();

    backend.fail("add_reaction", SyncError::Network("offline".into()));
    assert!(engine.toggle_reaction("a", &id, "👍").await.is_err());
    next_event(&mut events, |e| matches!(e, EngineEvent::MutationRolledBack { .. })).await;
    assert!(engine.messages("a").await[0].reactions.is_empty());
}

#[tokio::test]
async fn test_edit_applies_and_rolls_back() {
    let backend = seeded_backend();
    let engine = opened(&backend).await;
    let id = engine.send("a", "draft", vec![], None).await.unwrap();

    let edited = engine.edit("a", &id, "final").await.unwrap();
    assert_eq!(edited.content, "final");
    assert!(edited.edited);
    assert_eq!(backend.stored_messages("a")[0].content, "final");

    backend.fail("edit_message", SyncError::Network("offline".into()));
    assert!(engine.edit("a", &id, "oops").await.is_err());
    let message = &engine.messages("a").await[0];
    assert_eq!(message.content, "final");
    assert!(message.edited);
}

#[tokio::test]
async fn test_mutations_respect_capabilities() {
    let backend = seeded_backend();
    let record = backend.seed_message("a", "grace", "not yours");
    let engine = opened(&backend).await;
    let id = MessageId::server(record.id.as_str());

    assert!(matches!(
        engine.edit("a", &id, "mine now").await,
        Err(SyncError::Validation(_))
    ));
    assert!(matches!(
        engine.delete("a", &id).await,
        Err(SyncError::Validation(_))
    ));
    assert_eq!(backend.calls("edit_message"), 0);
    assert_eq!(backend.calls("delete_message"), 0);
    assert_eq!(engine.messages("a").await.len(), 1);
}

#[tokio::test]
async fn test_failed_delete_restores_position() {
    let backend = seeded_backend();
    let engine = opened(&backend).await;
    let mut ids = Vec::new();
    for text in ["one", "two", "three"] {
        ids.push(engine.send("a", text, vec![], None).await.unwrap());
    }

    backend.fail("delete_message", SyncError::Network("offline".into()));
    assert!(engine.delete("a", &ids[1]).await.is_err());

    let order: Vec<MessageId> = engine.messages("a").await.into_iter().map(|m| m.id).collect();
    assert_eq!(order, ids);

    backend.recover("delete_message");
    engine.delete("a", &ids[1]).await.unwrap();
    assert_eq!(engine.messages("a").await.len(), 2);
    assert_eq!(backend.stored_messages("a").len(), 2);
}

#[tokio::test]
async fn test_pending_delete_not_resurrected_by_snapshot() {
    let backend = seeded_backend();
    let engine = opened(&backend).await;
    let id = engine.send("a", "regret", vec![], None).await.unwrap();

    backend.hold("delete_message");
    let deleting = {
        let engine = engine.clone();
        let id = id.clone();
        tokio::spawn(async move { engine.delete("a", &id).await })
    };
    eventually("delete in flight", || {
        let backend = backend.clone();
        async move { backend.calls("delete_message") == 1 }
    })
    .await;

    // Server still lists the message until the delete lands
    let mut events = engine.events();
    backend.push_snapshot("a");
    next_event(&mut events, |e| matches!(e, EngineEvent::LiveSnapshotApplied { .. })).await;
    assert!(engine.messages("a").await.is_empty());

    backend.release("delete_message", 1);
    deleting.await.unwrap().unwrap();
    assert!(engine.messages("a").await.is_empty());
    assert!(backend.stored_messages("a").is_empty());
}

#[tokio::test]
async fn test_edit_of_pending_message_waits_for_confirmation() {
    let backend = seeded_backend();
    backend.hold("send_message");
    let engine = opened(&backend).await;

    let sending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.send("a", "typo", vec![], None).await })
    };
    eventually("send in flight", || {
        let backend = backend.clone();
        async move { backend.calls("send_message") == 1 }
    })
    .await;
    let temp_id = engine.messages("a").await[0].id.clone();
    assert!(temp_id.is_temp());

    backend.hold("edit_message");
    let editing = {
        let engine = engine.clone();
        let temp_id = temp_id.clone();
        tokio::spawn(async move { engine.edit("a", &temp_id, "fixed").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.calls("edit_message"), 0);

    backend.release("send_message", 1);
    let server_id = sending.await.unwrap().unwrap();
    eventually("edit issued", || {
        let backend = backend.clone();
        async move { backend.calls("edit_message") == 1 }
    })
    .await;

    // The confirmed copy keeps the local edit while the edit call is in flight
    let confirmed = engine.messages("a").await;
    assert_eq!(confirmed[0].id, server_id);
    assert_eq!(confirmed[0].content, "fixed");

    backend.release("edit_message", 1);
    let edited = editing.await.unwrap().unwrap();

    assert_eq!(edited.id, server_id);
    assert_eq!(edited.content, "fixed");
    assert_eq!(backend.stored_messages("a")[0].content, "fixed");
    let messages = engine.messages("a").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "fixed");
}

/// React to a message whose send is still held, then let it confirm either
/// through the send response or through a live snapshot first
async fn react_while_sending(live_first: bool) {
    let backend = seeded_backend();
    backend.hold("send_message");
    let engine = opened(&backend).await;

    let sending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.send("a", "hi", vec![], None).await })
    };
    eventually("send in flight", || {
        let backend = backend.clone();
        async move { backend.calls("send_message") == 1 }
    })
    .await;
    let temp_id = engine.messages("a").await[0].id.clone();
    assert!(temp_id.is_temp());

    let reacting = {
        let engine = engine.clone();
        let temp_id = temp_id.clone();
        tokio::spawn(async move { engine.toggle_reaction("a", &temp_id, "👍").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(engine.messages("a").await[0].has_reacted(ME, "👍"));
    assert_eq!(backend.calls("add_reaction"), 0);

    if live_first {
        let mut events = engine.events();
        backend.push_snapshot("a");
        next_event(&mut events, |e| matches!(e, EngineEvent::LiveSnapshotApplied { .. })).await;
        let live = engine.messages("a").await;
        assert!(!live[0].id.is_temp());
        assert!(live[0].has_reacted(ME, "👍"));
    }

    backend.release("send_message", 1);
    let server_id = sending.await.unwrap().unwrap();
    assert!(reacting.await.unwrap().unwrap());

    let messages = engine.messages("a").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, server_id);
    assert!(messages[0].has_reacted(ME, "👍"));
    let stored = backend.stored_messages("a");
    assert!(stored[0]
        .reactions
        .iter()
        .any(|r| r.emoji == "👍" && r.user_ids.iter().any(|u| u == ME)));
}

#[tokio::test]
async fn test_reaction_on_pending_message_survives_send_response() {
    react_while_sending(false).await;
}

#[tokio::test]
async fn test_reaction_on_pending_message_survives_live_confirmation() {
    react_while_sending(true).await;
}
