/// Property tests for message list identity
/// Any interleaving of page loads, live snapshots and sends lists every message once
extern crate chatsync_core;

mod common;

use chatsync_core::model::EngineEvent;
use chatsync_core::{Config, Message};
use common::*;
use proptest::prelude::*;
use std::collections::HashSet;

#[derive(Debug, Clone)]
enum Op {
    LoadFirst,
    LoadMore,
    Seed(u8),
    Push,
    Send,
    SendEchoed,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::LoadFirst),
        Just(Op::LoadMore),
        (1u8..4).prop_map(Op::Seed),
        Just(Op::Push),
        Just(Op::Send),
        Just(Op::SendEchoed),
    ]
}

fn check_identity(messages: &[Message]) -> Result<(), TestCaseError> {
    let mut ids = HashSet::new();
    let mut refs = HashSet::new();
    for message in messages {
        prop_assert!(ids.insert(message.id.clone()), "duplicate id {}", message.id);
        if let Some(client_ref) = &message.client_ref {
            prop_assert!(
                refs.insert(client_ref.clone()),
                "two entries for client_ref {}",
                client_ref
            );
        }
    }
    Ok(())
}

async fn run_ops(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let backend = seeded_backend();
    backend.seed_message("a", "grace", "opening line");
    let engine = engine_with(
        &backend,
        Config {
            page_size: 3,
            ..test_config()
        },
    );
    engine.start().await.unwrap();
    engine.open_conversation("a").await.unwrap();

    for (step, op) in ops.into_iter().enumerate() {
        match op {
            Op::LoadFirst => {
                engine.open_conversation("a").await.unwrap();
            }
            Op::LoadMore => {
                engine.load_more("a").await.unwrap();
            }
            Op::Seed(n) => {
                for i in 0..n {
                    backend.seed_message("a", "grace", &format!("seed {}-{}", step, i));
                }
            }
            Op::Push => {
                let mut events = engine.events();
                if backend.push_snapshot("a") > 0 {
                    next_event(&mut events, |e| matches!(e, EngineEvent::LiveSnapshotApplied { .. }))
                        .await;
                }
            }
            Op::Send => {
                engine.send("a", &format!("send {}", step), vec![], None).await.unwrap();
            }
            Op::SendEchoed => {
                backend.set_echo_sends(true);
                engine.send("a", &format!("echo {}", step), vec![], None).await.unwrap();
                backend.set_echo_sends(false);
            }
        }
        check_identity(&engine.messages("a").await)?;
    }

    // A final snapshot settles every send into exactly one confirmed entry.
    // Echoed snapshots may still be queued ahead of it.
    backend.push_snapshot("a");
    let stored = backend.stored_messages("a").len();
    let view = &engine;
    eventually("final snapshot applied", || async move {
        let messages = view.messages("a").await;
        messages.len() == stored && messages.iter().all(|m| !m.id.is_temp())
    })
    .await;
    let messages = engine.messages("a").await;
    check_identity(&messages)?;
    prop_assert!(messages.iter().all(|m| !m.id.is_temp()));
    prop_assert_eq!(messages.len(), backend.stored_messages("a").len());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_every_message_listed_once(ops in proptest::collection::vec(op(), 1..16)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_ops(ops))?;
    }
}
