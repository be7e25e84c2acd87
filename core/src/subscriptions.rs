/// Live message feed lifecycle
///
/// At most one feed per conversation. Each feed gets a pump task that maps
/// pushed records into messages and hands every snapshot to the handler it was
/// subscribed with.
use crate::backend::{FeedEvent, FeedSubscription, RealtimeFeed, Teardown};
use crate::error::{Result, SyncError};
use crate::model::{ConversationId, EngineEvent, Message, MessageRecord};
use crate::session::SessionIdentity;
use crate::utils::EventEmitter;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives every complete snapshot pushed for one conversation
pub type SnapshotHandler = Arc<dyn Fn(Vec<Message>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub conversation_id: ConversationId,
    pub id: u64,
}

struct LiveFeed {
    handle: SubscriptionHandle,
    teardown: Option<Teardown>,
    pump: JoinHandle<()>,
}

impl LiveFeed {
    fn close(mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
        self.pump.abort();
    }
}

type FeedMap = Arc<RwLock<HashMap<ConversationId, LiveFeed>>>;

pub struct SubscriptionManager {
    feed: Arc<dyn RealtimeFeed>,
    session: SessionIdentity,
    events: EventEmitter,
    feeds: FeedMap,
    next_id: AtomicU64,
    torn_down: AtomicBool,
}

impl SubscriptionManager {
    pub fn new(feed: Arc<dyn RealtimeFeed>, session: SessionIdentity, events: EventEmitter) -> Self {
        Self {
            feed,
            session,
            events,
            feeds: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Open the live feed for a conversation, or return the existing handle
    pub async fn subscribe(
        &self,
        conversation_id: &str,
        on_update: SnapshotHandler,
    ) -> Result<SubscriptionHandle> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(SyncError::Subscription("session has ended".to_string()));
        }

        let mut feeds = self.feeds.write().await;
        if let Some(existing) = feeds.get(conversation_id) {
            debug!("Already subscribed to {}", conversation_id);
            return Ok(existing.handle.clone());
        }

        let FeedSubscription { events, teardown } = self.feed.subscribe_messages(conversation_id)?;
        let handle = SubscriptionHandle {
            conversation_id: conversation_id.to_string(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };

        // The pump cannot remove its entry before the insert below: we hold the write lock
        let pump = tokio::spawn(pump_messages(
            handle.clone(),
            events,
            on_update,
            self.session.clone(),
            self.events.clone(),
            self.feeds.clone(),
        ));
        feeds.insert(
            conversation_id.to_string(),
            LiveFeed {
                handle: handle.clone(),
                teardown: Some(teardown),
                pump,
            },
        );

        info!("Subscribed to {} (handle {})", conversation_id, handle.id);
        Ok(handle)
    }

    pub async fn unsubscribe(&self, conversation_id: &str) -> bool {
        let removed = self.feeds.write().await.remove(conversation_id);
        match removed {
            Some(feed) => {
                feed.close();
                info!("Unsubscribed from {}", conversation_id);
                true
            }
            None => false,
        }
    }

    /// Close every live feed; only the first call does anything
    pub async fn teardown_all(&self) -> usize {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            warn!("Subscriptions already torn down");
            return 0;
        }
        let drained: Vec<LiveFeed> = self.feeds.write().await.drain().map(|(_, f)| f).collect();
        let count = drained.len();
        for feed in drained {
            feed.close();
        }
        info!("Tore down {} live subscriptions", count);
        count
    }

    pub async fn is_subscribed(&self, conversation_id: &str) -> bool {
        self.feeds.read().await.contains_key(conversation_id)
    }
}

async fn pump_messages(
    handle: SubscriptionHandle,
    mut events: mpsc::UnboundedReceiver<FeedEvent<MessageRecord>>,
    on_update: SnapshotHandler,
    session: SessionIdentity,
    emitter: EventEmitter,
    feeds: FeedMap,
) {
    let conversation_id = handle.conversation_id.clone();
    while let Some(event) = events.recv().await {
        match event {
            FeedEvent::Snapshot(records) => {
                debug!("Live snapshot of {} messages for {}", records.len(), conversation_id);
                let batch = records
                    .into_iter()
                    .map(|r| Message::from_record(r, &session))
                    .collect();
                on_update(batch).await;
            }
            FeedEvent::Error(error) => {
                warn!("Live feed error on {}: {}", conversation_id, error);
                emitter.emit(EngineEvent::SubscriptionError {
                    key: conversation_id.clone(),
                    error,
                });
            }
        }
    }

    // Closed from the far side; forget the handle unless it was already replaced
    let dropped = {
        let mut feeds = feeds.write().await;
        match feeds.get(&conversation_id) {
            Some(feed) if feed.handle.id == handle.id => feeds.remove(&conversation_id),
            _ => None,
        }
    };
    if let Some(mut feed) = dropped {
        if let Some(teardown) = feed.teardown.take() {
            teardown();
        }
        warn!("Live feed for {} closed by the server", conversation_id);
        emitter.emit(EngineEvent::SubscriptionDropped { conversation_id });
    }
}
