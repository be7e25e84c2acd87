/// Notification digest aggregation
///
/// One instance per signed-in session. Raw per-conversation digests arrive on
/// the user's push channel or from a bulk fetch; the merged view zeroes the
/// active conversation and any conversation read after the digest was produced.
use crate::backend::{ChatApi, FeedEvent, FeedSubscription, RealtimeFeed, Teardown};
use crate::cache::LocalCache;
use crate::coalesce::InFlight;
use crate::directory::ConversationDirectory;
use crate::error::Result;
use crate::model::{ConversationId, EngineEvent, NotificationDigest, UserId};
use crate::session::SessionIdentity;
use crate::utils::{within, EventEmitter};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Number of digests received
    Fetched(usize),
    /// Last successful fetch is still within the cooldown
    Skipped,
}

#[derive(Default)]
struct DigestState {
    raw: HashMap<ConversationId, NotificationDigest>,
    read_since: HashMap<ConversationId, DateTime<Utc>>,
    exempt: Option<ConversationId>,
    merged: HashMap<ConversationId, u32>,
    total: u32,
}

impl DigestState {
    fn merged_count(&self, digest: &NotificationDigest) -> u32 {
        if self.exempt.as_deref() == Some(digest.conversation_id.as_str()) {
            return 0;
        }
        match self.read_since.get(&digest.conversation_id) {
            Some(read_at) if *read_at >= digest.updated_at => 0,
            _ => digest.unread,
        }
    }

    fn recompute(&mut self) {
        let merged: HashMap<ConversationId, u32> = self
            .raw
            .values()
            .map(|d| (d.conversation_id.clone(), self.merged_count(d)))
            .collect();
        self.total = merged.values().sum();
        self.merged = merged;
    }
}

struct DigestFeed {
    teardown: Option<Teardown>,
    pump: JoinHandle<()>,
}

pub struct DigestAggregator {
    api: Arc<dyn ChatApi>,
    feed: Arc<dyn RealtimeFeed>,
    cache: LocalCache,
    session: SessionIdentity,
    directory: Arc<ConversationDirectory>,
    events: EventEmitter,
    cooldown: Duration,
    state: RwLock<DigestState>,
    /// Held while a merged view is pushed into the directory
    publish: Mutex<()>,
    /// Stamped by the shared fetch itself, before joiners are released
    last_fetch: Arc<RwLock<Option<DateTime<Utc>>>>,
    /// `None` when the shared call found the cooldown still running
    fetches: InFlight<UserId, Result<Option<Vec<NotificationDigest>>>>,
    subscription: Mutex<Option<DigestFeed>>,
}

impl DigestAggregator {
    pub fn new(
        api: Arc<dyn ChatApi>,
        feed: Arc<dyn RealtimeFeed>,
        cache: LocalCache,
        session: SessionIdentity,
        directory: Arc<ConversationDirectory>,
        events: EventEmitter,
        cooldown: Duration,
    ) -> Self {
        Self {
            api,
            feed,
            cache,
            session,
            directory,
            events,
            cooldown,
            state: RwLock::new(DigestState::default()),
            publish: Mutex::new(()),
            last_fetch: Arc::new(RwLock::new(None)),
            fetches: InFlight::new(),
            subscription: Mutex::new(None),
        }
    }

    fn digest_key(&self) -> String {
        format!("digest:{}", self.session.user_id)
    }

    fn fetched_at_key(&self) -> String {
        format!("digest_fetched_at:{}", self.session.user_id)
    }

    /// Restore cached digests and open the per-user push channel
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            debug!("Digest aggregator already initialized");
            return Ok(());
        }

        let cached: Option<Vec<NotificationDigest>> = self.cache.get(&self.digest_key())?;
        let fetched_at: Option<DateTime<Utc>> = self.cache.get(&self.fetched_at_key())?;
        *self.last_fetch.write().await = fetched_at;
        {
            let mut state = self.state.write().await;
            if let Some(cached) = &cached {
                if state.raw.is_empty() {
                    state.raw = cached
                        .iter()
                        .map(|d| (d.conversation_id.clone(), d.clone()))
                        .collect();
                }
            }
        }
        if let Some(cached) = cached {
            info!("Restored {} cached digests", cached.len());
            self.publish_merged().await;
        }

        let FeedSubscription { events, teardown } = self.feed.subscribe_digest(&self.session.user_id)?;
        let pump = tokio::spawn(pump_digests(
            Arc::downgrade(self),
            events,
            self.events.clone(),
            self.session.user_id.clone(),
        ));
        *subscription = Some(DigestFeed {
            teardown: Some(teardown),
            pump,
        });
        info!("Subscribed to notification digests for {}", self.session.user_id);
        Ok(())
    }

    /// Replace the raw digest set with a complete push
    pub async fn apply_push(&self, digests: Vec<NotificationDigest>) {
        debug!("Applying {} digests", digests.len());
        {
            let mut state = self.state.write().await;
            state.raw = digests
                .iter()
                .map(|d| (d.conversation_id.clone(), d.clone()))
                .collect();
        }
        if let Err(e) = self.cache.put(&self.digest_key(), &digests) {
            warn!("Failed to cache digests: {}", e);
        }
        self.publish_merged().await;
    }

    /// Zero the conversation locally, then tell the server
    ///
    /// Digests produced before this moment can no longer raise the count.
    pub async fn mark_conversation_read(&self, conversation_id: &str) -> Result<()> {
        {
            let mut state = self.state.write().await;
            state
                .read_since
                .insert(conversation_id.to_string(), Utc::now());
        }
        self.publish_merged().await;

        self.api
            .mark_conversation_read(&self.session.user_id, conversation_id)
            .await
            .map_err(|e| {
                warn!("Mark read for {} failed: {}", conversation_id, e);
                e
            })
    }

    /// Bulk fetch, rate limited by the cooldown and coalesced while in flight
    pub async fn fetch_all(&self) -> Result<FetchOutcome> {
        let result = self
            .fetches
            .run(self.session.user_id.clone(), || self.fetch_call())
            .await;

        match result {
            Ok(Some(digests)) => {
                let count = digests.len();
                self.apply_push(digests).await;
                Ok(FetchOutcome::Fetched(count))
            }
            Ok(None) => {
                debug!("Digest fetch skipped: within cooldown");
                Ok(FetchOutcome::Skipped)
            }
            Err(e) => {
                warn!("Digest fetch failed: {}", e);
                self.restore_cached().await;
                Err(e)
            }
        }
    }

    /// The request shared by concurrent `fetch_all` callers
    ///
    /// Checks the cooldown and records a successful fetch under one write lock,
    /// so a caller arriving after the shared call ends sees the new stamp.
    fn fetch_call(
        &self,
    ) -> impl Future<Output = Result<Option<Vec<NotificationDigest>>>> + Send + 'static {
        let api = self.api.clone();
        let user_id = self.session.user_id.clone();
        let last_fetch = self.last_fetch.clone();
        let cooldown = self.cooldown;
        let cache = self.cache.clone();
        let fetched_at_key = self.fetched_at_key();

        async move {
            let mut last_fetch = last_fetch.write().await;
            if matches!(*last_fetch, Some(at) if within(at, cooldown)) {
                return Ok(None);
            }
            let digests = api.fetch_notifications(&user_id).await?;
            let now = Utc::now();
            *last_fetch = Some(now);
            if let Err(e) = cache.put(&fetched_at_key, &now) {
                warn!("Failed to cache digest fetch time: {}", e);
            }
            Ok(Some(digests))
        }
    }

    /// Fall back to cached digests when nothing live has arrived yet
    async fn restore_cached(&self) {
        let cached: Option<Vec<NotificationDigest>> = match self.cache.get(&self.digest_key()) {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Digest cache unreadable: {}", e);
                None
            }
        };
        let Some(cached) = cached else {
            return;
        };
        let restored = {
            let mut state = self.state.write().await;
            if state.raw.is_empty() {
                state.raw = cached
                    .into_iter()
                    .map(|d| (d.conversation_id.clone(), d))
                    .collect();
                true
            } else {
                false
            }
        };
        if restored {
            info!("Showing cached digests after a failed fetch");
            self.publish_merged().await;
        }
    }

    /// Suppress unread counts for the conversation being viewed
    pub async fn set_exempt(&self, conversation_id: &str) {
        self.state.write().await.exempt = Some(conversation_id.to_string());
        self.publish_merged().await;
    }

    /// Lift the exemption; everything delivered while it was viewed counts as seen
    pub async fn clear_exempt(&self, conversation_id: &str) {
        let changed = {
            let mut state = self.state.write().await;
            if state.exempt.as_deref() == Some(conversation_id) {
                state
                    .read_since
                    .insert(conversation_id.to_string(), Utc::now());
                state.exempt = None;
                true
            } else {
                false
            }
        };
        if changed {
            self.publish_merged().await;
        }
    }

    pub async fn unread(&self, conversation_id: &str) -> u32 {
        self.state
            .read()
            .await
            .merged
            .get(conversation_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn total_unread(&self) -> u32 {
        self.state.read().await.total
    }

    /// Recompute the merged view and push it into the directory
    async fn publish_merged(&self) {
        let _publishing = self.publish.lock().await;
        let (merged, total) = {
            let mut state = self.state.write().await;
            state.recompute();
            (state.merged.clone(), state.total)
        };
        self.directory.apply_unread(&merged).await;
        self.events.emit(EngineEvent::UnreadChanged { total });
    }

    /// Close the push channel and forget everything (session end)
    pub async fn reset(&self) {
        if let Some(mut feed) = self.subscription.lock().await.take() {
            if let Some(teardown) = feed.teardown.take() {
                teardown();
            }
            feed.pump.abort();
        }
        *self.state.write().await = DigestState::default();
        *self.last_fetch.write().await = None;
        for key in [self.digest_key(), self.fetched_at_key()] {
            if let Err(e) = self.cache.remove(&key) {
                warn!("Failed to clear {}: {}", key, e);
            }
        }
        info!("Digest aggregator reset");
    }
}

async fn pump_digests(
    aggregator: Weak<DigestAggregator>,
    mut events: mpsc::UnboundedReceiver<FeedEvent<NotificationDigest>>,
    emitter: EventEmitter,
    user_id: UserId,
) {
    while let Some(event) = events.recv().await {
        match event {
            FeedEvent::Snapshot(digests) => {
                let Some(aggregator) = aggregator.upgrade() else {
                    return;
                };
                aggregator.apply_push(digests).await;
            }
            FeedEvent::Error(error) => {
                warn!("Digest feed error for {}: {}", user_id, error);
                emitter.emit(EngineEvent::SubscriptionError {
                    key: format!("digest:{}", user_id),
                    error,
                });
            }
        }
    }
    warn!("Digest feed for {} closed", user_id);
    emitter.emit(EngineEvent::SubscriptionError {
        key: format!("digest:{}", user_id),
        error: "feed closed".to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn aggregator(backend: &MemoryBackend, cooldown: Duration) -> DigestAggregator {
        let api: Arc<dyn ChatApi> = Arc::new(backend.clone());
        let cache = LocalCache::temporary().unwrap();
        let session = SessionIdentity::new("me", "Me").unwrap();
        let events = EventEmitter::new(16);
        let directory = Arc::new(ConversationDirectory::new(
            api.clone(),
            cache.clone(),
            session.clone(),
            events.clone(),
        ));
        DigestAggregator::new(
            api,
            Arc::new(backend.clone()),
            cache,
            session,
            directory,
            events,
            cooldown,
        )
    }

    fn digest(conversation_id: &str, unread: u32) -> NotificationDigest {
        NotificationDigest {
            conversation_id: conversation_id.into(),
            unread,
            updated_at: Utc::now() - chrono::Duration::seconds(10),
        }
    }

    #[tokio::test]
    async fn test_fetch_stamped_before_shared_call_resolves() {
        let backend = MemoryBackend::new();
        backend.set_notifications("me", vec![digest("a", 2)]);
        let aggregator = aggregator(&backend, Duration::from_secs(60));

        // The finished call alone closes the cooldown window, before any
        // caller has applied its result
        let digests = aggregator.fetch_call().await.unwrap();
        assert_eq!(digests.map(|d| d.len()), Some(1));
        assert_eq!(aggregator.fetch_all().await.unwrap(), FetchOutcome::Skipped);
        assert_eq!(backend.calls("fetch_notifications"), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_window_open() {
        let backend = MemoryBackend::new();
        backend.fail("fetch_notifications", crate::SyncError::Network("offline".into()));
        let aggregator = aggregator(&backend, Duration::from_secs(60));

        assert!(aggregator.fetch_all().await.is_err());
        backend.recover("fetch_notifications");
        backend.set_notifications("me", vec![digest("a", 2)]);
        assert_eq!(aggregator.fetch_all().await.unwrap(), FetchOutcome::Fetched(1));
        assert_eq!(aggregator.unread("a").await, 2);
        assert_eq!(backend.calls("fetch_notifications"), 2);
    }

    #[test]
    fn test_read_since_guards_older_digest() {
        let now = Utc::now();
        let mut state = DigestState::default();
        state.read_since.insert("a".into(), now);

        let stale = NotificationDigest {
            conversation_id: "a".into(),
            unread: 4,
            updated_at: now - chrono::Duration::seconds(5),
        };
        let fresh = NotificationDigest {
            updated_at: now + chrono::Duration::seconds(5),
            ..stale.clone()
        };
        assert_eq!(state.merged_count(&stale), 0);
        assert_eq!(state.merged_count(&fresh), 4);

        state.exempt = Some("a".into());
        assert_eq!(state.merged_count(&fresh), 0);
    }
}
