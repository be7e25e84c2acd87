/// Session-scoped synchronization engine
///
/// Wires the directory, message store, mutations, live subscriptions, digest
/// aggregation, focus tracking and push tokens for one signed-in user.
use crate::active::ActiveConversationTracker;
use crate::backend::{ChatApi, PushRegistrar, RealtimeFeed};
use crate::cache::LocalCache;
use crate::config::Config;
use crate::digest::{DigestAggregator, FetchOutcome};
use crate::directory::{ConversationDirectory, DirectorySnapshot, LoadReport};
use crate::error::Result;
use crate::message_store::{MessageStore, PageOutcome};
use crate::model::{
    Conversation, EngineEvent, Message, MessageId, PageMeta, PageQuery, Role, UserId,
};
use crate::mutations::MutationEngine;
use crate::push_token::{EnableOutcome, PushTokenManager};
use crate::session::SessionIdentity;
use crate::subscriptions::{SnapshotHandler, SubscriptionHandle, SubscriptionManager};
use crate::utils::EventEmitter;
use futures_util::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

pub struct ChatEngine {
    session: SessionIdentity,
    config: Config,
    events: EventEmitter,
    directory: Arc<ConversationDirectory>,
    store: Arc<MessageStore>,
    mutations: Arc<MutationEngine>,
    subscriptions: SubscriptionManager,
    digest: Arc<DigestAggregator>,
    active: ActiveConversationTracker,
    tokens: PushTokenManager,
    shutdown: Arc<RwLock<bool>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl ChatEngine {
    pub fn new(
        session: SessionIdentity,
        config: Config,
        api: Arc<dyn ChatApi>,
        feed: Arc<dyn RealtimeFeed>,
        registrar: Arc<dyn PushRegistrar>,
    ) -> Result<Self> {
        let cache = match &config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                LocalCache::open(dir)?
            }
            None => LocalCache::temporary()?,
        };
        let events = EventEmitter::new(config.event_capacity);

        let directory = Arc::new(ConversationDirectory::new(
            api.clone(),
            cache.clone(),
            session.clone(),
            events.clone(),
        ));
        let store = Arc::new(MessageStore::new(
            api.clone(),
            session.clone(),
            events.clone(),
            config.page_size,
        ));
        let mutations = Arc::new(MutationEngine::new(
            api.clone(),
            session.clone(),
            store.clone(),
            directory.clone(),
            events.clone(),
            config.reconciliation_retention,
        ));
        let subscriptions = SubscriptionManager::new(feed.clone(), session.clone(), events.clone());
        let digest = Arc::new(DigestAggregator::new(
            api,
            feed.clone(),
            cache.clone(),
            session.clone(),
            directory.clone(),
            events.clone(),
            config.digest_fetch_cooldown,
        ));
        let active = ActiveConversationTracker::new(feed, digest.clone(), session.clone());
        let tokens = PushTokenManager::new(registrar, cache, config.push_token_cooldown);

        info!("Created chat engine for {}", session.user_id);

        Ok(Self {
            session,
            config,
            events,
            directory,
            store,
            mutations,
            subscriptions,
            digest,
            active,
            tokens,
            shutdown: Arc::new(RwLock::new(false)),
            poller: Mutex::new(None),
        })
    }

    pub fn session(&self) -> &SessionIdentity {
        &self.session
    }

    /// Load the directory and unread counts, then start the digest poller
    ///
    /// Fails when neither the conversation list nor the participant list could
    /// be fetched; any cached directory is still installed in that case.
    pub async fn start(&self) -> Result<LoadReport> {
        info!("Starting chat engine for {}", self.session.user_id);

        if let Err(e) = self.tokens.initialize(&self.session.user_id).await {
            warn!("Push token cache unavailable: {}", e);
        }
        if let Err(e) = self.digest.initialize().await {
            error!("Digest subscription failed: {}", e);
        }

        let loaded = self.directory.load().await;
        match &loaded {
            Ok(report) if !report.is_complete() => warn!("Directory loaded partially: {:?}", report),
            Ok(_) => {}
            Err(e) => error!("Directory unavailable, showing cached state: {}", e),
        }

        match self.digest.fetch_all().await {
            Ok(FetchOutcome::Fetched(n)) => debug!("Fetched {} digests", n),
            Ok(FetchOutcome::Skipped) => debug!("Digest fetch within cooldown"),
            Err(e) => warn!("Digest fetch failed, showing cached counts: {}", e),
        }

        self.spawn_poller().await;
        loaded
    }

    async fn spawn_poller(&self) {
        let Some(period) = self.config.digest_poll_interval else {
            return;
        };
        let mut poller = self.poller.lock().await;
        if poller.is_some() {
            return;
        }

        let digest = self.digest.clone();
        let shutdown = self.shutdown.clone();
        *poller = Some(tokio::spawn(async move {
            run_digest_poller(digest, shutdown, period).await
        }));
    }

    // ─── Conversations ───────────────────────────────────────────────────────

    /// Subscribe, load the first page and make the conversation active
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<PageOutcome> {
        info!("Opening conversation {}", conversation_id);
        self.subscriptions
            .subscribe(conversation_id, self.live_handler(conversation_id))
            .await?;

        let page = self
            .store
            .load_page(conversation_id, self.first_page(None))
            .await?;

        if let Err(e) = self.active.set_active(Some(conversation_id)).await {
            warn!("Could not mark {} read: {}", conversation_id, e);
        }
        Ok(page)
    }

    fn live_handler(&self, conversation_id: &str) -> SnapshotHandler {
        let mutations = self.mutations.clone();
        let conversation_id = conversation_id.to_string();
        Arc::new(move |batch| {
            let mutations = mutations.clone();
            let conversation_id = conversation_id.clone();
            async move { mutations.absorb_live(&conversation_id, batch).await }.boxed()
        })
    }

    fn first_page(&self, search: Option<String>) -> PageQuery {
        PageQuery {
            search,
            page_index: 0,
            page_size: self.config.page_size,
        }
    }

    /// Re-subscribe after a feed dropped (returns the existing handle otherwise)
    pub async fn resubscribe(&self, conversation_id: &str) -> Result<SubscriptionHandle> {
        self.subscriptions
            .subscribe(conversation_id, self.live_handler(conversation_id))
            .await
    }

    pub async fn close_conversation(&self, conversation_id: &str) -> Result<()> {
        self.subscriptions.unsubscribe(conversation_id).await;
        if self.active.active().await.as_deref() == Some(conversation_id) {
            self.active.set_active(None).await?;
        }
        Ok(())
    }

    pub async fn load_more(&self, conversation_id: &str) -> Result<Option<PageOutcome>> {
        self.store.load_more(conversation_id).await
    }

    /// Reload the first page filtered by `text` (None clears the filter)
    pub async fn search(&self, conversation_id: &str, text: Option<&str>) -> Result<PageOutcome> {
        let search = text.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string);
        self.store
            .load_page(conversation_id, self.first_page(search))
            .await
    }

    /// Forget everything local about a deleted conversation
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        self.subscriptions.unsubscribe(conversation_id).await;
        if self.active.active().await.as_deref() == Some(conversation_id) {
            self.active.set_active(None).await?;
        }
        self.store.evict(conversation_id).await;
        self.directory.remove_conversation(conversation_id).await;
        info!("Removed conversation {}", conversation_id);
        Ok(())
    }

    pub async fn set_active(&self, conversation_id: Option<&str>) -> Result<()> {
        self.active.set_active(conversation_id).await
    }

    // ─── Reads ───────────────────────────────────────────────────────────────

    pub async fn conversations(&self) -> DirectorySnapshot {
        self.directory.snapshot().await
    }

    pub async fn directory_report(&self) -> Option<LoadReport> {
        self.directory.last_report().await
    }

    pub async fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.directory.conversation(conversation_id).await
    }

    pub async fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.store.messages(conversation_id).await
    }

    pub async fn page_info(&self, conversation_id: &str) -> Option<PageMeta> {
        self.store.meta(conversation_id).await
    }

    pub async fn has_more(&self, conversation_id: &str) -> bool {
        self.store.has_more(conversation_id).await
    }

    pub async fn unread(&self, conversation_id: &str) -> u32 {
        self.digest.unread(conversation_id).await
    }

    pub async fn total_unread(&self) -> u32 {
        self.digest.total_unread().await
    }

    pub async fn active_conversation(&self) -> Option<String> {
        self.active.active().await
    }

    pub async fn is_subscribed(&self, conversation_id: &str) -> bool {
        self.subscriptions.is_subscribed(conversation_id).await
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // ─── Mutations ───────────────────────────────────────────────────────────

    pub async fn send(
        &self,
        conversation_id: &str,
        content: &str,
        mentions: Vec<UserId>,
        parent_id: Option<String>,
    ) -> Result<MessageId> {
        self.mutations
            .send(conversation_id, content, mentions, parent_id)
            .await
    }

    pub async fn retry(&self, conversation_id: &str, temp_id: &MessageId) -> Result<MessageId> {
        self.mutations.retry(conversation_id, temp_id).await
    }

    pub async fn discard(&self, conversation_id: &str, temp_id: &MessageId) -> Result<()> {
        self.mutations.discard(conversation_id, temp_id).await
    }

    pub async fn edit(
        &self,
        conversation_id: &str,
        message_id: &MessageId,
        content: &str,
    ) -> Result<Message> {
        self.mutations.edit(conversation_id, message_id, content).await
    }

    pub async fn delete(&self, conversation_id: &str, message_id: &MessageId) -> Result<()> {
        self.mutations.delete(conversation_id, message_id).await
    }

    pub async fn toggle_reaction(
        &self,
        conversation_id: &str,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<bool> {
        self.mutations
            .toggle_reaction(conversation_id, message_id, emoji)
            .await
    }

    pub async fn add_participant(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.directory.add_participant(conversation_id, user_id).await
    }

    pub async fn remove_participant(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.directory
            .remove_participant(conversation_id, user_id)
            .await
    }

    pub async fn change_role(&self, user_id: &str, role: Role) -> Result<()> {
        self.directory.change_role(user_id, role).await
    }

    pub async fn mark_read(&self, conversation_id: &str) -> Result<()> {
        self.digest.mark_conversation_read(conversation_id).await
    }

    pub async fn refresh_unread(&self) -> Result<FetchOutcome> {
        self.digest.fetch_all().await
    }

    pub async fn enable_notifications(&self) -> EnableOutcome {
        self.tokens.enable(&self.session.user_id).await
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// End the session: close every feed and drop all per-user state
    pub async fn shutdown(&self) {
        {
            let mut shutdown = self.shutdown.write().await;
            if *shutdown {
                warn!("Chat engine already shut down");
                return;
            }
            *shutdown = true;
        }
        info!("Shutting down chat engine for {}", self.session.user_id);

        if let Some(poller) = self.poller.lock().await.take() {
            poller.abort();
        }
        if let Err(e) = self.active.set_active(None).await {
            warn!("Failed to clear active conversation: {}", e);
        }
        let closed = self.subscriptions.teardown_all().await;
        self.digest.reset().await;
        self.tokens.reset().await;
        self.mutations.reset().await;
        self.store.clear().await;
        self.directory.clear().await;

        info!("Chat engine stopped ({} live feeds closed)", closed);
    }
}

async fn run_digest_poller(digest: Arc<DigestAggregator>, shutdown: Arc<RwLock<bool>>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        if *shutdown.read().await {
            break;
        }
        match digest.fetch_all().await {
            Ok(FetchOutcome::Fetched(n)) => debug!("Digest poll fetched {} entries", n),
            Ok(FetchOutcome::Skipped) => {}
            Err(e) => warn!("Digest poll failed: {}", e),
        }
    }
}
